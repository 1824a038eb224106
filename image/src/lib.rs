mod error;
pub mod format;
mod processor;
mod properties;
mod scripts;

pub use error::ImageError;
pub use processor::{FormatInfo, Processor, virtual_size_or_len};
pub use properties::{Properties, TEMPLATE_PROPERTIES, VOLUME_PROPERTIES};
pub use scripts::{
    CREATE_TEMPLATE_SCRIPT, CREATE_VOLUME_SCRIPT, InstallKind, Installed, Scripts,
    XEN_SNAPSHOT_SCRIPT, install_timeout, xen_snapshot_file_name,
};
