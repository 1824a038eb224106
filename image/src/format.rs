use secstor_core::ImageFormat;
use std::path::Path;

/// Format of an artifact judged by its extension alone. Unrecognised or
/// missing extensions yield `None`, which callers treat as a raw byte blob.
pub fn detect(path: impl AsRef<Path>) -> Option<ImageFormat> {
    let ext = path.as_ref().extension()?.to_str()?.to_ascii_lowercase();
    from_extension(&ext)
}

pub fn from_extension(ext: &str) -> Option<ImageFormat> {
    match ext.to_ascii_lowercase().as_str() {
        "vhd" => Some(ImageFormat::Vhd),
        "vhdx" => Some(ImageFormat::Vhdx),
        "qcow2" => Some(ImageFormat::Qcow2),
        "ova" => Some(ImageFormat::Ova),
        "tar" => Some(ImageFormat::Tar),
        "img" | "raw" => Some(ImageFormat::Raw),
        "vmdk" => Some(ImageFormat::Vmdk),
        "vdi" => Some(ImageFormat::Vdi),
        _ => None,
    }
}
