use thiserror::Error;

#[derive(Error, Debug)]
pub enum MountError {
    #[error("mount failed: {0}")]
    MountFailed(String),

    #[error("unmount failed: {0}")]
    UnmountFailed(String),

    #[error("invalid mount specification: {0}")]
    InvalidSpec(String),

    #[error("unable to resolve host {host}: {reason}")]
    HostResolution { host: String, reason: String },

    #[error("unable to create local folder {0}")]
    LocalPath(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl MountError {
    /// Errors raised before any mount tool was invoked because the share
    /// description itself is unusable.
    pub fn is_configuration(&self) -> bool {
        matches!(self, MountError::InvalidSpec(_))
    }
}
