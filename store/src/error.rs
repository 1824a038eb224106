use secstor_core::ScriptError;
use secstor_mount::MountError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("transfer failed: {0}")]
    Transfer(String),

    #[error("invalid store configuration: {0}")]
    Configuration(String),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("mount error: {0}")]
    Mount(#[from] MountError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        match self {
            StoreError::NotFound(_) => true,
            StoreError::Io(e) => e.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }
}

impl From<object_store::Error> for StoreError {
    fn from(err: object_store::Error) -> Self {
        match err {
            object_store::Error::NotFound { path, .. } => StoreError::NotFound(path),
            object_store::Error::NotImplemented => {
                StoreError::Unsupported("operation not implemented by object store".to_string())
            }
            other => StoreError::Transfer(other.to_string()),
        }
    }
}

impl From<ScriptError> for StoreError {
    fn from(err: ScriptError) -> Self {
        StoreError::Transfer(err.to_string())
    }
}
