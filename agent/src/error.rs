use secstor_core::ScriptError;
use secstor_image::ImageError;
use secstor_mount::MountError;
use secstor_store::StoreError;
use thiserror::Error;

/// Failure of one command. Each variant is one kind the caller can act on;
/// the message is what ends up in the negative answer.
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Transfer(String),

    #[error("{0}")]
    Mount(String),

    #[error("{0}")]
    Processing(String),

    #[error("{0}")]
    Configuration(String),

    #[error("{0}")]
    Unsupported(String),
}

impl AgentError {
    pub fn is_unsupported(&self) -> bool {
        matches!(self, AgentError::Unsupported(_))
    }
}

impl From<std::io::Error> for AgentError {
    fn from(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::NotFound {
            AgentError::NotFound(err.to_string())
        } else {
            AgentError::Transfer(err.to_string())
        }
    }
}

impl From<MountError> for AgentError {
    fn from(err: MountError) -> Self {
        if err.is_configuration() {
            AgentError::Configuration(err.to_string())
        } else {
            AgentError::Mount(err.to_string())
        }
    }
}

impl From<StoreError> for AgentError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(msg) => AgentError::NotFound(msg),
            StoreError::Transfer(msg) => AgentError::Transfer(msg),
            StoreError::Configuration(msg) => AgentError::Configuration(msg),
            StoreError::Unsupported(msg) => AgentError::Unsupported(msg),
            StoreError::Mount(e) => e.into(),
            StoreError::Io(e) => e.into(),
        }
    }
}

impl From<ImageError> for AgentError {
    fn from(err: ImageError) -> Self {
        match err {
            ImageError::NotFound(msg) => AgentError::NotFound(msg),
            ImageError::Configuration(msg) => AgentError::Configuration(msg),
            ImageError::Io(e) => e.into(),
            other => AgentError::Processing(other.to_string()),
        }
    }
}

impl From<ScriptError> for AgentError {
    fn from(err: ScriptError) -> Self {
        AgentError::Processing(err.to_string())
    }
}
