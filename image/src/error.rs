use secstor_core::ScriptError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ImageError {
    #[error("image not found: {0}")]
    NotFound(String),

    #[error("unable to read image header: {0}")]
    InvalidHeader(String),

    #[error("unknown image format {0}")]
    UnknownFormat(String),

    #[error("processing failed: {0}")]
    Processing(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("script error: {0}")]
    Script(#[from] ScriptError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
