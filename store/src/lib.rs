mod backend;
mod error;
pub mod filesystem;
pub mod s3;
pub mod swift;

pub use backend::{Backend, Backends};
pub use error::StoreError;
pub use filesystem::FilesystemBackend;
pub use s3::S3Backend;
pub use swift::{SwiftBackend, SwiftCli};

use std::pin::Pin;
use tokio_stream::Stream;

pub type EntryStream<'a> = Pin<Box<dyn Stream<Item = Result<ObjectEntry, StoreError>> + Send + 'a>>;

/// One object or file found by a listing. Keys are relative to the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectEntry {
    pub key: String,
    pub size: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadMode {
    /// Copied onto a filesystem store.
    Local,
    Single,
    Multipart,
    /// Uploaded as fixed-size segments plus a manifest.
    Segmented,
}
