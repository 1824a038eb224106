use crate::error::StoreError;
use crate::filesystem::FilesystemBackend;
use crate::s3::{self, S3Backend};
use crate::swift::{self, SwiftBackend, SwiftCli};
use crate::{EntryStream, UploadMode};
use object_store::ObjectStore;
use secstor_core::DataStore;
use secstor_mount::MountManager;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// One resolved store. The set of backends is closed; every operation
/// matches on it.
pub enum Backend {
    Filesystem(FilesystemBackend),
    S3(S3Backend),
    Swift(SwiftBackend),
}

impl Backend {
    /// Local root for a filesystem store; the bucket or account for object
    /// stores.
    pub fn root(&self) -> String {
        match self {
            Backend::Filesystem(fs) => fs.root().to_string_lossy().to_string(),
            Backend::S3(s3) => s3.bucket().to_string(),
            Backend::Swift(swift) => swift.account().to_string(),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Backend::Filesystem(_) => "nfs",
            Backend::S3(_) => "s3",
            Backend::Swift(_) => "swift",
        }
    }

    pub async fn fetch(&self, key: &str, local_dir: &Path) -> Result<PathBuf, StoreError> {
        match self {
            Backend::Filesystem(fs) => fs.fetch(key, local_dir).await,
            Backend::S3(s3) => s3.fetch(key, local_dir).await,
            Backend::Swift(swift) => swift.fetch(key, local_dir).await,
        }
    }

    pub async fn store(&self, local_file: &Path, key: &str) -> Result<UploadMode, StoreError> {
        match self {
            Backend::Filesystem(fs) => {
                fs.store(local_file, key).await?;
                Ok(UploadMode::Local)
            }
            Backend::S3(s3) => s3.store(local_file, key).await,
            Backend::Swift(swift) => {
                let (container, object) = swift::split_key(key);
                let (_, mode) = swift.store(local_file, container, object).await?;
                Ok(mode)
            }
        }
    }

    pub async fn delete_object(&self, key: &str) -> Result<(), StoreError> {
        match self {
            Backend::Filesystem(fs) => fs.delete_object(key).await,
            Backend::S3(s3) => s3.delete_object(key).await,
            Backend::Swift(swift) => match swift::split_key(key) {
                (container, Some(object)) => swift.delete_object(container, object).await,
                (_, None) => Err(StoreError::Configuration(format!(
                    "{} names a container, not an object",
                    key
                ))),
            },
        }
    }

    /// Filesystem: recursive removal. S3: prefix delete. Swift: the whole
    /// container named by the first key segment.
    pub async fn delete_directory(&self, key: &str) -> Result<(), StoreError> {
        match self {
            Backend::Filesystem(fs) => fs.delete_directory(key).await.map(|_| ()),
            Backend::S3(s3) => s3.delete_prefix(key).await.map(|_| ()),
            Backend::Swift(swift) => {
                let (container, _) = swift::split_key(key);
                swift.delete_container(container).await
            }
        }
    }

    pub fn list(&self, prefix: &str) -> EntryStream<'_> {
        match self {
            Backend::Filesystem(fs) => fs.list(prefix),
            Backend::S3(s3) => s3.list(prefix),
            Backend::Swift(swift) => swift.list(prefix),
        }
    }
}

/// Turns store descriptors into backends, mounting filesystem stores on the way.
pub struct Backends {
    mounts: Arc<MountManager>,
    swift: SwiftCli,
    s3_client: Option<Arc<dyn ObjectStore>>,
}

impl Backends {
    pub fn new(mounts: Arc<MountManager>, swift: SwiftCli) -> Self {
        Self {
            mounts,
            swift,
            s3_client: None,
        }
    }

    /// Serve every S3 descriptor from `client` instead of a client built
    /// from the descriptor's credentials.
    pub fn with_s3_client(mut self, client: Arc<dyn ObjectStore>) -> Self {
        self.s3_client = Some(client);
        self
    }

    pub fn mounts(&self) -> &MountManager {
        &self.mounts
    }

    pub async fn resolve(&self, store: &DataStore) -> Result<Backend, StoreError> {
        match store {
            DataStore::Nfs(nfs) => {
                let root = self.mounts.root_dir(&nfs.url).await?;
                Ok(Backend::Filesystem(FilesystemBackend::new(root)))
            }
            DataStore::S3(config) => {
                let client = match &self.s3_client {
                    Some(client) => client.clone(),
                    None => s3::client(config)?,
                };
                Ok(Backend::S3(S3Backend::new(config.clone(), client)))
            }
            DataStore::Swift(config) => Ok(Backend::Swift(SwiftBackend::new(
                config.clone(),
                self.swift.clone(),
            ))),
        }
    }
}
