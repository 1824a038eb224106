use crate::error::StoreError;
use crate::{EntryStream, ObjectEntry};
use async_stream::try_stream;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio_stream::Stream;

/// A store that is a local directory, usually the mount point of a share.
#[derive(Debug, Clone)]
pub struct FilesystemBackend {
    root: PathBuf,
}

impl FilesystemBackend {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Absolute path of a store-relative key.
    pub fn path(&self, key: &str) -> PathBuf {
        self.root.join(key.trim_start_matches('/'))
    }

    pub async fn fetch(&self, key: &str, local_dir: &Path) -> Result<PathBuf, StoreError> {
        let src = self.path(key);
        if !fs::try_exists(&src).await? {
            return Err(StoreError::NotFound(format!("{:?}", src)));
        }
        let name = src
            .file_name()
            .ok_or_else(|| StoreError::Configuration(format!("{} names no file", key)))?;
        let dest = local_dir.join(name);

        fs::create_dir_all(local_dir).await?;
        fs::copy(&src, &dest)
            .await
            .map_err(|e| StoreError::Transfer(format!("copy {:?} to {:?}: {}", src, dest, e)))?;
        Ok(dest)
    }

    pub async fn store(&self, local_file: &Path, key: &str) -> Result<(), StoreError> {
        let dest = self.path(key);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::copy(local_file, &dest)
            .await
            .map_err(|e| StoreError::Transfer(format!("copy {:?} to {:?}: {}", local_file, dest, e)))?;
        Ok(())
    }

    pub async fn delete_object(&self, key: &str) -> Result<(), StoreError> {
        let path = self.path(key);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::NotFound(format!("{:?}", path)))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Removes everything under `key` and then the directory itself. A
    /// directory that is already gone counts as deleted.
    pub async fn delete_directory(&self, key: &str) -> Result<bool, StoreError> {
        let dir = self.path(key);
        match fs::remove_dir_all(&dir).await {
            Ok(()) => {
                tracing::debug!("Deleted directory {:?}", dir);
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("Directory {:?} does not exist, nothing to delete", dir);
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Walks every file under `prefix` lazily, one directory read at a time.
    pub fn list(&self, prefix: &str) -> EntryStream<'_> {
        Box::pin(walk(self.root.clone(), self.path(prefix)))
    }
}

fn walk(root: PathBuf, start: PathBuf) -> impl Stream<Item = Result<ObjectEntry, StoreError>> {
    try_stream! {
        let mut pending = vec![start];
        while let Some(dir) = pending.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => Err(StoreError::from(e))?,
            };
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if entry.file_type().await?.is_dir() {
                    pending.push(path);
                    continue;
                }
                let key = path
                    .strip_prefix(&root)
                    .unwrap_or(&path)
                    .to_string_lossy()
                    .to_string();
                let size = entry.metadata().await?.len();
                yield ObjectEntry { key, size: Some(size) };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_store_fetch_and_list() {
        let root = TempDir::new().unwrap();
        let work = TempDir::new().unwrap();
        let backend = FilesystemBackend::new(root.path());

        let local = work.path().join("vol.raw");
        std::fs::write(&local, b"volume bytes").unwrap();
        backend.store(&local, "volumes/2/42/vol.raw").await.unwrap();

        let fetched = backend
            .fetch("volumes/2/42/vol.raw", &work.path().join("out"))
            .await
            .unwrap();
        assert_eq!(std::fs::read(&fetched).unwrap(), b"volume bytes");

        let entries: Vec<ObjectEntry> = backend.list("volumes").try_collect().await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].key, "volumes/2/42/vol.raw");
        assert_eq!(entries[0].size, Some(12));
    }

    #[tokio::test]
    async fn test_fetch_missing() {
        let root = TempDir::new().unwrap();
        let backend = FilesystemBackend::new(root.path());

        let err = backend.fetch("template/tmpl/nope.qcow2", root.path()).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_delete_directory_is_idempotent() {
        let root = TempDir::new().unwrap();
        let backend = FilesystemBackend::new(root.path());
        std::fs::create_dir_all(root.path().join("snapshots/2/9")).unwrap();
        std::fs::write(root.path().join("snapshots/2/9/a.vhd"), b"a").unwrap();

        assert!(backend.delete_directory("snapshots/2/9").await.unwrap());
        assert!(!root.path().join("snapshots/2/9").exists());
        assert!(!backend.delete_directory("snapshots/2/9").await.unwrap());
    }

    #[tokio::test]
    async fn test_list_missing_prefix_is_empty() {
        let root = TempDir::new().unwrap();
        let backend = FilesystemBackend::new(root.path());
        let entries: Vec<ObjectEntry> = backend.list("template/tmpl").try_collect().await.unwrap();
        assert!(entries.is_empty());
    }
}
