//! Swift access through the `swift` command line client. Keys are
//! `container/object`.

use crate::error::StoreError;
use crate::{EntryStream, ObjectEntry, UploadMode};
use async_stream::try_stream;
use secstor_core::{FailurePolicy, Script, ScriptError, SwiftStore};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tokio_stream::Stream;

/// Objects above this size are uploaded as segments of this size.
pub const MAX_OBJECT_SIZE: u64 = 5 * 1024 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct SwiftCli {
    pub program: PathBuf,
    pub timeout: Duration,
}

impl SwiftCli {
    pub fn new(program: impl AsRef<Path>, timeout: Duration) -> Self {
        Self {
            program: program.as_ref().to_path_buf(),
            timeout,
        }
    }
}

pub fn split_key(key: &str) -> (&str, Option<&str>) {
    match key.trim_start_matches('/').split_once('/') {
        Some((container, object)) if !object.is_empty() => (container, Some(object)),
        Some((container, _)) => (container, None),
        None => (key.trim_start_matches('/'), None),
    }
}

fn is_missing(err: &ScriptError) -> bool {
    match err {
        ScriptError::Failed { output, .. } | ScriptError::Diagnostic { output, .. } => {
            output.contains("404") || output.contains("Not Found")
        }
        _ => false,
    }
}

pub struct SwiftBackend {
    config: SwiftStore,
    cli: SwiftCli,
}

impl SwiftBackend {
    pub fn new(config: SwiftStore, cli: SwiftCli) -> Self {
        Self { config, cli }
    }

    pub fn account(&self) -> &str {
        &self.config.account
    }

    fn command(&self) -> Script {
        Script::new(&self.cli.program, self.cli.timeout)
            .opt("-A", &self.config.url)
            .opt("-U", format!("{}:{}", self.config.account, self.config.user_name))
            .opt("-K", &self.config.key)
    }

    pub async fn fetch(&self, key: &str, local_dir: &Path) -> Result<PathBuf, StoreError> {
        let (container, object) = split_key(key);
        let object =
            object.ok_or_else(|| StoreError::Configuration(format!("{} names no object", key)))?;
        let name = object.rsplit('/').next().unwrap_or(object);

        fs::create_dir_all(local_dir).await?;
        let dest = local_dir.join(name);

        let result = self
            .command()
            .arg("download")
            .arg(container)
            .arg(object)
            .opt("-o", dest.as_os_str())
            .policy(FailurePolicy::ExitStatusAndMarkers)
            .execute()
            .await;
        match result {
            Ok(_) => {}
            Err(e) if is_missing(&e) => return Err(StoreError::NotFound(key.to_string())),
            Err(e) => {
                return Err(StoreError::Transfer(format!(
                    "swift download of {} failed: {}",
                    key, e
                )));
            }
        }

        if !fs::try_exists(&dest).await? {
            return Err(StoreError::NotFound(key.to_string()));
        }
        Ok(dest)
    }

    /// Uploads `local_file` into `container`, named `object_name` or the file
    /// name. Returns the new `container/object` key.
    pub async fn store(
        &self,
        local_file: &Path,
        container: &str,
        object_name: Option<&str>,
    ) -> Result<(String, UploadMode), StoreError> {
        let size = fs::metadata(local_file).await?.len();
        let dir = local_file.parent().unwrap_or(Path::new("."));
        let file_name = local_file
            .file_name()
            .ok_or_else(|| StoreError::Configuration(format!("{:?} names no file", local_file)))?;
        let object = object_name
            .map(str::to_string)
            .unwrap_or_else(|| file_name.to_string_lossy().to_string());

        let mut script = self.command().current_dir(dir).arg("upload");
        let mode = if size > MAX_OBJECT_SIZE {
            script = script.opt("-S", MAX_OBJECT_SIZE.to_string());
            UploadMode::Segmented
        } else {
            UploadMode::Single
        };
        script = script
            .arg(container)
            .arg(file_name)
            .opt("--object-name", &object);

        script
            .policy(FailurePolicy::ExitStatusAndMarkers)
            .execute()
            .await
            .map_err(|e| StoreError::Transfer(format!("swift upload failed: {}", e)))?;

        tracing::info!("Uploaded {:?} to swift {}/{}", local_file, container, object);
        Ok((format!("{}/{}", container, object), mode))
    }

    /// Deleting something that is already gone succeeds.
    pub async fn delete_object(&self, container: &str, object: &str) -> Result<(), StoreError> {
        let script = self.command().arg("delete").arg(container).arg(object);
        self.delete(script, &format!("{}/{}", container, object)).await
    }

    /// Removes the container and everything in it.
    pub async fn delete_container(&self, container: &str) -> Result<(), StoreError> {
        let script = self.command().arg("delete").arg(container);
        self.delete(script, container).await
    }

    async fn delete(&self, script: Script, target: &str) -> Result<(), StoreError> {
        match script
            .policy(FailurePolicy::ExitStatusAndMarkers)
            .execute()
            .await
        {
            Ok(_) => {
                tracing::debug!("Deleted swift {}", target);
                Ok(())
            }
            Err(e) if is_missing(&e) => {
                tracing::debug!("Swift {} does not exist, nothing to delete", target);
                Ok(())
            }
            Err(e) => Err(StoreError::Transfer(format!(
                "swift delete of {} failed: {}",
                target, e
            ))),
        }
    }

    /// Container names for an empty key, otherwise the objects of the
    /// container named by the key, filtered by the rest of the key.
    pub async fn list_names(&self, key: &str) -> Result<Vec<String>, StoreError> {
        let (container, prefix) = split_key(key);
        let mut script = self.command().arg("list");
        if !container.is_empty() {
            script = script.arg(container);
        }
        if let Some(prefix) = prefix {
            script = script.opt("--prefix", prefix);
        }

        let output = script
            .execute()
            .await
            .map_err(|e| StoreError::Transfer(format!("swift list failed: {}", e)))?;
        Ok(output.lines().map(|l| l.trim().to_string()).collect())
    }

    pub fn list(&self, key: &str) -> EntryStream<'_> {
        Box::pin(self.entries(key.to_string()))
    }

    fn entries(&self, key: String) -> impl Stream<Item = Result<ObjectEntry, StoreError>> + '_ {
        try_stream! {
            let (container, _) = split_key(&key);
            let container = container.to_string();
            for name in self.list_names(&key).await? {
                let key = if container.is_empty() {
                    name
                } else {
                    format!("{}/{}", container, name)
                };
                yield ObjectEntry { key, size: None };
            }
        }
    }
}
