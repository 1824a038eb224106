use crate::SecondaryStorage;
use crate::error::AgentError;
use secstor_core::{DataObject, DataStore, DeleteCommand, ObjectKind};
use secstor_image::{TEMPLATE_PROPERTIES, VOLUME_PROPERTIES};
use secstor_store::swift::split_key;
use secstor_store::{Backend, FilesystemBackend};
use tokio::fs;

/// Health-check scratch directory some hypervisors leave inside an artifact
/// folder.
const KVM_HA_DIR: &str = "KVMHA";

impl SecondaryStorage {
    /// Deletes one template, volume or snapshot. Anything already gone counts
    /// as deleted. Returns the message for the answer.
    pub async fn delete(&self, cmd: &DeleteCommand) -> Result<String, AgentError> {
        let data = &cmd.data;
        let Some(path) = data.path.as_deref().filter(|p| !p.is_empty()) else {
            return Ok(
                "Object with null install path does not exist on image store , no need to delete"
                    .to_string(),
            );
        };

        match self.backends.resolve(&cmd.store).await? {
            Backend::Filesystem(local) => {
                if data.is_snapshot() {
                    delete_filesystem_snapshot(&local, path).await
                } else {
                    delete_filesystem_artifact(&local, data, path).await
                }
            }
            Backend::S3(s3) => {
                if data.is_snapshot() {
                    s3.delete_object(path).await?;
                    Ok(format!("Deleted snapshot {} from bucket {}.", path, s3.bucket()))
                } else {
                    let count = s3.delete_prefix(path).await?;
                    tracing::debug!("Removed {} objects for {} {}", count, data.kind, path);
                    Ok(format!("Deleted {} {} from bucket {}.", data.kind, path, s3.bucket()))
                }
            }
            Backend::Swift(swift) => match &data.kind {
                ObjectKind::Template => {
                    let container = format!("T-{}", data.id);
                    swift.delete_container(&container).await?;
                    Ok(format!("Deleted template {} from swift", container))
                }
                ObjectKind::Volume => {
                    let container = format!("V-{}", data.id);
                    let object = path.rsplit('/').next().unwrap_or(path);
                    swift.delete_object(&container, object).await?;
                    Ok(format!("Deleted volume {} from swift", path))
                }
                ObjectKind::Snapshot { .. } => {
                    match split_key(path) {
                        (container, Some(object)) => swift.delete_object(container, object).await?,
                        (container, None) => swift.delete_container(container).await?,
                    }
                    Ok(format!("Deleted snapshot {} from swift", path))
                }
            },
        }
    }

    /// Removes a whole snapshot directory: every file in it and the directory
    /// on a filesystem, the prefix on S3, the volume's container on Swift.
    pub async fn delete_snapshots_dir(
        &self,
        store: &DataStore,
        directory: &str,
    ) -> Result<String, AgentError> {
        let directory = directory.trim_end_matches('/');
        if directory.is_empty() {
            return Err(AgentError::Configuration(
                "Refusing to delete the root of the store".to_string(),
            ));
        }

        match self.backends.resolve(store).await? {
            Backend::Filesystem(local) => {
                if local.delete_directory(directory).await? {
                    Ok(format!("Deleted snapshot directory {}", directory))
                } else {
                    Ok(format!(
                        "Snapshot directory {} doesn't exist, no need to delete",
                        directory
                    ))
                }
            }
            Backend::S3(s3) => {
                let count = s3.delete_prefix(directory).await?;
                Ok(format!(
                    "Deleted {} snapshot objects under {} from bucket {}.",
                    count,
                    directory,
                    s3.bucket()
                ))
            }
            Backend::Swift(swift) => {
                let volume = directory.rsplit('/').next().unwrap_or(directory);
                swift.delete_container(&format!("V-{}", volume)).await?;
                Ok(format!("Deleted snapshot {} from swift", directory))
            }
        }
    }
}

/// The unit of deletion is the artifact's directory: the recorded path when
/// it is one, its parent otherwise.
async fn delete_filesystem_artifact(
    store: &FilesystemBackend,
    data: &DataObject,
    path: &str,
) -> Result<String, AgentError> {
    let path = path.trim_end_matches('/');
    let dir = if is_dir(&store.path(path)).await {
        path
    } else {
        path.rsplit_once('/').map_or("", |(parent, _)| parent)
    };
    if dir.is_empty() {
        return Err(AgentError::Configuration(format!(
            "{} path {} has no parent directory to delete",
            data.kind, path
        )));
    }

    let local_dir = store.path(dir);
    if !fs::try_exists(&local_dir).await? {
        return Ok(format!(
            "{} parent directory {} doesn't exist, no need to delete",
            data.kind, dir
        ));
    }

    let ha_dir = local_dir.join(KVM_HA_DIR);
    if is_dir(&ha_dir).await {
        tracing::debug!("Purging {:?}", ha_dir);
        fs::remove_dir_all(&ha_dir).await?;
    }

    let sidecar = if data.is_template() {
        TEMPLATE_PROPERTIES
    } else {
        VOLUME_PROPERTIES
    };
    if !fs::try_exists(local_dir.join(sidecar)).await? {
        tracing::warn!("No {} in {:?}, deleting it anyway", sidecar, local_dir);
    }

    store.delete_directory(dir).await?;
    tracing::info!(kind = %data.kind, dir, "Deleted artifact directory");
    Ok(format!("Deleted {} directory {}", data.kind, dir))
}

/// Snapshot directories can hold siblings, so only files carrying the
/// snapshot's name go.
async fn delete_filesystem_snapshot(
    store: &FilesystemBackend,
    path: &str,
) -> Result<String, AgentError> {
    let path = path.trim_end_matches('/');
    if is_dir(&store.path(path)).await {
        return Ok(format!(
            "Snapshot {} is a directory, it was already removed by backup",
            path
        ));
    }

    let (dir, name) = path.rsplit_once('/').unwrap_or(("", path));
    let local_dir = store.path(dir);
    if !fs::try_exists(&local_dir).await? {
        return Ok(format!(
            "Snapshot directory {} doesn't exist, no need to delete",
            dir
        ));
    }

    let mut removed = 0;
    let mut entries = fs::read_dir(&local_dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        if !entry.file_type().await?.is_file() {
            continue;
        }
        if entry.file_name().to_string_lossy().contains(name) {
            fs::remove_file(entry.path()).await?;
            removed += 1;
        }
    }

    tracing::info!(snapshot = path, removed, "Deleted snapshot files");
    Ok(format!("Deleted {} files of snapshot {}", removed, path))
}

async fn is_dir(path: &std::path::Path) -> bool {
    fs::metadata(path).await.is_ok_and(|m| m.is_dir())
}
