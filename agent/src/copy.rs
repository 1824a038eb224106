use crate::error::AgentError;
use crate::{SecondaryStorage, join_key};
use secstor_core::{
    CopyCommand, DataObject, DataStore, DataStoreRole, DeleteCommand, HypervisorType, ImageFormat,
    ObjectKind,
};
use secstor_image::{
    InstallKind, Processor, Properties, TEMPLATE_PROPERTIES, VOLUME_PROPERTIES, format,
    virtual_size_or_len, xen_snapshot_file_name,
};
use secstor_store::{Backend, SwiftBackend};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;

/// Suffixes tried, in order, when a cached artifact is recorded without one.
const CACHE_PROBE_EXTENSIONS: &[&str] = &["qcow2", "vhd", "ova", "vmdk"];

impl SecondaryStorage {
    /// Runs the first transfer strategy that matches the source and
    /// destination, returning a description of the new artifact.
    pub async fn copy(&self, cmd: &CopyCommand) -> Result<DataObject, AgentError> {
        if let ObjectKind::Snapshot {
            hypervisor,
            volume_format,
        } = &cmd.src.kind
            && cmd.dest.is_template()
        {
            return self
                .snapshot_to_template(cmd, *hypervisor, *volume_format)
                .await;
        }

        if let DataStore::Nfs(nfs) = &cmd.dest_store
            && nfs.role == DataStoreRole::ImageCache
            && cmd.src_store.is_object_store()
        {
            return self.pull_to_cache(cmd, &nfs.url).await;
        }

        if let DataStore::Nfs(nfs) = &cmd.src_store
            && nfs.role == DataStoreRole::ImageCache
            && cmd.dest_store.role() == DataStoreRole::Image
        {
            return self.push_from_cache(cmd, &nfs.url).await;
        }

        Err(AgentError::Unsupported(format!(
            "Unsupported copy of {} from {} to {} on {}",
            cmd.src.kind, cmd.src_store, cmd.dest.kind, cmd.dest_store
        )))
    }

    async fn snapshot_to_template(
        &self,
        cmd: &CopyCommand,
        hypervisor: HypervisorType,
        volume_format: Option<ImageFormat>,
    ) -> Result<DataObject, AgentError> {
        let DataStore::Nfs(src_nfs) = &cmd.src_store else {
            return Err(AgentError::Unsupported(format!(
                "Snapshots can only be converted from a filesystem store, not {}",
                cmd.src_store
            )));
        };
        let src_root = self.mounts.root_dir(&src_nfs.url).await?;

        if let DataStore::Nfs(dest_nfs) = &cmd.dest_store {
            let dest_root = self.mounts.root_dir(&dest_nfs.url).await?;
            return self
                .convert_snapshot(cmd, hypervisor, volume_format, &src_root, &dest_root)
                .await;
        }

        // Object store destination: convert next to the snapshot, push, then
        // drop the staging copy whatever the push did.
        let target = self.backends.resolve(&cmd.dest_store).await?;
        let staged = self
            .convert_snapshot(cmd, hypervisor, volume_format, &src_root, &src_root)
            .await?;
        let local = src_root.join(staged.path_str());

        let pushed = match &target {
            Backend::Swift(swift) => self.push_template_to_swift(swift, &local, &staged).await,
            backend => self.push_object(backend, &local, &cmd.dest).await,
        };

        let cleanup = DeleteCommand {
            data: DataObject::template().with_path(staged.path_str()),
            store: cmd.src_store.clone(),
        };
        if let Err(e) = self.delete(&cleanup).await {
            tracing::warn!("Failed to remove staging copy {}: {}", staged.path_str(), e);
        }

        pushed
    }

    /// Converts the snapshot into a template under `dest_root/<dest path>`
    /// and writes its sidecar. Returned paths are relative to `dest_root`.
    async fn convert_snapshot(
        &self,
        cmd: &CopyCommand,
        hypervisor: HypervisorType,
        volume_format: Option<ImageFormat>,
        src_root: &Path,
        dest_root: &Path,
    ) -> Result<DataObject, AgentError> {
        let src_path = cmd.src.path_str();
        let (src_dir, snapshot_name) = src_path
            .trim_end_matches('/')
            .rsplit_once('/')
            .unwrap_or(("", src_path));
        let dest_path = cmd.dest.path_str().trim_end_matches('/');
        let dest_dir = dest_root.join(dest_path);
        fs::create_dir_all(&dest_dir).await?;

        match hypervisor {
            HypervisorType::Kvm => {
                let format = volume_format.unwrap_or(ImageFormat::Qcow2);
                let processor = match format {
                    ImageFormat::Qcow2 => Processor::Qcow2,
                    ImageFormat::Raw => Processor::Raw,
                    other => {
                        return Err(AgentError::Configuration(format!(
                            "KVM snapshot {} has unsupported format {}",
                            src_path, other
                        )));
                    }
                };

                let src_file = src_root.join(src_path);
                if !fs::try_exists(&src_file).await? {
                    return Err(AgentError::NotFound(format!(
                        "Snapshot file {:?} does not exist",
                        src_file
                    )));
                }
                let file_name = format!("{}.{}", snapshot_name, format.file_extension());
                fs::copy(&src_file, dest_dir.join(&file_name))
                    .await
                    .map_err(|e| {
                        AgentError::Transfer(format!("Failed to copy {:?}: {}", src_file, e))
                    })?;

                let info = processor
                    .process(&dest_dir, snapshot_name)
                    .await?
                    .ok_or_else(|| {
                        AgentError::Processing(format!("{} vanished from {:?}", file_name, dest_dir))
                    })?;

                let unique_name = cmd.dest.name.clone().unwrap_or_else(|| snapshot_name.to_string());
                Properties::new(&unique_name, &info.filename, info.size)
                    .with_format(info.clone())
                    .write(&dest_dir, TEMPLATE_PROPERTIES)
                    .await?;

                tracing::info!(
                    snapshot = src_path,
                    template = %join_key(dest_path, &info.filename),
                    "Created template from KVM snapshot"
                );
                Ok(DataObject::template()
                    .with_id(cmd.dest.id)
                    .with_name(unique_name)
                    .with_path(join_key(dest_path, &info.filename))
                    .with_format(format)
                    .with_size(info.virtual_size)
                    .with_physical_size(info.size))
            }
            HypervisorType::XenServer => {
                let snapshot_dir = src_root.join(src_dir);
                let snapshot_file = xen_snapshot_file_name(snapshot_name);
                let timeout = match cmd.wait_seconds {
                    0 => self.config.script_timeout(),
                    secs => Duration::from_secs(secs),
                };

                let uuid = self
                    .scripts
                    .snapshot_to_vhd(&snapshot_dir, &snapshot_file, &dest_dir, timeout)
                    .await?;
                let info = Processor::Vhd.process(&dest_dir, &uuid).await?.ok_or_else(|| {
                    AgentError::Processing(format!(
                        "Conversion of {} produced no {}.vhd",
                        snapshot_file, uuid
                    ))
                })?;

                Properties::new(&uuid, &info.filename, info.size)
                    .with_format(info.clone())
                    .write(&dest_dir, TEMPLATE_PROPERTIES)
                    .await?;

                tracing::info!(
                    snapshot = src_path,
                    template = %join_key(dest_path, &info.filename),
                    "Created template from XenServer snapshot"
                );
                Ok(DataObject::template()
                    .with_id(cmd.dest.id)
                    .with_name(uuid)
                    .with_path(join_key(dest_path, &info.filename))
                    .with_format(ImageFormat::Vhd)
                    .with_size(info.virtual_size)
                    .with_physical_size(info.size))
            }
            other => Err(AgentError::Unsupported(format!(
                "Snapshots from {} cannot be converted to templates",
                other
            ))),
        }
    }

    /// Uploads the artifact and its sidecar into the template's container.
    async fn push_template_to_swift(
        &self,
        swift: &SwiftBackend,
        local: &Path,
        staged: &DataObject,
    ) -> Result<DataObject, AgentError> {
        let container = format!("T-{}", staged.id);
        let (key, _) = swift.store(local, &container, None).await?;
        let sidecar = local.with_file_name(TEMPLATE_PROPERTIES);
        swift.store(&sidecar, &container, None).await?;

        let len = fs::metadata(local).await?.len();
        let mut result = staged.clone();
        result.path = Some(key);
        result.physical_size = Some(len);
        Ok(result)
    }

    /// Fetches an object store artifact into the image cache and installs it.
    async fn pull_to_cache(&self, cmd: &CopyCommand, url: &str) -> Result<DataObject, AgentError> {
        let root = self.mounts.root_dir(url).await?;
        let dest_path = cmd.dest.path_str().trim_end_matches('/');
        let dest_dir = root.join(dest_path);
        fs::create_dir_all(&dest_dir).await?;

        let source = self.backends.resolve(&cmd.src_store).await?;
        let fetched = source.fetch(cmd.src.path_str(), &dest_dir).await?;
        let fetched_name = file_name(&fetched)?;
        tracing::info!(
            src = cmd.src.path_str(),
            backend = source.name(),
            "Fetched into image cache at {:?}",
            fetched
        );

        let mut result = DataObject::new(cmd.dest.kind.clone()).with_id(cmd.dest.id);
        if let Some(name) = &cmd.dest.name {
            result = result.with_name(name.clone());
        }

        if cmd.dest.is_snapshot() {
            let len = fs::metadata(&fetched).await?.len();
            return Ok(result
                .with_path(join_key(dest_path, &fetched_name))
                .with_size(len)
                .with_physical_size(len));
        }

        let (kind, sidecar) = if cmd.dest.is_template() {
            (InstallKind::Template, TEMPLATE_PROPERTIES)
        } else {
            (InstallKind::Volume, VOLUME_PROPERTIES)
        };
        let image_format = cmd
            .src
            .format
            .or_else(|| format::detect(&fetched))
            .unwrap_or(ImageFormat::Raw);

        let installed = self
            .scripts
            .install(kind, &fetched, &dest_dir, image_format)
            .await?;
        if installed.filename != fetched_name
            && let Err(e) = fs::remove_file(&fetched).await
            && e.kind() != std::io::ErrorKind::NotFound
        {
            tracing::warn!("Failed to remove downloaded {:?}: {}", fetched, e);
        }

        let installed_path = dest_dir.join(&installed.filename);
        let virtual_size = virtual_size_or_len(&installed_path, Some(image_format)).await?;
        let mut props = Properties::new(&installed.unique_name, &installed.filename, installed.size);
        props.virtual_size = Some(virtual_size);
        props.write(&dest_dir, sidecar).await?;

        Ok(result
            .with_name(installed.unique_name)
            .with_path(join_key(dest_path, &installed.filename))
            .with_format(image_format)
            .with_size(virtual_size)
            .with_physical_size(installed.size))
    }

    /// Pushes an image cache artifact to the canonical image store.
    async fn push_from_cache(&self, cmd: &CopyCommand, url: &str) -> Result<DataObject, AgentError> {
        let target = match &cmd.dest_store {
            DataStore::S3(_) => self.backends.resolve(&cmd.dest_store).await?,
            other => {
                return Err(AgentError::Unsupported(format!(
                    "Copy from image cache to {} is not supported",
                    other
                )));
            }
        };

        let root = self.mounts.root_dir(url).await?;
        let local = probe_cached(&root.join(cmd.src.path_str())).await?;
        self.push_object(&target, &local, &cmd.dest).await
    }

    /// Stores `local` as `<dest path>/<file name>` and describes the result
    /// by the kind of `dest`.
    async fn push_object(
        &self,
        backend: &Backend,
        local: &Path,
        dest: &DataObject,
    ) -> Result<DataObject, AgentError> {
        let key = join_key(dest.path_str(), &file_name(local)?);
        let mode = backend.store(local, &key).await?;
        tracing::info!(
            key = %key,
            backend = backend.name(),
            mode = ?mode,
            "Pushed {:?} to {}",
            local,
            backend.root()
        );

        let len = fs::metadata(local).await?.len();
        let mut result = DataObject::new(dest.kind.clone())
            .with_id(dest.id)
            .with_path(key);
        if let Some(name) = &dest.name {
            result = result.with_name(name.clone());
        }

        Ok(match dest.kind {
            ObjectKind::Template => {
                let detected = format::detect(local);
                let size = virtual_size_or_len(local, detected).await?;
                result.format = detected;
                result.with_size(size).with_physical_size(len)
            }
            ObjectKind::Volume => result.with_size(len).with_physical_size(len),
            ObjectKind::Snapshot { .. } => result,
        })
    }
}

fn file_name(path: &Path) -> Result<String, AgentError> {
    path.file_name()
        .map(|name| name.to_string_lossy().to_string())
        .ok_or_else(|| AgentError::Configuration(format!("{:?} names no file", path)))
}

/// The recorded path if it exists, else the first of the known image
/// suffixes appended to it.
async fn probe_cached(path: &Path) -> Result<PathBuf, AgentError> {
    if fs::try_exists(path).await? {
        return Ok(path.to_path_buf());
    }
    for ext in CACHE_PROBE_EXTENSIONS {
        let mut candidate = OsString::from(path.as_os_str());
        candidate.push(".");
        candidate.push(ext);
        let candidate = PathBuf::from(candidate);
        if fs::try_exists(&candidate).await? {
            tracing::debug!("Using {:?} for cached artifact {:?}", candidate, path);
            return Ok(candidate);
        }
    }
    Err(AgentError::NotFound(format!(
        "Cached artifact {:?} does not exist",
        path
    )))
}
