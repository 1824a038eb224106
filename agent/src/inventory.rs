use crate::error::AgentError;
use crate::{SecondaryStorage, join_key};
use futures::TryStreamExt;
use md5::{Digest, Md5};
use secstor_core::{
    DataStore, TEMPLATE_ROOT_DIR, TemplateInventory, TemplateProp, VOLUME_ROOT_DIR,
    VolumeInventory,
};
use secstor_image::{Properties, TEMPLATE_PROPERTIES, VOLUME_PROPERTIES};
use secstor_store::s3::parent_segment;
use secstor_store::{Backend, SwiftBackend};
use tokio::fs;
use tokio::io::AsyncReadExt;

const CHECKSUM_BUFFER: usize = 1024 * 1024;

/// Object stores have no meaningful capacity; report a fixed large total.
const OBJECT_STORE_CAPACITY: u64 = i32::MAX as u64;

impl SecondaryStorage {
    /// Complete templates on the store keyed by unique name. Artifacts without
    /// a readable sidecar are left out.
    pub async fn list_templates(&self, store: &DataStore) -> Result<TemplateInventory, AgentError> {
        if !self.config.in_system_vm {
            return Ok(TemplateInventory::new());
        }
        let backend = self.backends.resolve(store).await?;
        templates_in(&backend).await
    }

    /// Complete volumes on the store keyed by volume id.
    pub async fn list_volumes(&self, store: &DataStore) -> Result<VolumeInventory, AgentError> {
        if !self.config.in_system_vm {
            return Ok(VolumeInventory::new());
        }
        let backend = self.backends.resolve(store).await?;
        volumes_in(&backend).await
    }

    /// Lower-case hex MD5 of a file on a filesystem store.
    pub async fn checksum(&self, store: &DataStore, path: &str) -> Result<String, AgentError> {
        let Backend::Filesystem(local) = self.backends.resolve(store).await? else {
            return Err(AgentError::Unsupported(format!(
                "Checksums can only be computed on filesystem stores, not {}",
                store
            )));
        };

        let file_path = local.path(path);
        let mut file = fs::File::open(&file_path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                AgentError::NotFound(format!("{:?} does not exist", file_path))
            } else {
                e.into()
            }
        })?;

        let mut hasher = Md5::new();
        let mut buf = vec![0u8; CHECKSUM_BUFFER];
        loop {
            let read = file.read(&mut buf).await?;
            if read == 0 {
                break;
            }
            hasher.update(&buf[..read]);
        }
        let digest = hex::encode(hasher.finalize());
        tracing::debug!("MD5 of {:?} is {}", file_path, digest);
        Ok(digest)
    }

    /// Total and used bytes of the store.
    pub async fn storage_stats(&self, store: &DataStore) -> Result<(u64, u64), AgentError> {
        if store.is_object_store() {
            return Ok((OBJECT_STORE_CAPACITY, 0));
        }
        let Backend::Filesystem(local) = self.backends.resolve(store).await? else {
            return Ok((OBJECT_STORE_CAPACITY, 0));
        };

        let root = local.root().to_path_buf();
        let stat = tokio::task::spawn_blocking(move || nix::sys::statvfs::statvfs(root.as_path()))
            .await
            .map_err(|e| AgentError::Transfer(format!("statvfs task failed: {}", e)))?
            .map_err(|e| {
                AgentError::Transfer(format!("statvfs of {:?} failed: {}", local.root(), e))
            })?;

        let fragment = stat.fragment_size() as u64;
        let total = stat.blocks() as u64 * fragment;
        let used = (stat.blocks() as u64).saturating_sub(stat.blocks_free() as u64) * fragment;
        Ok((total, used))
    }

    /// Prepares a store for use. Mounts a filesystem store and returns its
    /// mount directory name; nothing to do for object stores.
    pub async fn setup_store(&self, store: &DataStore) -> Result<Option<String>, AgentError> {
        if !self.config.in_system_vm {
            return Ok(None);
        }
        match store {
            DataStore::Nfs(nfs) => {
                let mount = self.mounts.mount(&nfs.url).await?;
                tracing::info!("Store {} ready at {:?}", nfs.url, mount.path);
                Ok(Some(mount.name))
            }
            DataStore::S3(_) | DataStore::Swift(_) => Ok(None),
        }
    }
}

async fn templates_in(backend: &Backend) -> Result<TemplateInventory, AgentError> {
    let mut templates = TemplateInventory::new();
    match backend {
        Backend::Filesystem(local) => {
            let mut entries = local.list(TEMPLATE_ROOT_DIR);
            while let Some(entry) = entries.try_next().await? {
                let Some((dir, TEMPLATE_PROPERTIES)) = entry.key.rsplit_once('/') else {
                    continue;
                };
                let Some(props) = Properties::read(&local.path(&entry.key)).await else {
                    continue;
                };
                let prop = props.to_prop(join_key(dir, &props.filename));
                templates.insert(props.unique_name, prop);
            }
        }
        Backend::S3(s3) => {
            let mut entries = s3.list(TEMPLATE_ROOT_DIR);
            while let Some(entry) = entries.try_next().await? {
                if entry.key.ends_with(".properties") {
                    continue;
                }
                let Some(name) = parent_segment(&entry.key) else {
                    continue;
                };
                let size = entry.size.unwrap_or_default();
                templates.insert(name.to_string(), object_prop(name, &entry.key, size));
            }
        }
        Backend::Swift(swift) => {
            for container in swift.list_names("").await? {
                if !container.starts_with("T-") {
                    continue;
                }
                if let Some((name, prop)) = swift_template(swift, &container).await? {
                    templates.insert(name, prop);
                }
            }
        }
    }
    tracing::debug!(backend = backend.name(), count = templates.len(), "Listed templates");
    Ok(templates)
}

async fn volumes_in(backend: &Backend) -> Result<VolumeInventory, AgentError> {
    let mut volumes = VolumeInventory::new();
    match backend {
        Backend::Filesystem(local) => {
            let mut entries = local.list(VOLUME_ROOT_DIR);
            while let Some(entry) = entries.try_next().await? {
                let Some((dir, VOLUME_PROPERTIES)) = entry.key.rsplit_once('/') else {
                    continue;
                };
                let Some(id) = dir.rsplit('/').next().and_then(|s| s.parse::<u64>().ok()) else {
                    continue;
                };
                let Some(props) = Properties::read(&local.path(&entry.key)).await else {
                    continue;
                };
                volumes.insert(id, props.to_prop(join_key(dir, &props.filename)));
            }
        }
        Backend::S3(s3) => {
            let mut entries = s3.list(VOLUME_ROOT_DIR);
            while let Some(entry) = entries.try_next().await? {
                if entry.key.ends_with(".properties") {
                    continue;
                }
                let Some(id) = parent_segment(&entry.key).and_then(|s| s.parse::<u64>().ok())
                else {
                    continue;
                };
                let size = entry.size.unwrap_or_default();
                volumes.insert(id, object_prop(&id.to_string(), &entry.key, size));
            }
        }
        Backend::Swift(_) => {
            return Err(AgentError::Unsupported(
                "Listing volumes is not supported on swift".to_string(),
            ));
        }
    }
    tracing::debug!(backend = backend.name(), count = volumes.len(), "Listed volumes");
    Ok(volumes)
}

fn object_prop(name: &str, key: &str, size: u64) -> TemplateProp {
    TemplateProp {
        unique_name: name.to_string(),
        install_path: key.to_string(),
        size,
        physical_size: size,
        is_public: false,
        is_corrupted: false,
    }
}

/// A template container holds exactly one sidecar; anything else is skipped.
async fn swift_template(
    swift: &SwiftBackend,
    container: &str,
) -> Result<Option<(String, TemplateProp)>, AgentError> {
    let sidecars: Vec<String> = swift
        .list_names(container)
        .await?
        .into_iter()
        .filter(|name| name.ends_with(TEMPLATE_PROPERTIES))
        .collect();
    let [sidecar] = sidecars.as_slice() else {
        tracing::debug!(
            "Skipping {}: {} template sidecars",
            container,
            sidecars.len()
        );
        return Ok(None);
    };

    let scratch = tempfile::TempDir::new()?;
    let local = swift
        .fetch(&join_key(container, sidecar), scratch.path())
        .await?;
    let Some(props) = Properties::read(&local).await else {
        return Ok(None);
    };

    let mut prop = props.to_prop(join_key(container, &props.filename));
    prop.size = props.size;
    Ok(Some((props.unique_name, prop)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::storage;
    use object_store::memory::InMemory;
    use object_store::path::Path as ObjectPath;
    use object_store::{ObjectStore, PutPayload};
    use secstor_core::{DataStoreRole, NfsStore, S3Store};
    use secstor_store::{FilesystemBackend, S3Backend};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn nfs() -> DataStore {
        DataStore::Nfs(NfsStore {
            url: "nfs://10.0.0.1/export/secondary".to_string(),
            role: DataStoreRole::Image,
        })
    }

    fn s3_config() -> S3Store {
        S3Store {
            bucket: "images".to_string(),
            access_key: "ak".to_string(),
            secret_key: "sk".to_string(),
            endpoint: None,
            region: None,
            https: true,
            max_single_upload_bytes: None,
            role: DataStoreRole::Image,
        }
    }

    fn write_sidecar(dir: &std::path::Path, file: &str, body: &str) {
        std::fs::create_dir_all(dir).unwrap();
        std::fs::write(dir.join(file), body).unwrap();
    }

    #[tokio::test]
    async fn test_filesystem_templates_need_sidecar() {
        let root = TempDir::new().unwrap();
        let complete = root.path().join("template/tmpl/2/201");
        write_sidecar(
            &complete,
            TEMPLATE_PROPERTIES,
            "uniquename=centos\nfilename=centos.qcow2\nsize=12345\nvirtualsize=99999\n",
        );
        std::fs::write(complete.join("centos.qcow2"), b"q").unwrap();
        // In progress: no uniquename yet.
        write_sidecar(
            &root.path().join("template/tmpl/2/202"),
            TEMPLATE_PROPERTIES,
            "filename=half.qcow2\nsize=1\n",
        );
        std::fs::write(root.path().join("template/tmpl/2/202/half.qcow2"), b"h").unwrap();

        let backend = Backend::Filesystem(FilesystemBackend::new(root.path()));
        let templates = templates_in(&backend).await.unwrap();

        assert_eq!(templates.len(), 1);
        let prop = &templates["centos"];
        assert_eq!(prop.install_path, "template/tmpl/2/201/centos.qcow2");
        assert_eq!(prop.size, 99999);
        assert_eq!(prop.physical_size, 12345);
    }

    #[tokio::test]
    async fn test_filesystem_volumes_keyed_by_id() {
        let root = TempDir::new().unwrap();
        write_sidecar(
            &root.path().join("volumes/2/42"),
            VOLUME_PROPERTIES,
            "uniquename=vol-42\nfilename=vol.raw\nsize=10\n",
        );
        write_sidecar(
            &root.path().join("volumes/2/scratch"),
            VOLUME_PROPERTIES,
            "uniquename=x\nfilename=x.raw\nsize=1\n",
        );

        let backend = Backend::Filesystem(FilesystemBackend::new(root.path()));
        let volumes = volumes_in(&backend).await.unwrap();

        assert_eq!(volumes.len(), 1);
        assert_eq!(volumes[&42].install_path, "volumes/2/42/vol.raw");
    }

    #[tokio::test]
    async fn test_s3_listing_uses_parent_segment() {
        let memory = Arc::new(InMemory::new());
        for (key, len) in [
            ("template/tmpl/2/201/centos/centos.qcow2", 10usize),
            ("template/tmpl/2/201/centos/template.properties", 3),
            ("volumes/2/42/vol.raw", 7),
        ] {
            memory
                .put(&ObjectPath::from(key), PutPayload::from(vec![0u8; len]))
                .await
                .unwrap();
        }
        let backend = Backend::S3(S3Backend::new(s3_config(), memory));

        let templates = templates_in(&backend).await.unwrap();
        assert_eq!(templates.len(), 1);
        assert_eq!(templates["centos"].size, 10);

        let volumes = volumes_in(&backend).await.unwrap();
        assert_eq!(volumes[&42].install_path, "volumes/2/42/vol.raw");
    }

    #[tokio::test]
    async fn test_listing_outside_system_vm_is_empty() {
        let root = TempDir::new().unwrap();
        let scripts = TempDir::new().unwrap();
        let storage = storage(&root, &scripts);
        write_sidecar(
            &root.path().join("template/tmpl/2/201"),
            TEMPLATE_PROPERTIES,
            "uniquename=centos\nfilename=centos.qcow2\nsize=1\n",
        );

        assert!(storage.list_templates(&nfs()).await.unwrap().is_empty());
        assert_eq!(storage.setup_store(&nfs()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_checksum_matches_reference() {
        let root = TempDir::new().unwrap();
        let scripts = TempDir::new().unwrap();
        let storage = storage(&root, &scripts);
        std::fs::write(root.path().join("hello.txt"), b"hello world").unwrap();

        let digest = storage.checksum(&nfs(), "hello.txt").await.unwrap();
        assert_eq!(digest, "5eb63bbbe01eeed093cb22bb8f5acdc3");

        assert!(matches!(
            storage.checksum(&nfs(), "missing.qcow2").await,
            Err(AgentError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_storage_stats() {
        let root = TempDir::new().unwrap();
        let scripts = TempDir::new().unwrap();
        let storage = storage(&root, &scripts);

        let (total, used) = storage.storage_stats(&nfs()).await.unwrap();
        assert!(total > 0);
        assert!(used <= total);

        let object = DataStore::S3(s3_config());
        assert_eq!(
            storage.storage_stats(&object).await.unwrap(),
            (i32::MAX as u64, 0)
        );
    }
}
