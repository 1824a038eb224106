use crate::RemoteTarget;
use crate::error::MountError;
use crate::table::MountTable;
use md5::{Digest, Md5};
use secstor_core::Script;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::fs;

const SNAPSHOTS_DIR: &str = "snapshots";
const VOLUMES_DIR: &str = "volumes";

#[derive(Debug, Clone)]
pub struct MountConfig {
    /// Private root that holds one directory per mounted share.
    pub root: PathBuf,
    /// When false the node is not a storage VM: the root itself is the store
    /// and nothing gets mounted.
    pub in_system_vm: bool,
    pub mount_bin: PathBuf,
    pub umount_bin: PathBuf,
    pub mount_table: PathBuf,
    pub timeout: Duration,
}

impl Default for MountConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("/mnt/SecStorage"),
            in_system_vm: true,
            mount_bin: PathBuf::from("mount"),
            umount_bin: PathBuf::from("umount"),
            mount_table: PathBuf::from("/proc/mounts"),
            timeout: Duration::from_secs(1440),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountState {
    Unmounted,
    Mounting,
    Mounted,
    Unmounting,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountPoint {
    /// Directory name under the private root.
    pub name: String,
    pub path: PathBuf,
}

/// Mounts remote shares under a private root.
///
/// The system mount table is the only source of truth for whether a share is
/// mounted. In memory there is one lock per mount directory, so that mount
/// and unmount of the same share never interleave, and the transition a
/// directory is going through while its lock is held.
pub struct MountManager {
    config: MountConfig,
    table: MountTable,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    transitions: Arc<Mutex<HashMap<String, MountState>>>,
}

/// Clears the recorded transition of a mount directory when dropped.
struct Transition {
    name: String,
    transitions: Arc<Mutex<HashMap<String, MountState>>>,
}

impl Drop for Transition {
    fn drop(&mut self) {
        let mut transitions = self.transitions.lock().unwrap_or_else(|e| e.into_inner());
        transitions.remove(&self.name);
    }
}

impl MountManager {
    pub fn new(config: MountConfig) -> Self {
        let table = MountTable::new(&config.mount_table);
        Self {
            config,
            table,
            locks: Mutex::new(HashMap::new()),
            transitions: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn config(&self) -> &MountConfig {
        &self.config
    }

    pub fn root(&self) -> &Path {
        &self.config.root
    }

    /// Local root of the store behind `url`: the mount point of the share
    /// inside a storage VM, the private root itself otherwise.
    pub async fn root_dir(&self, url: &str) -> Result<PathBuf, MountError> {
        if !self.config.in_system_vm {
            return Ok(self.config.root.clone());
        }
        let mount = self.mount(url).await?;
        Ok(mount.path)
    }

    fn lock_for(&self, name: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    fn begin(&self, name: &str, state: MountState) -> Transition {
        let mut transitions = self.transitions.lock().unwrap_or_else(|e| e.into_inner());
        transitions.insert(name.to_string(), state);
        Transition {
            name: name.to_string(),
            transitions: self.transitions.clone(),
        }
    }

    async fn locate(&self, target: &RemoteTarget) -> Result<(String, MountPoint), MountError> {
        let host_ip = resolve_host(&target.host).await?;
        let name = mount_dir_name(&host_ip, &target.path);
        let path = self.config.root.join(&name);
        Ok((host_ip, MountPoint { name, path }))
    }

    pub async fn state(&self, url: &str) -> Result<MountState, MountError> {
        let target = RemoteTarget::parse(url)?;
        let (_, point) = self.locate(&target).await?;
        let transient = {
            let transitions = self.transitions.lock().unwrap_or_else(|e| e.into_inner());
            transitions.get(&point.name).copied()
        };
        if let Some(state) = transient {
            return Ok(state);
        }
        if self.table.is_mounted(&point.path).await? {
            Ok(MountState::Mounted)
        } else {
            Ok(MountState::Unmounted)
        }
    }

    pub async fn mount(&self, url: &str) -> Result<MountPoint, MountError> {
        let target = RemoteTarget::parse(url)?;
        // Validate options before touching anything on disk.
        let options = target.mount_options(self.config.in_system_vm)?;
        let (host_ip, point) = self.locate(&target).await?;

        let lock = self.lock_for(&point.name);
        let _guard = lock.lock().await;
        let _transition = self.begin(&point.name, MountState::Mounting);

        tracing::debug!("mount {} on {:?}", target.uri(), point.path);
        let created = ensure_local_path(&point.path, target.uri()).await?;

        if self.table.is_mounted(&point.path).await? {
            tracing::debug!(
                "Some device already mounted at {:?}, no need to mount {}",
                point.path,
                target.uri()
            );
            return Ok(point);
        }

        let device = target.device(&host_ip);
        let mut script = Script::new(&self.config.mount_bin, self.config.timeout)
            .opt("-t", target.scheme.as_str());
        if let Some(options) = options {
            script = script.opt("-o", options);
        }
        let script = script.arg(&device).arg(point.path.as_os_str());

        if let Err(e) = script.execute().await {
            let msg = format!("Unable to mount {} at {:?} due to {}", device, point.path, e);
            tracing::error!("{}", msg);
            if created && let Err(e) = fs::remove_dir(&point.path).await {
                tracing::warn!("Failed to remove mount point {:?}: {}", point.path, e);
            }
            return Err(MountError::MountFailed(msg));
        }

        tracing::info!("Successfully mounted {} at {:?}", device, point.path);

        ensure_subdir(&point.path, SNAPSHOTS_DIR).await;
        ensure_subdir(&point.path, VOLUMES_DIR).await;

        Ok(point)
    }

    pub async fn unmount(&self, url: &str) -> Result<(), MountError> {
        let target = RemoteTarget::parse(url)?;
        let (_, point) = self.locate(&target).await?;

        let lock = self.lock_for(&point.name);
        let _guard = lock.lock().await;
        let _transition = self.begin(&point.name, MountState::Unmounting);

        if !self.table.is_mounted(&point.path).await? {
            tracing::debug!("{:?} is not mounted, nothing to unmount", point.path);
            return Ok(());
        }

        let script = Script::new(&self.config.umount_bin, self.config.timeout)
            .arg(point.path.as_os_str());

        if let Err(e) = script.execute().await {
            let msg = format!("Unable to umount {:?} due to {}", point.path, e);
            tracing::error!("{}", msg);
            if let Err(e) = fs::remove_dir(&point.path).await {
                tracing::warn!("Failed to remove mount point {:?}: {}", point.path, e);
            }
            return Err(MountError::UnmountFailed(msg));
        }

        tracing::info!("Successfully umounted {:?}", point.path);
        Ok(())
    }
}

/// Directory name for a share: a name-based (version 3) UUID over
/// `"<host-ip>:<remote-path>"`, so the same share always lands in the same place.
pub fn mount_dir_name(host_ip: &str, remote_path: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(format!("{}:{}", host_ip, remote_path).as_bytes());
    let digest: [u8; 16] = hasher.finalize().into();
    uuid::Builder::from_md5_bytes(digest)
        .into_uuid()
        .to_string()
}

async fn resolve_host(host: &str) -> Result<String, MountError> {
    let mut addrs = tokio::net::lookup_host((host, 0))
        .await
        .map_err(|e| MountError::HostResolution {
            host: host.to_string(),
            reason: e.to_string(),
        })?;

    let addr = addrs.next().ok_or_else(|| MountError::HostResolution {
        host: host.to_string(),
        reason: "no addresses returned".to_string(),
    })?;

    let ip = addr.ip().to_string();
    tracing::info!("Determined host {} corresponds to IP {}", host, ip);
    Ok(ip)
}

/// Makes sure the mount point exists. Returns whether it had to be created.
async fn ensure_local_path(path: &Path, uri: &str) -> Result<bool, MountError> {
    if fs::metadata(path).await.is_ok() {
        return Ok(false);
    }

    tracing::debug!("create mount point: {:?}", path);
    if let Err(e) = fs::create_dir_all(path).await {
        tracing::warn!("mkdir {:?} failed: {}", path, e);
    }

    // Check again, the directory has to exist before anything gets mounted on it.
    if fs::metadata(path).await.is_err() {
        let msg = format!("{:?} in order to mount {}", path, uri);
        tracing::error!("Unable to create local folder for: {}", msg);
        return Err(MountError::LocalPath(msg));
    }
    Ok(true)
}

async fn ensure_subdir(mount_point: &Path, name: &str) -> bool {
    let dir = mount_point.join(name);

    let exists = match fs::metadata(&dir).await {
        Ok(meta) if meta.is_dir() => {
            tracing::debug!("{} already exists on secondary storage at {:?}", name, mount_point);
            true
        }
        Ok(_) => fs::remove_file(&dir).await.is_ok() && fs::create_dir(&dir).await.is_ok(),
        Err(_) => fs::create_dir(&dir).await.is_ok(),
    };

    if exists {
        tracing::info!("{} directory created/exists on Secondary Storage.", name);
    } else {
        tracing::warn!("{} directory does not exist on Secondary Storage.", name);
    }
    exists
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    struct Fixture {
        dir: TempDir,
        manager: MountManager,
    }

    impl Fixture {
        fn mount_log(&self) -> Vec<String> {
            std::fs::read_to_string(self.dir.path().join("mount.log"))
                .unwrap_or_default()
                .lines()
                .map(String::from)
                .collect()
        }

        fn umount_log(&self) -> Vec<String> {
            std::fs::read_to_string(self.dir.path().join("umount.log"))
                .unwrap_or_default()
                .lines()
                .map(String::from)
                .collect()
        }
    }

    fn write_tool(path: &Path, body: &str) {
        std::fs::write(path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    // Fake mount/umount tools that record invocations and maintain a mount
    // table file in the same format as /proc/mounts.
    fn fixture(mount_succeeds: bool) -> Fixture {
        fixture_with_delay(mount_succeeds, None)
    }

    fn fixture_with_delay(mount_succeeds: bool, delay: Option<&str>) -> Fixture {
        let dir = TempDir::new().unwrap();
        let base = dir.path();
        let table = base.join("mounts");
        std::fs::write(&table, "").unwrap();

        let mount_body = if mount_succeeds {
            format!(
                "echo \"$@\" >> {log}\nfor a; do last=$a; done\necho \"remote $last nfs rw 0 0\" >> {table}",
                log = base.join("mount.log").display(),
                table = table.display()
            )
        } else {
            format!(
                "echo \"$@\" >> {log}\necho 'mount.nfs: access denied' >&2\nexit 32",
                log = base.join("mount.log").display()
            )
        };
        let mount_body = match delay {
            Some(secs) => format!("sleep {}\n{}", secs, mount_body),
            None => mount_body,
        };
        write_tool(&base.join("mount"), &mount_body);
        write_tool(
            &base.join("umount"),
            &format!(
                "echo \"$@\" >> {log}\n: > {table}",
                log = base.join("umount.log").display(),
                table = table.display()
            ),
        );

        let config = MountConfig {
            root: base.join("root"),
            in_system_vm: true,
            mount_bin: base.join("mount"),
            umount_bin: base.join("umount"),
            mount_table: table,
            timeout: Duration::from_secs(10),
        };
        Fixture {
            manager: MountManager::new(config),
            dir,
        }
    }

    #[test]
    fn test_mount_dir_name_is_stable() {
        let a = mount_dir_name("10.0.0.1", "/export/secondary");
        let b = mount_dir_name("10.0.0.1", "/export/secondary");
        let c = mount_dir_name("10.0.0.2", "/export/secondary");

        assert_eq!(a, b);
        assert_ne!(a, c);
        let parsed = uuid::Uuid::parse_str(&a).unwrap();
        assert_eq!(parsed.get_version_num(), 3);
    }

    #[tokio::test]
    async fn test_mount_is_idempotent() {
        let fx = fixture(true);

        let first = fx.manager.mount("nfs://127.0.0.1/export/sec").await.unwrap();
        let second = fx.manager.mount("nfs://127.0.0.1/export/sec").await.unwrap();

        assert_eq!(first, second);
        assert_eq!(fx.mount_log().len(), 1);
        assert!(first.path.join("snapshots").is_dir());
        assert!(first.path.join("volumes").is_dir());
        assert_eq!(
            fx.manager.state("nfs://127.0.0.1/export/sec").await.unwrap(),
            MountState::Mounted
        );
    }

    #[tokio::test]
    async fn test_mount_options_passed_to_tool() {
        let fx = fixture(true);

        let point = fx.manager.mount("nfs://127.0.0.1/export/sec").await.unwrap();

        let log = fx.mount_log();
        let expected_device = "127.0.0.1:/export/sec";
        assert!(log[0].starts_with("-t nfs"));
        assert!(log[0].contains(expected_device));
        assert!(log[0].ends_with(&point.path.to_string_lossy().to_string()));
    }

    #[tokio::test]
    async fn test_failed_mount_removes_directory() {
        let fx = fixture(false);

        let err = fx.manager.mount("nfs://127.0.0.1/export/sec").await.unwrap_err();
        assert!(matches!(err, MountError::MountFailed(_)));

        let name = mount_dir_name("127.0.0.1", "/export/sec");
        assert!(!fx.manager.root().join(name).exists());
    }

    #[tokio::test]
    async fn test_failed_mount_keeps_existing_directory() {
        let fx = fixture(false);
        let name = mount_dir_name("127.0.0.1", "/export/sec");
        let existing = fx.manager.root().join(name);
        std::fs::create_dir_all(&existing).unwrap();

        let err = fx.manager.mount("nfs://127.0.0.1/export/sec").await.unwrap_err();
        assert!(matches!(err, MountError::MountFailed(_)));
        assert!(existing.is_dir());
    }

    #[tokio::test]
    async fn test_concurrent_mounts_of_one_share_run_once() {
        let fx = fixture_with_delay(true, Some("0.3"));
        let url = "nfs://127.0.0.1/export/sec";

        let (first, second) = tokio::join!(fx.manager.mount(url), fx.manager.mount(url));

        assert_eq!(first.unwrap(), second.unwrap());
        assert_eq!(fx.mount_log().len(), 1);
        assert_eq!(fx.manager.state(url).await.unwrap(), MountState::Mounted);
    }

    #[tokio::test]
    async fn test_state_reports_mount_in_progress() {
        let fx = fixture_with_delay(true, Some("0.5"));
        let url = "nfs://127.0.0.1/export/sec";

        let observe = async {
            tokio::time::sleep(Duration::from_millis(150)).await;
            fx.manager.state(url).await.unwrap()
        };
        let (mounted, during) = tokio::join!(fx.manager.mount(url), observe);

        mounted.unwrap();
        assert_eq!(during, MountState::Mounting);
        assert_eq!(fx.manager.state(url).await.unwrap(), MountState::Mounted);
    }

    #[tokio::test]
    async fn test_cifs_without_credentials_never_mounts() {
        let fx = fixture(true);

        let err = fx
            .manager
            .mount("cifs://127.0.0.1/share?user=admin")
            .await
            .unwrap_err();

        assert!(err.is_configuration());
        assert!(fx.mount_log().is_empty());
    }

    #[tokio::test]
    async fn test_unmount() {
        let fx = fixture(true);

        // Not mounted yet: nothing to do.
        fx.manager.unmount("nfs://127.0.0.1/export/sec").await.unwrap();
        assert!(fx.umount_log().is_empty());

        fx.manager.mount("nfs://127.0.0.1/export/sec").await.unwrap();
        fx.manager.unmount("nfs://127.0.0.1/export/sec").await.unwrap();

        assert_eq!(fx.umount_log().len(), 1);
        assert_eq!(
            fx.manager.state("nfs://127.0.0.1/export/sec").await.unwrap(),
            MountState::Unmounted
        );
    }

    #[tokio::test]
    async fn test_root_dir_outside_system_vm() {
        let dir = TempDir::new().unwrap();
        let manager = MountManager::new(MountConfig {
            root: dir.path().to_path_buf(),
            in_system_vm: false,
            ..MountConfig::default()
        });

        let root = manager.root_dir("nfs://unresolvable.invalid/x").await.unwrap();
        assert_eq!(root, dir.path());
    }
}
