use crate::error::AgentError;
use secstor_mount::MountConfig;
use secstor_store::SwiftCli;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Node configuration. Every field has a default, so a partial file (or no
/// file) is a valid configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub mount_root: PathBuf,
    pub in_system_vm: bool,
    pub scripts_dir: PathBuf,
    pub script_timeout_secs: u64,
    pub object_store_timeout_secs: u64,
    pub mount_bin: PathBuf,
    pub umount_bin: PathBuf,
    pub mount_table: PathBuf,
    pub swift_cli: PathBuf,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            mount_root: PathBuf::from("/mnt/SecStorage"),
            in_system_vm: true,
            scripts_dir: PathBuf::from("./scripts/storage/secondary"),
            script_timeout_secs: 1440,
            object_store_timeout_secs: 10800,
            mount_bin: PathBuf::from("mount"),
            umount_bin: PathBuf::from("umount"),
            mount_table: PathBuf::from("/proc/mounts"),
            swift_cli: PathBuf::from("/usr/local/cloud/systemvm/scripts/storage/secondary/swift"),
        }
    }
}

impl AgentConfig {
    pub fn load(path: &Path) -> Result<Self, AgentError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            AgentError::Configuration(format!("Failed to read config {:?}: {}", path, e))
        })?;
        serde_json::from_str(&content).map_err(|e| {
            AgentError::Configuration(format!("Failed to parse config {:?}: {}", path, e))
        })
    }

    pub fn script_timeout(&self) -> Duration {
        Duration::from_secs(self.script_timeout_secs)
    }

    pub fn mount_config(&self) -> MountConfig {
        MountConfig {
            root: self.mount_root.clone(),
            in_system_vm: self.in_system_vm,
            mount_bin: self.mount_bin.clone(),
            umount_bin: self.umount_bin.clone(),
            mount_table: self.mount_table.clone(),
            timeout: self.script_timeout(),
        }
    }

    pub fn swift_cli(&self) -> SwiftCli {
        SwiftCli::new(
            &self.swift_cli,
            Duration::from_secs(self.object_store_timeout_secs),
        )
    }
}
