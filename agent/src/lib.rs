//! Command handling for a secondary-storage node: copy orchestration,
//! deletion, inventory and the dispatcher in front of them.

mod config;
mod copy;
mod delete;
mod dispatch;
mod error;
mod inventory;
mod transfer;

pub use config::AgentConfig;
pub use error::AgentError;
pub use transfer::{TransferManager, Unattached};

use object_store::ObjectStore;
use secstor_image::Scripts;
use secstor_mount::MountManager;
use secstor_store::Backends;
use std::sync::Arc;

/// The node's command handler. Holds no per-command state; every command
/// resolves its stores afresh.
pub struct SecondaryStorage {
    config: AgentConfig,
    mounts: Arc<MountManager>,
    backends: Backends,
    scripts: Scripts,
    transfer: Arc<dyn TransferManager>,
}

impl SecondaryStorage {
    /// Fails when a required conversion script is missing; the node cannot
    /// serve any command without them.
    pub fn new(config: AgentConfig) -> Result<Self, AgentError> {
        let scripts = Scripts::locate(&config.scripts_dir)?;
        let mounts = Arc::new(MountManager::new(config.mount_config()));
        let backends = Backends::new(mounts.clone(), config.swift_cli());

        tracing::info!(
            root = ?config.mount_root,
            in_system_vm = config.in_system_vm,
            "Secondary storage initialized"
        );

        Ok(Self {
            config,
            mounts,
            backends,
            scripts,
            transfer: Arc::new(Unattached),
        })
    }

    pub fn with_transfer_manager(mut self, transfer: Arc<dyn TransferManager>) -> Self {
        self.transfer = transfer;
        self
    }

    /// Serve every S3 store from `client` rather than from the credentials
    /// carried by the command.
    pub fn with_s3_client(mut self, client: Arc<dyn ObjectStore>) -> Self {
        self.backends = self.backends.with_s3_client(client);
        self
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn mounts(&self) -> &MountManager {
        &self.mounts
    }
}

/// `prefix/name`, tolerating an empty prefix or a trailing slash.
pub(crate) fn join_key(prefix: &str, name: &str) -> String {
    let prefix = prefix.trim_matches('/');
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", prefix, name)
    }
}
