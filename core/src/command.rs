use crate::types::{DataObject, DataStore, TemplateInventory, VolumeInventory};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CopyCommand {
    pub src: DataObject,
    pub src_store: DataStore,
    pub dest: DataObject,
    pub dest_store: DataStore,
    /// Seconds the caller is willing to wait for conversion scripts.
    #[serde(default)]
    pub wait_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteCommand {
    pub data: DataObject,
    pub store: DataStore,
}

/// Inbound command from the control plane.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Command {
    Copy(CopyCommand),
    Delete(DeleteCommand),
    DeleteSnapshotsDir {
        store: DataStore,
        directory: String,
    },
    ListTemplates {
        store: DataStore,
    },
    ListVolumes {
        store: DataStore,
    },
    ComputeChecksum {
        store: DataStore,
        template_path: String,
    },
    GetStorageStats {
        store: DataStore,
    },
    SetupStore {
        store: DataStore,
    },
    CheckHealth,
    Ready,
    Download {
        body: serde_json::Value,
    },
    DownloadProgress {
        body: serde_json::Value,
    },
    Upload {
        body: serde_json::Value,
    },
    CreateEntityDownloadUrl {
        body: serde_json::Value,
    },
    DeleteEntityDownloadUrl {
        body: serde_json::Value,
    },
    #[serde(other)]
    Unknown,
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::Copy(_) => "copy",
            Command::Delete(_) => "delete",
            Command::DeleteSnapshotsDir { .. } => "delete_snapshots_dir",
            Command::ListTemplates { .. } => "list_templates",
            Command::ListVolumes { .. } => "list_volumes",
            Command::ComputeChecksum { .. } => "compute_checksum",
            Command::GetStorageStats { .. } => "get_storage_stats",
            Command::SetupStore { .. } => "setup_store",
            Command::CheckHealth => "check_health",
            Command::Ready => "ready",
            Command::Download { .. } => "download",
            Command::DownloadProgress { .. } => "download_progress",
            Command::Upload { .. } => "upload",
            Command::CreateEntityDownloadUrl { .. } => "create_entity_download_url",
            Command::DeleteEntityDownloadUrl { .. } => "delete_entity_download_url",
            Command::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AnswerPayload {
    Copy {
        new_data: DataObject,
    },
    Templates {
        store: String,
        templates: TemplateInventory,
    },
    Volumes {
        store: String,
        volumes: VolumeInventory,
    },
    Checksum {
        md5: String,
    },
    StorageStats {
        total_bytes: u64,
        used_bytes: u64,
    },
    Setup {
        mount_dir: String,
    },
    Forwarded {
        body: serde_json::Value,
    },
}

/// Uniform result of a command. `result` is the success flag; failures carry
/// a human readable `details` message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Answer {
    pub result: bool,
    #[serde(default)]
    pub details: Option<String>,
    #[serde(default)]
    pub payload: Option<AnswerPayload>,
    #[serde(default)]
    pub unsupported: bool,
}

impl Answer {
    pub fn success() -> Self {
        Self {
            result: true,
            details: None,
            payload: None,
            unsupported: false,
        }
    }

    pub fn success_with(details: impl Into<String>) -> Self {
        Self {
            details: Some(details.into()),
            ..Self::success()
        }
    }

    pub fn failure(details: impl Into<String>) -> Self {
        Self {
            result: false,
            details: Some(details.into()),
            payload: None,
            unsupported: false,
        }
    }

    pub fn unsupported(command: &str) -> Self {
        Self {
            unsupported: true,
            ..Self::failure(format!(
                "Unsupported command issued: {}. Are you sure you got the right type of server?",
                command
            ))
        }
    }

    pub fn with_payload(mut self, payload: AnswerPayload) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn copied(new_data: DataObject) -> Self {
        Self::success().with_payload(AnswerPayload::Copy { new_data })
    }

    pub fn new_data(&self) -> Option<&DataObject> {
        match &self.payload {
            Some(AnswerPayload::Copy { new_data }) => Some(new_data),
            _ => None,
        }
    }
}
