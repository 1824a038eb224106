use crate::SecondaryStorage;
use crate::error::AgentError;
use futures::FutureExt;
use secstor_core::{Answer, AnswerPayload, Command};
use std::panic::AssertUnwindSafe;

impl SecondaryStorage {
    /// Runs one command. Always produces an answer: errors and panics alike
    /// become negative answers.
    pub async fn execute(&self, command: Command) -> Answer {
        let name = command.name();
        tracing::debug!(command = name, "Executing command");

        match AssertUnwindSafe(self.route(&command)).catch_unwind().await {
            Ok(Ok(answer)) => answer,
            Ok(Err(e)) if e.is_unsupported() => {
                tracing::info!(command = name, "Unsupported: {}", e);
                Answer {
                    unsupported: true,
                    ..Answer::failure(e.to_string())
                }
            }
            Ok(Err(e)) => {
                tracing::error!(command = name, "Failed: {}", e);
                Answer::failure(e.to_string())
            }
            Err(panic) => {
                let reason = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                tracing::error!(command = name, "Panicked: {}", reason);
                Answer::failure(format!("{} failed unexpectedly: {}", name, reason))
            }
        }
    }

    async fn route(&self, command: &Command) -> Result<Answer, AgentError> {
        match command {
            Command::Copy(cmd) => Ok(Answer::copied(self.copy(cmd).await?)),
            Command::Delete(cmd) => Ok(Answer::success_with(self.delete(cmd).await?)),
            Command::DeleteSnapshotsDir { store, directory } => Ok(Answer::success_with(
                self.delete_snapshots_dir(store, directory).await?,
            )),
            Command::ListTemplates { store } => {
                let templates = self.list_templates(store).await?;
                Ok(Answer::success().with_payload(AnswerPayload::Templates {
                    store: store.to_string(),
                    templates,
                }))
            }
            Command::ListVolumes { store } => {
                let volumes = self.list_volumes(store).await?;
                Ok(Answer::success().with_payload(AnswerPayload::Volumes {
                    store: store.to_string(),
                    volumes,
                }))
            }
            Command::ComputeChecksum {
                store,
                template_path,
            } => {
                let md5 = self.checksum(store, template_path).await?;
                Ok(Answer::success().with_payload(AnswerPayload::Checksum { md5 }))
            }
            Command::GetStorageStats { store } => {
                let (total_bytes, used_bytes) = self.storage_stats(store).await?;
                Ok(Answer::success().with_payload(AnswerPayload::StorageStats {
                    total_bytes,
                    used_bytes,
                }))
            }
            Command::SetupStore { store } => Ok(match self.setup_store(store).await? {
                Some(mount_dir) => Answer::success().with_payload(AnswerPayload::Setup { mount_dir }),
                None => Answer::success(),
            }),
            Command::CheckHealth | Command::Ready => Ok(Answer::success()),
            Command::Download { .. }
            | Command::DownloadProgress { .. }
            | Command::Upload { .. }
            | Command::CreateEntityDownloadUrl { .. }
            | Command::DeleteEntityDownloadUrl { .. } => Ok(self.transfer.handle(command).await),
            Command::Unknown => Ok(Answer::unsupported(command.name())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TransferManager;
    use crate::testing::storage;
    use async_trait::async_trait;
    use secstor_core::{
        CopyCommand, DataObject, DataStore, DataStoreRole, NfsStore, S3Store, SwiftStore,
    };
    use std::sync::Arc;
    use tempfile::TempDir;

    struct Echo;

    #[async_trait]
    impl TransferManager for Echo {
        async fn handle(&self, command: &Command) -> Answer {
            match command {
                Command::Download { body } => {
                    Answer::success().with_payload(AnswerPayload::Forwarded { body: body.clone() })
                }
                _ => Answer::failure("unexpected"),
            }
        }
    }

    fn nfs() -> DataStore {
        DataStore::Nfs(NfsStore {
            url: "nfs://10.0.0.1/export/secondary".to_string(),
            role: DataStoreRole::Image,
        })
    }

    #[tokio::test]
    async fn test_health_and_ready() {
        let root = TempDir::new().unwrap();
        let scripts = TempDir::new().unwrap();
        let storage = storage(&root, &scripts);

        assert!(storage.execute(Command::CheckHealth).await.result);
        assert!(storage.execute(Command::Ready).await.result);
    }

    #[tokio::test]
    async fn test_unknown_command_is_unsupported() {
        let root = TempDir::new().unwrap();
        let scripts = TempDir::new().unwrap();
        let storage = storage(&root, &scripts);

        let answer = storage.execute(Command::Unknown).await;
        assert!(!answer.result);
        assert!(answer.unsupported);
    }

    #[tokio::test]
    async fn test_transfer_commands_forwarded_verbatim() {
        let root = TempDir::new().unwrap();
        let scripts = TempDir::new().unwrap();
        let storage = storage(&root, &scripts);

        let body = serde_json::json!({"url": "http://mirror/centos.qcow2", "id": 3});
        let answer = storage
            .execute(Command::Download { body: body.clone() })
            .await;
        assert!(!answer.result);

        let storage = storage.with_transfer_manager(Arc::new(Echo));
        let answer = storage.execute(Command::Download { body: body.clone() }).await;
        assert!(answer.result);
        assert_eq!(answer.payload, Some(AnswerPayload::Forwarded { body }));
    }

    #[tokio::test]
    async fn test_unsupported_copy_is_flagged() {
        let root = TempDir::new().unwrap();
        let scripts = TempDir::new().unwrap();
        let storage = storage(&root, &scripts);

        let cmd = CopyCommand {
            src: DataObject::volume().with_path("volumes/2/1/a.raw"),
            src_store: DataStore::S3(S3Store {
                bucket: "b".to_string(),
                access_key: "a".to_string(),
                secret_key: "s".to_string(),
                endpoint: None,
                region: None,
                https: true,
                max_single_upload_bytes: None,
                role: DataStoreRole::Image,
            }),
            dest: DataObject::volume().with_path("volumes/2/1"),
            dest_store: DataStore::Swift(SwiftStore {
                url: "http://swift.local/auth/v1.0".to_string(),
                account: "a".to_string(),
                user_name: "u".to_string(),
                key: "k".to_string(),
                role: DataStoreRole::Image,
            }),
            wait_seconds: 0,
        };

        let answer = storage.execute(Command::Copy(cmd)).await;
        assert!(!answer.result);
        assert!(answer.unsupported);
    }

    #[tokio::test]
    async fn test_errors_become_negative_answers() {
        let root = TempDir::new().unwrap();
        let scripts = TempDir::new().unwrap();
        let storage = storage(&root, &scripts);

        let answer = storage
            .execute(Command::ComputeChecksum {
                store: nfs(),
                template_path: "template/tmpl/none.qcow2".to_string(),
            })
            .await;
        assert!(!answer.result);
        assert!(!answer.unsupported);
        assert!(answer.details.unwrap().contains("does not exist"));
    }
}
