use async_trait::async_trait;
use secstor_core::{Answer, Command};

/// Handles the bulk download and upload commands the agent does not
/// implement itself. Commands arrive verbatim and the answer is returned
/// unmodified.
#[async_trait]
pub trait TransferManager: Send + Sync {
    async fn handle(&self, command: &Command) -> Answer;
}

/// Used when no transfer manager is attached to the node.
pub struct Unattached;

#[async_trait]
impl TransferManager for Unattached {
    async fn handle(&self, command: &Command) -> Answer {
        Answer::failure(format!(
            "No transfer manager configured to handle {}",
            command.name()
        ))
    }
}
