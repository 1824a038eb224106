mod command;
mod error;
pub mod script;
mod types;

pub use command::{Answer, AnswerPayload, Command, CopyCommand, DeleteCommand};
pub use error::ScriptError;
pub use script::{FailurePolicy, Script, ScriptOutput};
pub use types::*;
