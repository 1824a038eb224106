use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ScriptError {
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },

    #[error("{program} timed out after {timeout:?}")]
    Timeout { program: String, timeout: Duration },

    #[error("{program} exited with status {code:?}: {output}")]
    Failed {
        program: String,
        code: Option<i32>,
        output: String,
    },

    #[error("{program} reported an error: {output}")]
    Diagnostic { program: String, output: String },

    #[error("io error while running {program}: {source}")]
    Io {
        program: String,
        source: std::io::Error,
    },
}
