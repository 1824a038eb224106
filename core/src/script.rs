//! Runs external tools (mount, conversion scripts, the object-store CLI) with a
//! timeout, capturing combined output and deciding whether the run failed.

use crate::error::ScriptError;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::Command;

/// Output substrings that mark a failed run even when the tool exits zero.
pub const ERROR_MARKERS: &[&str] = &["Errno", "failed"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Only a non-zero exit status is a failure.
    ExitStatus,
    /// Additionally fail when any output line carries an [`ERROR_MARKERS`] entry.
    ExitStatusAndMarkers,
}

#[derive(Debug, Clone)]
pub struct ScriptOutput {
    pub code: Option<i32>,
    pub output: String,
}

impl ScriptOutput {
    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.output.lines().filter(|l| !l.trim().is_empty())
    }
}

#[derive(Debug, Clone)]
pub struct Script {
    program: PathBuf,
    args: Vec<OsString>,
    timeout: Duration,
    policy: FailurePolicy,
    current_dir: Option<PathBuf>,
}

impl Script {
    pub fn new(program: impl AsRef<Path>, timeout: Duration) -> Self {
        Self {
            program: program.as_ref().to_path_buf(),
            args: Vec::new(),
            timeout,
            policy: FailurePolicy::ExitStatus,
            current_dir: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Adds `flag value` as two arguments.
    pub fn opt(self, flag: &str, value: impl Into<OsString>) -> Self {
        self.arg(flag).arg(value)
    }

    pub fn policy(mut self, policy: FailurePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn current_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.current_dir = Some(dir.as_ref().to_path_buf());
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    pub fn command_line(&self) -> String {
        let mut line = self.program.to_string_lossy().to_string();
        for arg in &self.args {
            line.push(' ');
            line.push_str(&arg.to_string_lossy());
        }
        line
    }

    pub async fn execute(&self) -> Result<ScriptOutput, ScriptError> {
        let program = self.program.to_string_lossy().to_string();
        tracing::debug!("Executing: {}", self.command_line());

        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.current_dir {
            command.current_dir(dir);
        }

        let mut child = command.spawn().map_err(|e| ScriptError::Spawn {
            program: program.clone(),
            source: e,
        })?;

        let mut stdout = child.stdout.take();
        let mut stderr = child.stderr.take();

        let run = async {
            let mut out = Vec::new();
            let mut err = Vec::new();
            let read_out = async {
                if let Some(s) = stdout.as_mut() {
                    s.read_to_end(&mut out).await?;
                }
                Ok::<_, std::io::Error>(())
            };
            let read_err = async {
                if let Some(s) = stderr.as_mut() {
                    s.read_to_end(&mut err).await?;
                }
                Ok::<_, std::io::Error>(())
            };
            let (r1, r2) = tokio::join!(read_out, read_err);
            r1?;
            r2?;
            let status = child.wait().await?;
            Ok::<_, std::io::Error>((status, out, err))
        };

        let (status, out, err) = match tokio::time::timeout(self.timeout, run).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => {
                return Err(ScriptError::Io {
                    program,
                    source: e,
                });
            }
            Err(_) => {
                tracing::warn!("{} timed out after {:?}", program, self.timeout);
                return Err(ScriptError::Timeout {
                    program,
                    timeout: self.timeout,
                });
            }
        };

        let mut output = String::from_utf8_lossy(&out).to_string();
        output.push_str(&String::from_utf8_lossy(&err));

        let result = ScriptOutput {
            code: status.code(),
            output,
        };

        if !status.success() {
            tracing::warn!(
                "{} exited with {:?}: {}",
                program,
                result.code,
                result.output.trim()
            );
            return Err(ScriptError::Failed {
                program,
                code: result.code,
                output: result.output.trim().to_string(),
            });
        }

        if self.policy == FailurePolicy::ExitStatusAndMarkers
            && let Some(line) = first_error_line(&result.output)
        {
            tracing::warn!("{} reported an error: {}", program, line);
            return Err(ScriptError::Diagnostic {
                program,
                output: result.output.trim().to_string(),
            });
        }

        Ok(result)
    }
}

/// Returns the first output line carrying one of [`ERROR_MARKERS`].
pub fn first_error_line(output: &str) -> Option<&str> {
    output
        .lines()
        .find(|line| ERROR_MARKERS.iter().any(|marker| line.contains(marker)))
}
