//! External command execution.
//!
//! Every substrate here is driven through a CLI (docker, tmux, conda).
//! Backends talk to a [`CommandRunner`] so tests can script the outputs
//! and assert on the exact invocations.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::error::{BackendError, BackendResult};

/// Captured result of one finished command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code; `None` when the process was killed by a signal.
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            status: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failed(status: i32, stderr: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.status == Some(0)
    }

    /// stdout and stderr joined, as a human would see them in a terminal.
    pub fn combined(&self) -> String {
        match (self.stdout.is_empty(), self.stderr.is_empty()) {
            (_, true) => self.stdout.clone(),
            (true, false) => self.stderr.clone(),
            (false, false) => format!("{}\n{}", self.stdout.trim_end(), self.stderr),
        }
    }
}

#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `program args...` to completion or until `timeout` elapses.
    ///
    /// A non-zero exit is not an error at this level; callers inspect
    /// [`CommandOutput::status`] or use [`run_checked`].
    async fn run(
        &self,
        program: &str,
        args: &[String],
        timeout: Duration,
    ) -> BackendResult<CommandOutput>;
}

/// Runs commands as child processes of the coordinator.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemCommandRunner;

#[async_trait]
impl CommandRunner for SystemCommandRunner {
    async fn run(
        &self,
        program: &str,
        args: &[String],
        timeout: Duration,
    ) -> BackendResult<CommandOutput> {
        debug!(program, ?args, "running command");
        let child = tokio::process::Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output();

        let output = tokio::time::timeout(timeout, child)
            .await
            .map_err(|_| BackendError::Timeout {
                program: program.to_string(),
                after: timeout,
            })??;

        Ok(CommandOutput {
            status: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Run a command and turn a non-zero exit into [`BackendError::Command`].
pub async fn run_checked(
    runner: &dyn CommandRunner,
    program: &str,
    args: &[String],
    timeout: Duration,
) -> BackendResult<CommandOutput> {
    let output = runner.run(program, args, timeout).await?;
    if output.success() {
        Ok(output)
    } else {
        Err(BackendError::Command {
            program: program.to_string(),
            status: output.status,
            stderr: output.combined().trim().to_string(),
        })
    }
}

/// Build an owned argument vector from string slices.
pub fn args<I, S>(items: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    items.into_iter().map(Into::into).collect()
}
