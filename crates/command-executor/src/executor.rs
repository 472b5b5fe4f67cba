//! One-shot command execution with a hard deadline

use crate::command::Command;
use crate::error::{Error, Result};
use crate::process::ExitStatus;
use async_process::Stdio;
use async_runtime_compat::runtime_utils::timeout;
use async_runtime_compat::CancellationToken;
use futures::future::{self, Either};
use std::pin::pin;
use std::time::Duration;
use tracing::{debug, warn};

/// Upper bound for arbitrary commands when the caller sets none
pub const DEFAULT_EXECUTE_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Options for [`execute`]
#[derive(Debug, Clone)]
pub struct ExecuteOptions {
    /// Kill the command once this much time has passed
    pub timeout: Duration,
    /// Kill the command as soon as this token is cancelled
    pub cancel: Option<CancellationToken>,
}

impl Default for ExecuteOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_EXECUTE_TIMEOUT,
            cancel: None,
        }
    }
}

impl ExecuteOptions {
    /// Options with a custom deadline
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout,
            ..Self::default()
        }
    }

    /// Attach a cancellation token
    pub fn cancel_on(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

/// Result of a completed one-shot command
#[derive(Debug, Clone)]
pub struct ExitResult {
    /// How the process exited
    pub status: ExitStatus,
    /// Captured standard output
    pub stdout: String,
    /// Captured standard error
    pub stderr: String,
}

impl ExitResult {
    /// Returns true if the command exited with code 0
    pub fn success(&self) -> bool {
        self.status.success()
    }
}

/// Run `command` to completion, capturing its output.
///
/// The child is killed if the deadline passes or the token is cancelled
/// first, so a hung command can never stall the caller forever.
pub async fn execute(command: &Command, options: ExecuteOptions) -> Result<ExitResult> {
    let mut cmd = command.to_async();
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let child = cmd
        .spawn()
        .map_err(|e| Error::spawn_failed(format!("`{}`: {}", command.display(), e)))?;
    debug!(pid = child.id(), command = %command.display(), "Executing command");

    let cancel = options.cancel.unwrap_or_default();
    let output = pin!(child.output());
    let cancelled = pin!(cancel.cancelled());

    // Dropping the output future drops the child, which kills it.
    match timeout(options.timeout, future::select(output, cancelled)).await {
        Ok(Either::Left((output, _))) => {
            let output = output?;
            Ok(ExitResult {
                status: output.status.into(),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            })
        }
        Ok(Either::Right(_)) => {
            debug!(command = %command.display(), "Command cancelled");
            Err(Error::Cancelled {
                command: command.display(),
            })
        }
        Err(elapsed) => {
            warn!(command = %command.display(), after = ?elapsed.0, "Command timed out");
            Err(Error::Timeout {
                command: command.display(),
                after: elapsed.0,
            })
        }
    }
}
