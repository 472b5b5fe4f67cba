//! Process handles, exit tracking and signal helpers

use crate::error::{Error, Result};
use crate::output::OutputBuffer;
use async_channel::{Receiver, Sender};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Process exit status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitStatus {
    /// Exit code if the process exited normally
    pub code: Option<i32>,
    /// Signal that terminated the process (Unix only)
    pub signal: Option<i32>,
}

impl ExitStatus {
    /// Returns true if the process exited successfully (code 0)
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Returns true if the process was terminated by a signal
    pub fn terminated_by_signal(&self) -> bool {
        self.signal.is_some()
    }

    /// Status recorded when the reaper could not observe the real one
    pub fn unknown() -> Self {
        Self {
            code: None,
            signal: None,
        }
    }
}

impl From<std::process::ExitStatus> for ExitStatus {
    fn from(status: std::process::ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;

        Self {
            code: status.code(),
            signal,
        }
    }
}

impl std::fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {code}"),
            (None, Some(signal)) => write!(f, "signal {signal}"),
            (None, None) => write!(f, "unknown exit status"),
        }
    }
}

#[derive(Debug)]
struct ExitCell {
    status: Mutex<Option<ExitStatus>>,
    done: Receiver<()>,
}

/// Shared view of a process's exit.
///
/// Cloneable; every clone resolves [`wait`](Self::wait) once the reaper
/// has recorded the status.
#[derive(Debug, Clone)]
pub struct ExitWatch {
    cell: Arc<ExitCell>,
}

/// Write side of an [`ExitWatch`], owned by the reaper task.
#[derive(Debug)]
pub(crate) struct ExitRecorder {
    cell: Arc<ExitCell>,
    done: Sender<()>,
}

impl ExitWatch {
    pub(crate) fn new() -> (Self, ExitRecorder) {
        let (tx, rx) = async_channel::bounded(1);
        let cell = Arc::new(ExitCell {
            status: Mutex::new(None),
            done: rx,
        });
        (
            Self { cell: cell.clone() },
            ExitRecorder { cell, done: tx },
        )
    }

    /// The exit status, if the process has already been reaped
    pub fn try_status(&self) -> Option<ExitStatus> {
        *self.cell.status.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Wait until the process has been reaped
    pub async fn wait(&self) -> ExitStatus {
        loop {
            if let Some(status) = self.try_status() {
                return status;
            }
            // Resolves with Err once the recorder closes the channel.
            if self.cell.done.recv().await.is_err() {
                return self.try_status().unwrap_or_else(ExitStatus::unknown);
            }
        }
    }
}

impl ExitRecorder {
    pub(crate) fn record(self, status: ExitStatus) {
        *self.cell.status.lock().unwrap_or_else(|e| e.into_inner()) = Some(status);
        self.done.close();
    }
}

/// Opaque runtime handle to one spawned service process.
///
/// Only the launcher that created it can stop it; everything else should
/// refer to the service by name.
#[derive(Debug)]
pub struct ServiceProcess {
    name: String,
    pid: u32,
    port: Option<u16>,
    started_at: DateTime<Utc>,
    ready: AtomicBool,
    output: OutputBuffer,
    exit: ExitWatch,
    kill_tx: Sender<()>,
}

impl ServiceProcess {
    pub(crate) fn new(
        name: String,
        pid: u32,
        port: Option<u16>,
        output: OutputBuffer,
        exit: ExitWatch,
        kill_tx: Sender<()>,
    ) -> Self {
        Self {
            name,
            pid,
            port,
            started_at: Utc::now(),
            ready: AtomicBool::new(false),
            output,
            exit,
            kill_tx,
        }
    }

    /// Service name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// OS process id
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Port assigned to the service, if any
    pub fn port(&self) -> Option<u16> {
        self.port
    }

    /// When the process was spawned
    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Whether the readiness gate has passed
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// Record that the process is confirmed started
    pub fn mark_ready(&self) {
        self.ready.store(true, Ordering::Release);
    }

    /// Captured output
    pub fn output(&self) -> &OutputBuffer {
        &self.output
    }

    /// A watch that resolves when the process exits
    pub fn exit_watch(&self) -> ExitWatch {
        self.exit.clone()
    }

    /// Exit status if the process has already exited
    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.exit.try_status()
    }

    /// Wait for the process to exit
    pub async fn wait(&self) -> ExitStatus {
        self.exit.wait().await
    }

    /// Ask the reaper to kill the child outright.
    pub(crate) fn request_kill(&self) {
        let _ = self.kill_tx.try_send(());
    }
}

/// Whether `pid` names a live process (signal 0 probe).
///
/// A zombie that has not been reaped yet still counts as alive.
#[cfg(unix)]
pub fn process_alive(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal;
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    if raw <= 0 {
        return false;
    }
    // EPERM means the process exists but belongs to someone else.
    matches!(signal::kill(Pid::from_raw(raw), None), Ok(()) | Err(Errno::EPERM))
}

/// Whether `pid` names a live process.
///
/// Without a portable probe, every pid is assumed alive.
#[cfg(not(unix))]
pub fn process_alive(_pid: u32) -> bool {
    true
}

#[cfg(unix)]
fn send_signal(pid: u32, sig: nix::sys::signal::Signal) -> Result<bool> {
    use nix::errno::Errno;
    use nix::sys::signal;
    use nix::unistd::Pid;

    let raw = i32::try_from(pid)
        .map_err(|_| Error::signal_failed(sig as i32, pid, "pid out of range"))?;
    match signal::kill(Pid::from_raw(raw), sig) {
        Ok(()) => Ok(true),
        Err(Errno::ESRCH) => Ok(false),
        Err(e) => Err(Error::signal_failed(sig as i32, pid, e.to_string())),
    }
}

/// Send SIGTERM. Returns `false` if the process no longer exists.
#[cfg(unix)]
pub fn terminate_pid(pid: u32) -> Result<bool> {
    send_signal(pid, nix::sys::signal::Signal::SIGTERM)
}

/// Send SIGKILL. Returns `false` if the process no longer exists.
#[cfg(unix)]
pub fn kill_pid(pid: u32) -> Result<bool> {
    send_signal(pid, nix::sys::signal::Signal::SIGKILL)
}

/// Send a graceful termination request.
#[cfg(not(unix))]
pub fn terminate_pid(_pid: u32) -> Result<bool> {
    Err(Error::Unsupported {
        operation: "terminate by pid",
    })
}

/// Forcefully kill a process by pid.
#[cfg(not(unix))]
pub fn kill_pid(_pid: u32) -> Result<bool> {
    Err(Error::Unsupported {
        operation: "kill by pid",
    })
}
