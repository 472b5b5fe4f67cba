//! Error types for process management

use std::time::Duration;
use thiserror::Error;

/// Unified error type for process management
#[derive(Error, Debug)]
pub enum Error {
    /// Failed to spawn a process
    #[error("failed to spawn process: {reason}")]
    SpawnFailed {
        /// The reason for the spawn failure
        reason: String,
    },

    /// Failed to send signal to process
    #[error("failed to send signal {signal} to pid {pid}: {reason}")]
    SignalFailed {
        /// The signal number that failed to send
        signal: i32,
        /// Target process
        pid: u32,
        /// The reason for the signal failure
        reason: String,
    },

    /// The process survived SIGKILL for longer than we are willing to wait
    #[error("process {pid} did not exit after being killed")]
    StopTimeout {
        /// Process that refused to die
        pid: u32,
    },

    /// A one-shot command exceeded its hard deadline and was killed
    #[error("command `{command}` timed out after {after:?}")]
    Timeout {
        /// Rendered command line
        command: String,
        /// The deadline that elapsed
        after: Duration,
    },

    /// A one-shot command was cancelled by its caller and was killed
    #[error("command `{command}` was cancelled")]
    Cancelled {
        /// Rendered command line
        command: String,
    },

    /// Operation not available on this platform
    #[error("{operation} is not supported on this platform")]
    Unsupported {
        /// Name of the unsupported operation
        operation: &'static str,
    },

    /// I/O error
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a spawn failed error
    pub fn spawn_failed(reason: impl Into<String>) -> Self {
        Self::SpawnFailed {
            reason: reason.into(),
        }
    }

    /// Create a signal failed error
    pub fn signal_failed(signal: i32, pid: u32, reason: impl Into<String>) -> Self {
        Self::SignalFailed {
            signal,
            pid,
            reason: reason.into(),
        }
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
