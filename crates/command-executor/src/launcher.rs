//! Launcher trait for spawning and stopping service processes

use crate::command::Command;
use crate::error::Result;
use crate::process::{ExitStatus, ServiceProcess};
use async_trait::async_trait;
use std::time::Duration;

/// Spawns long-running service processes and shuts them down.
#[async_trait]
pub trait Launcher: Send + Sync + 'static {
    /// Spawn `command` for service `name` without waiting for it.
    ///
    /// Output draining must already be running when this returns.
    async fn spawn(&self, name: &str, command: &Command, port: Option<u16>)
        -> Result<ServiceProcess>;

    /// Request graceful shutdown, wait up to `grace`, then force-kill.
    ///
    /// Returns the final exit status. Stopping an already-exited process
    /// just returns its recorded status.
    async fn stop(&self, process: &ServiceProcess, grace: Duration) -> Result<ExitStatus>;
}
