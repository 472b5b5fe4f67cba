//! Local process backend

use crate::command::Command;
use crate::error::{Error, Result};
use crate::event::LogSource;
use crate::launcher::Launcher;
use crate::output::{drain, OutputBuffer, DEFAULT_OUTPUT_CAPACITY};
use crate::process::{terminate_pid, ExitRecorder, ExitStatus, ExitWatch, ServiceProcess};
use async_channel::Receiver;
use async_process::{Child, Stdio};
use async_runtime_compat::runtime_utils::timeout;
use async_runtime_compat::Spawner;
use async_trait::async_trait;
use futures::{pin_mut, select, FutureExt};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// How long to wait for the reaper after SIGKILL before giving up
const KILL_WAIT: Duration = Duration::from_secs(5);

/// Launcher for processes on the local machine
#[derive(Clone)]
pub struct LocalLauncher {
    spawner: Arc<dyn Spawner>,
    output_capacity: usize,
}

impl LocalLauncher {
    /// Create a launcher whose drain and reaper tasks run on `spawner`
    pub fn new(spawner: Arc<dyn Spawner>) -> Self {
        Self {
            spawner,
            output_capacity: DEFAULT_OUTPUT_CAPACITY,
        }
    }

    /// Override how many output lines are retained per process
    pub fn with_output_capacity(mut self, lines: usize) -> Self {
        self.output_capacity = lines;
        self
    }
}

impl std::fmt::Debug for LocalLauncher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalLauncher")
            .field("runtime", &self.spawner.runtime_name())
            .field("output_capacity", &self.output_capacity)
            .finish()
    }
}

#[async_trait]
impl Launcher for LocalLauncher {
    async fn spawn(
        &self,
        name: &str,
        command: &Command,
        port: Option<u16>,
    ) -> Result<ServiceProcess> {
        let mut cmd = command.to_async();
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd.spawn().map_err(|e| {
            Error::spawn_failed(format!("{}: `{}`: {}", name, command.display(), e))
        })?;
        let pid = child.id();

        let output = OutputBuffer::new(self.output_capacity, 2);
        match child.stdout.take() {
            Some(stdout) => self.spawner.spawn(Box::pin(drain(
                name.to_string(),
                stdout,
                LogSource::Stdout,
                output.clone(),
            ))),
            None => output.close_stream(),
        }
        match child.stderr.take() {
            Some(stderr) => self.spawner.spawn(Box::pin(drain(
                name.to_string(),
                stderr,
                LogSource::Stderr,
                output.clone(),
            ))),
            None => output.close_stream(),
        }

        let (exit, recorder) = ExitWatch::new();
        let (kill_tx, kill_rx) = async_channel::bounded(1);
        self.spawner
            .spawn(Box::pin(reap(name.to_string(), child, kill_rx, recorder)));

        info!(service = %name, pid, command = %command.display(), "Spawned process");
        Ok(ServiceProcess::new(
            name.to_string(),
            pid,
            port,
            output,
            exit,
            kill_tx,
        ))
    }

    async fn stop(&self, process: &ServiceProcess, grace: Duration) -> Result<ExitStatus> {
        if let Some(status) = process.exit_status() {
            debug!(service = %process.name(), %status, "Process already exited");
            return Ok(status);
        }

        info!(service = %process.name(), pid = process.pid(), ?grace, "Stopping process");
        #[cfg(unix)]
        terminate_pid(process.pid())?;
        #[cfg(not(unix))]
        process.request_kill();

        if let Ok(status) = timeout(grace, process.wait()).await {
            info!(service = %process.name(), %status, "Process stopped");
            return Ok(status);
        }

        warn!(
            service = %process.name(),
            pid = process.pid(),
            "Process ignored graceful shutdown, killing"
        );
        process.request_kill();
        let status = timeout(KILL_WAIT, process.wait())
            .await
            .map_err(|_| Error::StopTimeout { pid: process.pid() })?;
        info!(service = %process.name(), %status, "Process killed");
        Ok(status)
    }
}

/// Own the child until it exits, killing it on request.
async fn reap(name: String, mut child: Child, kill_rx: Receiver<()>, recorder: ExitRecorder) {
    let pid = child.id();
    let mut kill_open = true;
    let result = loop {
        let kill_requested = {
            let exited = child.status().fuse();
            let kill = async {
                if kill_open {
                    kill_rx.recv().await.is_ok()
                } else {
                    futures::future::pending::<bool>().await
                }
            }
            .fuse();
            pin_mut!(exited, kill);
            select! {
                result = exited => break result,
                requested = kill => requested,
            }
        };
        if kill_requested {
            if let Err(e) = child.kill() {
                warn!(service = %name, pid, error = %e, "Failed to kill process");
            }
        } else {
            // The handle is gone; keep waiting for a natural exit.
            kill_open = false;
        }
    };

    let status = match result {
        Ok(status) => ExitStatus::from(status),
        Err(e) => {
            warn!(service = %name, pid, error = %e, "Failed to wait for process");
            ExitStatus::unknown()
        }
    };
    info!(service = %name, pid, %status, "Process exited");
    recorder.record(status);
}
