//! Dependency-ordered service startup and shutdown
//!
//! [`ProcessOrchestrator::start`] builds a [`DependencyGraph`] from the
//! descriptors' `uses` edges (rejecting cycles before anything is spawned)
//! and starts one wave at a time. Services inside a wave start
//! concurrently, each one registered as `starting` before its process is
//! spawned and flipped to `running` once its readiness gate passes. If any
//! service in a wave fails, everything this call started is stopped again
//! in reverse order.

use crate::config::{HealthCheckConfig, ServiceDescriptor};
use crate::context::OrchestrationContext;
use crate::graph::DependencyGraph;
use crate::health::HealthMonitor;
use crate::readiness;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use command_executor::{ExitStatus, OutputLine, ServiceProcess};
use futures::stream::{self, StreamExt};
use indexmap::IndexMap;
use regex::Regex;
use service_registry::{HealthState, ServiceEntry, ServiceStatus};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Default bound on services started at once within a wave
pub const DEFAULT_MAX_PARALLEL: usize = 8;

/// A service that made it through spawn and readiness
#[derive(Debug, Clone, PartialEq)]
pub struct StartedService {
    /// Service name
    pub name: String,
    /// OS process id
    pub pid: u32,
    /// Primary port
    pub port: Option<u16>,
    /// When the process was spawned
    pub started_at: DateTime<Utc>,
}

/// Result of a best-effort start
#[derive(Debug, Default)]
pub struct StartOutcome {
    /// Services that started, in start order
    pub started: Vec<StartedService>,
    /// Failure message per service that did not start
    pub failed: BTreeMap<String, String>,
}

struct Tracked {
    process: Arc<ServiceProcess>,
    stopping: Arc<AtomicBool>,
    grace: Duration,
}

/// Starts, tracks and stops service processes
pub struct ProcessOrchestrator {
    context: OrchestrationContext,
    /// Owned processes in start order
    processes: Mutex<IndexMap<String, Tracked>>,
    monitor: Option<Arc<HealthMonitor>>,
    max_parallel: usize,
}

impl ProcessOrchestrator {
    /// Create an orchestrator
    pub fn new(context: OrchestrationContext) -> Self {
        Self {
            context,
            processes: Mutex::new(IndexMap::new()),
            monitor: None,
            max_parallel: DEFAULT_MAX_PARALLEL,
        }
    }

    /// Register started services' health checks with `monitor`, and cancel
    /// their probes when they are stopped.
    pub fn with_monitor(mut self, monitor: Arc<HealthMonitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    /// Bound concurrent starts within a wave
    pub fn with_max_parallel(mut self, max_parallel: usize) -> Self {
        self.max_parallel = max_parallel.max(1);
        self
    }

    /// The context
    pub fn context(&self) -> &OrchestrationContext {
        &self.context
    }

    fn processes(&self) -> MutexGuard<'_, IndexMap<String, Tracked>> {
        self.processes.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Names of services this orchestrator owns a process for, in start order
    pub fn running(&self) -> Vec<String> {
        self.processes().keys().cloned().collect()
    }

    /// The last `n` output lines of a service
    pub fn output_tail(&self, name: &str, n: usize) -> Option<Vec<OutputLine>> {
        self.processes()
            .get(name)
            .map(|t| t.process.output().tail(n))
    }

    /// Start all `descriptors` or none of them.
    ///
    /// On any failure every service started by this call is stopped and
    /// unregistered, and [`Error::StartupFailed`] lists what went wrong per
    /// service.
    pub async fn start(
        &self,
        descriptors: &[ServiceDescriptor],
        shared_env: &BTreeMap<String, String>,
    ) -> Result<Vec<StartedService>> {
        let outcome = self.run(descriptors, shared_env, true).await?;
        Ok(outcome.started)
    }

    /// Start as much as possible. Failed services stay in `error`, and
    /// services that use them are skipped.
    pub async fn start_best_effort(
        &self,
        descriptors: &[ServiceDescriptor],
        shared_env: &BTreeMap<String, String>,
    ) -> Result<StartOutcome> {
        self.run(descriptors, shared_env, false).await
    }

    async fn run(
        &self,
        descriptors: &[ServiceDescriptor],
        shared_env: &BTreeMap<String, String>,
        rollback: bool,
    ) -> Result<StartOutcome> {
        for descriptor in descriptors {
            descriptor.validate()?;
        }

        let owned: HashSet<String> = self.running().into_iter().collect();
        let mut satisfied: HashSet<String> = self
            .context
            .registry
            .list()
            .await
            .into_iter()
            .filter(|e| e.status == ServiceStatus::Running)
            .map(|e| e.name)
            .collect();
        satisfied.extend(owned.iter().cloned());

        let pending: Vec<ServiceDescriptor> = descriptors
            .iter()
            .filter(|d| {
                let already = owned.contains(&d.name);
                if already {
                    info!(service = %d.name, "Already running, skipping");
                }
                !already
            })
            .cloned()
            .collect();

        let graph = DependencyGraph::new(&pending, &satisfied)?;
        let by_name: HashMap<&str, &ServiceDescriptor> =
            pending.iter().map(|d| (d.name.as_str(), d)).collect();
        let mut patterns: HashMap<&str, Regex> = HashMap::new();
        for d in &pending {
            if let Some(pattern) = &d.ready.pattern {
                let re = Regex::new(pattern).map_err(|e| {
                    Error::Config(format!("{}: invalid ready.pattern: {e}", d.name))
                })?;
                patterns.insert(d.name.as_str(), re);
            }
        }
        let mut checks: HashMap<&str, HealthCheckConfig> = HashMap::new();
        if let Some(monitor) = &self.monitor {
            for d in &pending {
                checks.insert(d.name.as_str(), monitor.resolve(d)?);
            }
        }

        let waves = graph.waves();
        info!(services = pending.len(), waves = waves.len(), "Starting services");

        let mut outcome = StartOutcome::default();
        for (index, wave) in waves.into_iter().enumerate() {
            let mut runnable = Vec::new();
            for name in wave {
                match graph
                    .dependencies(&name)
                    .iter()
                    .find(|dep| outcome.failed.contains_key(*dep))
                {
                    Some(dep) => {
                        warn!(service = %name, dependency = %dep, "Skipping service, dependency failed");
                        let msg = format!("dependency '{dep}' failed to start");
                        outcome.failed.insert(name, msg);
                    }
                    None => runnable.push(name),
                }
            }
            debug!(wave = index, services = ?runnable, "Starting wave");

            let results: Vec<(String, Result<StartedService>)> = stream::iter(runnable)
                .map(|name| {
                    let descriptor = by_name.get(name.as_str()).copied();
                    let pattern = patterns.get(name.as_str());
                    let check = checks.get(name.as_str()).cloned();
                    async move {
                        let result = match descriptor {
                            Some(d) => self.start_one(d, shared_env, pattern, check).await,
                            None => Err(Error::ServiceNotFound(name.clone())),
                        };
                        (name, result)
                    }
                })
                .buffer_unordered(self.max_parallel)
                .collect()
                .await;

            let mut wave_failed = false;
            for (name, result) in results {
                match result {
                    Ok(started) => outcome.started.push(started),
                    Err(e) => {
                        error!(service = %name, error = %e, "Service failed to start");
                        outcome.failed.insert(name, e.to_string());
                        wave_failed = true;
                    }
                }
            }

            if wave_failed && rollback {
                let rolled_back = self.roll_back(&outcome.started).await;
                return Err(Error::StartupFailed {
                    errors: outcome.failed,
                    rolled_back,
                });
            }
        }

        info!(
            started = outcome.started.len(),
            failed = outcome.failed.len(),
            "Startup finished"
        );
        Ok(outcome)
    }

    async fn roll_back(&self, started: &[StartedService]) -> Vec<String> {
        let mut rolled_back = Vec::new();
        for service in started.iter().rev() {
            warn!(service = %service.name, "Rolling back");
            match self.stop_service(&service.name).await {
                Ok(_) => rolled_back.push(service.name.clone()),
                Err(e) => error!(service = %service.name, error = %e, "Rollback stop failed"),
            }
        }
        rolled_back
    }

    /// Register, spawn, gate on readiness, then mark running.
    async fn start_one(
        &self,
        descriptor: &ServiceDescriptor,
        shared_env: &BTreeMap<String, String>,
        pattern: Option<&Regex>,
        check: Option<HealthCheckConfig>,
    ) -> Result<StartedService> {
        let name = descriptor.name.as_str();
        let registry = &self.context.registry;

        let mut entry = ServiceEntry::starting(name)
            .with_tags(descriptor.language.clone(), descriptor.framework.clone());
        if let Some(port) = descriptor.primary_port() {
            entry = entry.with_port(port);
        }
        registry.register(entry).await?;

        let command = descriptor.to_command(shared_env);
        let process = match self
            .context
            .launcher
            .spawn(name, &command, descriptor.primary_port())
            .await
        {
            Ok(process) => Arc::new(process),
            Err(source) => {
                if let Err(e) = registry
                    .record_exit(name, ServiceStatus::Error, None, Some(source.to_string()))
                    .await
                {
                    warn!(service = %name, error = %e, "Failed to record spawn failure");
                }
                return Err(Error::Spawn {
                    service: name.to_string(),
                    source,
                });
            }
        };

        if let Err(e) = self.promote(descriptor, &process, pattern).await {
            if process.exit_status().is_none() {
                if let Err(stop_err) = self
                    .context
                    .launcher
                    .stop(&process, descriptor.stop_grace)
                    .await
                {
                    warn!(service = %name, error = %stop_err, "Failed to stop unready process");
                }
            }
            let code = process.exit_status().and_then(|s| s.code);
            if let Err(record_err) = registry
                .record_exit(name, ServiceStatus::Error, code, Some(e.to_string()))
                .await
            {
                warn!(service = %name, error = %record_err, "Failed to record startup failure");
            }
            return Err(e);
        }

        let stopping = Arc::new(AtomicBool::new(false));
        self.processes().insert(
            name.to_string(),
            Tracked {
                process: process.clone(),
                stopping: stopping.clone(),
                grace: descriptor.stop_grace,
            },
        );
        self.watch_exit(name.to_string(), process.clone(), stopping);

        if let (Some(monitor), Some(check)) = (&self.monitor, check) {
            monitor.install(name, check);
        }

        info!(service = %name, pid = process.pid(), "Service running");
        Ok(StartedService {
            name: name.to_string(),
            pid: process.pid(),
            port: process.port(),
            started_at: process.started_at(),
        })
    }

    async fn promote(
        &self,
        descriptor: &ServiceDescriptor,
        process: &ServiceProcess,
        pattern: Option<&Regex>,
    ) -> Result<()> {
        let name = descriptor.name.as_str();
        let (pid, started_at) = (process.pid(), process.started_at());
        self.context
            .registry
            .update(name, |entry| {
                entry.pid = Some(pid);
                entry.start_time = Some(started_at);
            })
            .await?;

        readiness::wait_ready(process, &descriptor.ready, pattern)
            .await
            .map_err(|reason| Error::Readiness {
                service: name.to_string(),
                reason,
            })?;

        process.mark_ready();
        self.context
            .registry
            .update_status(name, ServiceStatus::Running, Some(HealthState::Unknown))
            .await?;
        Ok(())
    }

    /// Flip the registry entry to `error` if the process dies on its own.
    fn watch_exit(&self, name: String, process: Arc<ServiceProcess>, stopping: Arc<AtomicBool>) {
        let registry = self.context.registry.clone();
        self.context.spawner.spawn(Box::pin(async move {
            let status = process.wait().await;
            if stopping.load(Ordering::Acquire) {
                return;
            }
            warn!(service = %name, %status, "Service exited unexpectedly");
            if let Err(e) = registry
                .record_exit(
                    &name,
                    ServiceStatus::Error,
                    status.code,
                    Some(format!("process exited ({status})")),
                )
                .await
            {
                debug!(service = %name, error = %e, "Exit not recorded");
            }
        }));
    }

    /// Stop one service this orchestrator started and remove its entry.
    ///
    /// Outstanding health probes for it are cancelled first.
    pub async fn stop_service(&self, name: &str) -> Result<ExitStatus> {
        if let Some(monitor) = &self.monitor {
            monitor.remove_target(name);
        }
        let tracked = self
            .processes()
            .shift_remove(name)
            .ok_or_else(|| Error::ServiceNotFound(name.to_string()))?;
        tracked.stopping.store(true, Ordering::Release);

        let registry = &self.context.registry;
        if let Err(e) = registry
            .update_status(name, ServiceStatus::Stopping, None)
            .await
        {
            debug!(service = %name, error = %e, "Could not mark stopping");
        }

        let status = match self
            .context
            .launcher
            .stop(&tracked.process, tracked.grace)
            .await
        {
            Ok(status) => status,
            Err(e) => {
                if let Err(record_err) = registry
                    .record_exit(name, ServiceStatus::Error, None, Some(e.to_string()))
                    .await
                {
                    debug!(service = %name, error = %record_err, "Stop failure not recorded");
                }
                return Err(e.into());
            }
        };

        if let Err(e) = registry
            .record_exit(name, ServiceStatus::Stopped, status.code, None)
            .await
        {
            debug!(service = %name, error = %e, "Exit not recorded");
        }
        registry.unregister(name).await?;
        info!(service = %name, %status, "Service stopped");
        Ok(status)
    }

    /// Stop every owned service in reverse start order. Returns the names
    /// that stopped cleanly.
    pub async fn stop_all(&self) -> Vec<String> {
        let names: Vec<String> = self.running().into_iter().rev().collect();
        let mut stopped = Vec::with_capacity(names.len());
        for name in names {
            match self.stop_service(&name).await {
                Ok(_) => stopped.push(name),
                Err(e) => error!(service = %name, error = %e, "Failed to stop service"),
            }
        }
        stopped
    }
}

impl std::fmt::Debug for ProcessOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessOrchestrator")
            .field("context", &self.context)
            .field("running", &self.running())
            .field("max_parallel", &self.max_parallel)
            .finish_non_exhaustive()
    }
}
