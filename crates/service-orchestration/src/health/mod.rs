//! Health monitoring engine
//!
//! Every check of a service goes through the same gates, in order:
//!
//! 1. services in `error` are reported `unhealthy` and other services that
//!    are not `starting`/`running` are reported `unknown`, both without
//!    probing, as are services with no registered target;
//! 2. a fresh cached result (same config hash, inside TTL) is returned
//!    without I/O;
//! 3. an open circuit breaker returns the last known result tagged
//!    [`SkipReason::CircuitOpen`];
//! 4. an empty rate-limit bucket returns the last known result tagged
//!    [`SkipReason::RateLimited`], deferring the probe to the next tick;
//! 5. the strategy cascade probes the service, racing the target's
//!    cancellation token.
//!
//! Failures inside the startup grace period are reported as `starting` and
//! are not counted by the breaker. Outside it, `retries` consecutive
//! failures are needed before the reported health turns `unhealthy`.

mod circuit;
mod metrics;
mod rate_limit;
mod report;
mod strategy;

pub use circuit::{Admission, CircuitBreaker, CircuitState};
pub use metrics::{HealthMetrics, LATENCY_BUCKETS, LatencyHistogram, ServiceMetrics};
pub use rate_limit::TokenBucket;
pub use report::{HealthCheckResult, HealthReport, HealthSummary, SkipReason};
pub use strategy::{
    Cascade, CheckStrategy, CommandStrategy, DISCOVERY_PATHS, HttpStrategy, MAX_BODY_BYTES,
    ProbeError, ProbeOutcome, ProbeTarget, ProcessStrategy, TcpStrategy, status_from_body,
};

use crate::config::{HealthCheckConfig, ServiceDescriptor};
use crate::context::OrchestrationContext;
use crate::Result;
use async_runtime_compat::runtime_utils::sleep;
use async_runtime_compat::{CancellationToken, Spawner};
use chrono::Utc;
use futures::future::{Either, select};
use futures::stream::{self, StreamExt};
use service_registry::{CacheManager, HealthState, Registry, ServiceEntry, ServiceStatus, hash_of};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Circuit breaker settings
#[derive(Debug, Clone, PartialEq)]
pub struct BreakerConfig {
    /// Consecutive failures that open the circuit
    pub failure_threshold: u32,
    /// How long the circuit stays open before a trial probe
    pub cooldown: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(60),
        }
    }
}

/// Token bucket settings
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitConfig {
    /// Burst size
    pub capacity: u32,
    /// Tokens added per second
    pub refill_per_sec: f64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            capacity: 5,
            refill_per_sec: 1.0,
        }
    }
}

/// Monitor-wide settings
#[derive(Debug, Clone, PartialEq)]
pub struct MonitorConfig {
    /// Probe timeout for services without their own health-check block
    pub default_timeout: Duration,
    /// Endpoint for services without their own health-check block;
    /// `None` means auto-discovery
    pub default_endpoint: Option<String>,
    /// Circuit breaker settings
    pub breaker: BreakerConfig,
    /// Per-service rate limit; `None` disables limiting
    pub rate_limit: Option<RateLimitConfig>,
    /// How long a result is served from cache; zero disables caching
    pub cache_ttl: Duration,
    /// Bound on services probed at once
    pub max_concurrent_checks: usize,
    /// Host that ports are probed on
    pub host: String,
    /// Re-read the registry file before each evaluation, for monitors
    /// running in a different process than the orchestrator
    pub follow_registry: bool,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(5),
            default_endpoint: None,
            breaker: BreakerConfig::default(),
            rate_limit: Some(RateLimitConfig::default()),
            cache_ttl: Duration::from_secs(1),
            max_concurrent_checks: 10,
            host: "127.0.0.1".to_string(),
            follow_registry: false,
        }
    }
}

#[derive(Debug, Default)]
struct TargetState {
    last: Option<HealthCheckResult>,
    failure_streak: u32,
}

/// Monitoring state for one service
#[derive(Debug)]
struct Target {
    config: HealthCheckConfig,
    hash: String,
    breaker: Mutex<CircuitBreaker>,
    limiter: Option<Mutex<TokenBucket>>,
    state: Mutex<TargetState>,
    cancel: CancellationToken,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl Target {
    fn new(name: &str, config: HealthCheckConfig, monitor: &MonitorConfig) -> Self {
        Self {
            hash: hash_of(&config),
            breaker: Mutex::new(CircuitBreaker::new(
                name,
                monitor.breaker.failure_threshold,
                monitor.breaker.cooldown,
            )),
            limiter: monitor
                .rate_limit
                .as_ref()
                .map(|rl| Mutex::new(TokenBucket::new(rl.capacity, rl.refill_per_sec))),
            state: Mutex::new(TargetState::default()),
            cancel: CancellationToken::new(),
            config,
        }
    }

    /// Last known result, or one derived from the registry entry
    fn last_known(&self, entry: &ServiceEntry) -> HealthCheckResult {
        lock(&self.state).last.clone().unwrap_or_else(|| {
            let mut result = HealthCheckResult::new(&entry.name, entry.health);
            result.port = entry.port;
            result.pid = entry.pid;
            result
        })
    }
}

/// Result for a service that was not probed
fn unprobed(entry: &ServiceEntry, status: HealthState, error: impl Into<String>) -> HealthCheckResult {
    let mut result = HealthCheckResult::new(&entry.name, status).with_error(error);
    result.port = entry.port;
    result.pid = entry.pid;
    result
}

/// Resolve to `None` if `token` fires before `fut` completes
async fn unless_cancelled<F: Future>(token: &CancellationToken, fut: F) -> Option<F::Output> {
    match select(Box::pin(fut), Box::pin(token.cancelled())).await {
        Either::Left((output, _)) => Some(output),
        Either::Right(_) => None,
    }
}

/// Probes registered services and records their health
pub struct HealthMonitor {
    config: MonitorConfig,
    registry: Arc<Registry>,
    spawner: Arc<dyn Spawner>,
    cache: Arc<CacheManager>,
    metrics: Arc<HealthMetrics>,
    cascade: Cascade,
    targets: Mutex<HashMap<String, Arc<Target>>>,
}

impl HealthMonitor {
    /// Monitor the services in `context`'s registry with an in-memory cache
    pub fn new(context: &OrchestrationContext, config: MonitorConfig) -> Self {
        Self {
            config,
            registry: context.registry.clone(),
            spawner: context.spawner.clone(),
            cache: Arc::new(CacheManager::in_memory()),
            metrics: Arc::new(HealthMetrics::new()),
            cascade: Cascade::standard(),
            targets: Mutex::new(HashMap::new()),
        }
    }

    /// Use a shared (possibly file-backed) cache
    pub fn with_cache(mut self, cache: Arc<CacheManager>) -> Self {
        self.cache = cache;
        self
    }

    /// Replace the strategy chain
    pub fn with_cascade(mut self, cascade: Cascade) -> Self {
        self.cascade = cascade;
        self
    }

    /// Monitor settings
    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    /// Collected metrics
    pub fn metrics(&self) -> Arc<HealthMetrics> {
        self.metrics.clone()
    }

    /// Circuit state of a service that has been checked or registered
    pub fn breaker_state(&self, name: &str) -> Option<CircuitState> {
        let target = self.target(name)?;
        let state = lock(&target.breaker).state();
        Some(state)
    }

    fn default_check(&self) -> HealthCheckConfig {
        HealthCheckConfig {
            endpoint: self.config.default_endpoint.clone(),
            timeout: self.config.default_timeout,
            ..HealthCheckConfig::default()
        }
    }

    pub(crate) fn install(&self, name: &str, config: HealthCheckConfig) {
        let mut targets = lock(&self.targets);
        let hash = hash_of(&config);
        if targets.get(name).is_some_and(|t| t.hash == hash) {
            return;
        }
        debug!(service = %name, "Registered health check");
        if let Some(old) = targets.insert(
            name.to_string(),
            Arc::new(Target::new(name, config, &self.config)),
        ) {
            old.cancel.cancel();
        }
    }

    /// Register a health-check configuration for `name`.
    ///
    /// Invalid configurations are rejected with [`Error::Config`](crate::Error::Config).
    pub async fn register(&self, name: &str, config: HealthCheckConfig) -> Result<()> {
        let port = self.registry.get(name).await.and_then(|e| e.port);
        config.validate(name, port)?;
        self.install(name, config);
        Ok(())
    }

    /// Register a descriptor's health check, or the monitor default if it
    /// has none
    pub fn register_descriptor(&self, descriptor: &ServiceDescriptor) -> Result<()> {
        let config = self.resolve(descriptor)?;
        self.install(&descriptor.name, config);
        Ok(())
    }

    /// The validated check `descriptor` would be monitored with
    pub(crate) fn resolve(&self, descriptor: &ServiceDescriptor) -> Result<HealthCheckConfig> {
        let config = descriptor
            .health_check
            .clone()
            .unwrap_or_else(|| self.default_check());
        config.validate(&descriptor.name, descriptor.primary_port())?;
        Ok(config)
    }

    /// Monitor `name` with the default check unless it already has one
    pub fn register_default(&self, name: &str) {
        lock(&self.targets).entry(name.to_string()).or_insert_with(|| {
            debug!(service = %name, "Registered default health check");
            Arc::new(Target::new(name, self.default_check(), &self.config))
        });
    }

    /// Forget a service, cancelling any probe in flight for it
    pub fn remove_target(&self, name: &str) {
        if let Some(target) = lock(&self.targets).remove(name) {
            target.cancel.cancel();
            debug!(service = %name, "Health target removed");
        }
    }

    fn target(&self, name: &str) -> Option<Arc<Target>> {
        lock(&self.targets).get(name).cloned()
    }

    fn note(&self, name: &str, transition: Option<circuit::Transition>) {
        if let Some((from, to)) = transition {
            self.metrics.record_transition(name, from, to);
        }
    }

    fn skip(&self, target: &Target, entry: &ServiceEntry, reason: SkipReason) -> HealthCheckResult {
        self.metrics.record_skip(&entry.name, reason);
        target.last_known(entry).skipped(reason)
    }

    /// Check one service now
    pub async fn check_service(&self, name: &str) -> HealthCheckResult {
        let Some(entry) = self.registry.peek(name) else {
            return HealthCheckResult::new(name, HealthState::Unknown)
                .with_error("service is not registered");
        };
        match entry.status {
            ServiceStatus::Starting | ServiceStatus::Running => {}
            ServiceStatus::Error => {
                let error = entry.error.clone().unwrap_or_else(|| match entry.exit_code {
                    Some(code) => format!("process exited with code {code}"),
                    None => "process exited".to_string(),
                });
                return unprobed(&entry, HealthState::Unhealthy, error);
            }
            status => {
                return unprobed(&entry, HealthState::Unknown, format!("service is {status}"));
            }
        }
        let Some(target) = self.target(name) else {
            return unprobed(&entry, HealthState::Unknown, "no health check registered");
        };

        let cache_key = format!("health:{name}");
        if let Some(mut cached) = self
            .cache
            .get_as::<HealthCheckResult>(&cache_key, Some(&target.hash))
        {
            self.metrics.record_cache_hit(name);
            cached.cached = true;
            return cached;
        }

        let now = Instant::now();
        let (admission, transition) = lock(&target.breaker).admit_at(now);
        self.note(name, transition);
        if admission == Admission::Reject {
            debug!(service = %name, "Circuit open, skipping probe");
            return self.skip(&target, &entry, SkipReason::CircuitOpen);
        }

        if let Some(limiter) = &target.limiter {
            if !lock(limiter).try_acquire_at(now) {
                if admission == Admission::Trial {
                    lock(&target.breaker).release_trial();
                }
                debug!(service = %name, "Rate limited, deferring probe");
                return self.skip(&target, &entry, SkipReason::RateLimited);
            }
        }

        let probe = ProbeTarget {
            service: name.to_string(),
            host: self.config.host.clone(),
            port: target.config.port.or(entry.port),
            pid: entry.pid,
            config: target.config.clone(),
        };
        let Some(outcome) = unless_cancelled(&target.cancel, self.cascade.run(&probe))
            .await
            .filter(|_| !target.cancel.is_cancelled())
        else {
            lock(&target.breaker).release_trial();
            debug!(service = %name, "Probe cancelled");
            return self.skip(&target, &entry, SkipReason::Cancelled);
        };

        self.evaluate(name, &target, &entry, outcome).await
    }

    async fn evaluate(
        &self,
        name: &str,
        target: &Target,
        entry: &ServiceEntry,
        outcome: Option<ProbeOutcome>,
    ) -> HealthCheckResult {
        let Some(outcome) = outcome else {
            lock(&target.breaker).release_trial();
            let result = unprobed(entry, HealthState::Unknown, "no applicable health check");
            lock(&target.state).last = Some(result.clone());
            return result;
        };
        self.metrics
            .record_probe(name, outcome.status, outcome.response_time);

        let in_grace = !target.config.start_period.is_zero()
            && entry.start_time.is_some_and(|started| {
                let grace = chrono::Duration::from_std(target.config.start_period)
                    .unwrap_or(chrono::Duration::MAX);
                Utc::now().signed_duration_since(started) < grace
            });

        let previous = lock(&target.state).last.as_ref().map(|r| r.status);
        let status = match outcome.status {
            HealthState::Healthy | HealthState::Degraded => {
                let transition = lock(&target.breaker).record_success_at(Instant::now());
                self.note(name, transition);
                lock(&target.state).failure_streak = 0;
                outcome.status
            }
            _ if in_grace => {
                lock(&target.breaker).release_trial();
                HealthState::Starting
            }
            _ => {
                let transition = lock(&target.breaker).record_failure_at(Instant::now());
                self.note(name, transition);
                let streak = {
                    let mut state = lock(&target.state);
                    state.failure_streak += 1;
                    state.failure_streak
                };
                if streak >= target.config.retries.max(1) {
                    HealthState::Unhealthy
                } else {
                    match previous {
                        Some(s @ (HealthState::Healthy | HealthState::Degraded)) => s,
                        _ => HealthState::Starting,
                    }
                }
            }
        };

        let result = HealthCheckResult {
            service_name: name.to_string(),
            status,
            check_type: Some(outcome.check_type),
            endpoint: outcome.endpoint,
            status_code: outcome.status_code,
            response_time_ms: u64::try_from(outcome.response_time.as_millis()).unwrap_or(u64::MAX),
            error: outcome.error.map(|e| e.to_string()),
            timestamp: Utc::now(),
            port: entry.port,
            pid: entry.pid,
            skipped: None,
            cached: false,
            details: outcome.details,
        };

        if previous.is_some_and(|p| p != status) {
            info!(service = %name, from = ?previous, to = %status, "Health changed");
        }
        lock(&target.state).last = Some(result.clone());

        if target.cancel.is_cancelled() {
            return result.skipped(SkipReason::Cancelled);
        }
        if let Err(e) = self
            .registry
            .update_health(name, status, result.timestamp, result.error.clone())
            .await
        {
            debug!(service = %name, error = %e, "Health not recorded in registry");
        }
        if !self.config.cache_ttl.is_zero() {
            if let Err(e) = self
                .cache
                .set_as(
                    format!("health:{name}"),
                    &result,
                    self.config.cache_ttl,
                    Some(target.hash.clone()),
                )
                .await
            {
                warn!(service = %name, error = %e, "Failed to cache health result");
            }
        }
        result
    }

    /// Check `targets` (every registered service when empty) once, with
    /// bounded concurrency
    pub async fn check_once(&self, targets: &[String]) -> HealthReport {
        if self.config.follow_registry {
            if let Err(e) = self.registry.reload().await {
                warn!(error = %e, "Failed to reload registry");
            }
            for name in self.registry.names() {
                self.register_default(&name);
            }
        }
        let names: Vec<String> = if targets.is_empty() {
            self.registry.names()
        } else {
            targets.to_vec()
        };

        let results: Vec<HealthCheckResult> = stream::iter(names)
            .map(|name| async move { self.check_service(&name).await })
            .buffer_unordered(self.config.max_concurrent_checks.max(1))
            .collect()
            .await;
        HealthReport::new(results)
    }

    /// Evaluate `targets` every `interval` until the returned token is
    /// cancelled or the receiver is dropped.
    pub fn stream(
        self: &Arc<Self>,
        targets: Vec<String>,
        interval: Duration,
    ) -> (async_channel::Receiver<HealthReport>, CancellationToken) {
        let (tx, rx) = async_channel::bounded(16);
        let token = CancellationToken::new();
        let cancel = token.clone();
        let monitor = self.clone();

        self.spawner.spawn(Box::pin(async move {
            info!(?interval, targets = ?targets, "Health stream started");
            loop {
                let Some(report) = unless_cancelled(&cancel, monitor.check_once(&targets)).await
                else {
                    break;
                };
                match unless_cancelled(&cancel, tx.send(report)).await {
                    Some(Ok(())) => {}
                    Some(Err(_)) | None => break,
                }
                if unless_cancelled(&cancel, sleep(interval)).await.is_none() {
                    break;
                }
            }
            info!("Health stream stopped");
        }));

        (rx, token)
    }
}

impl std::fmt::Debug for HealthMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthMonitor")
            .field("config", &self.config)
            .field("cascade", &self.cascade)
            .field("targets", &lock(&self.targets).len())
            .finish_non_exhaustive()
    }
}
