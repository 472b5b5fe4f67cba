//! # Service orchestration
//!
//! Starts a set of local services in dependency order and keeps watching
//! whether they are healthy.
//!
//! - [`ProcessOrchestrator`] turns [`ServiceDescriptor`]s into running
//!   processes, one wave of independent services at a time, registering each
//!   in the shared [`Registry`](service_registry::Registry) before it spawns
//!   and rolling the whole start back if any service fails.
//! - [`HealthMonitor`] probes every registered service with an ordered
//!   cascade of strategies (HTTP, then TCP, then process liveness), guarded
//!   per service by a circuit breaker and a token-bucket rate limiter, and
//!   writes results back to the registry and a TTL cache.
//!
//! ## Example
//!
//! ```no_run
//! use service_orchestration::{OrchestrationContext, ProcessOrchestrator, StackConfig};
//! use std::sync::Arc;
//!
//! # async fn example(spawner: Arc<dyn async_runtime_compat::Spawner>) -> service_orchestration::Result<()> {
//! let stack = StackConfig::load("devstack.yaml").await?;
//! let registry = Arc::new(service_registry::Registry::for_project(".").await?);
//! let context = OrchestrationContext::new(spawner, registry);
//! let orchestrator = ProcessOrchestrator::new(context);
//!
//! let started = orchestrator.start(&stack.descriptors(), &stack.env).await?;
//! println!("started {}", started.len());
//! orchestrator.stop_all().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
mod context;
mod graph;
pub mod health;
mod orchestrator;
mod readiness;

use std::collections::BTreeMap;

pub use config::{
    CheckType, HealthCheckConfig, ReadinessConfig, ServiceDescriptor, StackConfig,
    parse_duration,
};
pub use context::OrchestrationContext;
pub use graph::DependencyGraph;
pub use health::{
    BreakerConfig, CircuitState, HealthCheckResult, HealthMetrics, HealthMonitor, HealthReport,
    HealthSummary, MonitorConfig, ProbeError, RateLimitConfig, SkipReason,
};
pub use orchestrator::{ProcessOrchestrator, StartOutcome, StartedService};

/// Error types for orchestration operations
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The `uses` edges form a cycle; nothing was started
    #[error("Dependency cycle: {}", cycle.join(" -> "))]
    DependencyCycle {
        /// Services on the cycle, first one repeated at the end
        cycle: Vec<String>,
    },

    /// A service depends on something that is neither being started nor running
    #[error("Service '{service}' uses unknown service '{dependency}'")]
    UnknownDependency {
        /// Dependent service
        service: String,
        /// Missing dependency
        dependency: String,
    },

    /// Two descriptors share a name
    #[error("Duplicate service name: {0}")]
    DuplicateService(String),

    /// The process could not be spawned
    #[error("Failed to spawn '{service}': {source}")]
    Spawn {
        /// Service that failed
        service: String,
        /// Launcher error
        #[source]
        source: command_executor::Error,
    },

    /// The process spawned but never became ready
    #[error("Service '{service}' did not become ready: {reason}")]
    Readiness {
        /// Service that failed
        service: String,
        /// What went wrong
        reason: String,
    },

    /// One or more services failed during a start call
    #[error(
        "Startup failed: {}",
        errors.iter().map(|(s, e)| format!("{s}: {e}")).collect::<Vec<_>>().join("; ")
    )]
    StartupFailed {
        /// Failure message per service
        errors: BTreeMap<String, String>,
        /// Services that had started and were stopped again
        rolled_back: Vec<String>,
    },

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Service not found
    #[error("Service not found: {0}")]
    ServiceNotFound(String),

    /// Service registry errors
    #[error("Service registry error: {0}")]
    Registry(#[from] service_registry::Error),

    /// Command executor errors
    #[error("Command execution error: {0}")]
    CommandExecutor(#[from] command_executor::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML parse error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
