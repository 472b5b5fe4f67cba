//! Orchestration context for runtime-agnostic service management
//!
//! Carries the runtime dependencies every component needs: the async
//! spawner, the shared service registry, and the process launcher. The
//! registry is injected rather than global so tests can run isolated
//! registries side by side.

use async_runtime_compat::Spawner;
use command_executor::{Launcher, LocalLauncher};
use service_registry::Registry;
use std::sync::Arc;

/// Context object for service orchestration
#[derive(Clone)]
pub struct OrchestrationContext {
    /// Runtime spawner for background tasks
    pub spawner: Arc<dyn Spawner>,

    /// Shared service registry
    pub registry: Arc<Registry>,

    /// Launches and stops service processes
    pub launcher: Arc<dyn Launcher>,
}

impl OrchestrationContext {
    /// Context that launches local processes on `spawner`
    pub fn new(spawner: Arc<dyn Spawner>, registry: Arc<Registry>) -> Self {
        let launcher = Arc::new(LocalLauncher::new(spawner.clone()));
        Self {
            spawner,
            registry,
            launcher,
        }
    }

    /// Replace the launcher
    pub fn with_launcher(mut self, launcher: Arc<dyn Launcher>) -> Self {
        self.launcher = launcher;
        self
    }

    /// Get the registry
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

impl std::fmt::Debug for OrchestrationContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrchestrationContext")
            .field("runtime", &self.spawner.runtime_name())
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}
