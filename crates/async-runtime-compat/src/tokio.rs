//! Tokio runtime spawner implementation

use crate::{BoxTask, Spawner};
use tokio::runtime::Handle;

/// Spawner bound to a specific Tokio runtime
///
/// The handle is captured at construction, so tasks can be spawned from
/// threads that are not themselves inside the runtime (e.g. blocking
/// callbacks).
#[derive(Debug, Clone)]
pub struct TokioSpawner {
    handle: Handle,
}

impl TokioSpawner {
    /// Capture the runtime of the calling thread.
    ///
    /// # Panics
    ///
    /// Panics when called outside a Tokio runtime, like `Handle::current`.
    pub fn current() -> Self {
        Self {
            handle: Handle::current(),
        }
    }

    /// Capture the runtime of the calling thread, if there is one.
    pub fn try_current() -> Option<Self> {
        Handle::try_current().ok().map(|handle| Self { handle })
    }

    /// Spawn onto an explicit runtime handle.
    pub fn with_handle(handle: Handle) -> Self {
        Self { handle }
    }
}

impl Spawner for TokioSpawner {
    fn spawn(&self, future: BoxTask) {
        drop(self.handle.spawn(future));
    }

    fn runtime_name(&self) -> &'static str {
        "tokio"
    }
}
