//! Runtime-agnostic async utilities
//!
//! Library crates in this workspace never call `tokio::spawn` or
//! `smol::spawn` directly. They receive an `Arc<dyn Spawner>` from their
//! caller and use [`runtime_utils`] for timers, so the same code runs under
//! whichever executor the binary picked.
//!
//! # Examples
//!
//! ```no_run
//! use async_runtime_compat::prelude::*;
//!
//! fn start_background(spawner: &dyn Spawner) {
//!     spawner.spawn(Box::pin(async {
//!         sleep(std::time::Duration::from_millis(10)).await;
//!     }));
//! }
//!
//! # #[cfg(feature = "smol")]
//! smol::block_on(async {
//!     start_background(&SmolSpawner);
//! });
//! ```

use std::future::Future;
use std::pin::Pin;

mod cancel;
pub mod runtime_utils;

#[cfg(feature = "tokio")]
pub mod tokio;

#[cfg(feature = "smol")]
pub mod smol;

pub use cancel::CancellationToken;

/// A boxed future suitable for detached spawning
pub type BoxTask = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// A spawner that can run futures in the background on some runtime
pub trait Spawner: Send + Sync {
    /// Spawn a future; it runs to completion detached from the caller.
    fn spawn(&self, future: BoxTask);

    /// Human readable runtime name, used in log lines.
    fn runtime_name(&self) -> &'static str;
}

/// Prelude for common imports
pub mod prelude {
    pub use crate::runtime_utils::{sleep, timeout, Elapsed};
    pub use crate::{CancellationToken, Spawner};

    #[cfg(feature = "tokio")]
    pub use crate::tokio::TokioSpawner;

    #[cfg(feature = "smol")]
    pub use crate::smol::SmolSpawner;
}

/// Create a spawner for the runtime driving the current thread, if one
/// can be detected.
pub fn current_runtime_spawner() -> Option<std::sync::Arc<dyn Spawner>> {
    #[cfg(feature = "tokio")]
    {
        if let Some(spawner) = crate::tokio::TokioSpawner::try_current() {
            return Some(std::sync::Arc::new(spawner));
        }
    }

    let fallback: Option<std::sync::Arc<dyn Spawner>> = None;
    #[cfg(feature = "smol")]
    let fallback: Option<std::sync::Arc<dyn Spawner>> =
        Some(std::sync::Arc::new(crate::smol::SmolSpawner));
    fallback
}
