//! Runtime-agnostic service registry and cache
//!
//! The [`Registry`] is the single source of truth for what is running:
//! one [`ServiceEntry`] per service name, guarded by a shared-read /
//! single-writer lock and rewritten atomically to a project-local JSON file
//! after every mutation, so external tools can read it without talking to
//! the owning process.
//!
//! The [`CacheManager`] is a small key/value store with TTL and
//! content-hash invalidation, persisted with the same atomic-write
//! discipline.
//!
//! # Example
//!
//! ```no_run
//! use service_registry::{Registry, ServiceEntry, ServiceStatus};
//!
//! # async fn example() -> service_registry::Result<()> {
//! let registry = Registry::for_project(".").await?;
//! registry.register(ServiceEntry::starting("api").with_port(8080)).await?;
//! registry.update_status("api", ServiceStatus::Running, None).await?;
//! for entry in registry.list().await {
//!     println!("{} {}", entry.name, entry.status);
//! }
//! # Ok(())
//! # }
//! ```

pub mod atomic;
pub mod backend;
pub mod cache;
pub mod error;
pub mod models;
pub mod registry;

pub use backend::{FileBackend, MemoryBackend, RegistryBackend};
pub use cache::{hash_of, CacheEntry, CacheManager};
pub use error::{Error, Result};
pub use models::{HealthState, RegistryEvent, ServiceEntry, ServiceStatus};
pub use registry::Registry;

/// Directory, relative to the project root, holding runtime state
pub const STATE_DIR: &str = ".devstack";

/// Registry file name inside [`STATE_DIR`]
pub const REGISTRY_FILE: &str = "services.json";

/// Health cache file name inside [`STATE_DIR`]
pub const CACHE_FILE: &str = "health-cache.json";
