//! Registry backend implementations

mod file;
mod memory;

pub use file::FileBackend;
pub use memory::MemoryBackend;

use crate::{error::Result, models::ServiceEntry};
use async_trait::async_trait;
use std::collections::BTreeMap;

/// The full registry table, keyed by service name
pub type ServiceTable = BTreeMap<String, ServiceEntry>;

/// Trait for registry storage backends
///
/// Backends always store the whole table; the registry serializes calls
/// to [`save`](RegistryBackend::save).
#[async_trait]
pub trait RegistryBackend: Send + Sync {
    /// Load the persisted table; an absent store is an empty table
    async fn load(&self) -> Result<ServiceTable>;

    /// Replace the persisted table
    async fn save(&self, table: &ServiceTable) -> Result<()>;

    /// Short description for log lines
    fn describe(&self) -> String;
}
