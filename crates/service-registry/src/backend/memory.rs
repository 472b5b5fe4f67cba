//! In-memory backend for service registry

use super::{RegistryBackend, ServiceTable};
use crate::error::Result;
use async_trait::async_trait;
use std::sync::Mutex;

/// In-memory registry backend, for tests and embedded use
#[derive(Debug, Default)]
pub struct MemoryBackend {
    table: Mutex<ServiceTable>,
}

impl MemoryBackend {
    /// Create a new, empty in-memory backend
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from an existing table
    pub fn with_table(table: ServiceTable) -> Self {
        Self {
            table: Mutex::new(table),
        }
    }
}

#[async_trait]
impl RegistryBackend for MemoryBackend {
    async fn load(&self) -> Result<ServiceTable> {
        Ok(self.table.lock().unwrap_or_else(|e| e.into_inner()).clone())
    }

    async fn save(&self, table: &ServiceTable) -> Result<()> {
        *self.table.lock().unwrap_or_else(|e| e.into_inner()) = table.clone();
        Ok(())
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}
