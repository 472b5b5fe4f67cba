//! Atomically rewritten JSON file backend

use super::{RegistryBackend, ServiceTable};
use crate::atomic::{self, RenameFn};
use crate::error::Result;
use async_trait::async_trait;
use std::path::{Path, PathBuf};

/// Stores the registry as a JSON object keyed by service name
pub struct FileBackend {
    path: PathBuf,
    rename: RenameFn,
}

impl FileBackend {
    /// Back the registry with the file at `path`
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            rename: atomic::default_rename(),
        }
    }

    /// Replace the final rename step (fault injection in tests)
    pub fn with_rename(mut self, rename: RenameFn) -> Self {
        self.rename = rename;
        self
    }

    /// Location of the registry file
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl RegistryBackend for FileBackend {
    async fn load(&self) -> Result<ServiceTable> {
        atomic::read_json(&self.path).await
    }

    async fn save(&self, table: &ServiceTable) -> Result<()> {
        atomic::write_json(&self.path, table, &self.rename).await
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}
