pub mod health;
pub mod status;
pub mod stop;
pub mod up;

use anyhow::{Context, Result};
use service_orchestration::{StackConfig, parse_duration};
use service_registry::{CACHE_FILE, CacheManager, Registry, STATE_DIR};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Where the stack file and runtime state live
#[derive(Debug, Clone)]
pub struct Project {
    dir: PathBuf,
    config: PathBuf,
}

impl Project {
    pub fn new(dir: PathBuf, config: PathBuf) -> Self {
        Self { dir, config }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn config_path(&self) -> PathBuf {
        if self.config.is_absolute() {
            self.config.clone()
        } else {
            self.dir.join(&self.config)
        }
    }

    pub async fn registry(&self) -> Result<Arc<Registry>> {
        let registry = Registry::for_project(&self.dir)
            .await
            .with_context(|| format!("Failed to open registry in {}", self.dir.display()))?;
        Ok(Arc::new(registry))
    }

    pub async fn cache(&self) -> Result<Arc<CacheManager>> {
        let path = self.dir.join(STATE_DIR).join(CACHE_FILE);
        let cache = CacheManager::open(&path)
            .await
            .with_context(|| format!("Failed to open health cache {}", path.display()))?;
        Ok(Arc::new(cache))
    }

    pub async fn stack(&self) -> Result<StackConfig> {
        let path = self.config_path();
        StackConfig::load(&path)
            .await
            .with_context(|| format!("Failed to load {}", path.display()))
    }

    /// The stack file, or `None` when there is none
    pub async fn stack_if_present(&self) -> Result<Option<StackConfig>> {
        let exists = tokio::fs::try_exists(self.config_path())
            .await
            .unwrap_or(false);
        if exists {
            self.stack().await.map(Some)
        } else {
            Ok(None)
        }
    }
}

fn duration_arg(s: &str) -> Result<Duration, String> {
    parse_duration(s).ok_or_else(|| format!("invalid duration '{s}' (try 500ms, 5s, 2m)"))
}

/// `--interval`: at least one second
pub fn interval_arg(s: &str) -> Result<Duration, String> {
    let interval = duration_arg(s)?;
    if interval < Duration::from_secs(1) {
        return Err("interval must be at least 1s".into());
    }
    Ok(interval)
}

/// `--timeout`: between one and sixty seconds
pub fn timeout_arg(s: &str) -> Result<Duration, String> {
    let timeout = duration_arg(s)?;
    if !(Duration::from_secs(1)..=Duration::from_secs(60)).contains(&timeout) {
        return Err("timeout must be between 1s and 60s".into());
    }
    Ok(timeout)
}

/// `--endpoint`: an absolute path
pub fn endpoint_arg(s: &str) -> Result<String, String> {
    if s.starts_with('/') {
        Ok(s.to_string())
    } else {
        Err(format!("endpoint '{s}' must start with '/'"))
    }
}
