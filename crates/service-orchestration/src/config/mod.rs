//! Service descriptors and stack configuration.
//!
//! A stack file looks like:
//!
//! ```yaml
//! env: { SHARED: "1" }
//! services:
//!   db:
//!     command: postgres
//!     ports: [5432]
//!     healthCheck: { type: tcp }
//!   api:
//!     command: cargo
//!     args: [run]
//!     uses: [db]
//!     ports: [8080]
//!     ready: { pattern: "listening", timeout: 30s }
//!     healthCheck: { type: http, endpoint: /health, startPeriod: 10s }
//! ```

mod duration;

pub use duration::{format_duration, parse_duration};

use crate::{Error, Result};
use command_executor::Command;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Upper bound on any single probe timeout
pub const MAX_PROBE_TIMEOUT: Duration = Duration::from_secs(60);

fn default_probe_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_retries() -> u32 {
    1
}

fn default_ready_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_stop_grace() -> Duration {
    Duration::from_secs(10)
}

/// How a service's health is probed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckType {
    /// HTTP GET against an endpoint
    Http,
    /// TCP connect to the service port
    Tcp,
    /// OS process liveness
    Process,
    /// Run a command; exit 0 means healthy
    Command,
}

impl std::fmt::Display for CheckType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Http => "http",
            Self::Tcp => "tcp",
            Self::Process => "process",
            Self::Command => "command",
        })
    }
}

/// Health-check block of a service descriptor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheckConfig {
    /// Pin the probe method; `None` runs the full cascade
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub check_type: Option<CheckType>,

    /// HTTP path, e.g. `/health`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,

    /// Per-probe timeout
    #[serde(default = "default_probe_timeout", with = "duration::serde_str")]
    pub timeout: Duration,

    /// Probe interval in streaming mode
    #[serde(default = "default_interval", with = "duration::serde_str")]
    pub interval: Duration,

    /// Consecutive failures before the service is reported unhealthy
    #[serde(default = "default_retries")]
    pub retries: u32,

    /// Window after start in which failures are reported as `starting`
    #[serde(default, with = "duration::serde_str")]
    pub start_period: Duration,

    /// Extra request headers for HTTP probes
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,

    /// Argv for `type: command`
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub command: Vec<String>,

    /// Probe this port instead of the service's first declared port
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            check_type: None,
            endpoint: None,
            timeout: default_probe_timeout(),
            interval: default_interval(),
            retries: default_retries(),
            start_period: Duration::ZERO,
            headers: BTreeMap::new(),
            command: Vec::new(),
            port: None,
        }
    }
}

impl HealthCheckConfig {
    /// An HTTP check against `endpoint`
    pub fn http(endpoint: impl Into<String>) -> Self {
        Self {
            check_type: Some(CheckType::Http),
            endpoint: Some(endpoint.into()),
            ..Self::default()
        }
    }

    /// A TCP connect check
    pub fn tcp() -> Self {
        Self {
            check_type: Some(CheckType::Tcp),
            ..Self::default()
        }
    }

    /// A process liveness check
    pub fn process() -> Self {
        Self {
            check_type: Some(CheckType::Process),
            ..Self::default()
        }
    }

    /// Set the probe timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the startup grace window
    pub fn with_start_period(mut self, start_period: Duration) -> Self {
        self.start_period = start_period;
        self
    }

    /// Set the retry count
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    /// Pin the probed port
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Reject configurations that could never probe correctly.
    ///
    /// `service_port` is the descriptor's first declared port.
    pub fn validate(&self, service: &str, service_port: Option<u16>) -> Result<()> {
        let fail = |msg: String| Err(Error::Config(format!("{service}: {msg}")));

        if self.timeout.is_zero() {
            return fail("healthCheck.timeout must be greater than zero".into());
        }
        if self.timeout > MAX_PROBE_TIMEOUT {
            return fail(format!(
                "healthCheck.timeout {} exceeds the {} maximum",
                format_duration(self.timeout),
                format_duration(MAX_PROBE_TIMEOUT)
            ));
        }
        if self.interval.is_zero() {
            return fail("healthCheck.interval must be greater than zero".into());
        }
        if let Some(endpoint) = self.endpoint.as_deref().filter(|e| !e.starts_with('/')) {
            return fail(format!("healthCheck.endpoint '{endpoint}' must start with '/'"));
        }
        match self.check_type {
            Some(CheckType::Tcp) if self.port.or(service_port).is_none() => {
                fail("healthCheck.type tcp requires a port".into())
            }
            Some(CheckType::Http) if self.port.or(service_port).is_none() => {
                fail("healthCheck.type http requires a port".into())
            }
            Some(CheckType::Command) if self.command.is_empty() => {
                fail("healthCheck.type command requires a command".into())
            }
            _ => Ok(()),
        }
    }
}

/// Readiness gate applied after spawn, before the service counts as running
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadinessConfig {
    /// Regex that must match a line of output
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,

    /// Bound on waiting for `pattern`
    #[serde(default = "default_ready_timeout", with = "duration::serde_str")]
    pub timeout: Duration,

    /// Fixed delay after the pattern (or after spawn if there is none)
    #[serde(default, with = "duration::serde_str")]
    pub grace: Duration,
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            pattern: None,
            timeout: default_ready_timeout(),
            grace: Duration::ZERO,
        }
    }
}

impl ReadinessConfig {
    /// Whether there is anything to wait for
    pub fn is_immediate(&self) -> bool {
        self.pattern.is_none() && self.grace.is_zero()
    }
}

/// Static definition of one runnable service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceDescriptor {
    /// Unique name; filled from the map key when loaded from YAML
    #[serde(default)]
    pub name: String,

    /// Program to run
    pub command: String,

    /// Program arguments
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,

    /// Working directory
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<PathBuf>,

    /// Environment overlay; wins over the shared environment
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,

    /// Declared ports; the first is the primary port
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<u16>,

    /// Services that must be running first
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub uses: Vec<String>,

    /// Opaque language tag
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,

    /// Opaque framework tag
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub framework: Option<String>,

    /// Readiness gate
    #[serde(default)]
    pub ready: ReadinessConfig,

    /// Health-check configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_check: Option<HealthCheckConfig>,

    /// How long a stop waits after SIGTERM before killing
    #[serde(default = "default_stop_grace", with = "duration::serde_str")]
    pub stop_grace: Duration,
}

impl ServiceDescriptor {
    /// A descriptor with no args, ports or dependencies
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            args: Vec::new(),
            working_dir: None,
            env: BTreeMap::new(),
            ports: Vec::new(),
            uses: Vec::new(),
            language: None,
            framework: None,
            ready: ReadinessConfig::default(),
            health_check: None,
            stop_grace: default_stop_grace(),
        }
    }

    /// Set the arguments
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Add a dependency
    pub fn uses(mut self, dependency: impl Into<String>) -> Self {
        self.uses.push(dependency.into());
        self
    }

    /// Add a port
    pub fn with_port(mut self, port: u16) -> Self {
        self.ports.push(port);
        self
    }

    /// Add an environment variable
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Set the readiness gate
    pub fn with_ready(mut self, ready: ReadinessConfig) -> Self {
        self.ready = ready;
        self
    }

    /// Set the health check
    pub fn with_health_check(mut self, health_check: HealthCheckConfig) -> Self {
        self.health_check = Some(health_check);
        self
    }

    /// Set the stop grace period
    pub fn with_stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = grace;
        self
    }

    /// First declared port
    pub fn primary_port(&self) -> Option<u16> {
        self.ports.first().copied()
    }

    /// Shared environment overlaid with this service's own variables
    pub fn merged_env(&self, shared: &BTreeMap<String, String>) -> BTreeMap<String, String> {
        let mut env = shared.clone();
        env.extend(self.env.iter().map(|(k, v)| (k.clone(), v.clone())));
        env
    }

    /// The launch command with the merged environment applied
    pub fn to_command(&self, shared_env: &BTreeMap<String, String>) -> Command {
        let command = Command::new(&self.command)
            .with_args(&self.args)
            .with_envs(self.merged_env(shared_env));
        match &self.working_dir {
            Some(dir) => command.in_dir(dir),
            None => command,
        }
    }

    /// Check everything that can be checked without starting anything
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::Config("service name must not be empty".into()));
        }
        if self.command.is_empty() {
            return Err(Error::Config(format!("{}: command must not be empty", self.name)));
        }
        if let Some(pattern) = &self.ready.pattern {
            regex::Regex::new(pattern).map_err(|e| {
                Error::Config(format!("{}: invalid ready.pattern: {e}", self.name))
            })?;
        }
        if let Some(check) = &self.health_check {
            check.validate(&self.name, self.primary_port())?;
        }
        Ok(())
    }
}

/// A parsed stack file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StackConfig {
    /// Environment shared by every service
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// Services in file order
    #[serde(default)]
    pub services: IndexMap<String, ServiceDescriptor>,
}

impl StackConfig {
    /// Parse and validate YAML
    pub fn from_yaml(text: &str) -> Result<Self> {
        let mut config: StackConfig = serde_yaml::from_str(text)?;
        for (name, service) in config.services.iter_mut() {
            service.name = name.clone();
        }
        for service in config.services.values() {
            service.validate()?;
        }
        Ok(config)
    }

    /// Read a stack file; relative working directories resolve against
    /// the file's directory.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = async_fs::read_to_string(path).await.map_err(|e| {
            Error::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        let mut config = Self::from_yaml(&text)?;

        let base = path.parent().unwrap_or_else(|| Path::new("."));
        for service in config.services.values_mut() {
            service.working_dir = Some(match service.working_dir.take() {
                Some(dir) if dir.is_relative() => base.join(dir),
                Some(dir) => dir,
                None => base.to_path_buf(),
            });
        }
        debug!(path = %path.display(), services = config.services.len(), "Loaded stack");
        Ok(config)
    }

    /// All descriptors in file order
    pub fn descriptors(&self) -> Vec<ServiceDescriptor> {
        self.services.values().cloned().collect()
    }

    /// The named services plus everything they transitively use, in file
    /// order. An empty selection means every service.
    pub fn select(&self, names: &[String]) -> Result<Vec<ServiceDescriptor>> {
        if names.is_empty() {
            return Ok(self.descriptors());
        }

        let mut wanted = HashSet::new();
        let mut stack: Vec<&str> = names.iter().map(String::as_str).collect();
        while let Some(name) = stack.pop() {
            let service = self
                .services
                .get(name)
                .ok_or_else(|| Error::ServiceNotFound(name.to_string()))?;
            if wanted.insert(name.to_string()) {
                stack.extend(service.uses.iter().map(String::as_str));
            }
        }

        Ok(self
            .services
            .values()
            .filter(|s| wanted.contains(&s.name))
            .cloned()
            .collect())
    }
}
