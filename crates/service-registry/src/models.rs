//! Data models for the service registry

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle status of a service process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceStatus {
    /// Registered, process being spawned or not yet ready
    Starting,
    /// Process running and past its readiness gate
    Running,
    /// Shutdown requested
    Stopping,
    /// Process is gone (stopped on request or found dead)
    Stopped,
    /// Spawn failed or the process exited on its own
    Error,
}

impl ServiceStatus {
    /// Whether a live process is expected behind this status
    pub fn expects_process(self) -> bool {
        matches!(self, Self::Starting | Self::Running | Self::Stopping)
    }

    /// Check if a status transition is valid
    pub fn can_transition_to(self, to: ServiceStatus) -> bool {
        use ServiceStatus::*;

        match (self, to) {
            (from, to) if from == to => true,

            // Can always fail
            (_, Error) => true,

            // Restart after stop or failure
            (Stopped | Error, Starting) => true,

            (Starting, Running) => true,
            (Starting | Running, Stopping) => true,

            // Explicit stop, or the process was found dead
            (Starting | Running | Stopping | Error, Stopped) => true,

            _ => false,
        }
    }
}

impl fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

/// Health of a service as last determined by the health monitor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    /// Probe succeeded
    Healthy,
    /// Service reports partial functionality
    Degraded,
    /// Probe failed
    Unhealthy,
    /// Inside the startup grace period
    Starting,
    /// Not yet checked, or not checkable
    #[default]
    Unknown,
}

impl fmt::Display for HealthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Unhealthy => "unhealthy",
            Self::Starting => "starting",
            Self::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// A registered service entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceEntry {
    /// Unique service name
    pub name: String,

    /// Current lifecycle status
    pub status: ServiceStatus,

    /// Last known health
    #[serde(default)]
    pub health: HealthState,

    /// Primary port
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    /// URL the service is reachable at
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    /// OS process id once spawned
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,

    /// Opaque language tag
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,

    /// Opaque framework tag
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub framework: Option<String>,

    /// When the process was started
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,

    /// When health was last evaluated
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_checked: Option<DateTime<Utc>>,

    /// Last error message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Exit code of the last process
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,

    /// When the process stopped or exited
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
}

impl ServiceEntry {
    /// A fresh entry in `starting` status with unknown health
    pub fn starting(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: ServiceStatus::Starting,
            health: HealthState::Unknown,
            port: None,
            url: None,
            pid: None,
            language: None,
            framework: None,
            start_time: Some(Utc::now()),
            last_checked: None,
            error: None,
            exit_code: None,
            end_time: None,
        }
    }

    /// Set the port and derive a localhost URL
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self.url = Some(format!("http://localhost:{port}"));
        self
    }

    /// Override the URL
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    /// Attach opaque language/framework tags
    pub fn with_tags(mut self, language: Option<String>, framework: Option<String>) -> Self {
        self.language = language;
        self.framework = framework;
        self
    }

    /// Whether the entry claims a live process whose pid is gone
    pub fn is_stale(&self) -> bool {
        self.status.expects_process()
            && self
                .pid
                .is_some_and(|pid| !command_executor::process_alive(pid))
    }

    /// Seconds since `start_time` while the service is up
    pub fn uptime(&self) -> Option<chrono::Duration> {
        match self.status {
            ServiceStatus::Running | ServiceStatus::Starting => {
                self.start_time.map(|t| Utc::now() - t)
            }
            _ => None,
        }
    }
}

/// Change notifications delivered to registry subscribers
#[derive(Debug, Clone, PartialEq)]
pub enum RegistryEvent {
    /// An entry was created or replaced
    Registered {
        /// Service name
        name: String,
        /// Status it was registered with
        status: ServiceStatus,
    },
    /// Lifecycle status changed
    StatusChanged {
        /// Service name
        name: String,
        /// Previous status
        from: ServiceStatus,
        /// New status
        to: ServiceStatus,
    },
    /// Health changed
    HealthChanged {
        /// Service name
        name: String,
        /// Previous health
        from: HealthState,
        /// New health
        to: HealthState,
    },
    /// An entry was removed
    Unregistered {
        /// Service name
        name: String,
    },
}
