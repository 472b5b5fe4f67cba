//! Health check results and their aggregation

use crate::config::CheckType;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use service_registry::HealthState;
use std::time::Duration;

/// Why a check returned without probing. Not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SkipReason {
    /// Circuit breaker is open
    CircuitOpen,
    /// No rate-limit token; deferred to the next tick
    RateLimited,
    /// The check was cancelled, e.g. by a stop
    Cancelled,
}

impl SkipReason {
    /// Stable snake_case label
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CircuitOpen => "circuit_open",
            Self::RateLimited => "rate_limited",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

fn is_false(b: &bool) -> bool {
    !*b
}

/// Outcome of checking one service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheckResult {
    /// Service name
    pub service_name: String,
    /// Reported health
    pub status: HealthState,
    /// Strategy that produced the result
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub check_type: Option<CheckType>,
    /// Probed URL or address
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    /// HTTP status code
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    /// Probe latency in milliseconds
    #[serde(rename = "responseTime", default)]
    pub response_time_ms: u64,
    /// Failure description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// When the result was produced
    pub timestamp: DateTime<Utc>,
    /// Service port
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    /// Service pid
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    /// Set when no probe was dispatched
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skipped: Option<SkipReason>,
    /// Served from the result cache
    #[serde(default, skip_serializing_if = "is_false")]
    pub cached: bool,
    /// JSON body returned by an HTTP health endpoint
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl HealthCheckResult {
    /// A result with only name and status set
    pub fn new(service: impl Into<String>, status: HealthState) -> Self {
        Self {
            service_name: service.into(),
            status,
            check_type: None,
            endpoint: None,
            status_code: None,
            response_time_ms: 0,
            error: None,
            timestamp: Utc::now(),
            port: None,
            pid: None,
            skipped: None,
            cached: false,
            details: None,
        }
    }

    /// Attach an error message
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    /// Mark as skipped
    pub fn skipped(mut self, reason: SkipReason) -> Self {
        self.skipped = Some(reason);
        self.cached = false;
        self.timestamp = Utc::now();
        self
    }

    /// Probe latency
    pub fn response_time(&self) -> Duration {
        Duration::from_millis(self.response_time_ms)
    }
}

/// Counts per health state plus the overall verdict
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthSummary {
    /// Services checked
    pub total: usize,
    /// Healthy services
    pub healthy: usize,
    /// Degraded services
    pub degraded: usize,
    /// Unhealthy services
    pub unhealthy: usize,
    /// Services inside their startup grace period
    pub starting: usize,
    /// Services whose health is unknown
    pub unknown: usize,
    /// Healthy only if every service is; otherwise degraded unless
    /// something is unhealthy
    pub overall: HealthState,
}

impl HealthSummary {
    /// Aggregate a set of results
    pub fn from_results(results: &[HealthCheckResult]) -> Self {
        let mut summary = Self {
            total: results.len(),
            healthy: 0,
            degraded: 0,
            unhealthy: 0,
            starting: 0,
            unknown: 0,
            overall: HealthState::Healthy,
        };
        for result in results {
            match result.status {
                HealthState::Healthy => summary.healthy += 1,
                HealthState::Degraded => summary.degraded += 1,
                HealthState::Unhealthy => summary.unhealthy += 1,
                HealthState::Starting => summary.starting += 1,
                HealthState::Unknown => summary.unknown += 1,
            }
        }
        summary.overall = if summary.unhealthy > 0 {
            HealthState::Unhealthy
        } else if summary.healthy < summary.total {
            HealthState::Degraded
        } else {
            HealthState::Healthy
        };
        summary
    }
}

/// One evaluation of a set of services
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    /// When the evaluation finished
    pub timestamp: DateTime<Utc>,
    /// Per-service results, ordered by name
    pub services: Vec<HealthCheckResult>,
    /// Aggregate
    pub summary: HealthSummary,
}

impl HealthReport {
    /// Build a report, sorting results by service name
    pub fn new(mut services: Vec<HealthCheckResult>) -> Self {
        services.sort_by(|a, b| a.service_name.cmp(&b.service_name));
        let summary = HealthSummary::from_results(&services);
        Self {
            timestamp: Utc::now(),
            services,
            summary,
        }
    }

    /// Overall verdict
    pub fn overall(&self) -> HealthState {
        self.summary.overall
    }

    /// Result for one service
    pub fn get(&self, service: &str) -> Option<&HealthCheckResult> {
        self.services.iter().find(|r| r.service_name == service)
    }

    /// Static-mode process exit code: 0 when everything is healthy, else 1
    pub fn exit_code(&self) -> i32 {
        match self.summary.overall {
            HealthState::Healthy => 0,
            _ => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(states: &[HealthState]) -> HealthReport {
        HealthReport::new(
            states
                .iter()
                .enumerate()
                .map(|(i, s)| HealthCheckResult::new(format!("svc{i}"), *s))
                .collect(),
        )
    }

    #[test]
    fn test_overall_aggregation() {
        use HealthState::*;

        assert_eq!(report(&[Healthy, Healthy]).overall(), Healthy);
        assert_eq!(report(&[Healthy, Degraded]).overall(), Degraded);
        assert_eq!(report(&[Healthy, Unknown]).overall(), Degraded);
        assert_eq!(report(&[Starting]).overall(), Degraded);
        assert_eq!(report(&[Degraded, Unhealthy, Healthy]).overall(), Unhealthy);
        assert_eq!(report(&[]).overall(), Healthy);
    }

    #[test]
    fn test_exit_codes() {
        use HealthState::*;

        assert_eq!(report(&[Healthy]).exit_code(), 0);
        assert_eq!(report(&[Degraded]).exit_code(), 1);
        assert_eq!(report(&[Unhealthy]).exit_code(), 1);
    }

    #[test]
    fn test_summary_counts() {
        use HealthState::*;

        let summary = report(&[Healthy, Unhealthy, Unhealthy, Starting, Unknown]).summary;
        assert_eq!(summary.total, 5);
        assert_eq!(summary.healthy, 1);
        assert_eq!(summary.unhealthy, 2);
        assert_eq!(summary.starting, 1);
        assert_eq!(summary.unknown, 1);
    }

    #[test]
    fn test_json_shape() {
        let mut result = HealthCheckResult::new("api", HealthState::Healthy);
        result.check_type = Some(CheckType::Http);
        result.response_time_ms = 12;
        let value = serde_json::to_value(HealthReport::new(vec![result])).unwrap();

        let svc = &value["services"][0];
        assert_eq!(svc["serviceName"], "api");
        assert_eq!(svc["status"], "healthy");
        assert_eq!(svc["checkType"], "http");
        assert_eq!(svc["responseTime"], 12);
        assert!(svc.get("cached").is_none());
        assert_eq!(value["summary"]["overall"], "healthy");
        assert_eq!(value["summary"]["total"], 1);
    }
}
