//! Per-service probe metrics with Prometheus text exposition.
//!
//! Recording methods take `&self` so one collector can be shared by every
//! check running concurrently.

use super::circuit::CircuitState;
use super::report::SkipReason;
use service_registry::HealthState;
use std::collections::BTreeMap;
use std::fmt::Write;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

/// Upper bounds, in seconds, of the latency histogram buckets
pub const LATENCY_BUCKETS: [f64; 10] = [0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0];

/// Probe latency histogram
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LatencyHistogram {
    /// Observations per bucket (not cumulative); the extra slot is `+Inf`
    pub buckets: [u64; LATENCY_BUCKETS.len() + 1],
    /// Sum of observations in seconds
    pub sum: f64,
    /// Number of observations
    pub count: u64,
}

impl LatencyHistogram {
    fn observe(&mut self, latency: Duration) {
        let secs = latency.as_secs_f64();
        let slot = LATENCY_BUCKETS
            .iter()
            .position(|le| secs <= *le)
            .unwrap_or(LATENCY_BUCKETS.len());
        self.buckets[slot] += 1;
        self.sum += secs;
        self.count += 1;
    }
}

/// Counters for one service
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ServiceMetrics {
    /// Probes dispatched
    pub checks: u64,
    /// Probes that came back unhealthy
    pub failures: u64,
    /// Results served from cache
    pub cache_hits: u64,
    /// Checks skipped, by reason
    pub skipped: BTreeMap<SkipReason, u64>,
    /// Breaker transitions, keyed by `(from, to)`
    pub transitions: BTreeMap<(CircuitState, CircuitState), u64>,
    /// Probe latency
    pub latency: LatencyHistogram,
}

/// Thread-safe metrics collector
#[derive(Debug, Default)]
pub struct HealthMetrics {
    services: Mutex<BTreeMap<String, ServiceMetrics>>,
}

impl HealthMetrics {
    /// Empty collector
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, ServiceMetrics>> {
        self.services.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn with(&self, service: &str, f: impl FnOnce(&mut ServiceMetrics)) {
        f(self.lock().entry(service.to_string()).or_default());
    }

    /// Record a dispatched probe
    pub fn record_probe(&self, service: &str, status: HealthState, latency: Duration) {
        self.with(service, |m| {
            m.checks += 1;
            if status == HealthState::Unhealthy {
                m.failures += 1;
            }
            m.latency.observe(latency);
        });
    }

    /// Record a check answered from cache
    pub fn record_cache_hit(&self, service: &str) {
        self.with(service, |m| m.cache_hits += 1);
    }

    /// Record a skipped check
    pub fn record_skip(&self, service: &str, reason: SkipReason) {
        self.with(service, |m| *m.skipped.entry(reason).or_default() += 1);
    }

    /// Record a circuit breaker transition
    pub fn record_transition(&self, service: &str, from: CircuitState, to: CircuitState) {
        self.with(service, |m| *m.transitions.entry((from, to)).or_default() += 1);
    }

    /// Snapshot of one service's counters
    pub fn service(&self, service: &str) -> Option<ServiceMetrics> {
        self.lock().get(service).cloned()
    }

    /// Drop a service's counters
    pub fn remove(&self, service: &str) {
        self.lock().remove(service);
    }

    /// Prometheus text exposition format
    pub fn render_prometheus(&self) -> String {
        let services = self.lock();
        let mut out = String::new();

        write_family(
            &mut out,
            "devstack_health_checks_total",
            "counter",
            "Health probes dispatched",
            services
                .iter()
                .map(|(svc, m)| (format!("service=\"{svc}\""), m.checks.to_string())),
        );
        write_family(
            &mut out,
            "devstack_health_check_failures_total",
            "counter",
            "Health probes that reported unhealthy",
            services
                .iter()
                .map(|(svc, m)| (format!("service=\"{svc}\""), m.failures.to_string())),
        );
        write_family(
            &mut out,
            "devstack_health_check_cache_hits_total",
            "counter",
            "Health results served from cache",
            services
                .iter()
                .map(|(svc, m)| (format!("service=\"{svc}\""), m.cache_hits.to_string())),
        );
        write_family(
            &mut out,
            "devstack_health_checks_skipped_total",
            "counter",
            "Health checks skipped without probing",
            services.iter().flat_map(|(svc, m)| {
                m.skipped.iter().map(move |(reason, n)| {
                    (
                        format!("service=\"{svc}\",reason=\"{}\"", reason.as_str()),
                        n.to_string(),
                    )
                })
            }),
        );
        write_family(
            &mut out,
            "devstack_circuit_breaker_transitions_total",
            "counter",
            "Circuit breaker state transitions",
            services.iter().flat_map(|(svc, m)| {
                m.transitions.iter().map(move |((from, to), n)| {
                    (
                        format!("service=\"{svc}\",from=\"{from}\",to=\"{to}\""),
                        n.to_string(),
                    )
                })
            }),
        );

        let name = "devstack_health_check_duration_seconds";
        let _ = writeln!(out, "# HELP {name} Health probe latency");
        let _ = writeln!(out, "# TYPE {name} histogram");
        for (svc, m) in services.iter() {
            let mut cumulative = 0;
            for (i, le) in LATENCY_BUCKETS.iter().enumerate() {
                cumulative += m.latency.buckets[i];
                let _ = writeln!(out, "{name}_bucket{{service=\"{svc}\",le=\"{le}\"}} {cumulative}");
            }
            let _ = writeln!(
                out,
                "{name}_bucket{{service=\"{svc}\",le=\"+Inf\"}} {}",
                m.latency.count
            );
            let _ = writeln!(out, "{name}_sum{{service=\"{svc}\"}} {}", m.latency.sum);
            let _ = writeln!(out, "{name}_count{{service=\"{svc}\"}} {}", m.latency.count);
        }
        out
    }
}

fn write_family(
    out: &mut String,
    name: &str,
    kind: &str,
    help: &str,
    samples: impl Iterator<Item = (String, String)>,
) {
    let _ = writeln!(out, "# HELP {name} {help}");
    let _ = writeln!(out, "# TYPE {name} {kind}");
    for (labels, value) in samples {
        let _ = writeln!(out, "{name}{{{labels}}} {value}");
    }
}
