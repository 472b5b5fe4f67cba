//! Rendering of health reports and registry entries

use chrono::{DateTime, Utc};
use clap::ValueEnum;
use comfy_table::{Cell, Color, Table};
use service_orchestration::{HealthCheckResult, HealthReport};
use service_registry::{HealthState, ServiceEntry, ServiceStatus};
use std::collections::HashMap;

/// Output format of `devstack health`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum HealthFormat {
    /// One line per service plus a summary
    #[default]
    Text,
    /// The full report as JSON
    Json,
    /// A table
    Table,
}

/// Output format of `devstack status`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum StatusFormat {
    /// A table
    #[default]
    Table,
    /// Registry entries as JSON
    Json,
}

fn symbol(state: HealthState) -> &'static str {
    match state {
        HealthState::Healthy => "✓",
        HealthState::Degraded => "!",
        HealthState::Unhealthy => "✗",
        HealthState::Starting => "…",
        HealthState::Unknown => "?",
    }
}

fn health_color(state: HealthState) -> Color {
    match state {
        HealthState::Healthy => Color::Green,
        HealthState::Degraded | HealthState::Starting => Color::Yellow,
        HealthState::Unhealthy => Color::Red,
        HealthState::Unknown => Color::DarkGrey,
    }
}

/// Short "how was this decided" column: check type, code, latency, skip
fn detail(result: &HealthCheckResult) -> String {
    let mut parts = Vec::new();
    if let Some(kind) = result.check_type {
        parts.push(kind.to_string());
    }
    if let Some(code) = result.status_code {
        parts.push(code.to_string());
    }
    if result.skipped.is_none() && !result.cached && result.check_type.is_some() {
        parts.push(format!("{}ms", result.response_time_ms));
    }
    if let Some(reason) = result.skipped {
        parts.push(format!("skipped: {reason}"));
    }
    if result.cached {
        parts.push("cached".into());
    }
    parts.join(" ")
}

/// Render a full report
pub fn render_report(report: &HealthReport, format: HealthFormat) -> serde_json::Result<String> {
    match format {
        HealthFormat::Json => serde_json::to_string_pretty(report),
        HealthFormat::Text => Ok(render_text(report)),
        HealthFormat::Table => Ok(render_table(report)),
    }
}

/// One line of JSON per report, for streaming
pub fn render_report_line(report: &HealthReport) -> serde_json::Result<String> {
    serde_json::to_string(report)
}

fn render_text(report: &HealthReport) -> String {
    let width = report
        .services
        .iter()
        .map(|r| r.service_name.len())
        .max()
        .unwrap_or(0);

    let mut out = String::new();
    for result in &report.services {
        let mut line = format!(
            "{} {:width$}  {:9}  {}",
            symbol(result.status),
            result.service_name,
            result.status.to_string(),
            detail(result),
        );
        if let Some(error) = &result.error {
            line.push_str(&format!("  ({error})"));
        }
        out.push_str(line.trim_end());
        out.push('\n');
    }
    let s = &report.summary;
    out.push_str(&format!(
        "{}: {} healthy, {} degraded, {} unhealthy, {} starting, {} unknown ({} total)",
        s.overall, s.healthy, s.degraded, s.unhealthy, s.starting, s.unknown, s.total
    ));
    out
}

fn render_table(report: &HealthReport) -> String {
    let mut table = Table::new();
    table.set_header(vec!["SERVICE", "HEALTH", "CHECK", "ENDPOINT", "ERROR"]);
    for result in &report.services {
        table.add_row(vec![
            Cell::new(&result.service_name),
            Cell::new(result.status.to_string()).fg(health_color(result.status)),
            Cell::new(detail(result)),
            Cell::new(result.endpoint.as_deref().unwrap_or("-")),
            Cell::new(result.error.as_deref().unwrap_or("")),
        ]);
    }
    format!("{table}\nOverall: {}", report.overall())
}

/// Remembers the last reported health per service so streams can print
/// transitions only
#[derive(Debug, Default)]
pub struct ChangeTracker {
    last: HashMap<String, HealthState>,
}

impl ChangeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lines for services whose health differs from the previous report
    pub fn changes(&mut self, report: &HealthReport) -> Vec<String> {
        let mut lines = Vec::new();
        for result in &report.services {
            let previous = self
                .last
                .insert(result.service_name.clone(), result.status);
            if previous == Some(result.status) {
                continue;
            }
            let from = previous.map_or_else(|| "-".to_string(), |p| p.to_string());
            let mut line = format!(
                "[{}] {} {}: {} -> {}",
                result.timestamp.format("%H:%M:%S"),
                symbol(result.status),
                result.service_name,
                from,
                result.status
            );
            if let Some(error) = &result.error {
                line.push_str(&format!(" ({error})"));
            }
            lines.push(line);
        }
        lines
    }
}

fn uptime(entry: &ServiceEntry, now: DateTime<Utc>) -> String {
    let Some(start) = entry.start_time.filter(|_| {
        matches!(entry.status, ServiceStatus::Running | ServiceStatus::Starting)
    }) else {
        return "-".into();
    };
    let secs = (now - start).num_seconds().max(0);
    match secs {
        0..=59 => format!("{secs}s"),
        60..=3599 => format!("{}m{}s", secs / 60, secs % 60),
        _ => format!("{}h{}m", secs / 3600, (secs % 3600) / 60),
    }
}

fn status_color(status: ServiceStatus) -> Color {
    match status {
        ServiceStatus::Running => Color::Green,
        ServiceStatus::Starting | ServiceStatus::Stopping => Color::Yellow,
        ServiceStatus::Stopped => Color::DarkGrey,
        ServiceStatus::Error => Color::Red,
    }
}

/// Registry entries as a table
pub fn render_entries(entries: &[ServiceEntry], format: StatusFormat) -> serde_json::Result<String> {
    if format == StatusFormat::Json {
        return serde_json::to_string_pretty(entries);
    }

    let now = Utc::now();
    let mut table = Table::new();
    table.set_header(vec![
        "SERVICE", "STATUS", "HEALTH", "PID", "PORT", "UPTIME", "EXIT", "ERROR",
    ]);
    for entry in entries {
        let opt = |v: Option<String>| v.unwrap_or_else(|| "-".into());
        table.add_row(vec![
            Cell::new(&entry.name),
            Cell::new(entry.status.to_string()).fg(status_color(entry.status)),
            Cell::new(entry.health.to_string()).fg(health_color(entry.health)),
            Cell::new(opt(entry.pid.map(|p| p.to_string()))),
            Cell::new(opt(entry.port.map(|p| p.to_string()))),
            Cell::new(uptime(entry, now)),
            Cell::new(opt(entry.exit_code.map(|c| c.to_string()))),
            Cell::new(entry.error.as_deref().unwrap_or("")),
        ]);
    }
    Ok(table.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use service_orchestration::{CheckType, SkipReason};

    fn result(name: &str, status: HealthState) -> HealthCheckResult {
        let mut result = HealthCheckResult::new(name, status);
        result.check_type = Some(CheckType::Http);
        result.status_code = Some(200);
        result.response_time_ms = 7;
        result
    }

    #[test]
    fn test_text_lists_services_and_summary() {
        let mut down = result("db", HealthState::Unhealthy).with_error("connection refused");
        down.check_type = Some(CheckType::Tcp);
        down.status_code = None;
        let report = HealthReport::new(vec![result("api", HealthState::Healthy), down]);

        let text = render_report(&report, HealthFormat::Text).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("✓ api"));
        assert!(lines[0].contains("http 200 7ms"));
        assert!(lines[1].starts_with("✗ db"));
        assert!(lines[1].contains("(connection refused)"));
        assert!(lines[2].starts_with("unhealthy: 1 healthy"));
    }

    #[test]
    fn test_skips_and_cache_are_labelled() {
        let skipped = result("api", HealthState::Unhealthy).skipped(SkipReason::CircuitOpen);
        assert_eq!(detail(&skipped), "http 200 skipped: circuit_open");

        let mut cached = result("api", HealthState::Healthy);
        cached.cached = true;
        assert_eq!(detail(&cached), "http 200 cached");
    }

    #[test]
    fn test_json_round_trips_report() {
        let report = HealthReport::new(vec![result("api", HealthState::Degraded)]);
        let json = render_report(&report, HealthFormat::Json).unwrap();
        let back: HealthReport = serde_json::from_str(&json).unwrap();
        assert_eq!(back.summary.degraded, 1);
        assert!(!render_report_line(&report).unwrap().contains('\n'));
    }

    #[test]
    fn test_table_has_overall() {
        let report = HealthReport::new(vec![result("api", HealthState::Healthy)]);
        let table = render_report(&report, HealthFormat::Table).unwrap();
        assert!(table.contains("SERVICE"));
        assert!(table.contains("api"));
        assert!(table.ends_with("Overall: healthy"));
    }

    #[test]
    fn test_change_tracker_reports_transitions_only() {
        let mut tracker = ChangeTracker::new();
        let first = HealthReport::new(vec![
            result("api", HealthState::Starting),
            result("db", HealthState::Healthy),
        ]);
        assert_eq!(tracker.changes(&first).len(), 2);
        assert!(tracker.changes(&first).is_empty());

        let second = HealthReport::new(vec![
            result("api", HealthState::Healthy),
            result("db", HealthState::Healthy),
        ]);
        let changes = tracker.changes(&second);
        assert_eq!(changes.len(), 1);
        assert!(changes[0].contains("api: starting -> healthy"));
    }

    #[test]
    fn test_entries_table() {
        let mut entry = ServiceEntry::starting("api").with_port(8080);
        entry.pid = Some(4242);
        let table = render_entries(&[entry.clone()], StatusFormat::Table).unwrap();
        assert!(table.contains("4242"));
        assert!(table.contains("8080"));
        assert!(table.contains("starting"));

        let json = render_entries(&[entry], StatusFormat::Json).unwrap();
        assert!(json.contains("\"name\": \"api\""));
    }
}
