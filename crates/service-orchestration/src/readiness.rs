//! Readiness gate for freshly spawned processes
//!
//! The output pattern is awaited first, bounded by `ready.timeout`; the
//! fixed grace delay follows. A process that exits at any point during
//! the gate fails it.

use crate::config::{ReadinessConfig, format_duration};
use async_runtime_compat::runtime_utils::timeout;
use command_executor::ServiceProcess;
use regex::Regex;
use tracing::debug;

/// Wait until `process` satisfies `ready`. The error is a human-readable
/// reason.
pub(crate) async fn wait_ready(
    process: &ServiceProcess,
    ready: &ReadinessConfig,
    pattern: Option<&Regex>,
) -> Result<(), String> {
    if let Some(re) = pattern {
        wait_for_pattern(process, ready, re).await?;
        debug!(service = %process.name(), pattern = %re, "Readiness pattern matched");
    }

    if !ready.grace.is_zero() {
        if let Ok(status) = timeout(ready.grace, process.wait()).await {
            return Err(format!(
                "exited during the {} grace period ({status})",
                format_duration(ready.grace)
            ));
        }
    }

    match process.exit_status() {
        Some(status) => Err(format!("exited before becoming ready ({status})")),
        None => Ok(()),
    }
}

async fn wait_for_pattern(
    process: &ServiceProcess,
    ready: &ReadinessConfig,
    re: &Regex,
) -> Result<(), String> {
    let (backlog, lines) = process.output().subscribe();
    if backlog.iter().any(|l| re.is_match(&l.line)) {
        return Ok(());
    }

    let search = async {
        while let Ok(line) = lines.recv().await {
            if re.is_match(&line.line) {
                return true;
            }
        }
        false
    };

    let matched = matches!(timeout(ready.timeout, search).await, Ok(true))
        // a lagging subscriber may have missed the line
        || process.output().contains(|l| re.is_match(l));
    if matched {
        return Ok(());
    }

    if let Some(status) = process.exit_status() {
        Err(format!("exited before printing '{re}' ({status})"))
    } else if process.output().is_closed() {
        Err(format!("closed its output before printing '{re}'"))
    } else {
        Err(format!(
            "no output matching '{re}' within {}",
            format_duration(ready.timeout)
        ))
    }
}
