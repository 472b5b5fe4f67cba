use super::{Project, endpoint_arg, interval_arg, timeout_arg};
use crate::output::{ChangeTracker, HealthFormat, render_report, render_report_line};
use crate::EXIT_INTERRUPTED;
use anyhow::{Context, Result, bail};
use async_runtime_compat::tokio::TokioSpawner;
use clap::Args;
use service_orchestration::{HealthMonitor, HealthReport, MonitorConfig, OrchestrationContext};
use service_registry::atomic::{default_rename, write_atomic};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Args)]
pub struct HealthArgs {
    /// Services to check (default: every registered service)
    #[arg(short, long = "services", value_delimiter = ',')]
    services: Vec<String>,

    /// Output format
    #[arg(short, long, value_enum, default_value_t = HealthFormat::Text)]
    format: HealthFormat,

    /// Keep checking until Ctrl+C
    #[arg(long)]
    stream: bool,

    /// Time between evaluations when streaming
    #[arg(short, long, default_value = "5s", value_parser = interval_arg)]
    interval: Duration,

    /// Probe timeout for services without their own health check
    #[arg(short, long, default_value = "5s", value_parser = timeout_arg)]
    timeout: Duration,

    /// Health endpoint for services without their own health check
    /// (auto-discovered when omitted)
    #[arg(short, long, value_parser = endpoint_arg)]
    endpoint: Option<String>,

    /// Rewrite Prometheus metrics to this file after every evaluation
    #[arg(long, requires = "stream")]
    metrics_file: Option<PathBuf>,
}

pub async fn run(project: &Project, args: HealthArgs) -> Result<u8> {
    let registry = project.registry().await?;
    let unknown: Vec<&String> = {
        let known = registry.names();
        args.services.iter().filter(|s| !known.contains(s)).collect()
    };
    if !unknown.is_empty() {
        bail!(
            "Unknown service(s): {}",
            unknown.iter().map(|s| s.as_str()).collect::<Vec<_>>().join(", ")
        );
    }

    let config = MonitorConfig {
        default_timeout: args.timeout,
        default_endpoint: args.endpoint.clone(),
        follow_registry: true,
        ..MonitorConfig::default()
    };
    let context = OrchestrationContext::new(Arc::new(TokioSpawner::current()), registry);
    let monitor = HealthMonitor::new(&context, config).with_cache(project.cache().await?);

    if let Some(stack) = project.stack_if_present().await? {
        for descriptor in stack.descriptors() {
            monitor
                .register_descriptor(&descriptor)
                .with_context(|| format!("Invalid health check for '{}'", descriptor.name))?;
        }
    }
    let monitor = Arc::new(monitor);

    if !args.stream {
        let report = monitor.check_once(&args.services).await;
        println!("{}", render_report(&report, args.format)?);
        return Ok(u8::try_from(report.exit_code()).unwrap_or(1));
    }

    let (reports, cancel) = monitor.stream(args.services.clone(), args.interval);
    let mut tracker = ChangeTracker::new();
    let interrupted = loop {
        tokio::select! {
            report = reports.recv() => {
                let Ok(report) = report else { break false };
                print_streamed(&report, args.format, &mut tracker)?;
                if let Some(path) = &args.metrics_file {
                    write_metrics(&monitor, path).await;
                }
            }
            _ = tokio::signal::ctrl_c() => break true,
        }
    };
    cancel.cancel();

    if interrupted {
        debug!("Health stream interrupted");
        Ok(EXIT_INTERRUPTED)
    } else {
        bail!("Health stream ended unexpectedly")
    }
}

fn print_streamed(
    report: &HealthReport,
    format: HealthFormat,
    tracker: &mut ChangeTracker,
) -> Result<()> {
    match format {
        HealthFormat::Json => println!("{}", render_report_line(report)?),
        HealthFormat::Table => println!("{}\n", render_report(report, format)?),
        HealthFormat::Text => {
            for line in tracker.changes(report) {
                println!("{line}");
            }
        }
    }
    Ok(())
}

async fn write_metrics(monitor: &HealthMonitor, path: &Path) {
    let text = monitor.metrics().render_prometheus();
    if let Err(e) = write_atomic(path, text.as_bytes(), &default_rename()).await {
        warn!(path = %path.display(), error = %e, "Failed to write metrics file");
    }
}
