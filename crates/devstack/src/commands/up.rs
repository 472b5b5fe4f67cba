use super::Project;
use crate::EXIT_INTERRUPTED;
use crate::output::ChangeTracker;
use anyhow::{Context, Result};
use async_runtime_compat::tokio::TokioSpawner;
use clap::Args;
use service_orchestration::{
    HealthMonitor, MonitorConfig, OrchestrationContext, ProcessOrchestrator, ServiceDescriptor,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

const DEFAULT_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Args)]
pub struct UpArgs {
    /// Services to start, with everything they use (default: all)
    services: Vec<String>,

    /// Services started at once within a dependency wave
    #[arg(long, default_value_t = 8)]
    max_parallel: usize,
}

/// Shortest configured check interval, so no service is checked less often
/// than it asked for
fn stream_interval(descriptors: &[ServiceDescriptor]) -> Duration {
    descriptors
        .iter()
        .filter_map(|d| d.health_check.as_ref().map(|h| h.interval))
        .min()
        .unwrap_or(DEFAULT_INTERVAL)
}

pub async fn run(project: &Project, args: UpArgs) -> Result<u8> {
    let stack = project.stack().await?;
    let descriptors = stack.select(&args.services)?;

    let registry = project.registry().await?;
    let context = OrchestrationContext::new(Arc::new(TokioSpawner::current()), registry);
    let monitor = Arc::new(
        HealthMonitor::new(&context, MonitorConfig::default()).with_cache(project.cache().await?),
    );
    let orchestrator = ProcessOrchestrator::new(context)
        .with_monitor(monitor.clone())
        .with_max_parallel(args.max_parallel);

    println!("Starting {} services...", descriptors.len());
    let started = orchestrator
        .start(&descriptors, &stack.env)
        .await
        .context("Startup failed; every service started by this run was stopped")?;
    for service in &started {
        match service.port {
            Some(port) => println!("  ✓ {} (pid {}, port {port})", service.name, service.pid),
            None => println!("  ✓ {} (pid {})", service.name, service.pid),
        }
    }

    let names: Vec<String> = started.iter().map(|s| s.name.clone()).collect();
    let (reports, cancel) = monitor.stream(names, stream_interval(&descriptors));
    println!("Watching health - press Ctrl+C to stop\n");

    let mut tracker = ChangeTracker::new();
    loop {
        tokio::select! {
            report = reports.recv() => {
                let Ok(report) = report else { break };
                for line in tracker.changes(&report) {
                    println!("{line}");
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }
    cancel.cancel();

    println!("\nStopping services...");
    let stopped = orchestrator.stop_all().await;
    info!(stopped = stopped.len(), "Shutdown complete");
    println!("Stopped {} services", stopped.len());
    Ok(EXIT_INTERRUPTED)
}

#[cfg(test)]
mod tests {
    use super::*;
    use service_orchestration::HealthCheckConfig;

    #[test]
    fn test_stream_interval_uses_shortest() {
        let mut fast = HealthCheckConfig::tcp();
        fast.interval = Duration::from_secs(2);
        let descriptors = vec![
            ServiceDescriptor::new("api", "api").with_health_check(HealthCheckConfig::tcp()),
            ServiceDescriptor::new("db", "db").with_health_check(fast),
            ServiceDescriptor::new("worker", "worker"),
        ];
        assert_eq!(stream_interval(&descriptors), Duration::from_secs(2));
        assert_eq!(stream_interval(&descriptors[2..]), DEFAULT_INTERVAL);
    }
}
