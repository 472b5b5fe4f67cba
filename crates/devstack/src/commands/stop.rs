use super::{Project, duration_arg};
use anyhow::{Context, Result, bail};
use clap::Args;
use command_executor::{kill_pid, process_alive, terminate_pid};
use service_registry::{Registry, ServiceEntry, ServiceStatus};
use std::io::{self, Write};
use std::time::{Duration, Instant};
use tracing::{info, warn};

#[derive(Debug, Args)]
pub struct StopArgs {
    /// Services to stop (default: all)
    services: Vec<String>,

    /// How long to wait after SIGTERM before sending SIGKILL
    #[arg(short, long, default_value = "10s", value_parser = duration_arg)]
    timeout: Duration,
}

pub async fn run(project: &Project, args: StopArgs) -> Result<u8> {
    let registry = project.registry().await?;
    let entries = registry.list().await;

    for name in &args.services {
        if !entries.iter().any(|e| &e.name == name) {
            bail!("Unknown service: {name}");
        }
    }

    let mut targets: Vec<ServiceEntry> = entries
        .into_iter()
        .filter(|e| args.services.is_empty() || args.services.contains(&e.name))
        .filter(|e| e.status.expects_process())
        .collect();
    if targets.is_empty() {
        println!("No services to stop");
        return Ok(0);
    }
    // most recently started first, so dependents go before what they use
    targets.sort_by(|a, b| b.start_time.cmp(&a.start_time));

    println!("Stopping {} services...", targets.len());
    let mut failures = Vec::new();
    for entry in &targets {
        print!("Stopping {}...", entry.name);
        io::stdout().flush()?;

        match stop_entry(&registry, entry, args.timeout).await {
            Ok(()) => println!(" ✓"),
            Err(e) => {
                println!(" ✗");
                eprintln!("  Error: {e:#}");
                failures.push(entry.name.clone());
            }
        }
    }

    if failures.is_empty() {
        Ok(0)
    } else {
        bail!("Failed to stop: {}", failures.join(", "))
    }
}

async fn stop_entry(registry: &Registry, entry: &ServiceEntry, grace: Duration) -> Result<()> {
    let name = entry.name.as_str();
    let Some(pid) = entry.pid.filter(|pid| process_alive(*pid)) else {
        registry
            .record_exit(name, ServiceStatus::Stopped, None, None)
            .await?;
        return Ok(());
    };

    registry
        .update_status(name, ServiceStatus::Stopping, None)
        .await?;
    terminate_pid(pid).with_context(|| format!("Failed to signal pid {pid}"))?;

    if !wait_for_exit(pid, grace).await {
        warn!(service = %name, pid, ?grace, "Still running after grace period, killing");
        kill_pid(pid).with_context(|| format!("Failed to kill pid {pid}"))?;
        if !wait_for_exit(pid, Duration::from_secs(2)).await {
            bail!("pid {pid} survived SIGKILL");
        }
    }

    registry
        .record_exit(name, ServiceStatus::Stopped, None, None)
        .await?;
    info!(service = %name, pid, "Stopped");
    Ok(())
}

async fn wait_for_exit(pid: u32, within: Duration) -> bool {
    let deadline = Instant::now() + within;
    while Instant::now() < deadline {
        if !process_alive(pid) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    !process_alive(pid)
}
