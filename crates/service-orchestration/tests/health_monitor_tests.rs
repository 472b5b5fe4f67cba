//! Health monitor behavior against local test servers

use async_runtime_compat::tokio::TokioSpawner;
use service_orchestration::{
    BreakerConfig, CheckType, CircuitState, HealthCheckConfig, HealthMonitor, MonitorConfig,
    OrchestrationContext, RateLimitConfig, SkipReason,
};
use service_registry::{HealthState, Registry, ServiceEntry, ServiceStatus};
use std::sync::Arc;
use std::sync::atomic::{AtomicU16, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

/// Minimal HTTP responder counting every request it answers
struct TestServer {
    port: u16,
    status: Arc<AtomicU16>,
    hits: Arc<AtomicUsize>,
}

impl TestServer {
    async fn start(status: u16, body: &'static str) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let status = Arc::new(AtomicU16::new(status));
        let hits = Arc::new(AtomicUsize::new(0));

        let (code, counter) = (status.clone(), hits.clone());
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                let code = code.load(Ordering::SeqCst);
                tokio::spawn(async move {
                    let mut buf = [0u8; 4096];
                    let _ = socket.read(&mut buf).await;
                    let response = format!(
                        "HTTP/1.1 {code} Test\r\nContent-Type: application/json\r\n\
                         Content-Length: {}\r\nConnection: close\r\n\r\n{body}",
                        body.len()
                    );
                    let _ = socket.write_all(response.as_bytes()).await;
                    let _ = socket.shutdown().await;
                });
            }
        });

        Self { port, status, hits }
    }

    fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }

    fn set_status(&self, status: u16) {
        self.status.store(status, Ordering::SeqCst);
    }
}

fn quiet_config() -> MonitorConfig {
    MonitorConfig {
        rate_limit: None,
        cache_ttl: Duration::ZERO,
        default_timeout: Duration::from_secs(2),
        ..MonitorConfig::default()
    }
}

fn monitor(config: MonitorConfig) -> (Arc<HealthMonitor>, Arc<Registry>) {
    let registry = Arc::new(Registry::in_memory());
    let context = OrchestrationContext::new(Arc::new(TokioSpawner::current()), registry.clone());
    (Arc::new(HealthMonitor::new(&context, config)), registry)
}

async fn add_running(
    monitor: &HealthMonitor,
    registry: &Registry,
    name: &str,
    port: Option<u16>,
    pid: Option<u32>,
) {
    let mut entry = ServiceEntry::starting(name);
    if let Some(port) = port {
        entry = entry.with_port(port);
    }
    entry.pid = pid;
    registry.register(entry).await.unwrap();
    registry
        .update_status(name, ServiceStatus::Running, None)
        .await
        .unwrap();
    monitor.register_default(name);
}

/// Pid of a child that has already exited and been reaped
fn dead_pid() -> u32 {
    let mut child = std::process::Command::new("true").spawn().unwrap();
    child.wait().unwrap();
    child.id()
}

#[tokio::test]
async fn test_healthy_http_service() {
    let server = TestServer::start(200, r#"{"ok":true}"#).await;
    let (monitor, registry) = monitor(quiet_config());
    add_running(&monitor, &registry, "api", Some(server.port), None).await;

    let result = monitor.check_service("api").await;
    assert_eq!(result.status, HealthState::Healthy);
    assert_eq!(result.check_type, Some(CheckType::Http));
    assert_eq!(result.status_code, Some(200));
    assert!(result.endpoint.unwrap().ends_with("/health"));

    let entry = registry.get("api").await.unwrap();
    assert_eq!(entry.health, HealthState::Healthy);
    assert!(entry.last_checked.is_some());
}

#[tokio::test]
async fn test_json_body_reports_degraded() {
    let server = TestServer::start(200, r#"{"status":"degraded"}"#).await;
    let (monitor, registry) = monitor(quiet_config());
    add_running(&monitor, &registry, "api", Some(server.port), None).await;

    let result = monitor.check_service("api").await;
    assert_eq!(result.status, HealthState::Degraded);
    assert_eq!(result.details.unwrap()["status"], "degraded");
}

#[tokio::test]
async fn test_circuit_opens_after_five_failures() {
    let server = TestServer::start(500, "{}").await;
    let (monitor, registry) = monitor(quiet_config());
    add_running(&monitor, &registry, "api", Some(server.port), None).await;

    for _ in 0..5 {
        let result = monitor.check_service("api").await;
        assert_eq!(result.status, HealthState::Unhealthy);
        assert_eq!(result.skipped, None);
    }
    assert_eq!(server.hits(), 5);
    assert_eq!(monitor.breaker_state("api"), Some(CircuitState::Open));

    let result = monitor.check_service("api").await;
    assert_eq!(result.skipped, Some(SkipReason::CircuitOpen));
    assert_eq!(result.status, HealthState::Unhealthy);
    assert_eq!(server.hits(), 5);

    let metrics = monitor.metrics().service("api").unwrap();
    assert_eq!(metrics.checks, 5);
    assert_eq!(metrics.failures, 5);
    assert_eq!(metrics.skipped[&SkipReason::CircuitOpen], 1);
    assert_eq!(
        metrics.transitions[&(CircuitState::Closed, CircuitState::Open)],
        1
    );
}

#[tokio::test]
async fn test_half_open_trial_reopens_then_closes() {
    let server = TestServer::start(500, "{}").await;
    let config = MonitorConfig {
        breaker: BreakerConfig {
            failure_threshold: 1,
            cooldown: Duration::from_millis(200),
        },
        ..quiet_config()
    };
    let (monitor, registry) = monitor(config);
    add_running(&monitor, &registry, "api", Some(server.port), None).await;

    monitor.check_service("api").await;
    assert_eq!(monitor.breaker_state("api"), Some(CircuitState::Open));
    let skipped = monitor.check_service("api").await;
    assert_eq!(skipped.skipped, Some(SkipReason::CircuitOpen));
    assert_eq!(server.hits(), 1);

    tokio::time::sleep(Duration::from_millis(250)).await;
    let trial = monitor.check_service("api").await;
    assert_eq!(trial.skipped, None);
    assert_eq!(trial.status, HealthState::Unhealthy);
    assert_eq!(server.hits(), 2);
    assert_eq!(monitor.breaker_state("api"), Some(CircuitState::Open));

    server.set_status(200);
    tokio::time::sleep(Duration::from_millis(250)).await;
    let recovered = monitor.check_service("api").await;
    assert_eq!(recovered.status, HealthState::Healthy);
    assert_eq!(monitor.breaker_state("api"), Some(CircuitState::Closed));
}

#[tokio::test]
async fn test_rate_limit_defers_probe() {
    let server = TestServer::start(200, "{}").await;
    let config = MonitorConfig {
        rate_limit: Some(RateLimitConfig {
            capacity: 1,
            refill_per_sec: 1.0,
        }),
        ..quiet_config()
    };
    let (monitor, registry) = monitor(config);
    add_running(&monitor, &registry, "api", Some(server.port), None).await;

    let first = monitor.check_service("api").await;
    let second = monitor.check_service("api").await;
    assert_eq!(first.status, HealthState::Healthy);
    assert_eq!(second.skipped, Some(SkipReason::RateLimited));
    assert_eq!(second.status, HealthState::Healthy);
    assert_eq!(server.hits(), 1);
}

#[tokio::test]
async fn test_cache_hit_then_miss_on_config_change() {
    let server = TestServer::start(200, "{}").await;
    let config = MonitorConfig {
        cache_ttl: Duration::from_secs(30),
        ..quiet_config()
    };
    let (monitor, registry) = monitor(config);
    add_running(&monitor, &registry, "api", Some(server.port), None).await;

    let first = monitor.check_service("api").await;
    let second = monitor.check_service("api").await;
    assert!(!first.cached);
    assert!(second.cached);
    assert_eq!(second.status, HealthState::Healthy);
    assert_eq!(server.hits(), 1);
    assert_eq!(monitor.metrics().service("api").unwrap().cache_hits, 1);

    monitor
        .register("api", HealthCheckConfig::http("/status"))
        .await
        .unwrap();
    let third = monitor.check_service("api").await;
    assert!(!third.cached);
    assert!(third.endpoint.unwrap().ends_with("/status"));
    assert_eq!(server.hits(), 2);
}

#[tokio::test]
async fn test_falls_back_to_tcp_when_http_does_not_answer() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        // accept and hang up without speaking HTTP
        while let Ok((socket, _)) = listener.accept().await {
            drop(socket);
        }
    });

    let (monitor, registry) = monitor(quiet_config());
    add_running(&monitor, &registry, "db", Some(port), None).await;

    let result = monitor.check_service("db").await;
    assert_eq!(result.check_type, Some(CheckType::Tcp));
    assert_eq!(result.status, HealthState::Healthy);
}

#[tokio::test]
async fn test_falls_back_to_process_without_port() {
    let (monitor, registry) = monitor(quiet_config());
    add_running(&monitor, &registry, "worker", None, Some(std::process::id())).await;

    let result = monitor.check_service("worker").await;
    assert_eq!(result.check_type, Some(CheckType::Process));
    assert_eq!(result.status, HealthState::Healthy);
}

#[tokio::test]
async fn test_no_applicable_check_is_unknown() {
    let (monitor, registry) = monitor(quiet_config());
    add_running(&monitor, &registry, "ghost", None, None).await;

    let result = monitor.check_service("ghost").await;
    assert_eq!(result.status, HealthState::Unknown);
    assert!(result.error.is_some());
}

#[tokio::test]
async fn test_stopped_service_reported_unknown_without_probe() {
    let server = TestServer::start(200, "{}").await;
    let (monitor, registry) = monitor(quiet_config());
    add_running(&monitor, &registry, "api", Some(server.port), None).await;
    registry
        .record_exit("api", ServiceStatus::Stopped, Some(0), None)
        .await
        .unwrap();

    let result = monitor.check_service("api").await;
    assert_eq!(result.status, HealthState::Unknown);
    assert_eq!(server.hits(), 0);
}

#[tokio::test]
async fn test_start_period_reports_starting() {
    let server = TestServer::start(500, "{}").await;
    let (monitor, registry) = monitor(quiet_config());
    add_running(&monitor, &registry, "api", Some(server.port), None).await;
    monitor
        .register(
            "api",
            HealthCheckConfig::http("/health").with_start_period(Duration::from_secs(60)),
        )
        .await
        .unwrap();

    for _ in 0..6 {
        let result = monitor.check_service("api").await;
        assert_eq!(result.status, HealthState::Starting);
    }
    assert_eq!(monitor.breaker_state("api"), Some(CircuitState::Closed));
    assert_eq!(server.hits(), 6);
}

#[tokio::test]
async fn test_retries_delay_unhealthy() {
    let server = TestServer::start(503, "{}").await;
    let (monitor, registry) = monitor(quiet_config());
    add_running(&monitor, &registry, "api", Some(server.port), None).await;
    monitor
        .register("api", HealthCheckConfig::http("/health").with_retries(3))
        .await
        .unwrap();

    assert_eq!(
        monitor.check_service("api").await.status,
        HealthState::Starting
    );
    assert_eq!(
        monitor.check_service("api").await.status,
        HealthState::Starting
    );
    assert_eq!(
        monitor.check_service("api").await.status,
        HealthState::Unhealthy
    );
}

#[tokio::test]
async fn test_invalid_registration_rejected() {
    let (monitor, registry) = monitor(quiet_config());
    add_running(&monitor, &registry, "api", None, None).await;

    let too_slow = HealthCheckConfig::tcp()
        .with_port(8080)
        .with_timeout(Duration::from_secs(120));
    assert!(monitor.register("api", too_slow).await.is_err());
    assert!(monitor.register("api", HealthCheckConfig::tcp()).await.is_err());
}

#[tokio::test]
async fn test_check_once_covers_registry() {
    let healthy = TestServer::start(200, "{}").await;
    let failing = TestServer::start(500, "{}").await;
    let (monitor, registry) = monitor(quiet_config());
    add_running(&monitor, &registry, "api", Some(healthy.port), None).await;
    add_running(&monitor, &registry, "auth", Some(failing.port), None).await;

    let report = monitor.check_once(&[]).await;
    assert_eq!(report.services.len(), 2);
    assert_eq!(report.services[0].service_name, "api");
    assert_eq!(report.summary.healthy, 1);
    assert_eq!(report.summary.unhealthy, 1);
    assert_eq!(report.overall(), HealthState::Unhealthy);
    assert_eq!(report.exit_code(), 1);

    let only_api = monitor.check_once(&["api".to_string()]).await;
    assert_eq!(only_api.services.len(), 1);
    assert_eq!(only_api.exit_code(), 0);
}

#[tokio::test]
async fn test_stream_emits_until_cancelled() {
    let server = TestServer::start(200, "{}").await;
    let (monitor, registry) = monitor(quiet_config());
    add_running(&monitor, &registry, "api", Some(server.port), None).await;

    let (reports, token) = monitor.stream(Vec::new(), Duration::from_millis(50));
    let first = reports.recv().await.unwrap();
    assert_eq!(first.overall(), HealthState::Healthy);
    let second = reports.recv().await.unwrap();
    assert!(second.timestamp >= first.timestamp);

    token.cancel();
    let drained = tokio::time::timeout(Duration::from_secs(2), async {
        while reports.recv().await.is_ok() {}
    })
    .await;
    assert!(drained.is_ok(), "stream did not stop after cancel");
}

#[tokio::test]
async fn test_removed_target_forgets_breaker() {
    let server = TestServer::start(500, "{}").await;
    let (monitor, registry) = monitor(quiet_config());
    add_running(&monitor, &registry, "api", Some(server.port), None).await;

    monitor.check_service("api").await;
    assert!(monitor.breaker_state("api").is_some());
    monitor.remove_target("api");
    assert_eq!(monitor.breaker_state("api"), None);

    let result = monitor.check_service("api").await;
    assert_eq!(result.status, HealthState::Unknown);
    assert_eq!(monitor.breaker_state("api"), None, "check must not recreate the target");
    assert_eq!(server.hits(), 1);
}

#[tokio::test]
async fn test_service_without_target_is_not_probed() {
    let server = TestServer::start(200, "{}").await;
    let (monitor, registry) = monitor(quiet_config());
    registry
        .register(ServiceEntry::starting("api").with_port(server.port))
        .await
        .unwrap();

    let result = monitor.check_service("api").await;
    assert_eq!(result.status, HealthState::Unknown);
    assert_eq!(result.error.as_deref(), Some("no health check registered"));
    assert_eq!(server.hits(), 0);
    assert_eq!(monitor.breaker_state("api"), None);
}

#[tokio::test]
async fn test_crashed_process_reported_unhealthy() {
    let (monitor, registry) = monitor(quiet_config());
    add_running(&monitor, &registry, "worker", None, Some(dead_pid())).await;

    let result = monitor.check_service("worker").await;
    assert_eq!(result.status, HealthState::Unhealthy);
    assert_eq!(result.check_type, Some(CheckType::Process));

    let report = monitor.check_once(&[]).await;
    assert_eq!(report.overall(), HealthState::Unhealthy);
    assert_eq!(report.exit_code(), 1);
}

#[tokio::test]
async fn test_error_status_reported_unhealthy_without_probe() {
    let server = TestServer::start(200, "{}").await;
    let (monitor, registry) = monitor(quiet_config());
    add_running(&monitor, &registry, "api", Some(server.port), None).await;
    registry
        .record_exit("api", ServiceStatus::Error, Some(3), None)
        .await
        .unwrap();

    let result = monitor.check_service("api").await;
    assert_eq!(result.status, HealthState::Unhealthy);
    assert!(result.error.unwrap().contains("code 3"));
    assert_eq!(server.hits(), 0);
}

#[tokio::test]
async fn test_concurrent_checks_share_rate_limit() {
    let server = TestServer::start(200, "{}").await;
    let config = MonitorConfig {
        rate_limit: Some(RateLimitConfig {
            capacity: 1,
            refill_per_sec: 1.0,
        }),
        ..quiet_config()
    };
    let (monitor, registry) = monitor(config);
    add_running(&monitor, &registry, "api", Some(server.port), None).await;

    let (a, b) = tokio::join!(monitor.check_service("api"), monitor.check_service("api"));
    let limited = [&a, &b]
        .iter()
        .filter(|r| r.skipped == Some(SkipReason::RateLimited))
        .count();
    assert_eq!(limited, 1);
    assert_eq!(server.hits(), 1);
}
