//! Health check strategies and the cascade that orders them
//!
//! Each strategy either declares itself inapplicable to a target (`None`)
//! or probes it and reports a status. The cascade tries strategies in
//! order and stops at the first applicable one, so a failing HTTP probe
//! never falls through to TCP.

use crate::config::{CheckType, HealthCheckConfig};
use async_runtime_compat::runtime_utils::timeout;
use async_trait::async_trait;
use command_executor::{Command, ExecuteOptions, execute, process_alive};
use reqwest::Client;
use serde_json::Value;
use service_registry::HealthState;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Paths tried, in order, when no endpoint is configured
pub const DISCOVERY_PATHS: [&str; 5] = ["/health", "/healthz", "/ready", "/alive", "/ping"];

/// Largest health response body that is read
pub const MAX_BODY_BYTES: usize = 1024 * 1024;

/// Why a probe failed
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProbeError {
    /// No answer within the probe timeout
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// Could not connect
    #[error("connection failed: {0}")]
    Connection(String),

    /// Connected, but the answer was a failure
    #[error("{0}")]
    Http(String),

    /// The probe was abandoned
    #[error("probe cancelled")]
    Cancelled,
}

/// Everything a strategy needs to probe one service
#[derive(Debug, Clone)]
pub struct ProbeTarget {
    /// Service name
    pub service: String,
    /// Host to probe
    pub host: String,
    /// Port to probe
    pub port: Option<u16>,
    /// Process to check
    pub pid: Option<u32>,
    /// Health-check settings
    pub config: HealthCheckConfig,
}

/// Result of one applicable probe
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeOutcome {
    /// Strategy that ran
    pub check_type: CheckType,
    /// Raw status, before grace period and retry smoothing
    pub status: HealthState,
    /// Probed URL or address
    pub endpoint: Option<String>,
    /// HTTP status code
    pub status_code: Option<u16>,
    /// Probe latency
    pub response_time: Duration,
    /// Failure detail
    pub error: Option<ProbeError>,
    /// Parsed JSON body
    pub details: Option<Value>,
}

impl ProbeOutcome {
    fn new(check_type: CheckType, status: HealthState, started: Instant) -> Self {
        Self {
            check_type,
            status,
            endpoint: None,
            status_code: None,
            response_time: started.elapsed(),
            error: None,
            details: None,
        }
    }

    fn failed(mut self, error: ProbeError) -> Self {
        self.status = HealthState::Unhealthy;
        self.error = Some(error);
        self
    }

    fn at(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }
}

/// One way of determining health
#[async_trait]
pub trait CheckStrategy: Send + Sync {
    /// Which check type this strategy implements
    fn kind(&self) -> CheckType;

    /// Probe `target`, or return `None` if this strategy does not apply
    async fn attempt(&self, target: &ProbeTarget) -> Option<ProbeOutcome>;
}

/// Ordered fallback chain of strategies
#[derive(Clone)]
pub struct Cascade {
    strategies: Vec<Arc<dyn CheckStrategy>>,
}

impl Cascade {
    /// HTTP, then TCP, then process liveness. The command strategy only
    /// runs when pinned with `type: command`.
    pub fn standard() -> Self {
        Self::new(vec![
            Arc::new(HttpStrategy::new()),
            Arc::new(TcpStrategy),
            Arc::new(ProcessStrategy),
            Arc::new(CommandStrategy),
        ])
    }

    /// A custom chain
    pub fn new(strategies: Vec<Arc<dyn CheckStrategy>>) -> Self {
        Self { strategies }
    }

    /// Run the first applicable strategy. A pinned `type` restricts the
    /// chain to that one strategy.
    pub async fn run(&self, target: &ProbeTarget) -> Option<ProbeOutcome> {
        for strategy in &self.strategies {
            if target
                .config
                .check_type
                .is_some_and(|pinned| pinned != strategy.kind())
            {
                continue;
            }
            if let Some(outcome) = strategy.attempt(target).await {
                trace!(service = %target.service, kind = %strategy.kind(), status = %outcome.status, "Probe finished");
                return Some(outcome);
            }
            debug!(service = %target.service, kind = %strategy.kind(), "Strategy not applicable");
        }
        None
    }
}

impl std::fmt::Debug for Cascade {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.strategies.iter().map(|s| s.kind()))
            .finish()
    }
}

/// Global shared HTTP client; each request sets its own timeout.
static SHARED_HTTP_CLIENT: OnceLock<Client> = OnceLock::new();

fn shared_client() -> &'static Client {
    SHARED_HTTP_CLIENT.get_or_init(|| {
        Client::builder()
            .timeout(Duration::from_secs(30))
            .pool_max_idle_per_host(10)
            .build()
            .unwrap_or_default()
    })
}

/// Map a JSON `status` field onto a health state
pub fn status_from_body(body: &Value) -> Option<HealthState> {
    let status = body.get("status")?.as_str()?;
    match status.to_ascii_lowercase().as_str() {
        "healthy" | "ok" | "up" => Some(HealthState::Healthy),
        "degraded" | "warning" => Some(HealthState::Degraded),
        "unhealthy" | "down" | "error" => Some(HealthState::Unhealthy),
        _ => None,
    }
}

enum HttpAnswer {
    /// The server answered
    Response {
        code: u16,
        body: Option<Value>,
    },
    /// The server answered but the body broke off
    Truncated { code: u16, error: ProbeError },
    /// No usable HTTP answer
    Transport(ProbeError),
}

/// HTTP GET against a configured or discovered endpoint
#[derive(Debug, Default)]
pub struct HttpStrategy {
    /// port -> path that answered during discovery
    discovered: Mutex<HashMap<u16, String>>,
}

impl HttpStrategy {
    /// New strategy with an empty discovery cache
    pub fn new() -> Self {
        Self::default()
    }

    async fn get(&self, url: &str, config: &HealthCheckConfig) -> HttpAnswer {
        let mut request = shared_client().get(url).timeout(config.timeout);
        for (name, value) in &config.headers {
            request = request.header(name, value);
        }

        let mut response = match request.send().await {
            Ok(response) => response,
            Err(e) if e.is_timeout() => {
                return HttpAnswer::Transport(ProbeError::Timeout(config.timeout));
            }
            Err(e) if e.is_connect() => {
                return HttpAnswer::Transport(ProbeError::Connection(e.to_string()));
            }
            Err(e) => return HttpAnswer::Transport(ProbeError::Http(e.to_string())),
        };

        let code = response.status().as_u16();
        let mut bytes = Vec::new();
        if response.status().is_success() {
            loop {
                match response.chunk().await {
                    Ok(Some(chunk)) => {
                        let room = MAX_BODY_BYTES - bytes.len();
                        bytes.extend_from_slice(&chunk[..chunk.len().min(room)]);
                        if bytes.len() >= MAX_BODY_BYTES {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        let error = if e.is_timeout() {
                            ProbeError::Timeout(config.timeout)
                        } else {
                            ProbeError::Http(format!("reading body: {e}"))
                        };
                        return HttpAnswer::Truncated { code, error };
                    }
                }
            }
        }
        let body = serde_json::from_slice::<Value>(&bytes)
            .ok()
            .filter(Value::is_object);
        HttpAnswer::Response { code, body }
    }

    fn outcome(url: String, code: u16, body: Option<Value>, started: Instant) -> ProbeOutcome {
        let mut outcome = ProbeOutcome::new(CheckType::Http, HealthState::Healthy, started).at(url);
        outcome.status_code = Some(code);
        if !(200..400).contains(&code) {
            return outcome.failed(ProbeError::Http(format!("HTTP {code}")));
        }
        if let Some(body) = body {
            if let Some(status) = status_from_body(&body) {
                outcome.status = status;
                if status == HealthState::Unhealthy {
                    outcome.error = Some(ProbeError::Http("endpoint reported unhealthy".into()));
                }
            }
            outcome.details = Some(body);
        }
        outcome
    }

    fn broken_body(url: String, code: u16, error: ProbeError, started: Instant) -> ProbeOutcome {
        let mut outcome = ProbeOutcome::new(CheckType::Http, HealthState::Unhealthy, started).at(url);
        outcome.status_code = Some(code);
        outcome.failed(error)
    }

    fn remember(&self, port: u16, path: &str) {
        self.discovered
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(port, path.to_string());
    }

    async fn discover(&self, target: &ProbeTarget, port: u16) -> Option<ProbeOutcome> {
        for path in DISCOVERY_PATHS {
            let url = format!("http://{}:{port}{path}", target.host);
            let started = Instant::now();
            match self.get(&url, &target.config).await {
                HttpAnswer::Response { code: 404 | 400, .. } => continue,
                HttpAnswer::Response { code, body } => {
                    debug!(service = %target.service, path, "Discovered health endpoint");
                    self.remember(port, path);
                    return Some(Self::outcome(url, code, body, started));
                }
                HttpAnswer::Truncated { code, error } => {
                    self.remember(port, path);
                    return Some(Self::broken_body(url, code, error, started));
                }
                // not an HTTP server, or not listening: let TCP decide
                HttpAnswer::Transport(_) => return None,
            }
        }
        None
    }
}

#[async_trait]
impl CheckStrategy for HttpStrategy {
    fn kind(&self) -> CheckType {
        CheckType::Http
    }

    async fn attempt(&self, target: &ProbeTarget) -> Option<ProbeOutcome> {
        let port = target.port?;
        let known = target.config.endpoint.clone().or_else(|| {
            self.discovered
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .get(&port)
                .cloned()
        });
        let Some(path) = known else {
            if target.config.check_type == Some(CheckType::Http) {
                // pinned without an endpoint: probe the first well-known path
                return Some(self.probe(target, port, DISCOVERY_PATHS[0]).await);
            }
            return self.discover(target, port).await;
        };
        Some(self.probe(target, port, &path).await)
    }
}

impl HttpStrategy {
    async fn probe(&self, target: &ProbeTarget, port: u16, path: &str) -> ProbeOutcome {
        let url = format!("http://{}:{port}{path}", target.host);
        let started = Instant::now();
        match self.get(&url, &target.config).await {
            HttpAnswer::Response { code, body } => Self::outcome(url, code, body, started),
            HttpAnswer::Truncated { code, error } => Self::broken_body(url, code, error, started),
            HttpAnswer::Transport(e) => {
                ProbeOutcome::new(CheckType::Http, HealthState::Unhealthy, started)
                    .at(url)
                    .failed(e)
            }
        }
    }
}

/// TCP connect to the service port
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpStrategy;

#[async_trait]
impl CheckStrategy for TcpStrategy {
    fn kind(&self) -> CheckType {
        CheckType::Tcp
    }

    async fn attempt(&self, target: &ProbeTarget) -> Option<ProbeOutcome> {
        let port = target.port?;
        let addr = format!("{}:{port}", target.host);
        let started = Instant::now();
        let connect = async_net::TcpStream::connect((target.host.as_str(), port));
        let outcome = ProbeOutcome::new(CheckType::Tcp, HealthState::Healthy, started);
        let outcome = match timeout(target.config.timeout, connect).await {
            Ok(Ok(_stream)) => outcome,
            Ok(Err(e)) => outcome.failed(ProbeError::Connection(e.to_string())),
            Err(_) => outcome.failed(ProbeError::Timeout(target.config.timeout)),
        };
        Some(ProbeOutcome {
            response_time: started.elapsed(),
            ..outcome.at(addr)
        })
    }
}

/// OS process liveness
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessStrategy;

#[async_trait]
impl CheckStrategy for ProcessStrategy {
    fn kind(&self) -> CheckType {
        CheckType::Process
    }

    async fn attempt(&self, target: &ProbeTarget) -> Option<ProbeOutcome> {
        let pid = target.pid?;
        let started = Instant::now();
        let outcome = ProbeOutcome::new(CheckType::Process, HealthState::Healthy, started)
            .at(format!("pid:{pid}"));
        if process_alive(pid) {
            Some(outcome)
        } else {
            Some(outcome.failed(ProbeError::Connection(format!("process {pid} is not running"))))
        }
    }
}

/// Run a command; exit 0 is healthy. Only runs when pinned.
#[derive(Debug, Default, Clone, Copy)]
pub struct CommandStrategy;

#[async_trait]
impl CheckStrategy for CommandStrategy {
    fn kind(&self) -> CheckType {
        CheckType::Command
    }

    async fn attempt(&self, target: &ProbeTarget) -> Option<ProbeOutcome> {
        if target.config.check_type != Some(CheckType::Command) {
            return None;
        }
        let command = Command::from_argv(&target.config.command)?;
        let started = Instant::now();
        let outcome = ProbeOutcome::new(CheckType::Command, HealthState::Healthy, started)
            .at(command.display());

        let result = execute(&command, ExecuteOptions::with_timeout(target.config.timeout)).await;
        let outcome = match result {
            Ok(exit) if exit.success() => outcome,
            Ok(exit) => {
                let stderr = exit.stderr.trim();
                let detail = if stderr.is_empty() {
                    format!("command failed ({})", exit.status)
                } else {
                    format!("command failed ({}): {stderr}", exit.status)
                };
                outcome.failed(ProbeError::Http(detail))
            }
            Err(command_executor::Error::Timeout { .. }) => {
                outcome.failed(ProbeError::Timeout(target.config.timeout))
            }
            Err(e) => outcome.failed(ProbeError::Connection(e.to_string())),
        };
        Some(ProbeOutcome {
            response_time: started.elapsed(),
            ..outcome
        })
    }
}
