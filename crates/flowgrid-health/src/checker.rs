//! Readiness probe logic.
//!
//! Probes a started task through its readiness descriptor and tracks the
//! results with exponential backoff on errors.

use std::time::Duration;

use async_trait::async_trait;
use flowgrid_core::{ExecutionId, NodeId, ReadinessDescriptor, TaskRef};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Everything a readiness check needs to find a running task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskHandle {
    pub task: TaskRef,
    pub node: NodeId,
    /// Host name or address the task's ports are reachable on.
    pub host: String,
    /// Granted ports, ascending.
    pub ports: Vec<u16>,
    pub execution_id: ExecutionId,
    pub descriptor: ReadinessDescriptor,
}

impl TaskHandle {
    /// `host:port` for the descriptor's port index, if it has one.
    pub fn address(&self) -> Option<String> {
        let index = self.descriptor.port_index()?;
        self.ports.get(index).map(|port| format!("{}:{port}", self.host))
    }
}

/// Result of a single readiness check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "detail", rename_all = "snake_case")]
pub enum ReadinessOutcome {
    Ready,
    NotReady,
    /// The check itself could not be performed.
    Error(String),
}

/// Decides whether a started task is serving.
#[async_trait]
pub trait ReadinessCheck: Send + Sync {
    async fn check(&self, handle: &TaskHandle) -> ReadinessOutcome;
}

/// Built-in checks driven by the task's [`ReadinessDescriptor`].
#[derive(Debug, Clone)]
pub struct ProbeCheck {
    timeout: Duration,
}

impl ProbeCheck {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl ReadinessCheck for ProbeCheck {
    async fn check(&self, handle: &TaskHandle) -> ReadinessOutcome {
        match &handle.descriptor {
            ReadinessDescriptor::Immediate => ReadinessOutcome::Ready,
            ReadinessDescriptor::Tcp { port_index } => match handle.address() {
                Some(address) => tcp_probe(&address, self.timeout).await,
                None => ReadinessOutcome::Error(format!("task has no granted port #{port_index}")),
            },
            ReadinessDescriptor::Http { port_index, path } => match handle.address() {
                Some(address) => http_probe(&address, path, self.timeout).await,
                None => ReadinessOutcome::Error(format!("task has no granted port #{port_index}")),
            },
            ReadinessDescriptor::External { handle: external } => {
                ReadinessOutcome::Error(format!("no collaborator registered for external check {external}"))
            }
        }
    }
}

/// Tracks readiness results for a single task.
#[derive(Debug)]
pub struct ReadinessTracker {
    ready: bool,
    checks: u32,
    errors: u32,
    consecutive_errors: u32,
    last_error: Option<String>,
    current_interval: Duration,
    base_interval: Duration,
    max_interval: Duration,
}

impl ReadinessTracker {
    pub fn new(base_interval: Duration, max_interval: Duration) -> Self {
        Self {
            ready: false,
            checks: 0,
            errors: 0,
            consecutive_errors: 0,
            last_error: None,
            current_interval: base_interval,
            base_interval,
            max_interval: max_interval.max(base_interval),
        }
    }

    /// Record a check result and return whether the task is now ready.
    pub fn record(&mut self, outcome: &ReadinessOutcome) -> bool {
        self.checks += 1;
        match outcome {
            ReadinessOutcome::Ready => {
                if !self.ready {
                    debug!(checks = self.checks, "task became ready");
                }
                self.ready = true;
                self.consecutive_errors = 0;
                self.current_interval = self.base_interval;
            }
            ReadinessOutcome::NotReady => {
                self.consecutive_errors = 0;
                self.current_interval = self.base_interval;
            }
            ReadinessOutcome::Error(message) => {
                self.errors += 1;
                self.consecutive_errors += 1;
                self.last_error = Some(message.clone());

                // Exponential backoff: double the interval up to max.
                self.current_interval = (self.current_interval * 2).min(self.max_interval);
                if self.consecutive_errors == 3 {
                    warn!(error = %message, "readiness check keeps failing, backing off");
                }
            }
        }
        self.ready
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    pub fn checks(&self) -> u32 {
        self.checks
    }

    pub fn errors(&self) -> u32 {
        self.errors
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Interval before the next check.
    pub fn next_interval(&self) -> Duration {
        self.current_interval
    }
}

/// TCP connect probe: ready once a connection is accepted.
pub async fn tcp_probe(address: &str, timeout: Duration) -> ReadinessOutcome {
    match tokio::time::timeout(timeout, tokio::net::TcpStream::connect(address)).await {
        Ok(Ok(_)) => ReadinessOutcome::Ready,
        Ok(Err(e)) if e.kind() == std::io::ErrorKind::ConnectionRefused => {
            debug!(%address, "readiness probe refused");
            ReadinessOutcome::NotReady
        }
        Ok(Err(e)) => ReadinessOutcome::Error(format!("connect to {address}: {e}")),
        Err(_) => ReadinessOutcome::Error(format!("connect to {address} timed out")),
    }
}

/// HTTP GET probe: ready on 2xx, not ready on other statuses or a refused
/// connection, error on anything else.
pub async fn http_probe(address: &str, path: &str, timeout: Duration) -> ReadinessOutcome {
    let uri = format!("http://{address}{path}");

    let result = tokio::time::timeout(timeout, async {
        let stream = match tokio::net::TcpStream::connect(address).await {
            Ok(s) => s,
            Err(e) if e.kind() == std::io::ErrorKind::ConnectionRefused => {
                debug!(%uri, "readiness probe refused");
                return ReadinessOutcome::NotReady;
            }
            Err(e) => return ReadinessOutcome::Error(format!("connect to {address}: {e}")),
        };

        let io = hyper_util::rt::TokioIo::new(stream);
        let (mut sender, conn) = match hyper::client::conn::http1::handshake(io).await {
            Ok(pair) => pair,
            Err(e) => return ReadinessOutcome::Error(format!("handshake with {address}: {e}")),
        };

        // Drive the connection in the background.
        tokio::spawn(async move {
            let _ = conn.await;
        });

        let req = match http::Request::builder()
            .method("GET")
            .uri(&uri)
            .header("host", address)
            .header("user-agent", "flowgrid-health/0.1")
            .body(http_body_util::Empty::<bytes::Bytes>::new())
        {
            Ok(req) => req,
            Err(e) => return ReadinessOutcome::Error(format!("invalid probe request {uri}: {e}")),
        };

        match sender.send_request(req).await {
            Ok(resp) if resp.status().is_success() => ReadinessOutcome::Ready,
            Ok(resp) => {
                debug!(status = %resp.status(), %uri, "readiness probe non-2xx");
                ReadinessOutcome::NotReady
            }
            Err(e) => ReadinessOutcome::Error(format!("request {uri}: {e}")),
        }
    })
    .await;

    result.unwrap_or_else(|_| ReadinessOutcome::Error(format!("probe {uri} timed out")))
}
