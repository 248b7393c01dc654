//! Health probe implementations.
//!
//! All probe kinds are polymorphic over the [`Probe`] trait: one
//! `check()` returning status, latency, and detail. Timeouts are
//! handled inside each probe; a timed-out check reports `Unknown`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::debug;

/// Result classification of a single probe execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeStatus {
    /// The target responded and passed the check.
    Healthy,
    /// The target responded but failed the check.
    Unhealthy,
    /// The check could not be executed (timeout, connection error).
    Unknown,
}

/// Outcome of a single probe.
#[derive(Debug, Clone)]
pub struct ProbeOutcome {
    pub status: ProbeStatus,
    pub latency: Duration,
    /// Status code, exit code, or error text.
    pub detail: Option<String>,
}

impl ProbeOutcome {
    fn unknown(latency: Duration, detail: impl Into<String>) -> Self {
        Self {
            status: ProbeStatus::Unknown,
            latency,
            detail: Some(detail.into()),
        }
    }
}

/// A single health check capability.
#[async_trait]
pub trait Probe: Send + Sync {
    /// Execute the check once.
    async fn check(&self) -> ProbeOutcome;
}

// ── HTTP ───────────────────────────────────────────────────────────

/// HTTP GET probe: 2xx (and optional body substring) passes.
pub struct HttpProbe {
    /// Target as `host:port`.
    pub address: String,
    /// Path to probe, e.g. `/healthz`.
    pub path: String,
    /// Optional substring the body must contain.
    pub body_contains: Option<String>,
    pub timeout: Duration,
}

#[async_trait]
impl Probe for HttpProbe {
    async fn check(&self) -> ProbeOutcome {
        let started = Instant::now();
        let uri = format!("http://{}{}", self.address, self.path);

        let result = tokio::time::timeout(self.timeout, async {
            let stream = match tokio::net::TcpStream::connect(&self.address).await {
                Ok(s) => s,
                Err(e) => {
                    debug!(error = %e, %uri, "http probe connection failed");
                    return ProbeOutcome::unknown(started.elapsed(), e.to_string());
                }
            };

            let io = hyper_util::rt::TokioIo::new(stream);
            let (mut sender, conn) = match hyper::client::conn::http1::handshake(io).await {
                Ok(pair) => pair,
                Err(e) => {
                    debug!(error = %e, %uri, "http probe handshake failed");
                    return ProbeOutcome::unknown(started.elapsed(), e.to_string());
                }
            };

            // Drive the connection in the background.
            tokio::spawn(async move {
                let _ = conn.await;
            });

            let req = match http::Request::builder()
                .method("GET")
                .uri(&uri)
                .header("host", &self.address)
                .header("user-agent", "helmplane-health/0.1")
                .body(http_body_util::Empty::<bytes::Bytes>::new())
            {
                Ok(req) => req,
                Err(e) => return ProbeOutcome::unknown(started.elapsed(), e.to_string()),
            };

            let resp = match sender.send_request(req).await {
                Ok(resp) => resp,
                Err(e) => {
                    debug!(error = %e, %uri, "http probe request failed");
                    return ProbeOutcome::unknown(started.elapsed(), e.to_string());
                }
            };

            let status_code = resp.status();
            let passed_status = status_code.is_success();

            let body_ok = match &self.body_contains {
                Some(needle) => {
                    use http_body_util::BodyExt;
                    match resp.into_body().collect().await {
                        Ok(collected) => {
                            let body = collected.to_bytes();
                            String::from_utf8_lossy(&body).contains(needle.as_str())
                        }
                        Err(_) => false,
                    }
                }
                None => true,
            };

            ProbeOutcome {
                status: if passed_status && body_ok {
                    ProbeStatus::Healthy
                } else {
                    ProbeStatus::Unhealthy
                },
                latency: started.elapsed(),
                detail: Some(format!("status {status_code}")),
            }
        })
        .await;

        match result {
            Ok(outcome) => outcome,
            Err(_) => {
                debug!(%uri, "http probe timed out");
                ProbeOutcome::unknown(started.elapsed(), "timeout")
            }
        }
    }
}

// ── TCP ────────────────────────────────────────────────────────────

/// TCP probe: a successful connect passes.
pub struct TcpProbe {
    pub address: String,
    pub timeout: Duration,
}

#[async_trait]
impl Probe for TcpProbe {
    async fn check(&self) -> ProbeOutcome {
        let started = Instant::now();
        match tokio::time::timeout(
            self.timeout,
            tokio::net::TcpStream::connect(&self.address),
        )
        .await
        {
            Ok(Ok(_)) => ProbeOutcome {
                status: ProbeStatus::Healthy,
                latency: started.elapsed(),
                detail: None,
            },
            Ok(Err(e)) => ProbeOutcome {
                status: ProbeStatus::Unhealthy,
                latency: started.elapsed(),
                detail: Some(e.to_string()),
            },
            Err(_) => ProbeOutcome::unknown(started.elapsed(), "timeout"),
        }
    }
}

// ── Command ────────────────────────────────────────────────────────

/// Command probe: exit code zero passes.
pub struct CommandProbe {
    pub program: String,
    pub args: Vec<String>,
    pub timeout: Duration,
}

#[async_trait]
impl Probe for CommandProbe {
    async fn check(&self) -> ProbeOutcome {
        let started = Instant::now();
        let mut command = tokio::process::Command::new(&self.program);
        command.args(&self.args).kill_on_drop(true);

        match tokio::time::timeout(self.timeout, command.status()).await {
            Ok(Ok(status)) => ProbeOutcome {
                status: if status.success() {
                    ProbeStatus::Healthy
                } else {
                    ProbeStatus::Unhealthy
                },
                latency: started.elapsed(),
                detail: Some(format!("exit {}", status.code().unwrap_or(-1))),
            },
            Ok(Err(e)) => ProbeOutcome::unknown(started.elapsed(), e.to_string()),
            Err(_) => ProbeOutcome::unknown(started.elapsed(), "timeout"),
        }
    }
}

// ── Custom ─────────────────────────────────────────────────────────

type CustomCheckFn = Arc<
    dyn Fn() -> std::pin::Pin<Box<dyn std::future::Future<Output = ProbeOutcome> + Send>>
        + Send
        + Sync,
>;

/// Adapter for protocol-level RPC checks (or any user-supplied logic).
///
/// The RPC client itself is an external collaborator; wrapping its
/// call in a `CustomProbe` plugs it into the monitor like any other
/// probe kind.
#[derive(Clone)]
pub struct CustomProbe {
    check_fn: CustomCheckFn,
}

impl CustomProbe {
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ProbeOutcome> + Send + 'static,
    {
        Self {
            check_fn: Arc::new(move || Box::pin(f())),
        }
    }
}

#[async_trait]
impl Probe for CustomProbe {
    async fn check(&self) -> ProbeOutcome {
        (self.check_fn)().await
    }
}
