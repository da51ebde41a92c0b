//! # Health Gate
//!
//! Single-shot readiness probes for started services. A probe answers healthy or not
//! and never fails, with one exception: a custom check without a predicate is a
//! configuration error, raised before any network activity.
//!
//! Retrying is the caller's business. [`HealthGate::wait_until_healthy`] composes a
//! probe with a constant-interval [`RetryPolicy`] built from the check's own
//! `retries` and `interval`.

use crate::error::{EngineError, EngineResult};
use crate::retry::RetryPolicy;
use crate::workflow::{HealthCheckSpec, HealthProbe};
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{debug, info};

#[derive(Debug, Clone)]
pub struct HealthGate {
    http: reqwest::Client,
}

impl Default for HealthGate {
    fn default() -> Self {
        // Probes target local services; never route them through a proxy. The probed
        // status is the one reported, so redirects are not followed.
        let http = reqwest::Client::builder()
            .no_proxy()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self::new(http)
    }
}

/// A probe that answered "not healthy"
#[derive(Debug, thiserror::Error)]
#[error("{probe} probe reported unhealthy")]
struct Unhealthy {
    probe: &'static str,
}

impl HealthGate {
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }

    /// Issue exactly one probe
    pub async fn probe(&self, spec: &HealthCheckSpec) -> EngineResult<bool> {
        let healthy = match &spec.probe {
            HealthProbe::Custom { predicate: None } => {
                return Err(EngineError::configuration(
                    "custom health check has no predicate",
                ));
            }
            HealthProbe::Custom {
                predicate: Some(predicate),
            } => predicate.is_healthy().await,
            HealthProbe::Tcp { host, port } => self.probe_tcp(host, *port, spec.timeout).await,
            HealthProbe::Http { host, port, path } => {
                self.probe_http(host, *port, path, spec.timeout).await
            }
        };

        debug!(probe = spec.probe.kind(), healthy, "Health probe finished");
        Ok(healthy)
    }

    async fn probe_tcp(&self, host: &str, port: u16, timeout: Duration) -> bool {
        match tokio::time::timeout(timeout, TcpStream::connect((host, port))).await {
            Ok(Ok(_stream)) => true,
            Ok(Err(e)) => {
                debug!(host, port, error = %e, "TCP probe connection failed");
                false
            }
            Err(_) => {
                debug!(host, port, timeout_ms = timeout.as_millis() as u64, "TCP probe timed out");
                false
            }
        }
    }

    async fn probe_http(&self, host: &str, port: u16, path: &str, timeout: Duration) -> bool {
        let url = format!("http://{host}:{port}{path}");
        match self.http.get(&url).timeout(timeout).send().await {
            Ok(response) => {
                let status = response.status();
                debug!(url = %url, status = status.as_u16(), "HTTP probe response");
                status.as_u16() < 400
            }
            Err(e) => {
                debug!(url = %url, error = %e, "HTTP probe request failed");
                false
            }
        }
    }

    /// Probe until healthy or the check's retries are exhausted.
    ///
    /// Returns `HealthCheck` naming `task` when the service never became ready.
    pub async fn wait_until_healthy(&self, task: &str, spec: &HealthCheckSpec) -> EngineResult<()> {
        spec.validate()?;

        let policy = RetryPolicy::constant(spec.retries, spec.interval);
        let operation = format!("health check for task '{task}'");
        let probe_kind = spec.probe.kind();

        let result = policy
            .run(&operation, |attempt| async move {
                debug!(task, attempt, probe = probe_kind, "Probing service health");
                match self.probe(spec).await {
                    Ok(true) => Ok(()),
                    Ok(false) => Err(Unhealthy { probe: probe_kind }),
                    // validate() above rules out configuration errors here
                    Err(_) => Err(Unhealthy { probe: probe_kind }),
                }
            })
            .await;

        match result {
            Ok(()) => {
                info!(task, probe = probe_kind, "✅ Service is healthy");
                Ok(())
            }
            Err(err) => Err(EngineError::HealthCheck {
                task: task.to_string(),
                attempts: err.attempts,
                last_error: err.source.to_string(),
            }),
        }
    }
}
