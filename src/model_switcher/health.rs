//! Readiness probing for freshly started backends
//!
//! A cold-starting inference server refuses connections for a while and then answers its
//! health endpoint once weights are loaded. [`HealthProber`] polls that endpoint at a fixed
//! interval until it answers with a success status or the deadline runs out. Any failed
//! attempt, including a refused connection, just means "not yet".

use crate::client::HttpClient;
use async_trait::async_trait;
use axum::http::{Method, Request};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};
use url::Url;

/// Outcome of waiting for a backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Ready { attempts: u32, elapsed: Duration },
    TimedOut { attempts: u32, elapsed: Duration },
}

impl Readiness {
    pub fn is_ready(&self) -> bool {
        matches!(self, Readiness::Ready { .. })
    }

    pub fn elapsed(&self) -> Duration {
        match self {
            Readiness::Ready { elapsed, .. } | Readiness::TimedOut { elapsed, .. } => *elapsed,
        }
    }
}

/// Waits for a backend to become ready.
#[async_trait]
pub trait ReadinessProbe: Send + Sync + std::fmt::Debug {
    async fn await_ready(&self, base_url: &Url, deadline: Duration) -> Readiness;
}

/// Polls `GET <base_url><path>` through an [`HttpClient`].
#[derive(Debug)]
pub struct HealthProber<C: HttpClient> {
    client: Arc<C>,
    path: String,
    interval: Duration,
    call_timeout: Duration,
}

impl<C: HttpClient> HealthProber<C> {
    pub fn new(client: Arc<C>) -> Self {
        Self {
            client,
            path: "/health".to_string(),
            interval: Duration::from_secs(1),
            call_timeout: Duration::from_secs(1),
        }
    }

    /// Set the readiness path, e.g. `/health` or `/v1/models`
    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    /// Set the pause between attempts
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Set the timeout for a single attempt
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    fn max_attempts(&self, deadline: Duration) -> u32 {
        let interval = self.interval.max(Duration::from_millis(1));
        let attempts = deadline.as_millis().div_ceil(interval.as_millis()).max(1);
        u32::try_from(attempts).unwrap_or(u32::MAX)
    }

    async fn probe_once(&self, url: &Url, timeout: Duration) -> Result<(), String> {
        let request = Request::builder()
            .method(Method::GET)
            .uri(url.as_str())
            .body(axum::body::Body::empty())
            .map_err(|e| format!("Failed to build request: {}", e))?;

        match tokio::time::timeout(timeout, self.client.request(request)).await {
            Ok(Ok(response)) if response.status().is_success() => Ok(()),
            Ok(Ok(response)) => Err(format!("status {}", response.status())),
            Ok(Err(e)) => Err(format!("request failed: {}", e)),
            Err(_) => Err("probe timeout".to_string()),
        }
    }
}

#[async_trait]
impl<C: HttpClient + 'static> ReadinessProbe for HealthProber<C> {
    async fn await_ready(&self, base_url: &Url, deadline: Duration) -> Readiness {
        let start = Instant::now();
        let max_attempts = self.max_attempts(deadline);

        let url = match base_url.join(self.path.trim_start_matches('/')) {
            Ok(url) => url,
            Err(e) => {
                debug!(base_url = %base_url, error = %e, "Cannot build readiness url");
                return Readiness::TimedOut {
                    attempts: 0,
                    elapsed: start.elapsed(),
                };
            }
        };

        let mut attempts = 0;
        while attempts < max_attempts {
            let remaining = deadline.saturating_sub(start.elapsed());
            if remaining.is_zero() {
                break;
            }

            attempts += 1;
            match self.probe_once(&url, self.call_timeout.min(remaining)).await {
                Ok(()) => {
                    let elapsed = start.elapsed();
                    info!(url = %url, attempts, elapsed = ?elapsed, "Backend is ready");
                    return Readiness::Ready { attempts, elapsed };
                }
                Err(reason) => {
                    debug!(url = %url, attempt = attempts, reason = %reason, "Backend not ready yet");
                }
            }

            let remaining = deadline.saturating_sub(start.elapsed());
            tokio::time::sleep(self.interval.min(remaining)).await;
        }

        Readiness::TimedOut {
            attempts,
            elapsed: start.elapsed(),
        }
    }
}
