//! Reachability and HTTP health probes.

use crate::backoff::backoff_delay;
use crate::error::Result;
use async_trait::async_trait;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};
use tracing::{debug, trace};

const PROBE_RETRY_BASE: Duration = Duration::from_millis(200);
const PROBE_RETRY_CAP: Duration = Duration::from_secs(1);

/// Whether something accepts TCP connections on `host:port` within `limit`
pub async fn port_in_use(host: &str, port: u16, limit: Duration) -> bool {
    match timeout(limit, TcpStream::connect((host, port))).await {
        Ok(Ok(_)) => true,
        Ok(Err(e)) => {
            trace!("{}:{} not reachable: {}", host, port, e);
            false
        }
        Err(_) => {
            trace!("{}:{} connect timed out after {:?}", host, port, limit);
            false
        }
    }
}

/// Longest one [`HttpHealthProbe::check`] can take over `paths` candidate paths
pub fn worst_case_duration(paths: usize, request_timeout: Duration, retries: u32) -> Duration {
    let requests = u32::try_from(paths).unwrap_or(u32::MAX).saturating_mul(retries + 1);
    let pauses: Duration = (0..retries)
        .map(|n| backoff_delay(n, PROBE_RETRY_BASE, PROBE_RETRY_CAP))
        .sum();
    request_timeout.saturating_mul(requests).saturating_add(pauses)
}

/// Classify a service as healthy or unhealthy
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn check(&self) -> bool;
}

/// A 200 body counts as healthy when it is empty or JSON without an `error` field
pub fn is_healthy_body(body: &str) -> bool {
    let body = body.trim();
    if body.is_empty() {
        return true;
    }

    match serde_json::from_str::<serde_json::Value>(body) {
        Ok(serde_json::Value::Object(map)) => !map.contains_key("error"),
        Ok(_) => true,
        Err(_) => false,
    }
}

/// HTTP health probe over an ordered list of candidate paths
#[derive(Debug, Clone)]
pub struct HttpHealthProbe {
    client: reqwest::Client,
    base_url: String,
    paths: Vec<String>,
    retries: u32,
}

impl HttpHealthProbe {
    pub fn new(
        base_url: impl Into<String>,
        paths: Vec<String>,
        request_timeout: Duration,
        retries: u32,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .connect_timeout(request_timeout)
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            paths,
            retries,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// One pass over every candidate path
    async fn check_once(&self) -> bool {
        for path in &self.paths {
            let url = format!("{}{}", self.base_url, path);
            match self.client.get(&url).send().await {
                Ok(response) if response.status() == reqwest::StatusCode::OK => {
                    match response.text().await {
                        Ok(body) if is_healthy_body(&body) => {
                            trace!("Health check passed at {}", url);
                            return true;
                        }
                        Ok(body) => {
                            debug!("Health check at {} reported an error: {}", url, body);
                        }
                        Err(e) => {
                            debug!("Failed to read health body from {}: {}", url, e);
                        }
                    }
                }
                Ok(response) => {
                    debug!("Health check at {} returned {}", url, response.status());
                }
                Err(e) => {
                    trace!("Health check at {} failed: {}", url, e);
                }
            }
        }

        false
    }
}

#[async_trait]
impl HealthProbe for HttpHealthProbe {
    async fn check(&self) -> bool {
        for attempt in 0..=self.retries {
            if attempt > 0 {
                sleep(backoff_delay(attempt - 1, PROBE_RETRY_BASE, PROBE_RETRY_CAP)).await;
            }
            if self.check_once().await {
                return true;
            }
        }

        debug!(
            "Health probe for {} failed after {} tries",
            self.base_url,
            self.retries + 1
        );
        false
    }
}
