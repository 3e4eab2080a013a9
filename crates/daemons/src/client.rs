//! Shared HTTP transport for the three daemon adapters.
//!
//! One shape for every call: `post(op, request) -> response | DaemonError`,
//! with per-call timeout, exponential-backoff retry on transient failures
//! and a circuit breaker in front of the socket.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use crate::breaker::CircuitBreaker;
use crate::error::{DaemonError, Result};

/// Retry schedule: exponential backoff with jitter, base 1s, factor 2,
/// capped at 30s.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self.base_delay.saturating_mul(1u32 << attempt.min(16));
        let capped = exp.min(self.max_delay);
        // up to 10% jitter to avoid synchronized retries
        let jitter_ms = rand::thread_rng().gen_range(0..=capped.as_millis() as u64 / 10 + 1);
        capped + Duration::from_millis(jitter_ms)
    }
}

pub struct DaemonClient {
    name: &'static str,
    base_url: String,
    http: reqwest::Client,
    timeout: Duration,
    retry: RetryPolicy,
    breaker: Arc<CircuitBreaker>,
}

impl DaemonClient {
    pub fn new(
        name: &'static str,
        base_url: impl Into<String>,
        macaroon: Option<String>,
        timeout: Duration,
        retry: RetryPolicy,
    ) -> Result<Self> {
        let mut headers = reqwest::header::HeaderMap::new();
        if let Some(macaroon) = macaroon {
            let value = reqwest::header::HeaderValue::from_str(&macaroon)
                .map_err(|e| DaemonError::InvalidRequest(format!("bad macaroon header: {e}")))?;
            headers.insert("Grpc-Metadata-Macaroon", value);
        }
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()
            .map_err(|e| DaemonError::Unavailable(e.to_string()))?;
        Ok(Self {
            name,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http,
            timeout,
            retry,
            breaker: Arc::new(CircuitBreaker::new(name, 5, Duration::from_secs(60))),
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// One call through breaker + retry. Only transient errors are retried;
    /// protocol-level rejections surface on the first attempt.
    pub async fn post<Req, Resp>(&self, op: &str, request: &Req) -> Result<Resp>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        let mut attempt = 0u32;
        loop {
            if !self.breaker.allow() {
                return Err(DaemonError::CircuitOpen(self.name));
            }

            match self.post_once(op, request).await {
                Ok(resp) => {
                    self.breaker.on_success();
                    return Ok(resp);
                }
                Err(err) => {
                    self.breaker.on_failure();
                    if err.is_transient() && attempt + 1 < self.retry.max_attempts {
                        let delay = self.retry.delay_for(attempt);
                        warn!(
                            "{} {} failed (attempt {}/{}), retrying in {:?}: {}",
                            self.name,
                            op,
                            attempt + 1,
                            self.retry.max_attempts,
                            delay,
                            err
                        );
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(err);
                }
            }
        }
    }

    async fn post_once<Req, Resp>(&self, op: &str, request: &Req) -> Result<Resp>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        let url = format!("{}/{}", self.base_url, op.trim_start_matches('/'));
        debug!("{} -> {}", self.name, url);

        let response = self.http.post(&url).json(request).send().await.map_err(|e| {
            if e.is_timeout() {
                DaemonError::Timeout(self.timeout.as_secs())
            } else {
                DaemonError::Unavailable(e.to_string())
            }
        })?;

        let status = response.status();
        if status.is_success() {
            return response
                .json::<Resp>()
                .await
                .map_err(|e| DaemonError::Decode(e.to_string()));
        }

        let body = response.text().await.unwrap_or_default();
        Err(map_status(status, body))
    }
}

fn map_status(status: StatusCode, body: String) -> DaemonError {
    match status {
        StatusCode::CONFLICT => DaemonError::Conflict(body),
        StatusCode::NOT_FOUND => DaemonError::NotFound(body),
        StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => {
            DaemonError::InvalidRequest(body)
        }
        s if s.is_server_error() => DaemonError::Backend(format!("{s}: {body}")),
        s => DaemonError::Backend(format!("unexpected status {s}: {body}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_caps() {
        let policy = RetryPolicy::default();
        // jitter is at most 10%, so compare against the deterministic part
        assert!(policy.delay_for(0) >= Duration::from_secs(1));
        assert!(policy.delay_for(1) >= Duration::from_secs(2));
        assert!(policy.delay_for(2) >= Duration::from_secs(4));
        assert!(policy.delay_for(10) <= Duration::from_secs(33));
    }

    #[test]
    fn status_mapping_is_typed() {
        assert!(matches!(
            map_status(StatusCode::CONFLICT, String::new()),
            DaemonError::Conflict(_)
        ));
        assert!(matches!(
            map_status(StatusCode::BAD_REQUEST, String::new()),
            DaemonError::InvalidRequest(_)
        ));
        assert!(matches!(
            map_status(StatusCode::INTERNAL_SERVER_ERROR, String::new()),
            DaemonError::Backend(_)
        ));
    }
}
