// Shared JSON-over-HTTP client for stage collaborators
//
// Every call is bounded by the stage timeout and guarded by the collaborator's
// circuit breaker.

use anyhow::{Context, Result};
use serde::{de::DeserializeOwned, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

use crate::core::errors::{StageFailure, StageResult};
use crate::middleware::circuit_breaker::{CircuitBreaker, CircuitBreakerStats};

/// Longest error body kept in a `Rejected` failure
const MAX_ERROR_BODY: usize = 512;

#[derive(Clone)]
pub struct StageHttpClient {
    http_client: reqwest::Client,
    circuit_breaker: CircuitBreaker,
    timeout: Duration,
}

impl StageHttpClient {
    pub fn new(service: &str, timeout: Duration) -> Result<Self> {
        Self::with_circuit_breaker(CircuitBreaker::new(service), timeout)
    }

    pub fn with_circuit_breaker(circuit_breaker: CircuitBreaker, timeout: Duration) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            http_client,
            circuit_breaker,
            timeout,
        })
    }

    pub fn service(&self) -> &str {
        self.circuit_breaker.service()
    }

    pub fn circuit_stats(&self) -> CircuitBreakerStats {
        self.circuit_breaker.stats()
    }

    pub async fn post_json<B, R>(&self, url: &str, body: &B) -> StageResult<R>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        self.send(self.http_client.post(url).json(body)).await
    }

    pub async fn post_json_authorized<B, R>(&self, url: &str, token: &str, body: &B) -> StageResult<R>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let request = self
            .http_client
            .post(url)
            .header("Authorization", format!("Bearer {}", token))
            .json(body);
        self.send(request).await
    }

    async fn send<R: DeserializeOwned>(&self, request: reqwest::RequestBuilder) -> StageResult<R> {
        self.circuit_breaker.guard()?;

        let call = async {
            let response = request.send().await.map_err(|e| self.classify(e))?;
            let status = response.status();
            if !status.is_success() {
                let mut body = response.text().await.unwrap_or_default();
                body.truncate(floor_char_boundary(&body, MAX_ERROR_BODY));
                return Err(StageFailure::Rejected {
                    status: status.as_u16(),
                    body,
                });
            }
            response.json::<R>().await.map_err(|e| self.classify(e))
        };

        let result = match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(StageFailure::Timeout { after: self.timeout }),
        };

        if let Err(e) = &result {
            warn!("{} call failed: {}", self.service(), e);
        } else {
            debug!("{} call succeeded", self.service());
        }
        self.circuit_breaker.observe(result)
    }

    fn classify(&self, err: reqwest::Error) -> StageFailure {
        if err.is_timeout() {
            StageFailure::Timeout { after: self.timeout }
        } else {
            StageFailure::from(err)
        }
    }
}

fn floor_char_boundary(s: &str, max: usize) -> usize {
    if s.len() <= max {
        return s.len();
    }
    (0..=max).rev().find(|i| s.is_char_boundary(*i)).unwrap_or(0)
}

/// Join a base URL and a route without doubling slashes
pub fn endpoint(base_url: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base_url.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}
