use parking_lot::RwLock;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::core::errors::StageFailure;

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Calls pass through
    Closed,
    /// Collaborator considered down; calls fail fast
    Open,
    /// Cool-down elapsed; probe calls are let through
    HalfOpen,
}

/// Circuit breaker configuration
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before opening the circuit
    pub failure_threshold: usize,
    /// Time spent open before probing again
    pub cool_down: Duration,
    /// Consecutive half-open successes needed to close
    pub success_threshold: usize,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cool_down: Duration::from_secs(30),
            success_threshold: 2,
        }
    }
}

/// Fail-fast guard in front of one stage collaborator.
///
/// A stage service that keeps failing is short-circuited to
/// `StageFailure::CircuitOpen` until the cool-down passes, so requests do not
/// queue up behind timeouts against a dead endpoint.
#[derive(Clone)]
pub struct CircuitBreaker {
    service: Arc<str>,
    inner: Arc<RwLock<CircuitBreakerInner>>,
    config: CircuitBreakerConfig,
}

struct CircuitBreakerInner {
    state: CircuitState,
    consecutive_failures: usize,
    consecutive_successes: usize,
    opened_at: Option<Instant>,
    total_failures: usize,
    total_successes: usize,
    trips: usize,
}

impl CircuitBreaker {
    pub fn new(service: &str) -> Self {
        Self::with_config(service, CircuitBreakerConfig::default())
    }

    pub fn with_config(service: &str, config: CircuitBreakerConfig) -> Self {
        Self {
            service: Arc::from(service),
            inner: Arc::new(RwLock::new(CircuitBreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                consecutive_successes: 0,
                opened_at: None,
                total_failures: 0,
                total_successes: 0,
                trips: 0,
            })),
            config,
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    /// Admit a call, or fail fast while the circuit is open
    pub fn guard(&self) -> Result<(), StageFailure> {
        let mut inner = self.inner.write();

        match inner.state {
            CircuitState::Closed | CircuitState::HalfOpen => Ok(()),
            CircuitState::Open => {
                let cooled = inner
                    .opened_at
                    .map(|at| at.elapsed() >= self.config.cool_down)
                    .unwrap_or(true);
                if cooled {
                    info!("Circuit for {} half-open, probing", self.service);
                    inner.state = CircuitState::HalfOpen;
                    inner.consecutive_successes = 0;
                    Ok(())
                } else {
                    Err(StageFailure::CircuitOpen {
                        service: self.service.to_string(),
                    })
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.write();
        inner.total_successes += 1;
        inner.consecutive_failures = 0;

        if inner.state != CircuitState::Closed {
            inner.consecutive_successes += 1;
            if inner.consecutive_successes >= self.config.success_threshold {
                info!("Circuit for {} closed", self.service);
                inner.state = CircuitState::Closed;
                inner.consecutive_successes = 0;
                inner.opened_at = None;
            }
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.write();
        inner.total_failures += 1;
        inner.consecutive_successes = 0;
        inner.consecutive_failures += 1;

        let should_open = match inner.state {
            CircuitState::Closed => inner.consecutive_failures >= self.config.failure_threshold,
            // a failed probe reopens immediately
            CircuitState::HalfOpen => true,
            CircuitState::Open => false,
        };

        if should_open {
            warn!(
                "Circuit for {} opened after {} consecutive failures",
                self.service, inner.consecutive_failures
            );
            inner.state = CircuitState::Open;
            inner.opened_at = Some(Instant::now());
            inner.trips += 1;
        }
    }

    /// Record the outcome of a guarded call and pass it through
    pub fn observe<T>(&self, result: Result<T, StageFailure>) -> Result<T, StageFailure> {
        match &result {
            Ok(_) => self.record_success(),
            // the collaborator answered; a rejected request says nothing about its health
            Err(StageFailure::Rejected { status, .. }) if *status < 500 => self.record_success(),
            Err(_) => self.record_failure(),
        }
        result
    }

    pub fn state(&self) -> CircuitState {
        self.inner.read().state
    }

    pub fn stats(&self) -> CircuitBreakerStats {
        let inner = self.inner.read();
        CircuitBreakerStats {
            service: self.service.to_string(),
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            total_failures: inner.total_failures,
            total_successes: inner.total_successes,
            trips: inner.trips,
        }
    }
}

/// Circuit breaker statistics
#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerStats {
    pub service: String,
    pub state: CircuitState,
    pub consecutive_failures: usize,
    pub total_failures: usize,
    pub total_successes: usize,
    pub trips: usize,
}
