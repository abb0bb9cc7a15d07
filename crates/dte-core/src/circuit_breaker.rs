//! Circuit breaker guarding the broker and result store.
//!
//! Only infrastructure failures count. A target returning 500s says nothing
//! about whether the engine can still reach its own backing services, so
//! fetch errors never trip the breaker.
//!
//! # Circuit States
//!
//! ```text
//! CLOSED (healthy) --[N failures]--> OPEN (rejecting) --[timeout]--> HALF_OPEN (probing)
//!                                                                         |
//!                                       <--[failure]--                    |
//!                                                                         |
//! CLOSED <---------------------------[success]----------------------------+
//! ```
//!
//! While open, workers stop dequeueing, submissions are refused and health
//! reports the engine as degraded.

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use crate::error::AppError;

/// Current state of the circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CircuitState {
    /// Backing services reachable.
    Closed,
    /// Calls are rejected without touching the backing service.
    Open,
    /// Probing: calls flow, and the next result decides the state.
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half-open",
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive infrastructure failures before opening.
    pub failure_threshold: u32,

    /// Successful trial calls in half-open needed to close again.
    pub success_threshold: u32,

    /// Time spent open before probing.
    pub recovery_timeout: Duration,

    /// Each failed trial call doubles the recovery timeout, up to this bound.
    pub max_recovery_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            recovery_timeout: Duration::from_secs(30),
            max_recovery_timeout: Duration::from_secs(300),
        }
    }
}

#[derive(Debug)]
struct CircuitBreakerInner {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    opened_at: Option<Instant>,
    last_error_message: Option<String>,
    current_recovery_timeout: Duration,
}

impl CircuitBreakerInner {
    fn new(config: &CircuitBreakerConfig) -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            opened_at: None,
            last_error_message: None,
            current_recovery_timeout: config.recovery_timeout,
        }
    }

    fn remaining_open(&self) -> Duration {
        self.opened_at
            .map(|t| self.current_recovery_timeout.saturating_sub(t.elapsed()))
            .unwrap_or(self.current_recovery_timeout)
    }

    fn open(&mut self, error: &AppError) {
        self.state = CircuitState::Open;
        self.opened_at = Some(Instant::now());
        self.success_count = 0;
        self.last_error_message = Some(error.to_string());
    }
}

/// Point-in-time view of the breaker, for health reporting.
#[derive(Debug, Clone)]
pub struct CircuitBreakerStats {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub last_error: Option<String>,
    pub time_until_half_open: Option<Duration>,
}

#[derive(Debug)]
pub enum CircuitBreakerError {
    /// Rejected without calling the backing service.
    Open { name: String, retry_after: Duration },
    /// The wrapped operation failed.
    Inner(AppError),
}

impl std::fmt::Display for CircuitBreakerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitBreakerError::Open { name, retry_after } => {
                write!(
                    f,
                    "Circuit breaker '{}' is open. Retry after {} seconds.",
                    name,
                    retry_after.as_secs()
                )
            }
            CircuitBreakerError::Inner(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for CircuitBreakerError {}

impl From<CircuitBreakerError> for AppError {
    fn from(err: CircuitBreakerError) -> Self {
        match err {
            CircuitBreakerError::Open { .. } => AppError::InfrastructureError(err.to_string()),
            CircuitBreakerError::Inner(e) => e,
        }
    }
}

/// Shared breaker; clones observe the same state.
#[derive(Clone)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Arc<Mutex<CircuitBreakerInner>>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let inner = CircuitBreakerInner::new(&config);
        Self {
            name: name.into(),
            config,
            inner: Arc::new(Mutex::new(inner)),
        }
    }

    fn lock_inner(&self) -> std::sync::MutexGuard<'_, CircuitBreakerInner> {
        self.inner.lock().unwrap_or_else(|poisoned| {
            tracing::warn!(circuit = %self.name, "Recovered from poisoned mutex");
            poisoned.into_inner()
        })
    }

    /// Current state, applying a pending Open → HalfOpen transition.
    pub fn state(&self) -> CircuitState {
        let mut inner = self.lock_inner();
        self.maybe_transition_to_half_open(&mut inner);
        inner.state
    }

    pub fn is_open(&self) -> bool {
        self.state() == CircuitState::Open
    }

    /// Time left before the breaker starts probing; zero unless open.
    pub fn retry_after(&self) -> Duration {
        let mut inner = self.lock_inner();
        self.maybe_transition_to_half_open(&mut inner);
        match inner.state {
            CircuitState::Open => inner.remaining_open(),
            _ => Duration::ZERO,
        }
    }

    pub fn stats(&self) -> CircuitBreakerStats {
        let mut inner = self.lock_inner();
        self.maybe_transition_to_half_open(&mut inner);

        let time_until_half_open =
            (inner.state == CircuitState::Open).then(|| inner.remaining_open());

        CircuitBreakerStats {
            name: self.name.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            last_error: inner.last_error_message.clone(),
            time_until_half_open,
        }
    }

    /// Run `operation` through the breaker.
    ///
    /// Rejected with [`CircuitBreakerError::Open`] while open. Errors that
    /// are not infrastructure failures pass through without being counted.
    pub async fn call<F, T, Fut>(&self, operation: F) -> Result<T, CircuitBreakerError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, AppError>>,
    {
        {
            let mut inner = self.lock_inner();
            self.maybe_transition_to_half_open(&mut inner);

            if inner.state == CircuitState::Open {
                return Err(CircuitBreakerError::Open {
                    name: self.name.clone(),
                    retry_after: inner.remaining_open(),
                });
            }
        }

        let result = operation().await;

        match &result {
            Ok(_) => self.record_success(),
            Err(e) if e.should_trip_circuit() => self.record_failure(e),
            Err(_) => {}
        }

        result.map_err(CircuitBreakerError::Inner)
    }

    pub fn record_success(&self) {
        let mut inner = self.lock_inner();

        match inner.state {
            CircuitState::HalfOpen => {
                inner.success_count += 1;
                if inner.success_count >= self.config.success_threshold {
                    tracing::info!(
                        circuit = %self.name,
                        "Circuit breaker closing after {} successful trial calls",
                        inner.success_count
                    );
                    inner.state = CircuitState::Closed;
                    inner.failure_count = 0;
                    inner.success_count = 0;
                    inner.opened_at = None;
                    inner.last_error_message = None;
                    inner.current_recovery_timeout = self.config.recovery_timeout;
                }
            }
            CircuitState::Closed => {
                inner.failure_count = 0;
            }
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self, error: &AppError) {
        let mut inner = self.lock_inner();
        self.maybe_transition_to_half_open(&mut inner);

        match inner.state {
            CircuitState::Closed => {
                inner.failure_count += 1;
                inner.last_error_message = Some(error.to_string());

                if inner.failure_count >= self.config.failure_threshold.max(1) {
                    tracing::error!(
                        circuit = %self.name,
                        failures = inner.failure_count,
                        error = %error,
                        "Circuit breaker opening after {} consecutive failures",
                        inner.failure_count
                    );
                    inner.open(error);
                }
            }
            CircuitState::HalfOpen => {
                inner.current_recovery_timeout = inner
                    .current_recovery_timeout
                    .saturating_mul(2)
                    .min(self.config.max_recovery_timeout);
                tracing::warn!(
                    circuit = %self.name,
                    error = %error,
                    recovery_timeout_secs = inner.current_recovery_timeout.as_secs(),
                    "Circuit breaker trial call failed, returning to open state"
                );
                inner.open(error);
            }
            CircuitState::Open => {
                inner.last_error_message = Some(error.to_string());
            }
        }
    }

    fn maybe_transition_to_half_open(&self, inner: &mut CircuitBreakerInner) {
        if inner.state == CircuitState::Open
            && let Some(opened_at) = inner.opened_at
            && opened_at.elapsed() >= inner.current_recovery_timeout
        {
            tracing::info!(
                circuit = %self.name,
                "Circuit breaker transitioning to half-open state"
            );
            inner.state = CircuitState::HalfOpen;
            inner.success_count = 0;
        }
    }
}
