use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

/// How a failed attempt should be treated by the retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Network failure or timeout; retried with the normal backoff.
    Transient,
    /// The remote side told us to slow down; retried with an extended backoff.
    RateLimited,
    /// The target itself is bad; dead-lettered immediately.
    Permanent,
}

impl FailureClass {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, FailureClass::Permanent)
    }
}

/// Application-wide error types for DTE.
#[derive(Error, Debug)]
pub enum AppError {
    /// Caller input was rejected before any work was scheduled.
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// No job exists with the given id.
    #[error("Job not found: {0}")]
    NotFound(Uuid),

    /// Connection reset, DNS failure, 5xx and similar.
    #[error("Network error: {0}")]
    TransientNetworkError(String),

    /// The attempt exceeded its hard timeout.
    #[error("Request timed out after {0} seconds")]
    Timeout(u64),

    /// The target answered with HTTP 429 (or an equivalent signal).
    #[error("Rate limited by remote{}", retry_after_suffix(.retry_after))]
    RemoteRateLimited { retry_after: Option<Duration> },

    /// The target can never succeed (bad URL, 404, blocked address).
    #[error("Permanent target error: {0}")]
    PermanentTargetError(String),

    /// Broker or store unavailable.
    #[error("Infrastructure error: {0}")]
    InfrastructureError(String),

    /// Invalid configuration value.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// JSON serialization/deserialization failed.
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

fn retry_after_suffix(retry_after: &Option<Duration>) -> String {
    match retry_after {
        Some(d) => format!(", retry after {}s", d.as_secs()),
        None => String::new(),
    }
}

impl AppError {
    /// Classify a fetch-time error. Errors that are not about the target
    /// (infrastructure, configuration) have no class and are handled elsewhere.
    pub fn failure_class(&self) -> Option<FailureClass> {
        match self {
            AppError::TransientNetworkError(_) | AppError::Timeout(_) => {
                Some(FailureClass::Transient)
            }
            AppError::RemoteRateLimited { .. } => Some(FailureClass::RateLimited),
            AppError::PermanentTargetError(_) | AppError::ValidationError(_) => {
                Some(FailureClass::Permanent)
            }
            _ => None,
        }
    }

    /// Returns true if this error is transient and worth retrying.
    pub fn is_retryable(&self) -> bool {
        self.failure_class().is_some_and(|c| c.is_retryable())
    }

    /// Returns true if this error should trip the infrastructure circuit breaker.
    pub fn should_trip_circuit(&self) -> bool {
        matches!(self, AppError::InfrastructureError(_))
    }

    /// Server-provided hint for rate-limited failures.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            AppError::RemoteRateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}
