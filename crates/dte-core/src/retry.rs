//! Retry and backoff decisions.
//!
//! The manager is pure: it looks at a job and the failure of its latest
//! attempt and returns what should happen next. Applying the decision
//! (re-queueing or dead-lettering) is up to the worker.
//!
//! A job may start at most `max_retries + 1` attempts. The un-jittered delay
//! for retry `n` is `base * 2^(n-1)` (times `rate_limit_multiplier` when the
//! remote rate-limited us), capped at `max_delay`, and never shorter than
//! the delay used for the job's previous retry.

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use rand::Rng;

use crate::config::RetryConfig;
use crate::error::FailureClass;
use crate::job::{Attempt, Job};

/// What to do with a job after a failed attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum NextAction {
    Retry {
        /// Delay including jitter.
        delay: Duration,
        /// Un-jittered delay; stored on the job to keep the sequence monotonic.
        backoff: Duration,
        not_before: DateTime<Utc>,
    },
    DeadLetter {
        reason: String,
    },
}

impl NextAction {
    pub fn will_retry(&self) -> bool {
        matches!(self, NextAction::Retry { .. })
    }
}

#[derive(Debug, Clone)]
pub struct RetryManager {
    config: RetryConfig,
}

impl RetryManager {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Decide the next step for `job` after `attempt` failed with `class`.
    ///
    /// `job.attempt_count` must already include `attempt`.
    pub fn on_failure(
        &self,
        job: &Job,
        attempt: &Attempt,
        class: FailureClass,
        retry_after: Option<Duration>,
    ) -> NextAction {
        if !class.is_retryable() {
            return NextAction::DeadLetter {
                reason: attempt
                    .error_detail
                    .clone()
                    .unwrap_or_else(|| "permanent target error".to_string()),
            };
        }

        // Retries used so far is attempt_count - 1.
        if job.attempt_count > job.max_retries {
            return NextAction::DeadLetter {
                reason: format!(
                    "retries exhausted after {} attempts: {}",
                    job.attempt_count,
                    attempt.error_detail.as_deref().unwrap_or("unknown error")
                ),
            };
        }

        let previous = Duration::from_millis(job.last_backoff_ms);
        let mut backoff = self.backoff_for(job.attempt_count, class).max(previous);
        if let Some(hint) = retry_after {
            backoff = backoff.max(hint.min(self.config.max_delay));
        }

        let delay = self.apply_jitter(backoff);
        let not_before = Utc::now() + TimeDelta::milliseconds(delay.as_millis() as i64);

        NextAction::Retry {
            delay,
            backoff,
            not_before,
        }
    }

    /// Un-jittered delay before the retry that follows attempt `attempt_count` (1-based).
    pub fn backoff_for(&self, attempt_count: u32, class: FailureClass) -> Duration {
        let exponent = attempt_count.saturating_sub(1).min(31);
        let multiplier = match class {
            FailureClass::RateLimited => self.config.rate_limit_multiplier.max(1),
            _ => 1,
        };
        let factor = (1u64 << exponent).saturating_mul(u64::from(multiplier));
        let base_ms = self.config.base_delay.as_millis().min(u128::from(u64::MAX)) as u64;
        let delay = Duration::from_millis(base_ms.saturating_mul(factor));
        delay.min(self.config.max_delay)
    }

    fn apply_jitter(&self, backoff: Duration) -> Duration {
        if self.config.jitter <= 0.0 {
            return backoff;
        }
        let mut rng = rand::thread_rng();
        backoff.mul_f64(1.0 + rng.gen_range(0.0..self.config.jitter.min(1.0)))
    }
}
