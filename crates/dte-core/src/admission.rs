//! Per-target admission control.
//!
//! Every target key (`scheme://host:port`) gets two token buckets, one
//! refilled per minute and one per hour. A dispatch is admitted only when
//! both hold at least one token, and admission takes one from each under
//! the key's own lock, so concurrent workers never double-spend.
//!
//! Buckets are kept in a `moka` cache that evicts keys idle for longer than
//! the hour window. A bucket idle that long would be full again anyway, so
//! eviction never changes an admission result. The cache has no size bound:
//! evicting a busy key by size would hand it a full bucket early.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use moka::future::Cache;
use tokio::time::Instant;

use crate::config::RateLimitConfig;

const MINUTE: f64 = 60.0;
const HOUR: f64 = 3600.0;
const BUCKET_IDLE_EVICTION: Duration = Duration::from_secs(2 * 3600);

/// Result of an admission check.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AdmissionDecision {
    Granted,
    /// Denied; both buckets will hold a token again after `retry_after`.
    Denied { retry_after: Duration },
}

impl AdmissionDecision {
    pub fn is_granted(&self) -> bool {
        matches!(self, AdmissionDecision::Granted)
    }
}

/// Two-tier token bucket for one target key.
#[derive(Debug, Clone)]
pub struct RateLimitBucket {
    pub key: String,
    pub capacity_per_minute: u32,
    pub capacity_per_hour: u32,
    minute_tokens: f64,
    hour_tokens: f64,
    last_refill: Instant,
}

impl RateLimitBucket {
    pub fn new(key: impl Into<String>, capacity_per_minute: u32, capacity_per_hour: u32) -> Self {
        Self {
            key: key.into(),
            capacity_per_minute,
            capacity_per_hour,
            minute_tokens: f64::from(capacity_per_minute),
            hour_tokens: f64::from(capacity_per_hour),
            last_refill: Instant::now(),
        }
    }

    /// Current `(minute, hour)` token counts, refilled to `now`.
    pub fn tokens(&mut self) -> (f64, f64) {
        self.refill(Instant::now());
        (self.minute_tokens, self.hour_tokens)
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        if elapsed <= 0.0 {
            return;
        }
        let per_minute = f64::from(self.capacity_per_minute);
        let per_hour = f64::from(self.capacity_per_hour);
        self.minute_tokens = (self.minute_tokens + elapsed * per_minute / MINUTE).min(per_minute);
        self.hour_tokens = (self.hour_tokens + elapsed * per_hour / HOUR).min(per_hour);
        self.last_refill = now;
    }

    /// Take one token from both tiers, or report how long until that is possible.
    fn try_take(&mut self, now: Instant) -> AdmissionDecision {
        self.refill(now);

        if self.minute_tokens >= 1.0 && self.hour_tokens >= 1.0 {
            self.minute_tokens -= 1.0;
            self.hour_tokens -= 1.0;
            return AdmissionDecision::Granted;
        }

        let wait_minute = time_to_one_token(self.minute_tokens, self.capacity_per_minute, MINUTE);
        let wait_hour = time_to_one_token(self.hour_tokens, self.capacity_per_hour, HOUR);
        AdmissionDecision::Denied {
            retry_after: wait_minute.max(wait_hour),
        }
    }
}

fn time_to_one_token(tokens: f64, capacity: u32, window_secs: f64) -> Duration {
    if tokens >= 1.0 {
        return Duration::ZERO;
    }
    if capacity == 0 {
        return Duration::from_secs_f64(window_secs);
    }
    let rate = f64::from(capacity) / window_secs;
    Duration::from_secs_f64((1.0 - tokens) / rate)
}

/// Token-bucket gate consulted before every dispatch.
#[derive(Clone)]
pub struct AdmissionController {
    config: Arc<RateLimitConfig>,
    buckets: Cache<String, Arc<Mutex<RateLimitBucket>>>,
}

impl AdmissionController {
    pub fn new(config: RateLimitConfig) -> Self {
        let buckets = Cache::builder()
            .time_to_idle(BUCKET_IDLE_EVICTION)
            .build();
        Self {
            config: Arc::new(config),
            buckets,
        }
    }

    /// `true` if a dispatch to `target_key` may proceed now.
    pub async fn admit(&self, target_key: &str) -> bool {
        self.try_admit(target_key).await.is_granted()
    }

    pub async fn try_admit(&self, target_key: &str) -> AdmissionDecision {
        let bucket = self.bucket(target_key).await;
        let decision = lock_bucket(&bucket).try_take(Instant::now());
        if let AdmissionDecision::Denied { retry_after } = decision {
            tracing::debug!(
                key = %target_key,
                retry_after_ms = %retry_after.as_millis(),
                "Admission denied"
            );
        }
        decision
    }

    /// Current `(minute, hour)` tokens for a key, if it has been seen.
    pub async fn tokens(&self, target_key: &str) -> Option<(f64, f64)> {
        let bucket = self.buckets.get(target_key).await?;
        let tokens = lock_bucket(&bucket).tokens();
        Some(tokens)
    }

    /// Minimum delay before a denied job is offered again.
    pub fn denied_retry_delay(&self) -> Duration {
        self.config.denied_retry_delay
    }

    async fn bucket(&self, target_key: &str) -> Arc<Mutex<RateLimitBucket>> {
        let (per_minute, per_hour) = self.config.limits_for(target_key);
        self.buckets
            .get_with(target_key.to_string(), async move {
                Arc::new(Mutex::new(RateLimitBucket::new(
                    target_key, per_minute, per_hour,
                )))
            })
            .await
    }
}

fn lock_bucket(bucket: &Mutex<RateLimitBucket>) -> MutexGuard<'_, RateLimitBucket> {
    bucket.lock().unwrap_or_else(|poisoned| {
        tracing::warn!("Recovered from poisoned rate-limit bucket");
        poisoned.into_inner()
    })
}
