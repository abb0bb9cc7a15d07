//! Egress proxy rotation.
//!
//! `assign` hands out the least-recently-used proxy that is not disabled.
//! `report` feeds back the attempt outcome: a success resets the failure
//! streak, and `failure_threshold` consecutive failures take the proxy out
//! of rotation for `base_disable * 2^k`, where `k` counts how many times in a
//! row it has been disabled. A proxy coming back from a disable window is on
//! probation: one more failure disables it again with a doubled window.

use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use tokio::time::Instant;

use crate::config::ProxyConfig;

/// Snapshot of one proxy as seen by the rotator.
#[derive(Debug, Clone, PartialEq)]
pub struct ProxyEntry {
    pub address: String,
    /// Exponentially weighted success rate in `[0, 1]`.
    pub health_score: f64,
    pub consecutive_failures: u32,
    pub disabled_until: Option<Instant>,
}

impl ProxyEntry {
    fn new(address: String) -> Self {
        Self {
            address,
            health_score: 1.0,
            consecutive_failures: 0,
            disabled_until: None,
        }
    }

    pub fn is_available(&self, now: Instant) -> bool {
        self.disabled_until.is_none_or(|until| now >= until)
    }
}

#[derive(Debug)]
struct ProxySlot {
    entry: ProxyEntry,
    last_used: Option<Instant>,
    /// Consecutive disable windows without an intervening success.
    disable_streak: u32,
}

const HEALTH_WEIGHT: f64 = 0.2;

pub struct ProxyRotator {
    config: ProxyConfig,
    slots: Vec<Mutex<ProxySlot>>,
}

impl ProxyRotator {
    pub fn new(config: ProxyConfig) -> Self {
        let mut addresses: Vec<String> = Vec::new();
        for address in &config.proxies {
            if !addresses.contains(address) {
                addresses.push(address.clone());
            }
        }
        let slots = addresses
            .into_iter()
            .map(|address| {
                Mutex::new(ProxySlot {
                    entry: ProxyEntry::new(address),
                    last_used: None,
                    disable_streak: 0,
                })
            })
            .collect();
        Self { config, slots }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.rotation_enabled && !self.slots.is_empty()
    }

    pub fn pool_size(&self) -> usize {
        self.slots.len()
    }

    /// Number of proxies currently eligible for assignment.
    pub fn available(&self) -> usize {
        let now = Instant::now();
        self.slots
            .iter()
            .filter(|slot| self.lock(slot).entry.is_available(now))
            .count()
    }

    /// Pick the least-recently-used available proxy.
    ///
    /// Returns `None` when rotation is disabled, the pool is empty, or every
    /// proxy is inside a disable window.
    pub fn assign(&self, target_key: &str) -> Option<ProxyEntry> {
        if !self.is_enabled() {
            return None;
        }
        let now = Instant::now();

        let mut best: Option<(usize, Option<Instant>)> = None;
        for (idx, slot) in self.slots.iter().enumerate() {
            let slot = self.lock(slot);
            if !slot.entry.is_available(now) {
                continue;
            }
            // `None` (never used) sorts before any instant.
            if best.is_none_or(|(_, used)| slot.last_used < used) {
                best = Some((idx, slot.last_used));
            }
        }

        let (idx, _) = best?;
        let mut slot = self.lock(&self.slots[idx]);
        slot.last_used = Some(now);
        tracing::debug!(proxy = %slot.entry.address, key = %target_key, "Proxy assigned");
        Some(slot.entry.clone())
    }

    /// Record the outcome of an attempt made through `address`.
    pub fn report(&self, address: &str, success: bool) {
        let Some(slot) = self
            .slots
            .iter()
            .find(|slot| self.lock(slot).entry.address == address)
        else {
            tracing::debug!(proxy = %address, "Report for unknown proxy ignored");
            return;
        };
        let mut slot = self.lock(slot);
        let now = Instant::now();
        let observed = if success { 1.0 } else { 0.0 };
        slot.entry.health_score =
            (1.0 - HEALTH_WEIGHT) * slot.entry.health_score + HEALTH_WEIGHT * observed;

        if success {
            slot.entry.consecutive_failures = 0;
            slot.entry.disabled_until = None;
            slot.disable_streak = 0;
            return;
        }

        slot.entry.consecutive_failures += 1;
        if slot.entry.consecutive_failures >= self.config.failure_threshold.max(1) {
            let window = self.disable_window(slot.disable_streak);
            slot.entry.disabled_until = Some(now + window);
            slot.disable_streak = slot.disable_streak.saturating_add(1);
            tracing::warn!(
                proxy = %address,
                failures = slot.entry.consecutive_failures,
                disabled_secs = window.as_secs(),
                "Proxy disabled after consecutive failures"
            );
        }
    }

    /// Snapshot of every proxy, in configuration order.
    pub fn entries(&self) -> Vec<ProxyEntry> {
        self.slots
            .iter()
            .map(|slot| self.lock(slot).entry.clone())
            .collect()
    }

    fn disable_window(&self, streak: u32) -> Duration {
        let factor = 1u32.checked_shl(streak.min(31)).unwrap_or(u32::MAX);
        self.config
            .base_disable
            .saturating_mul(factor)
            .min(self.config.max_disable)
    }

    fn lock<'a>(&self, slot: &'a Mutex<ProxySlot>) -> MutexGuard<'a, ProxySlot> {
        slot.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Recovered from poisoned proxy slot");
            poisoned.into_inner()
        })
    }
}
