//! Per-user send spacing
//!
//! A user who has already sent `max_sends` messages must leave at least
//! `min_gap` between consecutive sends. The first `max_sends` sends are never
//! throttled.

use crate::error::{ChatError, Result};
use crate::metrics::METRICS;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::debug;

/// Checks between two sweeps of idle users
const PRUNE_EVERY: u64 = 1024;

#[derive(Debug, Clone, Copy)]
struct SendRecord {
    /// Accepted sends, capped at `max_sends`
    sends: usize,
    last: Instant,
}

pub struct RateLimiter {
    max_sends: usize,
    min_gap: Duration,
    idle_after: Duration,
    users: DashMap<String, SendRecord>,
    checks: AtomicU64,
}

impl RateLimiter {
    pub fn new(max_sends: usize, min_gap: Duration) -> Self {
        Self::with_idle_after(max_sends, min_gap, Duration::from_secs(3600))
    }

    /// Users silent for `idle_after` are forgotten and start a fresh count
    pub fn with_idle_after(max_sends: usize, min_gap: Duration, idle_after: Duration) -> Self {
        Self {
            max_sends,
            min_gap,
            idle_after: idle_after.max(min_gap),
            users: DashMap::new(),
            checks: AtomicU64::new(0),
        }
    }

    /// Record a send attempt, or reject it without recording
    pub fn check(&self, user_id: &str) -> Result<()> {
        self.check_at(user_id, Instant::now())
    }

    fn check_at(&self, user_id: &str, now: Instant) -> Result<()> {
        if self.checks.fetch_add(1, Ordering::Relaxed) % PRUNE_EVERY == PRUNE_EVERY - 1 {
            self.prune_at(now);
        }

        let mut entry = self.users.entry(user_id.to_string()).or_insert(SendRecord {
            sends: 0,
            last: now,
        });
        let record = entry.value_mut();

        let gap = now.saturating_duration_since(record.last);
        if record.sends >= self.max_sends && gap < self.min_gap {
            METRICS.record_rate_limit(false);
            debug!("Rate limit hit for user {}", user_id);
            return Err(ChatError::RateLimited {
                retry_after: self.min_gap - gap,
            });
        }

        record.sends = (record.sends + 1).min(self.max_sends);
        record.last = now;
        METRICS.record_rate_limit(true);
        Ok(())
    }

    /// Drop users whose last send is older than the idle horizon
    fn prune_at(&self, now: Instant) {
        let before = self.users.len();
        self.users
            .retain(|_, record| now.saturating_duration_since(record.last) < self.idle_after);
        let pruned = before.saturating_sub(self.users.len());
        if pruned > 0 {
            debug!("Pruned {} idle rate limit entries", pruned);
        }
    }

    pub fn tracked_users(&self) -> usize {
        self.users.len()
    }
}
