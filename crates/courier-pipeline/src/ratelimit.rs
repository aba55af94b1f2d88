//! Fixed-window rate limiting per (identity, operation class).
//!
//! Counters live in a `CounterStore`; the in-memory store is authoritative
//! for a single instance only. If the store is unreachable the limiter fails
//! open. Identities that keep violating are blocked outright for a
//! configurable period; violation counters and block state expire by TTL.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, warn};

use courier_common::{Clock, RateClass};

use crate::audit::AuditLogger;

/// Backing store for window counters. Increments must be atomic; entries
/// carry a TTL so sweeps are unnecessary.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Atomically increment and return the post-increment count.
    async fn increment(&self, key: &str, ttl: Duration) -> Result<u32>;

    /// Current count without incrementing.
    async fn get(&self, key: &str) -> Result<u32>;

    /// Remove a counter (admin/testing).
    async fn remove(&self, key: &str) -> Result<()>;
}

struct CounterEntry {
    count: u32,
    expires_at: DateTime<Utc>,
}

/// Process-local counter store.
pub struct InMemoryCounterStore {
    clock: Arc<dyn Clock>,
    counters: DashMap<String, CounterEntry>,
}

impl InMemoryCounterStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            counters: DashMap::new(),
        }
    }
}

#[async_trait]
impl CounterStore for InMemoryCounterStore {
    async fn increment(&self, key: &str, ttl: Duration) -> Result<u32> {
        let now = self.clock.now_utc();
        let mut entry = self.counters.entry(key.to_string()).or_insert_with(|| CounterEntry {
            count: 0,
            expires_at: now + chrono::Duration::from_std(ttl).unwrap_or_default(),
        });
        if entry.expires_at <= now {
            entry.count = 0;
            entry.expires_at = now + chrono::Duration::from_std(ttl).unwrap_or_default();
        }
        entry.count += 1;
        Ok(entry.count)
    }

    async fn get(&self, key: &str) -> Result<u32> {
        let now = self.clock.now_utc();
        Ok(self
            .counters
            .get(key)
            .filter(|entry| entry.expires_at > now)
            .map(|entry| entry.count)
            .unwrap_or(0))
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.counters.remove(key);
        Ok(())
    }
}

/// Limiter configuration; defaults match the documented per-class limits.
#[derive(Debug, Clone)]
pub struct RateLimiterConfig {
    pub window: Duration,
    pub read_limit: u32,
    pub write_limit: u32,
    pub admin_limit: u32,
    pub public_limit: u32,
    pub violation_threshold: u32,
    pub violation_window: Duration,
    pub block_duration: Duration,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(60),
            read_limit: 100,
            write_limit: 50,
            admin_limit: 20,
            public_limit: 20,
            violation_threshold: 3,
            violation_window: Duration::from_secs(300),
            block_duration: Duration::from_secs(300),
        }
    }
}

impl RateLimiterConfig {
    pub fn limit(&self, class: RateClass) -> u32 {
        match class {
            RateClass::Read => self.read_limit,
            RateClass::Write => self.write_limit,
            RateClass::Admin => self.admin_limit,
            RateClass::Public => self.public_limit,
        }
    }
}

/// Outcome of an `allow` check.
#[derive(Debug, Clone)]
pub struct Decision {
    pub allowed: bool,
    pub remaining: u32,
    pub reset_at: DateTime<Utc>,
}

pub struct RateLimiter {
    config: RateLimiterConfig,
    store: Arc<dyn CounterStore>,
    clock: Arc<dyn Clock>,
    audit: Arc<AuditLogger>,
    /// Deny timestamps per identity, pruned to the violation window.
    violations: DashMap<String, Mutex<VecDeque<DateTime<Utc>>>>,
    /// Blocked identities and when the block lifts.
    blocked: DashMap<String, DateTime<Utc>>,
}

impl RateLimiter {
    pub fn new(
        config: RateLimiterConfig,
        store: Arc<dyn CounterStore>,
        clock: Arc<dyn Clock>,
        audit: Arc<AuditLogger>,
    ) -> Self {
        Self {
            config,
            store,
            clock,
            audit,
            violations: DashMap::new(),
            blocked: DashMap::new(),
        }
    }

    fn window_index(&self, now: DateTime<Utc>) -> i64 {
        now.timestamp() / self.config.window.as_secs() as i64
    }

    fn window_reset(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let width = self.config.window.as_secs() as i64;
        let next = (self.window_index(now) + 1) * width;
        Utc.timestamp_opt(next, 0).single().unwrap_or(now)
    }

    fn counter_key(&self, identity: &str, class: RateClass, window: i64) -> String {
        format!("{identity}:{class}:{window}")
    }

    /// Check whether an operation is allowed, counting it if so.
    pub async fn allow(&self, identity: &str, class: RateClass) -> Decision {
        let now = self.clock.now_utc();

        if let Some(until) = self.block_expiry(identity, now) {
            metrics::counter!("ratelimit.deny").increment(1);
            return Decision {
                allowed: false,
                remaining: 0,
                reset_at: until,
            };
        }

        let limit = self.config.limit(class);
        let window = self.window_index(now);
        let key = self.counter_key(identity, class, window);
        let reset_at = self.window_reset(now);

        // Window counters need to outlive the window itself only briefly.
        let ttl = self.config.window * 2;
        let count = match self.store.increment(&key, ttl).await {
            Ok(count) => count,
            Err(e) => {
                // Counter store unreachable: fail open.
                warn!(error = %e, identity = %identity, "Counter store unreachable, allowing");
                metrics::counter!("ratelimit.allow").increment(1);
                return Decision {
                    allowed: true,
                    remaining: limit,
                    reset_at,
                };
            }
        };

        if count <= limit {
            metrics::counter!("ratelimit.allow").increment(1);
            Decision {
                allowed: true,
                remaining: limit - count,
                reset_at,
            }
        } else {
            metrics::counter!("ratelimit.deny").increment(1);
            self.audit.rate_limit_violation(identity, &class.to_string());
            self.record_violation(identity, now);
            Decision {
                allowed: false,
                remaining: 0,
                reset_at,
            }
        }
    }

    /// Remaining allowance in the current window, without counting.
    pub async fn remaining(&self, identity: &str, class: RateClass) -> u32 {
        let now = self.clock.now_utc();
        if self.block_expiry(identity, now).is_some() {
            return 0;
        }
        let key = self.counter_key(identity, class, self.window_index(now));
        let count = self.store.get(&key).await.unwrap_or(0);
        self.config.limit(class).saturating_sub(count)
    }

    /// When the current window (or an active block) resets.
    pub async fn reset_at(&self, identity: &str, class: RateClass) -> DateTime<Utc> {
        let _ = class;
        let now = self.clock.now_utc();
        if let Some(until) = self.block_expiry(identity, now) {
            return until;
        }
        self.window_reset(now)
    }

    /// Admin/testing: clear counters, violations, and block state.
    pub async fn reset(&self, identity: &str, class: RateClass) {
        let now = self.clock.now_utc();
        let key = self.counter_key(identity, class, self.window_index(now));
        let _ = self.store.remove(&key).await;
        self.violations.remove(identity);
        self.blocked.remove(identity);
    }

    pub fn is_blocked(&self, identity: &str) -> bool {
        self.block_expiry(identity, self.clock.now_utc()).is_some()
    }

    fn block_expiry(&self, identity: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let until = self.blocked.get(identity).map(|entry| *entry.value())?;
        if until <= now {
            self.blocked.remove(identity);
            return None;
        }
        Some(until)
    }

    fn record_violation(&self, identity: &str, now: DateTime<Utc>) {
        let window =
            chrono::Duration::from_std(self.config.violation_window).unwrap_or_default();
        let entry = self
            .violations
            .entry(identity.to_string())
            .or_insert_with(|| Mutex::new(VecDeque::new()));
        let mut events = entry.lock();

        let cutoff = now - window;
        while events.front().map(|t| *t < cutoff).unwrap_or(false) {
            events.pop_front();
        }
        events.push_back(now);

        if events.len() as u32 >= self.config.violation_threshold {
            let until = now
                + chrono::Duration::from_std(self.config.block_duration).unwrap_or_default();
            self.blocked.insert(identity.to_string(), until);
            events.clear();
            metrics::counter!("ratelimit.blocked").increment(1);
            self.audit.rate_limit_blocked(identity, until);
            debug!(identity = %identity, until = %until, "Identity blocked after repeated violations");
        }
    }
}
