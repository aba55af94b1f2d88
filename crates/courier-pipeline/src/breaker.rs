//! Circuit breaker over the outbound mail transport.
//!
//! Closed: calls execute and land in a sliding outcome window.
//! Open: calls are rejected until the cooldown elapses.
//! Half-Open: a bounded number of trial calls decide whether to close.
//!
//! The breaker never retries; the pipeline owns retry policy.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::audit::AuditLogger;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CircuitState::Closed => "CLOSED",
            CircuitState::Open => "OPEN",
            CircuitState::HalfOpen => "HALF_OPEN",
        };
        f.write_str(s)
    }
}

/// Rejection returned without executing the call.
#[derive(Debug, thiserror::Error)]
pub enum BreakerError<E> {
    #[error("circuit open")]
    Open,
    #[error(transparent)]
    Inner(E),
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Maximum outcomes retained in the sliding window.
    pub window_size: usize,
    /// Outcomes older than this leave the window.
    pub window_duration: Duration,
    /// Minimum calls in the window before rates are evaluated.
    pub min_calls: usize,
    /// Failure rate that opens the circuit.
    pub failure_rate: f64,
    /// Calls at least this slow count as slow.
    pub slow_call_threshold: Duration,
    /// Slow-call rate that opens the circuit.
    pub slow_rate: f64,
    /// Time spent Open before the next call probes.
    pub cooldown: Duration,
    /// Trial calls permitted while Half-Open.
    pub probe_count: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            window_size: 100,
            window_duration: Duration::from_secs(60),
            min_calls: 20,
            failure_rate: 0.5,
            slow_call_threshold: Duration::from_secs(2),
            slow_rate: 0.8,
            cooldown: Duration::from_secs(60),
            probe_count: 10,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct CallOutcome {
    at: Instant,
    success: bool,
    slow: bool,
}

/// Read-only breaker statistics snapshot.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitBreakerStats {
    pub name: String,
    pub state: CircuitState,
    pub successful_calls: u64,
    pub failed_calls: u64,
    pub rejected_calls: u64,
    pub slow_calls: u64,
    pub failure_rate: f64,
    pub buffered_calls: usize,
}

pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    state: RwLock<CircuitState>,
    opened_at: RwLock<Option<Instant>>,
    window: Mutex<VecDeque<CallOutcome>>,

    successful_calls: AtomicU64,
    failed_calls: AtomicU64,
    rejected_calls: AtomicU64,
    slow_calls: AtomicU64,

    /// Probes handed out in the current Half-Open cycle.
    probes_started: AtomicU32,
    probe_successes: AtomicU32,
    probe_failures: AtomicU32,

    audit: Option<Arc<AuditLogger>>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            state: RwLock::new(CircuitState::Closed),
            opened_at: RwLock::new(None),
            window: Mutex::new(VecDeque::new()),
            successful_calls: AtomicU64::new(0),
            failed_calls: AtomicU64::new(0),
            rejected_calls: AtomicU64::new(0),
            slow_calls: AtomicU64::new(0),
            probes_started: AtomicU32::new(0),
            probe_successes: AtomicU32::new(0),
            probe_failures: AtomicU32::new(0),
            audit: None,
        }
    }

    pub fn with_audit(mut self, audit: Arc<AuditLogger>) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn state(&self) -> CircuitState {
        *self.state.read()
    }

    /// Execute `fut` under the breaker. Returns `BreakerError::Open` without
    /// executing when the circuit rejects the call.
    pub async fn execute<F, T, E>(&self, fut: F) -> Result<T, BreakerError<E>>
    where
        F: Future<Output = Result<T, E>>,
    {
        if !self.try_acquire() {
            self.rejected_calls.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("cb.fallback").increment(1);
            return Err(BreakerError::Open);
        }

        let start = Instant::now();
        let result = fut.await;
        let elapsed = start.elapsed();
        let slow = elapsed >= self.config.slow_call_threshold;

        match &result {
            Ok(_) => self.record(true, slow),
            Err(_) => self.record(false, slow),
        }

        result.map_err(BreakerError::Inner)
    }

    /// Whether a call may proceed; transitions Open→Half-Open after the
    /// cooldown and budgets Half-Open probes.
    fn try_acquire(&self) -> bool {
        let state = *self.state.read();
        match state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let elapsed_cooldown = self
                    .opened_at
                    .read()
                    .map(|at| at.elapsed() >= self.config.cooldown)
                    .unwrap_or(true);
                if !elapsed_cooldown {
                    return false;
                }
                // First caller after the cooldown flips to Half-Open; the
                // write lock arbitrates racing callers.
                let mut state = self.state.write();
                if *state == CircuitState::Open {
                    *state = CircuitState::HalfOpen;
                    self.probes_started.store(0, Ordering::SeqCst);
                    self.probe_successes.store(0, Ordering::SeqCst);
                    self.probe_failures.store(0, Ordering::SeqCst);
                    debug!(breaker = %self.name, "Circuit transitioning to half-open");
                    self.audit_transition(CircuitState::Open, CircuitState::HalfOpen);
                }
                drop(state);
                self.take_probe()
            }
            CircuitState::HalfOpen => self.take_probe(),
        }
    }

    fn take_probe(&self) -> bool {
        let slot = self.probes_started.fetch_add(1, Ordering::SeqCst);
        if slot < self.config.probe_count {
            metrics::counter!("cb.halfopen.trial").increment(1);
            true
        } else {
            self.probes_started.fetch_sub(1, Ordering::SeqCst);
            false
        }
    }

    fn record(&self, success: bool, slow: bool) {
        if success {
            self.successful_calls.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed_calls.fetch_add(1, Ordering::Relaxed);
        }
        if slow {
            self.slow_calls.fetch_add(1, Ordering::Relaxed);
        }

        let state = *self.state.read();
        match state {
            CircuitState::Closed => {
                let (failure_rate, slow_rate, len) = {
                    let mut window = self.window.lock();
                    let cutoff = Instant::now() - self.config.window_duration;
                    while window.front().map(|o| o.at < cutoff).unwrap_or(false) {
                        window.pop_front();
                    }
                    window.push_back(CallOutcome { at: Instant::now(), success, slow });
                    while window.len() > self.config.window_size {
                        window.pop_front();
                    }

                    let len = window.len();
                    let failures = window.iter().filter(|o| !o.success).count();
                    let slows = window.iter().filter(|o| o.slow).count();
                    (
                        failures as f64 / len as f64,
                        slows as f64 / len as f64,
                        len,
                    )
                };

                if len >= self.config.min_calls
                    && (failure_rate >= self.config.failure_rate
                        || slow_rate >= self.config.slow_rate)
                {
                    self.open(failure_rate, slow_rate);
                }
            }
            CircuitState::HalfOpen => {
                if success {
                    self.probe_successes.fetch_add(1, Ordering::SeqCst);
                } else {
                    self.probe_failures.fetch_add(1, Ordering::SeqCst);
                }
                self.evaluate_probes();
            }
            CircuitState::Open => {
                // Late results from calls admitted before the transition.
            }
        }
    }

    fn evaluate_probes(&self) {
        let successes = self.probe_successes.load(Ordering::SeqCst);
        let failures = self.probe_failures.load(Ordering::SeqCst);
        let finished = successes + failures;

        let needed = (self.config.probe_count as f64 * (1.0 - self.config.failure_rate)).ceil()
            as u32;

        // Close as soon as enough probes succeeded; reopen as soon as the
        // remaining probes cannot reach the threshold.
        if successes >= needed {
            let mut state = self.state.write();
            if *state == CircuitState::HalfOpen {
                *state = CircuitState::Closed;
                self.window.lock().clear();
                *self.opened_at.write() = None;
                info!(breaker = %self.name, successes = successes, "Circuit closed after probes");
                self.audit_transition(CircuitState::HalfOpen, CircuitState::Closed);
            }
        } else if failures > self.config.probe_count - needed
            || finished >= self.config.probe_count
        {
            let mut state = self.state.write();
            if *state == CircuitState::HalfOpen {
                *state = CircuitState::Open;
                *self.opened_at.write() = Some(Instant::now());
                warn!(breaker = %self.name, failures = failures, "Circuit re-opened after probes");
                metrics::counter!("cb.open").increment(1);
                self.audit_transition(CircuitState::HalfOpen, CircuitState::Open);
            }
        }
    }

    fn open(&self, failure_rate: f64, slow_rate: f64) {
        let mut state = self.state.write();
        if *state != CircuitState::Open {
            let from = *state;
            *state = CircuitState::Open;
            *self.opened_at.write() = Some(Instant::now());
            warn!(
                breaker = %self.name,
                failure_rate = failure_rate,
                slow_rate = slow_rate,
                "Circuit opened"
            );
            metrics::counter!("cb.open").increment(1);
            self.audit_transition(from, CircuitState::Open);
        }
    }

    fn audit_transition(&self, from: CircuitState, to: CircuitState) {
        if let Some(audit) = &self.audit {
            audit.circuit_transition(&self.name, &from.to_string(), &to.to_string());
        }
    }

    /// Force the breaker closed (admin/testing).
    pub fn reset(&self) {
        *self.state.write() = CircuitState::Closed;
        *self.opened_at.write() = None;
        self.window.lock().clear();
        self.probes_started.store(0, Ordering::SeqCst);
        self.probe_successes.store(0, Ordering::SeqCst);
        self.probe_failures.store(0, Ordering::SeqCst);
    }

    pub fn stats(&self) -> CircuitBreakerStats {
        let successful = self.successful_calls.load(Ordering::Relaxed);
        let failed = self.failed_calls.load(Ordering::Relaxed);
        let total = successful + failed;
        CircuitBreakerStats {
            name: self.name.clone(),
            state: *self.state.read(),
            successful_calls: successful,
            failed_calls: failed,
            rejected_calls: self.rejected_calls.load(Ordering::Relaxed),
            slow_calls: self.slow_calls.load(Ordering::Relaxed),
            failure_rate: if total > 0 { failed as f64 / total as f64 } else { 0.0 },
            buffered_calls: self.window.lock().len(),
        }
    }
}
