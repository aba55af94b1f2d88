//! Pipeline metrics collection.
//!
//! Event counters are emitted through the `metrics` facade at call sites
//! (`email.sent`, `email.failed`, `ratelimit.deny`, ...). This collector
//! additionally keeps a ring of recent processing samples so throughput,
//! error rate, and latency percentiles can be queried in-process. The ring
//! is capacity-bounded only; staleness is handled at read time, when the
//! throughput window is applied.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde::Serialize;

/// A single processing sample.
#[derive(Debug, Clone)]
struct Sample {
    at: Instant,
    duration_ms: u64,
    success: bool,
}

#[derive(Debug, Clone)]
pub struct PipelineMetricsConfig {
    /// Ring capacity for latency samples.
    pub max_samples: usize,
    /// Throughput window.
    pub throughput_window: Duration,
}

impl Default for PipelineMetricsConfig {
    fn default() -> Self {
        Self {
            max_samples: 10_000,
            throughput_window: Duration::from_secs(60),
        }
    }
}

/// Latency distribution over the retained samples. Percentiles use the
/// nearest-rank method: the smallest duration such that at least p percent
/// of samples are at or below it.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingTime {
    pub mean_ms: f64,
    pub fastest_ms: u64,
    pub slowest_ms: u64,
    pub median_ms: u64,
    pub p95_ms: u64,
    pub p99_ms: u64,
    pub samples: u64,
}

/// Snapshot of pipeline health.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub total_sent: u64,
    pub total_failed: u64,
    pub total_retried: u64,
    pub total_dead_lettered: u64,
    /// Failures as a share of all processed, cumulative since start.
    pub error_rate: f64,
    /// Deliveries per second over the trailing throughput window.
    pub throughput_per_sec: f64,
    pub processing_time: ProcessingTime,
}

pub struct PipelineMetrics {
    config: PipelineMetricsConfig,
    total_sent: AtomicU64,
    total_failed: AtomicU64,
    total_retried: AtomicU64,
    total_dead_lettered: AtomicU64,
    samples: RwLock<VecDeque<Sample>>,
}

impl PipelineMetrics {
    pub fn new() -> Self {
        Self::with_config(PipelineMetricsConfig::default())
    }

    pub fn with_config(config: PipelineMetricsConfig) -> Self {
        Self {
            config,
            total_sent: AtomicU64::new(0),
            total_failed: AtomicU64::new(0),
            total_retried: AtomicU64::new(0),
            total_dead_lettered: AtomicU64::new(0),
            samples: RwLock::new(VecDeque::with_capacity(1024)),
        }
    }

    pub fn record_sent(&self, duration: Duration) {
        self.total_sent.fetch_add(1, Ordering::Relaxed);
        self.add_sample(duration, true);
    }

    pub fn record_failed(&self, duration: Duration) {
        self.total_failed.fetch_add(1, Ordering::Relaxed);
        self.add_sample(duration, false);
    }

    pub fn record_retry(&self) {
        self.total_retried.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dead_letter(&self) {
        self.total_dead_lettered.fetch_add(1, Ordering::Relaxed);
    }

    fn add_sample(&self, duration: Duration, success: bool) {
        let mut samples = self.samples.write();
        // Plain ring: the oldest sample makes room for the newest.
        if samples.len() == self.config.max_samples {
            samples.pop_front();
        }
        samples.push_back(Sample {
            at: Instant::now(),
            duration_ms: duration.as_millis() as u64,
            success,
        });
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let total_sent = self.total_sent.load(Ordering::Relaxed);
        let total_failed = self.total_failed.load(Ordering::Relaxed);
        let total = total_sent + total_failed;

        let samples = self.samples.read();
        let window_start = Instant::now()
            .checked_sub(self.config.throughput_window)
            .unwrap_or_else(Instant::now);
        let recent_successes = samples
            .iter()
            .filter(|s| s.success && s.at >= window_start)
            .count();

        MetricsSnapshot {
            total_sent,
            total_failed,
            total_retried: self.total_retried.load(Ordering::Relaxed),
            total_dead_lettered: self.total_dead_lettered.load(Ordering::Relaxed),
            error_rate: if total > 0 { total_failed as f64 / total as f64 } else { 0.0 },
            throughput_per_sec: recent_successes as f64
                / self.config.throughput_window.as_secs_f64(),
            processing_time: Self::distribution(samples.iter().map(|s| s.duration_ms)),
        }
    }

    /// Nearest-rank latency distribution over an unordered duration stream.
    fn distribution(durations: impl Iterator<Item = u64>) -> ProcessingTime {
        let mut sorted: Vec<u64> = durations.collect();
        if sorted.is_empty() {
            return ProcessingTime::default();
        }
        sorted.sort_unstable();

        let n = sorted.len();
        let total: u64 = sorted.iter().sum();

        // Nearest rank: 1-based ceil(p/100 * n), clamped to the sample set.
        let rank = |p: f64| -> u64 {
            let k = ((p / 100.0) * n as f64).ceil() as usize;
            sorted[k.clamp(1, n) - 1]
        };

        ProcessingTime {
            mean_ms: total as f64 / n as f64,
            fastest_ms: sorted[0],
            slowest_ms: sorted[n - 1],
            median_ms: rank(50.0),
            p95_ms: rank(95.0),
            p99_ms: rank(99.0),
            samples: n as u64,
        }
    }

    /// Reset all counters and samples (testing).
    pub fn reset(&self) {
        self.total_sent.store(0, Ordering::Relaxed);
        self.total_failed.store(0, Ordering::Relaxed);
        self.total_retried.store(0, Ordering::Relaxed);
        self.total_dead_lettered.store(0, Ordering::Relaxed);
        self.samples.write().clear();
    }
}

impl Default for PipelineMetrics {
    fn default() -> Self {
        Self::new()
    }
}
