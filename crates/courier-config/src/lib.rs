//! Courier Configuration System
//!
//! TOML-based configuration with environment variable override support.
//! Every operational knob of the delivery core lives here: worker count,
//! queue capacity, retry policy, rate limits, circuit thresholds, cache
//! sizes/TTLs, digest schedule, and the SMTP transport address.

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

mod loader;

pub use loader::ConfigLoader;

/// Configuration error types
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Root application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub pipeline: PipelineConfig,
    pub retry: RetryConfig,
    pub rate_limit: RateLimitConfig,
    pub circuit: CircuitConfig,
    pub template_cache: TemplateCacheConfig,
    pub warmup: WarmupConfig,
    pub digest: DigestConfig,
    pub smtp: SmtpConfig,

    /// Enable development mode (log transport instead of SMTP)
    pub dev_mode: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            pipeline: PipelineConfig::default(),
            retry: RetryConfig::default(),
            rate_limit: RateLimitConfig::default(),
            circuit: CircuitConfig::default(),
            template_cache: TemplateCacheConfig::default(),
            warmup: WarmupConfig::default(),
            digest: DigestConfig::default(),
            smtp: SmtpConfig::default(),
            dev_mode: false,
        }
    }
}

/// Delivery pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Worker pool size
    pub workers: usize,
    /// Bounded in-memory queue capacity
    pub queue_capacity: usize,
    /// How long enqueue may block before returning Overloaded
    pub accept_timeout_ms: u64,
    /// Transport call timeout
    pub transport_timeout_ms: u64,
    /// Optional outbound smoothing limit towards the mail relay
    pub send_rate_per_minute: Option<u32>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workers: 32,
            queue_capacity: 10_000,
            accept_timeout_ms: 50,
            transport_timeout_ms: 5_000,
            send_rate_per_minute: None,
        }
    }
}

/// Retry policy for transient transport failures
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_ms: u64,
    pub multiplier: f64,
    pub cap_ms: u64,
    /// Jitter fraction applied to each backoff (0.2 = +/-20%)
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_ms: 1_000,
            multiplier: 2.0,
            cap_ms: 10_000,
            jitter: 0.2,
        }
    }
}

/// Fixed-window rate limits per operation class
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub window_secs: u64,
    pub read_limit: u32,
    pub write_limit: u32,
    pub admin_limit: u32,
    pub public_limit: u32,
    /// Consecutive violations before an identity is blocked
    pub violation_threshold: u32,
    /// Window in which violations are counted
    pub violation_window_secs: u64,
    /// Block duration once the threshold is crossed
    pub block_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window_secs: 60,
            read_limit: 100,
            write_limit: 50,
            admin_limit: 20,
            public_limit: 20,
            violation_threshold: 3,
            violation_window_secs: 300,
            block_secs: 300,
        }
    }
}

/// Circuit breaker thresholds over the outbound mail transport
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitConfig {
    /// Sliding window size in calls
    pub window_size: usize,
    /// Sliding window duration
    pub window_secs: u64,
    /// Minimum calls before the failure rate is evaluated
    pub min_calls: usize,
    /// Failure rate (0.0 - 1.0) that opens the circuit
    pub failure_rate: f64,
    /// Call duration considered slow
    pub slow_call_ms: u64,
    /// Slow-call rate (0.0 - 1.0) that opens the circuit
    pub slow_rate: f64,
    /// Time spent Open before probing
    pub cooldown_secs: u64,
    /// Trial calls permitted in Half-Open
    pub probe_count: u32,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            window_size: 100,
            window_secs: 60,
            min_calls: 20,
            failure_rate: 0.5,
            slow_call_ms: 2_000,
            slow_rate: 0.8,
            cooldown_secs: 60,
            probe_count: 10,
        }
    }
}

/// Template and rendered-output cache bounds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TemplateCacheConfig {
    pub max_entries: usize,
    pub ttl_secs: u64,
    pub rendered_max_entries: usize,
    pub rendered_ttl_secs: u64,
    /// Rendered bodies above this size are not cached
    pub rendered_max_body_bytes: usize,
}

impl Default for TemplateCacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 1_000,
            ttl_secs: 24 * 3_600,
            rendered_max_entries: 5_000,
            rendered_ttl_secs: 3_600,
            rendered_max_body_bytes: 100 * 1024,
        }
    }
}

/// Startup template warm-up
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WarmupConfig {
    pub enabled: bool,
    /// Bounded parallelism for warm-up loads
    pub parallelism: usize,
    pub languages: Vec<String>,
}

impl Default for WarmupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            parallelism: 3,
            languages: vec!["en".to_string()],
        }
    }
}

/// Digest sweep schedule
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DigestConfig {
    pub enabled: bool,
    /// Hour of day (user local) for the daily sweep
    pub daily_hour: u32,
    /// Hour of day (user local) for the weekly sweep, Mondays
    pub weekly_hour: u32,
    /// Scheduler tick interval
    pub tick_secs: u64,
    /// Per-user processing deadline
    pub per_user_timeout_secs: u64,
    /// Items shown per type before the overflow indicator
    pub items_per_type: usize,
}

impl Default for DigestConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            daily_hour: 8,
            weekly_hour: 9,
            tick_secs: 60,
            per_user_timeout_secs: 30,
            items_per_type: 5,
        }
    }
}

/// SMTP transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub from: String,
    pub starttls: bool,
    pub username: Option<String>,
    pub password: Option<String>,
    pub timeout_ms: u64,
}

impl Default for SmtpConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 25,
            from: "courier@localhost".to_string(),
            starttls: false,
            username: None,
            password: None,
            timeout_ms: 10_000,
        }
    }
}

impl AppConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: AppConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration using the standard search paths and env overrides.
    pub fn load() -> Result<Self, ConfigError> {
        ConfigLoader::new().load()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pipeline.workers == 0 {
            return Err(ConfigError::ValidationError("pipeline.workers must be > 0".into()));
        }
        if self.pipeline.queue_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "pipeline.queue_capacity must be > 0".into(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::ValidationError("retry.max_attempts must be > 0".into()));
        }
        if !(0.0..=1.0).contains(&self.circuit.failure_rate) {
            return Err(ConfigError::ValidationError(
                "circuit.failure_rate must be within [0, 1]".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.circuit.slow_rate) {
            return Err(ConfigError::ValidationError(
                "circuit.slow_rate must be within [0, 1]".into(),
            ));
        }
        if self.digest.daily_hour > 23 || self.digest.weekly_hour > 23 {
            return Err(ConfigError::ValidationError("digest hours must be within 0..=23".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = AppConfig::default();
        assert_eq!(config.pipeline.workers, 32);
        assert_eq!(config.pipeline.queue_capacity, 10_000);
        assert_eq!(config.pipeline.accept_timeout_ms, 50);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.rate_limit.write_limit, 50);
        assert_eq!(config.circuit.min_calls, 20);
        assert_eq!(config.digest.daily_hour, 8);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn parses_partial_toml() {
        let toml_str = r#"
            [pipeline]
            workers = 8

            [smtp]
            host = "mail.internal"
            port = 587
            starttls = true
        "#;
        let config: AppConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.pipeline.workers, 8);
        assert_eq!(config.pipeline.queue_capacity, 10_000);
        assert_eq!(config.smtp.host, "mail.internal");
        assert!(config.smtp.starttls);
    }

    #[test]
    fn rejects_zero_workers() {
        let mut config = AppConfig::default();
        config.pipeline.workers = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_out_of_range_failure_rate() {
        let mut config = AppConfig::default();
        config.circuit.failure_rate = 1.5;
        assert!(config.validate().is_err());
    }
}
