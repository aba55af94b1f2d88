//! Configuration loader with file and environment variable support

use crate::{AppConfig, ConfigError};
use std::env;
use std::path::PathBuf;
use tracing::info;

/// Standard config file search paths
const CONFIG_PATHS: &[&str] = &[
    "courier.toml",
    "config.toml",
    "./config/courier.toml",
    "/etc/courier/config.toml",
];

/// Configuration loader
pub struct ConfigLoader {
    config_path: Option<PathBuf>,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self { config_path: None }
    }

    /// Create a loader with a specific config file path
    pub fn with_path<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            config_path: Some(path.into()),
        }
    }

    /// Load configuration from file (if found) with environment variable overrides
    pub fn load(&self) -> Result<AppConfig, ConfigError> {
        let mut config = AppConfig::default();

        if let Some(path) = self.find_config_file() {
            info!(?path, "Loading configuration from file");
            config = AppConfig::from_file(&path)?;
        }

        self.apply_env_overrides(&mut config);
        config.validate()?;

        Ok(config)
    }

    fn find_config_file(&self) -> Option<PathBuf> {
        if let Some(path) = &self.config_path {
            if path.exists() {
                return Some(path.clone());
            }
        }

        if let Ok(path) = env::var("COURIER_CONFIG") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        for path in CONFIG_PATHS {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        None
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&self, config: &mut AppConfig) {
        // Pipeline
        if let Ok(val) = env::var("COURIER_PIPELINE_WORKERS") {
            if let Ok(workers) = val.parse() {
                config.pipeline.workers = workers;
            }
        }
        if let Ok(val) = env::var("COURIER_PIPELINE_QUEUE_CAPACITY") {
            if let Ok(capacity) = val.parse() {
                config.pipeline.queue_capacity = capacity;
            }
        }
        if let Ok(val) = env::var("COURIER_SEND_RATE_PER_MINUTE") {
            if let Ok(rate) = val.parse() {
                config.pipeline.send_rate_per_minute = Some(rate);
            }
        }

        // Retry
        if let Ok(val) = env::var("COURIER_RETRY_MAX_ATTEMPTS") {
            if let Ok(attempts) = val.parse() {
                config.retry.max_attempts = attempts;
            }
        }

        // Rate limits
        if let Ok(val) = env::var("COURIER_RATELIMIT_WINDOW_SECS") {
            if let Ok(secs) = val.parse() {
                config.rate_limit.window_secs = secs;
            }
        }
        if let Ok(val) = env::var("COURIER_RATELIMIT_WRITE_LIMIT") {
            if let Ok(limit) = val.parse() {
                config.rate_limit.write_limit = limit;
            }
        }

        // SMTP
        if let Ok(val) = env::var("COURIER_SMTP_HOST") {
            config.smtp.host = val;
        }
        if let Ok(val) = env::var("COURIER_SMTP_PORT") {
            if let Ok(port) = val.parse() {
                config.smtp.port = port;
            }
        }
        if let Ok(val) = env::var("COURIER_SMTP_FROM") {
            config.smtp.from = val;
        }
        if let Ok(val) = env::var("COURIER_SMTP_USER") {
            config.smtp.username = Some(val);
        }
        if let Ok(val) = env::var("COURIER_SMTP_PASS") {
            config.smtp.password = Some(val);
        }

        // Digest
        if let Ok(val) = env::var("COURIER_DIGEST_ENABLED") {
            config.digest.enabled = val == "true" || val == "1";
        }

        // Dev mode
        if let Ok(val) = env::var("COURIER_DEV_MODE") {
            config.dev_mode = val == "true" || val == "1";
        }
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}
