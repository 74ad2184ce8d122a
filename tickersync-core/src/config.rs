//! TOML configuration.
//!
//! Every section is optional; omitted keys take the defaults below.
//!
//! ```toml
//! [cache]
//! max_size = 1000
//! default_ttl_secs = 300
//!
//! [rate_limit]
//! min_interval_ms = 1000
//! max_concurrent = 2      # 0 = uncapped
//!
//! [retry]
//! max_retries = 3
//! base_delay_ms = 500
//!
//! [source]
//! timeout_secs = 30
//! breaker_threshold = 3
//! breaker_cooldown_secs = 1800
//!
//! [store]
//! dir = "data"
//!
//! [sweep]
//! tickers = ["SPY", "QQQ"]
//! days = 30
//! interval_secs = 3600
//! workers = 2
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::rate_limit::RateLimiter;
use crate::retry::RetryPolicy;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {reason}")]
    Read { path: PathBuf, reason: String },

    #[error("failed to parse config: {0}")]
    Parse(String),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub max_size: usize,
    pub default_ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_size: 1000,
            default_ttl_secs: 300,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub min_interval_ms: u64,
    pub max_concurrent: usize,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            min_interval_ms: 1000,
            max_concurrent: 2,
        }
    }
}

impl RateLimitConfig {
    pub fn build(&self) -> RateLimiter {
        let cap = (self.max_concurrent > 0).then_some(self.max_concurrent);
        RateLimiter::new(Duration::from_millis(self.min_interval_ms), cap)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 500,
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_retries, Duration::from_millis(self.base_delay_ms))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    pub timeout_secs: u64,
    pub user_agent: String,
    pub breaker_threshold: u32,
    pub breaker_cooldown_secs: u64,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36".into(),
            breaker_threshold: 3,
            breaker_cooldown_secs: 30 * 60,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub dir: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("data"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SweepConfig {
    pub tickers: Vec<String>,
    pub days: u32,
    pub interval_secs: u64,
    pub workers: usize,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            tickers: ["SPY", "QQQ", "AAPL", "MSFT", "NVDA"]
                .into_iter()
                .map(String::from)
                .collect(),
            days: 30,
            interval_secs: 3600,
            workers: 2,
        }
    }
}

/// Complete configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub cache: CacheConfig,
    pub rate_limit: RateLimitConfig,
    pub retry: RetryConfig,
    pub source: SourceConfig,
    pub store: StoreConfig,
    pub sweep: SweepConfig,
}

impl SyncConfig {
    /// Load and validate a config from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        Self::from_toml(&content)
    }

    /// Parse and validate a config from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cache.max_size == 0 {
            return Err(ConfigError::Invalid("cache.max_size must be > 0".into()));
        }
        if self.retry.max_retries == 0 {
            return Err(ConfigError::Invalid("retry.max_retries must be > 0".into()));
        }
        if self.source.user_agent.trim().is_empty() {
            return Err(ConfigError::Invalid("source.user_agent must not be empty".into()));
        }
        if self.sweep.days == 0 {
            return Err(ConfigError::Invalid("sweep.days must be > 0".into()));
        }
        if self.sweep.workers == 0 {
            return Err(ConfigError::Invalid("sweep.workers must be > 0".into()));
        }
        Ok(())
    }

    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.cache.default_ttl_secs)
    }

    pub fn source_timeout(&self) -> Duration {
        Duration::from_secs(self.source.timeout_secs)
    }

    pub fn breaker_cooldown(&self) -> Duration {
        Duration::from_secs(self.source.breaker_cooldown_secs)
    }
}
