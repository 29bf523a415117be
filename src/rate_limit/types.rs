use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Token bucket configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Bucket capacity, also the initial fill
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    /// Tokens added per refill interval
    #[serde(default = "default_refill_rate")]
    pub refill_rate: f64,

    /// Length of one refill interval in milliseconds
    #[serde(default = "default_refill_interval_ms")]
    pub refill_interval_ms: u64,
}

fn default_max_tokens() -> u32 {
    60
}

fn default_refill_rate() -> f64 {
    1.0
}

fn default_refill_interval_ms() -> u64 {
    1_000
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
            refill_rate: default_refill_rate(),
            refill_interval_ms: default_refill_interval_ms(),
        }
    }
}

impl RateLimitConfig {
    pub fn refill_interval(&self) -> Duration {
        Duration::from_millis(self.refill_interval_ms)
    }

    /// Tokens gained per millisecond
    pub fn tokens_per_ms(&self) -> f64 {
        if self.refill_interval_ms == 0 {
            return 0.0;
        }
        self.refill_rate / self.refill_interval_ms as f64
    }
}

/// Configuration for per-client buckets
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MultiClientConfig {
    /// Shape of every client's bucket
    #[serde(flatten)]
    pub bucket: RateLimitConfig,

    /// Buckets unused for this long are dropped
    #[serde(default = "default_idle_ttl_ms")]
    pub idle_ttl_ms: u64,

    /// Minimum time between lazy idle sweeps
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
}

fn default_idle_ttl_ms() -> u64 {
    300_000
}

fn default_sweep_interval_ms() -> u64 {
    60_000
}

impl Default for MultiClientConfig {
    fn default() -> Self {
        Self {
            bucket: RateLimitConfig::default(),
            idle_ttl_ms: default_idle_ttl_ms(),
            sweep_interval_ms: default_sweep_interval_ms(),
        }
    }
}

impl MultiClientConfig {
    pub fn idle_ttl(&self) -> Duration {
        Duration::from_millis(self.idle_ttl_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

/// Point-in-time view of a token bucket
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RateLimiterStats {
    pub current_tokens: f64,
    pub max_tokens: u32,
    pub refill_rate: f64,
    pub requests_allowed: u64,
    pub requests_rejected: u64,
    pub last_refill_time: DateTime<Utc>,
}
