use crate::error::{ResilienceError, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;

/// How a failed primary call is recovered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackStrategy {
    /// Return a fixed value
    #[default]
    StaticResponse,
    /// Return a cached value if it is fresh enough
    StaleCache,
    /// Call a reduced-functionality handler
    DegradedService,
    /// Return a permissive value
    FailOpen,
}

/// Where a returned value came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackSource {
    Primary,
    StaticFallback,
    StaleCache,
    DegradedService,
    FailOpen,
}

impl fmt::Display for FallbackSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FallbackSource::Primary => "primary",
            FallbackSource::StaticFallback => "static_fallback",
            FallbackSource::StaleCache => "stale_cache",
            FallbackSource::DegradedService => "degraded_service",
            FallbackSource::FailOpen => "fail_open",
        };
        f.write_str(name)
    }
}

/// Fallback configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FallbackConfig {
    /// Strategy used by [`FallbackExecutor::execute`](super::FallbackExecutor::execute).
    /// The stack substitutes from the per-call options instead.
    #[serde(default)]
    pub strategy: FallbackStrategy,

    /// Oldest cached value that may still be served
    #[serde(default = "default_stale_data_max_age_ms")]
    pub stale_data_max_age_ms: u64,
}

fn default_stale_data_max_age_ms() -> u64 {
    3_600_000 // 1 hour
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            strategy: FallbackStrategy::default(),
            stale_data_max_age_ms: default_stale_data_max_age_ms(),
        }
    }
}

/// A previously fetched value and when it was fetched
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedValue<T> {
    pub value: T,
    pub timestamp: DateTime<Utc>,
}

impl<T> CachedValue<T> {
    /// Value fetched just now
    pub fn new(value: T) -> Self {
        Self {
            value,
            timestamp: Utc::now(),
        }
    }

    pub fn at(value: T, timestamp: DateTime<Utc>) -> Self {
        Self { value, timestamp }
    }

    /// Value fetched `age_ms` milliseconds ago
    pub fn with_age(value: T, age_ms: u64) -> Self {
        Self {
            value,
            timestamp: Utc::now() - ChronoDuration::milliseconds(age_ms as i64),
        }
    }

    /// Age in milliseconds at `now`; timestamps in the future count as zero
    pub fn age_ms(&self, now: DateTime<Utc>) -> u64 {
        (now - self.timestamp).num_milliseconds().max(0) as u64
    }

    /// Inclusive freshness check against a maximum age
    pub fn is_fresh_at(&self, now: DateTime<Utc>, max_age_ms: u64) -> bool {
        self.age_ms(now) <= max_age_ms
    }
}

/// Value returned by a fallback-protected call
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FallbackResult<T> {
    pub value: T,
    pub source: FallbackSource,
    /// False only when the primary answered
    pub degraded: bool,
}

impl<T> FallbackResult<T> {
    pub fn primary(value: T) -> Self {
        Self {
            value,
            source: FallbackSource::Primary,
            degraded: false,
        }
    }

    pub fn substitute(value: T, source: FallbackSource) -> Self {
        Self {
            value,
            source,
            degraded: true,
        }
    }

    pub fn into_value(self) -> T {
        self.value
    }
}

/// Reduced-functionality handler, given the error that triggered it
pub type DegradedHandler<T> =
    Box<dyn FnOnce(ResilienceError) -> BoxFuture<'static, Result<T>> + Send>;

/// Values and handlers a fallback strategy may draw on
pub struct FallbackOptions<T> {
    pub static_value: Option<T>,
    pub cached_value: Option<CachedValue<T>>,
    pub degraded_handler: Option<DegradedHandler<T>>,
    pub fail_open_value: Option<T>,
}

impl<T> Default for FallbackOptions<T> {
    fn default() -> Self {
        Self {
            static_value: None,
            cached_value: None,
            degraded_handler: None,
            fail_open_value: None,
        }
    }
}

impl<T> FallbackOptions<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_static(mut self, value: T) -> Self {
        self.static_value = Some(value);
        self
    }

    pub fn with_cached(mut self, cached: CachedValue<T>) -> Self {
        self.cached_value = Some(cached);
        self
    }

    pub fn with_degraded<H, Fut>(mut self, handler: H) -> Self
    where
        T: 'static,
        H: FnOnce(ResilienceError) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        self.degraded_handler = Some(Box::new(move |err| Box::pin(handler(err))));
        self
    }

    pub fn with_fail_open(mut self, value: T) -> Self {
        self.fail_open_value = Some(value);
        self
    }
}

impl<T: fmt::Debug> fmt::Debug for FallbackOptions<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FallbackOptions")
            .field("static_value", &self.static_value)
            .field("cached_value", &self.cached_value)
            .field("degraded_handler", &self.degraded_handler.is_some())
            .field("fail_open_value", &self.fail_open_value)
            .finish()
    }
}

/// Fallback counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FallbackStats {
    pub total_executions: u64,
    pub primary_successes: u64,
    pub fallbacks_activated: u64,
    pub fallback_failures: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stale_cache_boundary_is_inclusive() {
        let now = Utc::now();
        let just_fresh = CachedValue::at("v", now - ChronoDuration::milliseconds(3_599_999));
        let exact = CachedValue::at("v", now - ChronoDuration::milliseconds(3_600_000));
        let too_old = CachedValue::at("v", now - ChronoDuration::milliseconds(3_600_001));

        assert!(just_fresh.is_fresh_at(now, 3_600_000));
        assert!(exact.is_fresh_at(now, 3_600_000));
        assert!(!too_old.is_fresh_at(now, 3_600_000));
    }

    #[test]
    fn test_future_timestamp_counts_as_fresh() {
        let now = Utc::now();
        let cached = CachedValue::at(1, now + ChronoDuration::seconds(5));
        assert_eq!(cached.age_ms(now), 0);
    }

    #[test]
    fn test_strategy_deserializes_snake_case() {
        let config: FallbackConfig = serde_yaml::from_str("strategy: stale_cache").unwrap();
        assert_eq!(config.strategy, FallbackStrategy::StaleCache);
        assert_eq!(config.stale_data_max_age_ms, 3_600_000);
    }

    #[test]
    fn test_source_serializes_snake_case() {
        let json = serde_json::to_value(FallbackSource::StaticFallback).unwrap();
        assert_eq!(json, "static_fallback");
        assert_eq!(FallbackSource::DegradedService.to_string(), "degraded_service");
    }
}
