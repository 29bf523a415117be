//! Resilience primitives for calls to unreliable upstream services.
//!
//! Five independent primitives ([`CircuitBreaker`], [`RetryExecutor`], [`Bulkhead`],
//! [`TokenBucketRateLimiter`], [`FallbackExecutor`]) plus a [`ChaosFaultInjector`]
//! for exercising them. [`ResilienceStack`] owns one of each per named upstream
//! and composes them behind a single `execute` call.

pub mod bulkhead;
pub mod chaos;
pub mod circuit_breaker;
pub mod config;
pub mod error;
pub mod events;
pub mod fallback;
pub mod health;
pub mod metrics;
pub mod rate_limit;
pub mod retry;
pub mod rng;
pub mod stack;

pub use bulkhead::{Bulkhead, BulkheadConfig, BulkheadStats};
pub use chaos::{ChaosConfig, ChaosFaultInjector, ChaosStats, Corruptible, FaultType};
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStats, CircuitState};
pub use config::{ResilienceConfig, UpstreamConfig, UpstreamOverrides};
pub use error::{ErrorKind, ResilienceError, Result, UpstreamError};
pub use events::{EventKind, EventListener, ResilienceEvent};
pub use fallback::{
    CachedValue, FallbackConfig, FallbackExecutor, FallbackOptions, FallbackResult,
    FallbackSource, FallbackStrategy,
};
pub use health::{DegradationLevel, HealthState, UpstreamHealth};
pub use rate_limit::{MultiClientRateLimiter, RateLimitConfig, RateLimiterStats, TokenBucketRateLimiter};
pub use retry::{RetryAttempt, RetryConfig, RetryExecutor, RetryStats};
pub use rng::RandomSource;
pub use stack::{create_resilience_stack, ExecuteOptions, ResilienceStack, UpstreamStats};

/// Log line format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Compact,
    Json,
}

/// Initialize tracing/logging
pub fn init_tracing(format: LogFormat) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "upstream_resilience=debug,resilience_drill=info".into());

    match format {
        LogFormat::Compact => tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .compact()
            .init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .json()
            .init(),
    }
}
