use crate::bulkhead::{Bulkhead, BulkheadStats};
use crate::chaos::{ChaosConfig, ChaosFaultInjector, ChaosStats};
use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerStats};
use crate::config::UpstreamConfig;
use crate::error::Result;
use crate::events::EventListener;
use crate::fallback::{FallbackExecutor, FallbackStats};
use crate::health::UpstreamHealth;
use crate::rate_limit::{RateLimiterStats, TokenBucketRateLimiter};
use crate::retry::{RetryExecutor, RetryStats};
use crate::rng::RandomSource;
use serde::Serialize;
use std::future::Future;
use tracing::info;

/// Every primitive guarding a single upstream
#[derive(Debug)]
pub struct UpstreamResilience {
    name: String,
    config: UpstreamConfig,
    circuit_breaker: CircuitBreaker,
    retry: RetryExecutor,
    bulkhead: Bulkhead,
    rate_limiter: TokenBucketRateLimiter,
    fallback: FallbackExecutor,
    chaos: ChaosFaultInjector,
}

/// Snapshot of every primitive for one upstream
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UpstreamStats {
    pub upstream: String,
    pub circuit_breaker: CircuitBreakerStats,
    pub retry: RetryStats,
    pub bulkhead: BulkheadStats,
    pub rate_limiter: RateLimiterStats,
    pub fallback: FallbackStats,
    pub chaos: ChaosStats,
}

impl UpstreamResilience {
    pub fn new(
        name: impl Into<String>,
        config: UpstreamConfig,
        chaos: ChaosConfig,
        rng: RandomSource,
    ) -> Self {
        let name = name.into();
        info!(upstream = %name, "Registering upstream");

        Self {
            circuit_breaker: CircuitBreaker::new(name.as_str(), config.circuit_breaker.clone()),
            retry: RetryExecutor::new(name.as_str(), config.retry.clone(), rng.clone()),
            bulkhead: Bulkhead::new(name.as_str(), config.bulkhead.clone()),
            rate_limiter: TokenBucketRateLimiter::new(name.as_str(), config.rate_limit.clone()),
            fallback: FallbackExecutor::new(name.as_str(), config.fallback.clone()),
            chaos: ChaosFaultInjector::new(name.as_str(), chaos, rng),
            config,
            name,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &UpstreamConfig {
        &self.config
    }

    pub fn circuit_breaker(&self) -> &CircuitBreaker {
        &self.circuit_breaker
    }

    pub fn retry(&self) -> &RetryExecutor {
        &self.retry
    }

    pub fn bulkhead(&self) -> &Bulkhead {
        &self.bulkhead
    }

    pub fn rate_limiter(&self) -> &TokenBucketRateLimiter {
        &self.rate_limiter
    }

    pub fn fallback(&self) -> &FallbackExecutor {
        &self.fallback
    }

    pub fn chaos(&self) -> &ChaosFaultInjector {
        &self.chaos
    }

    /// Breaker around retry around bulkhead around the operation.
    ///
    /// `op` is called once per attempt; the future it returns is only polled
    /// after the bulkhead admits the attempt.
    pub(crate) async fn protect<F, Fut, T>(&self, mut op: F, enable_chaos: bool) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let chaos = enable_chaos.then_some(&self.chaos);
        let attempt = || {
            let call = op();
            self.bulkhead.execute(move || async move {
                match chaos {
                    Some(chaos) => chaos.execute(move || call).await,
                    None => call.await,
                }
            })
        };

        self.circuit_breaker
            .execute(|| self.retry.execute(attempt))
            .await
    }

    pub fn health(&self) -> UpstreamHealth {
        UpstreamHealth::from_stats(&self.circuit_breaker.stats(), &self.bulkhead.stats())
    }

    pub fn stats(&self) -> UpstreamStats {
        UpstreamStats {
            upstream: self.name.clone(),
            circuit_breaker: self.circuit_breaker.stats(),
            retry: self.retry.stats(),
            bulkhead: self.bulkhead.stats(),
            rate_limiter: self.rate_limiter.stats(),
            fallback: self.fallback.stats(),
            chaos: self.chaos.stats(),
        }
    }

    /// Subscribe to events from every primitive
    pub fn on_event(&self, listener: EventListener) {
        self.circuit_breaker.on_event(listener.clone());
        self.retry.on_event(listener.clone());
        self.bulkhead.on_event(listener.clone());
        self.rate_limiter.on_event(listener.clone());
        self.fallback.on_event(listener.clone());
        self.chaos.on_event(listener);
    }

    /// Closed breaker, empty bulkhead, full bucket, zeroed counters
    pub fn reset(&self) {
        self.circuit_breaker.reset();
        self.retry.reset();
        self.bulkhead.reset();
        self.rate_limiter.reset();
        self.fallback.reset();
        self.chaos.reset();
        info!(upstream = %self.name, "Upstream reset");
    }
}
