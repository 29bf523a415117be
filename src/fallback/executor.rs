use super::types::{
    CachedValue, FallbackConfig, FallbackOptions, FallbackResult, FallbackSource, FallbackStats,
    FallbackStrategy,
};
use crate::error::{ResilienceError, Result};
use crate::events::{EventEmitter, EventKind, EventListener};
use chrono::{DateTime, Utc};
use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, warn};

/// Runs a primary operation and substitutes a value when it fails
#[derive(Debug)]
pub struct FallbackExecutor {
    upstream: String,
    config: FallbackConfig,
    state: Mutex<State>,
}

#[derive(Debug, Default)]
struct State {
    stats: FallbackStats,
    /// Bumped by reset so executions started earlier leave the fresh stats alone
    epoch: u64,
    events: EventEmitter,
}

impl FallbackExecutor {
    pub fn new(upstream: impl Into<String>, config: FallbackConfig) -> Self {
        Self {
            upstream: upstream.into(),
            config,
            state: Mutex::new(State::default()),
        }
    }

    pub fn config(&self) -> &FallbackConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record(&self, epoch: u64, update: impl FnOnce(&mut FallbackStats)) {
        let mut state = self.lock();
        if state.epoch == epoch {
            update(&mut state.stats);
        }
    }

    /// Run `op`, recovering failures with the configured strategy
    pub async fn execute<F, Fut, T>(&self, op: F, options: FallbackOptions<T>) -> Result<FallbackResult<T>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.execute_with_strategy(self.config.strategy, op, options)
            .await
    }

    /// Run `op`, recovering failures with `strategy`
    pub async fn execute_with_strategy<F, Fut, T>(
        &self,
        strategy: FallbackStrategy,
        op: F,
        options: FallbackOptions<T>,
    ) -> Result<FallbackResult<T>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let epoch = {
            let mut state = self.lock();
            state.stats.total_executions += 1;
            state.epoch
        };

        match op().await {
            Ok(value) => {
                self.record(epoch, |stats| stats.primary_successes += 1);
                Ok(FallbackResult::primary(value))
            }
            Err(error) => {
                self.recover_from(epoch, error, &[strategy], options, Utc::now())
                    .await
            }
        }
    }

    /// Recover an already failed call with a single strategy
    pub async fn recover<T>(
        &self,
        error: ResilienceError,
        strategy: FallbackStrategy,
        options: FallbackOptions<T>,
    ) -> Result<FallbackResult<T>> {
        self.recover_at(error, &[strategy], options, Utc::now()).await
    }

    /// Try each strategy in turn, returning the first that yields a value
    pub async fn recover_in_order<T>(
        &self,
        error: ResilienceError,
        strategies: &[FallbackStrategy],
        options: FallbackOptions<T>,
    ) -> Result<FallbackResult<T>> {
        self.recover_at(error, strategies, options, Utc::now()).await
    }

    /// Like [`recover_in_order`](Self::recover_in_order) with cache freshness judged at `now`
    pub async fn recover_at<T>(
        &self,
        error: ResilienceError,
        strategies: &[FallbackStrategy],
        options: FallbackOptions<T>,
        now: DateTime<Utc>,
    ) -> Result<FallbackResult<T>> {
        let epoch = self.lock().epoch;
        self.recover_from(epoch, error, strategies, options, now).await
    }

    async fn recover_from<T>(
        &self,
        epoch: u64,
        error: ResilienceError,
        strategies: &[FallbackStrategy],
        mut options: FallbackOptions<T>,
        now: DateTime<Utc>,
    ) -> Result<FallbackResult<T>> {
        let mut reasons = Vec::with_capacity(strategies.len());

        for &strategy in strategies {
            let attempt = match strategy {
                FallbackStrategy::StaticResponse => options
                    .static_value
                    .take()
                    .map(|value| (value, FallbackSource::StaticFallback))
                    .ok_or_else(|| "no static fallback value".to_string()),
                FallbackStrategy::StaleCache => {
                    self.cached_fallback(options.cached_value.take(), now)
                }
                FallbackStrategy::DegradedService => match options.degraded_handler.take() {
                    Some(handler) => handler(error.clone())
                        .await
                        .map(|value| (value, FallbackSource::DegradedService))
                        .map_err(|e| format!("degraded handler failed: {}", e)),
                    None => Err("no degraded handler".to_string()),
                },
                FallbackStrategy::FailOpen => options
                    .fail_open_value
                    .take()
                    .map(|value| (value, FallbackSource::FailOpen))
                    .ok_or_else(|| "no fail-open value".to_string()),
            };

            match attempt {
                Ok((value, source)) => {
                    self.activated(epoch, source, &error);
                    return Ok(FallbackResult::substitute(value, source));
                }
                Err(reason) => {
                    debug!(upstream = %self.upstream, ?strategy, reason = %reason, "Fallback strategy unavailable");
                    reasons.push(reason);
                }
            }
        }

        let reason = if reasons.is_empty() {
            "no fallback strategy".to_string()
        } else {
            reasons.join("; ")
        };
        self.record(epoch, |stats| stats.fallback_failures += 1);
        warn!(upstream = %self.upstream, reason = %reason, error = %error, "Fallback unavailable");

        Err(ResilienceError::FallbackUnavailable {
            reason,
            source: Box::new(error),
        })
    }

    fn cached_fallback<T>(
        &self,
        cached: Option<CachedValue<T>>,
        now: DateTime<Utc>,
    ) -> std::result::Result<(T, FallbackSource), String> {
        let cached = cached.ok_or_else(|| "no cached value".to_string())?;
        let max_age_ms = self.config.stale_data_max_age_ms;
        if cached.is_fresh_at(now, max_age_ms) {
            Ok((cached.value, FallbackSource::StaleCache))
        } else {
            Err(format!(
                "cached value is {}ms old (max {}ms)",
                cached.age_ms(now),
                max_age_ms
            ))
        }
    }

    fn activated(&self, epoch: u64, source: FallbackSource, error: &ResilienceError) {
        warn!(upstream = %self.upstream, source = %source, error = %error, "Fallback activated");
        let mut state = self.lock();
        if state.epoch == epoch {
            state.stats.fallbacks_activated += 1;
        }
        state.events.emit(
            &self.upstream,
            EventKind::FallbackActivated {
                source,
                error: error.to_string(),
            },
        );
    }

    pub fn stats(&self) -> FallbackStats {
        self.lock().stats.clone()
    }

    pub fn on_event(&self, listener: EventListener) {
        self.lock().events.subscribe(listener);
    }

    pub fn reset(&self) {
        let mut state = self.lock();
        state.stats = FallbackStats::default();
        state.epoch += 1;
    }
}
