use super::types::{RetryAttempt, RetryConfig, RetryStats};
use crate::error::{ResilienceError, Result};
use crate::events::{EventEmitter, EventKind, EventListener};
use crate::rng::RandomSource;
use backoff::{backoff::Backoff, ExponentialBackoff, ExponentialBackoffBuilder};
use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Retry executor with exponential backoff and jitter
#[derive(Debug)]
pub struct RetryExecutor {
    upstream: String,
    config: RetryConfig,
    rng: RandomSource,
    state: Mutex<State>,
}

#[derive(Debug, Default)]
struct State {
    stats: RetryStats,
    /// Bumped by reset so executions started earlier leave the fresh stats alone
    epoch: u64,
    events: EventEmitter,
}

impl RetryExecutor {
    /// Create a new retry executor
    pub fn new(upstream: impl Into<String>, config: RetryConfig, rng: RandomSource) -> Self {
        Self {
            upstream: upstream.into(),
            config,
            rng,
            state: Mutex::new(State::default()),
        }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record(&self, epoch: u64, update: impl FnOnce(&mut RetryStats)) {
        let mut state = self.lock();
        if state.epoch == epoch {
            update(&mut state.stats);
        }
    }

    /// Execute an operation, retrying failures whose kind is listed in `retryable_errors`
    pub async fn execute<F, Fut, T>(&self, op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let config = &self.config;
        self.execute_with_predicate(op, |e| config.is_retryable(e.kind()))
            .await
    }

    /// Execute with retries, but only if the error matches the predicate
    pub async fn execute_with_predicate<F, Fut, T, P>(&self, mut op: F, should_retry: P) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
        P: Fn(&ResilienceError) -> bool,
    {
        let start = Instant::now();
        let deadline = self.config.timeout().map(|t| start + t);
        let max_attempts = self.config.max_attempts.max(1);
        let mut schedule = self.create_backoff();
        let mut attempts: Vec<RetryAttempt> = Vec::new();
        let mut delay = Duration::ZERO;
        let mut attempt_number = 0;

        let epoch = {
            let mut state = self.lock();
            state.stats.total_executions += 1;
            state.epoch
        };

        loop {
            attempt_number += 1;
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    return Err(self.timed_out(epoch, start, attempts));
                }
            }

            debug!(
                upstream = %self.upstream,
                attempt = attempt_number,
                max_attempts,
                "Executing attempt"
            );
            self.record(epoch, |stats| stats.total_attempts += 1);

            let outcome = match deadline {
                Some(deadline) => match tokio::time::timeout_at(deadline, op()).await {
                    Ok(outcome) => outcome,
                    Err(_) => return Err(self.timed_out(epoch, start, attempts)),
                },
                None => op().await,
            };

            let err = match outcome {
                Ok(value) => {
                    if attempt_number > 1 {
                        debug!(upstream = %self.upstream, attempt = attempt_number, "Succeeded after retries");
                    }
                    self.record(epoch, |stats| {
                        stats.successful_executions += 1;
                        if attempt_number > 1 {
                            stats.retried_executions += 1;
                        }
                    });
                    return Ok(value);
                }
                Err(err) => err,
            };

            let retryable = should_retry(&err);
            attempts.push(RetryAttempt {
                attempt_number,
                delay_ms: delay.as_millis() as u64,
                total_elapsed_ms: start.elapsed().as_millis() as u64,
                error: err.to_string(),
                error_kind: err.kind(),
                retryable,
            });

            if !retryable {
                debug!(upstream = %self.upstream, attempt = attempt_number, error = %err, "Error not retryable");
                self.record(epoch, |stats| stats.non_retryable_count += 1);
                return Err(err);
            }

            if attempt_number >= max_attempts {
                return Err(self.exhausted(epoch, attempts, err));
            }

            delay = self.next_delay(&mut schedule);
            debug!(
                upstream = %self.upstream,
                attempt = attempt_number,
                wait_ms = delay.as_millis() as u64,
                error = %err,
                "Attempt failed, retrying after backoff"
            );

            match deadline {
                Some(deadline) => {
                    let sleep = tokio::time::sleep(delay);
                    if tokio::time::timeout_at(deadline, sleep).await.is_err() {
                        return Err(self.timed_out(epoch, start, attempts));
                    }
                }
                None => tokio::time::sleep(delay).await,
            }
        }
    }

    fn exhausted(
        &self,
        epoch: u64,
        attempts: Vec<RetryAttempt>,
        last_error: ResilienceError,
    ) -> ResilienceError {
        warn!(
            upstream = %self.upstream,
            attempts = attempts.len(),
            error = %last_error,
            "Failed after max attempts"
        );

        let mut state = self.lock();
        if state.epoch == epoch {
            state.stats.exhausted_count += 1;
        }
        state.events.emit(
            &self.upstream,
            EventKind::RetryExhausted {
                attempts: attempts.len() as u32,
                last_error: last_error.to_string(),
            },
        );

        ResilienceError::RetryExhausted {
            attempts,
            last_error: Box::new(last_error),
        }
    }

    fn timed_out(&self, epoch: u64, start: Instant, attempts: Vec<RetryAttempt>) -> ResilienceError {
        let elapsed_ms = start.elapsed().as_millis() as u64;
        let timeout_ms = self.config.timeout_ms.unwrap_or_default();
        warn!(
            upstream = %self.upstream,
            elapsed_ms,
            timeout_ms,
            attempts = attempts.len(),
            "Retry budget timed out"
        );
        self.record(epoch, |stats| stats.timeout_count += 1);

        ResilienceError::RetryTimeout {
            elapsed_ms,
            timeout_ms,
            attempts,
        }
    }

    /// Next backoff step with jitter applied
    fn next_delay(&self, schedule: &mut ExponentialBackoff) -> Duration {
        let base = schedule.next_backoff().unwrap_or_else(|| self.config.max_delay());
        apply_jitter(base, self.config.jitter_factor, &self.rng)
    }

    fn create_backoff(&self) -> ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(self.config.initial_delay())
            .with_max_interval(self.config.max_delay())
            .with_multiplier(self.config.backoff_multiplier)
            .with_randomization_factor(0.0) // jitter comes from the injected source
            .with_max_elapsed_time(None) // attempts and timeout are enforced here
            .build()
    }

    pub fn stats(&self) -> RetryStats {
        self.lock().stats.clone()
    }

    pub fn on_event(&self, listener: EventListener) {
        self.lock().events.subscribe(listener);
    }

    pub fn reset(&self) {
        let mut state = self.lock();
        state.stats = RetryStats::default();
        state.epoch += 1;
    }
}

/// Perturb `delay` uniformly within `[-factor * delay, +factor * delay]`
pub fn apply_jitter(delay: Duration, factor: f64, rng: &RandomSource) -> Duration {
    let factor = factor.clamp(0.0, 1.0);
    if factor == 0.0 || delay.is_zero() {
        return delay;
    }

    let millis = delay.as_secs_f64() * 1000.0;
    let spread = millis * factor;
    let jittered = millis + rng.range_f64(-spread, spread);
    Duration::from_secs_f64(jittered.max(0.0) / 1000.0)
}
