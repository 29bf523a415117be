use super::types::{CircuitBreakerConfig, CircuitBreakerStats, CircuitState};
use crate::error::{ResilienceError, Result};
use crate::events::{EventEmitter, EventKind, EventListener};
use chrono::{DateTime, Utc};
use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Circuit breaker for a single upstream
#[derive(Debug)]
pub struct CircuitBreaker {
    /// Configuration
    config: CircuitBreakerConfig,
    /// Current state
    state: Mutex<State>,
    /// Upstream identifier
    upstream: String,
}

#[derive(Debug)]
struct State {
    circuit_state: CircuitState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    /// Trial calls in flight while half-open
    half_open_in_flight: u32,
    /// Bumped on every transition so late outcomes cannot drive the new state
    generation: u64,
    /// Bumped by reset so calls admitted earlier leave the fresh counters alone
    epoch: u64,
    state_changed_at: Instant,
    last_state_change: DateTime<Utc>,
    last_failure_time: Option<DateTime<Utc>>,
    failure_count: u64,
    success_count: u64,
    rejected_count: u64,
    opened_count: u64,
    closed_count: u64,
    half_opened_count: u64,
    events: EventEmitter,
}

impl State {
    fn new() -> Self {
        Self {
            circuit_state: CircuitState::Closed,
            consecutive_failures: 0,
            consecutive_successes: 0,
            half_open_in_flight: 0,
            generation: 0,
            epoch: 0,
            state_changed_at: Instant::now(),
            last_state_change: Utc::now(),
            last_failure_time: None,
            failure_count: 0,
            success_count: 0,
            rejected_count: 0,
            opened_count: 0,
            closed_count: 0,
            half_opened_count: 0,
            events: EventEmitter::new(),
        }
    }
}

/// Admission ticket for one call through the breaker.
///
/// Settle it with [`record_success`](Self::record_success) or
/// [`record_failure`](Self::record_failure). Dropping it unsettled (for example
/// when the caller's future is cancelled) frees any half-open trial slot without
/// touching the statistics.
#[must_use = "settle the permit with record_success or record_failure"]
#[derive(Debug)]
pub struct CircuitPermit<'a> {
    breaker: &'a CircuitBreaker,
    epoch: u64,
    generation: u64,
    trial: bool,
    settled: bool,
}

impl CircuitPermit<'_> {
    /// Whether this call is a half-open trial
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    pub fn record_success(mut self) {
        self.settled = true;
        self.breaker.on_success(self.epoch, self.generation, self.trial);
    }

    pub fn record_failure(mut self) {
        self.settled = true;
        self.breaker.on_failure(self.epoch, self.generation, self.trial);
    }

    /// Give the slot back without counting an outcome
    pub fn release(self) {
        // Drop does the work
    }
}

impl Drop for CircuitPermit<'_> {
    fn drop(&mut self) {
        if !self.settled && self.trial {
            self.breaker.release_trial(self.generation);
        }
    }
}

impl CircuitBreaker {
    /// Create a new circuit breaker
    pub fn new(upstream: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let upstream = upstream.into();
        info!(
            upstream = %upstream,
            failure_threshold = config.failure_threshold,
            success_threshold = config.success_threshold,
            open_duration_ms = config.open_duration_ms,
            "Creating circuit breaker"
        );

        Self {
            config,
            state: Mutex::new(State::new()),
            upstream,
        }
    }

    pub fn upstream(&self) -> &str {
        &self.upstream
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Ask to let one call through
    pub fn try_acquire(&self) -> Result<CircuitPermit<'_>> {
        let mut state = self.lock();

        match state.circuit_state {
            CircuitState::Closed => Ok(self.permit(&state, false)),
            CircuitState::Open => {
                let elapsed = state.state_changed_at.elapsed();
                let open_for = self.config.open_duration();
                if elapsed >= open_for {
                    self.transition_to_half_open(&mut state);
                    state.half_open_in_flight += 1;
                    Ok(self.permit(&state, true))
                } else {
                    state.rejected_count += 1;
                    let remaining = open_for - elapsed;
                    debug!(
                        upstream = %self.upstream,
                        time_remaining = ?remaining,
                        "Circuit breaker open, rejecting call"
                    );
                    Err(ResilienceError::CircuitOpen {
                        upstream: self.upstream.clone(),
                        retry_after_ms: remaining.as_millis() as u64,
                    })
                }
            }
            CircuitState::HalfOpen => {
                if state.half_open_in_flight < self.config.half_open_max_calls {
                    state.half_open_in_flight += 1;
                    debug!(
                        upstream = %self.upstream,
                        in_flight = state.half_open_in_flight,
                        max = self.config.half_open_max_calls,
                        "Allowing half-open trial call"
                    );
                    Ok(self.permit(&state, true))
                } else {
                    state.rejected_count += 1;
                    debug!(
                        upstream = %self.upstream,
                        "Max half-open trial calls reached, rejecting"
                    );
                    Err(ResilienceError::CircuitOpen {
                        upstream: self.upstream.clone(),
                        retry_after_ms: 0,
                    })
                }
            }
        }
    }

    fn permit(&self, state: &State, trial: bool) -> CircuitPermit<'_> {
        CircuitPermit {
            breaker: self,
            epoch: state.epoch,
            generation: state.generation,
            trial,
            settled: false,
        }
    }

    /// Run `op` through the breaker.
    ///
    /// Only errors that reflect upstream health count as failures; local
    /// admission rejections further down the stack release the permit instead.
    pub async fn execute<F, Fut, T>(&self, op: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let permit = self.try_acquire()?;

        match op().await {
            Ok(value) => {
                permit.record_success();
                Ok(value)
            }
            Err(err) => {
                if err.is_upstream_failure() {
                    permit.record_failure();
                } else {
                    debug!(upstream = %self.upstream, error = %err, "Call rejected locally, not counted");
                    permit.release();
                }
                Err(err)
            }
        }
    }

    fn on_success(&self, epoch: u64, generation: u64, trial: bool) {
        let mut state = self.lock();
        if epoch != state.epoch {
            debug!(upstream = %self.upstream, "Ignoring success admitted before reset");
            return;
        }
        state.success_count += 1;

        if generation != state.generation {
            debug!(upstream = %self.upstream, "Ignoring success from a previous circuit state");
            return;
        }

        match state.circuit_state {
            CircuitState::Closed => {
                state.consecutive_failures = 0;
            }
            CircuitState::HalfOpen => {
                if trial {
                    state.half_open_in_flight = state.half_open_in_flight.saturating_sub(1);
                }
                state.consecutive_successes += 1;

                debug!(
                    upstream = %self.upstream,
                    consecutive_successes = state.consecutive_successes,
                    threshold = self.config.success_threshold,
                    "Half-open trial call succeeded"
                );

                if state.consecutive_successes >= self.config.success_threshold {
                    self.transition_to_closed(&mut state);
                }
            }
            CircuitState::Open => {
                warn!(upstream = %self.upstream, "Recording success in open state");
            }
        }
    }

    fn on_failure(&self, epoch: u64, generation: u64, trial: bool) {
        let mut state = self.lock();
        if epoch != state.epoch {
            debug!(upstream = %self.upstream, "Ignoring failure admitted before reset");
            return;
        }
        state.failure_count += 1;
        state.last_failure_time = Some(Utc::now());

        if generation != state.generation {
            debug!(upstream = %self.upstream, "Ignoring failure from a previous circuit state");
            return;
        }

        match state.circuit_state {
            CircuitState::Closed => {
                state.consecutive_failures += 1;

                debug!(
                    upstream = %self.upstream,
                    consecutive_failures = state.consecutive_failures,
                    threshold = self.config.failure_threshold,
                    "Call failed in closed state"
                );

                let observed = state.failure_count + state.success_count;
                if state.consecutive_failures >= self.config.failure_threshold
                    && observed >= self.config.volume_threshold
                {
                    self.transition_to_open(&mut state);
                }
            }
            CircuitState::HalfOpen => {
                if trial {
                    state.half_open_in_flight = state.half_open_in_flight.saturating_sub(1);
                }
                warn!(
                    upstream = %self.upstream,
                    "Half-open trial call failed, reopening circuit"
                );
                self.transition_to_open(&mut state);
            }
            CircuitState::Open => {
                debug!(upstream = %self.upstream, "Recording failure in open state");
            }
        }
    }

    fn release_trial(&self, generation: u64) {
        let mut state = self.lock();
        if generation == state.generation && state.circuit_state == CircuitState::HalfOpen {
            state.half_open_in_flight = state.half_open_in_flight.saturating_sub(1);
            debug!(upstream = %self.upstream, "Half-open trial slot released unsettled");
        }
    }

    /// Get current state
    pub fn state(&self) -> CircuitState {
        self.lock().circuit_state
    }

    /// Snapshot of counters and state
    pub fn stats(&self) -> CircuitBreakerStats {
        let state = self.lock();
        CircuitBreakerStats {
            state: state.circuit_state,
            failure_count: state.failure_count,
            success_count: state.success_count,
            consecutive_failures: state.consecutive_failures,
            consecutive_successes: state.consecutive_successes,
            last_failure_time: state.last_failure_time,
            last_state_change: state.last_state_change,
            rejected_count: state.rejected_count,
            half_open_in_flight: state.half_open_in_flight,
            opened_count: state.opened_count,
            closed_count: state.closed_count,
            half_opened_count: state.half_opened_count,
        }
    }

    /// Subscribe to transition events
    pub fn on_event(&self, listener: EventListener) {
        self.lock().events.subscribe(listener);
    }

    /// Zero all counters and force the closed state. Listeners are kept.
    pub fn reset(&self) {
        let mut state = self.lock();
        let events = std::mem::take(&mut state.events);
        let generation = state.generation + 1;
        let epoch = state.epoch + 1;
        *state = State::new();
        state.events = events;
        state.generation = generation;
        state.epoch = epoch;
        crate::metrics::record_circuit_state(&self.upstream, CircuitState::Closed);
        info!(upstream = %self.upstream, "Circuit breaker reset");
    }

    fn change_state(&self, state: &mut State, next: CircuitState) {
        state.circuit_state = next;
        state.generation += 1;
        state.state_changed_at = Instant::now();
        state.last_state_change = Utc::now();
        state.half_open_in_flight = 0;
        crate::metrics::record_circuit_state(&self.upstream, next);
    }

    /// Transition to open state
    fn transition_to_open(&self, state: &mut State) {
        info!(
            upstream = %self.upstream,
            consecutive_failures = state.consecutive_failures,
            "Circuit breaker opening"
        );

        self.change_state(state, CircuitState::Open);
        state.consecutive_successes = 0;
        state.opened_count += 1;
        state.events.emit(
            &self.upstream,
            EventKind::CircuitOpened {
                consecutive_failures: state.consecutive_failures,
            },
        );
    }

    /// Transition to half-open state
    fn transition_to_half_open(&self, state: &mut State) {
        info!(
            upstream = %self.upstream,
            open_duration = ?self.config.open_duration(),
            "Circuit breaker transitioning to half-open"
        );

        self.change_state(state, CircuitState::HalfOpen);
        state.consecutive_failures = 0;
        state.consecutive_successes = 0;
        state.half_opened_count += 1;
        state.events.emit(&self.upstream, EventKind::CircuitHalfOpen);
    }

    /// Transition to closed state
    fn transition_to_closed(&self, state: &mut State) {
        info!(
            upstream = %self.upstream,
            consecutive_successes = state.consecutive_successes,
            "Circuit breaker closing"
        );

        let successes = state.consecutive_successes;
        self.change_state(state, CircuitState::Closed);
        state.consecutive_failures = 0;
        state.consecutive_successes = 0;
        state.closed_count += 1;
        state.events.emit(
            &self.upstream,
            EventKind::CircuitClosed {
                consecutive_successes: successes,
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::UpstreamError;
    use crate::events::ResilienceEvent;
    use std::sync::Arc;
    use std::time::Duration;

    fn breaker(config: CircuitBreakerConfig) -> CircuitBreaker {
        CircuitBreaker::new("test-upstream", config)
    }

    async fn fail(cb: &CircuitBreaker) -> Result<()> {
        cb.execute(|| async { Err(UpstreamError::server("boom").into()) })
            .await
    }

    async fn succeed(cb: &CircuitBreaker) -> Result<()> {
        cb.execute(|| async { Ok(()) }).await
    }

    #[tokio::test]
    async fn test_circuit_breaker_starts_closed() {
        let cb = breaker(CircuitBreakerConfig::default());
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.try_acquire().is_ok());
    }

    #[tokio::test]
    async fn test_circuit_opens_after_threshold_failures() {
        let cb = breaker(CircuitBreakerConfig::default());

        for _ in 0..4 {
            assert!(fail(&cb).await.is_err());
            assert_eq!(cb.state(), CircuitState::Closed);
        }
        assert!(fail(&cb).await.is_err());

        assert_eq!(cb.state(), CircuitState::Open);
        let err = succeed(&cb).await.unwrap_err();
        assert!(matches!(err, ResilienceError::CircuitOpen { .. }));
        assert!(err.is_admission_rejection());
    }

    #[tokio::test]
    async fn test_open_circuit_does_not_invoke_operation() {
        let cb = breaker(CircuitBreakerConfig {
            failure_threshold: 1,
            ..Default::default()
        });
        let _ = fail(&cb).await;

        let mut invoked = false;
        let result = cb
            .execute(|| {
                invoked = true;
                async { Ok(()) }
            })
            .await;

        assert!(result.is_err());
        assert!(!invoked);
        assert_eq!(cb.stats().rejected_count, 1);
    }

    #[tokio::test]
    async fn test_volume_threshold_holds_circuit_closed() {
        let cb = breaker(CircuitBreakerConfig {
            failure_threshold: 2,
            volume_threshold: 4,
            ..Default::default()
        });

        let _ = fail(&cb).await;
        let _ = fail(&cb).await;
        let _ = fail(&cb).await;
        assert_eq!(cb.state(), CircuitState::Closed);

        let _ = fail(&cb).await;
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn test_circuit_resets_on_success() {
        let cb = breaker(CircuitBreakerConfig {
            failure_threshold: 3,
            ..Default::default()
        });

        let _ = fail(&cb).await;
        let _ = fail(&cb).await;
        succeed(&cb).await.unwrap();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.stats().consecutive_failures, 0);

        for _ in 0..3 {
            let _ = fail(&cb).await;
        }
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_allows_limited_trials() {
        let cb = breaker(CircuitBreakerConfig {
            failure_threshold: 2,
            half_open_max_calls: 2,
            open_duration_ms: 1_000,
            ..Default::default()
        });

        let _ = fail(&cb).await;
        let _ = fail(&cb).await;
        assert_eq!(cb.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_millis(1_000)).await;

        let first = cb.try_acquire().unwrap();
        assert!(first.is_trial());
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        let second = cb.try_acquire().unwrap();
        assert!(cb.try_acquire().is_err());

        // Cancelled trial frees its slot without counting
        drop(second);
        assert_eq!(cb.stats().half_open_in_flight, 1);
        let third = cb.try_acquire().unwrap();
        first.release();
        third.release();
        assert_eq!(cb.stats().success_count, 0);
        assert_eq!(cb.stats().failure_count, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stays_open_until_duration_elapses() {
        let cb = breaker(CircuitBreakerConfig {
            failure_threshold: 1,
            open_duration_ms: 5_000,
            ..Default::default()
        });
        let _ = fail(&cb).await;

        tokio::time::advance(Duration::from_millis(4_999)).await;
        match cb.try_acquire() {
            Err(ResilienceError::CircuitOpen { retry_after_ms, .. }) => assert_eq!(retry_after_ms, 1),
            other => panic!("expected open circuit, got {:?}", other.map(|_| ())),
        }

        tokio::time::advance(Duration::from_millis(1)).await;
        succeed(&cb).await.unwrap();
        assert_eq!(cb.state(), CircuitState::HalfOpen);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_closes_on_success() {
        let cb = breaker(CircuitBreakerConfig {
            open_duration_ms: 100,
            ..Default::default()
        });

        for _ in 0..5 {
            let _ = fail(&cb).await;
        }
        assert_eq!(cb.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_millis(100)).await;
        succeed(&cb).await.unwrap();
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert_eq!(cb.stats().consecutive_successes, 1);

        succeed(&cb).await.unwrap();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.stats().consecutive_failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_reopens_on_failure() {
        let cb = breaker(CircuitBreakerConfig {
            failure_threshold: 2,
            open_duration_ms: 100,
            ..Default::default()
        });

        let _ = fail(&cb).await;
        let _ = fail(&cb).await;
        tokio::time::advance(Duration::from_millis(100)).await;

        succeed(&cb).await.unwrap();
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        let _ = fail(&cb).await;
        assert_eq!(cb.state(), CircuitState::Open);
        assert_eq!(cb.stats().consecutive_successes, 0);
        assert_eq!(cb.stats().opened_count, 2);
    }

    #[tokio::test]
    async fn test_local_rejections_are_not_failures() {
        let cb = breaker(CircuitBreakerConfig {
            failure_threshold: 1,
            ..Default::default()
        });

        let result: Result<()> = cb
            .execute(|| async {
                Err(ResilienceError::BulkheadRejected {
                    upstream: "test-upstream".to_string(),
                    active_count: 1,
                    queued_count: 0,
                })
            })
            .await;

        assert!(result.is_err());
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.stats().failure_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transition_events_in_order() {
        let cb = breaker(CircuitBreakerConfig {
            failure_threshold: 1,
            success_threshold: 1,
            open_duration_ms: 10,
            ..Default::default()
        });
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        cb.on_event(Arc::new(move |event: &ResilienceEvent| {
            sink.lock().unwrap().push(event.kind.name());
        }));

        let _ = fail(&cb).await;
        tokio::time::advance(Duration::from_millis(10)).await;
        succeed(&cb).await.unwrap();

        assert_eq!(
            *seen.lock().unwrap(),
            vec!["circuit_opened", "circuit_half_open", "circuit_closed"]
        );
    }

    #[tokio::test]
    async fn test_metrics_tracking_and_reset() {
        let cb = breaker(CircuitBreakerConfig {
            failure_threshold: 2,
            ..Default::default()
        });

        succeed(&cb).await.unwrap();
        let _ = fail(&cb).await;
        let _ = fail(&cb).await;
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(succeed(&cb).await.is_err());

        let stats = cb.stats();
        assert_eq!(stats.total_calls(), 3);
        assert_eq!(stats.success_count, 1);
        assert_eq!(stats.failure_count, 2);
        assert_eq!(stats.rejected_count, 1);
        assert_eq!(stats.opened_count, 1);
        assert!(stats.last_failure_time.is_some());

        cb.reset();
        let stats = cb.stats();
        assert_eq!(stats.state, CircuitState::Closed);
        assert_eq!(stats.total_calls(), 0);
        assert_eq!(stats.rejected_count, 0);
        assert!(succeed(&cb).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_outcome_settled_after_reset_is_discarded() {
        let cb = breaker(CircuitBreakerConfig {
            failure_threshold: 1,
            ..Default::default()
        });

        let failing = cb.try_acquire().unwrap();
        let succeeding = cb.try_acquire().unwrap();
        cb.reset();
        failing.record_failure();
        succeeding.record_success();

        let stats = cb.stats();
        assert_eq!(stats.state, CircuitState::Closed);
        assert_eq!(stats.failure_count, 0);
        assert_eq!(stats.success_count, 0);
        assert_eq!(stats.consecutive_failures, 0);
        assert!(stats.last_failure_time.is_none());

        // Permits admitted after the reset count as usual
        let _ = fail(&cb).await;
        assert_eq!(cb.state(), CircuitState::Open);
        assert_eq!(cb.stats().failure_count, 1);
    }
}
