use super::types::{RateLimitConfig, RateLimiterStats};
use crate::error::{ResilienceError, Result};
use crate::events::{EventEmitter, EventKind, EventListener};
use chrono::{DateTime, Utc};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Absorbs float drift from fractional refills
const TOKEN_EPSILON: f64 = 1e-9;

/// Token bucket with lazy refill.
///
/// Tokens are topped up from the elapsed time whenever the bucket is touched, so
/// no timer task is needed and the count never leaves `[0, max_tokens]`.
#[derive(Debug)]
pub struct TokenBucketRateLimiter {
    key: String,
    config: RateLimitConfig,
    state: Mutex<State>,
}

#[derive(Debug)]
struct State {
    tokens: f64,
    last_refill: Instant,
    last_refill_time: DateTime<Utc>,
    last_used: Instant,
    allowed: u64,
    rejected: u64,
    events: EventEmitter,
}

impl State {
    fn full(config: &RateLimitConfig) -> Self {
        let now = Instant::now();
        Self {
            tokens: config.max_tokens as f64,
            last_refill: now,
            last_refill_time: Utc::now(),
            last_used: now,
            allowed: 0,
            rejected: 0,
            events: EventEmitter::new(),
        }
    }
}

impl TokenBucketRateLimiter {
    pub fn new(key: impl Into<String>, config: RateLimitConfig) -> Self {
        let key = key.into();
        debug!(
            key = %key,
            max_tokens = config.max_tokens,
            refill_rate = config.refill_rate,
            refill_interval_ms = config.refill_interval_ms,
            "Creating token bucket"
        );
        let state = State::full(&config);
        Self {
            key,
            config,
            state: Mutex::new(state),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn refill(&self, state: &mut State) {
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(state.last_refill);
        if elapsed.is_zero() {
            return;
        }

        if self.config.refill_interval_ms == 0 {
            return;
        }
        let gained = elapsed.as_secs_f64() * 1000.0 * self.config.refill_rate
            / self.config.refill_interval_ms as f64;
        state.tokens = (state.tokens + gained).min(self.config.max_tokens as f64);
        state.last_refill = now;
        state.last_refill_time = Utc::now();
    }

    /// Take one token
    pub fn try_consume(&self) -> Result<()> {
        self.try_consume_n(1)
    }

    /// Take `n` tokens at once, or none
    pub fn try_consume_n(&self, n: u32) -> Result<()> {
        let mut state = self.lock();
        self.refill(&mut state);
        state.last_used = Instant::now();

        let wanted = n as f64;
        if state.tokens + TOKEN_EPSILON >= wanted {
            state.tokens = (state.tokens - wanted).max(0.0);
            state.allowed += 1;
            return Ok(());
        }

        state.rejected += 1;
        let retry_after_ms = self.millis_until(&state, wanted);
        warn!(
            key = %self.key,
            current_tokens = state.tokens,
            retry_after_ms,
            "Rate limit exceeded"
        );
        let current_tokens = state.tokens;
        state
            .events
            .emit(&self.key, EventKind::RateLimitExceeded { current_tokens });

        Err(ResilienceError::RateLimited {
            key: self.key.clone(),
            retry_after_ms,
        })
    }

    /// Milliseconds until `wanted` tokens will be available, `u64::MAX` if never
    fn millis_until(&self, state: &State, wanted: f64) -> u64 {
        if self.config.refill_rate <= 0.0 || wanted > self.config.max_tokens as f64 {
            return u64::MAX;
        }
        let deficit = (wanted - state.tokens).max(0.0);
        let ms = (deficit * self.config.refill_interval_ms as f64 / self.config.refill_rate).ceil();
        ms.min(u64::MAX as f64) as u64
    }

    /// Tokens available right now
    pub fn available_tokens(&self) -> f64 {
        let mut state = self.lock();
        self.refill(&mut state);
        state.tokens
    }

    /// How long this bucket has gone without a consume attempt
    pub fn idle_for(&self) -> Duration {
        self.lock().last_used.elapsed()
    }

    pub fn stats(&self) -> RateLimiterStats {
        let mut state = self.lock();
        self.refill(&mut state);
        RateLimiterStats {
            current_tokens: state.tokens,
            max_tokens: self.config.max_tokens,
            refill_rate: self.config.refill_rate,
            requests_allowed: state.allowed,
            requests_rejected: state.rejected,
            last_refill_time: state.last_refill_time,
        }
    }

    pub fn on_event(&self, listener: EventListener) {
        self.lock().events.subscribe(listener);
    }

    /// Refill to capacity and zero counters
    pub fn reset(&self) {
        let mut state = self.lock();
        let events = std::mem::take(&mut state.events);
        *state = State::full(&self.config);
        state.events = events;
    }
}
