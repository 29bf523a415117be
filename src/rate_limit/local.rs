use super::bucket::TokenBucketRateLimiter;
use super::types::{MultiClientConfig, RateLimiterStats};
use crate::error::Result;
use crate::events::EventListener;
use dashmap::DashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

/// One token bucket per client key.
///
/// Buckets are created on first use and dropped after `idle_ttl_ms` without
/// traffic. Idle sweeps piggyback on `try_consume` at most once per
/// `sweep_interval_ms`; `spawn_eviction_task` adds a background sweeper for
/// clients that stop sending.
pub struct MultiClientRateLimiter {
    buckets: DashMap<String, Arc<TokenBucketRateLimiter>>,
    config: MultiClientConfig,
    last_sweep: Mutex<Instant>,
    listeners: Mutex<Vec<EventListener>>,
}

impl MultiClientRateLimiter {
    pub fn new(config: MultiClientConfig) -> Self {
        Self {
            buckets: DashMap::new(),
            config,
            last_sweep: Mutex::new(Instant::now()),
            listeners: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &MultiClientConfig {
        &self.config
    }

    /// Take one token from `client`'s bucket
    pub fn try_consume(&self, client: &str) -> Result<()> {
        self.maybe_sweep();
        self.bucket(client).try_consume()
    }

    /// Get or create the bucket for `client`
    pub fn bucket(&self, client: &str) -> Arc<TokenBucketRateLimiter> {
        if let Some(bucket) = self.buckets.get(client) {
            return bucket.clone();
        }

        self.buckets
            .entry(client.to_string())
            .or_insert_with(|| {
                debug!(client = %client, "Creating rate limiter for client");
                let bucket = TokenBucketRateLimiter::new(client, self.config.bucket.clone());
                for listener in lock(&self.listeners).iter() {
                    bucket.on_event(listener.clone());
                }
                Arc::new(bucket)
            })
            .clone()
    }

    /// Stats for one client, if it has a live bucket
    pub fn stats(&self, client: &str) -> Option<RateLimiterStats> {
        self.buckets.get(client).map(|bucket| bucket.stats())
    }

    /// Number of clients with a live bucket
    pub fn active_clients(&self) -> usize {
        self.buckets.len()
    }

    /// Drop buckets idle for longer than the TTL, returning how many were removed
    pub fn evict_idle(&self) -> usize {
        let ttl = self.config.idle_ttl();
        let before = self.buckets.len();
        self.buckets.retain(|_, bucket| bucket.idle_for() < ttl);
        *lock(&self.last_sweep) = Instant::now();

        let evicted = before.saturating_sub(self.buckets.len());
        if evicted > 0 {
            info!(evicted, remaining = self.buckets.len(), "Evicted idle rate limiters");
        }
        evicted
    }

    fn maybe_sweep(&self) {
        let due = lock(&self.last_sweep).elapsed() >= self.config.sweep_interval();
        if due {
            self.evict_idle();
        }
    }

    /// Sweep idle buckets on a fixed interval until the handle is aborted
    pub fn spawn_eviction_task(self: &Arc<Self>) -> JoinHandle<()> {
        let limiter = Arc::downgrade(self);
        let period = self.config.sweep_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match limiter.upgrade() {
                    Some(limiter) => {
                        limiter.evict_idle();
                    }
                    None => break,
                }
            }
        })
    }

    /// Listen to events from every current and future client bucket
    pub fn on_event(&self, listener: EventListener) {
        for bucket in self.buckets.iter() {
            bucket.on_event(listener.clone());
        }
        lock(&self.listeners).push(listener);
    }

    /// Drop every client bucket
    pub fn reset(&self) {
        self.buckets.clear();
        *lock(&self.last_sweep) = Instant::now();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ResilienceError;
    use crate::events::ResilienceEvent;
    use crate::rate_limit::types::RateLimitConfig;
    use std::time::Duration;

    fn limiter(max_tokens: u32) -> MultiClientRateLimiter {
        MultiClientRateLimiter::new(MultiClientConfig {
            bucket: RateLimitConfig {
                max_tokens,
                refill_rate: 1.0,
                refill_interval_ms: 1_000,
            },
            idle_ttl_ms: 10_000,
            sweep_interval_ms: 5_000,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_clients_are_isolated() {
        let limiter = limiter(3);

        for _ in 0..3 {
            assert!(limiter.try_consume("10.0.0.1").is_ok());
        }
        let err = limiter.try_consume("10.0.0.1").unwrap_err();
        match err {
            ResilienceError::RateLimited { key, .. } => assert_eq!(key, "10.0.0.1"),
            other => panic!("unexpected error: {other:?}"),
        }

        assert!(limiter.try_consume("10.0.0.2").is_ok());
        assert_eq!(limiter.active_clients(), 2);
        assert_eq!(limiter.stats("10.0.0.1").unwrap().requests_rejected, 1);
        assert!(limiter.stats("10.0.0.3").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_clients_are_evicted() {
        let limiter = limiter(3);
        limiter.try_consume("idle").unwrap();
        tokio::time::advance(Duration::from_secs(6)).await;
        limiter.try_consume("busy").unwrap();

        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(limiter.evict_idle(), 1);
        assert!(limiter.stats("idle").is_none());
        assert!(limiter.stats("busy").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_lazy_sweep_on_consume() {
        let limiter = limiter(3);
        limiter.try_consume("a").unwrap();

        tokio::time::advance(Duration::from_secs(11)).await;
        limiter.try_consume("b").unwrap();

        assert_eq!(limiter.active_clients(), 1);
        assert!(limiter.stats("a").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_listeners_reach_new_clients() {
        let limiter = limiter(1);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        limiter.on_event(Arc::new(move |event: &ResilienceEvent| {
            sink.lock().unwrap().push(event.upstream.clone());
        }));

        limiter.try_consume("late").unwrap();
        assert!(limiter.try_consume("late").is_err());
        assert_eq!(*seen.lock().unwrap(), vec!["late".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_clears_clients() {
        let limiter = limiter(1);
        limiter.try_consume("a").unwrap();
        assert!(limiter.try_consume("a").is_err());

        limiter.reset();
        assert_eq!(limiter.active_clients(), 0);
        assert!(limiter.try_consume("a").is_ok());
    }
}
