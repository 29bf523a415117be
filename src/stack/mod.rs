//! Per-upstream composition of every resilience primitive
//!
//! A call through [`ResilienceStack::execute`] is admitted by the upstream's
//! token bucket, then runs breaker around retry around bulkhead around the
//! operation (optionally through the chaos injector). An unrecovered error is
//! replaced by the caller's fallback value, then by a fresh enough cached value.
//!
//! # Example
//!
//! ```rust,no_run
//! use upstream_resilience::{create_resilience_stack, ExecuteOptions, ResilienceConfig, UpstreamError};
//!
//! # async fn run() -> upstream_resilience::Result<()> {
//! let stack = create_resilience_stack(ResilienceConfig::default())?;
//! let result = stack
//!     .execute(
//!         "ipfs",
//!         || async { Err::<String, _>(UpstreamError::network("connection reset").into()) },
//!         ExecuteOptions::new().with_fallback("placeholder".to_string()),
//!     )
//!     .await?;
//! assert!(result.degraded);
//! # Ok(())
//! # }
//! ```

pub mod upstream;

pub use upstream::{UpstreamResilience, UpstreamStats};

use crate::config::{ResilienceConfig, UpstreamConfig};
use crate::chaos::ChaosConfig;
use crate::error::{ResilienceError, Result};
use crate::events::EventListener;
use crate::fallback::{CachedValue, FallbackOptions, FallbackResult, FallbackStrategy};
use crate::health::{HealthState, UpstreamHealth};
use crate::rng::RandomSource;
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Per-call options for [`ResilienceStack::execute`]
pub struct ExecuteOptions<T> {
    /// Returned when the call cannot be recovered
    pub fallback_value: Option<T>,
    /// Returned when there is no fallback value and the entry is fresh enough
    pub cached_value: Option<CachedValue<T>>,
    /// Route the operation through the upstream's chaos injector
    pub enable_chaos: bool,
    /// Upper bound on the whole protected call, excluding rate-limit admission
    pub deadline: Option<Duration>,
}

impl<T> Default for ExecuteOptions<T> {
    fn default() -> Self {
        Self {
            fallback_value: None,
            cached_value: None,
            enable_chaos: false,
            deadline: None,
        }
    }
}

impl<T> ExecuteOptions<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_fallback(mut self, value: T) -> Self {
        self.fallback_value = Some(value);
        self
    }

    pub fn with_cached(mut self, cached: CachedValue<T>) -> Self {
        self.cached_value = Some(cached);
        self
    }

    pub fn with_chaos(mut self) -> Self {
        self.enable_chaos = true;
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

impl<T: fmt::Debug> fmt::Debug for ExecuteOptions<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecuteOptions")
            .field("fallback_value", &self.fallback_value)
            .field("cached_value", &self.cached_value)
            .field("enable_chaos", &self.enable_chaos)
            .field("deadline", &self.deadline)
            .finish()
    }
}

/// Registry of protected upstreams
pub struct ResilienceStack {
    upstreams: DashMap<String, Arc<UpstreamResilience>>,
    config: ResilienceConfig,
    rng: RandomSource,
    listeners: Mutex<Vec<EventListener>>,
}

/// Build a stack from validated configuration, registering every configured upstream
pub fn create_resilience_stack(config: ResilienceConfig) -> Result<ResilienceStack> {
    ResilienceStack::new(config)
}

impl ResilienceStack {
    pub fn new(config: ResilienceConfig) -> Result<Self> {
        let rng = config.random_source();
        Self::with_random_source(config, rng)
    }

    /// Build with an explicit random source shared by every upstream
    pub fn with_random_source(config: ResilienceConfig, rng: RandomSource) -> Result<Self> {
        config.validate()?;

        let stack = Self {
            upstreams: DashMap::new(),
            config,
            rng,
            listeners: Mutex::new(Vec::new()),
        };

        let names: Vec<String> = stack.config.upstreams.keys().cloned().collect();
        for name in &names {
            stack.upstream(name);
        }

        info!(
            upstreams = names.len(),
            seed = ?stack.rng.seed(),
            "Resilience stack initialized"
        );
        Ok(stack)
    }

    pub fn config(&self) -> &ResilienceConfig {
        &self.config
    }

    fn listeners(&self) -> MutexGuard<'_, Vec<EventListener>> {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn build(&self, name: &str, config: UpstreamConfig, chaos: ChaosConfig) -> UpstreamResilience {
        let upstream = UpstreamResilience::new(name, config, chaos, self.rng.clone());
        for listener in self.listeners().iter() {
            upstream.on_event(listener.clone());
        }
        upstream
    }

    /// Get or create the primitives for `name`, using configured settings
    pub fn upstream(&self, name: &str) -> Arc<UpstreamResilience> {
        if let Some(existing) = self.upstreams.get(name) {
            return existing.clone();
        }

        self.upstreams
            .entry(name.to_string())
            .or_insert_with(|| {
                debug!(upstream = %name, "Creating resilience primitives");
                Arc::new(self.build(
                    name,
                    self.config.upstream_config(name),
                    self.config.chaos_config(name),
                ))
            })
            .clone()
    }

    /// Register `name` with explicit settings, replacing any existing primitives
    pub fn register_upstream(
        &self,
        name: &str,
        config: UpstreamConfig,
        chaos: ChaosConfig,
    ) -> Result<Arc<UpstreamResilience>> {
        let probe = ResilienceConfig {
            defaults: config.clone(),
            chaos: chaos.clone(),
            ..Default::default()
        };
        probe
            .validate()
            .map_err(|e| ResilienceError::Config(format!("upstream '{}': {}", name, e)))?;

        let upstream = Arc::new(self.build(name, config, chaos));
        self.upstreams.insert(name.to_string(), upstream.clone());
        Ok(upstream)
    }

    /// Names of every registered upstream, sorted
    pub fn upstream_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.upstreams.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Run `op` against upstream `name` with every protection applied.
    ///
    /// Rate-limit rejections are returned immediately without fallback. An
    /// unrecovered error is replaced by `fallback_value`, else by a fresh enough
    /// `cached_value`, whatever `fallback.strategy` the upstream is configured
    /// with; only `stale_data_max_age_ms` applies here.
    pub async fn execute<F, Fut, T>(
        &self,
        name: &str,
        op: F,
        options: ExecuteOptions<T>,
    ) -> Result<FallbackResult<T>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let upstream = self.upstream(name);
        let started = Instant::now();
        let ExecuteOptions {
            fallback_value,
            cached_value,
            enable_chaos,
            deadline,
        } = options;

        if let Err(err) = upstream.rate_limiter().try_consume() {
            crate::metrics::record_execution(name, "rate_limited", started.elapsed().as_secs_f64());
            return Err(err);
        }

        let protected = upstream.protect(op, enable_chaos);
        let outcome = match deadline {
            Some(limit) => match tokio::time::timeout(limit, protected).await {
                Ok(result) => result,
                Err(_) => {
                    warn!(upstream = %name, deadline = ?limit, "Deadline exceeded");
                    Err(ResilienceError::DeadlineExceeded {
                        deadline_ms: limit.as_millis() as u64,
                    })
                }
            },
            None => protected.await,
        };

        let (result, label) = match outcome {
            Ok(value) => (Ok(FallbackResult::primary(value)), "success"),
            Err(err) if fallback_value.is_none() && cached_value.is_none() => {
                debug!(upstream = %name, error = %err, "No fallback supplied, propagating");
                (Err(err), "failure")
            }
            Err(err) => {
                let options = FallbackOptions {
                    static_value: fallback_value,
                    cached_value,
                    ..Default::default()
                };
                let recovered = upstream
                    .fallback()
                    .recover_in_order(
                        err,
                        &[FallbackStrategy::StaticResponse, FallbackStrategy::StaleCache],
                        options,
                    )
                    .await;
                let label = if recovered.is_ok() { "fallback" } else { "failure" };
                (recovered, label)
            }
        };

        crate::metrics::record_execution(name, label, started.elapsed().as_secs_f64());
        result
    }

    /// Derived health for every registered upstream
    pub fn health_state(&self) -> HealthState {
        let upstreams: BTreeMap<String, UpstreamHealth> = self
            .upstreams
            .iter()
            .map(|entry| {
                let health = entry.value().health();
                crate::metrics::record_degradation(entry.key(), health.level);
                (entry.key().clone(), health)
            })
            .collect();
        HealthState::new(upstreams)
    }

    pub fn upstream_health(&self, name: &str) -> Option<UpstreamHealth> {
        self.upstreams.get(name).map(|u| u.health())
    }

    pub fn stats(&self, name: &str) -> Option<UpstreamStats> {
        self.upstreams.get(name).map(|u| u.stats())
    }

    /// Subscribe to events from every current and future upstream
    pub fn on_event(&self, listener: EventListener) {
        for upstream in self.upstreams.iter() {
            upstream.on_event(listener.clone());
        }
        self.listeners().push(listener);
    }

    /// Reset every upstream's primitives
    pub fn reset(&self) {
        for upstream in self.upstreams.iter() {
            upstream.reset();
        }
        info!(upstreams = self.upstreams.len(), "Resilience stack reset");
    }
}

impl fmt::Debug for ResilienceStack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResilienceStack")
            .field("upstreams", &self.upstream_names())
            .field("seed", &self.rng.seed())
            .finish()
    }
}
