use super::types::{ChaosConfig, ChaosStats, FaultType};
use crate::error::{ErrorKind, ResilienceError, Result, UpstreamError};
use crate::events::{EventEmitter, EventKind, EventListener};
use crate::rng::RandomSource;
use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, info};

/// A value the injector knows how to damage
pub trait Corruptible {
    fn corrupt(&mut self, rng: &RandomSource);
}

impl Corruptible for String {
    fn corrupt(&mut self, rng: &RandomSource) {
        let chars: Vec<char> = self.chars().collect();
        if chars.is_empty() {
            self.push('\u{FFFD}');
            return;
        }
        let at = rng.index(chars.len());
        *self = chars
            .iter()
            .enumerate()
            .map(|(i, c)| if i == at { '\u{FFFD}' } else { *c })
            .collect();
    }
}

impl Corruptible for Vec<u8> {
    fn corrupt(&mut self, rng: &RandomSource) {
        if self.is_empty() {
            self.push(0xFF);
            return;
        }
        let at = rng.index(self.len());
        self[at] ^= 0xFF;
    }
}

impl Corruptible for serde_json::Value {
    fn corrupt(&mut self, rng: &RandomSource) {
        use serde_json::Value;

        match self {
            Value::Object(map) if !map.is_empty() => {
                let keys: Vec<String> = map.keys().cloned().collect();
                let key = &keys[rng.index(keys.len())];
                map.insert(key.clone(), Value::Null);
            }
            Value::Array(items) if !items.is_empty() => {
                let keep = rng.index(items.len());
                items.truncate(keep);
            }
            Value::String(s) => s.corrupt(rng),
            other => *other = Value::Null,
        }
    }
}

/// Faults drawn for one call
#[derive(Debug, Default)]
struct Plan {
    delay: Option<Duration>,
    hang: Option<Duration>,
    abort: Option<ResilienceError>,
    corrupt: bool,
}

/// Wraps operations with probabilistic fault injection
#[derive(Debug)]
pub struct ChaosFaultInjector {
    upstream: String,
    rng: RandomSource,
    state: Mutex<State>,
}

#[derive(Debug)]
struct State {
    config: ChaosConfig,
    stats: ChaosStats,
    events: EventEmitter,
}

impl ChaosFaultInjector {
    pub fn new(upstream: impl Into<String>, config: ChaosConfig, rng: RandomSource) -> Self {
        let upstream = upstream.into();
        if config.enabled {
            info!(upstream = %upstream, "Chaos injection enabled");
        }
        Self {
            upstream,
            rng,
            state: Mutex::new(State {
                config,
                stats: ChaosStats::default(),
                events: EventEmitter::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn config(&self) -> ChaosConfig {
        self.lock().config.clone()
    }

    pub fn is_enabled(&self) -> bool {
        self.lock().config.enabled
    }

    /// Flip the master switch
    pub fn set_enabled(&self, enabled: bool) {
        info!(upstream = %self.upstream, enabled, "Chaos injection toggled");
        self.lock().config.enabled = enabled;
    }

    /// Replace the fault configuration
    pub fn configure(&self, config: ChaosConfig) {
        self.lock().config = config;
    }

    /// Run `op` with faults injected around it.
    ///
    /// A corruption fault cannot alter an opaque value, so it surfaces as an
    /// invalid response instead.
    pub async fn execute<F, Fut, T>(&self, op: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let plan = self.plan();
        let corrupt = plan.corrupt;
        let value = self.run(plan, op).await?;
        if corrupt {
            return Err(UpstreamError::invalid_response(
                "chaos: corrupted response detected",
            )
            .into());
        }
        Ok(value)
    }

    /// Run `op` with faults injected, damaging the returned value on corruption
    pub async fn execute_corruptible<F, Fut, T>(&self, op: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
        T: Corruptible,
    {
        let plan = self.plan();
        let corrupt = plan.corrupt;
        let mut value = self.run(plan, op).await?;
        if corrupt {
            value.corrupt(&self.rng);
        }
        Ok(value)
    }

    async fn run<F, Fut, T>(&self, plan: Plan, op: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if let Some(delay) = plan.delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(hang) = plan.hang {
            tokio::time::sleep(hang).await;
        }
        if let Some(err) = plan.abort {
            return Err(err);
        }
        op().await
    }

    /// Draw one value per enabled fault in fixed order
    fn plan(&self) -> Plan {
        let mut state = self.lock();
        state.stats.total_calls += 1;

        let mut plan = Plan::default();
        if !state.config.enabled {
            return plan;
        }

        let config = state.config.clone();
        for fault in FaultType::ALL {
            let toggle = config.toggle(fault);
            if !toggle.enabled || self.rng.next_f64() >= toggle.probability {
                continue;
            }

            match fault {
                FaultType::NetworkDelay => {
                    let ms = self
                        .rng
                        .range_u64(config.network_delay.min_delay_ms, config.network_delay.max_delay_ms);
                    plan.delay = Some(Duration::from_millis(ms));
                }
                FaultType::NetworkFailure => {
                    plan.abort = Some(UpstreamError::network(config.network_failure.message.clone()).into());
                }
                FaultType::UpstreamError => {
                    let codes = &config.upstream_error.status_codes;
                    let status = if codes.is_empty() {
                        500
                    } else {
                        codes[self.rng.index(codes.len())]
                    };
                    plan.abort = Some(status_error(status).into());
                }
                FaultType::Timeout => {
                    plan.hang = Some(config.timeout.timeout());
                    plan.abort = Some(
                        UpstreamError::timeout(format!(
                            "chaos: no response within {}ms",
                            config.timeout.timeout_ms
                        ))
                        .into(),
                    );
                }
                FaultType::DataCorruption => plan.corrupt = true,
                FaultType::ResourceExhaustion => {
                    plan.abort = Some(
                        UpstreamError::new(
                            ErrorKind::ResourceExhausted,
                            "chaos: upstream resources exhausted",
                        )
                        .into(),
                    );
                }
            }

            debug!(upstream = %self.upstream, fault = %fault, "Injecting fault");
            state.stats.injected_total += 1;
            *state.stats.injected.entry(fault).or_insert(0) += 1;
            state
                .events
                .emit(&self.upstream, EventKind::FaultInjected { fault });

            if plan.abort.is_some() {
                break;
            }
        }

        plan
    }

    pub fn stats(&self) -> ChaosStats {
        self.lock().stats.clone()
    }

    pub fn on_event(&self, listener: EventListener) {
        self.lock().events.subscribe(listener);
    }

    pub fn reset(&self) {
        self.lock().stats = ChaosStats::default();
    }
}

fn status_error(status: u16) -> UpstreamError {
    let kind = match status {
        429 => ErrorKind::RateLimited,
        503 => ErrorKind::ServiceUnavailable,
        500..=599 => ErrorKind::ServerError,
        400..=499 => ErrorKind::ClientError,
        _ => ErrorKind::Unknown,
    };
    UpstreamError::new(kind, format!("chaos: upstream returned HTTP {}", status))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chaos::types::FaultToggle;
    use crate::events::ResilienceEvent;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use tokio::time::Instant;

    fn injector(config: ChaosConfig) -> ChaosFaultInjector {
        ChaosFaultInjector::new("geo", config, RandomSource::seeded(7))
    }

    #[tokio::test]
    async fn test_master_switch_disables_everything() {
        let mut config = ChaosConfig::only(FaultType::NetworkFailure);
        config.enabled = false;
        let chaos = injector(config);

        assert_eq!(chaos.execute(|| async { Ok(1) }).await.unwrap(), 1);
        let stats = chaos.stats();
        assert_eq!(stats.total_calls, 1);
        assert_eq!(stats.injected_total, 0);
    }

    #[tokio::test]
    async fn test_network_failure_skips_operation() {
        let chaos = injector(ChaosConfig::only(FaultType::NetworkFailure));
        let calls = AtomicU32::new(0);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        chaos.on_event(Arc::new(move |event: &ResilienceEvent| {
            sink.lock().unwrap().push(event.kind.clone());
        }));

        let err = chaos
            .execute(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Network);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(chaos.stats().injected(FaultType::NetworkFailure), 1);
        assert_eq!(
            *seen.lock().unwrap(),
            vec![EventKind::FaultInjected {
                fault: FaultType::NetworkFailure
            }]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_network_delay_then_runs() {
        let mut config = ChaosConfig::only(FaultType::NetworkDelay);
        config.network_delay.min_delay_ms = 200;
        config.network_delay.max_delay_ms = 200;
        let chaos = injector(config);

        let start = Instant::now();
        let value = chaos.execute(|| async { Ok("ok") }).await.unwrap();
        assert_eq!(value, "ok");
        assert_eq!(start.elapsed(), Duration::from_millis(200));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_hangs_then_fails() {
        let chaos = injector(ChaosConfig::only(FaultType::Timeout));

        let start = Instant::now();
        let err = chaos.execute(|| async { Ok(()) }).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert_eq!(start.elapsed(), Duration::from_millis(5_000));
    }

    #[tokio::test]
    async fn test_upstream_error_uses_status_code() {
        let mut config = ChaosConfig::only(FaultType::UpstreamError);
        config.upstream_error.status_codes = vec![503];
        let chaos = injector(config);

        let err = chaos.execute(|| async { Ok(()) }).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ServiceUnavailable);
        assert!(err.to_string().contains("503"));
    }

    #[tokio::test]
    async fn test_resource_exhaustion() {
        let chaos = injector(ChaosConfig::only(FaultType::ResourceExhaustion));
        let err = chaos.execute(|| async { Ok(()) }).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ResourceExhausted);
    }

    #[tokio::test]
    async fn test_data_corruption() {
        let chaos = injector(ChaosConfig::only(FaultType::DataCorruption));

        let damaged = chaos
            .execute_corruptible(|| async { Ok("boundary".to_string()) })
            .await
            .unwrap();
        assert_ne!(damaged, "boundary");
        assert!(damaged.contains('\u{FFFD}'));

        let bytes = chaos
            .execute_corruptible(|| async { Ok(vec![1u8, 2, 3]) })
            .await
            .unwrap();
        assert_ne!(bytes, vec![1, 2, 3]);

        let err = chaos.execute(|| async { Ok(42) }).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidResponse);
    }

    #[tokio::test]
    async fn test_json_corruption_nulls_a_field() {
        let chaos = injector(ChaosConfig::only(FaultType::DataCorruption));
        let value = chaos
            .execute_corruptible(|| async { Ok(serde_json::json!({"cid": "bafy", "size": 3})) })
            .await
            .unwrap();
        let nulls = value
            .as_object()
            .unwrap()
            .values()
            .filter(|v| v.is_null())
            .count();
        assert_eq!(nulls, 1);
    }

    #[tokio::test]
    async fn test_probability_is_respected() {
        let mut config = ChaosConfig {
            enabled: true,
            ..Default::default()
        };
        config.network_failure.toggle = FaultToggle {
            enabled: true,
            probability: 0.5,
        };
        let chaos = injector(config);

        for _ in 0..1_000 {
            let _ = chaos.execute(|| async { Ok(()) }).await;
        }
        let injected = chaos.stats().injected(FaultType::NetworkFailure);
        assert!((400..=600).contains(&injected), "injected {}", injected);
    }

    #[tokio::test]
    async fn test_same_seed_same_faults() {
        let config = ChaosConfig {
            enabled: true,
            network_failure: crate::chaos::types::NetworkFailureFault {
                toggle: FaultToggle {
                    enabled: true,
                    probability: 0.3,
                },
                ..Default::default()
            },
            ..Default::default()
        };

        let mut runs = Vec::new();
        for _ in 0..2 {
            let chaos = ChaosFaultInjector::new("geo", config.clone(), RandomSource::seeded(99));
            let mut outcomes = Vec::new();
            for _ in 0..50 {
                outcomes.push(chaos.execute(|| async { Ok(()) }).await.is_ok());
            }
            runs.push(outcomes);
        }
        assert_eq!(runs[0], runs[1]);
    }

    #[tokio::test]
    async fn test_set_enabled_and_reset() {
        let chaos = injector(ChaosConfig::only(FaultType::NetworkFailure));
        assert!(chaos.execute(|| async { Ok(()) }).await.is_err());

        chaos.set_enabled(false);
        assert!(!chaos.is_enabled());
        assert!(chaos.execute(|| async { Ok(()) }).await.is_ok());

        chaos.reset();
        assert_eq!(chaos.stats(), ChaosStats::default());
    }
}
