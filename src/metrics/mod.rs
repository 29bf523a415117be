use crate::circuit_breaker::CircuitState;
use crate::error::{ResilienceError, Result};
use crate::events::ResilienceEvent;
use crate::health::DegradationLevel;
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::Arc;
use tracing::{debug, info};

/// Prometheus recorder for resilience metrics
#[derive(Clone)]
pub struct MetricsService {
    handle: Arc<PrometheusHandle>,
}

impl MetricsService {
    /// Install the global Prometheus recorder
    pub fn new() -> Result<Self> {
        let handle = PrometheusBuilder::new().install_recorder().map_err(|e| {
            ResilienceError::Config(format!("Failed to install metrics recorder: {}", e))
        })?;

        register_metrics();

        info!("Metrics service initialized successfully");

        Ok(Self {
            handle: Arc::new(handle),
        })
    }

    /// Render metrics in Prometheus text format
    pub fn render(&self) -> String {
        self.handle.render()
    }
}

/// Register all metrics with descriptions
pub fn register_metrics() {
    describe_counter!(
        "resilience_events_total",
        "Total number of resilience events by upstream and type"
    );
    describe_histogram!(
        "resilience_execution_duration_seconds",
        "Latency of protected executions in seconds"
    );
    describe_counter!(
        "resilience_executions_total",
        "Total number of protected executions by outcome"
    );
    describe_gauge!(
        "resilience_circuit_state",
        "Circuit breaker state (0 = closed, 1 = open, 2 = half-open)"
    );
    describe_gauge!(
        "resilience_degradation_level",
        "Upstream degradation (0 = healthy, 1 = minor, 2 = major, 3 = critical)"
    );

    debug!("All metrics registered with descriptions");
}

/// Count an emitted event
pub fn record_event(event: &ResilienceEvent) {
    let labels = [
        ("upstream", event.upstream.clone()),
        ("event", event.kind.name().to_string()),
    ];
    counter!("resilience_events_total", &labels).increment(1);
}

/// Record the outcome and latency of one protected execution
pub fn record_execution(upstream: &str, outcome: &str, duration_secs: f64) {
    let labels = [
        ("upstream", upstream.to_string()),
        ("outcome", outcome.to_string()),
    ];
    counter!("resilience_executions_total", &labels).increment(1);
    histogram!("resilience_execution_duration_seconds", &labels).record(duration_secs);
}

/// Record circuit breaker state
pub fn record_circuit_state(upstream: &str, state: CircuitState) {
    let labels = [("upstream", upstream.to_string())];
    let value = match state {
        CircuitState::Closed => 0.0,
        CircuitState::Open => 1.0,
        CircuitState::HalfOpen => 2.0,
    };
    gauge!("resilience_circuit_state", &labels).set(value);
}

/// Record derived health
pub fn record_degradation(upstream: &str, level: DegradationLevel) {
    let labels = [("upstream", upstream.to_string())];
    gauge!("resilience_degradation_level", &labels).set(level.severity() as f64);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventKind;
    use chrono::Utc;

    #[test]
    fn test_events_are_counted_by_local_recorder() {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();

        metrics::with_local_recorder(&recorder, || {
            register_metrics();
            record_event(&ResilienceEvent {
                upstream: "geodata".to_string(),
                kind: EventKind::CircuitHalfOpen,
                timestamp: Utc::now(),
            });
            record_circuit_state("geodata", CircuitState::Open);
        });

        let rendered = handle.render();
        assert!(rendered.contains("resilience_events_total"));
        assert!(rendered.contains("event=\"circuit_half_open\""));
        assert!(rendered.contains("resilience_circuit_state"));
    }

    #[test]
    fn test_record_functions_dont_panic() {
        // No recorder installed: every macro is a no-op
        record_execution("ipfs", "success", 0.25);
        record_circuit_state("ipfs", CircuitState::HalfOpen);
        record_degradation("ipfs", DegradationLevel::DegradedMinor);
    }
}
