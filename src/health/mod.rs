//! Coarse health signal derived from primitive statistics

use crate::bulkhead::BulkheadStats;
use crate::circuit_breaker::{CircuitBreakerStats, CircuitState};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// How badly an upstream is degraded, ordered from best to worst
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DegradationLevel {
    #[default]
    Healthy,
    DegradedMinor,
    DegradedMajor,
    Critical,
}

impl DegradationLevel {
    /// Numeric severity, 0 for healthy up to 3 for critical
    pub fn severity(&self) -> u8 {
        match self {
            DegradationLevel::Healthy => 0,
            DegradationLevel::DegradedMinor => 1,
            DegradationLevel::DegradedMajor => 2,
            DegradationLevel::Critical => 3,
        }
    }

    /// Level for one upstream.
    ///
    /// An open breaker is critical and a half-open one is a major degradation.
    /// Otherwise any bulkhead rejection since the last reset is a minor one.
    pub fn derive(breaker: &CircuitBreakerStats, bulkhead: &BulkheadStats) -> Self {
        match breaker.state {
            CircuitState::Open => DegradationLevel::Critical,
            CircuitState::HalfOpen => DegradationLevel::DegradedMajor,
            CircuitState::Closed if bulkhead.rejected_count > 0 => DegradationLevel::DegradedMinor,
            CircuitState::Closed => DegradationLevel::Healthy,
        }
    }
}

impl fmt::Display for DegradationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DegradationLevel::Healthy => "healthy",
            DegradationLevel::DegradedMinor => "degraded_minor",
            DegradationLevel::DegradedMajor => "degraded_major",
            DegradationLevel::Critical => "critical",
        };
        f.write_str(name)
    }
}

/// Health of a single upstream
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UpstreamHealth {
    pub level: DegradationLevel,
    pub circuit_state: CircuitState,
    pub consecutive_failures: u32,
    pub bulkhead_active: usize,
    pub bulkhead_rejected: u64,
}

impl UpstreamHealth {
    pub fn from_stats(breaker: &CircuitBreakerStats, bulkhead: &BulkheadStats) -> Self {
        Self {
            level: DegradationLevel::derive(breaker, bulkhead),
            circuit_state: breaker.state,
            consecutive_failures: breaker.consecutive_failures,
            bulkhead_active: bulkhead.active_count,
            bulkhead_rejected: bulkhead.rejected_count,
        }
    }
}

/// Read-only snapshot across every registered upstream
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthState {
    /// Worst level across upstreams
    pub overall: DegradationLevel,
    pub upstreams: BTreeMap<String, UpstreamHealth>,
    pub timestamp: DateTime<Utc>,
}

impl HealthState {
    pub fn new(upstreams: BTreeMap<String, UpstreamHealth>) -> Self {
        let overall = upstreams
            .values()
            .map(|h| h.level)
            .max()
            .unwrap_or_default();
        Self {
            overall,
            upstreams,
            timestamp: Utc::now(),
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.overall == DegradationLevel::Healthy
    }

    pub fn level(&self, upstream: &str) -> Option<DegradationLevel> {
        self.upstreams.get(upstream).map(|h| h.level)
    }
}
