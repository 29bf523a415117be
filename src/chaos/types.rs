use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// Kinds of synthetic failure, in the order they are evaluated
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultType {
    NetworkDelay,
    NetworkFailure,
    UpstreamError,
    Timeout,
    DataCorruption,
    ResourceExhaustion,
}

impl FaultType {
    pub const ALL: [FaultType; 6] = [
        FaultType::NetworkDelay,
        FaultType::NetworkFailure,
        FaultType::UpstreamError,
        FaultType::Timeout,
        FaultType::DataCorruption,
        FaultType::ResourceExhaustion,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FaultType::NetworkDelay => "network_delay",
            FaultType::NetworkFailure => "network_failure",
            FaultType::UpstreamError => "upstream_error",
            FaultType::Timeout => "timeout",
            FaultType::DataCorruption => "data_corruption",
            FaultType::ResourceExhaustion => "resource_exhaustion",
        }
    }
}

impl fmt::Display for FaultType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Switch and probability shared by every fault
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FaultToggle {
    #[serde(default)]
    pub enabled: bool,

    /// Chance in `[0, 1]` that the fault fires on a call
    #[serde(default)]
    pub probability: f64,
}

impl FaultToggle {
    pub fn always() -> Self {
        Self {
            enabled: true,
            probability: 1.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkDelayFault {
    #[serde(flatten)]
    pub toggle: FaultToggle,

    #[serde(default = "default_min_delay_ms")]
    pub min_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_min_delay_ms() -> u64 {
    100
}

fn default_max_delay_ms() -> u64 {
    2_000
}

impl Default for NetworkDelayFault {
    fn default() -> Self {
        Self {
            toggle: FaultToggle::default(),
            min_delay_ms: default_min_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkFailureFault {
    #[serde(flatten)]
    pub toggle: FaultToggle,

    #[serde(default = "default_failure_message")]
    pub message: String,
}

fn default_failure_message() -> String {
    "chaos: simulated network failure".to_string()
}

impl Default for NetworkFailureFault {
    fn default() -> Self {
        Self {
            toggle: FaultToggle::default(),
            message: default_failure_message(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpstreamErrorFault {
    #[serde(flatten)]
    pub toggle: FaultToggle,

    /// HTTP status codes to pick from
    #[serde(default = "default_status_codes")]
    pub status_codes: Vec<u16>,
}

fn default_status_codes() -> Vec<u16> {
    vec![500, 502, 503, 504]
}

impl Default for UpstreamErrorFault {
    fn default() -> Self {
        Self {
            toggle: FaultToggle::default(),
            status_codes: default_status_codes(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeoutFault {
    #[serde(flatten)]
    pub toggle: FaultToggle,

    /// How long the call hangs before failing
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_timeout_ms() -> u64 {
    5_000
}

impl Default for TimeoutFault {
    fn default() -> Self {
        Self {
            toggle: FaultToggle::default(),
            timeout_ms: default_timeout_ms(),
        }
    }
}

impl TimeoutFault {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Chaos injection configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChaosConfig {
    /// Master switch; nothing is injected while false
    #[serde(default)]
    pub enabled: bool,

    #[serde(default)]
    pub network_delay: NetworkDelayFault,

    #[serde(default)]
    pub network_failure: NetworkFailureFault,

    #[serde(default)]
    pub upstream_error: UpstreamErrorFault,

    #[serde(default)]
    pub timeout: TimeoutFault,

    #[serde(default)]
    pub data_corruption: FaultToggle,

    #[serde(default)]
    pub resource_exhaustion: FaultToggle,
}

impl ChaosConfig {
    pub fn toggle(&self, fault: FaultType) -> &FaultToggle {
        match fault {
            FaultType::NetworkDelay => &self.network_delay.toggle,
            FaultType::NetworkFailure => &self.network_failure.toggle,
            FaultType::UpstreamError => &self.upstream_error.toggle,
            FaultType::Timeout => &self.timeout.toggle,
            FaultType::DataCorruption => &self.data_corruption,
            FaultType::ResourceExhaustion => &self.resource_exhaustion,
        }
    }

    pub fn toggle_mut(&mut self, fault: FaultType) -> &mut FaultToggle {
        match fault {
            FaultType::NetworkDelay => &mut self.network_delay.toggle,
            FaultType::NetworkFailure => &mut self.network_failure.toggle,
            FaultType::UpstreamError => &mut self.upstream_error.toggle,
            FaultType::Timeout => &mut self.timeout.toggle,
            FaultType::DataCorruption => &mut self.data_corruption,
            FaultType::ResourceExhaustion => &mut self.resource_exhaustion,
        }
    }

    /// Enabled config with a single fault that always fires
    pub fn only(fault: FaultType) -> Self {
        let mut config = Self {
            enabled: true,
            ..Default::default()
        };
        *config.toggle_mut(fault) = FaultToggle::always();
        config
    }
}

/// Injection counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ChaosStats {
    pub total_calls: u64,
    pub injected_total: u64,
    pub injected: BTreeMap<FaultType, u64>,
}

impl ChaosStats {
    pub fn injected(&self, fault: FaultType) -> u64 {
        self.injected.get(&fault).copied().unwrap_or(0)
    }
}
