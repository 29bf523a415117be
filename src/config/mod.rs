use crate::bulkhead::BulkheadConfig;
use crate::chaos::{ChaosConfig, FaultType};
use crate::circuit_breaker::CircuitBreakerConfig;
use crate::error::{ResilienceError, Result};
use crate::fallback::FallbackConfig;
use crate::rate_limit::RateLimitConfig;
use crate::retry::RetryConfig;
use crate::rng::RandomSource;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Main resilience configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResilienceConfig {
    /// Settings for any upstream without its own entry
    #[serde(default)]
    pub defaults: UpstreamConfig,

    /// Per-upstream overrides, keyed by upstream name
    #[serde(default)]
    pub upstreams: BTreeMap<String, UpstreamOverrides>,

    /// Fault injection applied to every upstream unless overridden
    #[serde(default)]
    pub chaos: ChaosConfig,

    /// Seed for jitter and chaos draws; entropy when absent
    #[serde(default)]
    pub seed: Option<u64>,
}

/// Settings for every primitive guarding one upstream
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UpstreamConfig {
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub bulkhead: BulkheadConfig,

    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    #[serde(default)]
    pub fallback: FallbackConfig,
}

/// Sections replacing the defaults for one upstream.
///
/// A present section replaces the whole default section; fields missing from it
/// take their built-in defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UpstreamOverrides {
    #[serde(default)]
    pub circuit_breaker: Option<CircuitBreakerConfig>,

    #[serde(default)]
    pub retry: Option<RetryConfig>,

    #[serde(default)]
    pub bulkhead: Option<BulkheadConfig>,

    #[serde(default)]
    pub rate_limit: Option<RateLimitConfig>,

    #[serde(default)]
    pub fallback: Option<FallbackConfig>,

    #[serde(default)]
    pub chaos: Option<ChaosConfig>,
}

impl UpstreamOverrides {
    fn apply(&self, base: &UpstreamConfig) -> UpstreamConfig {
        UpstreamConfig {
            circuit_breaker: self
                .circuit_breaker
                .clone()
                .unwrap_or_else(|| base.circuit_breaker.clone()),
            retry: self.retry.clone().unwrap_or_else(|| base.retry.clone()),
            bulkhead: self.bulkhead.clone().unwrap_or_else(|| base.bulkhead.clone()),
            rate_limit: self
                .rate_limit
                .clone()
                .unwrap_or_else(|| base.rate_limit.clone()),
            fallback: self.fallback.clone().unwrap_or_else(|| base.fallback.clone()),
        }
    }
}

impl ResilienceConfig {
    /// Load configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ResilienceError::Config(format!("Failed to read config file: {}", e)))?;

        Self::from_yaml(&content)
    }

    /// Parse configuration from YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| ResilienceError::Config(format!("Failed to parse config: {}", e)))
    }

    /// Effective settings for `upstream`
    pub fn upstream_config(&self, upstream: &str) -> UpstreamConfig {
        match self.upstreams.get(upstream) {
            Some(overrides) => overrides.apply(&self.defaults),
            None => self.defaults.clone(),
        }
    }

    /// Effective chaos settings for `upstream`
    pub fn chaos_config(&self, upstream: &str) -> ChaosConfig {
        self.upstreams
            .get(upstream)
            .and_then(|o| o.chaos.clone())
            .unwrap_or_else(|| self.chaos.clone())
    }

    /// Random source honoring `seed`
    pub fn random_source(&self) -> RandomSource {
        match self.seed {
            Some(seed) => RandomSource::seeded(seed),
            None => RandomSource::from_entropy(),
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        validate_upstream("defaults", &self.defaults)?;
        validate_chaos("chaos", &self.chaos)?;

        for (name, overrides) in &self.upstreams {
            if name.trim().is_empty() {
                return Err(ResilienceError::Config(
                    "Upstream name cannot be empty".to_string(),
                ));
            }
            validate_upstream(name, &overrides.apply(&self.defaults))?;
            if let Some(chaos) = &overrides.chaos {
                validate_chaos(name, chaos)?;
            }
        }

        Ok(())
    }
}

fn invalid(scope: &str, message: &str) -> ResilienceError {
    ResilienceError::Config(format!("{}: {}", scope, message))
}

fn validate_upstream(scope: &str, config: &UpstreamConfig) -> Result<()> {
    let cb = &config.circuit_breaker;
    if cb.failure_threshold == 0 {
        return Err(invalid(scope, "circuit_breaker.failure_threshold must be > 0"));
    }
    if cb.success_threshold == 0 {
        return Err(invalid(scope, "circuit_breaker.success_threshold must be > 0"));
    }
    if cb.half_open_max_calls == 0 {
        return Err(invalid(scope, "circuit_breaker.half_open_max_calls must be > 0"));
    }

    let retry = &config.retry;
    if retry.max_attempts == 0 {
        return Err(invalid(scope, "retry.max_attempts must be >= 1"));
    }
    if retry.backoff_multiplier.is_nan() || retry.backoff_multiplier < 1.0 {
        return Err(invalid(scope, "retry.backoff_multiplier must be >= 1"));
    }
    if !(0.0..=1.0).contains(&retry.jitter_factor) {
        return Err(invalid(scope, "retry.jitter_factor must be within [0, 1]"));
    }
    if retry.max_delay_ms < retry.initial_delay_ms {
        return Err(invalid(scope, "retry.max_delay_ms must be >= initial_delay_ms"));
    }
    if retry.timeout_ms == Some(0) {
        return Err(invalid(scope, "retry.timeout_ms must be > 0 when set"));
    }

    if config.bulkhead.max_concurrent == 0 {
        return Err(invalid(scope, "bulkhead.max_concurrent must be > 0"));
    }

    let rl = &config.rate_limit;
    if rl.max_tokens == 0 {
        return Err(invalid(scope, "rate_limit.max_tokens must be > 0"));
    }
    if !(rl.refill_rate.is_finite() && rl.refill_rate > 0.0) {
        return Err(invalid(scope, "rate_limit.refill_rate must be > 0"));
    }
    if rl.refill_interval_ms == 0 {
        return Err(invalid(scope, "rate_limit.refill_interval_ms must be > 0"));
    }

    Ok(())
}

fn validate_chaos(scope: &str, chaos: &ChaosConfig) -> Result<()> {
    for fault in FaultType::ALL {
        let probability = chaos.toggle(fault).probability;
        if !(0.0..=1.0).contains(&probability) {
            return Err(ResilienceError::Config(format!(
                "{}: {} probability must be within [0, 1]",
                scope, fault
            )));
        }
    }
    if chaos.network_delay.min_delay_ms > chaos.network_delay.max_delay_ms {
        return Err(invalid(scope, "network_delay.min_delay_ms must be <= max_delay_ms"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::fallback::FallbackStrategy;
    use std::io::Write;

    #[test]
    fn test_parse_valid_config() {
        let yaml = r#"
seed: 42
defaults:
  circuit_breaker:
    failure_threshold: 3
  retry:
    max_attempts: 4
    retryable_errors: [network, timeout]
upstreams:
  ipfs:
    bulkhead:
      max_concurrent: 2
    fallback:
      strategy: stale_cache
  geodata: {}
chaos:
  enabled: false
"#;

        let config = ResilienceConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.seed, Some(42));
        assert_eq!(config.defaults.circuit_breaker.failure_threshold, 3);
        assert_eq!(config.defaults.circuit_breaker.success_threshold, 2);
        assert_eq!(
            config.defaults.retry.retryable_errors,
            vec![ErrorKind::Network, ErrorKind::Timeout]
        );
        assert_eq!(config.upstreams.len(), 2);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_default_values() {
        let config = ResilienceConfig::from_yaml("{}").unwrap();
        assert_eq!(config, ResilienceConfig::default());

        let upstream = config.upstream_config("anything");
        assert_eq!(upstream.circuit_breaker.failure_threshold, 5);
        assert_eq!(upstream.retry.max_attempts, 3);
        assert_eq!(upstream.bulkhead.max_queue_size, 20);
        assert_eq!(upstream.rate_limit.max_tokens, 60);
        assert_eq!(upstream.fallback.stale_data_max_age_ms, 3_600_000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_overrides_replace_sections() {
        let config = ResilienceConfig::from_yaml(
            r#"
defaults:
  retry:
    max_attempts: 5
  bulkhead:
    max_concurrent: 50
upstreams:
  ipfs:
    bulkhead:
      max_concurrent: 2
    chaos:
      enabled: true
"#,
        )
        .unwrap();

        let ipfs = config.upstream_config("ipfs");
        assert_eq!(ipfs.bulkhead.max_concurrent, 2);
        assert_eq!(ipfs.retry.max_attempts, 5);
        assert!(config.chaos_config("ipfs").enabled);

        let other = config.upstream_config("other");
        assert_eq!(other.bulkhead.max_concurrent, 50);
        assert!(!config.chaos_config("other").enabled);
    }

    #[test]
    fn test_fallback_strategy_override() {
        let config = ResilienceConfig::from_yaml(
            r#"
upstreams:
  ipfs:
    fallback:
      strategy: stale_cache
      stale_data_max_age_ms: 1000
"#,
        )
        .unwrap();
        let fallback = config.upstream_config("ipfs").fallback;
        assert_eq!(fallback.strategy, FallbackStrategy::StaleCache);
        assert_eq!(fallback.stale_data_max_age_ms, 1_000);
    }

    #[test]
    fn test_validate_zero_failure_threshold() {
        let mut config = ResilienceConfig::default();
        config.defaults.circuit_breaker.failure_threshold = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("failure_threshold"));
    }

    #[test]
    fn test_validate_jitter_out_of_range() {
        let mut config = ResilienceConfig::default();
        config.defaults.retry.jitter_factor = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_override_is_checked() {
        let mut config = ResilienceConfig::default();
        config.upstreams.insert(
            "ipfs".to_string(),
            UpstreamOverrides {
                rate_limit: Some(RateLimitConfig {
                    max_tokens: 0,
                    ..Default::default()
                }),
                ..Default::default()
            },
        );
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("ipfs"));
    }

    #[test]
    fn test_validate_chaos_probability() {
        let mut config = ResilienceConfig::default();
        config.chaos.timeout.toggle.probability = 2.0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("timeout"));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "seed: 7\ndefaults:\n  bulkhead:\n    max_concurrent: 3").unwrap();

        let config = ResilienceConfig::from_file(file.path()).unwrap();
        assert_eq!(config.seed, Some(7));
        assert_eq!(config.defaults.bulkhead.max_concurrent, 3);
        assert_eq!(config.random_source().seed(), Some(7));
    }

    #[test]
    fn test_from_missing_file() {
        let err = ResilienceConfig::from_file("/nonexistent/resilience.yaml").unwrap_err();
        assert!(matches!(err, ResilienceError::Config(_)));
    }

    #[test]
    fn test_invalid_yaml() {
        assert!(ResilienceConfig::from_yaml("defaults: [").is_err());
    }
}
