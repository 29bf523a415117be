use crate::error::ErrorKind;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Retry configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts, including the first one
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before the second attempt in milliseconds
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,

    /// Upper bound for any single delay in milliseconds
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Backoff multiplier
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Relative jitter in `[0, 1]` applied symmetrically to each delay
    #[serde(default = "default_jitter_factor")]
    pub jitter_factor: f64,

    /// Error classes worth another attempt
    #[serde(default = "ErrorKind::default_retryable")]
    pub retryable_errors: Vec<ErrorKind>,

    /// Budget for the whole sequence, sleeps included
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_delay_ms() -> u64 {
    100
}

fn default_max_delay_ms() -> u64 {
    10_000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_jitter_factor() -> f64 {
    0.1
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter_factor: default_jitter_factor(),
            retryable_errors: ErrorKind::default_retryable(),
            timeout_ms: None,
        }
    }
}

impl RetryConfig {
    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }

    pub fn is_retryable(&self, kind: ErrorKind) -> bool {
        self.retryable_errors.contains(&kind)
    }
}

/// One failed attempt in a retry sequence
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetryAttempt {
    /// 1-based
    pub attempt_number: u32,
    /// Delay slept before this attempt started
    pub delay_ms: u64,
    /// Time since the sequence started, measured when the attempt failed
    pub total_elapsed_ms: u64,
    pub error: String,
    pub error_kind: ErrorKind,
    pub retryable: bool,
}

/// Retry executor counters
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RetryStats {
    pub total_executions: u64,
    pub successful_executions: u64,
    /// Attempts made across all executions
    pub total_attempts: u64,
    /// Executions that needed more than one attempt
    pub retried_executions: u64,
    pub exhausted_count: u64,
    pub timeout_count: u64,
    pub non_retryable_count: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_config_default() {
        let config = RetryConfig::default();
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.initial_delay_ms, 100);
        assert_eq!(config.max_delay_ms, 10_000);
        assert_eq!(config.backoff_multiplier, 2.0);
        assert_eq!(config.timeout(), None);
        assert!(config.is_retryable(ErrorKind::Network));
        assert!(!config.is_retryable(ErrorKind::ClientError));
        assert!(!config.is_retryable(ErrorKind::Rejected));
    }

    #[test]
    fn test_retryable_errors_from_yaml() {
        let config: RetryConfig = serde_yaml::from_str(
            r#"
max_attempts: 5
jitter_factor: 0.0
retryable_errors: [timeout, rejected]
timeout_ms: 2000
"#,
        )
        .unwrap();
        assert_eq!(config.max_attempts, 5);
        assert_eq!(config.initial_delay_ms, 100);
        assert_eq!(config.retryable_errors, vec![ErrorKind::Timeout, ErrorKind::Rejected]);
        assert_eq!(config.timeout(), Some(Duration::from_secs(2)));
    }
}
