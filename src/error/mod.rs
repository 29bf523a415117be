use crate::retry::RetryAttempt;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Result type for resilience operations
pub type Result<T> = std::result::Result<T, ResilienceError>;

/// Generic classification of a failure, used to decide retry-ability
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Connection reset, refused, DNS failure
    Network,
    /// The upstream or a local timer gave up waiting
    Timeout,
    /// The upstream asked us to slow down
    RateLimited,
    /// The upstream is temporarily unavailable
    ServiceUnavailable,
    /// The upstream failed while handling a valid request
    ServerError,
    /// The request itself was rejected by the upstream
    ClientError,
    /// The upstream answered with something unusable
    InvalidResponse,
    /// Memory, file handles or similar ran out
    ResourceExhausted,
    /// Local admission control refused the call
    Rejected,
    /// Anything else
    Unknown,
}

impl ErrorKind {
    /// Default set of kinds worth retrying
    pub fn default_retryable() -> Vec<ErrorKind> {
        vec![
            ErrorKind::Network,
            ErrorKind::Timeout,
            ErrorKind::RateLimited,
            ErrorKind::ServiceUnavailable,
            ErrorKind::ServerError,
        ]
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Network => "network",
            ErrorKind::Timeout => "timeout",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::ServiceUnavailable => "service_unavailable",
            ErrorKind::ServerError => "server_error",
            ErrorKind::ClientError => "client_error",
            ErrorKind::InvalidResponse => "invalid_response",
            ErrorKind::ResourceExhausted => "resource_exhausted",
            ErrorKind::Rejected => "rejected",
            ErrorKind::Unknown => "unknown",
        };
        write!(f, "{}", name)
    }
}

/// Failure reported by a wrapped upstream operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpstreamError {
    pub kind: ErrorKind,
    pub message: String,
}

impl UpstreamError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Network, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ServiceUnavailable, message)
    }

    pub fn server(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ServerError, message)
    }

    pub fn client(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ClientError, message)
    }

    pub fn invalid_response(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidResponse, message)
    }
}

impl fmt::Display for UpstreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.message, self.kind)
    }
}

/// Why a bulkhead turned a call away
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionReason {
    QueueFull,
    QueueTimeout,
}

/// Resilience error types
#[derive(Error, Debug, Clone)]
pub enum ResilienceError {
    #[error("Upstream error: {0}")]
    Upstream(UpstreamError),

    #[error("Circuit breaker open for {upstream}, retry in {retry_after_ms}ms")]
    CircuitOpen { upstream: String, retry_after_ms: u64 },

    #[error("Retry exhausted after {} attempts: {last_error}", .attempts.len())]
    RetryExhausted {
        attempts: Vec<RetryAttempt>,
        last_error: Box<ResilienceError>,
    },

    #[error("Retry timed out after {elapsed_ms}ms (timeout {timeout_ms}ms)")]
    RetryTimeout {
        elapsed_ms: u64,
        timeout_ms: u64,
        attempts: Vec<RetryAttempt>,
    },

    #[error("Bulkhead full for {upstream}: {active_count} active, {queued_count} queued")]
    BulkheadRejected {
        upstream: String,
        active_count: usize,
        queued_count: usize,
    },

    #[error("Queued for {waited_ms}ms in bulkhead {upstream} (timeout {timeout_ms}ms)")]
    QueueTimeout {
        upstream: String,
        waited_ms: u64,
        timeout_ms: u64,
    },

    #[error("Rate limit exceeded for {key}, retry in {retry_after_ms}ms")]
    RateLimited { key: String, retry_after_ms: u64 },

    #[error("No fallback available: {reason}")]
    FallbackUnavailable {
        reason: String,
        source: Box<ResilienceError>,
    },

    #[error("Deadline of {deadline_ms}ms exceeded")]
    DeadlineExceeded { deadline_ms: u64 },

    #[error("Configuration error: {0}")]
    Config(String),
}

impl ResilienceError {
    /// Classify this error for retry decisions
    pub fn kind(&self) -> ErrorKind {
        match self {
            ResilienceError::Upstream(e) => e.kind,
            ResilienceError::RetryExhausted { last_error, .. } => last_error.kind(),
            ResilienceError::RetryTimeout { .. } => ErrorKind::Timeout,
            ResilienceError::DeadlineExceeded { .. } => ErrorKind::Timeout,
            ResilienceError::FallbackUnavailable { source, .. } => source.kind(),
            ResilienceError::CircuitOpen { .. }
            | ResilienceError::BulkheadRejected { .. }
            | ResilienceError::QueueTimeout { .. }
            | ResilienceError::RateLimited { .. } => ErrorKind::Rejected,
            ResilienceError::Config(_) => ErrorKind::Unknown,
        }
    }

    /// True when local admission control refused the call and the upstream was never reached
    pub fn is_admission_rejection(&self) -> bool {
        matches!(
            self,
            ResilienceError::CircuitOpen { .. }
                | ResilienceError::BulkheadRejected { .. }
                | ResilienceError::QueueTimeout { .. }
                | ResilienceError::RateLimited { .. }
        )
    }

    /// True when the error should count against an upstream's health
    pub fn is_upstream_failure(&self) -> bool {
        match self {
            ResilienceError::Upstream(_) | ResilienceError::RetryTimeout { .. } => true,
            ResilienceError::RetryExhausted { last_error, .. } => last_error.is_upstream_failure(),
            ResilienceError::FallbackUnavailable { source, .. } => source.is_upstream_failure(),
            _ => false,
        }
    }

    /// Attempts recorded by the retry executor, if any
    pub fn attempts(&self) -> Option<&[RetryAttempt]> {
        match self {
            ResilienceError::RetryExhausted { attempts, .. }
            | ResilienceError::RetryTimeout { attempts, .. } => Some(attempts),
            _ => None,
        }
    }
}

impl From<UpstreamError> for ResilienceError {
    fn from(err: UpstreamError) -> Self {
        ResilienceError::Upstream(err)
    }
}
