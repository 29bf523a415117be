use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Bulkhead configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BulkheadConfig {
    /// Calls allowed to run at the same time
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,

    /// Calls allowed to wait for a slot
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,

    /// Longest a queued call may wait before giving up
    #[serde(default = "default_queue_timeout_ms")]
    pub queue_timeout_ms: u64,
}

fn default_max_concurrent() -> usize {
    10
}

fn default_max_queue_size() -> usize {
    20
}

fn default_queue_timeout_ms() -> u64 {
    30_000
}

impl Default for BulkheadConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            max_queue_size: default_max_queue_size(),
            queue_timeout_ms: default_queue_timeout_ms(),
        }
    }
}

impl BulkheadConfig {
    pub fn queue_timeout(&self) -> Duration {
        Duration::from_millis(self.queue_timeout_ms)
    }
}

/// Point-in-time view of a bulkhead
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BulkheadStats {
    pub active_count: usize,
    pub queued_count: usize,
    /// Calls turned away, whether the queue was full or the wait timed out
    pub rejected_count: u64,
    /// Subset of `rejected_count` that waited too long in the queue
    pub queue_timeout_count: u64,
    pub completed_count: u64,
    pub avg_execution_ms: f64,
    pub max_concurrent: usize,
    pub max_queue_size: usize,
}

impl BulkheadStats {
    /// Fraction of slots in use
    pub fn utilization(&self) -> f64 {
        if self.max_concurrent == 0 {
            return 1.0;
        }
        self.active_count as f64 / self.max_concurrent as f64
    }
}
