//! Typed events emitted by every resilience primitive.
//!
//! Each primitive keeps an [`EventEmitter`] inside the same lock that guards its
//! state, so listeners observe transitions in exactly the order they happened.
//! Listeners run synchronously under that lock and must not call back into the
//! primitive that emitted the event.

use crate::chaos::FaultType;
use crate::error::RejectionReason;
use crate::fallback::FallbackSource;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Callback invoked for every emitted event
pub type EventListener = Arc<dyn Fn(&ResilienceEvent) + Send + Sync>;

/// What happened
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    CircuitOpened {
        consecutive_failures: u32,
    },
    CircuitClosed {
        consecutive_successes: u32,
    },
    CircuitHalfOpen,
    RetryExhausted {
        attempts: u32,
        last_error: String,
    },
    BulkheadRejected {
        reason: RejectionReason,
        active_count: usize,
        queued_count: usize,
    },
    RateLimitExceeded {
        current_tokens: f64,
    },
    FallbackActivated {
        source: FallbackSource,
        error: String,
    },
    FaultInjected {
        fault: FaultType,
    },
}

impl EventKind {
    /// Stable wire name of the event type
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::CircuitOpened { .. } => "circuit_opened",
            EventKind::CircuitClosed { .. } => "circuit_closed",
            EventKind::CircuitHalfOpen => "circuit_half_open",
            EventKind::RetryExhausted { .. } => "retry_exhausted",
            EventKind::BulkheadRejected { .. } => "bulkhead_rejected",
            EventKind::RateLimitExceeded { .. } => "rate_limit_exceeded",
            EventKind::FallbackActivated { .. } => "fallback_activated",
            EventKind::FaultInjected { .. } => "fault_injected",
        }
    }
}

/// An event tagged with the upstream (or client key) it concerns
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResilienceEvent {
    pub upstream: String,
    #[serde(flatten)]
    pub kind: EventKind,
    pub timestamp: DateTime<Utc>,
}

/// Listener list owned by a single primitive
#[derive(Clone, Default)]
pub struct EventEmitter {
    listeners: Vec<EventListener>,
}

impl EventEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self, listener: EventListener) {
        self.listeners.push(listener);
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    /// Build, record and deliver an event
    pub fn emit(&self, upstream: &str, kind: EventKind) {
        let event = ResilienceEvent {
            upstream: upstream.to_string(),
            kind,
            timestamp: Utc::now(),
        };

        debug!(upstream = %event.upstream, event = event.kind.name(), "Resilience event");
        crate::metrics::record_event(&event);

        for listener in &self.listeners {
            listener(&event);
        }
    }
}

impl fmt::Debug for EventEmitter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventEmitter")
            .field("listeners", &self.listeners.len())
            .finish()
    }
}
