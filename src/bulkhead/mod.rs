//! Bounded concurrency with a strict FIFO wait queue.
//!
//! A call first tries to take one of `max_concurrent` slots. When none is free it
//! waits in the queue (up to `max_queue_size` entries) for at most
//! `queue_timeout_ms`. Finishing a call hands its slot directly to the oldest
//! waiter, so queued calls are admitted in arrival order and a waiter that timed
//! out never holds up the ones behind it.

pub mod types;

pub use types::{BulkheadConfig, BulkheadStats};

use crate::error::{RejectionReason, ResilienceError, Result};
use crate::events::{EventEmitter, EventKind, EventListener};
use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Concurrency limiter for a single upstream
#[derive(Debug)]
pub struct Bulkhead {
    upstream: String,
    config: BulkheadConfig,
    state: Mutex<State>,
}

#[derive(Debug)]
struct Waiter {
    id: u64,
    admit: oneshot::Sender<()>,
}

#[derive(Debug, Default)]
struct State {
    active: usize,
    queue: VecDeque<Waiter>,
    next_waiter_id: u64,
    /// Bumped by reset so guards from before it become inert
    generation: u64,
    rejected: u64,
    queue_timeouts: u64,
    completed: u64,
    avg_execution_ms: f64,
    events: EventEmitter,
}

impl State {
    fn position(&self, id: u64) -> Option<usize> {
        self.queue.iter().position(|w| w.id == id)
    }
}

/// A held slot. Completing it records the execution; dropping it only frees the slot.
#[must_use = "a permit frees its slot when dropped"]
#[derive(Debug)]
pub struct BulkheadPermit<'a> {
    bulkhead: &'a Bulkhead,
    generation: u64,
    started: Instant,
    finished: bool,
}

impl BulkheadPermit<'_> {
    /// Record a finished execution and pass the slot on
    pub fn complete(mut self) {
        self.finished = true;
        let elapsed_ms = self.started.elapsed().as_secs_f64() * 1000.0;
        let mut state = self.bulkhead.lock();
        if state.generation != self.generation {
            return;
        }
        state.completed += 1;
        state.avg_execution_ms += (elapsed_ms - state.avg_execution_ms) / state.completed as f64;
        self.bulkhead.release_slot(&mut state);
    }
}

impl Drop for BulkheadPermit<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let mut state = self.bulkhead.lock();
        if state.generation == self.generation {
            debug!(upstream = %self.bulkhead.upstream, "Bulkhead slot released without completion");
            self.bulkhead.release_slot(&mut state);
        }
    }
}

/// Queue entry owned by a waiting caller; cleans up if the caller goes away
struct QueueTicket<'a> {
    bulkhead: &'a Bulkhead,
    id: u64,
    generation: u64,
    armed: bool,
}

impl Drop for QueueTicket<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut state = self.bulkhead.lock();
        if state.generation != self.generation {
            return;
        }
        match state.position(self.id) {
            Some(pos) => {
                state.queue.remove(pos);
                debug!(upstream = %self.bulkhead.upstream, "Cancelled call left the bulkhead queue");
            }
            // Slot was handed over before the caller gave up: pass it on
            None => self.bulkhead.release_slot(&mut state),
        }
    }
}

impl Bulkhead {
    pub fn new(upstream: impl Into<String>, config: BulkheadConfig) -> Self {
        let upstream = upstream.into();
        info!(
            upstream = %upstream,
            max_concurrent = config.max_concurrent,
            max_queue_size = config.max_queue_size,
            queue_timeout_ms = config.queue_timeout_ms,
            "Creating bulkhead"
        );

        Self {
            upstream,
            config,
            state: Mutex::new(State::default()),
        }
    }

    pub fn config(&self) -> &BulkheadConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Hand the slot to the oldest live waiter, or free it
    fn release_slot(&self, state: &mut State) {
        while let Some(waiter) = state.queue.pop_front() {
            if waiter.admit.send(()).is_ok() {
                debug!(upstream = %self.upstream, waiter = waiter.id, "Slot handed to queued call");
                return;
            }
        }
        state.active = state.active.saturating_sub(1);
    }

    fn permit(&self, generation: u64) -> BulkheadPermit<'_> {
        BulkheadPermit {
            bulkhead: self,
            generation,
            started: Instant::now(),
            finished: false,
        }
    }

    /// Wait for a slot, queueing if necessary
    pub async fn acquire(&self) -> Result<BulkheadPermit<'_>> {
        let (id, generation, mut admitted) = {
            let mut state = self.lock();

            if state.active < self.config.max_concurrent {
                state.active += 1;
                let generation = state.generation;
                return Ok(self.permit(generation));
            }

            if state.queue.len() >= self.config.max_queue_size {
                state.rejected += 1;
                let (active_count, queued_count) = (state.active, state.queue.len());
                warn!(
                    upstream = %self.upstream,
                    active_count,
                    queued_count,
                    "Bulkhead full, rejecting call"
                );
                state.events.emit(
                    &self.upstream,
                    EventKind::BulkheadRejected {
                        reason: RejectionReason::QueueFull,
                        active_count,
                        queued_count,
                    },
                );
                return Err(ResilienceError::BulkheadRejected {
                    upstream: self.upstream.clone(),
                    active_count,
                    queued_count,
                });
            }

            let id = state.next_waiter_id;
            state.next_waiter_id += 1;
            let (admit, admitted) = oneshot::channel();
            state.queue.push_back(Waiter { id, admit });
            debug!(
                upstream = %self.upstream,
                waiter = id,
                queued = state.queue.len(),
                "Call queued for bulkhead slot"
            );
            (id, state.generation, admitted)
        };

        // Declared after the receiver so it drops first while the receiver is still alive
        let mut ticket = QueueTicket {
            bulkhead: self,
            id,
            generation,
            armed: true,
        };
        let enqueued_at = Instant::now();

        match tokio::time::timeout(self.config.queue_timeout(), &mut admitted).await {
            Ok(Ok(())) => {
                ticket.armed = false;
                Ok(self.permit(generation))
            }
            Ok(Err(_)) => {
                // Sender dropped by reset
                ticket.armed = false;
                Err(ResilienceError::BulkheadRejected {
                    upstream: self.upstream.clone(),
                    active_count: 0,
                    queued_count: 0,
                })
            }
            Err(_) => {
                let mut state = self.lock();
                ticket.armed = false;
                match state.position(id) {
                    Some(pos) => {
                        state.queue.remove(pos);
                        state.rejected += 1;
                        state.queue_timeouts += 1;
                        let waited_ms = enqueued_at.elapsed().as_millis() as u64;
                        warn!(
                            upstream = %self.upstream,
                            waited_ms,
                            timeout_ms = self.config.queue_timeout_ms,
                            "Queued call timed out"
                        );
                        let (active_count, queued_count) = (state.active, state.queue.len());
                        state.events.emit(
                            &self.upstream,
                            EventKind::BulkheadRejected {
                                reason: RejectionReason::QueueTimeout,
                                active_count,
                                queued_count,
                            },
                        );
                        Err(ResilienceError::QueueTimeout {
                            upstream: self.upstream.clone(),
                            waited_ms,
                            timeout_ms: self.config.queue_timeout_ms,
                        })
                    }
                    // Admitted at the same instant the timer fired
                    None => Ok(self.permit(generation)),
                }
            }
        }
    }

    /// Run `op` inside a slot
    pub async fn execute<F, Fut, T>(&self, op: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let permit = self.acquire().await?;
        let result = op().await;
        permit.complete();
        result
    }

    pub fn stats(&self) -> BulkheadStats {
        let state = self.lock();
        BulkheadStats {
            active_count: state.active,
            queued_count: state.queue.len(),
            rejected_count: state.rejected,
            queue_timeout_count: state.queue_timeouts,
            completed_count: state.completed,
            avg_execution_ms: state.avg_execution_ms,
            max_concurrent: self.config.max_concurrent,
            max_queue_size: self.config.max_queue_size,
        }
    }

    pub fn on_event(&self, listener: EventListener) {
        self.lock().events.subscribe(listener);
    }

    /// Zero counters and empty the queue; queued callers are rejected
    pub fn reset(&self) {
        let mut state = self.lock();
        let events = std::mem::take(&mut state.events);
        let generation = state.generation + 1;
        *state = State::default();
        state.events = events;
        state.generation = generation;
        info!(upstream = %self.upstream, "Bulkhead reset");
    }
}
