//! Typed event notification
//!
//! Consumers subscribe to a broadcast channel of [`Event`] values rather than
//! polling. Event emission never blocks the flow: a lagging subscriber drops
//! events (broadcast semantics) instead of applying backpressure to the
//! orchestrator or the worker pools.
//!
//! Topics are an enumerated type, not strings, so a consumer match is checked
//! at compile time.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::progress::Phase;
use crate::worker::FlowPhase;

/// Default capacity of the event broadcast channel
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Event emitted during a patch or install flow
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// The flow left `Idle` and began checking for updates
    FlowStarted,

    /// The check callback requested neither install nor patch
    NoUpdate,

    /// A worker began its three-phase sequence
    WorkerStarted {
        /// Worker name
        worker: String,
    },

    /// A flow phase is being re-attempted after a policy-granted retry
    WorkerRetrying {
        /// Worker name
        worker: String,
        /// The phase being retried
        phase: FlowPhase,
        /// Failed attempts so far for this (worker, phase) pair (1 = first retry)
        attempt: u32,
        /// Error from the failed attempt
        error: String,
    },

    /// A worker completed all three phases
    WorkerFinished {
        /// Worker name
        worker: String,
    },

    /// An observable sub-phase (extract/validate/download) started
    PhaseStarted {
        /// Worker name
        worker: String,
        /// The sub-phase that started
        phase: Phase,
        /// Total bytes this sub-phase will process
        total_bytes: u64,
    },

    /// Periodic progress update for a running sub-phase
    PhaseProgress {
        /// Worker name
        worker: String,
        /// The sub-phase reporting progress
        phase: Phase,
        /// Bytes processed so far
        processed_bytes: u64,
        /// Total bytes for this sub-phase
        total_bytes: u64,
        /// Current throughput in bytes per second
        speed_bps: u64,
    },

    /// An observable sub-phase completed successfully
    PhaseSucceeded {
        /// Worker name
        worker: String,
        /// The sub-phase that succeeded
        phase: Phase,
    },

    /// An observable sub-phase failed
    PhaseFailed {
        /// Worker name
        worker: String,
        /// The sub-phase that failed
        phase: Phase,
        /// Error message
        error: String,
    },

    /// The flow finished: all requested workers succeeded (or no update)
    FlowFinished,

    /// The flow aborted after a denied retry
    FlowAborted {
        /// Error message from the aborting phase
        error: String,
    },
}

/// Broadcast-based event bus
///
/// Cheap to clone; all clones share the same channel. Senders never block and
/// never fail: with no live subscribers the event is simply dropped.
#[derive(Clone, Debug)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    /// Create a bus with the default channel capacity
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Subscribe to all subsequent events
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    /// Emit an event to all current subscribers
    pub fn emit(&self, event: Event) {
        // A send error only means there are no subscribers right now.
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
