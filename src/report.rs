//! Structured progress and diagnostic events.
//!
//! The coordinator writes typed events to a [`ReportSink`]; the sink must
//! accept or drop them without ever applying backpressure to the
//! scheduler. [`MemorySink`] buffers events for inspection (tests,
//! post-run summaries); [`TracingSink`] forwards them to the `tracing`
//! subscriber.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::queue::FireReason;
use crate::types::{NodeId, SimTime};

/// Externally visible coordinator lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    Setup,
    Init,
    Running,
    Stopping,
    Stopped,
    Errored,
}

/// Why a run finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopReason {
    /// Virtual time reached the configured final time.
    Completed,
    /// Nothing left to schedule.
    QueueEmpty,
    /// The surrounding process asked for cancellation.
    Cancelled,
    /// A fatal condition terminated the run.
    Errored,
}

/// One structured report event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ReportEvent {
    /// The coordinator moved to a new lifecycle phase.
    PhaseChanged { phase: Phase },

    /// A tick began at virtual time `t`.
    TickStarted { t: SimTime },

    /// A tick completed its full barrier.
    TickCompleted {
        t: SimTime,
        /// Number of blocks fired, trigger closure included.
        fired: usize,
        /// Number of UPDATE_Y waves the tick needed.
        waves: usize,
    },

    /// An UPDATE_Y or UPDATE_X request was resent after a missed ack.
    Resend { node: NodeId, t: SimTime },

    /// A node-requested firing arrived with a fire time already in the
    /// past and was discarded.
    LateEvent {
        node: NodeId,
        fire_time: SimTime,
        t: SimTime,
        reason: FireReason,
    },

    /// A node missed its deadline after the allowed resend.
    NodeTimedOut { id: NodeId },

    /// A node reported a fatal error.
    NodeError { id: NodeId, info: String },

    /// The run is over.
    Finished { reason: StopReason },
}

/// Sink interface the coordinator writes events to.
///
/// Implementations must not block: accept or drop.
pub trait ReportSink: Send {
    fn write(&self, event: ReportEvent);
}

/// Buffers all events in memory; cloning shares the buffer.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    events: Arc<Mutex<Vec<ReportEvent>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything written so far.
    pub fn events(&self) -> Vec<ReportEvent> {
        self.events.lock().clone()
    }

    /// All tick-start times, in write order.
    pub fn tick_starts(&self) -> Vec<SimTime> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                ReportEvent::TickStarted { t } => Some(*t),
                _ => None,
            })
            .collect()
    }

    /// All `(t, fired, waves)` tick summaries, in write order.
    pub fn tick_completions(&self) -> Vec<(SimTime, usize, usize)> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                ReportEvent::TickCompleted { t, fired, waves } => Some((*t, *fired, *waves)),
                _ => None,
            })
            .collect()
    }

    /// The final stop reason, if the run finished.
    pub fn finish_reason(&self) -> Option<StopReason> {
        self.events.lock().iter().rev().find_map(|e| match e {
            ReportEvent::Finished { reason } => Some(*reason),
            _ => None,
        })
    }
}

impl ReportSink for MemorySink {
    fn write(&self, event: ReportEvent) {
        self.events.lock().push(event);
    }
}

/// Forwards events to the `tracing` subscriber and keeps nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl ReportSink for TracingSink {
    fn write(&self, event: ReportEvent) {
        match &event {
            ReportEvent::PhaseChanged { phase } => info!(?phase, "phase changed"),
            ReportEvent::TickStarted { t } => info!(t, "tick started"),
            ReportEvent::TickCompleted { t, fired, waves } => {
                info!(t, fired, waves, "tick completed");
            }
            ReportEvent::Resend { node, t } => warn!(node, t, "resent update request"),
            ReportEvent::LateEvent { node, fire_time, t, .. } => {
                warn!(node, fire_time, t, "discarded late event");
            }
            ReportEvent::NodeTimedOut { id } => error!(node = id, "node timed out"),
            ReportEvent::NodeError { id, info } => error!(node = id, info = %info, "node error"),
            ReportEvent::Finished { reason } => info!(?reason, "run finished"),
        }
    }
}

/// Swallows everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl ReportSink for NullSink {
    fn write(&self, _event: ReportEvent) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_sink_shares_buffer() {
        let sink = MemorySink::new();
        let clone = sink.clone();
        sink.write(ReportEvent::TickStarted { t: 0 });
        clone.write(ReportEvent::TickCompleted { t: 0, fired: 1, waves: 1 });

        assert_eq!(sink.events().len(), 2);
        assert_eq!(sink.tick_starts(), vec![0]);
        assert_eq!(sink.tick_completions(), vec![(0, 1, 1)]);
    }

    #[test]
    fn test_finish_reason() {
        let sink = MemorySink::new();
        assert_eq!(sink.finish_reason(), None);
        sink.write(ReportEvent::Finished { reason: StopReason::Completed });
        assert_eq!(sink.finish_reason(), Some(StopReason::Completed));
    }

    #[test]
    fn test_event_serialization() {
        let event = ReportEvent::TickCompleted { t: 1000, fired: 3, waves: 2 };
        let json = serde_json::to_string(&event).unwrap();
        let back: ReportEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(event, back);
    }

    #[test]
    fn test_null_sink_accepts_everything() {
        let sink = NullSink;
        for t in 0..100 {
            sink.write(ReportEvent::TickStarted { t });
        }
    }
}
