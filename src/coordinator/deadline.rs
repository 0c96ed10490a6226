//! Ack barriers with per-phase deadlines and the single-resend policy.
//!
//! Each protocol phase (INIT confirmation, an UPDATE_Y wave, the UPDATE_X
//! broadcast, termination) opens a [`Barrier`] over the nodes it addressed.
//! The barrier tracks which acks are still outstanding against a
//! wall-clock window; when the window expires once, silent nodes get the
//! same request again (acks are idempotent on the node side); a second
//! expiry names the nodes that timed out.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use crate::codec::MessageKind;
use crate::types::{NodeId, UpdateMask};

/// Outcome of matching an incoming ack against a barrier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    /// The ack completed an outstanding entry.
    Completed,
    /// Same node, same mask, already completed: discard.
    Duplicate,
    /// The node acked a different mask than it was sent.
    WrongMask { expected: UpdateMask, got: UpdateMask },
    /// The node was never addressed in this phase.
    Unexpected,
}

/// What to do when the window expires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expiry {
    /// First miss: resend the same request to these nodes and rearm.
    Resend(Vec<(NodeId, UpdateMask)>),
    /// Final miss: these nodes are out of time.
    TimedOut(Vec<NodeId>),
}

/// Ack bookkeeping for one phase.
#[derive(Debug)]
pub struct Barrier {
    of: MessageKind,
    window: Duration,
    /// Whether expiry triggers one resend round before timing out.
    resend_allowed: bool,
    started: Instant,
    resent: bool,
    waiting: BTreeMap<NodeId, UpdateMask>,
    completed: BTreeMap<NodeId, UpdateMask>,
}

impl Barrier {
    pub fn new(of: MessageKind, window: Duration, resend_allowed: bool) -> Self {
        Self {
            of,
            window,
            resend_allowed,
            started: Instant::now(),
            resent: false,
            waiting: BTreeMap::new(),
            completed: BTreeMap::new(),
        }
    }

    /// The request kind this barrier collects acks for.
    pub fn of(&self) -> MessageKind {
        self.of
    }

    /// Registers an outstanding ack for `node` with the mask that was sent.
    pub fn expect(&mut self, node: NodeId, mask: UpdateMask) {
        self.waiting.insert(node, mask);
    }

    /// True once every addressed node has acked.
    pub fn is_done(&self) -> bool {
        self.waiting.is_empty()
    }

    /// Nodes still outstanding, with the masks they were sent.
    pub fn silent(&self) -> Vec<(NodeId, UpdateMask)> {
        self.waiting.iter().map(|(&n, &m)| (n, m)).collect()
    }

    /// Matches an incoming ack.
    pub fn on_ack(&mut self, node: NodeId, mask: UpdateMask) -> AckOutcome {
        if let Some(&expected) = self.waiting.get(&node) {
            if expected != mask {
                return AckOutcome::WrongMask { expected, got: mask };
            }
            self.waiting.remove(&node);
            self.completed.insert(node, mask);
            return AckOutcome::Completed;
        }
        match self.completed.get(&node) {
            Some(&done) if done == mask => AckOutcome::Duplicate,
            Some(&done) => AckOutcome::WrongMask { expected: done, got: mask },
            None => AckOutcome::Unexpected,
        }
    }

    /// Removes a node from the barrier without completing it (node left
    /// the federation mid-phase).
    pub fn forget(&mut self, node: NodeId) {
        self.waiting.remove(&node);
    }

    /// Time left in the current window.
    pub fn remaining(&self) -> Duration {
        self.window.saturating_sub(self.started.elapsed())
    }

    /// Handles a window expiry; `None` if nothing is outstanding.
    pub fn on_expiry(&mut self) -> Option<Expiry> {
        if self.waiting.is_empty() {
            return None;
        }
        if self.resend_allowed && !self.resent {
            self.resent = true;
            self.started = Instant::now();
            Some(Expiry::Resend(self.silent()))
        } else {
            Some(Expiry::TimedOut(self.waiting.keys().copied().collect()))
        }
    }
}
