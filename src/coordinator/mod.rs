//! The coordinator: a single-threaded state machine owning the virtual
//! clock, the event queue, the update graph and the transport poll loop.
//!
//! Lifecycle: Setup (registration handshake) → Init (SIM_INIT barrier) →
//! Running (tick loop) → Stopping → Stopped, with Errored reachable from
//! everywhere. Each tick advances virtual time to the next scheduled
//! firing, closes the fired set over triggers, walks the dependency DAG in
//! waves of UPDATE_Y requests, broadcasts UPDATE_X once all output acks are
//! in, and reschedules periodic successors before the next tick starts.

pub mod deadline;
pub mod tick;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::codec::{AckStatus, Body, EventRequest, Message, MessageKind};
use crate::config::SystemConfig;
use crate::error::{Error, ProtocolError};
use crate::graph::{TickPlan, UpdateGraph};
use crate::queue::{EventQueue, FireReason, ScheduledFiring};
use crate::registry::{Liveness, NodeRegistry};
use crate::report::{Phase, ReportEvent, ReportSink, StopReason};
use crate::transport::{Transport, TransportError, TransportEvent};
use crate::types::{NodeId, SimTime, UpdateMask};

use deadline::{AckOutcome, Barrier, Expiry};
use tick::TickWorkspace;

/// Cloneable cancellation flag checked at tick boundaries.
///
/// Cancelling never interrupts a tick mid-barrier; the coordinator moves
/// to Stopping once the current tick completes.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }
}

/// The system management node's scheduling core.
pub struct Coordinator {
    config: SystemConfig,
    registry: NodeRegistry,
    graph: UpdateGraph,
    queue: EventQueue,
    transport: Box<dyn Transport>,
    sink: Box<dyn ReportSink>,
    cancel: CancelToken,
    t: SimTime,
    phase: Phase,
    /// Irregular requests received outside a tick barrier.
    stray_requests: Vec<(NodeId, EventRequest)>,
}

impl Coordinator {
    /// Builds a coordinator over an immutable configuration.
    ///
    /// Validates the configuration and refuses to start on a cycle in the
    /// dependency projection.
    pub fn new(
        config: SystemConfig,
        transport: Box<dyn Transport>,
        sink: Box<dyn ReportSink>,
    ) -> Result<Self, Error> {
        config.validate()?;
        let graph = UpdateGraph::new(&config)?;
        let registry = NodeRegistry::from_config(&config);
        Ok(Self {
            config,
            registry,
            graph,
            queue: EventQueue::new(),
            transport,
            sink,
            cancel: CancelToken::new(),
            t: 0,
            phase: Phase::Setup,
            stray_requests: Vec::new(),
        })
    }

    /// A handle the surrounding process can use to request cancellation.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Current virtual time.
    pub fn time(&self) -> SimTime {
        self.t
    }

    /// Current lifecycle phase.
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Runs the federation to completion.
    ///
    /// On a fatal condition the coordinator broadcasts SIM_TERM, drains
    /// acks for a grace window, reports `Finished(Errored)` and returns
    /// the error.
    pub fn run(&mut self) -> Result<StopReason, Error> {
        self.sink.write(ReportEvent::PhaseChanged { phase: Phase::Setup });
        match self.run_inner() {
            Ok(reason) => Ok(reason),
            Err(err) => {
                self.fail(&err);
                Err(err)
            }
        }
    }

    fn run_inner(&mut self) -> Result<StopReason, Error> {
        self.setup()?;
        self.init()?;

        self.set_phase(Phase::Running);
        for id in 0..self.registry.len() as NodeId {
            self.registry.advance(id, Liveness::Running)?;
        }
        self.seed_queue();

        let reason = loop {
            if self.cancel.is_cancelled() {
                break StopReason::Cancelled;
            }
            let Some(next) = self.queue.peek_time() else {
                break StopReason::QueueEmpty;
            };
            if next > self.config.final_time {
                break StopReason::Completed;
            }
            self.tick()?;
            if self.t >= self.config.final_time {
                break StopReason::Completed;
            }
        };

        self.shutdown(reason);
        Ok(reason)
    }

    // ---- Setup: registration handshake ---------------------------------

    fn setup(&mut self) -> Result<(), Error> {
        let window = self.config.deadlines.init();
        let started = Instant::now();

        while !self.registry.all_at_least(Liveness::Registered) {
            let remaining = window.saturating_sub(started.elapsed());
            if remaining.is_zero() {
                let missing = self.registry.ids_in(Liveness::Unregistered);
                let node = missing.first().copied().unwrap_or(0);
                return Err(Error::Timeout {
                    node,
                    during: MessageKind::SysRequestConnect,
                    t: 0,
                });
            }
            let Some(event) = self.transport.recv(remaining) else {
                continue;
            };
            match event {
                TransportEvent::Malformed { node, error } => {
                    warn!(node, %error, "dropping malformed frame");
                }
                TransportEvent::Down(node) => {
                    self.mark_lost(node);
                    return Err(TransportError::EndpointLost(node).into());
                }
                TransportEvent::Message(node, msg) => match msg.body {
                    Body::SysRequestConnect { workspace, name, block_count } => {
                        self.register_node(node, &workspace, &name, block_count)?;
                    }
                    Body::SysOpenPort { port } => {
                        debug!(node, port = %port, "peer opened a port");
                    }
                    Body::Event { fire_time } => {
                        self.stray_requests
                            .push((node, EventRequest { fire_time, mask: msg.mask }));
                    }
                    other => {
                        return Err(ProtocolError::UnexpectedPhase { node, got: other.kind() }.into());
                    }
                },
            }
        }

        self.registry.freeze();
        Ok(())
    }

    fn register_node(
        &mut self,
        from: NodeId,
        workspace: &str,
        name: &str,
        block_count: u32,
    ) -> Result<(), Error> {
        if workspace != self.config.workspace {
            return Err(ProtocolError::UnknownNode(from).into());
        }
        let id = self.registry.register(name, block_count)?;
        if id != from {
            return Err(ProtocolError::UnknownNode(from).into());
        }
        let endpoint = format!("{workspace}/{name}");
        self.transport.register(id, &endpoint)?;
        debug!(node = id, name, "node registered");
        Ok(())
    }

    // ---- Init: SIM_INIT barrier ----------------------------------------

    fn init(&mut self) -> Result<(), Error> {
        self.set_phase(Phase::Init);

        // Missing init acks escalate without a resend round.
        let mut barrier = Barrier::new(MessageKind::Init, self.config.deadlines.init(), false);
        let nodes: Vec<NodeId> = self.registry.iter().map(|e| e.id).collect();
        for node in nodes {
            let msg = self.phase_message(MessageKind::Init, 0, node, 0);
            self.send_or_cascade(node, &msg)?;
            barrier.expect(node, 0);
        }

        let mut scratch = TickWorkspace::new(0, TickPlan {
            fired: Vec::new(),
            triggered: Vec::new(),
            waves: Vec::new(),
        });
        self.collect(&mut scratch, &mut barrier)?;
        self.stray_requests.append(&mut scratch.requests);

        for id in 0..self.registry.len() as NodeId {
            self.registry.advance(id, Liveness::Ready)?;
        }
        Ok(())
    }

    // ---- Running: the tick protocol ------------------------------------

    fn seed_queue(&mut self) {
        for gx in self.graph.periodic_blocks().collect::<Vec<_>>() {
            let r = self.graph.block_ref(gx);
            self.queue.push(ScheduledFiring {
                fire_time: 0,
                rank: gx,
                node: r.node,
                block: r.block,
                reason: FireReason::Periodic,
            });
        }
    }

    fn tick(&mut self) -> Result<(), Error> {
        let batch = self.queue.pop_due();
        debug_assert!(!batch.is_empty());
        let t = batch[0].fire_time;
        debug_assert!(t >= self.t);
        self.pace(self.t, t);
        self.t = t;
        self.sink.write(ReportEvent::TickStarted { t });

        let seed: Vec<u32> = batch.iter().map(|f| f.rank).collect();
        let plan = self.graph.plan_tick(&seed)?;
        let mut ws = TickWorkspace::new(t, plan);
        for (node, req) in std::mem::take(&mut self.stray_requests) {
            ws.push_request(node, req);
        }

        // UPDATE_Y: one wave at a time; all requests of a wave go out
        // before any ack is awaited so the nodes compute concurrently.
        for wave in 0..ws.wave_count() {
            let masks = ws.wave_masks(&self.graph, wave);
            let mut barrier =
                Barrier::new(MessageKind::UpdateY, self.config.deadlines.update_y(), true);
            for &(node, mask) in &masks {
                let msg = self.phase_message(MessageKind::UpdateY, t, node, mask);
                self.send_or_cascade(node, &msg)?;
                barrier.expect(node, mask);
            }
            self.collect(&mut ws, &mut barrier)?;
        }

        // UPDATE_X: no inter-node ordering; dispatched in parallel and
        // gated before the next tick.
        let x_targets = ws.x_targets(&self.graph, &self.registry);
        if !x_targets.is_empty() {
            let mut barrier =
                Barrier::new(MessageKind::UpdateX, self.config.deadlines.update_x(), true);
            for &(node, mask) in &x_targets {
                let msg = self.phase_message(MessageKind::UpdateX, t, node, mask);
                self.send_or_cascade(node, &msg)?;
                barrier.expect(node, mask);
            }
            self.collect(&mut ws, &mut barrier)?;
        }

        self.reschedule(&ws);
        self.sink.write(ReportEvent::TickCompleted {
            t,
            fired: ws.fired_count(),
            waves: ws.wave_count(),
        });
        Ok(())
    }

    fn reschedule(&mut self, ws: &TickWorkspace) {
        for &gx in &ws.plan.fired {
            let period = self.graph.period(gx);
            if period > 0 {
                let r = self.graph.block_ref(gx);
                self.queue.push(ScheduledFiring {
                    fire_time: ws.t + period,
                    rank: gx,
                    node: r.node,
                    block: r.block,
                    reason: FireReason::Periodic,
                });
            }
        }

        for &(node, req) in &ws.requests {
            if req.fire_time < ws.t {
                self.sink.write(ReportEvent::LateEvent {
                    node,
                    fire_time: req.fire_time,
                    t: ws.t,
                    reason: FireReason::Irregular,
                });
                continue;
            }
            for block in 0..64u32 {
                if req.mask & (1u64 << block) == 0 {
                    continue;
                }
                match self.graph.rank(node, block) {
                    Some(rank) => self.queue.push(ScheduledFiring {
                        fire_time: req.fire_time,
                        rank,
                        node,
                        block,
                        reason: FireReason::Irregular,
                    }),
                    None => warn!(node, block, "event request names unknown block"),
                }
            }
        }
    }

    fn pace(&self, from: SimTime, to: SimTime) {
        let Some(scale) = self.config.pacing_scale else {
            return;
        };
        let us = (to - from) as f64 * self.config.time_unit_us as f64 * scale;
        if us >= 1.0 {
            std::thread::sleep(Duration::from_micros(us as u64));
        }
    }

    // ---- Barrier collection --------------------------------------------

    /// Runs one barrier to completion, consuming one transport event or
    /// one timeout per step.
    fn collect(&mut self, ws: &mut TickWorkspace, barrier: &mut Barrier) -> Result<(), Error> {
        while !barrier.is_done() {
            let remaining = barrier.remaining();
            let event = if remaining.is_zero() {
                None
            } else {
                self.transport.recv(remaining)
            };
            match event {
                Some(event) => self.step_event(ws, barrier, event)?,
                None => match barrier.on_expiry() {
                    None => {}
                    Some(Expiry::Resend(silent)) => {
                        let of = barrier.of();
                        for (node, mask) in silent {
                            self.sink.write(ReportEvent::Resend { node, t: ws.t });
                            let msg = self.phase_message(of, ws.t, node, mask);
                            self.send_or_cascade(node, &msg)?;
                        }
                    }
                    Some(Expiry::TimedOut(nodes)) => {
                        for &node in &nodes {
                            self.mark_lost(node);
                        }
                        return Err(Error::Timeout {
                            node: nodes[0],
                            during: barrier.of(),
                            t: ws.t,
                        });
                    }
                },
            }
        }
        Ok(())
    }

    /// Processes a single transport event against the active barrier.
    fn step_event(
        &mut self,
        ws: &mut TickWorkspace,
        barrier: &mut Barrier,
        event: TransportEvent,
    ) -> Result<(), Error> {
        match event {
            TransportEvent::Malformed { node, error } => {
                warn!(node, %error, "dropping malformed frame");
                Ok(())
            }
            TransportEvent::Down(node) => {
                barrier.forget(node);
                self.mark_lost(node);
                Err(TransportError::EndpointLost(node).into())
            }
            TransportEvent::Message(node, msg) => {
                if self.registry.get(node).is_none() {
                    return Err(ProtocolError::UnknownNode(node).into());
                }
                match msg.body {
                    Body::Ack { of, status, next_event } => {
                        if let AckStatus::Failed(code) = status {
                            return Err(self.node_errored(node, code as u32, "ack status"));
                        }
                        if let Some(req) = next_event {
                            ws.push_request(node, req);
                        }
                        self.match_ack(ws, barrier, node, of, msg.mask, msg.time)
                    }
                    Body::Event { fire_time } => {
                        ws.push_request(node, EventRequest { fire_time, mask: msg.mask });
                        Ok(())
                    }
                    Body::Error { code, info } => Err(self.node_errored(node, code, &info)),
                    Body::SysOpenPort { .. } | Body::SysRequestConnect { .. } => {
                        debug!(node, "ignoring setup message after setup closed");
                        Ok(())
                    }
                    other => {
                        Err(ProtocolError::UnexpectedPhase { node, got: other.kind() }.into())
                    }
                }
            }
        }
    }

    fn match_ack(
        &mut self,
        ws: &mut TickWorkspace,
        barrier: &mut Barrier,
        node: NodeId,
        of: MessageKind,
        mask: UpdateMask,
        time: SimTime,
    ) -> Result<(), Error> {
        if time < ws.t {
            debug!(node, time, t = ws.t, "discarding ack from an earlier tick");
            return Ok(());
        }
        if of != barrier.of() {
            // Init confirmations precede every tick; a late duplicate is
            // never a violation.
            if of == MessageKind::Init || ws.is_stale_duplicate(node, of, mask) {
                return Ok(());
            }
            return Err(ProtocolError::UnexpectedPhase { node, got: MessageKind::Ack }.into());
        }
        match barrier.on_ack(node, mask) {
            AckOutcome::Completed => {
                ws.note_ack(node, of, mask);
                Ok(())
            }
            AckOutcome::Duplicate => Ok(()),
            AckOutcome::WrongMask { expected, got } => {
                if ws.is_stale_duplicate(node, of, got) {
                    return Ok(());
                }
                Err(ProtocolError::UnexpectedMask { node, expected, got }.into())
            }
            AckOutcome::Unexpected => {
                if ws.is_stale_duplicate(node, of, mask) {
                    return Ok(());
                }
                Err(ProtocolError::UnexpectedPhase { node, got: MessageKind::Ack }.into())
            }
        }
    }

    // ---- Shutdown paths ------------------------------------------------

    fn shutdown(&mut self, reason: StopReason) {
        self.set_phase(Phase::Stopping);
        self.transport.broadcast(&Message::new(self.t, 0, 0, Body::Term));

        let mut barrier = Barrier::new(MessageKind::Term, self.config.deadlines.term(), false);
        for id in self.registry.ids_in(Liveness::Running) {
            barrier.expect(id, 0);
        }

        // Best effort: missing term acks are not escalated.
        while !barrier.is_done() {
            let remaining = barrier.remaining();
            if remaining.is_zero() {
                break;
            }
            match self.transport.recv(remaining) {
                Some(TransportEvent::Message(node, msg)) => {
                    if let Body::Ack { of: MessageKind::Term, .. } = msg.body {
                        if barrier.on_ack(node, msg.mask) == AckOutcome::Completed {
                            let _ = self.registry.advance(node, Liveness::Stopped);
                        }
                    }
                }
                Some(_) => {}
                None => break,
            }
        }

        self.set_phase(Phase::Stopped);
        self.sink.write(ReportEvent::Finished { reason });
    }

    fn fail(&mut self, err: &Error) {
        tracing::error!(%err, t = self.t, "run failed");
        self.set_phase(Phase::Errored);
        self.transport.broadcast(&Message::new(self.t, 0, 0, Body::Term));

        // Drain under a short grace window so peers see the termination.
        let grace = self.config.deadlines.term();
        let started = Instant::now();
        loop {
            let remaining = grace.saturating_sub(started.elapsed());
            if remaining.is_zero() || self.transport.recv(remaining).is_none() {
                break;
            }
        }

        self.sink.write(ReportEvent::Finished { reason: StopReason::Errored });
    }

    // ---- Helpers -------------------------------------------------------

    fn set_phase(&mut self, phase: Phase) {
        if self.phase != phase {
            self.phase = phase;
            self.sink.write(ReportEvent::PhaseChanged { phase });
        }
    }

    fn phase_message(&self, of: MessageKind, t: SimTime, node: NodeId, mask: UpdateMask) -> Message {
        let body = match of {
            MessageKind::UpdateY => Body::UpdateY,
            MessageKind::UpdateX => Body::UpdateX,
            MessageKind::Term => Body::Term,
            MessageKind::Init => Body::Init {
                time_unit_us: self.config.time_unit_us,
                block_count: self
                    .registry
                    .get(node)
                    .map(|e| e.decl.blocks.len() as u32)
                    .unwrap_or(0),
            },
            _ => unreachable!("not a coordinator request kind"),
        };
        Message::new(t, node, mask, body)
    }

    /// Sends with one retry; a second failure removes the node and
    /// escalates as a transport loss.
    fn send_or_cascade(&mut self, node: NodeId, msg: &Message) -> Result<(), Error> {
        if let Err(first) = self.transport.send(node, msg) {
            warn!(node, %first, "send failed, retrying once");
            if let Err(second) = self.transport.send(node, msg) {
                self.mark_lost(node);
                return Err(second.into());
            }
        }
        Ok(())
    }

    /// Timeout/transport-loss cascade: absorbing liveness, queue purge,
    /// report.
    fn mark_lost(&mut self, node: NodeId) {
        let _ = self.registry.advance(node, Liveness::TimedOut);
        self.queue.remove_node(node);
        self.sink.write(ReportEvent::NodeTimedOut { id: node });
    }

    fn node_errored(&mut self, node: NodeId, code: u32, info: &str) -> Error {
        let _ = self.registry.advance(node, Liveness::Errored);
        self.sink.write(ReportEvent::NodeError { id: node, info: info.to_string() });
        Error::Node { id: node, code, info: info.to_string() }
    }
}
