//! Transport capability between the coordinator and its node peers.
//!
//! The coordinator requires four operations: send to one node, broadcast,
//! poll-receive with a timeout, and the setup-time binding of node ids to
//! endpoints. Concrete production back-ends (a pub/sub broker, a
//! name-server transport) live outside this crate and implement
//! [`Transport`]; the [`ChannelTransport`] here wires a federation of
//! in-process peers over bounded channels and is what the test federations
//! run on. Every hop carries encoded frames, so the codec is exercised on
//! both sides of each exchange.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use thiserror::Error;
use tracing::warn;

use crate::codec::{self, CodecError, Message};
use crate::types::NodeId;

/// Opaque endpoint address a transport can dispatch to.
pub type Endpoint = String;

/// Per-lane frame buffer depth for the in-process backend.
const LANE_CAPACITY: usize = 256;

/// Errors surfaced by transport operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("node {0} has no registered endpoint")]
    Unregistered(NodeId),

    #[error("unknown endpoint: {0}")]
    UnknownEndpoint(Endpoint),

    #[error("endpoint of node {0} is permanently lost")]
    EndpointLost(NodeId),
}

/// What a `recv` poll yields.
#[derive(Debug)]
pub enum TransportEvent {
    /// A decoded message from a peer.
    Message(NodeId, Message),
    /// A frame arrived but failed to decode; the coordinator logs and
    /// drops it.
    Malformed { node: NodeId, error: CodecError },
    /// The peer's endpoint is permanently gone.
    Down(NodeId),
}

/// The capability set the coordinator is constructed over.
pub trait Transport: Send {
    /// Binds a node id to an endpoint; established during setup and stable
    /// for the run.
    fn register(&mut self, node: NodeId, endpoint: &Endpoint) -> Result<(), TransportError>;

    /// Sends one message to one node. Non-blocking; fails only on
    /// permanent endpoint loss.
    fn send(&mut self, node: NodeId, msg: &Message) -> Result<(), TransportError>;

    /// Best-effort delivery to every registered node. Loss of an endpoint
    /// is reported through `recv`, not here.
    fn broadcast(&mut self, msg: &Message);

    /// Polls for the next event, waiting at most `timeout`. `None` means
    /// the deadline passed with nothing to deliver.
    fn recv(&mut self, timeout: Duration) -> Option<TransportEvent>;
}

type InboundFrame = (NodeId, Vec<u8>);

/// One side of an in-process lane: what a node peer holds.
///
/// `recv_timeout` yields decoded coordinator messages; malformed frames
/// are dropped with a warning, matching what a remote node stack would do.
#[derive(Debug)]
pub struct NodeLink {
    node: NodeId,
    rx: Receiver<Vec<u8>>,
    tx: Sender<InboundFrame>,
}

impl NodeLink {
    /// The node id this link was opened for.
    pub fn node(&self) -> NodeId {
        self.node
    }

    /// Receives the next coordinator message, waiting at most `timeout`.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<Message> {
        loop {
            let frame = self.rx.recv_timeout(timeout).ok()?;
            match codec::decode(&frame) {
                Ok(msg) => return Some(msg),
                Err(error) => {
                    warn!(node = self.node, %error, "dropping malformed frame");
                }
            }
        }
    }

    /// Sends a message to the coordinator. Silently dropped if the
    /// coordinator is gone.
    pub fn send(&self, msg: &Message) {
        let _ = self.tx.send((self.node, codec::encode(msg)));
    }

    /// Sends raw bytes to the coordinator, bypassing the encoder. Lets
    /// tests inject malformed frames.
    pub fn send_raw(&self, frame: Vec<u8>) {
        let _ = self.tx.send((self.node, frame));
    }
}

/// In-process transport backend: one inbound queue for the coordinator and
/// one bounded lane per peer.
///
/// Lanes are keyed by endpoint name when opened and bound to node ids via
/// [`Transport::register`]. Dropping a [`NodeLink`] makes its lane fail on
/// the next send, which surfaces as [`TransportEvent::Down`].
#[derive(Debug)]
pub struct ChannelTransport {
    inbound_rx: Receiver<InboundFrame>,
    inbound_tx: Sender<InboundFrame>,
    lanes: HashMap<Endpoint, Sender<Vec<u8>>>,
    peers: HashMap<NodeId, Sender<Vec<u8>>>,
    pending_down: VecDeque<NodeId>,
}

impl ChannelTransport {
    pub fn new() -> Self {
        let (inbound_tx, inbound_rx) = bounded(LANE_CAPACITY * 4);
        Self {
            inbound_rx,
            inbound_tx,
            lanes: HashMap::new(),
            peers: HashMap::new(),
            pending_down: VecDeque::new(),
        }
    }

    /// Opens a lane for a peer and returns the peer's side.
    ///
    /// The lane stays unaddressed until `register` binds a node id to the
    /// same endpoint name.
    pub fn open_link(&mut self, node: NodeId, endpoint: impl Into<Endpoint>) -> NodeLink {
        let (lane_tx, lane_rx) = bounded(LANE_CAPACITY);
        self.lanes.insert(endpoint.into(), lane_tx);
        NodeLink {
            node,
            rx: lane_rx,
            tx: self.inbound_tx.clone(),
        }
    }

    fn push_frame(&mut self, node: NodeId, lane: &Sender<Vec<u8>>, frame: Vec<u8>) -> bool {
        match lane.try_send(frame) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                // A wedged peer counts as lost: the protocol never queues
                // more than a lane's worth of unacked traffic.
                warn!(node, "peer lane full; treating endpoint as lost");
                self.pending_down.push_back(node);
                false
            }
            Err(TrySendError::Disconnected(_)) => {
                self.pending_down.push_back(node);
                false
            }
        }
    }
}

impl Default for ChannelTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for ChannelTransport {
    fn register(&mut self, node: NodeId, endpoint: &Endpoint) -> Result<(), TransportError> {
        let lane = self
            .lanes
            .get(endpoint)
            .ok_or_else(|| TransportError::UnknownEndpoint(endpoint.clone()))?;
        self.peers.insert(node, lane.clone());
        Ok(())
    }

    fn send(&mut self, node: NodeId, msg: &Message) -> Result<(), TransportError> {
        let lane = self
            .peers
            .get(&node)
            .cloned()
            .ok_or(TransportError::Unregistered(node))?;
        let frame = codec::encode(msg);
        if self.push_frame(node, &lane, frame) {
            Ok(())
        } else {
            self.peers.remove(&node);
            Err(TransportError::EndpointLost(node))
        }
    }

    fn broadcast(&mut self, msg: &Message) {
        let frame = codec::encode(msg);
        let peers: Vec<(NodeId, Sender<Vec<u8>>)> = self
            .peers
            .iter()
            .map(|(&node, lane)| (node, lane.clone()))
            .collect();
        for (node, lane) in peers {
            if !self.push_frame(node, &lane, frame.clone()) {
                self.peers.remove(&node);
            }
        }
    }

    fn recv(&mut self, timeout: Duration) -> Option<TransportEvent> {
        if let Some(node) = self.pending_down.pop_front() {
            return Some(TransportEvent::Down(node));
        }
        let (node, frame) = self.inbound_rx.recv_timeout(timeout).ok()?;
        match codec::decode(&frame) {
            Ok(msg) => Some(TransportEvent::Message(node, msg)),
            Err(error) => Some(TransportEvent::Malformed { node, error }),
        }
    }
}
