//! Crate-level error umbrella.

use thiserror::Error;

use crate::codec::{CodecError, MessageKind};
use crate::config::ConfigError;
use crate::registry::RegistryError;
use crate::transport::TransportError;
use crate::types::{NodeId, SimTime, UpdateMask};

/// Protocol violations observed by the coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("node {node} acked mask {got:#x}, expected {expected:#x}")]
    UnexpectedMask {
        node: NodeId,
        expected: UpdateMask,
        got: UpdateMask,
    },

    #[error("message from unregistered node {0}")]
    UnknownNode(NodeId),

    #[error("node {node} sent {got:?} outside the expected phase")]
    UnexpectedPhase { node: NodeId, got: MessageKind },
}

/// Any error that can terminate a run.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("node {node} missed the {during:?} deadline at t={t}")]
    Timeout {
        node: NodeId,
        during: MessageKind,
        t: SimTime,
    },

    #[error("node {id} reported error {code}: {info}")]
    Node { id: NodeId, code: u32, info: String },
}
