//! Node registry: the id-indexed table of federation members.
//!
//! Node ids are assigned from declaration order in the system
//! configuration and stay stable for the run. Registration is idempotent:
//! a repeated `SYS_REQUEST_CONNECT` for a known name with a matching block
//! signature succeeds; a conflicting signature fails. Once the setup phase
//! closes the registry is frozen and only liveness may change.

use std::collections::HashMap;
use thiserror::Error;

use crate::config::{NodeDecl, SystemConfig};
use crate::types::NodeId;

/// Errors raised by registry operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("unknown node: {0}")]
    UnknownNode(String),

    #[error("registration conflict for {name}: declared {declared} blocks, expected {expected}")]
    RegistrationConflict {
        name: String,
        expected: u32,
        declared: u32,
    },

    #[error("registry is frozen")]
    Frozen,

    #[error("invalid liveness transition {from:?} -> {to:?} for node {node}")]
    InvalidTransition {
        node: NodeId,
        from: Liveness,
        to: Liveness,
    },
}

/// Per-node lifecycle state.
///
/// The normal path is Unregistered → Registered → Ready → Running →
/// Stopped; Errored and TimedOut are absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Liveness {
    Unregistered,
    Registered,
    Ready,
    Running,
    Stopped,
    Errored,
    TimedOut,
}

impl Liveness {
    /// True for states no transition may leave.
    pub fn is_absorbing(self) -> bool {
        matches!(self, Liveness::Errored | Liveness::TimedOut)
    }

    fn normal_rank(self) -> Option<u8> {
        match self {
            Liveness::Unregistered => Some(0),
            Liveness::Registered => Some(1),
            Liveness::Ready => Some(2),
            Liveness::Running => Some(3),
            Liveness::Stopped => Some(4),
            Liveness::Errored | Liveness::TimedOut => None,
        }
    }
}

/// One registered node.
#[derive(Debug, Clone)]
pub struct NodeEntry {
    pub id: NodeId,
    pub name: String,
    pub decl: NodeDecl,
    pub liveness: Liveness,
}

impl NodeEntry {
    /// Mask covering every declared block of this node.
    pub fn full_mask(&self) -> u64 {
        if self.decl.blocks.is_empty() {
            0
        } else {
            u64::MAX >> (64 - self.decl.blocks.len())
        }
    }
}

/// Id-indexed node table plus a name lookup.
#[derive(Debug)]
pub struct NodeRegistry {
    entries: Vec<NodeEntry>,
    by_name: HashMap<String, NodeId>,
    frozen: bool,
}

impl NodeRegistry {
    /// Builds the registry from the configured node declarations; every
    /// node starts Unregistered.
    pub fn from_config(config: &SystemConfig) -> Self {
        let mut entries = Vec::with_capacity(config.nodes.len());
        let mut by_name = HashMap::with_capacity(config.nodes.len());
        for (idx, decl) in config.nodes.iter().enumerate() {
            let id = idx as NodeId;
            by_name.insert(decl.name.clone(), id);
            entries.push(NodeEntry {
                id,
                name: decl.name.clone(),
                decl: decl.clone(),
                liveness: Liveness::Unregistered,
            });
        }
        Self { entries, by_name, frozen: false }
    }

    /// Registers a node by name against its declared signature.
    ///
    /// Idempotent: re-registering an already Registered node with the same
    /// signature returns its id again.
    pub fn register(&mut self, name: &str, block_count: u32) -> Result<NodeId, RegistryError> {
        if self.frozen {
            return Err(RegistryError::Frozen);
        }
        let id = *self
            .by_name
            .get(name)
            .ok_or_else(|| RegistryError::UnknownNode(name.to_string()))?;
        let entry = &mut self.entries[id as usize];
        let expected = entry.decl.blocks.len() as u32;
        if block_count != expected {
            return Err(RegistryError::RegistrationConflict {
                name: name.to_string(),
                expected,
                declared: block_count,
            });
        }
        if entry.liveness == Liveness::Unregistered {
            entry.liveness = Liveness::Registered;
        }
        Ok(id)
    }

    /// Closes the setup phase; no further registrations are accepted.
    pub fn freeze(&mut self) {
        self.frozen = true;
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    /// Advances a node along the liveness state machine.
    ///
    /// Absorbing targets are always accepted; otherwise the transition
    /// must move forward on the normal path. Absorbing states never leave.
    pub fn advance(&mut self, id: NodeId, to: Liveness) -> Result<(), RegistryError> {
        let entry = self
            .entries
            .get_mut(id as usize)
            .ok_or_else(|| RegistryError::UnknownNode(format!("#{id}")))?;
        let from = entry.liveness;
        if from.is_absorbing() {
            // TimedOut/Errored stay put, even against later Stopped marks.
            return Ok(());
        }
        if to.is_absorbing() {
            entry.liveness = to;
            return Ok(());
        }
        match (from.normal_rank(), to.normal_rank()) {
            (Some(a), Some(b)) if b > a => {
                entry.liveness = to;
                Ok(())
            }
            _ => Err(RegistryError::InvalidTransition { node: id, from, to }),
        }
    }

    pub fn get(&self, id: NodeId) -> Option<&NodeEntry> {
        self.entries.get(id as usize)
    }

    pub fn id_of(&self, name: &str) -> Option<NodeId> {
        self.by_name.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &NodeEntry> {
        self.entries.iter()
    }

    /// Ids of all nodes currently in the given state.
    pub fn ids_in(&self, liveness: Liveness) -> Vec<NodeId> {
        self.entries
            .iter()
            .filter(|e| e.liveness == liveness)
            .map(|e| e.id)
            .collect()
    }

    /// True when every node has reached at least `liveness` on the normal
    /// path (absorbing states count as not reached).
    pub fn all_at_least(&self, liveness: Liveness) -> bool {
        let Some(want) = liveness.normal_rank() else {
            return false;
        };
        self.entries
            .iter()
            .all(|e| e.liveness.normal_rank().map_or(false, |r| r >= want))
    }
}
