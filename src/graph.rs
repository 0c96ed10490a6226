//! Dependency projection over blocks and the per-tick wave scheduler.
//!
//! Every (node, block) pair is mapped to a dense global index in
//! registration order; all edges are stored as contiguous index adjacency
//! lists. The full projection (internal dependencies plus cross-node
//! feedthrough) is checked for cycles once at construction; each tick then
//! restricts the same edges to the fired set and partitions it into
//! topological waves using Kahn's algorithm.

use std::collections::HashMap;

use crate::config::{ConfigError, SystemConfig};
use crate::types::{block_bit, BlockId, NodeId, SimTime, UpdateMask};

/// A (node, block) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockRef {
    pub node: NodeId,
    pub block: BlockId,
}

#[derive(Debug, Clone)]
struct BlockInfo {
    node: NodeId,
    block: BlockId,
    period: SimTime,
}

/// The result of planning one tick: the closed fired set and its wave
/// partition, both in global-index terms.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TickPlan {
    /// All blocks firing this tick, ascending global index.
    pub fired: Vec<u32>,
    /// Blocks added by trigger expansion (subset of `fired`).
    pub triggered: Vec<u32>,
    /// Topological wave partition of `fired`; each wave ascending.
    pub waves: Vec<Vec<u32>>,
}

/// Static dependency structure plus the reusable tick workspace.
#[derive(Debug)]
pub struct UpdateGraph {
    blocks: Vec<BlockInfo>,
    /// node id -> global index of its block 0.
    node_base: Vec<u32>,
    /// gx -> successors that must wait for gx (feedthrough + internal).
    dependents: Vec<Vec<u32>>,
    /// gx -> blocks whose triggering inputs are fed by gx's outputs.
    triggers: Vec<Vec<u32>>,
    // Tick workspace, reused across ticks.
    in_set: Vec<bool>,
    in_deg: Vec<u32>,
}

impl UpdateGraph {
    /// Builds the projection from a validated configuration and verifies
    /// it is acyclic.
    pub fn new(config: &SystemConfig) -> Result<Self, ConfigError> {
        let mut blocks = Vec::with_capacity(config.block_count());
        let mut node_base = Vec::with_capacity(config.nodes.len());
        for (node_idx, node) in config.nodes.iter().enumerate() {
            node_base.push(blocks.len() as u32);
            for (block_idx, block) in node.blocks.iter().enumerate() {
                blocks.push(BlockInfo {
                    node: node_idx as NodeId,
                    block: block_idx as BlockId,
                    period: block.period,
                });
            }
        }

        let total = blocks.len();
        let mut dependents = vec![Vec::new(); total];
        let mut triggers = vec![Vec::new(); total];

        // Internal dependencies: dep must finish before the block.
        for (node_idx, node) in config.nodes.iter().enumerate() {
            let base = node_base[node_idx] as usize;
            for (block_idx, block) in node.blocks.iter().enumerate() {
                for &dep in &block.internal_deps {
                    dependents[base + dep as usize].push((base + block_idx) as u32);
                }
            }
        }

        // Cross-node edges derived from connections: producer blocks of the
        // source port feed every destination block that lists the input as
        // feedthrough (ordering) or trigger (same-tick firing).
        let name_to_idx: HashMap<&str, usize> = config
            .nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (n.name.as_str(), i))
            .collect();

        for conn in &config.connections {
            let src_idx = name_to_idx[conn.src_node.as_str()];
            let dst_idx = name_to_idx[conn.dst_node.as_str()];
            let src_base = node_base[src_idx] as usize;
            let dst_base = node_base[dst_idx] as usize;

            for (src_block, decl) in config.nodes[src_idx].blocks.iter().enumerate() {
                if !decl.output_ports.contains(&conn.src_port) {
                    continue;
                }
                let src_gx = (src_base + src_block) as u32;
                for (dst_block, dst_decl) in config.nodes[dst_idx].blocks.iter().enumerate() {
                    let dst_gx = (dst_base + dst_block) as u32;
                    if dst_decl.feedthrough_inputs.contains(&conn.dst_port) {
                        dependents[src_gx as usize].push(dst_gx);
                    }
                    if dst_decl.triggering_inputs.contains(&conn.dst_port) {
                        triggers[src_gx as usize].push(dst_gx);
                    }
                }
            }
        }

        for list in dependents.iter_mut().chain(triggers.iter_mut()) {
            list.sort_unstable();
            list.dedup();
        }

        let graph = Self {
            blocks,
            node_base,
            dependents,
            triggers,
            in_set: vec![false; total],
            in_deg: vec![0; total],
        };
        graph.check_static_acyclic(config)?;
        Ok(graph)
    }

    /// Cycle check over the full projection (I2): refuse the configuration
    /// before the run begins.
    fn check_static_acyclic(&self, config: &SystemConfig) -> Result<(), ConfigError> {
        let total = self.blocks.len();
        let mut in_deg = vec![0u32; total];
        for deps in &self.dependents {
            for &dst in deps {
                in_deg[dst as usize] += 1;
            }
        }

        let mut queue: Vec<u32> = (0..total as u32)
            .filter(|&gx| in_deg[gx as usize] == 0)
            .collect();
        let mut seen = 0usize;
        while let Some(gx) = queue.pop() {
            seen += 1;
            for &dst in &self.dependents[gx as usize] {
                in_deg[dst as usize] -= 1;
                if in_deg[dst as usize] == 0 {
                    queue.push(dst);
                }
            }
        }

        if seen != total {
            let stuck: Vec<String> = (0..total)
                .filter(|&gx| in_deg[gx] > 0)
                .map(|gx| {
                    let info = &self.blocks[gx];
                    format!("{}:{}", config.nodes[info.node as usize].name, info.block)
                })
                .collect();
            return Err(ConfigError::DependencyCycle(stuck.join(", ")));
        }
        Ok(())
    }

    /// Number of blocks in the federation.
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Global index of a block; the queue tiebreak rank.
    pub fn rank(&self, node: NodeId, block: BlockId) -> Option<u32> {
        let base = *self.node_base.get(node as usize)?;
        let gx = base + block;
        let info = self.blocks.get(gx as usize)?;
        (info.node == node && info.block == block).then_some(gx)
    }

    /// The (node, block) pair behind a global index.
    pub fn block_ref(&self, gx: u32) -> BlockRef {
        let info = &self.blocks[gx as usize];
        BlockRef { node: info.node, block: info.block }
    }

    /// Declared period of a block, 0 for event-only.
    pub fn period(&self, gx: u32) -> SimTime {
        self.blocks[gx as usize].period
    }

    /// Iterator over all global indices with a positive period.
    pub fn periodic_blocks(&self) -> impl Iterator<Item = u32> + '_ {
        (0..self.blocks.len() as u32).filter(|&gx| self.blocks[gx as usize].period > 0)
    }

    /// Groups a set of global indices into per-node update masks.
    pub fn masks_by_node(&self, set: &[u32]) -> Vec<(NodeId, UpdateMask)> {
        let mut masks: Vec<(NodeId, UpdateMask)> = Vec::new();
        for &gx in set {
            let info = &self.blocks[gx as usize];
            match masks.iter_mut().find(|(n, _)| *n == info.node) {
                Some((_, mask)) => *mask |= block_bit(info.block),
                None => masks.push((info.node, block_bit(info.block))),
            }
        }
        masks.sort_unstable_by_key(|(n, _)| *n);
        masks
    }

    /// Expands the seed set through trigger edges to a fixed point, then
    /// partitions the closed set into topological waves.
    ///
    /// `seed` holds the global indices popped from the event queue for the
    /// current time. The result is deterministic: waves are maximal
    /// antichains and every wave is ordered by (node, block).
    pub fn plan_tick(&mut self, seed: &[u32]) -> Result<TickPlan, ConfigError> {
        let mut fired: Vec<u32> = Vec::with_capacity(seed.len());
        for &gx in seed {
            if !self.in_set[gx as usize] {
                self.in_set[gx as usize] = true;
                fired.push(gx);
            }
        }

        // Trigger closure: outputs of a fired block fire any block they
        // reach through a triggering input, at the same time.
        let mut triggered = Vec::new();
        let mut cursor = 0;
        while cursor < fired.len() {
            let gx = fired[cursor];
            cursor += 1;
            for &dst in &self.triggers[gx as usize] {
                if !self.in_set[dst as usize] {
                    self.in_set[dst as usize] = true;
                    fired.push(dst);
                    triggered.push(dst);
                }
            }
        }
        fired.sort_unstable();
        triggered.sort_unstable();

        // Restrict dependency edges to the fired set and peel waves.
        for &gx in &fired {
            self.in_deg[gx as usize] = 0;
        }
        for &gx in &fired {
            for &dst in &self.dependents[gx as usize] {
                if self.in_set[dst as usize] {
                    self.in_deg[dst as usize] += 1;
                }
            }
        }

        let mut waves: Vec<Vec<u32>> = Vec::new();
        let mut frontier: Vec<u32> = fired
            .iter()
            .copied()
            .filter(|&gx| self.in_deg[gx as usize] == 0)
            .collect();
        let mut placed = 0usize;
        while !frontier.is_empty() {
            frontier.sort_unstable();
            placed += frontier.len();
            let mut next = Vec::new();
            for &gx in &frontier {
                for &dst in &self.dependents[gx as usize] {
                    if self.in_set[dst as usize] {
                        self.in_deg[dst as usize] -= 1;
                        if self.in_deg[dst as usize] == 0 {
                            next.push(dst);
                        }
                    }
                }
            }
            waves.push(std::mem::replace(&mut frontier, next));
        }

        // Reset the workspace before returning either way.
        for &gx in &fired {
            self.in_set[gx as usize] = false;
        }

        if placed != fired.len() {
            return Err(ConfigError::DependencyCycle(format!(
                "{} fired blocks unreachable in wave order",
                fired.len() - placed
            )));
        }

        Ok(TickPlan { fired, triggered, waves })
    }
}
