//! Per-tick workspace: the fired set, its wave partition, and the ack and
//! event bookkeeping that lives exactly as long as one tick.

use std::collections::HashSet;

use crate::codec::{EventRequest, MessageKind};
use crate::graph::{TickPlan, UpdateGraph};
use crate::registry::NodeRegistry;
use crate::types::{NodeId, SimTime, UpdateMask};

/// State owned by the coordinator while one tick's barrier runs.
#[derive(Debug)]
pub struct TickWorkspace {
    /// The tick's virtual time.
    pub t: SimTime,
    /// Closed fired set and wave partition.
    pub plan: TickPlan,
    /// Acks already completed this tick, so stale retransmissions from an
    /// earlier phase or wave are recognized as duplicates rather than
    /// violations.
    seen_acks: HashSet<(NodeId, MessageKind, UpdateMask)>,
    /// Irregular firing requests gathered while the tick ran.
    pub requests: Vec<(NodeId, EventRequest)>,
}

impl TickWorkspace {
    pub fn new(t: SimTime, plan: TickPlan) -> Self {
        Self {
            t,
            plan,
            seen_acks: HashSet::new(),
            requests: Vec::new(),
        }
    }

    pub fn fired_count(&self) -> usize {
        self.plan.fired.len()
    }

    pub fn wave_count(&self) -> usize {
        self.plan.waves.len()
    }

    /// Per-node masks for one UPDATE_Y wave.
    pub fn wave_masks(&self, graph: &UpdateGraph, wave: usize) -> Vec<(NodeId, UpdateMask)> {
        graph.masks_by_node(&self.plan.waves[wave])
    }

    /// Per-node full fired masks for the UPDATE_X broadcast: every node
    /// that fired at least one block and participates in state updates.
    pub fn x_targets(
        &self,
        graph: &UpdateGraph,
        registry: &NodeRegistry,
    ) -> Vec<(NodeId, UpdateMask)> {
        self.plan
            .fired_masks(graph)
            .into_iter()
            .filter(|(node, _)| {
                registry
                    .get(*node)
                    .map_or(false, |entry| entry.decl.needs_state_update)
            })
            .collect()
    }

    /// Records a completed ack for duplicate detection.
    pub fn note_ack(&mut self, node: NodeId, of: MessageKind, mask: UpdateMask) {
        self.seen_acks.insert((node, of, mask));
    }

    /// True when an out-of-phase ack exactly repeats one already completed
    /// this tick.
    pub fn is_stale_duplicate(&self, node: NodeId, of: MessageKind, mask: UpdateMask) -> bool {
        self.seen_acks.contains(&(node, of, mask))
    }

    /// Buffers an irregular firing request for the reschedule step.
    pub fn push_request(&mut self, node: NodeId, request: EventRequest) {
        self.requests.push((node, request));
    }
}

impl TickPlan {
    /// Per-node masks over the whole fired set.
    pub fn fired_masks(&self, graph: &UpdateGraph) -> Vec<(NodeId, UpdateMask)> {
        graph.masks_by_node(&self.fired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BlockDecl, NodeDecl, SystemConfigBuilder};

    fn fixtures() -> (UpdateGraph, NodeRegistry, TickWorkspace) {
        let config = SystemConfigBuilder::new(1000)
            .node(
                NodeDecl::new("a")
                    .with_output("y")
                    .with_block(BlockDecl::periodic(100).with_output("y")),
            )
            .node(
                NodeDecl::new("b")
                    .with_input("u")
                    .with_block(BlockDecl::periodic(100).with_feedthrough("u")),
            )
            .node(
                NodeDecl::new("probe")
                    .with_block(BlockDecl::periodic(100))
                    .without_state_update(),
            )
            .connect("a", "y", "b", "u")
            .build()
            .unwrap();
        let registry = NodeRegistry::from_config(&config);
        let mut graph = UpdateGraph::new(&config).unwrap();
        let plan = graph.plan_tick(&[0, 1, 2]).unwrap();
        let ws = TickWorkspace::new(100, plan);
        (graph, registry, ws)
    }

    #[test]
    fn test_wave_masks() {
        let (graph, _registry, ws) = fixtures();
        assert_eq!(ws.wave_count(), 2);
        assert_eq!(ws.wave_masks(&graph, 0), vec![(0, 0b1), (2, 0b1)]);
        assert_eq!(ws.wave_masks(&graph, 1), vec![(1, 0b1)]);
    }

    #[test]
    fn test_x_targets_skip_stateless_nodes() {
        let (graph, registry, ws) = fixtures();
        assert_eq!(ws.x_targets(&graph, &registry), vec![(0, 0b1), (1, 0b1)]);
    }

    #[test]
    fn test_duplicate_tracking() {
        let (_graph, _registry, mut ws) = fixtures();
        ws.note_ack(0, MessageKind::UpdateY, 0b1);
        assert!(ws.is_stale_duplicate(0, MessageKind::UpdateY, 0b1));
        assert!(!ws.is_stale_duplicate(0, MessageKind::UpdateY, 0b11));
        assert!(!ws.is_stale_duplicate(0, MessageKind::UpdateX, 0b1));
        assert!(!ws.is_stale_duplicate(1, MessageKind::UpdateY, 0b1));
    }

    #[test]
    fn test_request_buffering() {
        let (_graph, _registry, mut ws) = fixtures();
        ws.push_request(1, EventRequest { fire_time: 500, mask: 0b1 });
        assert_eq!(ws.requests.len(), 1);
        assert_eq!(ws.requests[0].0, 1);
    }
}
