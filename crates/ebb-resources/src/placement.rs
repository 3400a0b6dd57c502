//! Slot placement for new and speculative attempts.
//!
//! Slots are shared between vertices: a slot holds at most one active
//! attempt of each vertex, so a node has a free slot for a vertex while
//! that vertex has fewer active attempts there than the node has slots.
//! This matches how the Rescaling Controller sizes a job, by its largest
//! vertex parallelism.
//!
//! Candidates are the nodes of the Resource View with a free slot for the
//! vertex that are not in the Slow Node Registry. Among them, nodes not
//! already hosting an attempt of the same task instance are preferred; the
//! load-balance mode breaks the remaining ties.

use std::collections::HashMap;
use std::time::Instant;

use ebb_core::{LoadBalanceMode, NodeId};

use crate::blocklist::SlowNodeRegistry;
use crate::view::ResourceView;

/// Occupancy of one node at placement time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeLoad {
    pub node_id: NodeId,
    pub slots: u32,
    /// Active attempts of every vertex.
    pub active_attempts: u32,
    /// Active attempts of the vertex being placed.
    pub vertex_attempts: u32,
    pub blocked: bool,
}

impl NodeLoad {
    /// Slots still free for the vertex being placed.
    pub fn free_slots(&self) -> u32 {
        self.slots.saturating_sub(self.vertex_attempts)
    }
}

/// What a single attempt needs from placement.
#[derive(Debug, Clone, Copy)]
pub struct PlacementRequest<'a> {
    pub mode: LoadBalanceMode,
    /// Nodes already hosting an attempt of the same task instance.
    pub avoid: &'a [NodeId],
}

/// Per-node load in view order. `active` counts attempts of all vertices,
/// `vertex_active` those of the vertex being placed.
pub fn node_loads(
    view: &ResourceView,
    active: &HashMap<NodeId, u32>,
    vertex_active: &HashMap<NodeId, u32>,
    registry: &SlowNodeRegistry,
    now: Instant,
) -> Vec<NodeLoad> {
    view.slots_per_node()
        .into_iter()
        .map(|(node, slots)| NodeLoad {
            node_id: node.to_string(),
            slots,
            active_attempts: active.get(node).copied().unwrap_or(0),
            vertex_attempts: vertex_active.get(node).copied().unwrap_or(0),
            blocked: registry.is_blocked(node, now),
        })
        .collect()
}

/// Eligible nodes, best first.
pub fn rank_nodes<'a>(loads: &'a [NodeLoad], req: &PlacementRequest<'_>) -> Vec<&'a NodeLoad> {
    let mut ranked: Vec<(usize, &NodeLoad)> = loads
        .iter()
        .enumerate()
        .filter(|(_, load)| !load.blocked && load.free_slots() > 0)
        .collect();

    ranked.sort_by_key(|(position, load)| {
        let hosts_sibling = req.avoid.contains(&load.node_id);
        let balance = match req.mode {
            LoadBalanceMode::None => 0,
            LoadBalanceMode::Tasks => load.active_attempts,
        };
        (hosts_sibling, balance, *position)
    });
    ranked.into_iter().map(|(_, load)| load).collect()
}

/// Pick the node for one attempt, or `None` if no node is eligible.
pub fn select_node(loads: &[NodeLoad], req: &PlacementRequest<'_>) -> Option<NodeId> {
    rank_nodes(loads, req)
        .first()
        .map(|load| load.node_id.clone())
}
