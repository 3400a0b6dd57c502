//! Slow Node Registry — nodes temporarily excluded from new attempts.
//!
//! One entry per node holding only the latest expiry, so repeated blocks
//! refresh instead of stacking. Entries are inert once `now` passes their
//! expiry and are dropped by [`SlowNodeRegistry::purge_expired`].

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tracing::{debug, info};

use ebb_core::NodeId;

#[derive(Debug, Clone, Default)]
pub struct SlowNodeRegistry {
    blocked_until: HashMap<NodeId, Instant>,
}

impl SlowNodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block `node_id` until `now + duration`, replacing any earlier expiry.
    pub fn block(&mut self, node_id: &str, now: Instant, duration: Duration) {
        let until = now + duration;
        let previous = self.blocked_until.insert(node_id.to_string(), until);
        info!(
            node = %node_id,
            block_secs = duration.as_secs_f64(),
            refreshed = previous.is_some(),
            "slow node blocked"
        );
    }

    /// A node is blocked while `now` has not passed its expiry.
    pub fn is_blocked(&self, node_id: &str, now: Instant) -> bool {
        self.blocked_until
            .get(node_id)
            .is_some_and(|until| now <= *until)
    }

    pub fn blocked_until(&self, node_id: &str) -> Option<Instant> {
        self.blocked_until.get(node_id).copied()
    }

    /// Currently blocked nodes, sorted by id.
    pub fn blocked_nodes(&self, now: Instant) -> Vec<NodeId> {
        let mut nodes: Vec<NodeId> = self
            .blocked_until
            .iter()
            .filter(|(_, until)| now <= **until)
            .map(|(node, _)| node.clone())
            .collect();
        nodes.sort();
        nodes
    }

    /// Drop expired entries. Returns how many were removed.
    pub fn purge_expired(&mut self, now: Instant) -> usize {
        let before = self.blocked_until.len();
        self.blocked_until.retain(|node, until| {
            let keep = now <= *until;
            if !keep {
                debug!(node = %node, "slow node block expired");
            }
            keep
        });
        before - self.blocked_until.len()
    }

    pub fn len(&self) -> usize {
        self.blocked_until.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocked_until.is_empty()
    }
}
