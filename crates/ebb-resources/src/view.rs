//! Resource View — a read-only snapshot of the slots currently registered
//! by the external resource manager.

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::debug;

use ebb_core::NodeId;

/// One task slot offered by a worker node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlotInfo {
    pub node_id: NodeId,
    pub cpu_cores: f64,
    pub memory_bytes: u64,
}

/// Slots available to one job, in the order the resource manager reported them.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ResourceView {
    slots: Vec<SlotInfo>,
}

impl ResourceView {
    pub fn new(slots: Vec<SlotInfo>) -> Self {
        Self { slots }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    /// Append `count` identical slots on `node_id`.
    pub fn with_node(mut self, node_id: &str, count: u32, cpu_cores: f64, memory_bytes: u64) -> Self {
        for _ in 0..count {
            self.slots.push(SlotInfo {
                node_id: node_id.to_string(),
                cpu_cores,
                memory_bytes,
            });
        }
        self
    }

    /// The same view without any slot of `node_id`.
    pub fn without_node(&self, node_id: &str) -> Self {
        Self {
            slots: self
                .slots
                .iter()
                .filter(|s| s.node_id != node_id)
                .cloned()
                .collect(),
        }
    }

    pub fn slots(&self) -> &[SlotInfo] {
        &self.slots
    }

    pub fn slot_count(&self) -> u32 {
        u32::try_from(self.slots.len()).unwrap_or(u32::MAX)
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Distinct nodes in first-seen order.
    pub fn nodes(&self) -> Vec<&str> {
        let mut nodes: Vec<&str> = Vec::new();
        for slot in &self.slots {
            if !nodes.contains(&slot.node_id.as_str()) {
                nodes.push(slot.node_id.as_str());
            }
        }
        nodes
    }

    /// Slot count per node, in first-seen order.
    pub fn slots_per_node(&self) -> Vec<(&str, u32)> {
        self.nodes()
            .into_iter()
            .map(|node| (node, self.slots_on(node)))
            .collect()
    }

    pub fn slots_on(&self, node_id: &str) -> u32 {
        let count = self.slots.iter().filter(|s| s.node_id == node_id).count();
        u32::try_from(count).unwrap_or(u32::MAX)
    }

    pub fn total_cpu_cores(&self) -> f64 {
        self.slots.iter().map(|s| s.cpu_cores).sum()
    }

    pub fn total_memory_bytes(&self) -> u64 {
        self.slots.iter().map(|s| s.memory_bytes).sum()
    }

    /// Keep only the first `max` slots (`slotmanager.number-of-slots.max`).
    pub fn capped(&self, max: Option<u32>) -> Self {
        match max {
            Some(max) if (max as usize) < self.slots.len() => Self {
                slots: self.slots[..max as usize].to_vec(),
            },
            _ => self.clone(),
        }
    }
}

/// A local cluster of identical task managers.
///
/// Omitted fields keep their defaults: one task manager with one slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MiniCluster {
    pub task_managers: u32,
    pub slots_per_task_manager: u32,
    pub cpu_per_slot: f64,
    pub memory_per_slot: u64,
}

impl Default for MiniCluster {
    fn default() -> Self {
        Self {
            task_managers: 1,
            slots_per_task_manager: 1,
            cpu_per_slot: 1.0,
            memory_per_slot: 1 << 30,
        }
    }
}

impl MiniCluster {
    pub fn new(task_managers: u32, slots_per_task_manager: u32) -> Self {
        Self {
            task_managers,
            slots_per_task_manager,
            ..Self::default()
        }
    }

    /// Node id of the `index`-th task manager.
    pub fn node_id(index: u32) -> NodeId {
        format!("tm-{index}")
    }

    pub fn view(&self) -> ResourceView {
        (0..self.task_managers).fold(ResourceView::empty(), |view, i| {
            view.with_node(
                &Self::node_id(i),
                self.slots_per_task_manager,
                self.cpu_per_slot,
                self.memory_per_slot,
            )
        })
    }
}

/// Publishes Resource View changes to subscribers.
#[derive(Debug)]
pub struct ResourceProvider {
    tx: watch::Sender<ResourceView>,
}

impl ResourceProvider {
    pub fn new(initial: ResourceView) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx }
    }

    /// Current view.
    pub fn snapshot(&self) -> ResourceView {
        self.tx.borrow().clone()
    }

    /// Change notifications; the receiver starts at the current view.
    pub fn subscribe(&self) -> watch::Receiver<ResourceView> {
        self.tx.subscribe()
    }

    /// Replace the view. Returns false (and notifies nobody) when unchanged.
    pub fn publish(&self, view: ResourceView) -> bool {
        let slots = view.slot_count();
        let changed = self.tx.send_if_modified(|current| {
            if *current == view {
                false
            } else {
                *current = view;
                true
            }
        });
        if changed {
            debug!(slots, "resource view published");
        }
        changed
    }
}
