//! ebb-resources — what the scheduler may place attempts on.
//!
//! # Components
//!
//! - **`view`** — Resource View snapshots, the mini-cluster description and
//!   the watch-based provider the control loop subscribes to
//! - **`blocklist`** — Slow Node Registry (expiring node blocks)
//! - **`placement`** — Slot selection honouring blocks, siblings and the
//!   load-balance mode

pub mod blocklist;
pub mod placement;
pub mod view;

pub use blocklist::SlowNodeRegistry;
pub use placement::{NodeLoad, PlacementRequest, node_loads, rank_nodes, select_node};
pub use view::{MiniCluster, ResourceProvider, ResourceView, SlotInfo};
