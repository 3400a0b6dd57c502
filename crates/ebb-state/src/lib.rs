//! ebb-state — execution state of one job.
//!
//! Tracks, per vertex, the current scheduling generation, its task instances
//! and every execution attempt launched for them. Parallelism is versioned:
//! a rescale starts a new generation and attempts created under an older one
//! are recognised from their id and discarded when they report.
//!
//! The store is owned by a single job scheduler and is not shared; all
//! mutation happens on the job's control thread.

pub mod error;
pub mod store;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::ExecutionGraph;
pub use types::*;
