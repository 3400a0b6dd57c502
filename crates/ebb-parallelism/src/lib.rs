//! ebb-parallelism — decides how many task instances a vertex gets.
//!
//! Decisions are pure functions of the vertex, its input statistics and the
//! configuration, so the same inputs always yield the same parallelism.
//!
//! # Components
//!
//! - **`stats`** — upstream statistics as seen by a consumer vertex
//! - **`hybrid`** — estimation policies for partially finished hybrid inputs
//! - **`decider`** — the inference engine itself

pub mod decider;
pub mod hybrid;
pub mod stats;

pub use decider::{DecisionReason, ParallelismDecider, ParallelismDecision, VertexBounds};
pub use hybrid::{Extrapolate, HybridEstimate, HybridStatisticsPolicy, ProducerParallelism, policy_for};
pub use stats::InputStatistics;
