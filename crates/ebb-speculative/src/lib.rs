//! ebb-speculative — reacting to stragglers.
//!
//! The detector derives a per-vertex execution-time baseline on every tick
//! and flags running attempts that exceed it. The manager turns flags into
//! slow-node blocks and duplicate (speculative) attempts, bounded by
//! `max-concurrent-executions`.

pub mod detector;
pub mod manager;

pub use detector::{Baseline, SlowAttempt, StragglerDetector, weighted_median};
pub use manager::{SpeculativeExecutionManager, SpeculativeLaunch, TaskKey};
