//! ebb-rescale — when, and to what parallelism, a running job is rescaled.
//!
//! The controller only decides; restarting with the new parallelism is the
//! caller's job and is acknowledged through
//! [`RescalingController::restarted`].

pub mod controller;
pub mod decision;

pub use controller::{RescalePhase, RescalingController};
pub use decision::{
    ParallelismPlan, RescaleAction, ScaleReason, ScaleRequest, ScalingDecisionRecord,
    VertexRequirement,
};
