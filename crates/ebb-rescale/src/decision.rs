//! Scale requests and the bookkeeping around them.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Instant;

use serde::Serialize;

use ebb_core::VertexId;
use ebb_resources::ResourceView;

/// Parallelism per vertex.
pub type ParallelismPlan = BTreeMap<VertexId, u32>;

/// What a tracked vertex needs from the Resource View.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct VertexRequirement {
    pub min: u32,
    /// Parallelism the vertex would get with unlimited slots.
    pub desired: u32,
    /// Fixed-parallelism vertices take slots but are never rescaled.
    pub elastic: bool,
}

impl VertexRequirement {
    pub fn fixed(parallelism: u32) -> Self {
        Self {
            min: parallelism,
            desired: parallelism,
            elastic: false,
        }
    }

    pub fn elastic(min: u32, desired: u32) -> Self {
        Self {
            min,
            desired: desired.max(min),
            elastic: true,
        }
    }

    /// Parallelism reachable with `slots` slots, never below the minimum.
    pub fn achievable(&self, slots: u32) -> u32 {
        if self.elastic {
            self.desired.min(slots).max(self.min)
        } else {
            self.desired
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScaleReason {
    /// Some vertex can grow by at least `min-parallelism-increase`.
    Increase,
    /// Slots were lost and some vertex must shrink.
    Decrease,
    /// `scaling-interval.max` elapsed with changed resources.
    Forced,
}

impl fmt::Display for ScaleReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Increase => "increase",
            Self::Decrease => "decrease",
            Self::Forced => "forced",
        })
    }
}

/// Restart the job with new parallelism for the listed vertices.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScaleRequest {
    /// Only the vertices whose parallelism changes.
    pub plan: ParallelismPlan,
    pub reason: ScaleReason,
    pub issued_at: Instant,
}

/// The most recent scaling decision; older ones are not kept.
#[derive(Debug, Clone, PartialEq)]
pub struct ScalingDecisionRecord {
    pub plan: ParallelismPlan,
    pub decided_at: Instant,
    pub view: ResourceView,
}

/// Outcome of one controller evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RescaleAction {
    Idle,
    /// Leave WaitingResources and run with `plan`.
    Start { plan: ParallelismPlan, reduced: bool },
    Scale(ScaleRequest),
    /// The wait timeout elapsed below the minimum required slots.
    Insufficient { available: u32, required: u32 },
}
