//! Inputs of the control loop.

use ebb_resources::ResourceView;
use ebb_rescale::ScaleRequest;
use ebb_state::AttemptId;

/// A FINISHED report from the execution backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinishedReport {
    pub attempt: AttemptId,
    pub input_bytes: Option<u64>,
    pub output_bytes: Option<u64>,
}

/// Everything the control loop reacts to besides its own timers.
#[derive(Debug, Clone)]
pub enum SchedulerEvent {
    AttemptRunning(AttemptId),
    AttemptProgress { attempt: AttemptId, input_bytes: u64 },
    AttemptFinished(FinishedReport),
    AttemptFailed(AttemptId),
    ResourcesChanged(ResourceView),
    /// The external restart for a scale request is done.
    ApplyScale(ScaleRequest),
}

impl SchedulerEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::AttemptRunning(_) => "attempt_running",
            Self::AttemptProgress { .. } => "attempt_progress",
            Self::AttemptFinished(_) => "attempt_finished",
            Self::AttemptFailed(_) => "attempt_failed",
            Self::ResourcesChanged(_) => "resources_changed",
            Self::ApplyScale(_) => "apply_scale",
        }
    }
}
