//! Scheduler error types.

use std::time::Duration;

use thiserror::Error;

use ebb_core::VertexId;
use ebb_state::AttemptId;

/// Errors that can occur while scheduling a job.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("configuration error: {0}")]
    Configuration(#[from] ebb_core::ConfigError),

    #[error("insufficient resources: {available} of {required} required slots")]
    ResourceInsufficient { available: u32, required: u32 },

    #[error("slot request for {vertex}[{subtask}] timed out after {waited:?}")]
    SlotRequestTimeout {
        vertex: VertexId,
        subtask: u32,
        waited: Duration,
    },

    #[error("task failed: attempt {attempt} has no remaining sibling")]
    TaskFailed { attempt: AttemptId },

    #[error("unknown vertex: {0}")]
    UnknownVertex(VertexId),

    #[error("execution state error: {0}")]
    State(#[from] ebb_state::StateError),
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;
