//! Error types for the execution state.

use thiserror::Error;

use crate::types::{AttemptId, AttemptStatus};

/// Result type alias for execution state operations.
pub type StateResult<T> = Result<T, StateError>;

/// Reports or requests that reference state that never existed.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StateError {
    #[error("vertex {0} has not been deployed")]
    UnknownVertex(String),

    #[error("vertex {vertex} has no subtask {subtask}")]
    UnknownSubtask { vertex: String, subtask: u32 },

    #[error("unknown attempt {0}")]
    UnknownAttempt(AttemptId),

    #[error("attempt {attempt} cannot move from {from:?} to {to:?}")]
    InvalidTransition {
        attempt: AttemptId,
        from: AttemptStatus,
        to: AttemptStatus,
    },

    #[error("vertex {0} must be deployed with parallelism of at least 1")]
    ZeroParallelism(String),
}
