//! ebb-scheduler — adaptive scheduling for one job.
//!
//! # Components
//!
//! - **`scheduler`** — [`AdaptiveScheduler`], the synchronous facade that
//!   owns a job's execution state and the decision components
//! - **`control`** — [`ControlLoop`], the tokio task feeding reports, ticks
//!   and Resource Views into the scheduler
//! - **`backend`** — the seam to whatever actually runs attempts
//! - **`event`** — control loop inputs

pub mod backend;
pub mod control;
pub mod error;
pub mod event;
pub mod scheduler;

pub use backend::{ExecutionBackend, NoopBackend};
pub use control::{BoxFuture, ControlLoop, DEFAULT_POLL_INTERVAL, ScaleCallback};
pub use error::{SchedulerError, SchedulerResult};
pub use event::{FinishedReport, SchedulerEvent};
pub use scheduler::{AdaptiveScheduler, JobStatus, JobSummary, VertexSummary};
