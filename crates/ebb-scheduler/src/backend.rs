//! Execution backend seam.
//!
//! Attempts run remotely. The scheduler only tells the backend where to
//! start an attempt and which attempts to stop; everything the attempt does
//! afterwards comes back as [`SchedulerEvent`](crate::SchedulerEvent)s.

use ebb_core::NodeId;
use ebb_state::AttemptId;

pub trait ExecutionBackend: Send {
    /// Start `attempt` on `node`. An error fails the attempt and the task
    /// is placed again on a later pass.
    fn deploy(&mut self, attempt: &AttemptId, node: &NodeId) -> anyhow::Result<()>;

    /// Stop `attempt`. Cancellation is cooperative; the attempt may still
    /// report afterwards and the report will be discarded.
    fn cancel(&mut self, attempt: &AttemptId) -> anyhow::Result<()>;
}

/// Accepts everything and runs nothing. Used for planning dry runs.
#[derive(Debug, Default)]
pub struct NoopBackend;

impl ExecutionBackend for NoopBackend {
    fn deploy(&mut self, _attempt: &AttemptId, _node: &NodeId) -> anyhow::Result<()> {
        Ok(())
    }

    fn cancel(&mut self, _attempt: &AttemptId) -> anyhow::Result<()> {
        Ok(())
    }
}
