//! Task instances, execution attempts and report outcomes.

use std::fmt;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use ebb_core::{NodeId, VertexId};

// ── Attempt ───────────────────────────────────────────────────────

/// Identity of one execution attempt.
///
/// `number` is the attempt's index within its task instance for the given
/// generation, so ids never repeat across rescales.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AttemptId {
    pub vertex: VertexId,
    pub subtask: u32,
    pub generation: u32,
    pub number: u32,
}

impl AttemptId {
    pub fn new(vertex: &str, subtask: u32, generation: u32, number: u32) -> Self {
        Self {
            vertex: vertex.to_string(),
            subtask,
            generation,
            number,
        }
    }
}

impl fmt::Display for AttemptId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}[{}]@g{}#{}",
            self.vertex, self.subtask, self.generation, self.number
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AttemptStatus {
    Created,
    Deploying,
    Running,
    Finished,
    Failed,
    Canceled,
}

impl AttemptStatus {
    /// Holds (or is about to hold) a slot.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Created | Self::Deploying | Self::Running)
    }

    pub fn is_terminal(self) -> bool {
        !self.is_active()
    }
}

/// One execution of a task instance on a node.
#[derive(Debug, Clone)]
pub struct ExecutionAttempt {
    pub id: AttemptId,
    pub node_id: NodeId,
    pub status: AttemptStatus,
    pub speculative: bool,
    pub created_at: Instant,
    /// Set when the attempt reports RUNNING.
    pub started_at: Option<Instant>,
    pub ended_at: Option<Instant>,
    pub input_bytes: Option<u64>,
    pub output_bytes: Option<u64>,
}

impl ExecutionAttempt {
    /// Time spent running so far; `None` unless RUNNING.
    pub fn elapsed(&self, now: Instant) -> Option<Duration> {
        match (self.status, self.started_at) {
            (AttemptStatus::Running, Some(start)) => Some(now.saturating_duration_since(start)),
            _ => None,
        }
    }

    /// Execution time of a terminated attempt.
    pub fn duration(&self) -> Option<Duration> {
        let end = self.ended_at?;
        let start = self.started_at.unwrap_or(self.created_at);
        Some(end.saturating_duration_since(start))
    }
}

// ── Task instance ─────────────────────────────────────────────────

/// One parallel subtask of a vertex generation.
#[derive(Debug, Clone)]
pub struct TaskInstance {
    pub subtask: u32,
    pub attempts: Vec<ExecutionAttempt>,
    /// Attempt number of the first attempt to finish.
    pub winner: Option<u32>,
    /// When the task became schedulable; bounds the slot request wait.
    pub created_at: Instant,
}

impl TaskInstance {
    pub fn new(subtask: u32, now: Instant) -> Self {
        Self {
            subtask,
            attempts: Vec::new(),
            winner: None,
            created_at: now,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.winner.is_some()
    }

    pub fn winning_attempt(&self) -> Option<&ExecutionAttempt> {
        self.winner.and_then(|n| self.attempts.get(n as usize))
    }

    pub fn active_attempts(&self) -> impl Iterator<Item = &ExecutionAttempt> {
        self.attempts.iter().filter(|a| a.status.is_active())
    }

    pub fn active_count(&self) -> u32 {
        self.active_attempts().count() as u32
    }

    /// Nodes currently hosting an active attempt of this task.
    pub fn active_nodes(&self) -> Vec<NodeId> {
        self.active_attempts().map(|a| a.node_id.clone()).collect()
    }

    /// Neither won nor running anywhere, so it needs a slot.
    pub fn is_pending(&self) -> bool {
        self.winner.is_none() && self.active_count() == 0
    }
}

// ── Vertex generation ─────────────────────────────────────────────

/// The current generation of one vertex's execution.
#[derive(Debug, Clone)]
pub struct VertexExecution {
    pub vertex_id: VertexId,
    pub generation: u32,
    pub parallelism: u32,
    pub tasks: Vec<TaskInstance>,
    pub started_at: Instant,
}

impl VertexExecution {
    /// Every task instance has a placed attempt or a winner.
    pub fn is_deployed(&self) -> bool {
        self.tasks
            .iter()
            .all(|t| t.is_finished() || t.active_count() > 0)
    }

    pub fn is_finished(&self) -> bool {
        self.tasks.iter().all(TaskInstance::is_finished)
    }

    pub fn finished_count(&self) -> u32 {
        self.tasks.iter().filter(|t| t.is_finished()).count() as u32
    }

    pub fn running_attempts(&self) -> impl Iterator<Item = &ExecutionAttempt> {
        self.tasks
            .iter()
            .flat_map(|t| t.attempts.iter())
            .filter(|a| a.status == AttemptStatus::Running)
    }

    /// Winning attempts in finishing order (end time, then subtask).
    pub fn winners_by_end_time(&self) -> Vec<&ExecutionAttempt> {
        let mut winners: Vec<&ExecutionAttempt> = self
            .tasks
            .iter()
            .filter_map(TaskInstance::winning_attempt)
            .collect();
        winners.sort_by_key(|a| (a.ended_at, a.id.subtask));
        winners
    }

    /// Output bytes produced by finished tasks: `(finished tasks, bytes)`.
    pub fn finished_output(&self) -> (u32, u64) {
        self.tasks
            .iter()
            .filter_map(TaskInstance::winning_attempt)
            .fold((0, 0), |(count, bytes), a| {
                (count + 1, bytes + a.output_bytes.unwrap_or(0))
            })
    }

    /// Total output once every task finished.
    pub fn total_output(&self) -> Option<u64> {
        if self.is_finished() {
            Some(self.finished_output().1)
        } else {
            None
        }
    }
}

// ── Report outcomes ───────────────────────────────────────────────

/// Why a report was discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrayReason {
    /// The attempt belongs to an earlier generation of its vertex.
    SupersededGeneration { current: u32 },
    /// The attempt was canceled before it reported.
    Canceled,
    /// Another attempt of the task already finished.
    AlreadyWon,
    /// The attempt had already terminated.
    AlreadyTerminated,
}

impl fmt::Display for StrayReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SupersededGeneration { current } => {
                write!(f, "superseded by generation {current}")
            }
            Self::Canceled => f.write_str("attempt was canceled"),
            Self::AlreadyWon => f.write_str("task already finished"),
            Self::AlreadyTerminated => f.write_str("attempt already terminated"),
        }
    }
}

/// Result of a RUNNING or progress report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReportOutcome {
    Applied,
    Stray(StrayReason),
}

/// Result of a FINISHED report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinishOutcome {
    /// First finisher of its task; the other active attempts were canceled.
    Won {
        canceled: Vec<AttemptId>,
        vertex_finished: bool,
    },
    Stray(StrayReason),
}

/// Result of a FAILED report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailOutcome {
    /// Other attempts of the task are still active.
    SiblingsRemain,
    /// The task has no active attempt and no winner left.
    TaskLost,
    Stray(StrayReason),
}

/// A new generation replacing the previous one of the same vertex.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationStart {
    pub generation: u32,
    /// Active attempts of the superseded generation, now canceled.
    pub canceled: Vec<AttemptId>,
}
