//! ExecutionGraph — in-memory execution state of one job.
//!
//! Vertices are keyed by id in a `BTreeMap` so every walk over the graph
//! (detector ticks, pending placements) is deterministic.

use std::collections::{BTreeMap, HashMap};
use std::time::Instant;

use tracing::{debug, info};

use ebb_core::NodeId;

use crate::error::{StateError, StateResult};
use crate::types::*;

#[derive(Debug, Clone, Default)]
pub struct ExecutionGraph {
    vertices: BTreeMap<String, VertexExecution>,
}

impl ExecutionGraph {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Generations ────────────────────────────────────────────────

    /// Start a new generation of `vertex` with `parallelism` fresh task
    /// instances. Active attempts of the previous generation are canceled.
    pub fn start_generation(
        &mut self,
        vertex: &str,
        parallelism: u32,
        now: Instant,
    ) -> StateResult<GenerationStart> {
        if parallelism == 0 {
            return Err(StateError::ZeroParallelism(vertex.to_string()));
        }

        let mut canceled = Vec::new();
        let generation = match self.vertices.get_mut(vertex) {
            Some(previous) => {
                for task in &mut previous.tasks {
                    for attempt in task.attempts.iter_mut().filter(|a| a.status.is_active()) {
                        attempt.status = AttemptStatus::Canceled;
                        attempt.ended_at = Some(now);
                        canceled.push(attempt.id.clone());
                    }
                }
                previous.generation + 1
            }
            None => 1,
        };

        self.vertices.insert(
            vertex.to_string(),
            VertexExecution {
                vertex_id: vertex.to_string(),
                generation,
                parallelism,
                tasks: (0..parallelism).map(|i| TaskInstance::new(i, now)).collect(),
                started_at: now,
            },
        );
        info!(%vertex, generation, parallelism, canceled = canceled.len(), "vertex generation started");
        Ok(GenerationStart {
            generation,
            canceled,
        })
    }

    // ── Queries ────────────────────────────────────────────────────

    pub fn vertex(&self, vertex: &str) -> Option<&VertexExecution> {
        self.vertices.get(vertex)
    }

    pub fn vertices(&self) -> impl Iterator<Item = &VertexExecution> {
        self.vertices.values()
    }

    pub fn is_deployed(&self, vertex: &str) -> bool {
        self.vertices.get(vertex).is_some_and(VertexExecution::is_deployed)
    }

    pub fn is_finished(&self, vertex: &str) -> bool {
        self.vertices.get(vertex).is_some_and(VertexExecution::is_finished)
    }

    pub fn task(&self, vertex: &str, subtask: u32) -> StateResult<&TaskInstance> {
        let v = self
            .vertices
            .get(vertex)
            .ok_or_else(|| StateError::UnknownVertex(vertex.to_string()))?;
        v.tasks
            .get(subtask as usize)
            .ok_or_else(|| StateError::UnknownSubtask {
                vertex: vertex.to_string(),
                subtask,
            })
    }

    pub fn attempt(&self, id: &AttemptId) -> Option<&ExecutionAttempt> {
        let v = self.vertices.get(&id.vertex)?;
        if v.generation != id.generation {
            return None;
        }
        v.tasks
            .get(id.subtask as usize)?
            .attempts
            .get(id.number as usize)
    }

    /// Active attempts per node across all vertices.
    pub fn active_attempts_per_node(&self) -> HashMap<NodeId, u32> {
        count_per_node(self.vertices.values())
    }

    /// Active attempts of `vertex` per node. Slots are shared between
    /// vertices, so these are the attempts competing with a new attempt of
    /// the same vertex.
    pub fn vertex_attempts_per_node(&self, vertex: &str) -> HashMap<NodeId, u32> {
        count_per_node(self.vertices.get(vertex))
    }

    /// Tasks of `vertex` that need a slot, with the time they became schedulable.
    pub fn pending_tasks(&self, vertex: &str) -> Vec<(u32, Instant)> {
        self.vertices
            .get(vertex)
            .map(|v| {
                v.tasks
                    .iter()
                    .filter(|t| t.is_pending())
                    .map(|t| (t.subtask, t.created_at))
                    .collect()
            })
            .unwrap_or_default()
    }

    // ── Attempt lifecycle ──────────────────────────────────────────

    /// Create an attempt in CREATED state on `node_id`.
    pub fn add_attempt(
        &mut self,
        vertex: &str,
        subtask: u32,
        node_id: &str,
        speculative: bool,
        now: Instant,
    ) -> StateResult<AttemptId> {
        let v = self
            .vertices
            .get_mut(vertex)
            .ok_or_else(|| StateError::UnknownVertex(vertex.to_string()))?;
        let generation = v.generation;
        let task = v
            .tasks
            .get_mut(subtask as usize)
            .ok_or_else(|| StateError::UnknownSubtask {
                vertex: vertex.to_string(),
                subtask,
            })?;

        let id = AttemptId::new(vertex, subtask, generation, task.attempts.len() as u32);
        task.attempts.push(ExecutionAttempt {
            id: id.clone(),
            node_id: node_id.to_string(),
            status: AttemptStatus::Created,
            speculative,
            created_at: now,
            started_at: None,
            ended_at: None,
            input_bytes: None,
            output_bytes: None,
        });
        debug!(attempt = %id, node = %node_id, speculative, "attempt created");
        Ok(id)
    }

    /// Handed to the execution backend.
    pub fn mark_deploying(&mut self, id: &AttemptId) -> StateResult<()> {
        let attempt = self.attempt_mut(id)?;
        if attempt.status != AttemptStatus::Created {
            return Err(StateError::InvalidTransition {
                attempt: id.clone(),
                from: attempt.status,
                to: AttemptStatus::Deploying,
            });
        }
        attempt.status = AttemptStatus::Deploying;
        Ok(())
    }

    pub fn mark_running(&mut self, id: &AttemptId, now: Instant) -> StateResult<ReportOutcome> {
        if let Some(reason) = self.stray_reason(id)? {
            return Ok(ReportOutcome::Stray(reason));
        }
        let attempt = self.attempt_mut(id)?;
        if attempt.status != AttemptStatus::Running {
            attempt.status = AttemptStatus::Running;
            attempt.started_at = Some(now);
        }
        Ok(ReportOutcome::Applied)
    }

    /// Record the input bytes an attempt has processed so far.
    pub fn record_progress(&mut self, id: &AttemptId, input_bytes: u64) -> StateResult<ReportOutcome> {
        if let Some(reason) = self.stray_reason(id)? {
            return Ok(ReportOutcome::Stray(reason));
        }
        self.attempt_mut(id)?.input_bytes = Some(input_bytes);
        Ok(ReportOutcome::Applied)
    }

    /// First finisher wins the task; every other active attempt is canceled.
    pub fn finish_attempt(
        &mut self,
        id: &AttemptId,
        input_bytes: Option<u64>,
        output_bytes: Option<u64>,
        now: Instant,
    ) -> StateResult<FinishOutcome> {
        if let Some(reason) = self.stray_reason(id)? {
            return Ok(FinishOutcome::Stray(reason));
        }

        let v = self
            .vertices
            .get_mut(&id.vertex)
            .ok_or_else(|| StateError::UnknownVertex(id.vertex.clone()))?;
        let task = v
            .tasks
            .get_mut(id.subtask as usize)
            .ok_or_else(|| StateError::UnknownAttempt(id.clone()))?;

        let mut canceled = Vec::new();
        for attempt in &mut task.attempts {
            if attempt.id == *id {
                attempt.status = AttemptStatus::Finished;
                attempt.ended_at = Some(now);
                if attempt.started_at.is_none() {
                    attempt.started_at = Some(attempt.created_at);
                }
                if input_bytes.is_some() {
                    attempt.input_bytes = input_bytes;
                }
                attempt.output_bytes = output_bytes;
            } else if attempt.status.is_active() {
                attempt.status = AttemptStatus::Canceled;
                attempt.ended_at = Some(now);
                canceled.push(attempt.id.clone());
            }
        }
        task.winner = Some(id.number);

        let vertex_finished = v.is_finished();
        debug!(attempt = %id, canceled = canceled.len(), vertex_finished, "attempt won its task");
        Ok(FinishOutcome::Won {
            canceled,
            vertex_finished,
        })
    }

    pub fn fail_attempt(&mut self, id: &AttemptId, now: Instant) -> StateResult<FailOutcome> {
        if let Some(reason) = self.stray_reason(id)? {
            return Ok(FailOutcome::Stray(reason));
        }
        let attempt = self.attempt_mut(id)?;
        attempt.status = AttemptStatus::Failed;
        attempt.ended_at = Some(now);

        let task = self.task(&id.vertex, id.subtask)?;
        if task.active_count() == 0 {
            Ok(FailOutcome::TaskLost)
        } else {
            Ok(FailOutcome::SiblingsRemain)
        }
    }

    /// Cancel a single active attempt. Returns false if it was not active.
    pub fn cancel_attempt(&mut self, id: &AttemptId, now: Instant) -> StateResult<bool> {
        if self.stray_reason(id)?.is_some() {
            return Ok(false);
        }
        let attempt = self.attempt_mut(id)?;
        attempt.status = AttemptStatus::Canceled;
        attempt.ended_at = Some(now);
        Ok(true)
    }

    // ── Internals ──────────────────────────────────────────────────

    fn attempt_mut(&mut self, id: &AttemptId) -> StateResult<&mut ExecutionAttempt> {
        self.vertices
            .get_mut(&id.vertex)
            .filter(|v| v.generation == id.generation)
            .and_then(|v| v.tasks.get_mut(id.subtask as usize))
            .and_then(|t| t.attempts.get_mut(id.number as usize))
            .ok_or_else(|| StateError::UnknownAttempt(id.clone()))
    }

    /// Classify a report about `id`. `None` means it should be applied.
    fn stray_reason(&self, id: &AttemptId) -> StateResult<Option<StrayReason>> {
        let v = self
            .vertices
            .get(&id.vertex)
            .ok_or_else(|| StateError::UnknownVertex(id.vertex.clone()))?;
        if id.generation < v.generation {
            return Ok(Some(StrayReason::SupersededGeneration {
                current: v.generation,
            }));
        }
        let attempt = self
            .attempt(id)
            .ok_or_else(|| StateError::UnknownAttempt(id.clone()))?;
        let task_won = self.task(&id.vertex, id.subtask)?.is_finished();
        let reason = match attempt.status {
            AttemptStatus::Canceled => Some(StrayReason::Canceled),
            AttemptStatus::Finished | AttemptStatus::Failed => Some(StrayReason::AlreadyTerminated),
            _ if task_won => Some(StrayReason::AlreadyWon),
            _ => None,
        };
        Ok(reason)
    }
}

fn count_per_node<'a>(vertices: impl IntoIterator<Item = &'a VertexExecution>) -> HashMap<NodeId, u32> {
    let mut counts = HashMap::new();
    for attempt in vertices
        .into_iter()
        .flat_map(|v| v.tasks.iter())
        .flat_map(TaskInstance::active_attempts)
    {
        *counts.entry(attempt.node_id.clone()).or_insert(0) += 1;
    }
    counts
}
