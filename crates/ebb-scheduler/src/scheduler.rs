//! AdaptiveScheduler — the per-job scheduling facade.
//!
//! The scheduler owns one job's execution graph together with the decision
//! components and applies their outputs:
//! - Infers parallelism for each vertex once its inputs are ready
//! - Places regular attempts on free slots, away from blocked nodes; a slot
//!   holds at most one attempt of each vertex
//! - Runs straggler detection and launches speculative attempts on ticks
//! - Feeds Resource Views to the rescaling controller and applies restarts
//! - Resolves attempt reports into winners, cancellations and job status
//!
//! All methods take `now` explicitly and are meant to be called from a
//! single control thread (see [`ControlLoop`](crate::ControlLoop)).

use std::collections::{BTreeMap, HashMap};
use std::time::Instant;

use serde::Serialize;
use tracing::{debug, error, info, warn};

use ebb_core::{ConfigError, ExchangeMode, JobGraph, JobVertex, NodeId, SchedulerConfig, VertexId};
use ebb_parallelism::{InputStatistics, ParallelismDecider};
use ebb_resources::{PlacementRequest, ResourceView, SlowNodeRegistry, node_loads, select_node};
use ebb_rescale::{RescaleAction, RescalePhase, RescalingController, ScaleRequest, VertexRequirement};
use ebb_speculative::{SpeculativeExecutionManager, StragglerDetector};
use ebb_state::{AttemptId, ExecutionGraph, FailOutcome, FinishOutcome, ReportOutcome};

use crate::backend::ExecutionBackend;
use crate::error::{SchedulerError, SchedulerResult};
use crate::event::FinishedReport;

/// Coarse lifecycle of a job as seen by its scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    WaitingResources,
    Running,
    /// A scale request is out and the restart has not been applied yet.
    Rescaling,
    Finished,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Finished | Self::Failed)
    }
}

pub struct AdaptiveScheduler {
    config: SchedulerConfig,
    job: JobGraph,
    /// Vertex ids in dependency order.
    order: Vec<VertexId>,
    graph: ExecutionGraph,
    decider: ParallelismDecider,
    detector: StragglerDetector,
    speculation: SpeculativeExecutionManager,
    registry: SlowNodeRegistry,
    controller: RescalingController,
    backend: Box<dyn ExecutionBackend>,
    /// When the controller last entered Running; bounds slot request waits.
    running_since: Option<Instant>,
    finished: bool,
    failure: Option<String>,
    speculative_launches: u32,
    rescales: u32,
}

impl AdaptiveScheduler {
    /// Validate the configuration and the job graph and start waiting for
    /// resources. Nothing is deployed until the first Resource View with
    /// enough slots arrives.
    pub fn submit(
        config: SchedulerConfig,
        job: JobGraph,
        backend: Box<dyn ExecutionBackend>,
        now: Instant,
    ) -> SchedulerResult<Self> {
        config.validate()?;
        let order: Vec<VertexId> = job
            .topological_order()
            .map_err(ConfigError::from)?
            .into_iter()
            .map(|v| v.id.clone())
            .collect();

        let decider = ParallelismDecider::new(&config);
        for vertex in &job.vertices {
            decider.validate_vertex(vertex)?;
        }

        let requirements: BTreeMap<VertexId, VertexRequirement> = job
            .vertices
            .iter()
            .filter(|v| job.is_source(&v.id))
            .map(|v| (v.id.clone(), requirement(&decider, v, &[])))
            .collect();
        for (vertex, req) in &requirements {
            info!(%vertex, parallelism = req.desired, elastic = req.elastic, "source parallelism decided");
        }
        let controller = RescalingController::new(&config.adaptive_scheduler, requirements, now);

        info!(job = %job.name, vertices = job.vertices.len(), edges = job.edges.len(), "job submitted");
        Ok(Self {
            detector: StragglerDetector::new(&config),
            speculation: SpeculativeExecutionManager::new(&config),
            registry: SlowNodeRegistry::new(),
            graph: ExecutionGraph::new(),
            decider,
            controller,
            order,
            job,
            config,
            backend,
            running_since: None,
            finished: false,
            failure: None,
            speculative_launches: 0,
            rescales: 0,
        })
    }

    // ── Accessors ──────────────────────────────────────────────────

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn job(&self) -> &JobGraph {
        &self.job
    }

    pub fn graph(&self) -> &ExecutionGraph {
        &self.graph
    }

    pub fn controller(&self) -> &RescalingController {
        &self.controller
    }

    pub fn registry(&self) -> &SlowNodeRegistry {
        &self.registry
    }

    pub fn speculation(&self) -> &SpeculativeExecutionManager {
        &self.speculation
    }

    /// The last Resource View, capped by `slotmanager.number-of-slots.max`.
    pub fn view(&self) -> &ResourceView {
        self.controller.view()
    }

    pub fn failure(&self) -> Option<&str> {
        self.failure.as_deref()
    }

    pub fn status(&self) -> JobStatus {
        if self.failure.is_some() {
            return JobStatus::Failed;
        }
        if self.finished {
            return JobStatus::Finished;
        }
        match self.controller.phase() {
            RescalePhase::WaitingResources { .. } => JobStatus::WaitingResources,
            RescalePhase::Running { .. } => JobStatus::Running,
            RescalePhase::EvaluatingScale { .. } => JobStatus::Rescaling,
            RescalePhase::Failed { .. } => JobStatus::Failed,
        }
    }

    // ── Parallelism ────────────────────────────────────────────────

    /// Parallelism `vertex` would get now, from the statistics its producers
    /// have reported so far, bounded by `available` when given.
    pub fn decide_parallelism(
        &self,
        vertex: &str,
        available: Option<&ResourceView>,
    ) -> SchedulerResult<u32> {
        let job_vertex = self
            .job
            .get(vertex)
            .ok_or_else(|| SchedulerError::UnknownVertex(vertex.to_string()))?;
        let inputs = self.input_statistics(vertex);
        Ok(self.decider.decide_parallelism(job_vertex, &inputs, available))
    }

    /// Statistics of every input edge of `vertex` from the producers'
    /// current generations.
    pub fn input_statistics(&self, vertex: &str) -> Vec<InputStatistics> {
        self.job
            .inputs_of(vertex)
            .map(|edge| {
                let Some(producer) = self.graph.vertex(&edge.source) else {
                    return InputStatistics::new(&edge.source, edge.exchange, 0);
                };
                let stats = InputStatistics::new(&edge.source, edge.exchange, producer.parallelism);
                match producer.total_output() {
                    Some(bytes) => stats.finished(bytes),
                    None => {
                        let (finished, bytes) = producer.finished_output();
                        stats.partial(finished, bytes)
                    }
                }
            })
            .collect()
    }

    /// Every input of `vertex` can be consumed.
    pub fn is_ready(&self, vertex: &str) -> bool {
        self.job
            .inputs_of(vertex)
            .all(|edge| self.input_ready(&edge.source, edge.exchange))
    }

    fn input_ready(&self, producer: &str, exchange: ExchangeMode) -> bool {
        let finished = self.graph.is_finished(producer);
        match exchange {
            ExchangeMode::Blocking => finished,
            ExchangeMode::Hybrid if self.config.hybrid_consume_constraint.requires_finished_producers() => {
                finished
            }
            ExchangeMode::Pipelined | ExchangeMode::Hybrid => {
                finished || self.graph.is_deployed(producer)
            }
        }
    }

    // ── Resources and rescaling ────────────────────────────────────

    /// A new Resource View from the provider. Returns the scale request the
    /// controller issued in response, if any.
    pub fn on_resource_changed(
        &mut self,
        view: ResourceView,
        now: Instant,
    ) -> SchedulerResult<Option<ScaleRequest>> {
        if self.status().is_terminal() {
            return Ok(None);
        }
        let view = view.capped(self.config.slots.max_slots);
        let action = self.controller.on_resource_changed(view, now);
        let request = self.handle(action, now)?;
        self.schedule(now)?;
        Ok(request)
    }

    /// Timer-driven re-evaluation: wait and stabilization timeouts, rescale
    /// decisions deferred by the minimum interval and slot request timeouts.
    pub fn poll(&mut self, now: Instant) -> SchedulerResult<Option<ScaleRequest>> {
        if self.status().is_terminal() {
            return Ok(None);
        }
        let action = self.controller.poll(now);
        let request = self.handle(action, now)?;
        self.schedule(now)?;
        self.check_slot_requests(now)?;
        Ok(request)
    }

    /// The external restart for `request` happened: affected vertices get a
    /// new generation at the requested parallelism and their attempts are
    /// canceled. Deployment resumes once the controller has the resources.
    pub fn apply_scale(&mut self, request: &ScaleRequest, now: Instant) -> SchedulerResult<()> {
        if self.status().is_terminal() {
            return Ok(());
        }
        if !matches!(self.controller.phase(), RescalePhase::EvaluatingScale { .. }) {
            warn!(phase = self.controller.phase().name(), "scale applied without a pending request, ignoring");
            return Ok(());
        }

        for (vertex, parallelism) in &request.plan {
            let regenerate = self
                .graph
                .vertex(vertex)
                .is_some_and(|v| !v.is_finished());
            if !regenerate {
                continue;
            }
            let start = self.graph.start_generation(vertex, *parallelism, now)?;
            self.cancel_remote(&start.canceled);
        }
        self.rescales += 1;
        info!(reason = %request.reason, vertices = request.plan.len(), "rescale applied");

        let action = self.controller.restarted(now);
        self.handle(action, now)?;
        self.schedule(now)
    }

    fn handle(&mut self, action: RescaleAction, now: Instant) -> SchedulerResult<Option<ScaleRequest>> {
        match action {
            RescaleAction::Idle => Ok(None),
            RescaleAction::Start { plan, reduced } => {
                for (vertex, parallelism) in &plan {
                    let regenerate = match self.graph.vertex(vertex) {
                        None => true,
                        Some(v) => !v.is_finished() && v.parallelism != *parallelism,
                    };
                    if regenerate {
                        let start = self.graph.start_generation(vertex, *parallelism, now)?;
                        self.cancel_remote(&start.canceled);
                    }
                }
                self.running_since = Some(now);
                info!(reduced, vertices = plan.len(), slots = self.view().slot_count(), "job running");
                Ok(None)
            }
            RescaleAction::Scale(request) => Ok(Some(request)),
            RescaleAction::Insufficient {
                available,
                required,
            } => Err(self.fail(
                SchedulerError::ResourceInsufficient {
                    available,
                    required,
                },
                now,
            )),
        }
    }

    // ── Attempt reports ────────────────────────────────────────────

    pub fn on_attempt_running(&mut self, attempt: &AttemptId, now: Instant) -> SchedulerResult<()> {
        match self.graph.mark_running(attempt, now)? {
            ReportOutcome::Applied => debug!(%attempt, "attempt running"),
            ReportOutcome::Stray(reason) => info!(%attempt, %reason, "stray report discarded"),
        }
        Ok(())
    }

    pub fn on_attempt_progress(&mut self, attempt: &AttemptId, input_bytes: u64) -> SchedulerResult<()> {
        if let ReportOutcome::Stray(reason) = self.graph.record_progress(attempt, input_bytes)? {
            debug!(%attempt, %reason, "stray progress discarded");
        }
        Ok(())
    }

    /// The first FINISHED report of a task instance wins; its active
    /// siblings are canceled. Later reports for the task are discarded.
    pub fn on_attempt_finished(&mut self, report: &FinishedReport, now: Instant) -> SchedulerResult<()> {
        let attempt = &report.attempt;
        let outcome =
            self.graph
                .finish_attempt(attempt, report.input_bytes, report.output_bytes, now)?;
        let (canceled, vertex_finished) = match outcome {
            FinishOutcome::Won {
                canceled,
                vertex_finished,
            } => (canceled, vertex_finished),
            FinishOutcome::Stray(reason) => {
                info!(%attempt, %reason, "stray report discarded");
                return Ok(());
            }
        };

        if !canceled.is_empty() {
            info!(%attempt, canceled = canceled.len(), "attempt won, siblings canceled");
            self.cancel_remote(&canceled);
        }

        if vertex_finished {
            let vertex = &attempt.vertex;
            self.controller.untrack_vertex(vertex);
            info!(%vertex, generation = attempt.generation, "vertex finished");
            if self.job.vertices.iter().all(|v| self.graph.is_finished(&v.id)) {
                self.finished = true;
                info!(
                    job = %self.job.name,
                    speculative_attempts = self.speculative_launches,
                    rescales = self.rescales,
                    "job finished"
                );
                return Ok(());
            }
        }
        self.schedule(now)
    }

    /// A failed attempt is only fatal when its task instance has nothing
    /// left running and no winner.
    pub fn on_attempt_failed(&mut self, attempt: &AttemptId, now: Instant) -> SchedulerResult<()> {
        match self.graph.fail_attempt(attempt, now)? {
            FailOutcome::Stray(reason) => {
                info!(%attempt, %reason, "stray report discarded");
                Ok(())
            }
            FailOutcome::SiblingsRemain => {
                info!(%attempt, "attempt failed, siblings still running");
                self.schedule(now)
            }
            FailOutcome::TaskLost => Err(self.fail(
                SchedulerError::TaskFailed {
                    attempt: attempt.clone(),
                },
                now,
            )),
        }
    }

    // ── Detector tick ──────────────────────────────────────────────

    /// One straggler detector tick. Expired node blocks are purged, slow
    /// attempts get speculative siblings and waiting tasks are retried.
    /// Returns the speculative attempts deployed.
    pub fn on_tick(&mut self, now: Instant) -> SchedulerResult<Vec<AttemptId>> {
        if self.status().is_terminal() {
            return Ok(Vec::new());
        }
        let expired = self.registry.purge_expired(now);
        if expired > 0 {
            debug!(expired, "slow node blocks expired");
        }

        let mut launched = Vec::new();
        if self.is_executing() {
            let slow = self.detector.detect(&self.graph, now);
            let launches = self.speculation.on_slow_attempts(
                &slow,
                &self.graph,
                self.controller.view(),
                &mut self.registry,
                now,
            );
            for launch in launches {
                if let Some(id) = self.deploy(&launch.vertex, launch.subtask, &launch.node_id, true, now)? {
                    self.speculative_launches += 1;
                    launched.push(id);
                }
            }
        }

        self.schedule(now)?;
        Ok(launched)
    }

    // ── Placement ──────────────────────────────────────────────────

    fn is_executing(&self) -> bool {
        matches!(
            self.controller.phase(),
            RescalePhase::Running { .. } | RescalePhase::EvaluatingScale { .. }
        )
    }

    /// Place waiting tasks and start every vertex whose inputs became ready.
    /// Placing a producer can make a pipelined consumer ready, so this runs
    /// until no new vertex starts.
    fn schedule(&mut self, now: Instant) -> SchedulerResult<()> {
        if self.status().is_terminal() || !self.is_executing() {
            return Ok(());
        }
        loop {
            self.place_pending(now)?;
            if self.start_ready_vertices(now)? == 0 {
                return Ok(());
            }
        }
    }

    fn start_ready_vertices(&mut self, now: Instant) -> SchedulerResult<usize> {
        let ready: Vec<VertexId> = self
            .order
            .iter()
            .filter(|id| self.graph.vertex(id).is_none() && self.is_ready(id))
            .cloned()
            .collect();

        for id in &ready {
            let Some(vertex) = self.job.get(id) else {
                continue;
            };
            let inputs = self.input_statistics(id);
            let parallelism =
                self.decider
                    .decide_parallelism(vertex, &inputs, Some(self.controller.view()));
            let req = requirement(&self.decider, vertex, &inputs);
            self.graph.start_generation(id, parallelism, now)?;
            self.controller.track_vertex(id, req, parallelism);
        }
        Ok(ready.len())
    }

    fn place_pending(&mut self, now: Instant) -> SchedulerResult<()> {
        let pending: Vec<(VertexId, u32)> = self
            .graph
            .vertices()
            .flat_map(|v| {
                v.tasks
                    .iter()
                    .filter(|t| t.is_pending())
                    .map(move |t| (v.vertex_id.clone(), t.subtask))
            })
            .collect();
        if pending.is_empty() {
            return Ok(());
        }

        let mut active = self.graph.active_attempts_per_node();
        let mut shared: HashMap<VertexId, HashMap<NodeId, u32>> = HashMap::new();
        let request = PlacementRequest {
            mode: self.config.load_balance,
            avoid: &[],
        };
        for (vertex, subtask) in pending {
            let vertex_active = shared
                .entry(vertex.clone())
                .or_insert_with(|| self.graph.vertex_attempts_per_node(&vertex));
            let loads = node_loads(self.controller.view(), &active, vertex_active, &self.registry, now);
            let Some(node) = select_node(&loads, &request) else {
                debug!(%vertex, subtask, "no free slot, task waits");
                continue;
            };
            if self.deploy(&vertex, subtask, &node, false, now)?.is_some() {
                *vertex_active.entry(node.clone()).or_insert(0) += 1;
                *active.entry(node).or_insert(0) += 1;
            }
        }
        Ok(())
    }

    fn deploy(
        &mut self,
        vertex: &str,
        subtask: u32,
        node: &NodeId,
        speculative: bool,
        now: Instant,
    ) -> SchedulerResult<Option<AttemptId>> {
        let id = self.graph.add_attempt(vertex, subtask, node, speculative, now)?;
        self.graph.mark_deploying(&id)?;
        match self.backend.deploy(&id, node) {
            Ok(()) => {
                debug!(attempt = %id, %node, speculative, "attempt deployed");
                Ok(Some(id))
            }
            Err(e) => {
                warn!(attempt = %id, %node, error = %e, "deployment failed");
                self.graph.fail_attempt(&id, now)?;
                Ok(None)
            }
        }
    }

    fn check_slot_requests(&mut self, now: Instant) -> SchedulerResult<()> {
        let Some(running_since) = self.running_since else {
            return Ok(());
        };
        if !self.is_executing() {
            return Ok(());
        }
        let timeout = self.config.slots.request_timeout;
        let expired = self.graph.vertices().find_map(|v| {
            self.graph
                .pending_tasks(&v.vertex_id)
                .into_iter()
                .map(|(subtask, since)| (subtask, now.saturating_duration_since(since.max(running_since))))
                .find(|(_, waited)| *waited > timeout)
                .map(|(subtask, waited)| (v.vertex_id.clone(), subtask, waited))
        });
        match expired {
            Some((vertex, subtask, waited)) => Err(self.fail(
                SchedulerError::SlotRequestTimeout {
                    vertex,
                    subtask,
                    waited,
                },
                now,
            )),
            None => Ok(()),
        }
    }

    // ── Termination ────────────────────────────────────────────────

    /// Mark the job failed and cancel everything still active.
    fn fail(&mut self, err: SchedulerError, now: Instant) -> SchedulerError {
        error!(job = %self.job.name, error = %err, "job failed");
        self.failure = Some(err.to_string());

        let active: Vec<AttemptId> = self
            .graph
            .vertices()
            .flat_map(|v| v.tasks.iter())
            .flat_map(|t| t.active_attempts())
            .map(|a| a.id.clone())
            .collect();
        for id in &active {
            if let Err(e) = self.graph.cancel_attempt(id, now) {
                warn!(attempt = %id, error = %e, "could not cancel attempt");
            }
        }
        self.cancel_remote(&active);
        err
    }

    fn cancel_remote(&mut self, attempts: &[AttemptId]) {
        for id in attempts {
            if let Err(e) = self.backend.cancel(id) {
                warn!(attempt = %id, error = %e, "cancel failed");
            }
        }
    }

    // ── Reporting ──────────────────────────────────────────────────

    pub fn summary(&self) -> JobSummary {
        let vertices = self
            .order
            .iter()
            .filter_map(|id| self.graph.vertex(id))
            .map(|v| {
                let attempts = v.tasks.iter().flat_map(|t| t.attempts.iter());
                VertexSummary {
                    vertex: v.vertex_id.clone(),
                    generation: v.generation,
                    parallelism: v.parallelism,
                    finished_tasks: v.finished_count(),
                    attempts: attempts.clone().count(),
                    speculative_attempts: attempts.clone().filter(|a| a.speculative).count(),
                    speculative_wins: v
                        .tasks
                        .iter()
                        .filter_map(|t| t.winning_attempt())
                        .filter(|a| a.speculative)
                        .count(),
                    output_bytes: v.finished_output().1,
                }
            })
            .collect();
        JobSummary {
            job: self.job.name.clone(),
            status: self.status(),
            failure: self.failure.clone(),
            slots: self.view().slot_count(),
            rescales: self.rescales,
            speculative_launches: self.speculative_launches,
            vertices,
        }
    }
}

/// What a vertex needs from the controller, from its current decision.
fn requirement(
    decider: &ParallelismDecider,
    vertex: &JobVertex,
    inputs: &[InputStatistics],
) -> VertexRequirement {
    let decision = decider.decide(vertex, inputs);
    if decider.is_elastic(vertex) {
        VertexRequirement::elastic(decider.bounds(vertex).min, decision.parallelism)
    } else {
        VertexRequirement::fixed(decision.parallelism)
    }
}

/// Snapshot of a job's execution for reporting.
#[derive(Debug, Clone, Serialize)]
pub struct JobSummary {
    pub job: String,
    pub status: JobStatus,
    pub failure: Option<String>,
    pub slots: u32,
    pub rescales: u32,
    pub speculative_launches: u32,
    pub vertices: Vec<VertexSummary>,
}

#[derive(Debug, Clone, Serialize)]
pub struct VertexSummary {
    pub vertex: VertexId,
    pub generation: u32,
    pub parallelism: u32,
    pub finished_tasks: u32,
    pub attempts: usize,
    pub speculative_attempts: usize,
    pub speculative_wins: usize,
    pub output_bytes: u64,
}
