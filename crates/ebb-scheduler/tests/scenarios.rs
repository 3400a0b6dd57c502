//! End-to-end scheduling scenarios.
//!
//! Drives an `AdaptiveScheduler` through submission, resource changes,
//! attempt reports and detector ticks with explicit timestamps, and checks
//! what reaches the execution backend.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use ebb_core::{
    ConsumeConstraint, ExchangeMode, JobGraph, JobVertex, LoadBalanceMode, NodeId,
    SchedulerConfig, WaitTimeout,
};
use ebb_resources::{MiniCluster, ResourceView};
use ebb_scheduler::*;
use ebb_state::AttemptId;

const MB: u64 = 1024 * 1024;

#[derive(Clone, Default)]
struct Recorder {
    deployed: Arc<Mutex<Vec<(AttemptId, NodeId)>>>,
    canceled: Arc<Mutex<Vec<AttemptId>>>,
}

impl Recorder {
    fn deployed(&self) -> Vec<(AttemptId, NodeId)> {
        self.deployed.lock().unwrap().clone()
    }

    fn canceled(&self) -> Vec<AttemptId> {
        self.canceled.lock().unwrap().clone()
    }

    fn node_of(&self, attempt: &AttemptId) -> Option<NodeId> {
        self.deployed()
            .into_iter()
            .find(|(id, _)| id == attempt)
            .map(|(_, node)| node)
    }
}

impl ExecutionBackend for Recorder {
    fn deploy(&mut self, attempt: &AttemptId, node: &NodeId) -> anyhow::Result<()> {
        self.deployed
            .lock()
            .unwrap()
            .push((attempt.clone(), node.clone()));
        Ok(())
    }

    fn cancel(&mut self, attempt: &AttemptId) -> anyhow::Result<()> {
        self.canceled.lock().unwrap().push(attempt.clone());
        Ok(())
    }
}

/// Rejects the first `failures` deployments, then records like [`Recorder`].
struct Flaky {
    failures: u32,
    inner: Recorder,
}

impl ExecutionBackend for Flaky {
    fn deploy(&mut self, attempt: &AttemptId, node: &NodeId) -> anyhow::Result<()> {
        if self.failures > 0 {
            self.failures -= 1;
            anyhow::bail!("task manager {node} unreachable");
        }
        self.inner.deploy(attempt, node)
    }

    fn cancel(&mut self, attempt: &AttemptId) -> anyhow::Result<()> {
        self.inner.cancel(attempt)
    }
}

fn secs(t0: Instant, s: u64) -> Instant {
    t0 + Duration::from_secs(s)
}

fn slots(n: u32) -> ResourceView {
    ResourceView::empty().with_node("tm-0", n, 1.0, 0)
}

fn attempt(vertex: &str, subtask: u32, generation: u32, number: u32) -> AttemptId {
    AttemptId::new(vertex, subtask, generation, number)
}

fn submit(config: SchedulerConfig, job: JobGraph, t0: Instant) -> (AdaptiveScheduler, Recorder) {
    let recorder = Recorder::default();
    let scheduler = AdaptiveScheduler::submit(config, job, Box::new(recorder.clone()), t0).unwrap();
    (scheduler, recorder)
}

fn finish(s: &mut AdaptiveScheduler, id: &AttemptId, output_bytes: u64, at: Instant) {
    let report = FinishedReport {
        attempt: id.clone(),
        input_bytes: Some(MB),
        output_bytes: Some(output_bytes),
    };
    s.on_attempt_finished(&report, at).unwrap();
}

fn fixed_source_into_sink(source_parallelism: u32, exchange: ExchangeMode) -> JobGraph {
    JobGraph::new("etl")
        .vertex(JobVertex::new("source").with_parallelism(source_parallelism))
        .vertex(JobVertex::new("sink"))
        .edge("source", "sink", exchange)
}

#[test]
fn downstream_parallelism_follows_upstream_volume() {
    let t0 = Instant::now();
    let (mut s, backend) = submit(
        SchedulerConfig::default(),
        fixed_source_into_sink(4, ExchangeMode::Blocking),
        t0,
    );
    assert_eq!(s.status(), JobStatus::WaitingResources);

    s.on_resource_changed(slots(40), t0).unwrap();
    assert_eq!(s.status(), JobStatus::Running);
    assert_eq!(backend.deployed().len(), 4);
    assert!(s.graph().vertex("sink").is_none());

    for subtask in 0..4 {
        let id = attempt("source", subtask, 1, 0);
        s.on_attempt_running(&id, t0).unwrap();
        finish(&mut s, &id, 125 * MB, secs(t0, 30));
    }

    // 500MB at 16MB per task.
    let sink = s.graph().vertex("sink").unwrap();
    assert_eq!(sink.parallelism, 32);
    assert_eq!(backend.deployed().len(), 4 + 32);
    assert_eq!(s.decide_parallelism("sink", None).unwrap(), 32);
    assert_eq!(s.decide_parallelism("sink", Some(&slots(10))).unwrap(), 10);
}

#[test]
fn winner_cancels_speculative_siblings_and_stray_finish_is_discarded() {
    let t0 = Instant::now();
    let mut config = SchedulerConfig::default();
    config.speculative.enabled = true;
    config.speculative.max_concurrent_executions = 3;
    let (mut s, backend) = submit(config, fixed_source_into_sink(4, ExchangeMode::Blocking), t0);

    s.on_resource_changed(MiniCluster::new(4, 2).view(), t0).unwrap();
    for subtask in 0..4 {
        s.on_attempt_running(&attempt("source", subtask, 1, 0), t0).unwrap();
    }
    for subtask in 0..3 {
        finish(&mut s, &attempt("source", subtask, 1, 0), 1024, secs(t0, 40));
    }
    let straggler = attempt("source", 3, 1, 0);
    assert_eq!(backend.node_of(&straggler).as_deref(), Some("tm-1"));

    // Baseline is max(40s * 1.5, 60s) = 60s.
    assert!(s.on_tick(secs(t0, 60)).unwrap().is_empty());
    let first = s.on_tick(secs(t0, 61)).unwrap();
    assert_eq!(first, vec![attempt("source", 3, 1, 1)]);
    assert!(s.registry().is_blocked("tm-1", secs(t0, 61)));
    assert_eq!(backend.node_of(&first[0]).as_deref(), Some("tm-0"));

    let second = s.on_tick(secs(t0, 62)).unwrap();
    assert_eq!(second, vec![attempt("source", 3, 1, 2)]);
    assert_eq!(backend.node_of(&second[0]).as_deref(), Some("tm-2"));

    // Capped at three concurrent attempts.
    assert!(s.on_tick(secs(t0, 63)).unwrap().is_empty());
    let task = s.graph().task("source", 3).unwrap();
    assert_eq!(task.active_count(), 3);

    s.on_attempt_running(&second[0], secs(t0, 63)).unwrap();
    finish(&mut s, &second[0], 1024, secs(t0, 70));
    assert_eq!(backend.canceled(), vec![straggler.clone(), first[0].clone()]);
    assert!(s.graph().is_finished("source"));
    let deployed = backend.deployed().len();
    assert_eq!(s.graph().vertex("sink").map(|v| v.parallelism), Some(1));

    // The canceled sibling reports late.
    finish(&mut s, &first[0], 4096, secs(t0, 71));
    assert_eq!(backend.deployed().len(), deployed);
    let task = s.graph().task("source", 3).unwrap();
    assert_eq!(task.winning_attempt().map(|a| a.id.clone()), Some(second[0].clone()));
    assert_eq!(s.graph().vertex("source").unwrap().finished_output(), (4, 4096));
}

#[test]
fn two_increases_ten_seconds_apart_yield_one_request() {
    let t0 = Instant::now();
    let mut config = SchedulerConfig::default();
    config.auto_parallelism.default_source_parallelism = Some(16);
    let job = JobGraph::new("elastic").vertex(JobVertex::new("source"));
    let (mut s, backend) = submit(config, job, t0);

    assert_eq!(s.on_resource_changed(slots(4), t0).unwrap(), None);
    assert_eq!(s.poll(secs(t0, 10)).unwrap(), None);
    assert_eq!(s.graph().vertex("source").unwrap().parallelism, 4);

    let request = s
        .on_resource_changed(slots(8), secs(t0, 20))
        .unwrap()
        .expect("first increase is exempt from the interval");
    assert_eq!(request.plan.get("source"), Some(&8));
    assert_eq!(s.status(), JobStatus::Rescaling);

    s.apply_scale(&request, secs(t0, 21)).unwrap();
    let source = s.graph().vertex("source").unwrap();
    assert_eq!((source.generation, source.parallelism), (2, 8));
    assert_eq!(backend.canceled().len(), 4);
    assert_eq!(backend.deployed().len(), 4 + 8);
    assert_eq!(s.status(), JobStatus::Running);

    assert_eq!(s.on_resource_changed(slots(12), secs(t0, 30)).unwrap(), None);
    assert_eq!(s.poll(secs(t0, 49)).unwrap(), None);
    let deferred = s.poll(secs(t0, 50)).unwrap().expect("deferred increase");
    assert_eq!(deferred.plan.get("source"), Some(&12));

    // A report from the first generation is stray.
    finish(&mut s, &attempt("source", 0, 1, 0), 1024, secs(t0, 51));
    assert_eq!(s.graph().vertex("source").unwrap().finished_count(), 0);
}

#[test]
fn negative_wait_timeout_never_fails() {
    let t0 = Instant::now();
    let mut config = SchedulerConfig::default();
    config.adaptive_scheduler.resource_wait_timeout = WaitTimeout::Forever;
    let (mut s, backend) = submit(config, fixed_source_into_sink(4, ExchangeMode::Blocking), t0);

    s.on_resource_changed(slots(2), t0).unwrap();
    assert_eq!(s.poll(secs(t0, 36_000)).unwrap(), None);
    assert_eq!(s.status(), JobStatus::WaitingResources);
    assert!(backend.deployed().is_empty());

    s.on_resource_changed(slots(4), secs(t0, 36_001)).unwrap();
    assert_eq!(s.status(), JobStatus::Running);
    assert_eq!(backend.deployed().len(), 4);
}

#[test]
fn wait_timeout_below_minimum_fails_the_job() {
    let t0 = Instant::now();
    let (mut s, _) = submit(
        SchedulerConfig::default(),
        fixed_source_into_sink(4, ExchangeMode::Blocking),
        t0,
    );
    s.on_resource_changed(slots(2), t0).unwrap();
    assert_eq!(s.poll(secs(t0, 299)).unwrap(), None);

    let err = s.poll(secs(t0, 300)).unwrap_err();
    assert!(matches!(
        err,
        SchedulerError::ResourceInsufficient {
            available: 2,
            required: 4
        }
    ));
    assert_eq!(s.status(), JobStatus::Failed);
    // Nothing happens once failed.
    assert_eq!(s.on_resource_changed(slots(8), secs(t0, 301)).unwrap(), None);
}

#[test]
fn pipelined_consumer_starts_with_its_producer() {
    let t0 = Instant::now();
    let (mut s, backend) = submit(
        SchedulerConfig::default(),
        fixed_source_into_sink(2, ExchangeMode::Pipelined),
        t0,
    );
    s.on_resource_changed(slots(4), t0).unwrap();
    // No statistics through a pipelined edge, so the job default applies.
    assert_eq!(s.graph().vertex("sink").map(|v| v.parallelism), Some(1));
    assert_eq!(backend.deployed().len(), 3);
}

#[test]
fn pipelined_region_shares_slots_with_its_producer() {
    let t0 = Instant::now();
    let job = JobGraph::new("region")
        .vertex(JobVertex::new("source").with_parallelism(4))
        .vertex(JobVertex::new("sink").with_parallelism(4))
        .edge("source", "sink", ExchangeMode::Pipelined);
    let (mut s, backend) = submit(SchedulerConfig::default(), job, t0);

    s.on_resource_changed(slots(4), t0).unwrap();
    assert_eq!(s.status(), JobStatus::Running);
    assert_eq!(backend.deployed().len(), 8);
    assert!(s.graph().pending_tasks("sink").is_empty());

    assert_eq!(s.poll(secs(t0, 301)).unwrap(), None);
    assert_eq!(s.status(), JobStatus::Running);
}

#[test]
fn hybrid_consumer_shares_slots_with_running_producers() {
    let t0 = Instant::now();
    let job = JobGraph::new("hybrid")
        .vertex(JobVertex::new("source").with_parallelism(2))
        .vertex(JobVertex::new("sink").with_parallelism(2))
        .edge("source", "sink", ExchangeMode::Hybrid);
    let (mut s, backend) = submit(SchedulerConfig::default(), job, t0);

    s.on_resource_changed(MiniCluster::new(2, 1).view(), t0).unwrap();
    let sink_nodes: Vec<NodeId> = backend
        .deployed()
        .into_iter()
        .filter(|(id, _)| id.vertex == "sink")
        .map(|(_, node)| node)
        .collect();
    assert_eq!(sink_nodes, vec!["tm-0".to_string(), "tm-1".to_string()]);
    assert_eq!(s.poll(secs(t0, 400)).unwrap(), None);
}

#[test]
fn hybrid_consumer_honours_consume_constraint() {
    let t0 = Instant::now();
    let mut config = SchedulerConfig::default();
    config.hybrid_consume_constraint = ConsumeConstraint::AllProducersFinished;
    let (mut s, _) = submit(config, fixed_source_into_sink(2, ExchangeMode::Hybrid), t0);
    s.on_resource_changed(slots(4), t0).unwrap();
    assert!(s.graph().vertex("sink").is_none());
    assert!(!s.is_ready("sink"));

    let t0 = Instant::now();
    let (mut s, _) = submit(
        SchedulerConfig::default(),
        fixed_source_into_sink(2, ExchangeMode::Hybrid),
        t0,
    );
    s.on_resource_changed(slots(4), t0).unwrap();
    assert!(s.graph().vertex("sink").is_some());
}

#[test]
fn slot_request_timeout_fails_the_job() {
    let t0 = Instant::now();
    let job = JobGraph::new("wide")
        .vertex(JobVertex::new("source").with_parallelism(2))
        .vertex(JobVertex::new("sink").with_parallelism(4))
        .edge("source", "sink", ExchangeMode::Blocking);
    let (mut s, backend) = submit(SchedulerConfig::default(), job, t0);

    s.on_resource_changed(slots(2), t0).unwrap();
    finish(&mut s, &attempt("source", 0, 1, 0), 1024, secs(t0, 10));
    finish(&mut s, &attempt("source", 1, 1, 0), 1024, secs(t0, 10));
    assert_eq!(backend.deployed().len(), 2 + 2);

    assert_eq!(s.poll(secs(t0, 310)).unwrap(), None);
    let err = s.poll(secs(t0, 311)).unwrap_err();
    assert!(matches!(
        err,
        SchedulerError::SlotRequestTimeout { ref vertex, subtask: 2, .. } if vertex == "sink"
    ));
    assert_eq!(s.status(), JobStatus::Failed);
    // Running sink attempts are canceled with the job.
    assert_eq!(backend.canceled().len(), 2);
}

#[test]
fn lost_task_fails_the_job() {
    let t0 = Instant::now();
    let job = JobGraph::new("single").vertex(JobVertex::new("source").with_parallelism(1));
    let (mut s, _) = submit(SchedulerConfig::default(), job, t0);
    s.on_resource_changed(slots(1), t0).unwrap();

    let id = attempt("source", 0, 1, 0);
    s.on_attempt_running(&id, t0).unwrap();
    let err = s.on_attempt_failed(&id, secs(t0, 5)).unwrap_err();
    assert!(matches!(err, SchedulerError::TaskFailed { ref attempt } if *attempt == id));
    assert_eq!(s.status(), JobStatus::Failed);
    assert!(s.failure().is_some());
}

#[test]
fn failed_deploy_is_retried_without_failing_the_job() {
    let t0 = Instant::now();
    let recorder = Recorder::default();
    let backend = Flaky {
        failures: 1,
        inner: recorder.clone(),
    };
    let job = JobGraph::new("single").vertex(JobVertex::new("source").with_parallelism(1));
    let mut s = AdaptiveScheduler::submit(SchedulerConfig::default(), job, Box::new(backend), t0).unwrap();

    s.on_resource_changed(slots(1), t0).unwrap();
    assert_eq!(s.status(), JobStatus::Running);
    assert!(recorder.deployed().is_empty());

    assert_eq!(s.poll(secs(t0, 1)).unwrap(), None);
    assert_eq!(recorder.node_of(&attempt("source", 0, 1, 1)).as_deref(), Some("tm-0"));
    assert!(s.failure().is_none());
}

#[test]
fn job_finishes_when_every_vertex_finished() {
    let t0 = Instant::now();
    let (mut s, _) = submit(
        SchedulerConfig::default(),
        fixed_source_into_sink(1, ExchangeMode::Blocking),
        t0,
    );
    s.on_resource_changed(slots(1), t0).unwrap();
    finish(&mut s, &attempt("source", 0, 1, 0), 1024, secs(t0, 5));
    assert_eq!(s.status(), JobStatus::Running);
    finish(&mut s, &attempt("sink", 0, 1, 0), 1024, secs(t0, 9));
    assert_eq!(s.status(), JobStatus::Finished);

    let summary = s.summary();
    assert_eq!(summary.vertices.len(), 2);
    assert!(summary.vertices.iter().all(|v| v.finished_tasks == v.parallelism));
}

#[test]
fn load_balance_mode_spreads_attempts() {
    let t0 = Instant::now();
    let job = || JobGraph::new("spread").vertex(JobVertex::new("source").with_parallelism(4));

    let (mut packed, backend) = submit(SchedulerConfig::default(), job(), t0);
    packed.on_resource_changed(MiniCluster::new(2, 4).view(), t0).unwrap();
    assert!(backend.deployed().iter().all(|(_, node)| node == "tm-0"));

    let mut config = SchedulerConfig::default();
    config.load_balance = LoadBalanceMode::Tasks;
    let (mut spread, backend) = submit(config, job(), t0);
    spread.on_resource_changed(MiniCluster::new(2, 4).view(), t0).unwrap();
    let on_tm0 = backend.deployed().iter().filter(|(_, node)| node == "tm-0").count();
    assert_eq!(on_tm0, 2);
}

#[test]
fn invalid_configuration_is_rejected_at_submission() {
    let t0 = Instant::now();
    let mut config = SchedulerConfig::default();
    config.default_parallelism = 0;
    let job = JobGraph::new("bad").vertex(JobVertex::new("source"));
    let result = AdaptiveScheduler::submit(config, job, Box::new(NoopBackend), t0);
    assert!(matches!(result, Err(SchedulerError::Configuration(_))));

    let cyclic = JobGraph::new("cycle")
        .vertex(JobVertex::new("a"))
        .vertex(JobVertex::new("b"))
        .edge("a", "b", ExchangeMode::Blocking)
        .edge("b", "a", ExchangeMode::Blocking);
    let result = AdaptiveScheduler::submit(SchedulerConfig::default(), cyclic, Box::new(NoopBackend), t0);
    assert!(matches!(result, Err(SchedulerError::Configuration(_))));
}

#[test]
fn slots_beyond_configured_max_are_ignored() {
    let t0 = Instant::now();
    let mut config = SchedulerConfig::default();
    config.slots.max_slots = Some(3);
    let job = JobGraph::new("capped").vertex(JobVertex::new("source").with_parallelism(3));
    let (mut s, backend) = submit(config, job, t0);
    s.on_resource_changed(slots(10), t0).unwrap();
    assert_eq!(s.view().slot_count(), 3);
    assert_eq!(backend.deployed().len(), 3);
}
