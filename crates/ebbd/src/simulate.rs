//! Mini-cluster simulation.
//!
//! Runs a job through the real control loop against simulated task
//! managers. Attempts "execute" as timers: each reports RUNNING when
//! deployed and FINISHED after its vertex duration, stretched by the
//! slowdown factor of the node it landed on. Resource changes are published
//! on schedule through a [`ResourceProvider`].

use std::collections::HashMap;
use std::fmt::Write as _;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, info};

use ebb_core::{JobGraph, NodeId, SchedulerConfig, VertexId, format_bytes, scale_duration};
use ebb_resources::{MiniCluster, ResourceProvider};
use ebb_scheduler::{
    AdaptiveScheduler, ControlLoop, ExecutionBackend, FinishedReport, JobSummary, SchedulerEvent,
};
use ebb_state::AttemptId;

/// Largest accepted per-node slowdown factor.
const MAX_SLOWDOWN: f64 = 1000.0;

fn default_time_limit() -> u64 {
    3600
}

/// A simulation input file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scenario {
    pub job: JobGraph,
    #[serde(default)]
    pub cluster: MiniCluster,
    /// Duration multiplier per node id; nodes not listed run at 1.0.
    #[serde(default)]
    pub slowdown: HashMap<NodeId, f64>,
    #[serde(default)]
    pub vertices: HashMap<VertexId, VertexProfile>,
    #[serde(default)]
    pub resource_changes: Vec<ResourceChange>,
    /// Simulated seconds before the run is stopped.
    #[serde(default = "default_time_limit")]
    pub time_limit_secs: u64,
}

/// How every task of a vertex behaves.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VertexProfile {
    pub duration_ms: u64,
    pub input_bytes_per_task: Option<u64>,
    pub output_bytes_per_task: u64,
}

impl Default for VertexProfile {
    fn default() -> Self {
        Self {
            duration_ms: 1000,
            input_bytes_per_task: None,
            output_bytes_per_task: 0,
        }
    }
}

/// Replace the cluster `at_secs` after the run starts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceChange {
    pub at_secs: u64,
    pub cluster: MiniCluster,
}

impl Scenario {
    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        let scenario: Self = serde_json::from_str(json)?;
        scenario.validate()?;
        Ok(scenario)
    }

    /// Slowdown factors must be positive and at most [`MAX_SLOWDOWN`].
    pub fn validate(&self) -> anyhow::Result<()> {
        for (node, factor) in &self.slowdown {
            if !(*factor > 0.0 && *factor <= MAX_SLOWDOWN) {
                anyhow::bail!("slowdown for {node} must be in (0, {MAX_SLOWDOWN}], got {factor}");
            }
        }
        Ok(())
    }
}

/// Outcome of one simulation run.
#[derive(Debug, Clone, Serialize)]
pub struct SimulationReport {
    pub simulated_secs: f64,
    /// Set when the run ended with a scheduling error.
    pub error: Option<String>,
    pub summary: JobSummary,
}

// ── Simulated execution ───────────────────────────────────────────

struct SimulatedBackend {
    events: mpsc::Sender<SchedulerEvent>,
    profiles: HashMap<VertexId, VertexProfile>,
    slowdown: HashMap<NodeId, f64>,
    running: HashMap<AttemptId, JoinHandle<()>>,
}

impl SimulatedBackend {
    fn new(events: mpsc::Sender<SchedulerEvent>, scenario: &Scenario) -> Self {
        Self {
            events,
            profiles: scenario.vertices.clone(),
            slowdown: scenario.slowdown.clone(),
            running: HashMap::new(),
        }
    }
}

impl ExecutionBackend for SimulatedBackend {
    fn deploy(&mut self, attempt: &AttemptId, node: &NodeId) -> anyhow::Result<()> {
        let profile = self.profiles.get(&attempt.vertex).cloned().unwrap_or_default();
        let factor = self.slowdown.get(node).copied().unwrap_or(1.0);
        let duration = scale_duration(Duration::from_millis(profile.duration_ms), factor);
        debug!(%attempt, %node, duration_ms = duration.as_millis() as u64, "simulated attempt started");

        let events = self.events.clone();
        let id = attempt.clone();
        let handle = tokio::spawn(async move {
            if events.send(SchedulerEvent::AttemptRunning(id.clone())).await.is_err() {
                return;
            }
            if let Some(input_bytes) = profile.input_bytes_per_task {
                let progress = SchedulerEvent::AttemptProgress {
                    attempt: id.clone(),
                    input_bytes,
                };
                if events.send(progress).await.is_err() {
                    return;
                }
            }
            time::sleep(duration).await;
            let report = FinishedReport {
                attempt: id,
                input_bytes: profile.input_bytes_per_task,
                output_bytes: Some(profile.output_bytes_per_task),
            };
            let _ = events.send(SchedulerEvent::AttemptFinished(report)).await;
        });

        self.running.retain(|_, h| !h.is_finished());
        self.running.insert(attempt.clone(), handle);
        Ok(())
    }

    fn cancel(&mut self, attempt: &AttemptId) -> anyhow::Result<()> {
        if let Some(handle) = self.running.remove(attempt) {
            handle.abort();
            debug!(%attempt, "simulated attempt aborted");
        }
        Ok(())
    }
}

// ── Run ───────────────────────────────────────────────────────────

/// Run `scenario` to completion, failure or its time limit.
pub async fn run(config: SchedulerConfig, scenario: Scenario) -> anyhow::Result<SimulationReport> {
    let started = time::Instant::now();
    let (events_tx, events_rx) = mpsc::channel(1024);
    let backend = SimulatedBackend::new(events_tx, &scenario);
    let scheduler = AdaptiveScheduler::submit(
        config,
        scenario.job.clone(),
        Box::new(backend),
        started.into_std(),
    )?;

    let provider = ResourceProvider::new(scenario.cluster.view());
    let mut control = ControlLoop::new(scheduler, events_rx).with_resource_updates(provider.subscribe());

    let changes = scenario.resource_changes.clone();
    tokio::spawn(async move {
        for change in changes {
            time::sleep_until(started + Duration::from_secs(change.at_secs)).await;
            let view = change.cluster.view();
            info!(at_secs = change.at_secs, slots = view.slot_count(), "cluster changed");
            provider.publish(view);
        }
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let limit = Duration::from_secs(scenario.time_limit_secs);
    tokio::spawn(async move {
        time::sleep(limit).await;
        info!(limit_secs = limit.as_secs(), "time limit reached");
        let _ = shutdown_tx.send(true);
    });

    let result = control.run(shutdown_rx).await;
    let simulated_secs = started.elapsed().as_secs_f64();
    let summary = control.scheduler().summary();
    Ok(SimulationReport {
        simulated_secs,
        error: result.err().map(|e| e.to_string()),
        summary,
    })
}

pub fn format_report(report: &SimulationReport) -> String {
    let summary = &report.summary;
    let mut out = String::new();
    let _ = writeln!(out, "Job: {} ({:?})", summary.job, summary.status);
    let _ = writeln!(out, "Simulated time: {:.1}s", report.simulated_secs);
    let _ = writeln!(
        out,
        "Slots: {}  Rescales: {}  Speculative launches: {}",
        summary.slots, summary.rescales, summary.speculative_launches
    );
    if let Some(error) = &report.error {
        let _ = writeln!(out, "Error: {error}");
    }
    let _ = writeln!(out);
    let _ = writeln!(
        out,
        "  {:<20} {:>4} {:>11} {:>8} {:>8} {:>11} {:>10}",
        "VERTEX", "GEN", "PARALLELISM", "FINISHED", "ATTEMPTS", "SPECULATIVE", "OUTPUT"
    );
    for v in &summary.vertices {
        let _ = writeln!(
            out,
            "  {:<20} {:>4} {:>11} {:>8} {:>8} {:>11} {:>10}",
            v.vertex,
            v.generation,
            v.parallelism,
            v.finished_tasks,
            v.attempts,
            format!("{}/{}", v.speculative_wins, v.speculative_attempts),
            format_bytes(v.output_bytes),
        );
    }
    out
}
