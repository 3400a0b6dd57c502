//! ControlLoop — runs one job's scheduler on a single tokio task.
//!
//! Attempt reports and resource changes arrive over channels, the straggler
//! detector and the rescale poll run on their own intervals, and all of
//! them are handled one at a time against the same [`AdaptiveScheduler`].
//! This is the only place that reads the clock.

use std::future::Future;
use std::pin::Pin;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, watch};
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info, warn};

use ebb_resources::ResourceView;
use ebb_rescale::ScaleRequest;

use crate::error::{SchedulerError, SchedulerResult};
use crate::event::SchedulerEvent;
use crate::scheduler::{AdaptiveScheduler, JobStatus};

/// Boxed future returned by a [`ScaleCallback`].
pub type BoxFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;

/// Performs the external restart for a scale request. Once the restart is
/// done the callback's owner sends [`SchedulerEvent::ApplyScale`].
pub type ScaleCallback = Box<dyn Fn(ScaleRequest) -> BoxFuture + Send + Sync>;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

pub struct ControlLoop {
    scheduler: AdaptiveScheduler,
    events: mpsc::Receiver<SchedulerEvent>,
    views: Option<watch::Receiver<ResourceView>>,
    scale_fn: Option<ScaleCallback>,
    poll_interval: Duration,
}

impl ControlLoop {
    pub fn new(scheduler: AdaptiveScheduler, events: mpsc::Receiver<SchedulerEvent>) -> Self {
        Self {
            scheduler,
            events,
            views: None,
            scale_fn: None,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Follow a Resource View provider. The current view is applied when
    /// the loop starts.
    pub fn with_resource_updates(mut self, views: watch::Receiver<ResourceView>) -> Self {
        self.views = Some(views);
        self
    }

    /// Hand scale requests to `scale_fn` instead of applying them in place.
    pub fn with_scale_fn(mut self, scale_fn: ScaleCallback) -> Self {
        self.scale_fn = Some(scale_fn);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn scheduler(&self) -> &AdaptiveScheduler {
        &self.scheduler
    }

    pub fn into_scheduler(self) -> AdaptiveScheduler {
        self.scheduler
    }

    /// Run until the job finishes or fails, the event channel closes, or
    /// `shutdown` fires. Fatal scheduling errors end the loop with `Err`.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> SchedulerResult<JobStatus> {
        let check_interval = self.scheduler.config().slow_task_detector.check_interval;
        let mut detector = time::interval(check_interval);
        detector.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut poll = time::interval(self.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            job = %self.scheduler.job().name,
            check_interval_ms = check_interval.as_millis() as u64,
            poll_interval_ms = self.poll_interval.as_millis() as u64,
            "control loop started"
        );

        if let Some(views) = self.views.as_mut() {
            let view = views.borrow_and_update().clone();
            self.on_view(view).await?;
        }

        while !self.scheduler.status().is_terminal() {
            tokio::select! {
                event = self.events.recv() => match event {
                    Some(event) => self.handle_event(event).await?,
                    None => {
                        info!("event channel closed, control loop stopping");
                        break;
                    }
                },
                _ = detector.tick() => {
                    let launched = self.scheduler.on_tick(now())?;
                    if !launched.is_empty() {
                        debug!(launched = launched.len(), "speculative attempts deployed");
                    }
                }
                _ = poll.tick() => {
                    let request = self.scheduler.poll(now())?;
                    self.dispatch_scale(request).await?;
                }
                view = next_view(&mut self.views) => match view {
                    Some(view) => self.on_view(view).await?,
                    None => {
                        debug!("resource provider closed");
                        self.views = None;
                    }
                },
                _ = shutdown.changed() => {
                    info!("control loop shutting down");
                    break;
                }
            }
        }

        let status = self.scheduler.status();
        info!(?status, "control loop stopped");
        Ok(status)
    }

    async fn handle_event(&mut self, event: SchedulerEvent) -> SchedulerResult<()> {
        let now = now();
        debug!(kind = event.kind(), "event received");
        let result = match event {
            SchedulerEvent::AttemptRunning(attempt) => self.scheduler.on_attempt_running(&attempt, now),
            SchedulerEvent::AttemptProgress {
                attempt,
                input_bytes,
            } => self.scheduler.on_attempt_progress(&attempt, input_bytes),
            SchedulerEvent::AttemptFinished(report) => self.scheduler.on_attempt_finished(&report, now),
            SchedulerEvent::AttemptFailed(attempt) => self.scheduler.on_attempt_failed(&attempt, now),
            SchedulerEvent::ResourcesChanged(view) => return self.on_view(view).await,
            SchedulerEvent::ApplyScale(request) => self.scheduler.apply_scale(&request, now),
        };
        match result {
            // A report for an attempt this job never created.
            Err(SchedulerError::State(e)) => {
                warn!(error = %e, "report rejected");
                Ok(())
            }
            other => other,
        }
    }

    async fn on_view(&mut self, view: ResourceView) -> SchedulerResult<()> {
        let request = self.scheduler.on_resource_changed(view, now())?;
        self.dispatch_scale(request).await
    }

    async fn dispatch_scale(&mut self, request: Option<ScaleRequest>) -> SchedulerResult<()> {
        let Some(request) = request else {
            return Ok(());
        };
        match &self.scale_fn {
            None => self.scheduler.apply_scale(&request, now()),
            Some(scale_fn) => {
                // The request stays pending until ApplyScale arrives.
                if let Err(e) = scale_fn(request.clone()).await {
                    warn!(reason = %request.reason, error = %e, "scale callback failed");
                }
                Ok(())
            }
        }
    }
}

async fn next_view(views: &mut Option<watch::Receiver<ResourceView>>) -> Option<ResourceView> {
    let Some(rx) = views.as_mut() else {
        return std::future::pending().await;
    };
    match rx.changed().await {
        Ok(()) => Some(rx.borrow_and_update().clone()),
        Err(_) => None,
    }
}

fn now() -> Instant {
    time::Instant::now().into_std()
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use ebb_core::{ExchangeMode, JobGraph, JobVertex, NodeId, SchedulerConfig};
    use ebb_resources::{MiniCluster, ResourceProvider};
    use ebb_state::AttemptId;

    use super::*;
    use crate::backend::ExecutionBackend;
    use crate::event::FinishedReport;

    /// Reports RUNNING right away and FINISHED after `duration`.
    struct TimedBackend {
        events: mpsc::Sender<SchedulerEvent>,
        duration: Duration,
        deployed: Arc<Mutex<Vec<AttemptId>>>,
    }

    impl ExecutionBackend for TimedBackend {
        fn deploy(&mut self, attempt: &AttemptId, _node: &NodeId) -> anyhow::Result<()> {
            self.deployed.lock().unwrap().push(attempt.clone());
            let events = self.events.clone();
            let attempt = attempt.clone();
            let duration = self.duration;
            tokio::spawn(async move {
                let _ = events.send(SchedulerEvent::AttemptRunning(attempt.clone())).await;
                time::sleep(duration).await;
                let report = FinishedReport {
                    attempt,
                    input_bytes: Some(1024),
                    output_bytes: Some(1024),
                };
                let _ = events.send(SchedulerEvent::AttemptFinished(report)).await;
            });
            Ok(())
        }

        fn cancel(&mut self, _attempt: &AttemptId) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn setup(
        config: SchedulerConfig,
        job: JobGraph,
        duration: Duration,
    ) -> (ControlLoop, Arc<Mutex<Vec<AttemptId>>>) {
        let (tx, rx) = mpsc::channel(256);
        let deployed = Arc::new(Mutex::new(Vec::new()));
        let backend = TimedBackend {
            events: tx,
            duration,
            deployed: deployed.clone(),
        };
        let scheduler =
            AdaptiveScheduler::submit(config, job, Box::new(backend), now()).unwrap();
        (ControlLoop::new(scheduler, rx), deployed)
    }

    fn two_stage_job() -> JobGraph {
        JobGraph::new("wordcount")
            .vertex(JobVertex::new("source").with_parallelism(2))
            .vertex(JobVertex::new("sink"))
            .edge("source", "sink", ExchangeMode::Blocking)
    }

    #[tokio::test(start_paused = true)]
    async fn runs_a_blocking_job_to_completion() {
        let provider = ResourceProvider::new(MiniCluster::new(2, 2).view());
        let (control, deployed) = setup(SchedulerConfig::default(), two_stage_job(), Duration::from_secs(5));
        let mut control = control.with_resource_updates(provider.subscribe());
        let (_tx, shutdown) = watch::channel(false);

        let status = control.run(shutdown).await.unwrap();
        assert_eq!(status, JobStatus::Finished);
        // 2 source tasks, then 2KB of input at 16MB per task gives one sink task.
        assert_eq!(deployed.lock().unwrap().len(), 3);
        let summary = control.scheduler().summary();
        assert_eq!(summary.vertices[1].parallelism, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_stops_a_running_job() {
        let provider = ResourceProvider::new(MiniCluster::new(1, 2).view());
        let (control, _) = setup(SchedulerConfig::default(), two_stage_job(), Duration::from_secs(3600));
        let mut control = control.with_resource_updates(provider.subscribe());
        let (tx, shutdown) = watch::channel(false);

        let handle = tokio::spawn(async move {
            let status = control.run(shutdown).await;
            (status, control)
        });
        time::sleep(Duration::from_secs(10)).await;
        tx.send(true).unwrap();

        let (status, control) = handle.await.unwrap();
        assert_eq!(status.unwrap(), JobStatus::Running);
        assert_eq!(control.scheduler().graph().vertex("source").unwrap().parallelism, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn scale_requests_go_to_the_callback() {
        let mut config = SchedulerConfig::default();
        config.auto_parallelism.default_source_parallelism = Some(8);
        let job = JobGraph::new("elastic").vertex(JobVertex::new("source"));

        let provider = ResourceProvider::new(MiniCluster::new(1, 4).view());
        let (control, _) = setup(config, job, Duration::from_secs(3600));
        let (requests_tx, mut requests) = mpsc::unbounded_channel::<ScaleRequest>();
        let scale_fn: ScaleCallback = Box::new(move |request: ScaleRequest| -> BoxFuture {
            let requests_tx = requests_tx.clone();
            Box::pin(async move {
                requests_tx.send(request)?;
                Ok::<(), anyhow::Error>(())
            })
        });
        let mut control = control
            .with_resource_updates(provider.subscribe())
            .with_scale_fn(scale_fn);
        let (_tx, shutdown) = watch::channel(false);
        let handle = tokio::spawn(async move { control.run(shutdown).await });

        // Reduced start after the 10s stabilization timeout, then more slots.
        time::sleep(Duration::from_secs(20)).await;
        provider.publish(MiniCluster::new(2, 4).view());

        let request = requests.recv().await.unwrap();
        assert_eq!(request.plan.get("source"), Some(&8));
        handle.abort();
    }
}
