//! Dry-run planning: what a job would ask for before anything runs.

use std::fmt::Write as _;
use std::time::Instant;

use serde::Serialize;

use ebb_core::{JobGraph, SchedulerConfig, format_bytes};
use ebb_parallelism::ParallelismDecider;
use ebb_resources::{MiniCluster, ResourceView};
use ebb_scheduler::{AdaptiveScheduler, NoopBackend};

#[derive(Debug, Clone, Serialize)]
pub struct JobPlan {
    pub job: String,
    /// Slots offered to the plan, if any.
    pub slots: Option<u32>,
    /// Slots needed before the job can start at all.
    pub required_slots: u32,
    /// Slots the sources would use at their unbounded parallelism.
    pub desired_slots: u32,
    pub avg_data_volume_per_task: u64,
    pub vertices: Vec<VertexPlan>,
}

#[derive(Debug, Clone, Serialize)]
pub struct VertexPlan {
    pub vertex: String,
    pub source: bool,
    pub elastic: bool,
    pub min: u32,
    pub max: u32,
    /// `None` when the parallelism depends on upstream statistics.
    pub parallelism: Option<u32>,
    pub inputs: Vec<String>,
}

/// Plan `job` against `slots` identical slots, or against unlimited
/// resources when `slots` is `None`.
pub fn plan(config: SchedulerConfig, job: JobGraph, slots: Option<u32>) -> anyhow::Result<JobPlan> {
    let decider = ParallelismDecider::new(&config);
    let avg_data_volume_per_task = config.auto_parallelism.avg_data_volume_per_task;
    let scheduler = AdaptiveScheduler::submit(config, job, Box::new(NoopBackend), Instant::now())?;
    let view: Option<ResourceView> = slots.map(|n| MiniCluster::new(1, n).view());

    let mut desired_slots = 0;
    let mut vertices = Vec::new();
    for vertex in scheduler.job().topological_order()? {
        let source = scheduler.job().is_source(&vertex.id);
        let bounds = decider.bounds(vertex);
        if source {
            desired_slots = desired_slots.max(scheduler.decide_parallelism(&vertex.id, None)?);
        }
        let parallelism = if source || vertex.parallelism.is_some() {
            Some(scheduler.decide_parallelism(&vertex.id, view.as_ref())?)
        } else {
            None
        };
        vertices.push(VertexPlan {
            vertex: vertex.id.clone(),
            source,
            elastic: decider.is_elastic(vertex),
            min: bounds.min,
            max: bounds.max,
            parallelism,
            inputs: scheduler
                .job()
                .inputs_of(&vertex.id)
                .map(|e| format!("{} ({:?})", e.source, e.exchange))
                .collect(),
        });
    }

    Ok(JobPlan {
        job: scheduler.job().name.clone(),
        slots,
        required_slots: scheduler.controller().required_slots(),
        desired_slots,
        avg_data_volume_per_task,
        vertices,
    })
}

pub fn format_plan(plan: &JobPlan) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Job: {}", plan.job);
    match plan.slots {
        Some(slots) => {
            let _ = writeln!(
                out,
                "Slots: {slots} offered, {} required, {} desired",
                plan.required_slots, plan.desired_slots
            );
        }
        None => {
            let _ = writeln!(
                out,
                "Slots: {} required, {} desired",
                plan.required_slots, plan.desired_slots
            );
        }
    }
    let _ = writeln!(
        out,
        "Data volume per task: {}",
        format_bytes(plan.avg_data_volume_per_task)
    );
    let _ = writeln!(out);
    for v in &plan.vertices {
        let parallelism = match v.parallelism {
            Some(p) => p.to_string(),
            None => "runtime".to_string(),
        };
        let kind = if v.source { "source" } else { "vertex" };
        let _ = writeln!(
            out,
            "  {:<20} {:<6} parallelism {:<8} bounds [{}, {}]{}",
            v.vertex,
            kind,
            parallelism,
            v.min,
            v.max,
            if v.elastic { "" } else { " fixed" },
        );
        for input in &v.inputs {
            let _ = writeln!(out, "      <- {input}");
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use ebb_core::{ExchangeMode, JobVertex};

    use super::*;

    fn job() -> JobGraph {
        JobGraph::new("wordcount")
            .vertex(JobVertex::new("source"))
            .vertex(JobVertex::new("aggregate"))
            .vertex(JobVertex::new("sink").with_parallelism(2))
            .edge("source", "aggregate", ExchangeMode::Blocking)
            .edge("aggregate", "sink", ExchangeMode::Blocking)
    }

    #[test]
    fn sources_get_a_parallelism_and_the_rest_wait_for_statistics() {
        let mut config = SchedulerConfig::default();
        config.auto_parallelism.default_source_parallelism = Some(16);
        let plan = plan(config, job(), Some(4)).unwrap();

        assert_eq!(plan.required_slots, 1);
        assert_eq!(plan.desired_slots, 16);
        let source = &plan.vertices[0];
        assert!(source.source);
        assert_eq!(source.parallelism, Some(4));
        assert_eq!(plan.vertices[1].parallelism, None);
        assert_eq!(plan.vertices[2].parallelism, Some(2));
        assert!(!plan.vertices[2].elastic);
        assert_eq!(plan.vertices[2].inputs, vec!["aggregate (Blocking)".to_string()]);
    }

    #[test]
    fn unlimited_slots_keep_the_desired_parallelism() {
        let mut config = SchedulerConfig::default();
        config.auto_parallelism.default_source_parallelism = Some(16);
        let plan = plan(config, job(), None).unwrap();
        assert_eq!(plan.vertices[0].parallelism, Some(16));

        let text = format_plan(&plan);
        assert!(text.contains("Job: wordcount"));
        assert!(text.contains("Slots: 1 required, 16 desired"));
        assert!(text.contains("runtime"));
    }

    #[test]
    fn cyclic_jobs_are_rejected() {
        let job = JobGraph::new("loop")
            .vertex(JobVertex::new("a"))
            .vertex(JobVertex::new("b"))
            .edge("a", "b", ExchangeMode::Blocking)
            .edge("b", "a", ExchangeMode::Blocking);
        assert!(plan(SchedulerConfig::default(), job, None).is_err());
    }
}
