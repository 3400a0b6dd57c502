//! Speculative Execution Manager.
//!
//! Turns detector flags into slow-node blocks and placement decisions for
//! duplicate attempts. The manager does not mutate the execution graph; the
//! scheduler creates and deploys the attempts it returns. Winner selection
//! and sibling cancellation happen when an attempt reports FINISHED.

use std::collections::{BTreeSet, HashMap};
use std::time::{Duration, Instant};

use tracing::{debug, info};

use ebb_core::{LoadBalanceMode, NodeId, SchedulerConfig, VertexId};
use ebb_resources::{PlacementRequest, ResourceView, SlowNodeRegistry, node_loads, select_node};
use ebb_state::ExecutionGraph;

use crate::detector::SlowAttempt;

/// One speculative attempt to create.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpeculativeLaunch {
    pub vertex: VertexId,
    pub subtask: u32,
    pub generation: u32,
    pub node_id: NodeId,
}

/// Task instance awaiting a speculative slot.
pub type TaskKey = (VertexId, u32, u32);

#[derive(Debug, Clone)]
pub struct SpeculativeExecutionManager {
    enabled: bool,
    max_concurrent: u32,
    block_duration: Duration,
    mode: LoadBalanceMode,
    deferred: BTreeSet<TaskKey>,
}

impl SpeculativeExecutionManager {
    pub fn new(config: &SchedulerConfig) -> Self {
        Self {
            enabled: config.speculative.enabled,
            max_concurrent: config.speculative.max_concurrent_executions,
            block_duration: config.speculative.block_slow_node_duration,
            mode: config.load_balance,
            deferred: BTreeSet::new(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn max_concurrent_executions(&self) -> u32 {
        self.max_concurrent
    }

    /// Task instances still waiting for an eligible node.
    pub fn deferred(&self) -> impl Iterator<Item = &TaskKey> {
        self.deferred.iter()
    }

    /// Handle one tick's flagged attempts together with earlier deferrals.
    ///
    /// Every flagged attempt's node is blocked. Each affected task instance
    /// then gets at most one new attempt, and only while it has fewer than
    /// `max-concurrent-executions` active attempts.
    pub fn on_slow_attempts(
        &mut self,
        slow: &[SlowAttempt],
        graph: &ExecutionGraph,
        view: &ResourceView,
        registry: &mut SlowNodeRegistry,
        now: Instant,
    ) -> Vec<SpeculativeLaunch> {
        if !self.enabled {
            return Vec::new();
        }

        for s in slow {
            registry.block(&s.node_id, now, self.block_duration);
        }

        let mut tasks: BTreeSet<TaskKey> = std::mem::take(&mut self.deferred);
        tasks.extend(
            slow.iter()
                .map(|s| (s.attempt.vertex.clone(), s.attempt.subtask, s.attempt.generation)),
        );

        let mut active: HashMap<NodeId, u32> = graph.active_attempts_per_node();
        let mut launches: Vec<SpeculativeLaunch> = Vec::new();
        for (vertex, subtask, generation) in tasks {
            let Some(execution) = graph.vertex(&vertex) else {
                continue;
            };
            if execution.generation != generation {
                continue;
            }
            let Some(task) = execution.tasks.get(subtask as usize) else {
                continue;
            };
            if task.is_finished() || task.active_count() >= self.max_concurrent {
                continue;
            }

            let siblings = task.active_nodes();
            let mut vertex_active = graph.vertex_attempts_per_node(&vertex);
            for launch in launches.iter().filter(|l| l.vertex == vertex) {
                *vertex_active.entry(launch.node_id.clone()).or_insert(0) += 1;
            }
            let loads = node_loads(view, &active, &vertex_active, registry, now);
            let request = PlacementRequest {
                mode: self.mode,
                avoid: &siblings,
            };
            match select_node(&loads, &request) {
                Some(node_id) => {
                    *active.entry(node_id.clone()).or_insert(0) += 1;
                    info!(%vertex, subtask, node = %node_id, "speculative attempt scheduled");
                    launches.push(SpeculativeLaunch {
                        vertex,
                        subtask,
                        generation,
                        node_id,
                    });
                }
                None => {
                    debug!(%vertex, subtask, "no eligible node for speculative attempt, deferring");
                    self.deferred.insert((vertex, subtask, generation));
                }
            }
        }
        launches
    }
}

#[cfg(test)]
mod tests {
    use ebb_state::AttemptId;

    use super::*;

    fn config(max_concurrent: u32) -> SchedulerConfig {
        let mut config = SchedulerConfig::default();
        config.speculative.enabled = true;
        config.speculative.max_concurrent_executions = max_concurrent;
        config
    }

    fn flag(id: &AttemptId, node: &str) -> SlowAttempt {
        SlowAttempt {
            attempt: id.clone(),
            node_id: node.to_string(),
            elapsed: Duration::from_secs(90),
            threshold: Duration::from_secs(60),
        }
    }

    fn running(graph: &mut ExecutionGraph, subtask: u32, node: &str, t0: Instant) -> AttemptId {
        let id = graph.add_attempt("map", subtask, node, false, t0).unwrap();
        graph.mark_running(&id, t0).unwrap();
        id
    }

    #[test]
    fn blocks_node_and_launches_elsewhere() {
        let t0 = Instant::now();
        let mut graph = ExecutionGraph::new();
        graph.start_generation("map", 2, t0).unwrap();
        let slow = running(&mut graph, 0, "tm-0", t0);
        running(&mut graph, 1, "tm-1", t0);

        let view = ResourceView::empty()
            .with_node("tm-0", 2, 1.0, 0)
            .with_node("tm-1", 2, 1.0, 0);
        let mut registry = SlowNodeRegistry::new();
        let mut manager = SpeculativeExecutionManager::new(&config(2));

        let launches = manager.on_slow_attempts(&[flag(&slow, "tm-0")], &graph, &view, &mut registry, t0);
        assert!(registry.is_blocked("tm-0", t0));
        assert_eq!(
            launches,
            vec![SpeculativeLaunch {
                vertex: "map".to_string(),
                subtask: 0,
                generation: 1,
                node_id: "tm-1".to_string(),
            }]
        );
    }

    #[test]
    fn duplicate_flags_produce_one_launch_per_task() {
        let t0 = Instant::now();
        let mut graph = ExecutionGraph::new();
        graph.start_generation("map", 1, t0).unwrap();
        let a = running(&mut graph, 0, "tm-0", t0);
        let b = graph.add_attempt("map", 0, "tm-1", true, t0).unwrap();
        graph.mark_running(&b, t0).unwrap();

        let view = ResourceView::empty()
            .with_node("tm-0", 1, 1.0, 0)
            .with_node("tm-1", 1, 1.0, 0)
            .with_node("tm-2", 1, 1.0, 0);
        let mut registry = SlowNodeRegistry::new();
        let mut manager = SpeculativeExecutionManager::new(&config(3));

        let launches = manager.on_slow_attempts(
            &[flag(&a, "tm-0"), flag(&b, "tm-1")],
            &graph,
            &view,
            &mut registry,
            t0,
        );
        assert_eq!(launches.len(), 1);
        assert_eq!(launches[0].node_id, "tm-2");
    }

    #[test]
    fn respects_concurrency_cap() {
        let t0 = Instant::now();
        let mut graph = ExecutionGraph::new();
        graph.start_generation("map", 1, t0).unwrap();
        let a = running(&mut graph, 0, "tm-0", t0);
        let b = graph.add_attempt("map", 0, "tm-1", true, t0).unwrap();

        let view = ResourceView::empty().with_node("tm-2", 4, 1.0, 0);
        let mut registry = SlowNodeRegistry::new();
        let mut manager = SpeculativeExecutionManager::new(&config(2));

        let launches = manager.on_slow_attempts(&[flag(&a, "tm-0")], &graph, &view, &mut registry, t0);
        assert!(launches.is_empty());
        assert_eq!(manager.deferred().count(), 0);
        assert!(graph.attempt(&b).is_some());
    }

    #[test]
    fn defers_when_no_node_is_eligible_and_retries_later() {
        let t0 = Instant::now();
        let mut graph = ExecutionGraph::new();
        graph.start_generation("map", 1, t0).unwrap();
        let a = running(&mut graph, 0, "tm-0", t0);

        let view = ResourceView::empty().with_node("tm-0", 4, 1.0, 0);
        let mut registry = SlowNodeRegistry::new();
        let mut manager = SpeculativeExecutionManager::new(&config(2));

        let launches = manager.on_slow_attempts(&[flag(&a, "tm-0")], &graph, &view, &mut registry, t0);
        assert!(launches.is_empty());
        assert_eq!(manager.deferred().count(), 1);

        let grown = view.clone().with_node("tm-1", 1, 1.0, 0);
        let later = t0 + Duration::from_secs(1);
        let launches = manager.on_slow_attempts(&[], &graph, &grown, &mut registry, later);
        assert_eq!(launches.len(), 1);
        assert_eq!(launches[0].node_id, "tm-1");
        assert_eq!(manager.deferred().count(), 0);
    }

    #[test]
    fn disabled_manager_ignores_flags() {
        let t0 = Instant::now();
        let mut graph = ExecutionGraph::new();
        graph.start_generation("map", 1, t0).unwrap();
        let a = running(&mut graph, 0, "tm-0", t0);
        let view = ResourceView::empty().with_node("tm-1", 1, 1.0, 0);
        let mut registry = SlowNodeRegistry::new();
        let mut manager = SpeculativeExecutionManager::new(&SchedulerConfig::default());

        assert!(manager
            .on_slow_attempts(&[flag(&a, "tm-0")], &graph, &view, &mut registry, t0)
            .is_empty());
        assert!(registry.is_empty());
    }
}
