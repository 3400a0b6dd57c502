//! Straggler Detector.
//!
//! Nothing is carried between ticks: the baseline is recomputed from the
//! current generation's finished attempts every time, so a rescale can
//! never leave a stale baseline behind.

use std::time::{Duration, Instant};

use tracing::{debug, info};

use ebb_core::{NodeId, SchedulerConfig, SlowTaskDetectorConfig, VertexId, scale_duration};
use ebb_state::{AttemptId, ExecutionGraph, VertexExecution};

/// Execution-time baseline of one vertex.
#[derive(Debug, Clone, PartialEq)]
pub struct Baseline {
    pub vertex: VertexId,
    /// Weighted median of the sampled durations.
    pub median: Duration,
    /// `max(median * multiplier, lower bound)`.
    pub threshold: Duration,
    /// Mean input bytes of the sample, when every sampled attempt reported bytes.
    pub average_input_bytes: Option<u64>,
    pub sample_size: usize,
}

/// A running attempt past its threshold.
#[derive(Debug, Clone, PartialEq)]
pub struct SlowAttempt {
    pub attempt: AttemptId,
    pub node_id: NodeId,
    pub elapsed: Duration,
    pub threshold: Duration,
}

/// Weighted median over `(duration, weight)` pairs: sort by duration and
/// return the first duration at which the cumulative weight covers half of
/// the total. `None` for an empty or weightless sample.
pub fn weighted_median(samples: &mut [(Duration, u64)]) -> Option<Duration> {
    samples.sort_by_key(|(d, _)| *d);
    let total: u128 = samples.iter().map(|(_, w)| u128::from(*w)).sum();
    if total == 0 {
        return None;
    }
    let mut covered: u128 = 0;
    for (duration, weight) in samples.iter() {
        covered += u128::from(*weight);
        if covered * 2 >= total {
            return Some(*duration);
        }
    }
    samples.last().map(|(d, _)| *d)
}

#[derive(Debug, Clone)]
pub struct StragglerDetector {
    enabled: bool,
    config: SlowTaskDetectorConfig,
}

impl StragglerDetector {
    pub fn new(config: &SchedulerConfig) -> Self {
        Self {
            enabled: config.speculative.enabled,
            config: config.slow_task_detector.clone(),
        }
    }

    pub fn check_interval(&self) -> Duration {
        self.config.check_interval
    }

    /// `max(1, round(parallelism * baseline-ratio))`
    pub fn sample_size(&self, parallelism: u32) -> usize {
        let n = (f64::from(parallelism) * self.config.baseline_ratio).round() as usize;
        n.max(1)
    }

    /// Baseline from the first finishers of the vertex, or `None` while too
    /// few task instances have finished.
    pub fn baseline(&self, vertex: &VertexExecution) -> Option<Baseline> {
        let n = self.sample_size(vertex.parallelism);
        let winners = vertex.winners_by_end_time();
        if winners.len() < n {
            return None;
        }

        let sample: Vec<(Duration, Option<u64>)> = winners[..n]
            .iter()
            .filter_map(|a| a.duration().map(|d| (d, a.input_bytes)))
            .collect();
        if sample.is_empty() {
            return None;
        }

        let weighted_by_bytes = sample.iter().all(|(_, b)| b.is_some_and(|b| b > 0));
        let mut pairs: Vec<(Duration, u64)> = sample
            .iter()
            .map(|(d, b)| (*d, if weighted_by_bytes { b.unwrap_or(1) } else { 1 }))
            .collect();
        let median = weighted_median(&mut pairs)?;

        let average_input_bytes = weighted_by_bytes.then(|| {
            let total: u128 = pairs.iter().map(|(_, w)| u128::from(*w)).sum();
            u64::try_from(total / pairs.len() as u128).unwrap_or(u64::MAX)
        });
        let threshold = scale_duration(median, self.config.baseline_multiplier)
            .max(self.config.baseline_lower_bound);

        Some(Baseline {
            vertex: vertex.vertex_id.clone(),
            median,
            threshold,
            average_input_bytes,
            sample_size: pairs.len(),
        })
    }

    /// Running attempts of `vertex` whose elapsed time exceeds the baseline.
    ///
    /// An attempt that has processed more input than the sample average gets
    /// a proportionally longer threshold.
    pub fn detect_vertex(&self, vertex: &VertexExecution, now: Instant) -> Vec<SlowAttempt> {
        if vertex.running_attempts().next().is_none() {
            return Vec::new();
        }
        let Some(baseline) = self.baseline(vertex) else {
            return Vec::new();
        };
        debug!(
            vertex = %baseline.vertex,
            median_secs = baseline.median.as_secs_f64(),
            threshold_secs = baseline.threshold.as_secs_f64(),
            sample = baseline.sample_size,
            "baseline computed"
        );

        vertex
            .running_attempts()
            .filter_map(|attempt| {
                let elapsed = attempt.elapsed(now)?;
                let threshold = match (attempt.input_bytes, baseline.average_input_bytes) {
                    (Some(bytes), Some(avg)) if avg > 0 && bytes > avg => {
                        scale_duration(baseline.threshold, bytes as f64 / avg as f64)
                    }
                    _ => baseline.threshold,
                };
                (elapsed > threshold).then(|| SlowAttempt {
                    attempt: attempt.id.clone(),
                    node_id: attempt.node_id.clone(),
                    elapsed,
                    threshold,
                })
            })
            .collect()
    }

    /// One detector tick over every vertex. Yields nothing while speculative
    /// execution is disabled.
    pub fn detect(&self, graph: &ExecutionGraph, now: Instant) -> Vec<SlowAttempt> {
        if !self.enabled {
            return Vec::new();
        }
        let slow: Vec<SlowAttempt> = graph
            .vertices()
            .filter(|v| !v.is_finished())
            .flat_map(|v| self.detect_vertex(v, now))
            .collect();
        for s in &slow {
            info!(
                attempt = %s.attempt,
                node = %s.node_id,
                elapsed_secs = s.elapsed.as_secs_f64(),
                threshold_secs = s.threshold.as_secs_f64(),
                "slow attempt detected"
            );
        }
        slow
    }
}
