//! Parallelism Inference Engine.
//!
//! Rules, in order:
//!
//! 1. A vertex with fixed parallelism keeps it.
//! 2. With auto-parallelism disabled, the job default is used.
//! 3. Source vertices take `default-source-parallelism`, else the configured
//!    `max-parallelism`, else the job default.
//! 4. Downstream vertices take `ceil(bytes / avg-data-volume-per-task)` over
//!    the statistics of their BLOCKING and HYBRID inputs, raised to any
//!    hybrid parallelism estimate. Without statistics the job default is used.
//!
//! Every automatic result is clamped into the vertex bounds.

use std::fmt;

use tracing::debug;

use ebb_core::{
    AutoParallelismConfig, ConfigError, ExchangeMode, JobVertex, SchedulerConfig, VertexId,
};
use ebb_resources::ResourceView;

use crate::hybrid::{HybridEstimate, HybridStatisticsPolicy, policy_for};
use crate::stats::InputStatistics;

/// Inclusive parallelism range for one vertex.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VertexBounds {
    pub min: u32,
    pub max: u32,
}

impl VertexBounds {
    pub fn clamp(self, target: u32) -> u32 {
        target.max(self.min).min(self.max)
    }

    pub fn contains(self, parallelism: u32) -> bool {
        (self.min..=self.max).contains(&parallelism)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecisionReason {
    Fixed,
    AutoParallelismDisabled,
    SourceDefault,
    SourceMax,
    JobDefault,
    DataVolume { bytes: u64 },
    HybridEstimate { bytes: u64, estimate: u32 },
    NoStatistics,
}

impl fmt::Display for DecisionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fixed => f.write_str("fixed"),
            Self::AutoParallelismDisabled => f.write_str("auto-parallelism disabled"),
            Self::SourceDefault => f.write_str("default source parallelism"),
            Self::SourceMax => f.write_str("max parallelism"),
            Self::JobDefault => f.write_str("job default"),
            Self::DataVolume { bytes } => write!(f, "{bytes} input bytes"),
            Self::HybridEstimate { bytes, estimate } => {
                write!(f, "{bytes} input bytes, hybrid estimate {estimate}")
            }
            Self::NoStatistics => f.write_str("no upstream statistics"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParallelismDecision {
    pub vertex: VertexId,
    pub parallelism: u32,
    pub reason: DecisionReason,
}

pub struct ParallelismDecider {
    auto: AutoParallelismConfig,
    default_parallelism: u32,
    policy: Box<dyn HybridStatisticsPolicy>,
}

impl fmt::Debug for ParallelismDecider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParallelismDecider")
            .field("auto", &self.auto)
            .field("default_parallelism", &self.default_parallelism)
            .field("policy", &self.policy.name())
            .finish()
    }
}

impl ParallelismDecider {
    pub fn new(config: &SchedulerConfig) -> Self {
        Self {
            auto: config.auto_parallelism.clone(),
            default_parallelism: config.default_parallelism,
            policy: policy_for(config.auto_parallelism.hybrid_partial_statistics),
        }
    }

    /// Replace the hybrid partial-statistics policy.
    pub fn with_policy(mut self, policy: Box<dyn HybridStatisticsPolicy>) -> Self {
        self.policy = policy;
        self
    }

    pub fn bounds(&self, vertex: &JobVertex) -> VertexBounds {
        VertexBounds {
            min: vertex.min_parallelism.unwrap_or(self.auto.min_parallelism),
            max: vertex.max_parallelism.unwrap_or_else(|| self.auto.upper_bound()),
        }
    }

    /// Reject vertices whose bounds or fixed parallelism cannot be honoured.
    pub fn validate_vertex(&self, vertex: &JobVertex) -> Result<(), ConfigError> {
        let bounds = self.bounds(vertex);
        if bounds.min == 0 {
            return Err(ConfigError::ZeroParallelism {
                key: "min-parallelism",
            });
        }
        if bounds.min > bounds.max {
            return Err(ConfigError::InvertedBounds {
                scope: format!("vertex {}", vertex.id),
                min: bounds.min,
                max: bounds.max,
            });
        }
        if let Some(p) = vertex.parallelism {
            if !bounds.contains(p) {
                return Err(ConfigError::FixedParallelismOutOfBounds {
                    vertex: vertex.id.clone(),
                    parallelism: p,
                    min: bounds.min,
                    max: bounds.max,
                });
            }
        }
        Ok(())
    }

    /// Whether the vertex may be rescaled at all.
    pub fn is_elastic(&self, vertex: &JobVertex) -> bool {
        vertex.parallelism.is_none() && self.auto.enabled
    }

    /// Target parallelism for `vertex` given its input statistics.
    /// An empty `inputs` slice marks a source vertex.
    pub fn decide(&self, vertex: &JobVertex, inputs: &[InputStatistics]) -> ParallelismDecision {
        let decision = |parallelism, reason| ParallelismDecision {
            vertex: vertex.id.clone(),
            parallelism,
            reason,
        };

        if let Some(p) = vertex.parallelism {
            return decision(p, DecisionReason::Fixed);
        }

        let bounds = self.bounds(vertex);
        if !self.auto.enabled {
            return decision(
                bounds.clamp(self.default_parallelism),
                DecisionReason::AutoParallelismDisabled,
            );
        }

        if inputs.is_empty() {
            let (target, reason) = match (self.auto.default_source_parallelism, self.auto.max_parallelism) {
                (Some(p), _) => (p, DecisionReason::SourceDefault),
                (None, Some(max)) => (max, DecisionReason::SourceMax),
                (None, None) => (self.default_parallelism, DecisionReason::JobDefault),
            };
            return decision(bounds.clamp(target), reason);
        }

        let mut bytes: u64 = 0;
        let mut estimate: u32 = 0;
        let mut has_statistics = false;
        for input in inputs {
            match input.exchange {
                ExchangeMode::Pipelined => {}
                ExchangeMode::Blocking => {
                    has_statistics = true;
                    bytes = bytes.saturating_add(input.produced_bytes);
                }
                ExchangeMode::Hybrid if input.is_complete() => {
                    has_statistics = true;
                    bytes = bytes.saturating_add(input.produced_bytes);
                }
                ExchangeMode::Hybrid => {
                    has_statistics = true;
                    match self.policy.estimate(input) {
                        HybridEstimate::Bytes(b) => bytes = bytes.saturating_add(b),
                        HybridEstimate::Parallelism(p) => estimate = estimate.max(p),
                    }
                }
            }
        }

        if !has_statistics {
            return decision(
                bounds.clamp(self.default_parallelism),
                DecisionReason::NoStatistics,
            );
        }

        let by_volume = bytes.div_ceil(self.auto.avg_data_volume_per_task.max(1));
        let by_volume = u32::try_from(by_volume).unwrap_or(u32::MAX);
        let reason = if estimate > by_volume {
            DecisionReason::HybridEstimate { bytes, estimate }
        } else {
            DecisionReason::DataVolume { bytes }
        };
        decision(bounds.clamp(by_volume.max(estimate)), reason)
    }

    /// Decide and bound the result by the slots of `available`, never going
    /// below the vertex minimum. Fixed and static parallelism are not bounded.
    pub fn decide_parallelism(
        &self,
        vertex: &JobVertex,
        inputs: &[InputStatistics],
        available: Option<&ResourceView>,
    ) -> u32 {
        let decision = self.decide(vertex, inputs);
        let parallelism = match (available, decision.reason) {
            (_, DecisionReason::Fixed | DecisionReason::AutoParallelismDisabled) => decision.parallelism,
            (Some(view), _) => {
                let bounds = self.bounds(vertex);
                decision.parallelism.min(view.slot_count()).max(bounds.min)
            }
            (None, _) => decision.parallelism,
        };
        debug!(
            vertex = %vertex.id,
            parallelism,
            reason = %decision.reason,
            "parallelism decided"
        );
        parallelism
    }
}
