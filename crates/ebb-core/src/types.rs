//! Shared identifiers and option enums.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Identifier of a job vertex (one computation stage).
pub type VertexId = String;

/// Identifier of a worker node hosting slots.
pub type NodeId = String;

/// How data moves across a job edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExchangeMode {
    /// Producer and consumer run together; no statistics before the consumer starts.
    Pipelined,
    /// Consumer starts only after every producer task finished.
    Blocking,
    /// Consumer may read produced data before the producer finishes.
    Hybrid,
}

/// When a consumer of a hybrid edge may be scheduled
/// (`jobmanager.partition.hybrid.partition-data-consume-constraint`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConsumeConstraint {
    AllProducersFinished,
    OnlyFinishedProducers,
    #[default]
    UnfinishedProducers,
}

impl ConsumeConstraint {
    /// Whether a consumer must wait for every producer task to finish.
    pub fn requires_finished_producers(self) -> bool {
        matches!(self, Self::AllProducersFinished)
    }
}

/// Slot selection strategy (`taskmanager.load-balance.mode`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LoadBalanceMode {
    /// First node (in view order) with a free slot.
    #[default]
    None,
    /// Node with the fewest active attempts.
    Tasks,
}

/// How a hybrid input with only partial producer statistics is estimated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HybridStatistics {
    /// Use the producer parallelism as the consumer estimate.
    #[default]
    ProducerParallelism,
    /// Scale finished producers' bytes up to the full producer parallelism.
    Extrapolate,
}

/// Resource wait timeout. A negative configured value means "wait forever".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitTimeout {
    Forever,
    After(Duration),
}

impl WaitTimeout {
    /// The bounded duration, if any.
    pub fn duration(self) -> Option<Duration> {
        match self {
            Self::Forever => None,
            Self::After(d) => Some(d),
        }
    }
}

impl fmt::Display for WaitTimeout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Forever => f.write_str("-1"),
            Self::After(d) => f.write_str(&crate::units::format_duration(*d)),
        }
    }
}
