//! Estimation for HYBRID inputs whose producers have not all finished.
//!
//! The consumer of a hybrid edge may be scheduled before its producer
//! completes, so its parallelism has to be decided on partial data. The
//! policy is selected by
//! `execution.batch.adaptive.auto-parallelism.hybrid-partial-statistics`
//! and can be replaced through [`crate::ParallelismDecider::with_policy`].

use ebb_core::HybridStatistics;

use crate::stats::InputStatistics;

/// What a partial hybrid input contributes to the decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HybridEstimate {
    /// Counted with the byte totals of the other inputs.
    Bytes(u64),
    /// A lower bound on the consumer parallelism.
    Parallelism(u32),
}

pub trait HybridStatisticsPolicy: Send + Sync {
    fn name(&self) -> &'static str;

    fn estimate(&self, input: &InputStatistics) -> HybridEstimate;
}

/// Use the producer parallelism as the consumer's estimate.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProducerParallelism;

impl HybridStatisticsPolicy for ProducerParallelism {
    fn name(&self) -> &'static str {
        "producer-parallelism"
    }

    fn estimate(&self, input: &InputStatistics) -> HybridEstimate {
        HybridEstimate::Parallelism(input.producer_parallelism)
    }
}

/// Scale finished producers' output linearly to the whole producer.
#[derive(Debug, Clone, Copy, Default)]
pub struct Extrapolate;

impl HybridStatisticsPolicy for Extrapolate {
    fn name(&self) -> &'static str {
        "extrapolate"
    }

    fn estimate(&self, input: &InputStatistics) -> HybridEstimate {
        if input.finished_producers == 0 {
            return ProducerParallelism.estimate(input);
        }
        let scaled = u128::from(input.produced_bytes) * u128::from(input.producer_parallelism)
            / u128::from(input.finished_producers);
        HybridEstimate::Bytes(u64::try_from(scaled).unwrap_or(u64::MAX))
    }
}

pub fn policy_for(kind: HybridStatistics) -> Box<dyn HybridStatisticsPolicy> {
    match kind {
        HybridStatistics::ProducerParallelism => Box::new(ProducerParallelism),
        HybridStatistics::Extrapolate => Box::new(Extrapolate),
    }
}

#[cfg(test)]
mod tests {
    use ebb_core::ExchangeMode;

    use super::*;

    #[test]
    fn producer_parallelism_ignores_partial_bytes() {
        let input = InputStatistics::new("src", ExchangeMode::Hybrid, 8).partial(2, 1 << 30);
        assert_eq!(
            ProducerParallelism.estimate(&input),
            HybridEstimate::Parallelism(8)
        );
    }

    #[test]
    fn extrapolate_scales_finished_share() {
        let input = InputStatistics::new("src", ExchangeMode::Hybrid, 8).partial(2, 100);
        assert_eq!(Extrapolate.estimate(&input), HybridEstimate::Bytes(400));

        let none_finished = InputStatistics::new("src", ExchangeMode::Hybrid, 8);
        assert_eq!(
            Extrapolate.estimate(&none_finished),
            HybridEstimate::Parallelism(8)
        );
    }

    #[test]
    fn policy_selected_by_option() {
        assert_eq!(policy_for(HybridStatistics::ProducerParallelism).name(), "producer-parallelism");
        assert_eq!(policy_for(HybridStatistics::Extrapolate).name(), "extrapolate");
    }
}
