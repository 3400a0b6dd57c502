//! Upstream statistics for one input edge of a consumer vertex.

use ebb_core::{ExchangeMode, VertexId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputStatistics {
    pub producer: VertexId,
    pub exchange: ExchangeMode,
    /// Parallelism of the producer's current generation.
    pub producer_parallelism: u32,
    /// Producer tasks that have a finished attempt.
    pub finished_producers: u32,
    /// Output bytes reported by the finished producer tasks.
    pub produced_bytes: u64,
}

impl InputStatistics {
    pub fn new(producer: &str, exchange: ExchangeMode, producer_parallelism: u32) -> Self {
        Self {
            producer: producer.to_string(),
            exchange,
            producer_parallelism,
            finished_producers: 0,
            produced_bytes: 0,
        }
    }

    /// All producer tasks finished with `bytes` in total.
    pub fn finished(mut self, bytes: u64) -> Self {
        self.finished_producers = self.producer_parallelism;
        self.produced_bytes = bytes;
        self
    }

    /// `finished` of the producer tasks finished with `bytes` in total.
    pub fn partial(mut self, finished: u32, bytes: u64) -> Self {
        self.finished_producers = finished.min(self.producer_parallelism);
        self.produced_bytes = bytes;
        self
    }

    pub fn is_complete(&self) -> bool {
        self.producer_parallelism > 0 && self.finished_producers >= self.producer_parallelism
    }
}
