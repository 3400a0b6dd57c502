pub mod config;
pub mod error;
pub mod graph;
pub mod types;
pub mod units;

pub use config::{
    AdaptiveSchedulerConfig, AutoParallelismConfig, EbbConfigFile, SchedulerConfig,
    SlotConfig, SlowTaskDetectorConfig, SpeculativeConfig, DEFAULT_MAX_PARALLELISM,
    MAX_BASELINE_MULTIPLIER,
};
pub use error::{ConfigError, GraphError};
pub use graph::{JobEdge, JobGraph, JobVertex};
pub use types::*;
pub use units::{
    format_bytes, format_duration, parse_bytes, parse_duration, parse_wait_timeout, scale_duration,
};
