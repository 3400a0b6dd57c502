//! ebb.toml scheduler configuration.
//!
//! The file mirrors the dotted option names: `execution.batch.speculative.enabled = true`
//! and a `[execution.batch.speculative]` table with `enabled = true` are the
//! same thing in TOML. Every field is optional in the file; [`SchedulerConfig`]
//! is the resolved, validated form the scheduler consumes.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ConfigError;
use crate::types::{ConsumeConstraint, HybridStatistics, LoadBalanceMode, WaitTimeout};
use crate::units::{format_bytes, format_duration, parse_bytes, parse_duration, parse_wait_timeout};

/// Upper parallelism bound when `max-parallelism` is not configured.
pub const DEFAULT_MAX_PARALLELISM: u32 = 128;

/// Upper bound for `slow-task-detector.execution-time.baseline-multiplier`.
pub const MAX_BASELINE_MULTIPLIER: f64 = 1000.0;

// ── File representation ────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct EbbConfigFile {
    pub parallelism: Option<ParallelismSection>,
    pub execution: Option<ExecutionSection>,
    pub slow_task_detector: Option<SlowTaskDetectorSection>,
    pub jobmanager: Option<JobManagerSection>,
    pub slotmanager: Option<SlotManagerSection>,
    pub slot: Option<SlotSection>,
    pub taskmanager: Option<TaskManagerSection>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ParallelismSection {
    pub default: Option<u32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionSection {
    pub batch: Option<BatchSection>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchSection {
    pub adaptive: Option<AdaptiveSection>,
    pub speculative: Option<SpeculativeSection>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct AdaptiveSection {
    pub auto_parallelism: Option<AutoParallelismSection>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct AutoParallelismSection {
    pub enabled: Option<bool>,
    pub min_parallelism: Option<u32>,
    pub max_parallelism: Option<u32>,
    pub avg_data_volume_per_task: Option<String>,
    pub default_source_parallelism: Option<u32>,
    pub hybrid_partial_statistics: Option<HybridStatistics>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SpeculativeSection {
    pub enabled: Option<bool>,
    pub max_concurrent_executions: Option<u32>,
    pub block_slow_node_duration: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SlowTaskDetectorSection {
    pub check_interval: Option<String>,
    pub execution_time: Option<ExecutionTimeSection>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ExecutionTimeSection {
    pub baseline_lower_bound: Option<String>,
    pub baseline_multiplier: Option<f64>,
    pub baseline_ratio: Option<f64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct JobManagerSection {
    pub adaptive_scheduler: Option<AdaptiveSchedulerSection>,
    pub partition: Option<PartitionSection>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct AdaptiveSchedulerSection {
    pub min_parallelism_increase: Option<u32>,
    pub resource_wait_timeout: Option<String>,
    pub resource_stabilization_timeout: Option<String>,
    pub scaling_interval: Option<ScalingIntervalSection>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScalingIntervalSection {
    pub min: Option<String>,
    pub max: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PartitionSection {
    pub hybrid: Option<HybridSection>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct HybridSection {
    pub partition_data_consume_constraint: Option<ConsumeConstraint>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SlotManagerSection {
    pub number_of_slots: Option<NumberOfSlotsSection>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NumberOfSlotsSection {
    pub max: Option<u32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SlotSection {
    pub idle: Option<TimeoutSection>,
    pub request: Option<TimeoutSection>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TimeoutSection {
    pub timeout: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct TaskManagerSection {
    pub load_balance: Option<LoadBalanceSection>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoadBalanceSection {
    pub mode: Option<LoadBalanceMode>,
}

// ── Resolved configuration ────────────────────────────────────────

/// `execution.batch.adaptive.auto-parallelism.*`
#[derive(Debug, Clone, PartialEq)]
pub struct AutoParallelismConfig {
    pub enabled: bool,
    pub min_parallelism: u32,
    /// Explicitly configured max; `None` falls back to [`DEFAULT_MAX_PARALLELISM`].
    pub max_parallelism: Option<u32>,
    pub avg_data_volume_per_task: u64,
    pub default_source_parallelism: Option<u32>,
    pub hybrid_partial_statistics: HybridStatistics,
}

impl AutoParallelismConfig {
    /// Effective upper bound for vertices without their own max.
    pub fn upper_bound(&self) -> u32 {
        self.max_parallelism.unwrap_or(DEFAULT_MAX_PARALLELISM)
    }
}

/// `execution.batch.speculative.*`
#[derive(Debug, Clone, PartialEq)]
pub struct SpeculativeConfig {
    pub enabled: bool,
    pub max_concurrent_executions: u32,
    pub block_slow_node_duration: Duration,
}

/// `slow-task-detector.*`
#[derive(Debug, Clone, PartialEq)]
pub struct SlowTaskDetectorConfig {
    pub check_interval: Duration,
    pub baseline_lower_bound: Duration,
    pub baseline_multiplier: f64,
    pub baseline_ratio: f64,
}

/// `jobmanager.adaptive-scheduler.*`
#[derive(Debug, Clone, PartialEq)]
pub struct AdaptiveSchedulerConfig {
    pub min_parallelism_increase: u32,
    pub resource_wait_timeout: WaitTimeout,
    pub resource_stabilization_timeout: Duration,
    pub scaling_interval_min: Duration,
    pub scaling_interval_max: Option<Duration>,
}

/// `slotmanager.*` and `slot.*`
#[derive(Debug, Clone, PartialEq)]
pub struct SlotConfig {
    /// Caps how many slots of the resource view the job may use.
    pub max_slots: Option<u32>,
    /// Passed through to the external slot pool; the core never returns slots.
    pub idle_timeout: Duration,
    pub request_timeout: Duration,
}

/// Fully resolved scheduler configuration for one job.
#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerConfig {
    /// `parallelism.default`, the job's static default parallelism.
    pub default_parallelism: u32,
    pub auto_parallelism: AutoParallelismConfig,
    pub speculative: SpeculativeConfig,
    pub slow_task_detector: SlowTaskDetectorConfig,
    pub adaptive_scheduler: AdaptiveSchedulerConfig,
    pub slots: SlotConfig,
    pub hybrid_consume_constraint: ConsumeConstraint,
    pub load_balance: LoadBalanceMode,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            default_parallelism: 1,
            auto_parallelism: AutoParallelismConfig {
                enabled: true,
                min_parallelism: 1,
                max_parallelism: None,
                avg_data_volume_per_task: 16 * 1024 * 1024,
                default_source_parallelism: None,
                hybrid_partial_statistics: HybridStatistics::default(),
            },
            speculative: SpeculativeConfig {
                enabled: false,
                max_concurrent_executions: 2,
                block_slow_node_duration: Duration::from_secs(60),
            },
            slow_task_detector: SlowTaskDetectorConfig {
                check_interval: Duration::from_secs(1),
                baseline_lower_bound: Duration::from_secs(60),
                baseline_multiplier: 1.5,
                baseline_ratio: 0.75,
            },
            adaptive_scheduler: AdaptiveSchedulerConfig {
                min_parallelism_increase: 1,
                resource_wait_timeout: WaitTimeout::After(Duration::from_secs(300)),
                resource_stabilization_timeout: Duration::from_secs(10),
                scaling_interval_min: Duration::from_secs(30),
                scaling_interval_max: None,
            },
            slots: SlotConfig {
                max_slots: None,
                idle_timeout: Duration::from_secs(50),
                request_timeout: Duration::from_secs(300),
            },
            hybrid_consume_constraint: ConsumeConstraint::default(),
            load_balance: LoadBalanceMode::default(),
        }
    }
}

fn duration_opt(key: &'static str, value: Option<&String>) -> Result<Option<Duration>, ConfigError> {
    value
        .map(|s| {
            parse_duration(s).ok_or_else(|| ConfigError::InvalidValue {
                key,
                value: s.clone(),
            })
        })
        .transpose()
}

impl SchedulerConfig {
    /// Read and validate a TOML config file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml_str(&content)?;
        debug!(?path, "scheduler config loaded");
        Ok(config)
    }

    /// Parse and validate a TOML document.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let file: EbbConfigFile = toml::from_str(content)?;
        Self::from_file_config(&file)
    }

    /// Resolve file values over the defaults, then validate.
    pub fn from_file_config(file: &EbbConfigFile) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(p) = file.parallelism.as_ref().and_then(|p| p.default) {
            config.default_parallelism = p;
        }

        let batch = file.execution.as_ref().and_then(|e| e.batch.as_ref());
        if let Some(auto) = batch
            .and_then(|b| b.adaptive.as_ref())
            .and_then(|a| a.auto_parallelism.as_ref())
        {
            let ap = &mut config.auto_parallelism;
            ap.enabled = auto.enabled.unwrap_or(ap.enabled);
            ap.min_parallelism = auto.min_parallelism.unwrap_or(ap.min_parallelism);
            ap.max_parallelism = auto.max_parallelism.or(ap.max_parallelism);
            ap.default_source_parallelism = auto
                .default_source_parallelism
                .or(ap.default_source_parallelism);
            ap.hybrid_partial_statistics = auto
                .hybrid_partial_statistics
                .unwrap_or(ap.hybrid_partial_statistics);
            if let Some(volume) = &auto.avg_data_volume_per_task {
                ap.avg_data_volume_per_task =
                    parse_bytes(volume).ok_or_else(|| ConfigError::InvalidValue {
                        key: "execution.batch.adaptive.auto-parallelism.avg-data-volume-per-task",
                        value: volume.clone(),
                    })?;
            }
        }

        if let Some(spec) = batch.and_then(|b| b.speculative.as_ref()) {
            let sc = &mut config.speculative;
            sc.enabled = spec.enabled.unwrap_or(sc.enabled);
            sc.max_concurrent_executions = spec
                .max_concurrent_executions
                .unwrap_or(sc.max_concurrent_executions);
            if let Some(d) = duration_opt(
                "execution.batch.speculative.block-slow-node-duration",
                spec.block_slow_node_duration.as_ref(),
            )? {
                sc.block_slow_node_duration = d;
            }
        }

        if let Some(det) = &file.slow_task_detector {
            let dc = &mut config.slow_task_detector;
            if let Some(d) =
                duration_opt("slow-task-detector.check-interval", det.check_interval.as_ref())?
            {
                dc.check_interval = d;
            }
            if let Some(et) = &det.execution_time {
                if let Some(d) = duration_opt(
                    "slow-task-detector.execution-time.baseline-lower-bound",
                    et.baseline_lower_bound.as_ref(),
                )? {
                    dc.baseline_lower_bound = d;
                }
                dc.baseline_multiplier = et.baseline_multiplier.unwrap_or(dc.baseline_multiplier);
                dc.baseline_ratio = et.baseline_ratio.unwrap_or(dc.baseline_ratio);
            }
        }

        if let Some(jm) = &file.jobmanager {
            if let Some(ad) = &jm.adaptive_scheduler {
                let ac = &mut config.adaptive_scheduler;
                ac.min_parallelism_increase = ad
                    .min_parallelism_increase
                    .unwrap_or(ac.min_parallelism_increase);
                if let Some(raw) = &ad.resource_wait_timeout {
                    ac.resource_wait_timeout =
                        parse_wait_timeout(raw).ok_or_else(|| ConfigError::InvalidValue {
                            key: "jobmanager.adaptive-scheduler.resource-wait-timeout",
                            value: raw.clone(),
                        })?;
                }
                if let Some(d) = duration_opt(
                    "jobmanager.adaptive-scheduler.resource-stabilization-timeout",
                    ad.resource_stabilization_timeout.as_ref(),
                )? {
                    ac.resource_stabilization_timeout = d;
                }
                if let Some(si) = &ad.scaling_interval {
                    if let Some(d) = duration_opt(
                        "jobmanager.adaptive-scheduler.scaling-interval.min",
                        si.min.as_ref(),
                    )? {
                        ac.scaling_interval_min = d;
                    }
                    ac.scaling_interval_max = duration_opt(
                        "jobmanager.adaptive-scheduler.scaling-interval.max",
                        si.max.as_ref(),
                    )?
                    .or(ac.scaling_interval_max);
                }
            }
            if let Some(c) = jm
                .partition
                .as_ref()
                .and_then(|p| p.hybrid.as_ref())
                .and_then(|h| h.partition_data_consume_constraint)
            {
                config.hybrid_consume_constraint = c;
            }
        }

        if let Some(max) = file
            .slotmanager
            .as_ref()
            .and_then(|s| s.number_of_slots.as_ref())
            .and_then(|n| n.max)
        {
            config.slots.max_slots = Some(max);
        }
        if let Some(slot) = &file.slot {
            if let Some(d) = duration_opt(
                "slot.idle.timeout",
                slot.idle.as_ref().and_then(|t| t.timeout.as_ref()),
            )? {
                config.slots.idle_timeout = d;
            }
            if let Some(d) = duration_opt(
                "slot.request.timeout",
                slot.request.as_ref().and_then(|t| t.timeout.as_ref()),
            )? {
                config.slots.request_timeout = d;
            }
        }

        if let Some(mode) = file
            .taskmanager
            .as_ref()
            .and_then(|t| t.load_balance.as_ref())
            .and_then(|l| l.mode)
        {
            config.load_balance = mode;
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject combinations the scheduler cannot honour.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let ap = &self.auto_parallelism;
        if self.default_parallelism == 0 {
            return Err(ConfigError::ZeroParallelism {
                key: "parallelism.default",
            });
        }
        if ap.min_parallelism == 0 {
            return Err(ConfigError::ZeroParallelism {
                key: "execution.batch.adaptive.auto-parallelism.min-parallelism",
            });
        }
        if ap.max_parallelism == Some(0) {
            return Err(ConfigError::ZeroParallelism {
                key: "execution.batch.adaptive.auto-parallelism.max-parallelism",
            });
        }
        if ap.default_source_parallelism == Some(0) {
            return Err(ConfigError::ZeroParallelism {
                key: "execution.batch.adaptive.auto-parallelism.default-source-parallelism",
            });
        }
        if ap.min_parallelism > ap.upper_bound() {
            return Err(ConfigError::InvertedBounds {
                scope: "execution.batch.adaptive.auto-parallelism".to_string(),
                min: ap.min_parallelism,
                max: ap.upper_bound(),
            });
        }
        if ap.avg_data_volume_per_task == 0 {
            return Err(ConfigError::InvalidValue {
                key: "execution.batch.adaptive.auto-parallelism.avg-data-volume-per-task",
                value: "0".to_string(),
            });
        }
        if self.speculative.max_concurrent_executions == 0 {
            return Err(ConfigError::InvalidValue {
                key: "execution.batch.speculative.max-concurrent-executions",
                value: "0".to_string(),
            });
        }

        let det = &self.slow_task_detector;
        if det.check_interval.is_zero() {
            return Err(ConfigError::InvalidValue {
                key: "slow-task-detector.check-interval",
                value: format_duration(det.check_interval),
            });
        }
        if !(det.baseline_ratio > 0.0 && det.baseline_ratio <= 1.0) {
            return Err(ConfigError::InvalidValue {
                key: "slow-task-detector.execution-time.baseline-ratio",
                value: det.baseline_ratio.to_string(),
            });
        }
        if !(det.baseline_multiplier > 0.0 && det.baseline_multiplier <= MAX_BASELINE_MULTIPLIER) {
            return Err(ConfigError::InvalidValue {
                key: "slow-task-detector.execution-time.baseline-multiplier",
                value: det.baseline_multiplier.to_string(),
            });
        }

        let ad = &self.adaptive_scheduler;
        if ad.min_parallelism_increase == 0 {
            return Err(ConfigError::InvalidValue {
                key: "jobmanager.adaptive-scheduler.min-parallelism-increase",
                value: "0".to_string(),
            });
        }
        if let Some(max) = ad.scaling_interval_max {
            if max < ad.scaling_interval_min {
                return Err(ConfigError::InvalidValue {
                    key: "jobmanager.adaptive-scheduler.scaling-interval.max",
                    value: format!(
                        "{} is shorter than scaling-interval.min {}",
                        format_duration(max),
                        format_duration(ad.scaling_interval_min)
                    ),
                });
            }
        }
        if self.slots.max_slots == Some(0) {
            return Err(ConfigError::InvalidValue {
                key: "slotmanager.number-of-slots.max",
                value: "0".to_string(),
            });
        }
        Ok(())
    }

    /// Convert back to the file representation with every option spelled out.
    pub fn to_file_config(&self) -> EbbConfigFile {
        let ap = &self.auto_parallelism;
        let ad = &self.adaptive_scheduler;
        let det = &self.slow_task_detector;
        EbbConfigFile {
            parallelism: Some(ParallelismSection {
                default: Some(self.default_parallelism),
            }),
            execution: Some(ExecutionSection {
                batch: Some(BatchSection {
                    adaptive: Some(AdaptiveSection {
                        auto_parallelism: Some(AutoParallelismSection {
                            enabled: Some(ap.enabled),
                            min_parallelism: Some(ap.min_parallelism),
                            max_parallelism: ap.max_parallelism,
                            avg_data_volume_per_task: Some(format_bytes(
                                ap.avg_data_volume_per_task,
                            )),
                            default_source_parallelism: ap.default_source_parallelism,
                            hybrid_partial_statistics: Some(ap.hybrid_partial_statistics),
                        }),
                    }),
                    speculative: Some(SpeculativeSection {
                        enabled: Some(self.speculative.enabled),
                        max_concurrent_executions: Some(
                            self.speculative.max_concurrent_executions,
                        ),
                        block_slow_node_duration: Some(format_duration(
                            self.speculative.block_slow_node_duration,
                        )),
                    }),
                }),
            }),
            slow_task_detector: Some(SlowTaskDetectorSection {
                check_interval: Some(format_duration(det.check_interval)),
                execution_time: Some(ExecutionTimeSection {
                    baseline_lower_bound: Some(format_duration(det.baseline_lower_bound)),
                    baseline_multiplier: Some(det.baseline_multiplier),
                    baseline_ratio: Some(det.baseline_ratio),
                }),
            }),
            jobmanager: Some(JobManagerSection {
                adaptive_scheduler: Some(AdaptiveSchedulerSection {
                    min_parallelism_increase: Some(ad.min_parallelism_increase),
                    resource_wait_timeout: Some(ad.resource_wait_timeout.to_string()),
                    resource_stabilization_timeout: Some(format_duration(
                        ad.resource_stabilization_timeout,
                    )),
                    scaling_interval: Some(ScalingIntervalSection {
                        min: Some(format_duration(ad.scaling_interval_min)),
                        max: ad.scaling_interval_max.map(format_duration),
                    }),
                }),
                partition: Some(PartitionSection {
                    hybrid: Some(HybridSection {
                        partition_data_consume_constraint: Some(self.hybrid_consume_constraint),
                    }),
                }),
            }),
            slotmanager: Some(SlotManagerSection {
                number_of_slots: Some(NumberOfSlotsSection {
                    max: self.slots.max_slots,
                }),
            }),
            slot: Some(SlotSection {
                idle: Some(TimeoutSection {
                    timeout: Some(format_duration(self.slots.idle_timeout)),
                }),
                request: Some(TimeoutSection {
                    timeout: Some(format_duration(self.slots.request_timeout)),
                }),
            }),
            taskmanager: Some(TaskManagerSection {
                load_balance: Some(LoadBalanceSection {
                    mode: Some(self.load_balance),
                }),
            }),
        }
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(&self.to_file_config())?)
    }
}
