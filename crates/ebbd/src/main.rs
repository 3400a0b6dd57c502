//! ebbd — command-line front end of the ebb adaptive batch scheduler.
//!
//! - `check-config` validates a configuration file and prints it fully
//!   resolved
//! - `plan` shows the parallelism a job would start with
//! - `simulate` runs a job against a simulated mini-cluster
//!
//! # Usage
//!
//! ```text
//! ebbd check-config --config ebb.toml
//! ebbd plan --config ebb.toml --job wordcount.json --slots 8
//! ebbd simulate --config ebb.toml --scenario straggler.json --format json
//! ```

mod plan;
mod simulate;

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use ebb_core::{JobGraph, SchedulerConfig};

use crate::simulate::Scenario;

#[derive(Parser)]
#[command(name = "ebbd", about = "ebb adaptive batch scheduler", version)]
struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Validate a configuration file and print the resolved settings.
    CheckConfig {
        /// Path to the TOML configuration.
        #[arg(long)]
        config: PathBuf,
    },
    /// Show the parallelism a job would be submitted with.
    Plan {
        /// Path to the TOML configuration; defaults apply when omitted.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Path to the job graph (JSON).
        #[arg(long)]
        job: PathBuf,

        /// Number of slots to plan against; unlimited when omitted.
        #[arg(long)]
        slots: Option<u32>,

        /// Output format: text or json
        #[arg(long, default_value = "text")]
        format: String,
    },
    /// Run a job on a simulated mini-cluster.
    Simulate {
        /// Path to the TOML configuration; defaults apply when omitted.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Path to the scenario (JSON).
        #[arg(long)]
        scenario: PathBuf,

        /// Output format: text or json
        #[arg(long, default_value = "text")]
        format: String,

        /// Run on the wall clock instead of simulated time.
        #[arg(long)]
        realtime: bool,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match cli.command {
        Command::CheckConfig { config } => {
            let config = SchedulerConfig::from_file(&config)?;
            print!("{}", config.to_toml_string()?);
            Ok(())
        }
        Command::Plan {
            config,
            job,
            slots,
            format,
        } => {
            let config = load_config(config.as_deref())?;
            let job = load_job(&job)?;
            let plan = plan::plan(config, job, slots)?;
            match format.as_str() {
                "json" => println!("{}", serde_json::to_string_pretty(&plan)?),
                _ => print!("{}", plan::format_plan(&plan)),
            }
            Ok(())
        }
        Command::Simulate {
            config,
            scenario,
            format,
            realtime,
        } => {
            let config = load_config(config.as_deref())?;
            let scenario = load_scenario(&scenario)?;
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .start_paused(!realtime)
                .build()?;
            let report = runtime.block_on(simulate::run(config, scenario))?;
            match format.as_str() {
                "json" => println!("{}", serde_json::to_string_pretty(&report)?),
                _ => print!("{}", simulate::format_report(&report)),
            }
            if report.error.is_some() {
                std::process::exit(1);
            }
            Ok(())
        }
    }
}

/// Logs go to stderr so `--format json` output stays parseable.
fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,ebbd=debug,ebb_scheduler=debug"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<SchedulerConfig> {
    match path {
        Some(path) => Ok(SchedulerConfig::from_file(path)?),
        None => {
            info!("no config file given, using defaults");
            Ok(SchedulerConfig::default())
        }
    }
}

fn load_job(path: &Path) -> anyhow::Result<JobGraph> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("reading job graph {}", path.display()))?;
    JobGraph::from_json(&content).with_context(|| format!("parsing job graph {}", path.display()))
}

fn load_scenario(path: &Path) -> anyhow::Result<Scenario> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("reading scenario {}", path.display()))?;
    Scenario::from_json(&content).with_context(|| format!("parsing scenario {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_parses_simulate() {
        let cli = Cli::try_parse_from([
            "ebbd",
            "--log-json",
            "simulate",
            "--scenario",
            "straggler.json",
            "--format",
            "json",
        ])
        .unwrap();
        assert!(cli.log_json);
        match cli.command {
            Command::Simulate {
                config,
                format,
                realtime,
                ..
            } => {
                assert!(config.is_none());
                assert_eq!(format, "json");
                assert!(!realtime);
            }
            _ => panic!("expected simulate"),
        }
    }

    #[test]
    fn missing_config_falls_back_to_defaults() {
        let config = load_config(None).unwrap();
        assert_eq!(config, SchedulerConfig::default());
    }

    #[test]
    fn job_and_config_files_load() {
        let dir = tempfile::tempdir().unwrap();
        let job_path = dir.path().join("job.json");
        std::fs::write(
            &job_path,
            r#"{"name": "etl", "vertices": [{"id": "read"}, {"id": "write"}],
                "edges": [{"source": "read", "target": "write", "exchange": "BLOCKING"}]}"#,
        )
        .unwrap();
        let job = load_job(&job_path).unwrap();
        assert_eq!(job.vertices.len(), 2);

        let config_path = dir.path().join("ebb.toml");
        std::fs::write(&config_path, SchedulerConfig::default().to_toml_string().unwrap()).unwrap();
        let config = load_config(Some(&config_path)).unwrap();
        assert_eq!(config, SchedulerConfig::default());
    }

    #[test]
    fn demo_files_load() {
        let config = SchedulerConfig::from_toml_str(include_str!("../../../demos/ebb.toml")).unwrap();
        assert!(config.speculative.enabled);
        assert_eq!(config.auto_parallelism.default_source_parallelism, Some(8));

        let job = JobGraph::from_json(include_str!("../../../demos/wordcount.json")).unwrap();
        let plan = plan::plan(config, job, Some(4)).unwrap();
        assert_eq!(plan.vertices[0].parallelism, Some(4));

        let scenario = Scenario::from_json(include_str!("../../../demos/straggler.json")).unwrap();
        assert_eq!(scenario.resource_changes.len(), 1);
        assert_eq!(scenario.slowdown["tm-2"], 5.0);
    }

    #[test]
    fn unreadable_job_names_the_path() {
        let err = load_job(Path::new("/nonexistent/job.json")).unwrap_err();
        assert!(format!("{err:#}").contains("/nonexistent/job.json"));
    }
}
