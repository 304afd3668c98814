// Pipeline binary: runs the image-statistics pipeline once, or sweeps core layouts and
// dispatch policies and records the best time of each combination.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use pinned_pipeline::sweep::{self, SweepConfig};
use pinned_pipeline::{CommunicationMode, DispatchPolicy, Pipeline, PipelineConfig, SharedCores};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "pinned-pipeline", version, about)]
struct Cli {
    /// TOML configuration file; flags override its values.
    #[arg(short, long, env = "PINNED_PIPELINE_CONFIG", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Build the pipeline, dispatch every unit, and print per-worker statistics.
    Run(RunArgs),
    /// Time every mode / core layout / policy combination.
    Sweep(SweepArgs),
}

#[derive(Debug, Args)]
struct RunArgs {
    #[command(flatten)]
    overrides: Overrides,

    /// Also write the run report as JSON.
    #[arg(long)]
    report: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct SweepArgs {
    #[command(flatten)]
    overrides: Overrides,

    /// Runs per combination; the best time is kept.
    #[arg(long, default_value_t = 3)]
    repeat: usize,

    /// Where to write the sweep results.
    #[arg(long, default_value = "times.json")]
    times: PathBuf,
}

/// Command-line overrides applied on top of the configuration file.
#[derive(Debug, Args)]
struct Overrides {
    /// Communication mode (`buffers` or `files`).
    #[arg(long, env = "PINNED_PIPELINE_MODE")]
    mode: Option<CommunicationMode>,

    /// Directory scanned for input images.
    #[arg(long)]
    input: Option<PathBuf>,

    /// CSV results file written by the logger stage.
    #[arg(long)]
    output: Option<PathBuf>,

    /// Dispatch policy (`round_robin`/`rr` or `fifo`).
    #[arg(long, env = "PINNED_PIPELINE_POLICY")]
    policy: Option<DispatchPolicy>,

    #[arg(long)]
    dispatcher_core: Option<usize>,
    #[arg(long)]
    fetcher_core: Option<usize>,
    #[arg(long)]
    statistics_core: Option<usize>,
    #[arg(long)]
    logger_core: Option<usize>,

    /// EMA smoothing factor for the per-worker execution time estimate.
    #[arg(long)]
    smoothing: Option<f64>,

    /// Delay between repeated wake-ups while stopping a worker.
    #[arg(long)]
    stop_backoff_ms: Option<u64>,

    /// Leave transparent pixels as decoded instead of painting them white.
    #[arg(long)]
    keep_background: bool,

    /// Fail instead of warning when two stages share a core.
    #[arg(long)]
    reject_shared_cores: bool,

    /// Log every statistics record.
    #[arg(short, long)]
    verbose: bool,
}

impl Overrides {
    fn apply(&self, config: &mut PipelineConfig) {
        if let Some(mode) = self.mode {
            config.mode = mode;
        }
        if let Some(input) = &self.input {
            config.input_dir = input.clone();
        }
        if let Some(output) = &self.output {
            config.output_file = Some(output.clone());
        }
        if let Some(policy) = self.policy {
            config.policy = policy;
        }
        if let Some(core) = self.dispatcher_core {
            config.cores.dispatcher = core;
        }
        if let Some(core) = self.fetcher_core {
            config.cores.fetcher = core;
        }
        if let Some(core) = self.statistics_core {
            config.cores.statistics = core;
        }
        if let Some(core) = self.logger_core {
            config.cores.logger = core;
        }
        if let Some(p) = self.smoothing {
            config.smoothing = p;
        }
        if let Some(ms) = self.stop_backoff_ms {
            config.stop_backoff_ms = ms;
        }
        if self.keep_background {
            config.background = None;
        }
        if self.reject_shared_cores {
            config.shared_cores = SharedCores::Reject;
        }
        config.verbose |= self.verbose;
    }
}

fn load_config(path: Option<&PathBuf>, overrides: &Overrides) -> Result<PipelineConfig> {
    let mut config = match path {
        Some(path) => PipelineConfig::from_file(path)?,
        None => PipelineConfig::default(),
    };
    overrides.apply(&mut config);
    Ok(config)
}

/// Main entry point.
///
/// # Example Usage
/// ```bash
/// # One run over ./bin with FIFO dispatch and file-based connectors
/// pinned-pipeline run --input bin --mode files --policy fifo
///
/// # Full sweep, two repeats per combination
/// RUST_LOG=debug pinned-pipeline sweep --input bin/woj --repeat 2
/// ```
fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Run(args) => {
            let config = load_config(cli.config.as_ref(), &args.overrides)?;
            info!(
                mode = %config.mode,
                policy = %config.policy,
                cores = ?config.cores,
                "starting run"
            );

            let report = Pipeline::run(&config).context("pipeline run failed")?;
            let json = serde_json::to_string_pretty(&report)?;
            println!("{json}");
            if let Some(path) = args.report {
                std::fs::write(&path, &json)
                    .with_context(|| format!("failed to write {}", path.display()))?;
            }
        }
        Command::Sweep(args) => {
            let base = load_config(cli.config.as_ref(), &args.overrides)?;
            let sweep_config = SweepConfig {
                base,
                repeat: args.repeat,
                ..SweepConfig::default()
            };
            let results = sweep::run_sweep(&sweep_config).context("sweep failed")?;
            sweep::write_results(&args.times, &results)?;
            info!(
                combinations = results.len(),
                path = %args.times.display(),
                "sweep results written"
            );
        }
    }
    Ok(())
}
