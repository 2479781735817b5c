//! CLI command definitions for ritual-bench.
//!
//! Two subcommands: `run` executes the full benchmark and writes the
//! reports, `preflight` only validates the prerequisites.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::error::BenchError;
use crate::preflight::run_preflight;
use crate::report::{render_markdown, render_summary, update_readme, ReportStore, LATEST_MARKDOWN};
use crate::runner::config::{load_config, BenchmarkConfig};
use crate::runner::environment::{OpenClawFactory, OpenClawOptions};
use crate::runner::orchestrator::OrchestrationController;

/// Default configuration file.
const DEFAULT_CONFIG: &str = "config.yaml";

/// Default directory for JSON and markdown reports.
const DEFAULT_RESULTS_DIR: &str = "./results";

/// Exit code when at least one (model, variant) pair was not perfect.
const EXIT_IMPERFECT: u8 = 1;
/// Exit code when pre-flight checks failed.
const EXIT_PREFLIGHT: u8 = 2;
/// Exit code after an interrupt.
const EXIT_INTERRUPTED: u8 = 130;

/// Benchmark how well local models complete the OpenClaw first-run ritual.
#[derive(Parser)]
#[command(name = "ritual-bench")]
#[command(about = "Benchmark LLMs on the OpenClaw first-run identity ritual")]
#[command(version)]
#[command(
    long_about = "ritual-bench provisions a fresh OpenClaw install per trial, walks the agent through its bootstrap conversation and scores the workspace files it leaves behind.\n\nExample usage:\n  ritual-bench run -c config.yaml -m qwen3-8b --runs 3"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

impl Cli {
    /// Log filter to use when `RUST_LOG` is unset. `--verbose` wins over
    /// `--log-level`.
    pub fn log_filter(&self) -> String {
        match &self.command {
            Commands::Run(args) if args.verbose => "debug".to_string(),
            _ => self.log_level.clone(),
        }
    }
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Run the benchmark and write the reports.
    Run(RunArgs),

    /// Run the pre-flight checks only.
    Preflight(PreflightArgs),
}

/// Arguments for `ritual-bench run`.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Path to the YAML configuration.
    #[arg(short = 'c', long, default_value = DEFAULT_CONFIG, env = "RITUAL_BENCH_CONFIG")]
    pub config: PathBuf,

    /// Only benchmark these models (by configured name).
    #[arg(short = 'm', long = "models", alias = "model", num_args = 1..)]
    pub models: Vec<String>,

    /// Runs per (model, variant). Overrides `runs_per_model`.
    #[arg(short = 'r', long)]
    pub runs: Option<u32>,

    /// Use the OpenClaw already on PATH instead of installing it.
    #[arg(long)]
    pub skip_install: bool,

    /// Skip the pre-flight checks (not recommended).
    #[arg(long)]
    pub skip_preflight: bool,

    /// Keep trial home directories on disk for inspection.
    #[arg(long)]
    pub keep_env: bool,

    /// Reuse results from the latest report when version and prompts match.
    #[arg(long)]
    pub skip_completed: bool,

    /// Directory for JSON and markdown reports.
    #[arg(long, default_value = DEFAULT_RESULTS_DIR)]
    pub results_dir: PathBuf,

    /// README whose marked results block is rewritten.
    #[arg(long, default_value = "README.md")]
    pub readme: PathBuf,

    /// Debug logging.
    #[arg(short, long)]
    pub verbose: bool,
}

/// Arguments for `ritual-bench preflight`.
#[derive(Parser, Debug)]
pub struct PreflightArgs {
    /// Path to the YAML configuration.
    #[arg(short = 'c', long, default_value = DEFAULT_CONFIG, env = "RITUAL_BENCH_CONFIG")]
    pub config: PathBuf,

    /// Only check these models (by configured name).
    #[arg(short = 'm', long = "models", alias = "model", num_args = 1..)]
    pub models: Vec<String>,

    /// Skip the Node.js and npm checks.
    #[arg(long)]
    pub skip_install: bool,
}

/// Parse CLI arguments.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI with the parsed arguments. `shutdown` flips to true on an
/// external interrupt.
pub async fn run_with_cli(cli: Cli, shutdown: watch::Receiver<bool>) -> anyhow::Result<ExitCode> {
    match cli.command {
        Commands::Run(args) => run_benchmark_command(args, shutdown).await,
        Commands::Preflight(args) => run_preflight_command(args).await,
    }
}

/// Loads the config and applies the model filter.
fn load_selected(path: &Path, models: &[String]) -> anyhow::Result<BenchmarkConfig> {
    let mut config =
        load_config(Some(path)).with_context(|| format!("Failed to load config from {}", path.display()))?;
    select_models(&mut config, models)?;
    Ok(config)
}

/// Keeps the requested models. Fails when nothing is left to run.
pub fn select_models(config: &mut BenchmarkConfig, names: &[String]) -> Result<(), BenchError> {
    if config.models.is_empty() {
        return Err(BenchError::NoModels);
    }
    if names.is_empty() {
        return Ok(());
    }
    let unknown = config.retain_models(names);
    if config.models.is_empty() {
        return Err(BenchError::NoMatchingModels(names.join(", ")));
    }
    if !unknown.is_empty() {
        warn!("Ignoring unknown models: {}", unknown.join(", "));
    }
    Ok(())
}

async fn run_benchmark_command(args: RunArgs, shutdown: watch::Receiver<bool>) -> anyhow::Result<ExitCode> {
    let mut config = load_selected(&args.config, &args.models)?;
    if let Some(runs) = args.runs {
        config = config.with_runs(runs);
    }

    if args.skip_preflight {
        info!("Skipping pre-flight checks (--skip-preflight)");
    } else {
        let preflight = run_preflight(&config, args.skip_install).await;
        print!("{}", preflight);
        if !preflight.all_passed() {
            error!(
                "{}. Aborting benchmark; use --skip-preflight to bypass",
                BenchError::PreflightFailed(preflight.failed().len())
            );
            return Ok(ExitCode::from(EXIT_PREFLIGHT));
        }
    }

    let store = ReportStore::new(&args.results_dir);
    let prior = if args.skip_completed {
        let prior = store.load_latest();
        match &prior {
            Some(report) => info!(
                "Loaded {} model/variant result(s) from {} (OpenClaw {})",
                report.models.len(),
                store.latest_path().display(),
                report.tool_version
            ),
            None => info!("No latest report found, nothing to skip"),
        }
        prior
    } else {
        None
    };

    let options = OpenClawOptions::new(config.gateway.clone())
        .with_skip_install(args.skip_install)
        .with_keep_env(args.keep_env)
        .with_home_root(config.openclaw_home.clone());
    let factory = Arc::new(OpenClawFactory::new(options));

    let controller = OrchestrationController::new(factory, config)
        .with_prior_report(prior)
        .with_shutdown(shutdown)
        .with_warm_up(true);

    let report = match controller.run().await {
        Ok(report) => report,
        Err(BenchError::Interrupted) => {
            warn!("Benchmark interrupted, no report written");
            return Ok(ExitCode::from(EXIT_INTERRUPTED));
        }
        Err(e) => return Err(e.into()),
    };

    println!("{}", render_summary(&report));

    let path = store.save(&report).context("Failed to save JSON report")?;
    info!("Full report saved to {}", path.display());

    let table = render_markdown(&report);
    let md_path = store
        .write_text(LATEST_MARKDOWN, &table)
        .context("Failed to save markdown table")?;
    info!("Markdown table saved to {}", md_path.display());

    if !update_readme(&args.readme, &table)? {
        info!("README not updated");
    }

    Ok(if report.all_perfect() {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(EXIT_IMPERFECT)
    })
}

async fn run_preflight_command(args: PreflightArgs) -> anyhow::Result<ExitCode> {
    let config = load_selected(&args.config, &args.models)?;
    let report = run_preflight(&config, args.skip_install).await;
    print!("{}", report);
    Ok(if report.all_passed() {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(EXIT_PREFLIGHT)
    })
}
