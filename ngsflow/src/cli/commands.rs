//! CLI command definitions for ngsflow.

use crate::cancellation::CancellationToken;
use crate::config::RunConfig;
use crate::events::LoggingEventSink;
use crate::pipeline::{catalog, PipelineOrchestrator, StageGraph};
use crate::report::PipelineReport;
use crate::tools::ProcessInvoker;
use clap::Parser;
use std::fmt::Write as _;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Default report file name, written under the run directory.
const DEFAULT_REPORT_NAME: &str = "pipeline_report.json";

/// Exit code for a run with failed, skipped or rejected work.
const EXIT_FAILURES: u8 = 1;

/// Exit code for errors raised before any sample is processed.
const EXIT_PREFLIGHT: u8 = 2;

/// Resumable NGS panel pipeline.
#[derive(Parser, Debug)]
#[command(name = "ngsflow")]
#[command(about = "Run the NGS panel pipeline over a run directory")]
#[command(version)]
#[command(
    long_about = "ngsflow drives every sample of a run directory through alignment, recalibration, \
variant calling, annotation and QC, then runs copy-number analysis across the run.\n\n\
Stages whose output already exists are not re-run, so an interrupted run is resumed by \
running the same command again.\n\nExample usage:\n  \
ngsflow run --config ngsflow.yaml --datadir /runs/240101 --panel cardiac"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    pub log_json: bool,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand, Debug)]
pub enum Commands {
    /// Process the samples of a run directory.
    Run(RunArgs),

    /// Print the stage graph in execution order.
    Plan(PlanArgs),
}

/// Arguments for the run command.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Configuration file (YAML).
    #[arg(short, long, env = "NGSFLOW_CONFIG")]
    pub config: PathBuf,

    /// Run directory holding the read files.
    #[arg(short, long)]
    pub datadir: PathBuf,

    /// Panel name, as configured under `panels`.
    #[arg(short, long)]
    pub panel: String,

    /// Only process this sample (repeatable).
    #[arg(short, long = "sample")]
    pub samples: Vec<String>,

    /// Report file [default: <datadir>/pipeline_report.json].
    #[arg(long)]
    pub report: Option<PathBuf>,

    /// Maximum concurrent tool processes (overrides the configuration).
    #[arg(short = 'j', long)]
    pub workers: Option<usize>,
}

/// Arguments for the plan command.
#[derive(Parser, Debug)]
pub struct PlanArgs {
    /// Print artifact path templates.
    #[arg(long)]
    pub artifacts: bool,
}

/// Parse CLI arguments without running any command.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI with the parsed arguments and return the process exit code.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<ExitCode> {
    let code = match cli.command {
        Commands::Run(args) => run_pipeline_command(args).await?,
        Commands::Plan(args) => run_plan_command(&args)?,
    };
    Ok(ExitCode::from(code))
}

async fn run_pipeline_command(args: RunArgs) -> anyhow::Result<u8> {
    let config = match RunConfig::load(&args.config, &args.datadir, &args.panel) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, keys = ?e.keys, "Invalid configuration");
            eprintln!("error: {e}");
            return Ok(EXIT_PREFLIGHT);
        }
    };
    let config = match args.workers {
        Some(workers) => config.with_workers(workers),
        None => config,
    };

    let graph = match catalog::standard_graph() {
        Ok(graph) => graph,
        Err(e) => {
            error!(error = %e, code = e.code, "Invalid stage graph");
            eprintln!("error: {e}");
            return Ok(EXIT_PREFLIGHT);
        }
    };

    let cancel = Arc::new(CancellationToken::new());
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received; stopping running tools");
            interrupt.cancel("interrupted by operator");
        }
    });

    let orchestrator = PipelineOrchestrator::new(graph, Arc::new(config), Arc::new(ProcessInvoker::new()))
        .with_event_sink(Arc::new(LoggingEventSink::default()))
        .with_cancellation_token(cancel);

    let report = match orchestrator.run(&args.samples).await {
        Ok(report) => report,
        Err(e) => {
            error!(error = %e, kind = e.kind(), "Run aborted before processing samples");
            eprintln!("error: {e}");
            return Ok(EXIT_PREFLIGHT);
        }
    };

    let report_path = args
        .report
        .unwrap_or_else(|| args.datadir.join(DEFAULT_REPORT_NAME));
    report.write_json(&report_path)?;
    info!(report = %report_path.display(), "Report written");

    print_report(&report);
    if report.is_success() {
        Ok(0)
    } else {
        Ok(EXIT_FAILURES)
    }
}

fn run_plan_command(args: &PlanArgs) -> anyhow::Result<u8> {
    let graph = catalog::standard_graph()?;
    print!("{}", render_plan(&graph, args.artifacts));
    Ok(0)
}

/// Formats the graph as one line per stage, in execution order.
fn render_plan(graph: &StageGraph, artifacts: bool) -> String {
    let width = graph
        .execution_order()
        .iter()
        .map(String::len)
        .max()
        .unwrap_or(0);
    let mut out = String::new();
    for (i, stage) in graph.stages().enumerate() {
        let deps = if stage.dependencies.is_empty() {
            "-".to_string()
        } else {
            stage.dependencies.join(", ")
        };
        let _ = writeln!(
            out,
            "{:>2}. {:<width$}  [{}] {:<20} <- {}",
            i + 1,
            stage.name,
            stage.scope,
            stage.action.label(),
            deps
        );
        if artifacts {
            let _ = writeln!(out, "    {:<width$}  -> {}", "", stage.artifact);
        }
    }
    out
}

fn print_report(report: &PipelineReport) {
    println!("{}", report.summary());
    for rejected in &report.rejected {
        println!(
            "  rejected {}: {}",
            rejected.sample.as_deref().unwrap_or("-"),
            rejected.message
        );
    }
    for failure in report.failures() {
        println!(
            "  {}.{}: {} ({})",
            failure.target, failure.stage, failure.message, failure.kind
        );
    }
}
