//! floodline: run floodplain projects from the command line.
//!
//! Each stage subcommand runs one memoized stage against the project's
//! workspace; `run` executes the core stages in order. `diagnose` runs
//! the whole pipeline in memory and prints per-stage timings and counts,
//! which is the quickest way to tune thresholds.
//!
//! # Usage
//!
//! ```text
//! floodline --project site.json init
//! floodline --project site.json run
//! floodline --project site.json diagnose --runs 3
//! ```

#![allow(clippy::print_stdout, clippy::print_stderr)]

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use floodline_io::{ExistingOutputs, ProjectConfig, StageId, StageOutcome, Workflow};
use floodline_pipeline::diagnostics::{Clock, PipelineDiagnostics};
use floodline_pipeline::{
    FloodlineConfig, FloodplainConfig, FlowNetworkConfig, NetworkConfig, PositionConfig,
};
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

/// Derive flowlines, hydrographic position and floodplains from an
/// elevation raster and splice them into image segments.
#[derive(Parser)]
#[command(name = "floodline", version)]
struct Cli {
    /// Project file.
    #[arg(long, global = true, default_value = "floodline.json")]
    project: PathBuf,

    /// More logging (repeat for trace).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Only log warnings and errors.
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,

    /// Override the project's existing-output policy.
    #[arg(long, global = true, value_enum)]
    overwrite_policy: Option<Policy>,

    /// Write a PNG quicklook next to every raster output.
    #[arg(long, global = true)]
    preview: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Derive the flow network and write stream and river flowlines.
    Flowlines,
    /// Compute hydrographic position for every configured network.
    Position,
    /// Merge position rasters into floodplain boundaries.
    Floodplain,
    /// Splice the segmentation polygons along the floodplain.
    Splice,
    /// Summarize a value raster over the spliced segments.
    Zonal,
    /// Remove small regions from a categorical raster.
    Generalize,
    /// Run flowlines, position, floodplain and splice in order.
    Run,
    /// Run the pipeline in memory and report per-stage diagnostics.
    Diagnose(DiagnoseArgs),
    /// Write a new project file with default parameters.
    Init(InitArgs),
}

#[derive(clap::Args)]
struct DiagnoseArgs {
    /// Output diagnostics as JSON instead of a human-readable report.
    #[arg(long)]
    json: bool,

    /// Number of runs for averaging.
    #[arg(long, default_value_t = 1, value_parser = clap::builder::RangedU64ValueParser::<usize>::new().range(1..))]
    runs: usize,

    /// Full parameter set as a JSON string, replacing the project's.
    #[arg(long)]
    config_json: Option<String>,
}

#[derive(clap::Args)]
struct InitArgs {
    /// Workspace directory, relative to the project file.
    #[arg(long, default_value = "workspace")]
    workspace: PathBuf,

    /// Minimum upstream cell count for a channel cell.
    #[arg(long, default_value_t = FlowNetworkConfig::DEFAULT_ACCUMULATION_THRESHOLD)]
    accumulation_threshold: f64,

    /// Maximum depression depth that is filled.
    #[arg(long, default_value_t = FlowNetworkConfig::DEFAULT_FILL_TOLERANCE)]
    fill_tolerance: f64,

    /// Fill every depression regardless of depth.
    #[arg(long, conflicts_with = "fill_tolerance")]
    fill_all: bool,

    /// Buffer around the study area bounding the routing extent.
    #[arg(long, default_value_t = FlowNetworkConfig::DEFAULT_CALCULATION_BUFFER)]
    calculation_buffer: f64,

    /// Highest Strahler order still classified as stream.
    #[arg(long, default_value_t = FlowNetworkConfig::DEFAULT_ORDER_CUTOFF)]
    order_cutoff: u32,

    /// Position ceiling sentinel.
    #[arg(long, default_value_t = PositionConfig::DEFAULT_CEILING)]
    ceiling: i32,

    /// Excluded polygons smaller than this become floodplain.
    #[arg(long, default_value_t = FloodplainConfig::DEFAULT_AREA_LIMIT)]
    area_limit: f64,

    /// Stream position threshold.
    #[arg(long, default_value_t = NetworkConfig::DEFAULT_STREAM_THRESHOLD)]
    stream_threshold: i32,

    /// River position threshold.
    #[arg(long, default_value_t = NetworkConfig::DEFAULT_RIVER_THRESHOLD)]
    river_threshold: i32,

    /// Where the parameter values come from.
    #[arg(long)]
    provenance: Option<String>,
}

/// Existing-output policy selection.
#[derive(Clone, Copy, ValueEnum)]
enum Policy {
    /// Skip a stage whose outputs all exist.
    Skip,
    /// Refuse to run when any output exists.
    Fail,
}

impl From<Policy> for ExistingOutputs {
    fn from(policy: Policy) -> Self {
        match policy {
            Policy::Skip => Self::Skip,
            Policy::Fail => Self::Fail,
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    setup_logging(cli.verbose, cli.quiet);

    match dispatch(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn setup_logging(verbose: u8, quiet: bool) {
    let level = match (quiet, verbose) {
        (true, _) => Level::WARN,
        (false, 0) => Level::INFO,
        (false, 1) => Level::DEBUG,
        (false, _) => Level::TRACE,
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("could not install logger: {e}");
    }
}

fn dispatch(cli: &Cli) -> Result<()> {
    let stage = match &cli.command {
        Command::Init(args) => return init(&cli.project, args),
        Command::Diagnose(args) => return diagnose(&load(&cli.project)?, args),
        Command::Run => None,
        Command::Flowlines => Some(StageId::Flowlines),
        Command::Position => Some(StageId::Position),
        Command::Floodplain => Some(StageId::Floodplain),
        Command::Splice => Some(StageId::Splice),
        Command::Zonal => Some(StageId::Zonal),
        Command::Generalize => Some(StageId::Generalize),
    };

    let project = load(&cli.project)?;
    let workflow =
        Workflow::new(&project, cli.overwrite_policy.map(Into::into)).with_previews(cli.preview);
    let outcomes = match stage {
        Some(stage) => vec![(
            stage,
            workflow
                .run_stage(stage)
                .with_context(|| format!("{stage} stage failed"))?,
        )],
        None => workflow.run().context("run failed")?,
    };
    for (stage, outcome) in outcomes {
        let verb = match outcome {
            StageOutcome::Ran => "done",
            StageOutcome::Skipped => "skipped (outputs exist)",
        };
        eprintln!("{stage}: {verb}");
    }
    Ok(())
}

fn load(path: &Path) -> Result<ProjectConfig> {
    ProjectConfig::load(path).with_context(|| format!("loading project {}", path.display()))
}

fn init(path: &Path, args: &InitArgs) -> Result<()> {
    let mut parameters = FloodlineConfig {
        provenance: args.provenance.clone(),
        flow: FlowNetworkConfig {
            accumulation_threshold: args.accumulation_threshold,
            fill_tolerance: (!args.fill_all).then_some(args.fill_tolerance),
            calculation_buffer: args.calculation_buffer,
            order_cutoff: args.order_cutoff,
        },
        position: PositionConfig {
            ceiling: args.ceiling,
            ..PositionConfig::default()
        },
        floodplain: FloodplainConfig {
            area_limit: args.area_limit,
            ..FloodplainConfig::default()
        },
        ..FloodlineConfig::default()
    };
    for network in &mut parameters.networks {
        network.threshold = match network.kind {
            floodline_pipeline::NetworkKind::Stream => args.stream_threshold,
            floodline_pipeline::NetworkKind::River => args.river_threshold,
        };
    }
    parameters.validate().context("invalid parameters")?;

    let project = ProjectConfig {
        workspace: args.workspace.clone(),
        parameters,
        ..ProjectConfig::default()
    };
    project
        .save_new(path)
        .with_context(|| format!("writing project {}", path.display()))?;
    eprintln!("Project written to {}", path.display());
    Ok(())
}

fn diagnose(project: &ProjectConfig, args: &DiagnoseArgs) -> Result<()> {
    let config: FloodlineConfig = match &args.config_json {
        Some(json) => serde_json::from_str(json).context("parsing --config-json")?,
        None => project.parameters.clone(),
    };
    let inputs = Workflow::new(project, None)
        .load_inputs()
        .context("loading inputs")?;

    eprintln!("Project: {}", project.workspace.display());
    eprintln!("Config: {config:#?}");
    eprintln!("Runs: {}", args.runs);
    eprintln!();

    let mut all_diagnostics = Vec::with_capacity(args.runs);
    for run in 0..args.runs {
        if args.runs > 1 {
            eprintln!("--- Run {}/{} ---", run + 1, args.runs);
        }
        let (_, diagnostics) = floodline_pipeline::process_staged_with_diagnostics(
            inputs.clone(),
            &config,
            &StdClock,
        )
        .context("pipeline failed")?;
        if args.json {
            println!(
                "{}",
                serde_json::to_string_pretty(&diagnostics).context("serializing diagnostics")?
            );
        } else {
            println!("{}", diagnostics.report());
        }
        all_diagnostics.push(diagnostics);
    }

    if args.runs > 1 {
        print_multi_run_summary(&all_diagnostics);
    }
    Ok(())
}

/// [`Clock`] implementation backed by [`std::time::Instant`].
struct StdClock;

impl Clock for StdClock {
    type Instant = Instant;

    fn now(&self) -> Instant {
        Instant::now()
    }

    fn elapsed(&self, since: &Instant) -> Duration {
        since.elapsed()
    }
}

/// Function pointer type for extracting a stage duration from diagnostics.
type StageExtractor = fn(&PipelineDiagnostics) -> Duration;

/// Print aggregated statistics across multiple runs.
#[allow(clippy::cast_precision_loss)]
fn print_multi_run_summary(all_diagnostics: &[PipelineDiagnostics]) {
    if all_diagnostics.is_empty() {
        println!("Warning: no diagnostics to summarize");
        return;
    }

    println!();
    println!(
        "Summary ({} runs)\n{}",
        all_diagnostics.len(),
        "=".repeat(60),
    );

    let durations: Vec<f64> = all_diagnostics
        .iter()
        .map(|d| d.total_duration.as_secs_f64() * 1000.0)
        .collect();
    let min = durations.iter().copied().reduce(f64::min).unwrap_or(0.0);
    let max = durations.iter().copied().reduce(f64::max).unwrap_or(0.0);
    let mean = durations.iter().sum::<f64>() / durations.len() as f64;
    println!("Total duration: min={min:.3}ms  mean={mean:.3}ms  max={max:.3}ms");

    println!();
    println!("{:<24} {:>12}", "Stage", "Mean (ms)");
    println!("{}", "-".repeat(40));

    let stage_extractors: &[(&str, StageExtractor)] = &[
        ("Flow Network", |d| d.flow_network.duration),
        ("Position", |d| d.positions.duration),
        ("Floodplain", |d| d.floodplain.duration),
        ("Splice", |d| d.splice.duration),
    ];
    for (name, extractor) in stage_extractors {
        let stage_mean = all_diagnostics
            .iter()
            .map(|d| extractor(d).as_secs_f64() * 1000.0)
            .sum::<f64>()
            / all_diagnostics.len() as f64;
        println!("{name:<24} {stage_mean:>10.3}ms");
    }
}
