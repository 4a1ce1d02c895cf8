//! chipflow
#![deny(missing_docs)]

use anyhow::{bail, ensure, Context, Result};
use chip_lib::pseudo_replicate::{pseudo_replicate_paths, split_bam};
use chip_lib::stages::parse_spot_score;
use chip_lib::{ChipAnalysis, PipelineContext};
use chip_types::{make_safe_name, Configuration};
use chrono::Local;
use clap::{self, Parser};
use env_logger::Builder;
use itertools::Itertools;
use log::{info, LevelFilter};
use std::env;
use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;

const CMD: &str = "chipflow";

/// Align, visualize and call peaks on ChIP-seq data
#[derive(Parser, Debug)]
#[clap(name = CMD, version)]
struct ChipFlow {
    #[clap(subcommand)]
    subcmd: SubCommand,

    /// Log debug messages
    #[clap(short, long, global = true)]
    verbose: bool,
}

#[derive(Parser, Debug)]
enum SubCommand {
    /// Run the analysis described by a configuration file.
    #[clap(name = "analyze")]
    Analyze(Analyze),

    /// Randomly split a BAM file into disjoint pseudo-replicates.
    #[clap(name = "pseudo-replicate-bam")]
    PseudoReplicateBam(PseudoReplicateBam),

    /// Print the score from a hotspot .spot.out file.
    #[clap(name = "spot-score")]
    SpotScore(SpotScore),
}

#[derive(Parser, Debug)]
struct Analyze {
    /// TOML configuration of settings, samples and peak callers.
    #[clap(short, long, value_name = "TOML")]
    config: PathBuf,

    /// Output directory, overriding the configured output_base.
    #[clap(short, long, value_name = "DIR")]
    output: Option<PathBuf>,
}

#[derive(Parser, Debug)]
struct PseudoReplicateBam {
    /// Coordinate-sorted input BAM.
    #[clap(short, long, value_name = "BAM")]
    bam: PathBuf,

    /// Directory for the replicates; defaults to the directory of the input.
    #[clap(short, long, value_name = "DIR")]
    output: Option<PathBuf>,

    /// Number of replicates.
    #[clap(short = 'r', long, default_value_t = 2)]
    replicates: usize,

    /// Random seed; drawn at random when absent.
    #[clap(long)]
    seed: Option<u64>,
}

#[derive(Parser, Debug)]
struct SpotScore {
    /// hotspot .spot.out file
    path: PathBuf,
}

/// Print an error chain.
fn print_error_chain(err: &anyhow::Error) {
    println!("ERROR: {}", err.chain().join("\n\tCaused by: "));
}

fn setup_logging(verbose: bool) {
    let level = if verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    Builder::new()
        .format(|buf, record| {
            writeln!(
                buf,
                "{} [{}] - {}",
                Local::now().format("%Y-%m-%dT%H:%M:%S"),
                record.level(),
                record.args()
            )
        })
        .filter(None, level)
        .parse_default_env()
        .init();
}

fn analyze(args: Analyze) -> Result<ExitCode> {
    let mut config = Configuration::from_file(&args.config)?;
    if let Some(output) = args.output {
        config.settings.output_base = output;
        let cwd = env::current_dir().context("reading the working directory")?;
        config.settings.resolve_paths(&cwd);
    }
    let ctx = PipelineContext::with_cluster(config.settings.clone())?;
    let outcome = ChipAnalysis::new(config, ctx).run()?;
    if outcome.succeeded() {
        if let Some(report) = &outcome.report {
            println!("Run report: {}", report.display());
        }
        return Ok(ExitCode::SUCCESS);
    }
    for err in &outcome.errors {
        println!("ERROR: {err}");
    }
    println!("{} errors, the run stopped early", outcome.errors.len());
    Ok(ExitCode::FAILURE)
}

fn pseudo_replicate_bam(args: PseudoReplicateBam) -> Result<ExitCode> {
    ensure!(
        args.replicates > 1,
        "need at least 2 replicates, got {}",
        args.replicates
    );
    let Some(stem) = args.bam.file_stem() else {
        bail!("{} is not a file name", args.bam.display());
    };
    let out_dir = match args.output {
        Some(dir) => dir,
        None => args
            .bam
            .parent()
            .map(PathBuf::from)
            .unwrap_or_default(),
    };
    let paths = pseudo_replicate_paths(
        &out_dir,
        &make_safe_name(&stem.to_string_lossy()),
        args.replicates,
    );
    if let Some(existing) = paths.iter().find(|p| p.exists()) {
        bail!("refusing to overwrite {}", existing.display());
    }
    let seed = args.seed.unwrap_or_else(rand::random);
    info!("splitting {} with seed {seed}", args.bam.display());
    let counts = split_bam(&args.bam, &paths, seed)
        .with_context(|| format!("splitting {}", args.bam.display()))?;
    for (path, n) in paths.iter().zip(counts) {
        println!("{}\t{n}", path.display());
    }
    Ok(ExitCode::SUCCESS)
}

fn spot_score(args: SpotScore) -> Result<ExitCode> {
    println!("{}", parse_spot_score(&args.path)?);
    Ok(ExitCode::SUCCESS)
}

fn inner_main() -> Result<ExitCode> {
    let opts = ChipFlow::parse();
    setup_logging(opts.verbose);
    match opts.subcmd {
        SubCommand::Analyze(args) => analyze(args),
        SubCommand::PseudoReplicateBam(args) => pseudo_replicate_bam(args),
        SubCommand::SpotScore(args) => spot_score(args),
    }
}

fn main() -> ExitCode {
    match inner_main() {
        Ok(code) => code,
        Err(err) => {
            print_error_chain(&err);
            ExitCode::FAILURE
        }
    }
}
