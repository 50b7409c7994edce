// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralEM — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Postprocessing of recorded chain histories: posterior image summaries,
//! likelihood validation, and coefficient-count traces.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};

use se_chain::{ChainConfig, ChainState, System};
use se_cli::{basis_from_id, fail, init_tracing, load_systems};
use se_core::comms::Comm;
use se_core::error::CoreResult;
use se_core::observations::Observations;
use se_core::prior::PriorProposal;
use se_post::{
    validate_likelihood, write_khistory, PosteriorSummary, SummaryConfig, ValidateConfig,
};

const CREDIBLE_INTERVAL: f64 = 0.95;

#[derive(Parser)]
#[command(author, version, about = "Chain-history postprocessing")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Posterior image summary: mean, spread, and interval grids
    Mean(MeanArgs),
    /// Recompute recorded likelihoods and report the maximum error
    Validate(ValidateArgs),
    /// Dump the live coefficient count of every step
    Khistory(KhistoryArgs),
}

#[derive(clap::Args)]
struct MeanArgs {
    /// Input chain history file (repeatable)
    #[arg(short = 'i', long)]
    input: Vec<PathBuf>,

    /// Output mean grid
    #[arg(short = 'o', long)]
    output: PathBuf,

    #[arg(short = 'd', long = "degree-depth", default_value_t = 5)]
    degree_depth: u32,

    #[arg(short = 'l', long = "degree-lateral", default_value_t = 8)]
    degree_lateral: u32,

    /// Output variance grid
    #[arg(short = 'v', long)]
    variance: Option<PathBuf>,

    /// Output standard deviation grid
    #[arg(short = 'D', long)]
    stddev: Option<PathBuf>,

    /// Output histogram-mode grid
    #[arg(short = 'm', long)]
    mode: Option<PathBuf>,

    /// Output median grid
    #[arg(short = 'M', long)]
    median: Option<PathBuf>,

    /// Output credible-interval lower bound grid
    #[arg(short = 'c', long = "credible-min")]
    credible_min: Option<PathBuf>,

    /// Output credible-interval upper bound grid
    #[arg(short = 'C', long = "credible-max")]
    credible_max: Option<PathBuf>,

    /// Output raw per-pixel histograms
    #[arg(short = 'g', long)]
    histogram: Option<PathBuf>,

    /// Output HPD lower bound grid
    #[arg(short = 'p', long = "hpd-min")]
    hpd_min: Option<PathBuf>,

    /// Output HPD upper bound grid
    #[arg(short = 'P', long = "hpd-max")]
    hpd_max: Option<PathBuf>,

    /// Output HPD width grid
    #[arg(short = 'Q', long = "hpd-range")]
    hpd_range: Option<PathBuf>,

    #[arg(short = 'b', long, default_value_t = 1000)]
    bins: usize,

    #[arg(short = 'z', long, default_value_t = 0.001)]
    vmin: f64,

    #[arg(short = 'Z', long, default_value_t = 1.0)]
    vmax: f64,

    /// Skip this many leading steps
    #[arg(short = 's', long, default_value_t = 0)]
    skip: usize,

    /// Fold in only every i-th step
    #[arg(short = 't', long, default_value_t = 0)]
    thin: usize,

    #[arg(short = 'w', long = "wavelet-vertical", default_value_t = 0)]
    wavelet_vertical: u32,

    #[arg(short = 'W', long = "wavelet-horizontal", default_value_t = 0)]
    wavelet_horizontal: u32,

    /// Models are log-conductivity: exponentiate reconstructions
    #[arg(short = 'L', long)]
    log: bool,
}

#[derive(clap::Args)]
struct ValidateArgs {
    /// Input chain history file
    #[arg(short = 'i', long)]
    input: PathBuf,

    /// Observations the run inverted
    #[arg(short = 'O', long)]
    observations: PathBuf,

    /// Forward model descriptor (repeat once per system)
    #[arg(short = 'S', long)]
    stm: Vec<PathBuf>,

    /// Noise model file (one per stm file)
    #[arg(short = 'H', long)]
    hierarchical: Vec<PathBuf>,

    #[arg(short = 'd', long = "degree-depth", default_value_t = 5)]
    degree_depth: u32,

    #[arg(short = 'l', long = "degree-lateral", default_value_t = 8)]
    degree_lateral: u32,

    #[arg(short = 'D', long, default_value_t = 200.0)]
    depth: f64,

    #[arg(short = 's', long, default_value_t = 0)]
    skip: usize,

    #[arg(short = 't', long, default_value_t = 0)]
    thin: usize,

    /// Maximum number of steps to recompute
    #[arg(short = 'm', long, default_value_t = 1000)]
    max: usize,

    #[arg(short = 'w', long = "wavelet-vertical", default_value_t = 0)]
    wavelet_vertical: u32,

    #[arg(short = 'W', long = "wavelet-horizontal", default_value_t = 0)]
    wavelet_horizontal: u32,
}

#[derive(clap::Args)]
struct KhistoryArgs {
    /// Input chain history file
    #[arg(short = 'i', long)]
    input: PathBuf,

    /// Output k-trace file
    #[arg(short = 'o', long)]
    output: PathBuf,

    #[arg(short = 't', long, default_value_t = 0)]
    thin: usize,
}

fn run_mean(args: MeanArgs) -> CoreResult<()> {
    if args.input.is_empty() {
        return Err(se_core::error::CoreError::Validation(
            "at least one input chain history is required".into(),
        ));
    }
    let mut summary = PosteriorSummary::new(SummaryConfig {
        degree_x: args.degree_lateral,
        degree_y: args.degree_depth,
        hbasis: basis_from_id(args.wavelet_horizontal, "horizontal")?,
        vbasis: basis_from_id(args.wavelet_vertical, "vertical")?,
        bins: args.bins,
        vmin: args.vmin,
        vmax: args.vmax,
        skip: args.skip,
        thin: args.thin,
        exponentiate: args.log,
    })?;

    for input in &args.input {
        let folded = summary.consume_file(input)?;
        println!("{}: {folded} records", input.display());
    }
    println!("Min: {:10.6}", summary.min_seen);
    println!("Max: {:10.6}", summary.max_seen);

    summary.write_grid(&args.output, summary.mean())?;
    if let Some(path) = &args.variance {
        summary.write_grid(path, &summary.variance())?;
    }
    if let Some(path) = &args.stddev {
        summary.write_grid(path, &summary.stddev())?;
    }
    if let Some(path) = &args.mode {
        summary.write_grid(path, &summary.mode())?;
    }
    if let Some(path) = &args.median {
        summary.write_grid(path, &summary.median())?;
    }
    if let Some(path) = &args.credible_min {
        summary.write_grid(path, &summary.credible_min(CREDIBLE_INTERVAL))?;
    }
    if let Some(path) = &args.credible_max {
        summary.write_grid(path, &summary.credible_max(CREDIBLE_INTERVAL))?;
    }
    if let Some(path) = &args.histogram {
        summary.save_histogram(path)?;
    }
    if args.hpd_min.is_some() || args.hpd_max.is_some() || args.hpd_range.is_some() {
        let (range, low, high) = summary.hpd(CREDIBLE_INTERVAL);
        if let Some(path) = &args.hpd_range {
            summary.write_grid(path, &range)?;
        }
        if let Some(path) = &args.hpd_min {
            summary.write_grid(path, &low)?;
        }
        if let Some(path) = &args.hpd_max {
            summary.write_grid(path, &high)?;
        }
    }
    Ok(())
}

fn run_validate(args: ValidateArgs) -> CoreResult<()> {
    let observations = Arc::new(Observations::read(&args.observations)?);
    let (forwards, noises) = load_systems(&args.stm, &args.hierarchical)?;
    let systems: Vec<System> = forwards
        .into_iter()
        .zip(noises)
        .map(|(f, n)| System::new(f, n))
        .collect();

    let mut config = ChainConfig::new(args.degree_lateral, args.degree_depth, args.depth);
    config.hbasis = basis_from_id(args.wavelet_horizontal, "horizontal")?;
    config.vbasis = basis_from_id(args.wavelet_vertical, "vertical")?;
    let mut state = ChainState::new(
        &config,
        observations,
        systems,
        PriorProposal::default_for_depth(args.degree_lateral.max(args.degree_depth)),
        Comm::Solo,
        1.0,
    )?;

    let report = validate_likelihood(
        &mut state,
        &args.input,
        ValidateConfig {
            skip: args.skip,
            thin: args.thin,
            max_checks: args.max,
        },
    )?;
    println!(
        "Checked {}/{}({}) records",
        report.checked, report.accepted, report.steps
    );
    println!("Max. Error: {:.6e}", report.max_error);
    Ok(())
}

fn run_khistory(args: KhistoryArgs) -> CoreResult<()> {
    let written = write_khistory(&args.input, &args.output, args.thin)?;
    println!("{written} records");
    Ok(())
}

fn main() {
    let cli = Cli::parse();
    let _ = init_tracing();
    let result = match cli.command {
        Command::Mean(args) => run_mean(args),
        Command::Validate(args) => run_validate(args),
        Command::Khistory(args) => run_khistory(args),
    };
    if let Err(err) = result {
        fail(err);
    }
}
