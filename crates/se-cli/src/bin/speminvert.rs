// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralEM — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Trans-dimensional parallel-tempering inversion of an AEM survey line.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::info;

use se_chain::ChainConfig;
use se_cli::{basis_from_id, fail, init_tracing, load_systems};
use se_core::error::{CoreError, CoreResult};
use se_core::observations::Observations;
use se_core::prior::PriorProposal;
use se_sampler::{run_world, RunConfig, WorldConfig};

#[derive(Parser)]
#[command(
    author,
    version,
    about = "Trans-dimensional wavelet-tree inversion of AEM observations"
)]
struct Cli {
    /// Input observations file
    #[arg(short = 'i', long)]
    input: PathBuf,

    /// Output prefix of a previous run to restart from (per-chain
    /// final_model files)
    #[arg(short = 'I', long)]
    initial: Option<String>,

    /// Forward model descriptor (repeat once per system)
    #[arg(short = 's', long)]
    stm: Vec<PathBuf>,

    /// Noise model file (one per stm file)
    #[arg(short = 'H', long)]
    hierarchical: Vec<PathBuf>,

    /// Prior/proposal file; a built-in depth-scaled default otherwise
    #[arg(short = 'M', long = "prior-file")]
    prior_file: Option<PathBuf>,

    /// Output prefix for all per-chain files
    #[arg(short = 'o', long)]
    output: Option<String>,

    /// Number of vertical layers as a power of 2
    #[arg(short = 'd', long = "degree-depth", default_value_t = 5)]
    degree_depth: u32,

    /// Number of lateral points as a power of 2
    #[arg(short = 'l', long = "degree-lateral", default_value_t = 10)]
    degree_lateral: u32,

    /// Depth to half-space (m)
    #[arg(short = 'D', long, default_value_t = 500.0)]
    depth: f64,

    /// Total number of iterations
    #[arg(short = 't', long, default_value_t = 10_000)]
    total: usize,

    /// Random number seed base
    #[arg(short = 'S', long, default_value_t = 983)]
    seed: u64,

    /// Per-rank seed multiplier
    #[arg(short = 'F', long = "seed-mult", default_value_t = 101)]
    seed_mult: u64,

    /// Std deviation of the noise-scale walk (0 disables the move)
    #[arg(short = 'L', long = "lambda-std", default_value_t = 0.0)]
    lambda_std: f64,

    /// Std deviation of the prior-width walk (0 disables the move)
    #[arg(short = 'p', long = "prior-std", default_value_t = 0.0)]
    prior_std: f64,

    /// Maximum number of live coefficients
    #[arg(short = 'k', long, default_value_t = 100)]
    kmax: usize,

    /// Birth probability (death takes the same share)
    #[arg(short = 'B', long = "birth-probability", default_value_t = 0.05)]
    birth_probability: f64,

    /// Sample the prior over dimension only (likelihood held constant)
    #[arg(short = 'P', long)]
    posteriork: bool,

    /// Wavelet basis id for the vertical direction
    #[arg(short = 'w', long = "wavelet-vertical", default_value_t = 0)]
    wavelet_vertical: u32,

    /// Wavelet basis id for the horizontal direction
    #[arg(short = 'W', long = "wavelet-horizontal", default_value_t = 0)]
    wavelet_horizontal: u32,

    /// Steps between status printouts (0 disables)
    #[arg(short = 'v', long, default_value_t = 1000)]
    verbosity: usize,

    /// Chains per temperature level
    #[arg(short = 'c', long, default_value_t = 1)]
    chains: usize,

    /// Temperature levels
    #[arg(short = 'T', long, default_value_t = 1)]
    temperatures: usize,

    /// Maximum temperature of the ladder
    #[arg(short = 'm', long = "max-temperature", default_value_t = 1000.0)]
    max_temperature: f64,

    /// Steps between exchange proposals (0 disables)
    #[arg(short = 'e', long = "exchange-rate", default_value_t = 10)]
    exchange_rate: usize,

    /// Enable replica resampling
    #[arg(short = 'r', long)]
    resample: bool,

    /// Resampling donor temperature ceiling
    #[arg(short = 'U', long = "resample-temperature", default_value_t = 1.0)]
    resample_temperature: f64,

    /// Steps between resampling rounds (0: only at restart)
    #[arg(short = 'R', long = "resample-rate", default_value_t = 0)]
    resample_rate: usize,

    /// Total ranks; defaults to one per chain
    #[arg(long, default_value_t = 0)]
    ranks: usize,
}

fn run(cli: Cli) -> CoreResult<()> {
    let prefix = cli.output.clone();
    let _ = init_tracing();

    if !(0.0..=se_core::constants::PB_MAX).contains(&cli.birth_probability) {
        return Err(CoreError::Validation(format!(
            "birth probability must lie in [0, {}]",
            se_core::constants::PB_MAX
        )));
    }
    if cli.max_temperature < 1.0 {
        return Err(CoreError::Validation(
            "maximum temperature must be 1 or greater".into(),
        ));
    }
    if cli.total < 1 {
        return Err(CoreError::Validation("total must be greater than 0".into()));
    }

    let hbasis = basis_from_id(cli.wavelet_horizontal, "horizontal")?;
    let vbasis = basis_from_id(cli.wavelet_vertical, "vertical")?;

    let (observations, forwards, noises) = if cli.posteriork {
        (Arc::new(Observations::default()), Vec::new(), Vec::new())
    } else {
        let observations = Arc::new(Observations::read(&cli.input)?);
        let (forwards, noises) = load_systems(&cli.stm, &cli.hierarchical)?;
        (observations, forwards, noises)
    };

    let prior = match &cli.prior_file {
        Some(path) => PriorProposal::load(path)?,
        None => PriorProposal::default_for_depth(cli.degree_lateral.max(cli.degree_depth)),
    };

    let mut template = ChainConfig::new(cli.degree_lateral, cli.degree_depth, cli.depth);
    template.kmax = cli.kmax;
    template.posterior_k = cli.posteriork;
    template.hbasis = hbasis;
    template.vbasis = vbasis;

    let total_chains = cli.temperatures * cli.chains;
    let world = WorldConfig {
        world_size: if cli.ranks == 0 { total_chains } else { cli.ranks },
        temperatures: cli.temperatures,
        chains_per_temperature: cli.chains,
        max_temperature: cli.max_temperature,
        seed_base: cli.seed,
        seed_mult: cli.seed_mult,
    };

    let run = RunConfig {
        total: cli.total,
        birth_probability: cli.birth_probability,
        exchange_rate: cli.exchange_rate,
        resample: cli.resample,
        resample_temperature: cli.resample_temperature,
        resample_rate: cli.resample_rate,
        initial_resample: cli.resample && cli.initial.is_some(),
        per_rank_logs: true,
        lambda_std: cli.lambda_std,
        prior_std: cli.prior_std,
        verbosity: cli.verbosity,
        output_prefix: prefix,
        history_capacity: se_core::constants::CHAIN_HISTORY_STEPS,
        pairing_seed: cli.seed ^ 0x5e_ca_11,
    };

    let summaries = run_world(
        &world,
        &run,
        &template,
        observations,
        forwards,
        noises,
        prior,
        cli.initial.clone(),
    )?;

    for summary in &summaries {
        info!(
            chain = summary.chain_id,
            likelihood = summary.final_likelihood,
            log_normalization = summary.final_log_normalization,
            k = summary.final_k,
            swap_ratio = ?summary.swap_ratio,
            "chain finished"
        );
    }

    let path = PathBuf::from(format!("{}summary.json", cli.output.as_deref().unwrap_or("")));
    let json = serde_json::to_string_pretty(&summaries)
        .map_err(|e| CoreError::Validation(format!("failed to encode run summary: {e}")))?;
    std::fs::write(&path, json).map_err(|e| CoreError::io(&path, e))?;
    Ok(())
}

fn main() {
    let cli = Cli::parse();
    if let Err(err) = run(cli) {
        fail(err);
    }
}
