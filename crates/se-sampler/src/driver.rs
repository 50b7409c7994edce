// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralEM — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! The single SPMD iteration loop.
//!
//! Every rank executes the same sequence: barrier, shared move draw, move
//! step, bookkeeping, periodic exchange and resampling. Chain roots own
//! the chain-history ring and the per-chain output files. A failing rank
//! poisons its communicators so the whole world observes the failure at
//! the next collective.

use std::fs::File;
use std::io::{BufWriter, Write as _};
use std::path::PathBuf;
use std::sync::Arc;

use rand::Rng;
use serde::Serialize;
use tracing::info;
use tracing_subscriber::EnvFilter;

use se_chain::{ChainConfig, ChainHistory, ChainState, DeltaRecord, InitRecord, System};
use se_core::comms::{Fabric, RankComms};
use se_core::error::{CoreError, CoreResult};
use se_core::forward::ForwardModel;
use se_core::noise::NoiseModel;
use se_core::observations::Observations;
use se_core::prior::PriorProposal;

use crate::birth::Birth;
use crate::death::Death;
use crate::hierarchical::Hierarchical;
use crate::hierarchical_prior::HierarchicalPrior;
use crate::ptexchange::PtExchange;
use crate::resample::Resample;
use crate::stats::StepRecord;
use crate::value::Value;

/// Per-chain output file: `<prefix><name>-NNN`.
pub fn chain_file(prefix: Option<&str>, name: &str, id: usize) -> PathBuf {
    PathBuf::from(format!("{}{name}-{id:03}", prefix.unwrap_or("")))
}

/// Builds the subscriber behind one rank's `log.txt-NNN`. Installed with
/// a thread-scoped default inside the rank's thread, never globally, so
/// every rank gets its own file.
fn per_rank_subscriber(
    prefix: Option<&str>,
    rank: usize,
) -> CoreResult<impl tracing::Subscriber + Send + Sync> {
    let path = chain_file(prefix, "log.txt", rank);
    let file = File::create(&path).map_err(|e| CoreError::io(&path, e))?;
    Ok(tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .with_ansi(false)
        .with_writer(Arc::new(file))
        .finish())
}

/// Run-wide sampling parameters.
#[derive(Clone, Debug)]
pub struct RunConfig {
    pub total: usize,
    pub birth_probability: f64,
    pub exchange_rate: usize,
    pub resample: bool,
    pub resample_temperature: f64,
    pub resample_rate: usize,
    pub initial_resample: bool,
    /// Give every rank its own `log.txt-NNN` via a thread-scoped
    /// subscriber.
    pub per_rank_logs: bool,
    /// Zero disables the hierarchical noise move.
    pub lambda_std: f64,
    /// Zero disables the hierarchical prior-width move.
    pub prior_std: f64,
    pub verbosity: usize,
    pub output_prefix: Option<String>,
    pub history_capacity: usize,
    pub pairing_seed: u64,
}

impl Default for RunConfig {
    fn default() -> Self {
        RunConfig {
            total: 10_000,
            birth_probability: 0.05,
            exchange_rate: 10,
            resample: false,
            resample_temperature: 1.0,
            resample_rate: 0,
            initial_resample: false,
            per_rank_logs: false,
            lambda_std: 0.0,
            prior_std: 0.0,
            verbosity: 1000,
            output_prefix: None,
            history_capacity: se_core::constants::CHAIN_HISTORY_STEPS,
            pairing_seed: 0x5e_ca_11,
        }
    }
}

/// What one chain reports at the end of a run.
#[derive(Clone, Debug, Serialize)]
pub struct RunSummary {
    pub chain_id: usize,
    pub final_likelihood: f64,
    pub final_log_normalization: f64,
    pub final_k: usize,
    pub swap_ratio: Option<f64>,
}

fn base_record(state: &ChainState) -> InitRecord {
    InitRecord {
        live: state.tree.live_snapshot(),
        likelihood: state.current_likelihood,
        temperature: state.temperature,
        lambda_scale: state.lambda_scale,
        log_normalization: state.current_log_normalization,
    }
}

struct HistoryWriter {
    history: ChainHistory,
    file: BufWriter<File>,
}

impl HistoryWriter {
    fn open(capacity: usize, path: PathBuf, state: &ChainState) -> CoreResult<Self> {
        let file = File::create(&path).map_err(|e| CoreError::io(&path, e))?;
        let mut history = ChainHistory::new(capacity);
        history.initialise(base_record(state));
        Ok(HistoryWriter {
            history,
            file: BufWriter::new(file),
        })
    }

    fn append(&mut self, state: &ChainState, rec: StepRecord) -> CoreResult<()> {
        if self.history.is_full() {
            self.history.write_segment(&mut self.file)?;
            self.history.initialise(base_record(state));
        }
        self.history.add_step(DeltaRecord {
            kind: rec.kind,
            accepted: rec.accepted,
            idx: rec.idx,
            depth: rec.depth,
            new_value: rec.new_value,
            old_value: rec.old_value,
            likelihood: state.current_likelihood,
            temperature: state.temperature,
            lambda_scale: state.lambda_scale,
            log_normalization: state.current_log_normalization,
        })
    }

    /// Flush and restart the segment on a new base model (swap, resample).
    fn rebase(&mut self, state: &ChainState) -> CoreResult<()> {
        self.history.write_segment(&mut self.file)?;
        self.history.initialise(base_record(state));
        Ok(())
    }

    fn finish(mut self) -> CoreResult<()> {
        if self.history.len() > 1 {
            self.history.write_segment(&mut self.file)?;
        }
        self.file
            .flush()
            .map_err(|e| CoreError::io("<chain history>", e))
    }
}

/// Runs the sampler loop on one rank. Every rank of the world calls this
/// with its own communicator bundle and replica state.
pub fn run_chain(
    cfg: &RunConfig,
    comms: &RankComms,
    state: &mut ChainState,
) -> CoreResult<RunSummary> {
    let chain_id = comms.layout.chain_id;
    let chain_root = state.comm.is_root();
    let prefix = cfg.output_prefix.as_deref();

    let (like, norm) = state.likelihood()?;
    state.current_likelihood = like;
    state.current_log_normalization = norm;
    state.accept();
    if chain_root {
        info!(
            chain = chain_id,
            likelihood = like,
            log_normalization = norm,
            temperature = state.temperature,
            "initial likelihood"
        );
    }

    let max_depth = state.tree.max_depth();
    let mut birth = Birth::new(max_depth);
    let mut death = Death::new(max_depth);
    let mut value = Value::new(max_depth);
    let mut hierarchical = (cfg.lambda_std > 0.0).then(|| Hierarchical::new(cfg.lambda_std));
    let mut hierarchical_prior =
        (cfg.prior_std > 0.0).then(|| HierarchicalPrior::new(cfg.prior_std));
    let mut exchange = PtExchange::new(cfg.pairing_seed);
    let mut resampler = cfg.resample.then(|| Resample::new(cfg.pairing_seed ^ 0x7e5a));

    if let Some(resampler) = resampler.as_mut() {
        if cfg.initial_resample {
            let changed = resampler.step(
                state,
                comms.temperature.as_ref(),
                cfg.resample_temperature,
            )?;
            if changed && chain_root {
                info!(chain = chain_id, "adopted a resampled starting model");
            }
        }
    }

    let mut khistogram = chain_root.then(|| vec![0u64; state.kmax]);
    let mut writer = if chain_root && !state.posterior_k {
        Some(HistoryWriter::open(
            cfg.history_capacity,
            chain_file(prefix, "ch.dat", chain_id),
            state,
        )?)
    } else {
        None
    };

    for i in 0..cfg.total {
        comms.global.barrier()?;

        let mut draw = [0.0f64];
        if chain_root {
            draw[0] = state.rng.gen();
        }
        state.comm.broadcast_f64s(&mut draw, 0)?;

        let record = if draw[0] < cfg.birth_probability {
            birth.step(state)?
        } else if draw[0] < 2.0 * cfg.birth_probability {
            death.step(state)?
        } else {
            value.step(state)?
        };

        let k = state.tree.coefficient_count();
        if let Some(kh) = khistogram.as_mut() {
            kh[(k - 1).min(state.kmax - 1)] += 1;
        }
        if let Some(writer) = writer.as_mut() {
            writer.append(state, record)?;
        }

        if let Some(h) = hierarchical.as_mut() {
            let record = h.step(state)?;
            if let Some(writer) = writer.as_mut() {
                writer.append(state, record)?;
            }
        }

        if let Some(hp) = hierarchical_prior.as_mut() {
            let record = hp.step(state)?;
            if let Some(writer) = writer.as_mut() {
                writer.append(state, record)?;
            }
        }

        if cfg.exchange_rate > 0 && (i + 1) % cfg.exchange_rate == 0 {
            let changed = exchange.step(state, comms.temperature.as_ref())?;
            if changed {
                if let Some(writer) = writer.as_mut() {
                    writer.rebase(state)?;
                }
            }
        }

        if let Some(resampler) = resampler.as_mut() {
            if cfg.resample_rate > 0 && (i + 1) % cfg.resample_rate == 0 {
                let changed = resampler.step(
                    state,
                    comms.temperature.as_ref(),
                    cfg.resample_temperature,
                )?;
                if changed {
                    if let Some(writer) = writer.as_mut() {
                        writer.rebase(state)?;
                    }
                }
            }
        }

        if chain_root && cfg.verbosity > 0 && (i + 1) % cfg.verbosity == 0 {
            info!(
                chain = chain_id,
                step = i + 1,
                likelihood = state.current_likelihood,
                log_normalization = state.current_log_normalization,
                k,
                dc = state.tree.root_value(),
                lambda = state.lambda_scale,
                temperature = state.temperature,
                "status"
            );
            info!("{}", birth.stats.write_long_stats());
            info!("{}", death.stats.write_long_stats());
            info!("{}", value.stats.write_long_stats());
            if let Some(h) = hierarchical.as_ref() {
                info!("{}", h.stats.write_long_stats());
            }
            if let Some(hp) = hierarchical_prior.as_ref() {
                info!("{}", hp.stats.write_long_stats());
            }
            info!("{}", exchange.stats.write_long_stats());
            if let Some(r) = resampler.as_ref() {
                info!("{}", r.stats.write_long_stats());
            }
        }
    }

    if chain_root {
        if let Some(kh) = khistogram.as_ref() {
            let path = chain_file(prefix, "khistogram.txt", chain_id);
            let mut out = BufWriter::new(File::create(&path).map_err(|e| CoreError::io(&path, e))?);
            for (i, count) in kh.iter().enumerate() {
                writeln!(out, "{} {}", i + 1, count).map_err(|e| CoreError::io(&path, e))?;
            }
            out.flush().map_err(|e| CoreError::io(&path, e))?;
        }

        if let Some(writer) = writer {
            writer.finish()?;
        }

        let path = chain_file(prefix, "acceptance.txt", chain_id);
        let mut out = BufWriter::new(File::create(&path).map_err(|e| CoreError::io(&path, e))?);
        let mut lines = vec![
            birth.stats.write_long_stats(),
            death.stats.write_long_stats(),
            value.stats.write_long_stats(),
        ];
        if let Some(h) = hierarchical.as_ref() {
            lines.push(h.stats.write_long_stats());
        }
        if let Some(hp) = hierarchical_prior.as_ref() {
            lines.push(hp.stats.write_long_stats());
        }
        lines.push(exchange.stats.write_long_stats());
        if let Some(r) = resampler.as_ref() {
            lines.push(r.stats.write_long_stats());
        }
        for line in lines {
            writeln!(out, "{line}").map_err(|e| CoreError::io(&path, e))?;
        }
        out.flush().map_err(|e| CoreError::io(&path, e))?;

        state.tree.save(chain_file(prefix, "final_model.txt", chain_id))?;

        if !state.posterior_k {
            let path = chain_file(prefix, "residuals.txt", chain_id);
            write_column(&path, state.mean_residuals())?;
            let path = chain_file(prefix, "residuals_normed.txt", chain_id);
            write_column(&path, state.mean_normed_residuals())?;
            state.save_residual_histogram(chain_file(prefix, "residuals_hist.txt", chain_id))?;
            state.save_residual_covariance(chain_file(prefix, "residuals_cov.txt", chain_id))?;
        }
    }

    Ok(RunSummary {
        chain_id,
        final_likelihood: state.current_likelihood,
        final_log_normalization: state.current_log_normalization,
        final_k: state.tree.coefficient_count(),
        swap_ratio: (exchange.stats.propose > 0).then(|| exchange.stats.ratio()),
    })
}

fn write_column(path: &PathBuf, values: &[f64]) -> CoreResult<()> {
    let mut out = BufWriter::new(File::create(path).map_err(|e| CoreError::io(path, e))?);
    for v in values {
        writeln!(out, "{v:.9e}").map_err(|e| CoreError::io(path, e))?;
    }
    out.flush().map_err(|e| CoreError::io(path, e))
}

/// World shape: how many ranks, temperatures and chains.
#[derive(Clone, Debug)]
pub struct WorldConfig {
    pub world_size: usize,
    pub temperatures: usize,
    pub chains_per_temperature: usize,
    pub max_temperature: f64,
    pub seed_base: u64,
    pub seed_mult: u64,
}

/// Builds the fabric, spawns one thread per rank, runs every chain, and
/// collects the per-chain summaries (chain roots only).
#[allow(clippy::too_many_arguments)]
pub fn run_world(
    world: &WorldConfig,
    run: &RunConfig,
    chain_template: &ChainConfig,
    observations: Arc<Observations>,
    forwards: Vec<Arc<dyn ForwardModel>>,
    noises: Vec<NoiseModel>,
    prior: PriorProposal,
    initial_prefix: Option<String>,
) -> CoreResult<Vec<RunSummary>> {
    let endpoints = Fabric::build(
        world.world_size,
        world.temperatures,
        world.chains_per_temperature,
    )?;

    let mut handles = Vec::with_capacity(endpoints.len());
    for comms in endpoints {
        let layout = comms.layout;
        let run = run.clone();
        let observations = Arc::clone(&observations);
        let forwards = forwards.clone();
        let noises = noises.clone();
        let prior = prior.clone();
        let initial_prefix = initial_prefix.clone();
        let mut config = ChainConfig::new(
            chain_template.degree_x,
            chain_template.degree_y,
            chain_template.depth,
        );
        config.kmax = chain_template.kmax;
        config.posterior_k = chain_template.posterior_k;
        config.hbasis = chain_template.hbasis;
        config.vbasis = chain_template.vbasis;
        config.initial_log_conductivity = chain_template.initial_log_conductivity;
        config.seed = world.seed_base + layout.rank as u64 * world.seed_mult;
        config.initial_model = initial_prefix
            .as_deref()
            .map(|p| chain_file(Some(p), "final_model.txt", layout.chain_id));
        let max_temperature = world.max_temperature;

        handles.push(std::thread::spawn(move || -> CoreResult<Option<RunSummary>> {
            let temperature = layout.temperature(max_temperature);
            let chain_comm = comms.chain.clone();
            let sample = {
                let run = &run;
                let comms = &comms;
                move || -> CoreResult<RunSummary> {
                    let systems: Vec<System> = forwards
                        .into_iter()
                        .zip(noises)
                        .map(|(f, n)| System::new(f, n))
                        .collect();
                    let mut state = ChainState::new(
                        &config,
                        observations,
                        systems,
                        prior,
                        chain_comm,
                        temperature,
                    )?;
                    run_chain(run, comms, &mut state)
                }
            };
            let result = if run.per_rank_logs {
                per_rank_subscriber(run.output_prefix.as_deref(), layout.rank)
                    .and_then(|subscriber| tracing::subscriber::with_default(subscriber, sample))
            } else {
                sample()
            };
            match result {
                Ok(summary) => Ok((layout.chain_rank == 0).then_some(summary)),
                Err(err) => {
                    // Unblock every peer before surfacing the failure.
                    let msg = err.to_string();
                    comms.global.poison(&msg);
                    comms.chain.poison(&msg);
                    if let Some(t) = &comms.temperature {
                        t.poison(&msg);
                    }
                    Err(err)
                }
            }
        }));
    }

    let mut summaries = Vec::new();
    let mut failure: Option<CoreError> = None;
    for handle in handles {
        match handle.join() {
            Ok(Ok(Some(summary))) => summaries.push(summary),
            Ok(Ok(None)) => {}
            Ok(Err(err)) => {
                // Prefer the original fault over secondary collective errors.
                let is_secondary = matches!(err, CoreError::Collective(_));
                match &failure {
                    None => failure = Some(err),
                    Some(CoreError::Collective(_)) if !is_secondary => failure = Some(err),
                    _ => {}
                }
            }
            Err(_) => {
                failure.get_or_insert(CoreError::Invariant("a sampler thread panicked".into()));
            }
        }
    }
    match failure {
        Some(err) => Err(err),
        None => {
            summaries.sort_by_key(|s| s.chain_id);
            Ok(summaries)
        }
    }
}
