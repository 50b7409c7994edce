// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralEM — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Per-replica sampler state.
//!
//! One `ChainState` lives on every rank. Ranks of the same chain hold
//! identical model state and split the likelihood evaluation by column;
//! the chain communicator reduces the partial sums and gathers residual
//! segments so every rank tracks the full residual vector.
//!
//! There is exactly one likelihood path. On a single-rank chain the
//! collective calls degenerate to no-ops, so serial and parallel runs
//! execute the same code.

use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use tracing::info;

use se_core::comms::Comm;
use se_core::constants::{
    DEFAULT_CONDUCTIVITY, RESIDUAL_HIST_BINS, RESIDUAL_HIST_MAX, RESIDUAL_HIST_MIN,
};
use se_core::error::{CoreError, CoreResult};
use se_core::forward::{ForwardModel, Geometry};
use se_core::noise::NoiseModel;
use se_core::observations::Observations;
use se_core::prior::PriorProposal;
use se_wavetree::{inverse2d, workspace_len, Basis, WaveTree};

/// One survey system: its forward solver, its noise model, and the window
/// centre times shared by both.
pub struct System {
    pub forward: Arc<dyn ForwardModel>,
    pub noise: NoiseModel,
    pub times: Vec<f64>,
}

impl System {
    pub fn new(forward: Arc<dyn ForwardModel>, noise: NoiseModel) -> Self {
        let times = forward.centre_times().to_vec();
        System {
            forward,
            noise,
            times,
        }
    }
}

/// Construction parameters for a replica.
pub struct ChainConfig {
    pub degree_x: u32,
    pub degree_y: u32,
    pub depth: f64,
    pub kmax: usize,
    pub posterior_k: bool,
    pub hbasis: Basis,
    pub vbasis: Basis,
    pub seed: u64,
    /// Saved model to start from; a constant log-conductivity otherwise.
    pub initial_model: Option<PathBuf>,
    pub initial_log_conductivity: f64,
}

impl ChainConfig {
    pub fn new(degree_x: u32, degree_y: u32, depth: f64) -> Self {
        ChainConfig {
            degree_x,
            degree_y,
            depth,
            kmax: 100,
            posterior_k: false,
            hbasis: Basis::Haar,
            vbasis: Basis::Haar,
            seed: 983,
            initial_model: None,
            initial_log_conductivity: DEFAULT_CONDUCTIVITY.ln(),
        }
    }
}

struct CovarianceTracker {
    count: usize,
    mu: Vec<f64>,
    sigma: Vec<f64>,
    delta: Vec<f64>,
}

impl CovarianceTracker {
    fn new(n: usize) -> Self {
        CovarianceTracker {
            count: n,
            mu: vec![0.0; n],
            sigma: vec![0.0; n * n],
            delta: vec![0.0; n],
        }
    }
}

/// Mutable state of one replica.
pub struct ChainState {
    pub tree: WaveTree,
    pub prior: PriorProposal,
    pub systems: Vec<System>,
    pub observations: Arc<Observations>,

    pub width: usize,
    pub height: usize,
    pub depth: f64,
    pub kmax: usize,
    pub posterior_k: bool,
    pub hbasis: Basis,
    pub vbasis: Basis,

    pub lambda_scale: f64,
    pub current_likelihood: f64,
    pub current_log_normalization: f64,
    pub temperature: f64,
    pub residuals_valid: bool,

    pub rng: ChaCha8Rng,
    pub comm: Comm,

    layer_thickness: Vec<f64>,
    dense: Vec<f64>,
    transform_work: Vec<f64>,
    profile: Vec<f64>,
    predicted: Vec<f64>,

    residual_size: usize,
    residuals_per_column: usize,
    pub residual: Vec<f64>,
    pub residual_normed: Vec<f64>,
    pub last_valid_residual: Vec<f64>,
    pub last_valid_residual_normed: Vec<f64>,
    normed_scratch: Vec<f64>,
    gather_scratch: Vec<f64>,

    mean_residual_n: usize,
    mean_residual: Vec<f64>,
    mean_residual_normed: Vec<f64>,
    residual_hist: Vec<u32>,
    hist_bins: usize,
    hist_min: f64,
    hist_max: f64,

    cov_n: usize,
    covariance: Vec<CovarianceTracker>,

    column_offsets: Vec<usize>,
    column_sizes: Vec<usize>,
    residual_offsets: Vec<usize>,
    residual_sizes: Vec<usize>,
}

impl ChainState {
    pub fn new(
        config: &ChainConfig,
        observations: Arc<Observations>,
        systems: Vec<System>,
        prior: PriorProposal,
        comm: Comm,
        temperature: f64,
    ) -> CoreResult<Self> {
        let mut tree = WaveTree::new(config.degree_x, config.degree_y)?;
        let width = tree.width() as usize;
        let height = tree.height() as usize;

        match &config.initial_model {
            Some(path) => {
                tree.load_promote(path)?;
                info!(
                    coefficients = tree.coefficient_count(),
                    "loaded initial model"
                );
            }
            None => tree.initialise(config.initial_log_conductivity),
        }

        let kmax = config.kmax.min(tree.size());
        if kmax < config.kmax {
            info!(kmax, "kmax truncated to the coefficient capacity");
        }

        let mut residual_size = 0;
        let mut residuals_per_column = 0;
        if !config.posterior_k {
            if observations.points.len() != width {
                return Err(CoreError::Validation(format!(
                    "observation count {} does not match lateral size {width}",
                    observations.points.len()
                )));
            }
            let nsystems = observations.system_count()?;
            if systems.len() != nsystems {
                return Err(CoreError::Validation(format!(
                    "{} forward systems configured, observations carry {nsystems}",
                    systems.len()
                )));
            }
            for (si, system) in systems.iter().enumerate() {
                for (pi, point) in observations.points.iter().enumerate() {
                    let n = point.responses[si].values.len();
                    if n != system.forward.window_count() {
                        return Err(CoreError::Invariant(format!(
                            "point {pi} system {si}: {n} samples vs {} windows",
                            system.forward.window_count()
                        )));
                    }
                }
            }
            residual_size = observations.total_datapoints();
            residuals_per_column = residual_size / width;
            info!(datapoints = residual_size, "observation data loaded");
        }

        // Spread columns over the chain ranks, remainders first-come.
        let ranks = comm.size();
        let mut column_sizes = vec![0usize; ranks];
        let mut remaining = width;
        let mut processes = ranks;
        for size in column_sizes.iter_mut() {
            *size = remaining / processes;
            remaining -= *size;
            processes -= 1;
        }
        let mut column_offsets = vec![0usize; ranks];
        for r in 1..ranks {
            column_offsets[r] = column_offsets[r - 1] + column_sizes[r - 1];
        }
        let residual_sizes: Vec<usize> = column_sizes
            .iter()
            .map(|c| c * residuals_per_column)
            .collect();
        let residual_offsets: Vec<usize> = column_offsets
            .iter()
            .map(|c| c * residuals_per_column)
            .collect();

        let max_windows = systems
            .iter()
            .map(|s| s.forward.window_count())
            .max()
            .unwrap_or(0);
        let covariance = systems
            .iter()
            .map(|s| CovarianceTracker::new(s.forward.window_count()))
            .collect();

        Ok(ChainState {
            prior,
            systems,
            observations,
            width,
            height,
            depth: config.depth,
            kmax,
            posterior_k: config.posterior_k,
            hbasis: config.hbasis,
            vbasis: config.vbasis,
            lambda_scale: 1.0,
            current_likelihood: -1.0,
            current_log_normalization: 0.0,
            temperature,
            residuals_valid: false,
            rng: ChaCha8Rng::seed_from_u64(config.seed),
            comm,
            layer_thickness: se_core::image::logspace_thicknesses(height, config.depth),
            dense: vec![0.0; width * height],
            transform_work: vec![0.0; workspace_len(width, height)],
            profile: vec![0.0; height],
            predicted: vec![0.0; max_windows],
            residual_size,
            residuals_per_column,
            residual: vec![0.0; residual_size],
            residual_normed: vec![0.0; residual_size],
            last_valid_residual: vec![0.0; residual_size],
            last_valid_residual_normed: vec![0.0; residual_size],
            normed_scratch: vec![0.0; residual_size],
            gather_scratch: vec![0.0; residual_size],
            mean_residual_n: 0,
            mean_residual: vec![0.0; residual_size],
            mean_residual_normed: vec![0.0; residual_size],
            residual_hist: vec![0; residual_size * RESIDUAL_HIST_BINS],
            hist_bins: RESIDUAL_HIST_BINS,
            hist_min: RESIDUAL_HIST_MIN,
            hist_max: RESIDUAL_HIST_MAX,
            cov_n: 0,
            covariance,
            column_offsets,
            column_sizes,
            residual_offsets,
            residual_sizes,
            tree,
        })
    }

    pub fn residual_size(&self) -> usize {
        self.residual_size
    }

    /// Tempered energy of the cached state: nll plus log-normalization.
    pub fn energy(&self) -> f64 {
        self.current_likelihood + self.current_log_normalization
    }

    /// Evaluates the likelihood of the current tree: reconstruct the
    /// section, run the forward models over this rank's columns, reduce
    /// and gather. Returns `(nll, log_normalization)`.
    pub fn likelihood(&mut self) -> CoreResult<(f64, f64)> {
        if self.posterior_k {
            return Ok((1.0, 0.0));
        }

        self.tree.map_to_array(&mut self.dense)?;
        inverse2d(
            self.hbasis,
            self.vbasis,
            &mut self.dense,
            self.width,
            self.height,
            &mut self.transform_work,
        );

        let rank = self.comm.rank();
        let mut local = [0.0f64, 0.0f64];
        for mi in 0..self.column_sizes[rank] {
            let col = self.column_offsets[rank] + mi;
            let mut offset = col * self.residuals_per_column;
            let point = &self.observations.points[col];
            let geometry = Geometry::from(point);
            for (row, slot) in self.profile.iter_mut().enumerate() {
                *slot = self.dense[row * self.width + col].exp();
            }
            for (si, system) in self.systems.iter().enumerate() {
                let response = &point.responses[si];
                let n = response.values.len();
                let predicted = &mut self.predicted[..n];
                system
                    .forward
                    .eval(&geometry, &self.profile, &self.layer_thickness, predicted);
                for l in 0..n {
                    self.residual[offset + l] = response.values[l] - predicted[l];
                }
                let (nll, log_norm) = system.noise.nll(
                    &response.values,
                    &system.times,
                    &self.residual[offset..offset + n],
                    self.lambda_scale,
                    &mut self.residual_normed[offset..offset + n],
                )?;
                local[0] += nll;
                local[1] += log_norm;
                offset += n;
            }
        }

        self.comm.all_reduce_sum(&mut local)?;

        let (off, len) = (self.residual_offsets[rank], self.residual_sizes[rank]);
        self.gather_scratch.clear();
        self.gather_scratch
            .extend_from_slice(&self.residual[off..off + len]);
        let seg = std::mem::take(&mut self.gather_scratch);
        self.comm
            .all_gather_var(&seg, &self.residual_sizes, &mut self.residual)?;
        self.gather_scratch = seg;
        self.gather_scratch.clear();
        self.gather_scratch
            .extend_from_slice(&self.residual_normed[off..off + len]);
        let seg = std::mem::take(&mut self.gather_scratch);
        self.comm
            .all_gather_var(&seg, &self.residual_sizes, &mut self.residual_normed)?;
        self.gather_scratch = seg;

        Ok((local[0], local[1]))
    }

    /// Likelihood under a proposed hierarchical scale, reusing the residuals
    /// of the last accepted step; only normalization and whitening change.
    /// Requires valid residuals — callers refresh first when stale. Every
    /// chain rank evaluates the same sum, so no collective is needed.
    pub fn hierarchical_likelihood(&mut self, proposed_lambda: f64) -> CoreResult<(f64, f64)> {
        if self.posterior_k {
            return Ok((1.0, 0.0));
        }
        if !self.residuals_valid {
            return Err(CoreError::Invariant(
                "hierarchical likelihood entered with stale residuals".into(),
            ));
        }

        let mut sum = 0.0;
        let mut log_norm = 0.0;
        for col in 0..self.width {
            let mut offset = col * self.residuals_per_column;
            let point = &self.observations.points[col];
            for (si, system) in self.systems.iter().enumerate() {
                let response = &point.responses[si];
                let n = response.values.len();
                let (nll, ln) = system.noise.nll(
                    &response.values,
                    &system.times,
                    &self.last_valid_residual[offset..offset + n],
                    proposed_lambda,
                    &mut self.normed_scratch[offset..offset + n],
                )?;
                sum += nll;
                log_norm += ln;
                offset += n;
            }
        }
        Ok((sum, log_norm))
    }

    /// Commits an accepted hierarchical move: installs the scale and the
    /// whitened residuals computed by [`hierarchical_likelihood`].
    pub fn accept_hierarchical(&mut self, lambda: f64, likelihood: f64, log_norm: f64) {
        self.lambda_scale = lambda;
        self.current_likelihood = likelihood;
        self.current_log_normalization = log_norm;
        if !self.posterior_k {
            self.residual_normed.copy_from_slice(&self.normed_scratch);
            self.last_valid_residual_normed
                .copy_from_slice(&self.normed_scratch);
        }
    }

    pub fn invalidate_residuals(&mut self) {
        self.residuals_valid = false;
    }

    /// Recomputes the likelihood from scratch and accepts it — used to
    /// refresh stale residuals after a swap or transplant.
    pub fn refresh_residuals(&mut self) -> CoreResult<()> {
        let (like, log_norm) = self.likelihood()?;
        self.current_likelihood = like;
        self.current_log_normalization = log_norm;
        self.accept();
        Ok(())
    }

    /// Bookkeeping after an accepted likelihood-evaluating move.
    pub fn accept(&mut self) {
        self.residuals_valid = true;
        if self.posterior_k {
            return;
        }
        self.last_valid_residual.copy_from_slice(&self.residual);
        self.last_valid_residual_normed
            .copy_from_slice(&self.residual_normed);
        self.update_residual_mean();
        self.update_residual_covariance();
    }

    /// Bookkeeping after a rejected move: the residual buffers roll back to
    /// the last accepted state bit for bit, and the running statistics
    /// record the retained state once more.
    pub fn reject(&mut self) {
        if self.posterior_k {
            return;
        }
        self.residual.copy_from_slice(&self.last_valid_residual);
        self.residual_normed
            .copy_from_slice(&self.last_valid_residual_normed);
        self.update_residual_mean();
    }

    fn update_residual_mean(&mut self) {
        self.mean_residual_n += 1;
        let n = self.mean_residual_n as f64;
        for i in 0..self.residual_size {
            let delta = self.last_valid_residual[i] - self.mean_residual[i];
            self.mean_residual[i] += delta / n;
            let delta = self.last_valid_residual_normed[i] - self.mean_residual_normed[i];
            self.mean_residual_normed[i] += delta / n;

            let x = self.last_valid_residual_normed[i];
            let hi = ((x - self.hist_min) / (self.hist_max - self.hist_min)
                * self.hist_bins as f64)
                .floor() as isize;
            if (0..self.hist_bins as isize).contains(&hi) {
                self.residual_hist[i * self.hist_bins + hi as usize] += 1;
            }
        }
    }

    fn update_residual_covariance(&mut self) {
        let mut p = 0usize;
        for _point in 0..self.width {
            self.cov_n += 1;
            let n = self.cov_n as f64;
            for tracker in self.covariance.iter_mut() {
                let count = tracker.count;
                for j in 0..count {
                    tracker.delta[j] = (self.last_valid_residual[p + j] - tracker.mu[j]) / n;
                    tracker.mu[j] += tracker.delta[j];
                }
                for j in 0..count {
                    for l in j..count {
                        tracker.sigma[j * count + l] += (n - 1.0)
                            * tracker.delta[j]
                            * tracker.delta[l]
                            - tracker.sigma[j * count + l] / n;
                    }
                }
                p += count;
            }
        }
    }

    pub fn mean_residuals(&self) -> &[f64] {
        &self.mean_residual
    }

    pub fn mean_normed_residuals(&self) -> &[f64] {
        &self.mean_residual_normed
    }

    pub fn save_residual_histogram(&self, path: impl AsRef<Path>) -> CoreResult<()> {
        let path = path.as_ref();
        let mut out =
            std::io::BufWriter::new(std::fs::File::create(path).map_err(|e| CoreError::io(path, e))?);
        let write = |out: &mut dyn std::io::Write| -> std::io::Result<()> {
            writeln!(
                out,
                "{} {} {} {}",
                self.residual_size, self.hist_bins, self.hist_min, self.hist_max
            )?;
            for i in 0..self.residual_size {
                for b in 0..self.hist_bins {
                    write!(out, "{} ", self.residual_hist[i * self.hist_bins + b])?;
                }
                writeln!(out)?;
            }
            Ok(())
        };
        write(&mut out).map_err(|e| CoreError::io(path, e))?;
        out.flush().map_err(|e| CoreError::io(path, e))
    }

    pub fn save_residual_covariance(&self, path: impl AsRef<Path>) -> CoreResult<()> {
        let path = path.as_ref();
        let mut out =
            std::io::BufWriter::new(std::fs::File::create(path).map_err(|e| CoreError::io(path, e))?);
        let write = |out: &mut dyn std::io::Write| -> std::io::Result<()> {
            writeln!(out, "{}", self.covariance.len())?;
            for tracker in &self.covariance {
                writeln!(out, "{}", tracker.count)?;
                for v in &tracker.mu {
                    write!(out, "{v:.9e} ")?;
                }
                writeln!(out)?;
                for j in 0..tracker.count {
                    for l in 0..tracker.count {
                        write!(out, "{:.9e} ", tracker.sigma[j * tracker.count + l])?;
                    }
                    writeln!(out)?;
                }
            }
            Ok(())
        };
        write(&mut out).map_err(|e| CoreError::io(path, e))?;
        out.flush().map_err(|e| CoreError::io(path, e))
    }

    // -- whole-model transplant ---------------------------------------------

    /// Serialises everything a peer needs to adopt this replica's model:
    /// live multiset, hierarchical parameters, cached scalars, residuals.
    pub fn pack_model(&self) -> Vec<f64> {
        let live = self.tree.live_snapshot();
        let mut out = Vec::with_capacity(5 + 2 * live.len() + 4 * self.residual_size);
        out.push(live.len() as f64);
        for (idx, value) in live {
            out.push(idx as f64);
            out.push(value);
        }
        out.push(self.lambda_scale);
        out.push(self.prior.width_scale());
        out.push(self.current_likelihood);
        out.push(self.current_log_normalization);
        out.extend_from_slice(&self.residual);
        out.extend_from_slice(&self.residual_normed);
        out.extend_from_slice(&self.last_valid_residual);
        out.extend_from_slice(&self.last_valid_residual_normed);
        out
    }

    /// Adopts a model packed by [`pack_model`] on a peer replica.
    pub fn unpack_model(&mut self, payload: &[f64]) -> CoreResult<()> {
        let mut at = 0usize;
        let mut next = |n: usize| -> CoreResult<&[f64]> {
            let end = at + n;
            if end > payload.len() {
                return Err(CoreError::Invariant("model payload truncated".into()));
            }
            let out = &payload[at..end];
            at = end;
            Ok(out)
        };

        let k = next(1)?[0] as usize;
        let pairs = next(2 * k)?;
        let live: Vec<(u32, f64)> = pairs
            .chunks_exact(2)
            .map(|c| (c[0] as u32, c[1]))
            .collect();
        let scalars = next(4)?;
        let (lambda, width_scale, likelihood, log_norm) =
            (scalars[0], scalars[1], scalars[2], scalars[3]);
        let residual = next(self.residual_size)?.to_vec();
        let residual_normed = next(self.residual_size)?.to_vec();
        let last_valid = next(self.residual_size)?.to_vec();
        let last_valid_normed = next(self.residual_size)?.to_vec();
        if at != payload.len() {
            return Err(CoreError::Invariant("model payload has trailing data".into()));
        }

        self.tree.set_from_live(&live)?;
        self.lambda_scale = lambda;
        if !self.prior.set_width_scale(width_scale) {
            return Err(CoreError::Invariant(format!(
                "transplanted width scale {width_scale} outside the prior bounds"
            )));
        }
        self.current_likelihood = likelihood;
        self.current_log_normalization = log_norm;
        self.residual.copy_from_slice(&residual);
        self.residual_normed.copy_from_slice(&residual_normed);
        self.last_valid_residual.copy_from_slice(&last_valid);
        self.last_valid_residual_normed
            .copy_from_slice(&last_valid_normed);
        self.residuals_valid = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use se_core::forward::HalfspaceConvolution;
    use se_core::stm::StmDescriptor;

    const STM: &str = "\
Transmitter Begin
  LoopArea = 400.0
  PeakCurrent = 10.0
Transmitter End
ForwardModelling Begin
  WindowTimes Begin
    1.0e-4 2.0e-4
    2.0e-4 4.0e-4
    4.0e-4 8.0e-4
  WindowTimes End
ForwardModelling End
";

    fn synthetic_world(width: usize) -> (Arc<Observations>, Vec<System>) {
        let stm = StmDescriptor::parse("mem.stm", STM).unwrap();
        let forward = Arc::new(HalfspaceConvolution::from_descriptor(&stm).unwrap());
        let noise = NoiseModel::Iid { sigma: 1.0e-13 };
        let times = forward.centre_times().to_vec();

        // Observed data: the forward response of a uniform quarter-S/m
        // ground, so a matching model has near-zero residuals.
        let thickness = se_core::image::logspace_thicknesses(8, 200.0);
        let mut points = Vec::new();
        for c in 0..width {
            let geometry = Geometry {
                tx_height: 100.0 + c as f64 * 0.1,
                txrx_dx: -12.5,
                txrx_dz: 2.0,
                ..Geometry::default()
            };
            let mut values = vec![0.0; times.len()];
            forward.eval(&geometry, &vec![0.25; 8], &thickness, &mut values);
            points.push(se_core::observations::Point {
                tx_height: geometry.tx_height,
                tx_roll: 0.0,
                tx_pitch: 0.0,
                tx_yaw: 0.0,
                txrx_dx: -12.5,
                txrx_dy: 0.0,
                txrx_dz: 2.0,
                rx_roll: 0.0,
                rx_pitch: 0.0,
                rx_yaw: 0.0,
                responses: vec![se_core::observations::Response {
                    direction: se_core::observations::Direction::Z,
                    values,
                }],
            });
        }
        (
            Arc::new(Observations { points }),
            vec![System::new(forward, noise)],
        )
    }

    fn state() -> ChainState {
        let (obs, systems) = synthetic_world(16);
        let config = ChainConfig::new(4, 3, 200.0);
        ChainState::new(
            &config,
            obs,
            systems,
            PriorProposal::default_for_depth(4),
            Comm::Solo,
            1.0,
        )
        .unwrap()
    }

    #[test]
    fn likelihood_is_reproducible() {
        let mut s = state();
        let (a, na) = s.likelihood().unwrap();
        let (b, nb) = s.likelihood().unwrap();
        assert_abs_diff_eq!(a, b, epsilon = 1e-12);
        assert_abs_diff_eq!(na, nb, epsilon = 1e-12);
        assert!(a.is_finite());
    }

    #[test]
    fn matching_model_fits_better_than_wrong_model() {
        let mut s = state();
        let (matching, _) = s.likelihood().unwrap();
        s.tree.update(0, (2.0f64).ln() * 8.0).unwrap();
        let (wrong, _) = s.likelihood().unwrap();
        assert!(matching < wrong);
    }

    #[test]
    fn reject_rolls_residual_buffers_back_bit_for_bit() {
        let mut s = state();
        let (like, norm) = s.likelihood().unwrap();
        s.current_likelihood = like;
        s.current_log_normalization = norm;
        s.accept();
        let saved_res = s.residual.clone();
        let saved_normed = s.residual_normed.clone();

        // A proposal overwrites the residual buffers...
        s.tree.update(0, 3.0).unwrap();
        let _ = s.likelihood().unwrap();
        assert!(s.residual.iter().zip(&saved_res).any(|(a, b)| a != b));

        // ...and rejection restores them exactly.
        s.tree.update(0, DEFAULT_CONDUCTIVITY.ln()).unwrap();
        s.reject();
        assert_eq!(s.residual, saved_res);
        assert_eq!(s.residual_normed, saved_normed);
    }

    #[test]
    fn hierarchical_likelihood_requires_valid_residuals() {
        let mut s = state();
        assert!(s.hierarchical_likelihood(1.5).is_err());
        s.refresh_residuals().unwrap();
        let (like, norm) = s.hierarchical_likelihood(1.0).unwrap();
        assert_abs_diff_eq!(like, s.current_likelihood, epsilon = 1e-9);
        assert_abs_diff_eq!(norm, s.current_log_normalization, epsilon = 1e-9);

        // Staleness is sticky until the next full evaluation.
        s.invalidate_residuals();
        assert!(s.hierarchical_likelihood(1.0).is_err());
        s.refresh_residuals().unwrap();
        assert!(s.hierarchical_likelihood(1.0).is_ok());
    }

    #[test]
    fn hierarchical_scale_trades_fit_for_normalization() {
        let mut s = state();
        s.refresh_residuals().unwrap();
        let (like_1, norm_1) = s.hierarchical_likelihood(1.0).unwrap();
        let (like_2, norm_2) = s.hierarchical_likelihood(2.0).unwrap();
        assert_abs_diff_eq!(like_2, like_1 / 4.0, epsilon = 1e-9);
        assert!(norm_2 > norm_1);
    }

    #[test]
    fn pack_unpack_transplants_the_whole_model() {
        let mut donor = state();
        donor.tree.insert(donor.tree.from_2d(1, 0), 0.4).unwrap();
        donor.lambda_scale = 1.5;
        donor.refresh_residuals().unwrap();

        let mut receiver = state();
        receiver.refresh_residuals().unwrap();
        receiver.unpack_model(&donor.pack_model()).unwrap();

        assert_eq!(
            receiver.tree.live_snapshot(),
            donor.tree.live_snapshot()
        );
        assert_abs_diff_eq!(receiver.lambda_scale, 1.5, epsilon = 1e-12);
        assert_abs_diff_eq!(
            receiver.current_likelihood,
            donor.current_likelihood,
            epsilon = 1e-12
        );
        assert_eq!(receiver.residual, donor.residual);
        assert!(receiver.residuals_valid);

        // The transplanted cache matches a fresh evaluation.
        let (recomputed, _) = receiver.likelihood().unwrap();
        assert_abs_diff_eq!(recomputed, receiver.current_likelihood, epsilon = 1e-6);
    }

    #[test]
    fn posterior_k_short_circuits_likelihood() {
        let (obs, _) = synthetic_world(16);
        let mut config = ChainConfig::new(4, 3, 200.0);
        config.posterior_k = true;
        let mut s = ChainState::new(
            &config,
            obs,
            Vec::new(),
            PriorProposal::default_for_depth(4),
            Comm::Solo,
            1.0,
        )
        .unwrap();
        assert_eq!(s.likelihood().unwrap(), (1.0, 0.0));
    }
}
