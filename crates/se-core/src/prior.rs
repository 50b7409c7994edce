// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralEM — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Per-coefficient prior and proposal distributions.
//!
//! Coefficients at depth `d` carry a zero-centred Gaussian prior whose
//! standard deviation is the per-depth width times a samplable global
//! multiplier, truncated to a hard value range. Birth proposals are
//! Gaussian around an attenuated copy of the parent coefficient; value
//! perturbations reuse the per-depth proposal widths. A value falling
//! outside the hard range makes the proposal invalid, never an error.

use std::path::Path;

use rand::Rng;
use rand_distr::{Distribution, Normal};

use crate::error::{CoreError, CoreResult};
use crate::tokens::TokenReader;

const LN_SQRT_TWO_PI: f64 = 0.918_938_533_204_672_74;

fn ln_normal_pdf(x: f64, mean: f64, sigma: f64) -> f64 {
    let z = (x - mean) / sigma;
    -0.5 * z * z - sigma.ln() - LN_SQRT_TWO_PI
}

/// Prior/proposal configuration keyed by coefficient depth.
#[derive(Clone, Debug)]
pub struct PriorProposal {
    vmin: f64,
    vmax: f64,
    prior_std: Vec<f64>,
    proposal_std: Vec<f64>,
    attenuation: f64,
    width_scale: f64,
    width_scale_min: f64,
    width_scale_max: f64,
}

impl PriorProposal {
    /// Loads the keyed text format:
    ///
    /// ```text
    /// range -4.0 4.0
    /// attenuation 0.0
    /// widthscale 0.25 4.0
    /// depth 0 2.0 0.8
    /// depth 1 1.0 0.4
    /// ```
    ///
    /// `depth d prior_std proposal_std`; depths beyond the last line reuse
    /// its widths.
    pub fn load(path: impl AsRef<Path>) -> CoreResult<Self> {
        let mut tr = TokenReader::open(&path)?;
        let mut vrange: Option<(f64, f64)> = None;
        let mut attenuation = 0.0;
        let mut width_scale_min = 1.0;
        let mut width_scale_max = 1.0;
        let mut prior_std = Vec::new();
        let mut proposal_std = Vec::new();

        while !tr.is_empty() {
            let key = tr.next_str()?.to_string();
            match key.as_str() {
                "range" => {
                    let lo = tr.next_f64()?;
                    let hi = tr.next_f64()?;
                    if hi <= lo {
                        return Err(CoreError::parse(tr.path(), "range must be increasing"));
                    }
                    vrange = Some((lo, hi));
                }
                "attenuation" => attenuation = tr.next_f64()?,
                "widthscale" => {
                    width_scale_min = tr.next_f64()?;
                    width_scale_max = tr.next_f64()?;
                    if width_scale_min <= 0.0 || width_scale_max < width_scale_min {
                        return Err(CoreError::parse(tr.path(), "bad widthscale bounds"));
                    }
                }
                "depth" => {
                    let d = tr.next_usize()?;
                    if d != prior_std.len() {
                        return Err(CoreError::parse(
                            tr.path(),
                            format!("depth lines must be consecutive, found {d}"),
                        ));
                    }
                    let ps = tr.next_f64()?;
                    let qs = tr.next_f64()?;
                    if ps <= 0.0 || qs <= 0.0 {
                        return Err(CoreError::parse(tr.path(), "widths must be positive"));
                    }
                    prior_std.push(ps);
                    proposal_std.push(qs);
                }
                other => {
                    return Err(CoreError::parse(
                        tr.path(),
                        format!("unknown prior key '{other}'"),
                    ))
                }
            }
        }

        let (vmin, vmax) = vrange
            .ok_or_else(|| CoreError::parse(path.as_ref(), "prior file missing 'range' line"))?;
        if prior_std.is_empty() {
            return Err(CoreError::parse(
                path.as_ref(),
                "prior file needs at least one 'depth' line",
            ));
        }

        Ok(PriorProposal {
            vmin,
            vmax,
            prior_std,
            proposal_std,
            attenuation,
            width_scale: 1.0,
            width_scale_min,
            width_scale_max,
        })
    }

    /// A serviceable default for synthetic studies: generous range, widths
    /// halving per depth level.
    pub fn default_for_depth(max_depth: u32) -> Self {
        let mut prior_std = Vec::new();
        let mut proposal_std = Vec::new();
        for d in 0..=max_depth {
            let w = 2.0 / (1u64 << d.min(8)) as f64;
            prior_std.push(w.max(0.05));
            proposal_std.push((0.4 * w).max(0.02));
        }
        PriorProposal {
            vmin: -6.0,
            vmax: 6.0,
            prior_std,
            proposal_std,
            attenuation: 0.0,
            width_scale: 1.0,
            width_scale_min: 0.25,
            width_scale_max: 4.0,
        }
    }

    pub fn prior_range(&self, _i: u32, _j: u32, _depth: u32) -> (f64, f64) {
        (self.vmin, self.vmax)
    }

    fn depth_slot(&self, depth: u32) -> usize {
        (depth as usize).min(self.prior_std.len() - 1)
    }

    pub fn prior_std(&self, depth: u32) -> f64 {
        self.prior_std[self.depth_slot(depth)] * self.width_scale
    }

    pub fn value_step_std(&self, depth: u32) -> f64 {
        self.proposal_std[self.depth_slot(depth)]
    }

    /// Log prior density of a coefficient, `None` outside the hard range.
    pub fn log_prior(&self, depth: u32, value: f64) -> Option<f64> {
        if value < self.vmin || value > self.vmax {
            return None;
        }
        Some(ln_normal_pdf(value, 0.0, self.prior_std(depth)))
    }

    /// Draws a birth value and its forward log proposal density. `None`
    /// when the draw lands outside the hard range (invalid proposal).
    pub fn sample_birth(
        &self,
        rng: &mut impl Rng,
        _i: u32,
        _j: u32,
        depth: u32,
        parent_value: f64,
    ) -> Option<(f64, f64)> {
        let mean = self.attenuation * parent_value;
        let sigma = self.value_step_std(depth);
        let value = Normal::new(mean, sigma).ok()?.sample(rng);
        if value < self.vmin || value > self.vmax {
            return None;
        }
        Some((value, ln_normal_pdf(value, mean, sigma)))
    }

    /// Log density the birth proposal would assign to `value` — the reverse
    /// kernel of a death move.
    pub fn reverse_birth_density(
        &self,
        _i: u32,
        _j: u32,
        depth: u32,
        parent_value: f64,
        value: f64,
    ) -> f64 {
        let mean = self.attenuation * parent_value;
        ln_normal_pdf(value, mean, self.value_step_std(depth))
    }

    /// Prior contribution of adding a coefficient (the dimension prior over
    /// `k` is uniform, so only the value prior remains). `None` invalidates
    /// the proposal.
    pub fn log_prior_ratio_birth(&self, depth: u32, value: f64) -> Option<f64> {
        self.log_prior(depth, value)
    }

    /// Prior contribution of removing a coefficient.
    pub fn log_prior_ratio_death(&self, depth: u32, value: f64) -> f64 {
        -ln_normal_pdf(value, 0.0, self.prior_std(depth))
    }

    pub fn width_scale(&self) -> f64 {
        self.width_scale
    }

    pub fn width_scale_range(&self) -> (f64, f64) {
        (self.width_scale_min, self.width_scale_max)
    }

    /// Installs a new width multiplier; out-of-range values are refused so
    /// the hierarchical-prior move can treat them as invalid proposals.
    pub fn set_width_scale(&mut self, scale: f64) -> bool {
        if scale < self.width_scale_min || scale > self.width_scale_max {
            return false;
        }
        self.width_scale = scale;
        true
    }

    /// Joint log prior of a set of live coefficients under a candidate width
    /// multiplier, without installing it.
    pub fn log_prior_total_at_scale<'a>(
        &self,
        scale: f64,
        live: impl Iterator<Item = (u32, f64)> + 'a,
    ) -> f64 {
        let mut total = 0.0;
        for (depth, value) in live {
            let sigma = self.prior_std[self.depth_slot(depth)] * scale;
            total += ln_normal_pdf(value, 0.0, sigma);
        }
        total
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn write_prior(dir: &tempfile::TempDir) -> std::path::PathBuf {
        let path = dir.path().join("prior.txt");
        std::fs::write(
            &path,
            "range -4.0 4.0\nattenuation 0.0\nwidthscale 0.5 2.0\n\
             depth 0 2.0 0.8\ndepth 1 1.0 0.4\ndepth 2 0.5 0.2\n",
        )
        .unwrap();
        path
    }

    #[test]
    fn loader_reads_depth_table() {
        let dir = tempfile::tempdir().unwrap();
        let prior = PriorProposal::load(write_prior(&dir)).unwrap();
        assert_abs_diff_eq!(prior.prior_std(0), 2.0);
        assert_abs_diff_eq!(prior.prior_std(2), 0.5);
        // Depths beyond the table reuse the deepest line.
        assert_abs_diff_eq!(prior.prior_std(9), 0.5);
        assert_eq!(prior.prior_range(0, 0, 1), (-4.0, 4.0));
    }

    #[test]
    fn birth_samples_stay_in_range_and_score_consistently() {
        let dir = tempfile::tempdir().unwrap();
        let prior = PriorProposal::load(write_prior(&dir)).unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        for _ in 0..200 {
            if let Some((value, log_q)) = prior.sample_birth(&mut rng, 0, 0, 1, 0.0) {
                assert!((-4.0..=4.0).contains(&value));
                let rev = prior.reverse_birth_density(0, 0, 1, 0.0, value);
                assert_abs_diff_eq!(log_q, rev, epsilon = 1e-12);
            }
        }
    }

    #[test]
    fn birth_and_death_prior_terms_cancel() {
        let dir = tempfile::tempdir().unwrap();
        let prior = PriorProposal::load(write_prior(&dir)).unwrap();
        let birth = prior.log_prior_ratio_birth(1, 0.7).unwrap();
        let death = prior.log_prior_ratio_death(1, 0.7);
        assert_abs_diff_eq!(birth + death, 0.0, epsilon = 1e-12);
    }

    #[test]
    fn width_scale_bounds_are_enforced() {
        let dir = tempfile::tempdir().unwrap();
        let mut prior = PriorProposal::load(write_prior(&dir)).unwrap();
        assert!(!prior.set_width_scale(0.1));
        assert!(prior.set_width_scale(1.5));
        assert_abs_diff_eq!(prior.prior_std(0), 3.0);
    }

    #[test]
    fn out_of_range_values_have_no_prior() {
        let dir = tempfile::tempdir().unwrap();
        let prior = PriorProposal::load(write_prior(&dir)).unwrap();
        assert!(prior.log_prior(0, 5.0).is_none());
        assert!(prior.log_prior_ratio_birth(0, -4.5).is_none());
    }
}
