// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralEM — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Hierarchical noise models.
//!
//! Each model maps a residual vector to a negative log-likelihood plus the
//! log-normalization term that changes when the hierarchical scale moves.
//! The per-sample standard deviation always carries the sampled
//! `lambda_scale` multiplier, so the whitened residuals written to
//! `out_normed` are unit-variance under the current noise parameters.

use std::path::Path;

use crate::error::{CoreError, CoreResult};
use crate::tokens::TokenReader;

/// Noise model sum type. One `nll` operation across all variants; the file
/// loader dispatches on the leading tag token.
#[derive(Clone, Debug)]
pub enum NoiseModel {
    /// Independent Gaussian noise with a single standard deviation.
    Iid { sigma: f64 },
    /// Three-parameter noise floor: constant, relative and `1/t` terms.
    Hyperbolic { a: f64, b: f64, c: f64 },
    /// Additive table (per window time) plus multiplicative relative noise.
    Brodie {
        times: Vec<f64>,
        additive: Vec<f64>,
        relative: f64,
    },
    /// Full covariance, eigendecomposed offline. `eigenvectors` is
    /// row-major, one eigenvector per row.
    Covariance {
        size: usize,
        eigenvalues: Vec<f64>,
        eigenvectors: Vec<f64>,
    },
}

impl NoiseModel {
    pub fn load(path: impl AsRef<Path>) -> CoreResult<Self> {
        let mut tr = TokenReader::open(&path)?;
        let tag = tr.next_str()?.to_string();
        match tag.as_str() {
            "iidgaussian" => {
                let sigma = tr.next_f64()?;
                if sigma <= 0.0 {
                    return Err(CoreError::parse(tr.path(), "sigma must be positive"));
                }
                Ok(NoiseModel::Iid { sigma })
            }
            "hyperbolic" => {
                let a = tr.next_f64()?;
                let b = tr.next_f64()?;
                let c = tr.next_f64()?;
                Ok(NoiseModel::Hyperbolic { a, b, c })
            }
            "brodie" => {
                let relative = tr.next_f64()?;
                let ntimes = tr.next_usize()?;
                if ntimes == 0 {
                    return Err(CoreError::parse(
                        tr.path(),
                        "additive noise table needs at least one entry",
                    ));
                }
                let mut times = Vec::with_capacity(ntimes);
                let mut additive = Vec::with_capacity(ntimes);
                for _ in 0..ntimes {
                    times.push(tr.next_f64()?);
                    additive.push(tr.next_f64()?);
                }
                if times.windows(2).any(|w| w[1] <= w[0]) {
                    return Err(CoreError::parse(
                        tr.path(),
                        "additive noise table times must increase",
                    ));
                }
                Ok(NoiseModel::Brodie {
                    times,
                    additive,
                    relative,
                })
            }
            "covariance" => {
                let size = tr.next_usize()?;
                let mut eigenvalues = Vec::with_capacity(size);
                for _ in 0..size {
                    let w = tr.next_f64()?;
                    if w <= 0.0 {
                        return Err(CoreError::parse(tr.path(), "eigenvalues must be positive"));
                    }
                    eigenvalues.push(w);
                }
                let mut eigenvectors = Vec::with_capacity(size * size);
                for _ in 0..size * size {
                    eigenvectors.push(tr.next_f64()?);
                }
                Ok(NoiseModel::Covariance {
                    size,
                    eigenvalues,
                    eigenvectors,
                })
            }
            other => Err(CoreError::parse(
                path.as_ref(),
                format!("unknown noise model '{other}'"),
            )),
        }
    }

    /// Number of samplable parameters.
    pub fn n_parameters(&self) -> usize {
        match self {
            NoiseModel::Iid { .. } => 1,
            NoiseModel::Hyperbolic { .. } => 3,
            NoiseModel::Brodie { .. } => 1,
            NoiseModel::Covariance { .. } => 0,
        }
    }

    pub fn parameter(&self, i: usize) -> f64 {
        match (self, i) {
            (NoiseModel::Iid { sigma }, 0) => *sigma,
            (NoiseModel::Hyperbolic { a, .. }, 0) => *a,
            (NoiseModel::Hyperbolic { b, .. }, 1) => *b,
            (NoiseModel::Hyperbolic { c, .. }, 2) => *c,
            (NoiseModel::Brodie { relative, .. }, 0) => *relative,
            _ => 0.0,
        }
    }

    pub fn set_parameter(&mut self, i: usize, v: f64) {
        match (self, i) {
            (NoiseModel::Iid { sigma }, 0) => *sigma = v,
            (NoiseModel::Hyperbolic { a, .. }, 0) => *a = v,
            (NoiseModel::Hyperbolic { b, .. }, 1) => *b = v,
            (NoiseModel::Hyperbolic { c, .. }, 2) => *c = v,
            (NoiseModel::Brodie { relative, .. }, 0) => *relative = v,
            _ => {}
        }
    }

    /// Per-sample noise magnitude for an observation of `observed` at
    /// `time`, scaled by the hierarchical multiplier. Used both inside
    /// `nll` and by the synthetic data generator.
    pub fn noise_magnitude(&self, observed: f64, time: f64, scale: f64) -> f64 {
        let base = match self {
            NoiseModel::Iid { sigma } => *sigma,
            NoiseModel::Hyperbolic { a, b, c } => {
                (a * a + (b * observed).powi(2) + (c / time).powi(2)).sqrt()
            }
            NoiseModel::Brodie {
                times,
                additive,
                relative,
            } => {
                let add = interpolate(times, additive, time);
                (add * add + (relative * observed).powi(2)).sqrt()
            }
            // Per-sample magnitudes are not defined for the full-covariance
            // model; the mean eigen-scale stands in for diagnostics.
            NoiseModel::Covariance {
                size, eigenvalues, ..
            } => (eigenvalues.iter().sum::<f64>() / *size as f64).sqrt(),
        };
        scale * base
    }

    /// Negative log-likelihood of one system's residual block.
    ///
    /// Writes the whitened residuals to `out_normed` and returns
    /// `(nll, log_normalization)` where `nll = Σ r²/(2σ²)` and
    /// `log_normalization = Σ log σ`.
    pub fn nll(
        &self,
        observed: &[f64],
        time: &[f64],
        residual: &[f64],
        lambda_scale: f64,
        out_normed: &mut [f64],
    ) -> CoreResult<(f64, f64)> {
        let n = residual.len();
        if observed.len() != n || time.len() != n || out_normed.len() != n {
            return Err(CoreError::Invariant(format!(
                "noise input lengths disagree: obs {} time {} residual {n} normed {}",
                observed.len(),
                time.len(),
                out_normed.len()
            )));
        }

        match self {
            NoiseModel::Covariance {
                size,
                eigenvalues,
                eigenvectors,
            } => {
                if n != *size {
                    return Err(CoreError::Invariant(format!(
                        "covariance model of size {size} applied to residual of length {n}"
                    )));
                }
                let mut sum = 0.0;
                let mut log_norm = 0.0;
                for (j, &w) in eigenvalues.iter().enumerate() {
                    let row = &eigenvectors[j * size..(j + 1) * size];
                    let projected: f64 = row.iter().zip(residual).map(|(v, r)| v * r).sum();
                    let sigma = lambda_scale * w.sqrt();
                    let z = projected / sigma;
                    out_normed[j] = z;
                    sum += 0.5 * z * z;
                    log_norm += sigma.ln();
                }
                Ok((sum, log_norm))
            }
            _ => {
                let mut sum = 0.0;
                let mut log_norm = 0.0;
                for i in 0..n {
                    let sigma = self.noise_magnitude(observed[i], time[i], lambda_scale);
                    let z = residual[i] / sigma;
                    out_normed[i] = z;
                    sum += 0.5 * z * z;
                    log_norm += sigma.ln();
                }
                Ok((sum, log_norm))
            }
        }
    }
}

/// Piecewise-linear interpolation of `values` over ascending `knots`,
/// clamped at both ends.
fn interpolate(knots: &[f64], values: &[f64], x: f64) -> f64 {
    match knots.iter().position(|&k| k >= x) {
        Some(0) => values[0],
        Some(i) => {
            let t = (x - knots[i - 1]) / (knots[i] - knots[i - 1]);
            values[i - 1] + t * (values[i] - values[i - 1])
        }
        None => *values.last().unwrap(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn iid_nll_matches_closed_form() {
        let model = NoiseModel::Iid { sigma: 2.0 };
        let observed = [1.0, 1.0];
        let time = [1.0e-4, 2.0e-4];
        let residual = [2.0, -4.0];
        let mut normed = [0.0; 2];
        let (nll, log_norm) = model
            .nll(&observed, &time, &residual, 1.0, &mut normed)
            .unwrap();
        assert_abs_diff_eq!(nll, 0.5 * (1.0 + 4.0), epsilon = 1e-12);
        assert_abs_diff_eq!(log_norm, 2.0 * 2.0f64.ln(), epsilon = 1e-12);
        assert_abs_diff_eq!(normed[0], 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(normed[1], -2.0, epsilon = 1e-12);
    }

    #[test]
    fn lambda_scale_moves_normalization_not_whitened_shape() {
        let model = NoiseModel::Iid { sigma: 1.0 };
        let observed = [1.0; 4];
        let time = [1.0e-4; 4];
        let residual = [0.5, -0.5, 1.0, -1.0];
        let mut normed = [0.0; 4];
        let (nll1, norm1) = model
            .nll(&observed, &time, &residual, 1.0, &mut normed)
            .unwrap();
        let (nll2, norm2) = model
            .nll(&observed, &time, &residual, 2.0, &mut normed)
            .unwrap();
        assert_abs_diff_eq!(nll2, nll1 / 4.0, epsilon = 1e-12);
        assert_abs_diff_eq!(norm2 - norm1, 4.0 * 2.0f64.ln(), epsilon = 1e-12);
    }

    #[test]
    fn brodie_additive_table_interpolates() {
        let model = NoiseModel::Brodie {
            times: vec![1.0e-4, 1.0e-3],
            additive: vec![1.0, 3.0],
            relative: 0.0,
        };
        assert_abs_diff_eq!(
            model.noise_magnitude(0.0, 5.5e-4, 1.0),
            2.0,
            epsilon = 1e-12
        );
        // Clamped outside the table.
        assert_abs_diff_eq!(model.noise_magnitude(0.0, 1.0e-5, 1.0), 1.0);
        assert_abs_diff_eq!(model.noise_magnitude(0.0, 1.0e-2, 1.0), 3.0);
    }

    #[test]
    fn covariance_whitens_in_the_eigenbasis() {
        // Identity eigenvectors, eigenvalues 4 and 9.
        let model = NoiseModel::Covariance {
            size: 2,
            eigenvalues: vec![4.0, 9.0],
            eigenvectors: vec![1.0, 0.0, 0.0, 1.0],
        };
        let observed = [0.0; 2];
        let time = [1.0e-4; 2];
        let residual = [2.0, 3.0];
        let mut normed = [0.0; 2];
        let (nll, log_norm) = model
            .nll(&observed, &time, &residual, 1.0, &mut normed)
            .unwrap();
        assert_abs_diff_eq!(normed[0], 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(normed[1], 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(nll, 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(log_norm, 2.0f64.ln() + 3.0f64.ln(), epsilon = 1e-12);
    }

    #[test]
    fn loader_dispatches_on_tag() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("noise.txt");
        std::fs::write(&path, "hyperbolic 1.0e-12 0.02 1.0e-16\n").unwrap();
        match NoiseModel::load(&path).unwrap() {
            NoiseModel::Hyperbolic { a, b, c } => {
                assert_abs_diff_eq!(a, 1.0e-12);
                assert_abs_diff_eq!(b, 0.02);
                assert_abs_diff_eq!(c, 1.0e-16);
            }
            other => panic!("wrong model: {other:?}"),
        }

        std::fs::write(&path, "squiggly 1.0\n").unwrap();
        assert!(NoiseModel::load(&path).is_err());
    }
}
