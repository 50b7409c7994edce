// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralEM — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Per-pixel posterior summarisation over replayed chain histories.
//!
//! Every replayed step that passes the skip/thin filter is reconstructed —
//! sparse multiset to dense coefficients, inverse 2-D transform in the
//! sampler's ordering, optional exponentiation out of the log domain —
//! and folded into running mean/variance (Welford), min/max, and a
//! per-pixel histogram from which the point estimates and intervals are
//! extracted.

use std::io::Write as _;
use std::path::Path;

use se_core::error::{CoreError, CoreResult};
use se_wavetree::{inverse2d, workspace_len, Basis, WaveTree};

use crate::histogram::{
    head_from_histogram, histogram_index, hpd_from_histogram, median_from_histogram,
    mode_from_histogram, tail_from_histogram,
};

#[derive(Clone, Debug)]
pub struct SummaryConfig {
    pub degree_x: u32,
    pub degree_y: u32,
    pub hbasis: Basis,
    pub vbasis: Basis,
    pub bins: usize,
    pub vmin: f64,
    pub vmax: f64,
    pub skip: usize,
    pub thin: usize,
    /// Exponentiate reconstructions out of the log-conductivity domain.
    pub exponentiate: bool,
}

pub struct PosteriorSummary {
    tree: WaveTree,
    cfg: SummaryConfig,
    width: usize,
    height: usize,
    size: usize,
    dense: Vec<f64>,
    work: Vec<f64>,
    seen: usize,
    counted: usize,
    mean: Vec<f64>,
    m2: Vec<f64>,
    hist: Vec<u32>,
    pub min_seen: f64,
    pub max_seen: f64,
}

impl PosteriorSummary {
    pub fn new(cfg: SummaryConfig) -> CoreResult<Self> {
        let tree = WaveTree::new(cfg.degree_x, cfg.degree_y)?;
        let width = tree.width() as usize;
        let height = tree.height() as usize;
        let size = width * height;
        if cfg.bins == 0 || cfg.vmax <= cfg.vmin {
            return Err(CoreError::Validation(
                "histogram needs bins >= 1 and an increasing value range".into(),
            ));
        }
        Ok(PosteriorSummary {
            width,
            height,
            size,
            dense: vec![0.0; size],
            work: vec![0.0; workspace_len(width, height)],
            seen: 0,
            counted: 0,
            mean: vec![0.0; size],
            m2: vec![0.0; size],
            hist: vec![0; size * cfg.bins],
            min_seen: f64::INFINITY,
            max_seen: f64::NEG_INFINITY,
            tree,
            cfg,
        })
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    /// Number of models folded into the summary.
    pub fn count(&self) -> usize {
        self.counted
    }

    /// Replays one chain-history file into the running summary.
    pub fn consume_file(&mut self, path: impl AsRef<Path>) -> CoreResult<usize> {
        let path = path.as_ref();
        let bytes = std::fs::read(path).map_err(|e| CoreError::io(path, e))?;
        let before = self.counted;
        let mut cursor = std::io::Cursor::new(bytes);
        // Destructure so the closure borrows fields, not `self`.
        let Self {
            tree,
            cfg,
            width,
            size,
            dense,
            work,
            seen,
            counted,
            mean,
            m2,
            hist,
            min_seen,
            max_seen,
            height,
        } = self;
        se_chain::replay(&mut cursor, |_, _delta, live| {
            let keep = *seen >= cfg.skip && (cfg.thin <= 1 || *seen % cfg.thin == 0);
            *seen += 1;
            if !keep {
                return Ok(());
            }

            let snapshot: Vec<(u32, f64)> = live.iter().map(|(&k, &v)| (k, v)).collect();
            tree.set_from_live(&snapshot)?;
            tree.map_to_array(dense)?;
            inverse2d(cfg.hbasis, cfg.vbasis, dense, *width, *height, work);
            if cfg.exponentiate {
                for v in dense.iter_mut() {
                    *v = v.exp();
                }
            }

            *counted += 1;
            let n = *counted as f64;
            for i in 0..*size {
                let x = dense[i];
                let delta = x - mean[i];
                mean[i] += delta / n;
                m2[i] += delta * (x - mean[i]);
                *min_seen = min_seen.min(x);
                *max_seen = max_seen.max(x);
                let b = histogram_index(x, cfg.vmin, cfg.vmax, cfg.bins);
                hist[i * cfg.bins + b] += 1;
            }
            Ok(())
        })?;
        Ok(self.counted - before)
    }

    pub fn mean(&self) -> &[f64] {
        &self.mean
    }

    pub fn variance(&self) -> Vec<f64> {
        let denom = (self.counted.max(2) - 1) as f64;
        self.m2.iter().map(|&m| m / denom).collect()
    }

    pub fn stddev(&self) -> Vec<f64> {
        self.variance().into_iter().map(f64::sqrt).collect()
    }

    fn per_pixel(&self, f: impl Fn(&[u32]) -> f64) -> Vec<f64> {
        (0..self.size)
            .map(|i| f(&self.hist[i * self.cfg.bins..(i + 1) * self.cfg.bins]))
            .collect()
    }

    pub fn mode(&self) -> Vec<f64> {
        self.per_pixel(|h| mode_from_histogram(h, self.cfg.vmin, self.cfg.vmax))
    }

    pub fn median(&self) -> Vec<f64> {
        self.per_pixel(|h| median_from_histogram(h, self.cfg.vmin, self.cfg.vmax))
    }

    fn credible_drop(&self, interval: f64) -> u64 {
        (self.counted as f64 * (1.0 - interval) / 2.0) as u64
    }

    pub fn credible_min(&self, interval: f64) -> Vec<f64> {
        let drop = self.credible_drop(interval);
        self.per_pixel(|h| head_from_histogram(h, self.cfg.vmin, self.cfg.vmax, drop))
    }

    pub fn credible_max(&self, interval: f64) -> Vec<f64> {
        let drop = self.credible_drop(interval);
        self.per_pixel(|h| tail_from_histogram(h, self.cfg.vmin, self.cfg.vmax, drop))
    }

    /// `(range, low, high)` grids of the minimum-width interval holding
    /// `interval` of the mass.
    pub fn hpd(&self, interval: f64) -> (Vec<f64>, Vec<f64>, Vec<f64>) {
        let mut range = Vec::with_capacity(self.size);
        let mut low = Vec::with_capacity(self.size);
        let mut high = Vec::with_capacity(self.size);
        for i in 0..self.size {
            let h = &self.hist[i * self.cfg.bins..(i + 1) * self.cfg.bins];
            let (w, lo, hi) = hpd_from_histogram(h, self.cfg.vmin, self.cfg.vmax, interval);
            range.push(w);
            low.push(lo);
            high.push(hi);
        }
        (range, low, high)
    }

    /// Raw per-pixel histogram counts, `bins` per pixel.
    pub fn histogram(&self) -> &[u32] {
        &self.hist
    }

    pub fn bins(&self) -> usize {
        self.cfg.bins
    }

    /// Writes a `height x width` grid as rows of floats.
    pub fn write_grid(&self, path: impl AsRef<Path>, grid: &[f64]) -> CoreResult<()> {
        let path = path.as_ref();
        let mut out =
            std::io::BufWriter::new(std::fs::File::create(path).map_err(|e| CoreError::io(path, e))?);
        let write = |out: &mut dyn std::io::Write| -> std::io::Result<()> {
            for row in 0..self.height {
                for col in 0..self.width {
                    write!(out, "{:10.6} ", grid[row * self.width + col])?;
                }
                writeln!(out)?;
            }
            Ok(())
        };
        write(&mut out).map_err(|e| CoreError::io(path, e))?;
        out.flush().map_err(|e| CoreError::io(path, e))
    }

    /// Writes the raw histograms with their grid header.
    pub fn save_histogram(&self, path: impl AsRef<Path>) -> CoreResult<()> {
        let path = path.as_ref();
        let mut out =
            std::io::BufWriter::new(std::fs::File::create(path).map_err(|e| CoreError::io(path, e))?);
        let write = |out: &mut dyn std::io::Write| -> std::io::Result<()> {
            writeln!(out, "{} {}", self.size, self.cfg.bins)?;
            writeln!(out, "{:.6} {:.6}", self.cfg.vmin, self.cfg.vmax)?;
            for i in 0..self.size {
                for b in 0..self.cfg.bins {
                    write!(out, "{} ", self.hist[i * self.cfg.bins + b])?;
                }
                writeln!(out)?;
            }
            Ok(())
        };
        write(&mut out).map_err(|e| CoreError::io(path, e))?;
        out.flush().map_err(|e| CoreError::io(path, e))
    }
}
