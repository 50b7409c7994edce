// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralEM — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Reversible 1-D wavelet kernels and the separable 2-D driver.
//!
//! Each basis is a pair of plain step functions, one level of forward
//! analysis and its exact inverse, registered on the [`Basis`] enum — no
//! trait objects. Haar and the CDF 9/7 pair are lifting schemes (exactly
//! invertible step by step); the Daubechies family uses the orthogonal
//! periodic filter bank, whose inverse is its transpose.
//!
//! A step transforms `x[0..n]` in place between the interleaved signal and
//! the `[approximation | detail]` band layout, using a caller-provided
//! scratch slice of at least `n` values.

use std::f64::consts::SQRT_2;

/// One analysis/synthesis level over a contiguous slice.
pub type StepFn = fn(&mut [f64], &mut [f64]);

/// Wavelet bases understood by the sampler and postprocessors. The ids are
/// the ones accepted on the command line.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Basis {
    Haar = 0,
    Daub4 = 1,
    Daub6 = 2,
    Daub8 = 3,
    Cdf97 = 4,
    Cdf97Periodic = 5,
}

impl Basis {
    pub const MAX_ID: u32 = 5;

    pub fn from_id(id: u32) -> Option<Self> {
        match id {
            0 => Some(Basis::Haar),
            1 => Some(Basis::Daub4),
            2 => Some(Basis::Daub6),
            3 => Some(Basis::Daub8),
            4 => Some(Basis::Cdf97),
            5 => Some(Basis::Cdf97Periodic),
            _ => None,
        }
    }

    pub fn forward_step(self) -> StepFn {
        match self {
            Basis::Haar => haar_forward_step,
            Basis::Daub4 => daub4_forward_step,
            Basis::Daub6 => daub6_forward_step,
            Basis::Daub8 => daub8_forward_step,
            Basis::Cdf97 => cdf97_forward_step,
            Basis::Cdf97Periodic => cdf97_periodic_forward_step,
        }
    }

    pub fn inverse_step(self) -> StepFn {
        match self {
            Basis::Haar => haar_inverse_step,
            Basis::Daub4 => daub4_inverse_step,
            Basis::Daub6 => daub6_inverse_step,
            Basis::Daub8 => daub8_inverse_step,
            Basis::Cdf97 => cdf97_inverse_step,
            Basis::Cdf97Periodic => cdf97_periodic_inverse_step,
        }
    }
}

// ---------------------------------------------------------------------------
// Haar (orthonormal butterfly)
// ---------------------------------------------------------------------------

fn haar_forward_step(x: &mut [f64], work: &mut [f64]) {
    let half = x.len() / 2;
    for i in 0..half {
        let a = x[2 * i];
        let b = x[2 * i + 1];
        work[i] = (a + b) / SQRT_2;
        work[half + i] = (a - b) / SQRT_2;
    }
    x.copy_from_slice(&work[..x.len()]);
}

fn haar_inverse_step(x: &mut [f64], work: &mut [f64]) {
    let half = x.len() / 2;
    for i in 0..half {
        let s = x[i];
        let d = x[half + i];
        work[2 * i] = (s + d) / SQRT_2;
        work[2 * i + 1] = (s - d) / SQRT_2;
    }
    x.copy_from_slice(&work[..x.len()]);
}

// ---------------------------------------------------------------------------
// Daubechies orthogonal filter banks, periodic boundary
// ---------------------------------------------------------------------------

const DAUB4_H: [f64; 4] = [
    0.482_962_913_144_534_1,
    0.836_516_303_737_807_9,
    0.224_143_868_042_013_4,
    -0.129_409_522_551_260_4,
];

const DAUB6_H: [f64; 6] = [
    0.332_670_552_950_082_5,
    0.806_891_509_311_092_4,
    0.459_877_502_118_491_4,
    -0.135_011_020_010_254_6,
    -0.085_441_273_882_026_7,
    0.035_226_291_885_709_5,
];

const DAUB8_H: [f64; 8] = [
    0.230_377_813_308_896_4,
    0.714_846_570_552_915_4,
    0.630_880_767_929_858_7,
    -0.027_983_769_416_859_9,
    -0.187_034_811_719_093_1,
    0.030_841_381_835_560_7,
    0.032_883_011_666_885_2,
    -0.010_597_401_785_069_0,
];

fn daub_forward_step<const L: usize>(h: &[f64; L], x: &mut [f64], work: &mut [f64]) {
    let n = x.len();
    let half = n / 2;
    for i in 0..half {
        let mut s = 0.0;
        let mut d = 0.0;
        for (k, &hk) in h.iter().enumerate() {
            let xv = x[(2 * i + k) % n];
            s += hk * xv;
            // Quadrature mirror: g[k] = (-1)^k h[L-1-k].
            let gk = if k % 2 == 0 { h[L - 1 - k] } else { -h[L - 1 - k] };
            d += gk * xv;
        }
        work[i] = s;
        work[half + i] = d;
    }
    x.copy_from_slice(&work[..n]);
}

fn daub_inverse_step<const L: usize>(h: &[f64; L], x: &mut [f64], work: &mut [f64]) {
    let n = x.len();
    let half = n / 2;
    work[..n].fill(0.0);
    for i in 0..half {
        let s = x[i];
        let d = x[half + i];
        for (k, &hk) in h.iter().enumerate() {
            let gk = if k % 2 == 0 { h[L - 1 - k] } else { -h[L - 1 - k] };
            work[(2 * i + k) % n] += hk * s + gk * d;
        }
    }
    x.copy_from_slice(&work[..n]);
}

fn daub4_forward_step(x: &mut [f64], work: &mut [f64]) {
    daub_forward_step(&DAUB4_H, x, work);
}
fn daub4_inverse_step(x: &mut [f64], work: &mut [f64]) {
    daub_inverse_step(&DAUB4_H, x, work);
}
fn daub6_forward_step(x: &mut [f64], work: &mut [f64]) {
    daub_forward_step(&DAUB6_H, x, work);
}
fn daub6_inverse_step(x: &mut [f64], work: &mut [f64]) {
    daub_inverse_step(&DAUB6_H, x, work);
}
fn daub8_forward_step(x: &mut [f64], work: &mut [f64]) {
    daub_forward_step(&DAUB8_H, x, work);
}
fn daub8_inverse_step(x: &mut [f64], work: &mut [f64]) {
    daub_inverse_step(&DAUB8_H, x, work);
}

// ---------------------------------------------------------------------------
// CDF 9/7 lifting (JPEG2000 irreversible constants)
// ---------------------------------------------------------------------------

const CDF97_ALPHA: f64 = -1.586_134_342_059_924;
const CDF97_BETA: f64 = -0.052_980_118_572_961;
const CDF97_GAMMA: f64 = 0.882_911_075_530_934;
const CDF97_DELTA: f64 = 0.443_506_852_043_971;
const CDF97_ZETA: f64 = 1.149_604_398_860_241;

#[derive(Clone, Copy)]
enum Extension {
    Symmetric,
    Periodic,
}

impl Extension {
    fn prev(self, i: usize, half: usize) -> usize {
        match self {
            Extension::Symmetric => i.saturating_sub(1).min(half - 1),
            Extension::Periodic => (i + half - 1) % half,
        }
    }

    fn next(self, i: usize, half: usize) -> usize {
        match self {
            Extension::Symmetric => (i + 1).min(half - 1),
            Extension::Periodic => (i + 1) % half,
        }
    }
}

fn cdf97_forward(ext: Extension, x: &mut [f64], work: &mut [f64]) {
    let n = x.len();
    let half = n / 2;
    let (s, d) = work[..n].split_at_mut(half);
    for i in 0..half {
        s[i] = x[2 * i];
        d[i] = x[2 * i + 1];
    }
    for i in 0..half {
        d[i] += CDF97_ALPHA * (s[i] + s[ext.next(i, half)]);
    }
    for i in 0..half {
        s[i] += CDF97_BETA * (d[i] + d[ext.prev(i, half)]);
    }
    for i in 0..half {
        d[i] += CDF97_GAMMA * (s[i] + s[ext.next(i, half)]);
    }
    for i in 0..half {
        s[i] += CDF97_DELTA * (d[i] + d[ext.prev(i, half)]);
    }
    for i in 0..half {
        x[i] = s[i] * CDF97_ZETA;
        x[half + i] = d[i] / CDF97_ZETA;
    }
}

fn cdf97_inverse(ext: Extension, x: &mut [f64], work: &mut [f64]) {
    let n = x.len();
    let half = n / 2;
    let (s, d) = work[..n].split_at_mut(half);
    for i in 0..half {
        s[i] = x[i] / CDF97_ZETA;
        d[i] = x[half + i] * CDF97_ZETA;
    }
    for i in 0..half {
        s[i] -= CDF97_DELTA * (d[i] + d[ext.prev(i, half)]);
    }
    for i in 0..half {
        d[i] -= CDF97_GAMMA * (s[i] + s[ext.next(i, half)]);
    }
    for i in 0..half {
        s[i] -= CDF97_BETA * (d[i] + d[ext.prev(i, half)]);
    }
    for i in 0..half {
        d[i] -= CDF97_ALPHA * (s[i] + s[ext.next(i, half)]);
    }
    for i in 0..half {
        x[2 * i] = s[i];
        x[2 * i + 1] = d[i];
    }
}

fn cdf97_forward_step(x: &mut [f64], work: &mut [f64]) {
    cdf97_forward(Extension::Symmetric, x, work);
}
fn cdf97_inverse_step(x: &mut [f64], work: &mut [f64]) {
    cdf97_inverse(Extension::Symmetric, x, work);
}
fn cdf97_periodic_forward_step(x: &mut [f64], work: &mut [f64]) {
    cdf97_forward(Extension::Periodic, x, work);
}
fn cdf97_periodic_inverse_step(x: &mut [f64], work: &mut [f64]) {
    cdf97_inverse(Extension::Periodic, x, work);
}

// ---------------------------------------------------------------------------
// Multi-level 1-D and separable 2-D drivers
// ---------------------------------------------------------------------------

/// Full forward analysis of a power-of-two signal, finest level first.
pub fn forward1d(basis: Basis, x: &mut [f64], work: &mut [f64]) {
    let step = basis.forward_step();
    let mut w = x.len();
    while w >= 2 {
        step(&mut x[..w], work);
        w /= 2;
    }
}

/// Full synthesis, coarsest level first. Exact inverse of [`forward1d`].
pub fn inverse1d(basis: Basis, x: &mut [f64], work: &mut [f64]) {
    let step = basis.inverse_step();
    let mut w = 2;
    while w <= x.len() {
        step(&mut x[..w], work);
        w *= 2;
    }
}

/// Per-level active sub-block sizes for a (possibly non-square) grid, from
/// the full grid down to the level above the root.
fn level_sizes(width: usize, height: usize) -> Vec<(usize, usize)> {
    let mut sizes = Vec::new();
    let mut w = width;
    let mut h = height;
    while w > 1 || h > 1 {
        sizes.push((w, h));
        if w > 1 {
            w /= 2;
        }
        if h > 1 {
            h /= 2;
        }
    }
    sizes
}

fn rows_step(step: StepFn, data: &mut [f64], width: usize, w: usize, h: usize, work: &mut [f64]) {
    for row in 0..h {
        step(&mut data[row * width..row * width + w], work);
    }
}

fn columns_step(
    step: StepFn,
    data: &mut [f64],
    width: usize,
    w: usize,
    h: usize,
    work: &mut [f64],
) {
    // Columns are strided; gather into the tail of the workspace, transform
    // with its head, scatter back.
    for col in 0..w {
        let (scratch, column) = work.split_at_mut(h);
        for row in 0..h {
            column[row] = data[row * width + col];
        }
        step(&mut column[..h], scratch);
        for row in 0..h {
            data[row * width + col] = column[row];
        }
    }
}

/// Workspace length required by the 2-D drivers.
pub fn workspace_len(width: usize, height: usize) -> usize {
    2 * width.max(height)
}

/// Inverse 2-D transform of a row-major coefficient grid: coarse to fine,
/// horizontal rows before vertical columns at each level. This ordering is
/// load-bearing — the sampler and every postprocessor share it.
pub fn inverse2d(
    hbasis: Basis,
    vbasis: Basis,
    data: &mut [f64],
    width: usize,
    height: usize,
    work: &mut [f64],
) {
    debug_assert!(work.len() >= workspace_len(width, height));
    let hstep = hbasis.inverse_step();
    let vstep = vbasis.inverse_step();
    for &(w, h) in level_sizes(width, height).iter().rev() {
        if w > 1 {
            rows_step(hstep, data, width, w, h, work);
        }
        if h > 1 {
            columns_step(vstep, data, width, w, h, work);
        }
    }
}

/// Forward 2-D transform: the exact reverse of [`inverse2d`] — fine to
/// coarse, vertical columns before horizontal rows.
pub fn forward2d(
    hbasis: Basis,
    vbasis: Basis,
    data: &mut [f64],
    width: usize,
    height: usize,
    work: &mut [f64],
) {
    debug_assert!(work.len() >= workspace_len(width, height));
    let hstep = hbasis.forward_step();
    let vstep = vbasis.forward_step();
    for &(w, h) in level_sizes(width, height).iter() {
        if h > 1 {
            columns_step(vstep, data, width, w, h, work);
        }
        if w > 1 {
            rows_step(hstep, data, width, w, h, work);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha8Rng;

    const ALL: [Basis; 6] = [
        Basis::Haar,
        Basis::Daub4,
        Basis::Daub6,
        Basis::Daub8,
        Basis::Cdf97,
        Basis::Cdf97Periodic,
    ];

    #[test]
    fn every_basis_reconstructs_1d() {
        let mut rng = ChaCha8Rng::seed_from_u64(42);
        for basis in ALL {
            for n in [2usize, 4, 16, 64] {
                let original: Vec<f64> = (0..n).map(|_| rng.gen_range(-2.0..2.0)).collect();
                let mut x = original.clone();
                let mut work = vec![0.0; 2 * n];
                inverse1d(basis, &mut x, &mut work);
                forward1d(basis, &mut x, &mut work);
                for (a, b) in x.iter().zip(&original) {
                    assert!(
                        (a - b).abs() < 1e-10,
                        "{basis:?} n={n}: {a} vs {b}"
                    );
                }
            }
        }
    }

    #[test]
    fn every_basis_reconstructs_2d_nonsquare() {
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        for basis in ALL {
            for (w, h) in [(16usize, 4usize), (4, 16), (8, 8), (2, 2)] {
                let original: Vec<f64> = (0..w * h).map(|_| rng.gen_range(-1.0..1.0)).collect();
                let mut data = original.clone();
                let mut work = vec![0.0; workspace_len(w, h)];
                inverse2d(basis, basis, &mut data, w, h, &mut work);
                forward2d(basis, basis, &mut data, w, h, &mut work);
                for (a, b) in data.iter().zip(&original) {
                    assert!((a - b).abs() < 1e-10, "{basis:?} {w}x{h}: {a} vs {b}");
                }
            }
        }
    }

    #[test]
    fn haar_root_spreads_evenly() {
        // A lone root coefficient reconstructs to a constant image.
        let (w, h) = (8usize, 4usize);
        let mut data = vec![0.0; w * h];
        data[0] = 1.0;
        let mut work = vec![0.0; workspace_len(w, h)];
        inverse2d(Basis::Haar, Basis::Haar, &mut data, w, h, &mut work);
        let first = data[0];
        assert!(first > 0.0);
        for v in &data {
            assert!((v - first).abs() < 1e-12);
        }
    }

    #[test]
    fn mixed_bases_per_axis_still_reconstruct() {
        let mut rng = ChaCha8Rng::seed_from_u64(99);
        let (w, h) = (16usize, 8usize);
        let original: Vec<f64> = (0..w * h).map(|_| rng.gen_range(-1.0..1.0)).collect();
        let mut data = original.clone();
        let mut work = vec![0.0; workspace_len(w, h)];
        inverse2d(Basis::Cdf97, Basis::Haar, &mut data, w, h, &mut work);
        forward2d(Basis::Cdf97, Basis::Haar, &mut data, w, h, &mut work);
        for (a, b) in data.iter().zip(&original) {
            assert!((a - b).abs() < 1e-10);
        }
    }

    #[test]
    fn registry_round_trips_ids() {
        for id in 0..=Basis::MAX_ID {
            let basis = Basis::from_id(id).unwrap();
            assert_eq!(basis as u32, id);
        }
        assert!(Basis::from_id(6).is_none());
    }
}
