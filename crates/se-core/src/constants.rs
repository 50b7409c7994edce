// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralEM — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Physical and sampler-wide constants.

/// Lower bound of plausible ground conductivity (S/m).
pub const CONDUCTIVITY_MIN: f64 = 0.001;

/// Upper bound of plausible ground conductivity (S/m).
pub const CONDUCTIVITY_MAX: f64 = 5.0;

/// Background conductivity used for fresh models (S/m).
pub const DEFAULT_CONDUCTIVITY: f64 = 0.25;

/// Birth probability ceiling: birth + death together may not exceed 0.9.
pub const PB_MAX: f64 = 0.45;

/// Default capacity of the chain-history ring.
pub const CHAIN_HISTORY_STEPS: usize = 1_000_000;

/// Free-space magnetic permeability (H/m).
pub const MU0: f64 = 4.0e-7 * std::f64::consts::PI;

/// Default residual histogram geometry.
pub const RESIDUAL_HIST_BINS: usize = 100;
pub const RESIDUAL_HIST_MIN: f64 = -5.0;
pub const RESIDUAL_HIST_MAX: f64 = 5.0;
