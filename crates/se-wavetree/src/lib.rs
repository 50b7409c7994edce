// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralEM — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Sparse multi-resolution wavelet models.
//!
//! Two halves: the reversible lift kernels ([`lift`]) and the sparse
//! coefficient quadtree ([`tree`]) the sampler mutates. The tree stores
//! coefficients in the exact layout the 2-D inverse transform consumes, so
//! reconstruction is scatter-then-transform.

pub mod lift;
pub mod tree;

pub use lift::{forward1d, forward2d, inverse1d, inverse2d, workspace_len, Basis};
pub use tree::{ChangeKind, ChangeRecord, WaveTree};
