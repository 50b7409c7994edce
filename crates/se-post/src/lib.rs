// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralEM — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Postprocessing of recorded chains.
//!
//! Everything here consumes the binary chain-history format: posterior
//! image summaries (mean, variance, mode, median, credible and HPD
//! intervals), likelihood validation against a fresh replica, and the
//! coefficient-count trace.

pub mod histogram;
pub mod khistory;
pub mod summary;
pub mod validate;

pub use khistory::write_khistory;
pub use summary::{PosteriorSummary, SummaryConfig};
pub use validate::{validate_likelihood, ValidateConfig, ValidationReport};
