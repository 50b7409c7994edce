// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralEM — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Likelihood validation of a recorded chain.
//!
//! Replays a chain history against a fresh replica: for each accepted step
//! that passes the skip/thin filter, the tree is rebuilt from the live
//! multiset, the hierarchical scale is installed, the likelihood is
//! recomputed from scratch and compared with the stored value. A healthy
//! run reports a maximum error in the rounding noise.

use std::path::Path;

use tracing::debug;

use se_chain::ChainState;
use se_core::error::{CoreError, CoreResult};

#[derive(Clone, Copy, Debug)]
pub struct ValidateConfig {
    pub skip: usize,
    pub thin: usize,
    /// Upper bound on recomputed steps; validation is quadratic-ish in run
    /// length otherwise.
    pub max_checks: usize,
}

impl Default for ValidateConfig {
    fn default() -> Self {
        ValidateConfig {
            skip: 0,
            thin: 0,
            max_checks: 1000,
        }
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct ValidationReport {
    pub steps: usize,
    pub accepted: usize,
    pub checked: usize,
    pub max_error: f64,
}

/// Replays `path`, recomputing likelihoods on `state` (any single-rank
/// replica configured like the recording run).
pub fn validate_likelihood(
    state: &mut ChainState,
    path: impl AsRef<Path>,
    cfg: ValidateConfig,
) -> CoreResult<ValidationReport> {
    let path = path.as_ref();
    let bytes = std::fs::read(path).map_err(|e| CoreError::io(path, e))?;
    let mut report = ValidationReport::default();
    let mut cursor = std::io::Cursor::new(bytes);

    let mut failure: Option<CoreError> = None;
    se_chain::replay(&mut cursor, |_, delta, live| {
        report.steps += 1;
        if !delta.accepted || failure.is_some() {
            return Ok(());
        }
        let keep = report.checked < cfg.max_checks
            && report.steps - 1 >= cfg.skip
            && (cfg.thin <= 1 || report.accepted % cfg.thin == 0);
        report.accepted += 1;
        if !keep {
            return Ok(());
        }

        let snapshot: Vec<(u32, f64)> = live.iter().map(|(&k, &v)| (k, v)).collect();
        if let Err(e) = state.tree.set_from_live(&snapshot) {
            failure = Some(e);
            return Ok(());
        }
        state.lambda_scale = delta.lambda_scale;
        match state.likelihood() {
            Ok((like, _norm)) => {
                let error = (delta.likelihood - like).abs();
                debug!(
                    step = report.steps,
                    stored = delta.likelihood,
                    computed = like,
                    error,
                    "validated step"
                );
                if error > report.max_error {
                    report.max_error = error;
                }
                report.checked += 1;
            }
            Err(e) => failure = Some(e),
        }
        Ok(())
    })?;

    match failure {
        Some(e) => Err(e),
        None => Ok(report),
    }
}
