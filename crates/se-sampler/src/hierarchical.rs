// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralEM — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Hierarchical move on the noise scale `lambda`.
//!
//! Residuals are not recomputed: the move re-evaluates only the
//! normalization term and the per-sample whitening at the proposed scale.
//! The step therefore requires valid residuals and refreshes them with a
//! full likelihood first when a swap or transplant left them stale.
//!
//! The walk is Gaussian on `ln lambda` under a log-uniform prior, so the
//! proposal Jacobian and the prior ratio cancel and the acceptance reduces
//! to the tempered energy difference.

use rand::Rng;
use rand_distr::{Distribution, Normal};

use se_chain::{ChainState, DeltaKind};
use se_core::error::CoreResult;

use crate::stats::{MoveStats, StepRecord};

/// Hard bounds of the noise scale, log-uniform inside.
const LAMBDA_MIN: f64 = 1.0e-3;
const LAMBDA_MAX: f64 = 1.0e3;

pub struct Hierarchical {
    pub stats: MoveStats,
    sigma: f64,
}

impl Hierarchical {
    pub fn new(sigma: f64) -> Self {
        Hierarchical {
            stats: MoveStats::scalar("Lambda"),
            sigma,
        }
    }

    pub fn step(&mut self, state: &mut ChainState) -> CoreResult<StepRecord> {
        self.stats.propose += 1;

        if !state.residuals_valid {
            state.refresh_residuals()?;
        }

        let old = state.lambda_scale;
        let mut msg = [0.0f64; 2]; // [valid, proposed]
        if state.comm.is_root() {
            let step = Normal::new(0.0, self.sigma)
                .expect("positive lambda walk width")
                .sample(&mut state.rng);
            let proposed = old * step.exp();
            if (LAMBDA_MIN..=LAMBDA_MAX).contains(&proposed) {
                msg = [1.0, proposed];
            }
        }

        state.comm.broadcast_f64s(&mut msg, 0)?;
        if msg[0] == 0.0 {
            return Ok(StepRecord::invalid(DeltaKind::Hierarchical));
        }
        let proposed = msg[1];
        self.stats.note_proposal(0);

        // Deterministic over tracked buffers, so every rank evaluates the
        // identical sum and no reduce is needed.
        let (p_like, p_norm) = state.hierarchical_likelihood(proposed)?;

        let mut decision = [0.0f64];
        if state.comm.is_root() {
            let log_alpha = (state.energy() - (p_like + p_norm)) / state.temperature;
            let u: f64 = state.rng.gen();
            decision[0] = (u.ln() < log_alpha) as u8 as f64;
        }

        state.comm.broadcast_f64s(&mut decision, 0)?;
        if decision[0] != 0.0 {
            self.stats.note_accept(0);
            state.accept_hierarchical(proposed, p_like, p_norm);
            Ok(StepRecord {
                kind: DeltaKind::Hierarchical,
                accepted: true,
                idx: 0,
                depth: 0,
                new_value: proposed,
                old_value: Some(old),
            })
        } else {
            Ok(StepRecord {
                kind: DeltaKind::Hierarchical,
                accepted: false,
                idx: 0,
                depth: 0,
                new_value: proposed,
                old_value: Some(old),
            })
        }
    }
}
