// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralEM — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Value move: Gaussian perturbation of one live coefficient.

use rand::Rng;
use rand_distr::{Distribution, Normal};
use tracing::warn;

use se_chain::{ChainState, DeltaKind};
use se_core::error::CoreResult;

use crate::stats::{MoveStats, StepRecord};

pub struct Value {
    pub stats: MoveStats,
}

impl Value {
    pub fn new(max_depth: u32) -> Self {
        Value {
            stats: MoveStats::new("Value", max_depth),
        }
    }

    pub fn step(&mut self, state: &mut ChainState) -> CoreResult<StepRecord> {
        self.stats.propose += 1;

        let mut msg = [0.0f64; 3]; // [valid, idx, new value]
        if state.comm.is_root() {
            let k = state.tree.coefficient_count();
            let n = state.rng.gen_range(0..k);
            let (idx, old) = state.tree.live_nth(n).expect("live index within bounds");
            let depth = state.tree.depth_of(idx);
            let sigma = state.prior.value_step_std(depth);
            let step = Normal::new(0.0, sigma)
                .expect("positive proposal width")
                .sample(&mut state.rng);
            let proposed = old + step;
            let (lo, hi) = state.prior.prior_range(0, 0, depth);
            if proposed >= lo && proposed <= hi {
                msg = [1.0, idx as f64, proposed];
            }
        }

        state.comm.broadcast_f64s(&mut msg, 0)?;
        if msg[0] == 0.0 {
            return Ok(StepRecord::invalid(DeltaKind::Value));
        }
        let idx = msg[1] as u32;
        let proposed = msg[2];
        let depth = state.tree.depth_of(idx);
        self.stats.note_proposal(depth);
        let kind = if idx == 0 {
            DeltaKind::RootValue
        } else {
            DeltaKind::Value
        };

        let old = state.tree.update(idx, proposed)?;

        let (p_like, p_norm) = state.likelihood()?;

        let mut decision = [0.0f64];
        if state.comm.is_root() {
            if p_like.is_finite() && p_norm.is_finite() {
                // Symmetric proposal: only the prior and likelihood ratios.
                let log_prior = match (
                    state.prior.log_prior(depth, proposed),
                    state.prior.log_prior(depth, old),
                ) {
                    (Some(new_p), Some(old_p)) => new_p - old_p,
                    _ => f64::NEG_INFINITY,
                };
                let log_alpha =
                    log_prior + (state.energy() - (p_like + p_norm)) / state.temperature;
                let u: f64 = state.rng.gen();
                decision[0] = (u.ln() < log_alpha) as u8 as f64;
            } else {
                warn!(idx, "value proposal produced a non-finite likelihood");
            }
        }

        state.comm.broadcast_f64s(&mut decision, 0)?;
        if decision[0] != 0.0 {
            self.stats.note_accept(depth);
            state.current_likelihood = p_like;
            state.current_log_normalization = p_norm;
            state.accept();
            Ok(StepRecord {
                kind,
                accepted: true,
                idx,
                depth,
                new_value: proposed,
                old_value: Some(old),
            })
        } else {
            state.tree.update(idx, old)?;
            state.reject();
            Ok(StepRecord {
                kind,
                accepted: false,
                idx,
                depth,
                new_value: proposed,
                old_value: Some(old),
            })
        }
    }
}
