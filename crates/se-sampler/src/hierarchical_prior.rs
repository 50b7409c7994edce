// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralEM — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Hierarchical move on the prior width multiplier.
//!
//! Rescaling the per-depth prior widths changes only the joint prior of
//! the live coefficients — no likelihood is evaluated and the acceptance
//! ratio is untempered.

use rand::Rng;
use rand_distr::{Distribution, Normal};

use se_chain::{ChainState, DeltaKind};
use se_core::error::CoreResult;

use crate::stats::{MoveStats, StepRecord};

pub struct HierarchicalPrior {
    pub stats: MoveStats,
    sigma: f64,
}

impl HierarchicalPrior {
    pub fn new(sigma: f64) -> Self {
        HierarchicalPrior {
            stats: MoveStats::scalar("PriorWidth"),
            sigma,
        }
    }

    pub fn step(&mut self, state: &mut ChainState) -> CoreResult<StepRecord> {
        self.stats.propose += 1;

        let old = state.prior.width_scale();
        let (lo, hi) = state.prior.width_scale_range();
        let mut msg = [0.0f64; 2]; // [valid, proposed]
        if state.comm.is_root() {
            let step = Normal::new(0.0, self.sigma)
                .expect("positive width walk")
                .sample(&mut state.rng);
            let proposed = old + step;
            if proposed >= lo && proposed <= hi {
                msg = [1.0, proposed];
            }
        }

        state.comm.broadcast_f64s(&mut msg, 0)?;
        if msg[0] == 0.0 {
            return Ok(StepRecord::invalid(DeltaKind::HierarchicalPrior));
        }
        let proposed = msg[1];
        self.stats.note_proposal(0);

        // Joint prior of the live multiset at both widths; identical on all
        // ranks, only the root draws.
        let live: Vec<(u32, f64)> = state
            .tree
            .live_snapshot()
            .into_iter()
            .map(|(idx, v)| (state.tree.depth_of(idx), v))
            .collect();
        let current_total = state
            .prior
            .log_prior_total_at_scale(old, live.iter().copied());
        let proposed_total = state
            .prior
            .log_prior_total_at_scale(proposed, live.iter().copied());

        let mut decision = [0.0f64];
        if state.comm.is_root() {
            let log_alpha = proposed_total - current_total;
            let u: f64 = state.rng.gen();
            decision[0] = (u.ln() < log_alpha) as u8 as f64;
        }

        state.comm.broadcast_f64s(&mut decision, 0)?;
        if decision[0] != 0.0 {
            self.stats.note_accept(0);
            state.prior.set_width_scale(proposed);
            Ok(StepRecord {
                kind: DeltaKind::HierarchicalPrior,
                accepted: true,
                idx: 0,
                depth: 0,
                new_value: proposed,
                old_value: Some(old),
            })
        } else {
            Ok(StepRecord {
                kind: DeltaKind::HierarchicalPrior,
                accepted: false,
                idx: 0,
                depth: 0,
                new_value: proposed,
                old_value: Some(old),
            })
        }
    }
}
