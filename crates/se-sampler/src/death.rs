// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralEM — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Death move: remove one leaf coefficient.
//!
//! The reverse of a birth: the uniform choice runs over the death-eligible
//! leaves, and the birth proposal density at the removed value plays the
//! role of the reverse kernel. A rejected death restores the removed value
//! exactly.

use rand::Rng;
use tracing::warn;

use se_chain::{ChainState, DeltaKind};
use se_core::error::CoreResult;

use crate::stats::{MoveStats, StepRecord};

pub struct Death {
    pub stats: MoveStats,
}

impl Death {
    pub fn new(max_depth: u32) -> Self {
        Death {
            stats: MoveStats::new("Death", max_depth),
        }
    }

    pub fn step(&mut self, state: &mut ChainState) -> CoreResult<StepRecord> {
        self.stats.propose += 1;

        let mut msg = [0.0f64; 2]; // [valid, idx]
        if state.comm.is_root() {
            let leaves = state.tree.death_eligible_len();
            if leaves > 0 {
                let n = state.rng.gen_range(0..leaves);
                let idx = state
                    .tree
                    .death_eligible_nth(n)
                    .expect("leaf index within bounds");
                msg = [1.0, idx as f64];
            }
        }

        state.comm.broadcast_f64s(&mut msg, 0)?;
        if msg[0] == 0.0 {
            return Ok(StepRecord::invalid(DeltaKind::Death));
        }
        let idx = msg[1] as u32;
        let depth = state.tree.depth_of(idx);
        self.stats.note_proposal(depth);

        let leaves_before = state.tree.death_eligible_len();
        // Replicas hold identical trees, so the removed value agrees
        // everywhere without another broadcast.
        let value = state.tree.remove(idx)?;
        let frontier_after = state.tree.birth_eligible_len();

        let (p_like, p_norm) = state.likelihood()?;

        let mut decision = [0.0f64];
        if state.comm.is_root() {
            if p_like.is_finite() && p_norm.is_finite() {
                let parent = state.tree.parent_of(idx).expect("non-root");
                let parent_value = state.tree.value(parent).expect("parent live");
                let (i, j) = state.tree.to_2d(idx);
                let log_q_rev = state
                    .prior
                    .reverse_birth_density(i, j, depth, parent_value, value);
                let log_prior = state.prior.log_prior_ratio_death(depth, value);
                let log_green =
                    (leaves_before as f64).ln() - (frontier_after as f64).ln();
                let log_alpha = log_green + log_prior + log_q_rev
                    + (state.energy() - (p_like + p_norm)) / state.temperature;
                let u: f64 = state.rng.gen();
                decision[0] = (u.ln() < log_alpha) as u8 as f64;
            } else {
                warn!(idx, "death proposal produced a non-finite likelihood");
            }
        }

        state.comm.broadcast_f64s(&mut decision, 0)?;
        if decision[0] != 0.0 {
            self.stats.note_accept(depth);
            state.current_likelihood = p_like;
            state.current_log_normalization = p_norm;
            state.accept();
            Ok(StepRecord {
                kind: DeltaKind::Death,
                accepted: true,
                idx,
                depth,
                new_value: 0.0,
                old_value: Some(value),
            })
        } else {
            state.tree.insert(idx, value)?;
            state.reject();
            Ok(StepRecord {
                kind: DeltaKind::Death,
                accepted: false,
                idx,
                depth,
                new_value: 0.0,
                old_value: Some(value),
            })
        }
    }
}
