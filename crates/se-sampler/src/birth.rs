// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralEM — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Birth move: add one coefficient to the tree.
//!
//! Five stages, like every move: the chain root proposes, the proposal is
//! broadcast over the chain communicator, every rank evaluates the
//! proposed likelihood in parallel, the root computes acceptance, and the
//! decision is broadcast so all ranks commit or revert together.

use rand::Rng;
use tracing::warn;

use se_chain::{ChainState, DeltaKind};
use se_core::error::CoreResult;

use crate::stats::{MoveStats, StepRecord};

pub struct Birth {
    pub stats: MoveStats,
}

impl Birth {
    pub fn new(max_depth: u32) -> Self {
        Birth {
            stats: MoveStats::new("Birth", max_depth),
        }
    }

    pub fn step(&mut self, state: &mut ChainState) -> CoreResult<StepRecord> {
        self.stats.propose += 1;

        // Stage 1: root picks a uniform birth-eligible index and samples a
        // value from the proposal kernel.
        let mut msg = [0.0f64; 3]; // [valid, idx, value]
        if state.comm.is_root() {
            let k = state.tree.coefficient_count();
            let frontier = state.tree.birth_eligible_len();
            if k < state.kmax && frontier > 0 {
                let n = state.rng.gen_range(0..frontier);
                let idx = state
                    .tree
                    .birth_eligible_nth(n)
                    .expect("frontier index within bounds");
                let depth = state.tree.depth_of(idx);
                let parent = state.tree.parent_of(idx).expect("frontier is non-root");
                let parent_value = state.tree.value(parent).expect("parent of frontier is live");
                let (i, j) = state.tree.to_2d(idx);
                if let Some((value, _)) =
                    state
                        .prior
                        .sample_birth(&mut state.rng, i, j, depth, parent_value)
                {
                    msg = [1.0, idx as f64, value];
                }
            }
        }

        // Stage 2: broadcast the proposal.
        state.comm.broadcast_f64s(&mut msg, 0)?;
        if msg[0] == 0.0 {
            return Ok(StepRecord::invalid(DeltaKind::Birth));
        }
        let idx = msg[1] as u32;
        let value = msg[2];
        let depth = state.tree.depth_of(idx);
        self.stats.note_proposal(depth);

        let frontier_before = state.tree.birth_eligible_len();
        state.tree.insert(idx, value)?;
        let leaves_after = state.tree.death_eligible_len();

        // Stage 3: parallel likelihood of the grown model.
        let (p_like, p_norm) = state.likelihood()?;

        // Stage 4: root computes the Green's acceptance.
        let mut decision = [0.0f64];
        if state.comm.is_root() {
            if p_like.is_finite() && p_norm.is_finite() {
                let parent = state.tree.parent_of(idx).expect("non-root");
                let parent_value = state.tree.value(parent).expect("parent live");
                let (i, j) = state.tree.to_2d(idx);
                let log_q_fwd = state
                    .prior
                    .reverse_birth_density(i, j, depth, parent_value, value);
                let log_prior = state
                    .prior
                    .log_prior_ratio_birth(depth, value)
                    .unwrap_or(f64::NEG_INFINITY);
                let log_green =
                    (frontier_before as f64).ln() - (leaves_after as f64).ln();
                let log_alpha = log_green + log_prior - log_q_fwd
                    + (state.energy() - (p_like + p_norm)) / state.temperature;
                let u: f64 = state.rng.gen();
                decision[0] = (u.ln() < log_alpha) as u8 as f64;
            } else {
                warn!(idx, "birth proposal produced a non-finite likelihood");
            }
        }

        // Stage 5: broadcast and commit or revert.
        state.comm.broadcast_f64s(&mut decision, 0)?;
        if decision[0] != 0.0 {
            self.stats.note_accept(depth);
            state.current_likelihood = p_like;
            state.current_log_normalization = p_norm;
            state.accept();
            Ok(StepRecord {
                kind: DeltaKind::Birth,
                accepted: true,
                idx,
                depth,
                new_value: value,
                old_value: None,
            })
        } else {
            state.tree.remove(idx)?;
            state.reject();
            Ok(StepRecord {
                kind: DeltaKind::Birth,
                accepted: false,
                idx,
                depth,
                new_value: value,
                old_value: None,
            })
        }
    }
}
