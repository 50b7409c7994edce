// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralEM — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Replica resampling.
//!
//! Each chain draws a donor among the chains at or below the resampling
//! temperature, weighted by the donors' relative posterior mass, and
//! transplants the donor's whole model. The shared-seed draw keeps every
//! chain root's view of the assignment identical. Used both to seed a
//! restarted ladder from a converged run and, at a low cadence, to cull
//! replicas stranded in poor modes.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tracing::debug;

use se_chain::ChainState;
use se_core::comms::Comm;
use se_core::error::CoreResult;

use crate::ptexchange::{gather_chain_info, gather_models, sync_model_with_followers};
use crate::stats::MoveStats;

pub struct Resample {
    pub stats: MoveStats,
    round: u64,
    seed: u64,
}

impl Resample {
    pub fn new(seed: u64) -> Self {
        Resample {
            stats: MoveStats::scalar("Resample"),
            round: 0,
            seed,
        }
    }

    /// One resampling round. Returns whether this chain adopted a donor
    /// model (adopting one's own model is a no-op).
    pub fn step(
        &mut self,
        state: &mut ChainState,
        temperature_comm: Option<&Comm>,
        resample_temperature: f64,
    ) -> CoreResult<bool> {
        let mut adopt: Option<Vec<f64>> = None;

        if let Some(temp) = temperature_comm {
            let n = temp.size();
            let me = temp.rank();
            let info = gather_chain_info(temp, state)?;

            let donors: Vec<usize> = (0..n)
                .filter(|&c| info[2 * c] <= resample_temperature + 1.0e-9)
                .collect();

            if !donors.is_empty() {
                self.stats.propose += 1;

                // Weights relative to the best donor, clamped against
                // underflow in the exponent.
                let best = donors
                    .iter()
                    .map(|&d| info[2 * d + 1])
                    .fold(f64::INFINITY, f64::min);
                let weights: Vec<f64> = donors
                    .iter()
                    .map(|&d| (-(info[2 * d + 1] - best).min(700.0)).exp())
                    .collect();
                let total: f64 = weights.iter().sum();

                let mut rng = ChaCha8Rng::seed_from_u64(
                    self.seed ^ self.round.wrapping_mul(0xD1B5_4A32_D192_ED03),
                );
                self.round += 1;
                let mut choice = vec![0usize; n];
                for slot in choice.iter_mut() {
                    let mut u: f64 = rng.gen::<f64>() * total;
                    let mut picked = donors[donors.len() - 1];
                    for (&d, &w) in donors.iter().zip(&weights) {
                        if u < w {
                            picked = d;
                            break;
                        }
                        u -= w;
                    }
                    *slot = picked;
                }

                let models = gather_models(temp, state.pack_model())?;
                if choice[me] != me {
                    self.stats.note_accept(0);
                    debug!(chain = me, donor = choice[me], "resampled model");
                    adopt = Some(models[choice[me]].clone());
                }
            }
        }

        sync_model_with_followers(state, adopt)
    }
}
