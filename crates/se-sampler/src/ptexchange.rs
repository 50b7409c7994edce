// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralEM — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Parallel-tempering exchange.
//!
//! Chain roots meet on the temperature communicator, pair up through a
//! shared-seed shuffle (every root derives the identical permutation and
//! acceptance draws, so no decision messaging is needed and no two pairs
//! ever overlap), and accepted pairs exchange whole models — trees,
//! hierarchical parameters, cached likelihoods, residual buffers.
//! Temperatures stay at their rank positions. Followers receive the new
//! model over the chain communicator.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tracing::debug;

use se_chain::ChainState;
use se_core::comms::Comm;
use se_core::error::CoreResult;

use crate::stats::MoveStats;

/// Gathers `(temperature, energy)` of every chain root, in chain order.
pub(crate) fn gather_chain_info(temp: &Comm, state: &ChainState) -> CoreResult<Vec<f64>> {
    let n = temp.size();
    let mut info = vec![0.0f64; 2 * n];
    temp.all_gather_var(
        &[state.temperature, state.energy()],
        &vec![2; n],
        &mut info,
    )?;
    Ok(info)
}

/// All chain roots publish their packed model and receive everyone's.
pub(crate) fn gather_models(temp: &Comm, mine: Vec<f64>) -> CoreResult<Vec<Vec<f64>>> {
    let n = temp.size();
    let mut lens = vec![0.0f64; n];
    temp.all_gather_var(&[mine.len() as f64], &vec![1; n], &mut lens)?;
    let counts: Vec<usize> = lens.iter().map(|&l| l as usize).collect();
    let mut flat = vec![0.0f64; counts.iter().sum()];
    temp.all_gather_var(&mine, &counts, &mut flat)?;

    let mut models = Vec::with_capacity(n);
    let mut at = 0;
    for count in counts {
        models.push(flat[at..at + count].to_vec());
        at += count;
    }
    Ok(models)
}

/// Chain root pushes an adopted model (if any) to its followers; every
/// rank of the chain installs it. Returns whether the model changed.
pub(crate) fn sync_model_with_followers(
    state: &mut ChainState,
    adopt: Option<Vec<f64>>,
) -> CoreResult<bool> {
    let mut header = [0.0f64; 2]; // [changed, payload length]
    if state.comm.is_root() {
        if let Some(payload) = &adopt {
            header = [1.0, payload.len() as f64];
        }
    }
    state.comm.broadcast_f64s(&mut header, 0)?;
    if header[0] == 0.0 {
        return Ok(false);
    }
    let mut payload = match adopt {
        Some(payload) if state.comm.is_root() => payload,
        _ => vec![0.0; header[1] as usize],
    };
    state.comm.broadcast_f64s(&mut payload, 0)?;
    state.unpack_model(&payload)?;
    Ok(true)
}

pub struct PtExchange {
    pub stats: MoveStats,
    round: u64,
    seed: u64,
}

impl PtExchange {
    pub fn new(seed: u64) -> Self {
        PtExchange {
            stats: MoveStats::scalar("PTExchange"),
            round: 0,
            seed,
        }
    }

    /// Acceptance for exchanging the models of two replicas with energies
    /// `e` and temperatures `t`.
    fn swap_log_alpha(ta: f64, ea: f64, tb: f64, eb: f64) -> f64 {
        (ea - eb) * (1.0 / ta - 1.0 / tb)
    }

    /// One exchange round. `temperature_comm` is `Some` on chain roots.
    /// Returns whether this chain adopted a new model.
    pub fn step(
        &mut self,
        state: &mut ChainState,
        temperature_comm: Option<&Comm>,
    ) -> CoreResult<bool> {
        let mut adopt: Option<Vec<f64>> = None;

        if let Some(temp) = temperature_comm {
            let n = temp.size();
            let me = temp.rank();
            let info = gather_chain_info(temp, state)?;

            // Every root replays the same pairing and acceptance draws.
            let mut rng = ChaCha8Rng::seed_from_u64(
                self.seed ^ self.round.wrapping_mul(0x9E37_79B9_7F4A_7C15),
            );
            self.round += 1;
            let mut perm: Vec<usize> = (0..n).collect();
            for i in (1..n).rev() {
                let j = rng.gen_range(0..=i);
                perm.swap(i, j);
            }

            let mut partner: Option<usize> = None;
            for pair in perm.chunks_exact(2) {
                let (a, b) = (pair[0], pair[1]);
                let (ta, ea) = (info[2 * a], info[2 * a + 1]);
                let (tb, eb) = (info[2 * b], info[2 * b + 1]);
                let log_alpha = Self::swap_log_alpha(ta, ea, tb, eb);
                let u: f64 = rng.gen();
                let accepted = u.ln() < log_alpha;
                if a == me || b == me {
                    self.stats.propose += 1;
                    if accepted {
                        let other = if a == me { b } else { a };
                        self.stats.note_accept(0);
                        partner = Some(other);
                        debug!(chain = me, partner = other, "exchange accepted");
                    }
                }
            }

            // Collective: every root contributes, whether or not it swaps.
            let models = gather_models(temp, state.pack_model())?;
            if let Some(p) = partner {
                adopt = Some(models[p].clone());
            }
        }

        sync_model_with_followers(state, adopt)
    }
}
