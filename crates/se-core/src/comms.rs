// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralEM — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! In-process SPMD collective fabric.
//!
//! Ranks are OS threads sharing an arena per communicator. Every collective
//! follows the same discipline: publish a per-rank slot under the arena
//! lock, meet at a barrier, read the peers' slots, meet at a second barrier
//! so slots may be reused. All ranks must issue collectives in the same
//! order; the single driver loop guarantees that. A failing rank poisons
//! its arenas, so every peer observes the failure at its next collective.
//!
//! Reductions always combine contributions in rank order, keeping results
//! bit-identical across repeated runs.

use std::sync::{Arc, Condvar, Mutex};

use crate::error::{CoreError, CoreResult};

struct ArenaState {
    generation: u64,
    arrived: usize,
    slots: Vec<Vec<f64>>,
    poisoned: Option<String>,
}

struct Arena {
    size: usize,
    state: Mutex<ArenaState>,
    cv: Condvar,
}

impl Arena {
    fn new(size: usize) -> Arc<Self> {
        Arc::new(Arena {
            size,
            state: Mutex::new(ArenaState {
                generation: 0,
                arrived: 0,
                slots: vec![Vec::new(); size],
                poisoned: None,
            }),
            cv: Condvar::new(),
        })
    }
}

/// One rank's endpoint of a shared-arena communicator.
#[derive(Clone)]
pub struct ArenaComm {
    arena: Arc<Arena>,
    rank: usize,
}

impl ArenaComm {
    fn barrier(&self) -> CoreResult<()> {
        let mut st = self.arena.state.lock().expect("arena lock");
        if let Some(msg) = &st.poisoned {
            return Err(CoreError::Collective(msg.clone()));
        }
        let gen = st.generation;
        st.arrived += 1;
        if st.arrived == self.arena.size {
            st.arrived = 0;
            st.generation = st.generation.wrapping_add(1);
            self.arena.cv.notify_all();
            return Ok(());
        }
        while st.generation == gen && st.poisoned.is_none() {
            st = self.arena.cv.wait(st).expect("arena wait");
        }
        match &st.poisoned {
            Some(msg) => Err(CoreError::Collective(msg.clone())),
            None => Ok(()),
        }
    }

    fn publish(&self, data: &[f64]) -> CoreResult<()> {
        let mut st = self.arena.state.lock().expect("arena lock");
        if let Some(msg) = &st.poisoned {
            return Err(CoreError::Collective(msg.clone()));
        }
        let rank = self.rank;
        st.slots[rank].clear();
        st.slots[rank].extend_from_slice(data);
        Ok(())
    }

    fn poison(&self, msg: &str) {
        let mut st = self.arena.state.lock().expect("arena lock");
        if st.poisoned.is_none() {
            tracing::warn!(rank = self.rank, msg, "poisoning communicator");
            st.poisoned = Some(msg.to_string());
        }
        self.arena.cv.notify_all();
    }
}

/// Communicator handle used by the sampler. `Solo` is the degenerate
/// single-rank communicator on which every collective is a no-op.
#[derive(Clone)]
pub enum Comm {
    Solo,
    Arena(ArenaComm),
}

impl Comm {
    pub fn rank(&self) -> usize {
        match self {
            Comm::Solo => 0,
            Comm::Arena(a) => a.rank,
        }
    }

    pub fn size(&self) -> usize {
        match self {
            Comm::Solo => 1,
            Comm::Arena(a) => a.arena.size,
        }
    }

    pub fn is_root(&self) -> bool {
        self.rank() == 0
    }

    pub fn barrier(&self) -> CoreResult<()> {
        match self {
            Comm::Solo => Ok(()),
            Comm::Arena(a) => a.barrier(),
        }
    }

    /// Copies `buf` from `root` into every rank's `buf`.
    pub fn broadcast_f64s(&self, buf: &mut [f64], root: usize) -> CoreResult<()> {
        match self {
            Comm::Solo => Ok(()),
            Comm::Arena(a) => {
                if a.rank == root {
                    a.publish(buf)?;
                }
                a.barrier()?;
                if a.rank != root {
                    let st = a.arena.state.lock().expect("arena lock");
                    if let Some(msg) = &st.poisoned {
                        return Err(CoreError::Collective(msg.clone()));
                    }
                    if st.slots[root].len() != buf.len() {
                        return Err(CoreError::Invariant(format!(
                            "broadcast length mismatch: root published {}, rank {} expects {}",
                            st.slots[root].len(),
                            a.rank,
                            buf.len()
                        )));
                    }
                    buf.copy_from_slice(&st.slots[root]);
                }
                a.barrier()
            }
        }
    }

    /// Element-wise sum across ranks; every rank receives the total.
    /// Contributions are combined in rank order.
    pub fn all_reduce_sum(&self, buf: &mut [f64]) -> CoreResult<()> {
        match self {
            Comm::Solo => Ok(()),
            Comm::Arena(a) => {
                a.publish(buf)?;
                a.barrier()?;
                {
                    let st = a.arena.state.lock().expect("arena lock");
                    if let Some(msg) = &st.poisoned {
                        return Err(CoreError::Collective(msg.clone()));
                    }
                    buf.fill(0.0);
                    for slot in &st.slots {
                        if slot.len() != buf.len() {
                            return Err(CoreError::Invariant(format!(
                                "reduce length mismatch: {} vs {}",
                                slot.len(),
                                buf.len()
                            )));
                        }
                        for (acc, v) in buf.iter_mut().zip(slot) {
                            *acc += v;
                        }
                    }
                }
                a.barrier()
            }
        }
    }

    /// Gathers variable-size segments from every rank into `out`, in rank
    /// order. `counts[r]` is the segment length rank `r` contributes and
    /// must agree across ranks; `out.len()` must equal their sum.
    pub fn all_gather_var(
        &self,
        local: &[f64],
        counts: &[usize],
        out: &mut [f64],
    ) -> CoreResult<()> {
        match self {
            Comm::Solo => {
                out.copy_from_slice(local);
                Ok(())
            }
            Comm::Arena(a) => {
                if counts.len() != a.arena.size {
                    return Err(CoreError::Invariant(format!(
                        "gather counts cover {} ranks, communicator has {}",
                        counts.len(),
                        a.arena.size
                    )));
                }
                a.publish(local)?;
                a.barrier()?;
                {
                    let st = a.arena.state.lock().expect("arena lock");
                    if let Some(msg) = &st.poisoned {
                        return Err(CoreError::Collective(msg.clone()));
                    }
                    let mut offset = 0;
                    for (r, &count) in counts.iter().enumerate() {
                        if st.slots[r].len() != count {
                            return Err(CoreError::Invariant(format!(
                                "rank {r} gathered {} values, layout expects {count}",
                                st.slots[r].len()
                            )));
                        }
                        out[offset..offset + count].copy_from_slice(&st.slots[r]);
                        offset += count;
                    }
                }
                a.barrier()
            }
        }
    }

    /// Marks the communicator failed; peers observe `Collective` errors.
    pub fn poison(&self, msg: &str) {
        if let Comm::Arena(a) = self {
            a.poison(msg);
        }
    }
}

/// Where a rank sits in the temperature × chain × likelihood grid.
#[derive(Clone, Copy, Debug)]
pub struct RankLayout {
    pub world_size: usize,
    pub rank: usize,
    pub temperatures: usize,
    pub chains_per_temperature: usize,
    pub ranks_per_chain: usize,
    pub chain_id: usize,
    pub chain_rank: usize,
    pub temperature_id: usize,
}

impl RankLayout {
    /// Validates the factorisation `world = temperatures × chains × P` and
    /// places `rank` in it. The total chain count must be even so PT swap
    /// pairing never strands a chain.
    pub fn build(
        world_size: usize,
        rank: usize,
        temperatures: usize,
        chains_per_temperature: usize,
    ) -> CoreResult<Self> {
        let total_chains = temperatures * chains_per_temperature;
        if total_chains == 0 || world_size % total_chains != 0 {
            return Err(CoreError::Validation(format!(
                "temperatures ({temperatures}) x chains ({chains_per_temperature}) \
                 incompatible with world size {world_size}"
            )));
        }
        if total_chains > 1 && total_chains % 2 != 0 {
            return Err(CoreError::Validation(format!(
                "total chain count {total_chains} must be even"
            )));
        }
        let ranks_per_chain = world_size / total_chains;
        let chain_id = rank / ranks_per_chain;
        Ok(RankLayout {
            world_size,
            rank,
            temperatures,
            chains_per_temperature,
            ranks_per_chain,
            chain_id,
            chain_rank: rank % ranks_per_chain,
            temperature_id: chain_id / chains_per_temperature,
        })
    }

    /// Log-spaced temperature ladder; the lowest level is the posterior.
    pub fn temperature(&self, max_temperature: f64) -> f64 {
        if self.temperatures == 1 {
            1.0
        } else {
            10f64.powf(
                max_temperature.log10() * self.temperature_id as f64
                    / (self.temperatures - 1) as f64,
            )
        }
    }
}

/// Pre-built communicator endpoints for one rank.
pub struct RankComms {
    pub layout: RankLayout,
    pub global: Comm,
    pub chain: Comm,
    /// Present on chain roots only: the communicator of all chain roots,
    /// ordered by chain id.
    pub temperature: Option<Comm>,
}

/// Builds the full topology for an in-process world: one endpoint bundle
/// per rank, to be moved into that rank's thread.
pub struct Fabric;

impl Fabric {
    pub fn build(
        world_size: usize,
        temperatures: usize,
        chains_per_temperature: usize,
    ) -> CoreResult<Vec<RankComms>> {
        let probe = RankLayout::build(world_size, 0, temperatures, chains_per_temperature)?;
        let total_chains = temperatures * chains_per_temperature;
        let ranks_per_chain = probe.ranks_per_chain;

        let global = Arena::new(world_size);
        let chain_arenas: Vec<_> = (0..total_chains)
            .map(|_| Arena::new(ranks_per_chain))
            .collect();
        let temperature_arena = Arena::new(total_chains);

        let mut out = Vec::with_capacity(world_size);
        for rank in 0..world_size {
            let layout = RankLayout::build(world_size, rank, temperatures, chains_per_temperature)?;
            let temperature = (layout.chain_rank == 0).then(|| {
                Comm::Arena(ArenaComm {
                    arena: Arc::clone(&temperature_arena),
                    rank: layout.chain_id,
                })
            });
            out.push(RankComms {
                layout,
                global: Comm::Arena(ArenaComm {
                    arena: Arc::clone(&global),
                    rank,
                }),
                chain: Comm::Arena(ArenaComm {
                    arena: Arc::clone(&chain_arenas[layout.chain_id]),
                    rank: layout.chain_rank,
                }),
                temperature,
            });
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_world<F>(world: usize, temperatures: usize, chains: usize, body: F)
    where
        F: Fn(RankComms) + Send + Sync + Clone + 'static,
    {
        let comms = Fabric::build(world, temperatures, chains).unwrap();
        let handles: Vec<_> = comms
            .into_iter()
            .map(|rc| {
                let body = body.clone();
                std::thread::spawn(move || body(rc))
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
    }

    #[test]
    fn layout_places_ranks_like_the_worked_example() {
        // 16 ranks, 4 chains per temperature, 2 temperatures -> P = 2.
        let l = RankLayout::build(16, 9, 2, 4).unwrap();
        assert_eq!(l.ranks_per_chain, 2);
        assert_eq!(l.chain_id, 4);
        assert_eq!(l.chain_rank, 1);
        assert_eq!(l.temperature_id, 1);
    }

    #[test]
    fn layout_rejects_bad_factorisations() {
        assert!(RankLayout::build(10, 0, 3, 1).is_err());
        assert!(RankLayout::build(6, 0, 3, 1).is_err());
    }

    #[test]
    fn temperature_ladder_is_log_spaced() {
        let lo = RankLayout::build(4, 0, 2, 1).unwrap();
        let hi = RankLayout::build(4, 2, 2, 1).unwrap();
        assert_eq!(lo.temperature(100.0), 1.0);
        assert!((hi.temperature(100.0) - 100.0).abs() < 1e-9);
    }

    #[test]
    fn broadcast_reaches_every_rank() {
        run_world(4, 1, 2, |rc| {
            let mut v = if rc.global.rank() == 0 {
                vec![3.5, -1.25]
            } else {
                vec![0.0, 0.0]
            };
            rc.global.broadcast_f64s(&mut v, 0).unwrap();
            assert_eq!(v, vec![3.5, -1.25]);
        });
    }

    #[test]
    fn all_reduce_sums_in_rank_order() {
        run_world(4, 1, 2, |rc| {
            let mut v = vec![rc.global.rank() as f64 + 1.0];
            rc.global.all_reduce_sum(&mut v).unwrap();
            assert_eq!(v, vec![10.0]);
        });
    }

    #[test]
    fn gather_concatenates_partitions() {
        run_world(2, 1, 1, |rc| {
            // One chain of two ranks: uneven split 3 + 2.
            let counts = [3usize, 2];
            let local: Vec<f64> = if rc.chain.rank() == 0 {
                vec![1.0, 2.0, 3.0]
            } else {
                vec![4.0, 5.0]
            };
            let mut out = vec![0.0; 5];
            rc.chain.all_gather_var(&local, &counts, &mut out).unwrap();
            assert_eq!(out, vec![1.0, 2.0, 3.0, 4.0, 5.0]);
        });
    }

    #[test]
    fn poison_propagates_to_peers() {
        run_world(2, 1, 1, |rc| {
            if rc.chain.rank() == 0 {
                rc.chain.poison("forward model exploded");
                assert!(rc.chain.barrier().is_err());
            } else {
                // Either blocked-then-woken or observed at entry.
                assert!(rc.chain.barrier().is_err());
            }
        });
    }

    #[test]
    fn solo_collectives_are_identity() {
        let c = Comm::Solo;
        let mut v = vec![1.0, 2.0];
        c.broadcast_f64s(&mut v, 0).unwrap();
        c.all_reduce_sum(&mut v).unwrap();
        assert_eq!(v, vec![1.0, 2.0]);
        let mut out = vec![0.0; 2];
        c.all_gather_var(&v, &[2], &mut out).unwrap();
        assert_eq!(out, vec![1.0, 2.0]);
    }
}
