// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralEM — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Parallel-tempering invariance on a synthetic Gaussian posterior.
//!
//! Two replicas at T = 1 and T = 2, each redrawn from its tempered
//! stationary law before every proposal (a perfectly mixed chain), are
//! driven through the real exchange operator. Over 1e5 proposed swaps the
//! observed acceptance frequency must match the closed quadrature of
//! `E[min(1, exp((E_a - E_b)(1/T_a - 1/T_b)))]` to within one percent.

use std::sync::Arc;

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal};

use se_chain::{ChainConfig, ChainState};
use se_core::comms::Fabric;
use se_core::observations::Observations;
use se_core::prior::PriorProposal;
use se_sampler::PtExchange;

const ROUNDS: usize = 100_000;

/// Swap acceptance for a unit Gaussian posterior: at temperature T the
/// stationary state is x ~ N(0, sqrt(T)) with energy x^2 / 2.
fn theoretical_swap_rate(t_cold: f64, t_hot: f64) -> f64 {
    let n = 1601usize;
    let dz = 16.0 / (n - 1) as f64;
    let z = |i: usize| -8.0 + i as f64 * dz;
    let phi: Vec<f64> = (0..n).map(|i| (-0.5 * z(i) * z(i)).exp()).collect();
    let norm: f64 = phi.iter().sum();
    let factor = 1.0 / t_cold - 1.0 / t_hot;

    let mut acc = 0.0;
    for i in 0..n {
        let e_cold = t_cold * z(i) * z(i) / 2.0;
        for j in 0..n {
            let e_hot = t_hot * z(j) * z(j) / 2.0;
            acc += phi[i] * phi[j] * ((e_cold - e_hot) * factor).exp().min(1.0);
        }
    }
    acc / (norm * norm)
}

#[test]
fn swap_frequency_matches_theory_on_a_gaussian_posterior() {
    // Two single-rank chains, ladder T = {1, 2}.
    let endpoints = Fabric::build(2, 2, 1).unwrap();
    let mut handles = Vec::new();
    for comms in endpoints {
        handles.push(std::thread::spawn(move || {
            let layout = comms.layout;
            let temperature = layout.temperature(2.0);
            let mut config = ChainConfig::new(1, 1, 100.0);
            config.posterior_k = true;
            config.seed = 7 + layout.rank as u64;
            let mut state = ChainState::new(
                &config,
                Arc::new(Observations::default()),
                Vec::new(),
                PriorProposal::default_for_depth(1),
                comms.chain.clone(),
                temperature,
            )
            .unwrap();
            state.current_log_normalization = 0.0;

            let mut exchange = PtExchange::new(0x9a11);
            let mut rng = ChaCha8Rng::seed_from_u64(1234 + layout.rank as u64);
            let stationary = Normal::new(0.0, temperature.sqrt()).unwrap();
            for _ in 0..ROUNDS {
                let x: f64 = stationary.sample(&mut rng);
                state.current_likelihood = 0.5 * x * x;
                exchange
                    .step(&mut state, comms.temperature.as_ref())
                    .unwrap();
            }
            (exchange.stats.propose, exchange.stats.accept)
        }));
    }
    let results: Vec<(u64, u64)> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    for &(propose, _) in &results {
        assert_eq!(propose as usize, ROUNDS);
    }
    // The single pair's decision stream is shared, so both ends agree.
    assert_eq!(results[0].1, results[1].1);

    let empirical = results[0].1 as f64 / results[0].0 as f64;
    let theory = theoretical_swap_rate(1.0, 2.0);
    assert!(
        theory > 0.05 && theory < 0.95,
        "degenerate ladder, acceptance {theory}"
    );
    assert!(
        (empirical - theory).abs() < 0.01,
        "swap frequency {empirical} vs theoretical {theory}"
    );
}
