// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralEM — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Detailed balance of the fixed-dimension value move.
//!
//! On a toy posterior with a single live coefficient, the empirical
//! acceptance rate of a long stationary run must converge to the expected
//! Metropolis acceptance `E[min(1, exp(-ΔU))]` under the true target,
//! which is computed here by direct quadrature over the tabulated energy.

use std::f64::consts::PI;
use std::sync::Arc;

use se_chain::{ChainConfig, ChainState, System};
use se_core::comms::Comm;
use se_core::forward::{ForwardModel, Geometry, HalfspaceConvolution};
use se_core::noise::NoiseModel;
use se_core::observations::{Direction, Observations, Point, Response};
use se_core::prior::PriorProposal;
use se_core::stm::StmDescriptor;
use se_sampler::Value;

const STM: &str = "\
Transmitter Begin
  LoopArea = 400.0
  PeakCurrent = 10.0
Transmitter End
ForwardModelling Begin
  WindowTimes Begin
    1.0e-4 2.0e-4
    2.0e-4 4.0e-4
  WindowTimes End
ForwardModelling End
";

/// A 2 x 2 grid whose sampler, fed nothing but value moves, keeps the
/// tree at the root coefficient: a one-dimensional posterior.
fn toy_state(seed: u64) -> ChainState {
    let stm = StmDescriptor::parse("mem.stm", STM).unwrap();
    let forward = Arc::new(HalfspaceConvolution::from_descriptor(&stm).unwrap());
    let thickness = se_core::image::logspace_thicknesses(2, 100.0);
    let mut points = Vec::new();
    for _ in 0..2 {
        let geometry = Geometry {
            tx_height: 100.0,
            txrx_dx: -12.5,
            txrx_dz: 2.0,
            ..Geometry::default()
        };
        let mut values = vec![0.0; forward.window_count()];
        forward.eval(&geometry, &[0.25, 0.25], &thickness, &mut values);
        points.push(Point {
            tx_height: 100.0,
            tx_roll: 0.0,
            tx_pitch: 0.0,
            tx_yaw: 0.0,
            txrx_dx: -12.5,
            txrx_dy: 0.0,
            txrx_dz: 2.0,
            rx_roll: 0.0,
            rx_pitch: 0.0,
            rx_yaw: 0.0,
            responses: vec![Response {
                direction: Direction::Z,
                values,
            }],
        });
    }

    let mut config = ChainConfig::new(1, 1, 100.0);
    config.seed = seed;
    let mut state = ChainState::new(
        &config,
        Arc::new(Observations { points }),
        vec![System::new(
            forward as Arc<dyn ForwardModel>,
            NoiseModel::Iid { sigma: 2.0e-12 },
        )],
        PriorProposal::default_for_depth(1),
        Comm::Solo,
        1.0,
    )
    .unwrap();
    state.refresh_residuals().unwrap();
    state
}

/// Tempered energy of the model with the root coefficient set to `v`.
fn energy_at(probe: &mut ChainState, v: f64) -> f64 {
    probe.tree.update(0, v).unwrap();
    let (like, norm) = probe.likelihood().unwrap();
    like + norm
}

#[test]
fn value_move_acceptance_converges_to_the_metropolis_rate() {
    let prior = PriorProposal::default_for_depth(1);
    let (lo, hi) = prior.prior_range(0, 0, 0);
    let sigma_prior = prior.prior_std(0);
    let sigma_prop = prior.value_step_std(0);

    // Negative log target U(v) = E(v) - ln prior(v), tabulated over the
    // hard range from the actual likelihood path.
    let mut probe = toy_state(1);
    let m = 4001usize;
    let dv = (hi - lo) / (m - 1) as f64;
    let mut u = Vec::with_capacity(m);
    for i in 0..m {
        let v = lo + i as f64 * dv;
        let z = v / sigma_prior;
        u.push(energy_at(&mut probe, v) + 0.5 * z * z + sigma_prior.ln());
    }
    let u_at = |x: f64| -> f64 {
        let t = ((x - lo) / dv).clamp(0.0, (m - 1) as f64);
        let i = (t as usize).min(m - 2);
        let f = t - i as f64;
        u[i] * (1.0 - f) + u[i + 1] * f
    };

    // Expected acceptance in stationarity: outer integral over the target,
    // inner over the Gaussian proposal. Draws leaving the hard range are
    // invalid proposals and never accepted.
    let u_min = u.iter().cloned().fold(f64::INFINITY, f64::min);
    let nz = 241usize;
    let dz = 12.0 * sigma_prop / (nz - 1) as f64;
    let mut weight_total = 0.0;
    let mut accept_total = 0.0;
    for i in 0..m {
        let v = lo + i as f64 * dv;
        let weight = (-(u[i] - u_min)).exp();
        weight_total += weight;
        let mut accept = 0.0;
        for j in 0..nz {
            let z = -6.0 * sigma_prop + j as f64 * dz;
            let proposed = v + z;
            if proposed < lo || proposed > hi {
                continue;
            }
            let q = (-0.5 * (z / sigma_prop).powi(2)).exp()
                / (sigma_prop * (2.0 * PI).sqrt())
                * dz;
            accept += q * (u[i] - u_at(proposed)).exp().min(1.0);
        }
        accept_total += weight * accept;
    }
    let theory = accept_total / weight_total;
    assert!(
        theory > 0.05 && theory < 0.95,
        "degenerate toy posterior, acceptance {theory}"
    );

    // Empirical acceptance over one million stationary proposals.
    let mut state = toy_state(983);
    let mut mover = Value::new(state.tree.max_depth());
    for _ in 0..10_000 {
        mover.step(&mut state).unwrap();
    }
    assert_eq!(state.tree.coefficient_count(), 1);

    let mut mover = Value::new(state.tree.max_depth());
    for _ in 0..1_000_000 {
        mover.step(&mut state).unwrap();
    }
    let empirical = mover.stats.ratio();

    assert!(
        (empirical - theory).abs() < 0.01,
        "empirical acceptance {empirical} vs theoretical {theory}"
    );
}
