// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralEM — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Sampler → chain history → postprocessing, end to end.

use std::sync::Arc;

use se_chain::{ChainConfig, ChainState, System};
use se_core::comms::Comm;
use se_core::forward::{ForwardModel, Geometry, HalfspaceConvolution};
use se_core::noise::NoiseModel;
use se_core::observations::{Direction, Observations, Point, Response};
use se_core::prior::PriorProposal;
use se_core::stm::StmDescriptor;
use se_post::{
    validate_likelihood, write_khistory, PosteriorSummary, SummaryConfig, ValidateConfig,
};
use se_sampler::{chain_file, run_world, RunConfig, WorldConfig};
use se_wavetree::Basis;

const STM: &str = "\
Transmitter Begin
  LoopArea = 400.0
  PeakCurrent = 10.0
Transmitter End
ForwardModelling Begin
  WindowTimes Begin
    1.0e-4 2.0e-4
    2.0e-4 4.0e-4
    4.0e-4 8.0e-4
  WindowTimes End
ForwardModelling End
";

fn observations(forward: &HalfspaceConvolution, width: usize, height: usize) -> Observations {
    let thickness = se_core::image::logspace_thicknesses(height, 200.0);
    let mut points = Vec::new();
    for c in 0..width {
        let geometry = Geometry {
            tx_height: 100.0,
            txrx_dx: -12.5,
            txrx_dz: 2.0,
            ..Geometry::default()
        };
        let mut sigma = vec![0.2; height];
        if c >= width / 2 {
            for layer in sigma.iter_mut() {
                *layer = 0.4;
            }
        }
        let mut values = vec![0.0; forward.window_count()];
        forward.eval(&geometry, &sigma, &thickness, &mut values);
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
    Observations { points }
}

struct Pipeline {
    prefix: String,
    observations: Arc<Observations>,
    forward: Arc<HalfspaceConvolution>,
    total: usize,
}

fn run_pipeline(dir: &tempfile::TempDir) -> Pipeline {
    let stm = StmDescriptor::parse("mem.stm", STM).unwrap();
    let forward = Arc::new(HalfspaceConvolution::from_descriptor(&stm).unwrap());
    let observations = Arc::new(observations(&forward, 16, 8));
    let prefix = format!("{}/", dir.path().display());
    let total = 500usize;

    let mut template = ChainConfig::new(4, 3, 200.0);
    template.kmax = 64;
    run_world(
        &WorldConfig {
            world_size: 1,
            temperatures: 1,
            chains_per_temperature: 1,
            max_temperature: 1.0,
            seed_base: 983,
            seed_mult: 101,
        },
        &RunConfig {
            total,
            birth_probability: 0.2,
            exchange_rate: 0,
            lambda_std: 0.1,
            verbosity: 0,
            output_prefix: Some(prefix.clone()),
            ..RunConfig::default()
        },
        &template,
        Arc::clone(&observations),
        vec![Arc::clone(&forward) as Arc<dyn ForwardModel>],
        vec![NoiseModel::Iid { sigma: 1.0e-14 }],
        PriorProposal::default_for_depth(4),
        None,
    )
    .unwrap();

    Pipeline {
        prefix,
        observations,
        forward,
        total,
    }
}

#[test]
fn recorded_likelihoods_replay_within_tolerance() {
    let dir = tempfile::tempdir().unwrap();
    let p = run_pipeline(&dir);

    let config = ChainConfig::new(4, 3, 200.0);
    let mut replica = ChainState::new(
        &config,
        Arc::clone(&p.observations),
        vec![System::new(
            Arc::clone(&p.forward) as Arc<dyn ForwardModel>,
            NoiseModel::Iid { sigma: 1.0e-14 },
        )],
        PriorProposal::default_for_depth(4),
        Comm::Solo,
        1.0,
    )
    .unwrap();

    let report = validate_likelihood(
        &mut replica,
        chain_file(Some(&p.prefix), "ch.dat", 0),
        ValidateConfig::default(),
    )
    .unwrap();

    assert!(report.checked > 0);
    assert!(
        report.max_error < 1.0e-6,
        "max replay error {}",
        report.max_error
    );
}

#[test]
fn posterior_summary_has_consistent_accounting() {
    let dir = tempfile::tempdir().unwrap();
    let p = run_pipeline(&dir);

    let mut summary = PosteriorSummary::new(SummaryConfig {
        degree_x: 4,
        degree_y: 3,
        hbasis: Basis::Haar,
        vbasis: Basis::Haar,
        bins: 200,
        vmin: 0.001,
        vmax: 1.0,
        skip: 100,
        thin: 5,
        exponentiate: true,
    })
    .unwrap();
    let folded = summary
        .consume_file(chain_file(Some(&p.prefix), "ch.dat", 0))
        .unwrap();
    assert!(folded > 0);
    assert_eq!(summary.width(), 16);
    assert_eq!(summary.height(), 8);

    // Histogram accounting: every pixel saw every recorded sample.
    let bins = summary.bins();
    for pixel in 0..summary.width() * summary.height() {
        let total: u64 = summary.histogram()[pixel * bins..(pixel + 1) * bins]
            .iter()
            .map(|&c| u64::from(c))
            .sum();
        assert_eq!(total, summary.count() as u64, "pixel {pixel}");
    }

    // Credible bounds bracket pointwise, and enclose the posterior mean
    // when it sits inside the histogram range.
    let lo = summary.credible_min(0.95);
    let hi = summary.credible_max(0.95);
    for (l, h) in lo.iter().zip(&hi) {
        assert!(l <= h);
    }

    // Variance is finite and non-negative.
    for v in summary.variance() {
        assert!(v.is_finite() && v >= 0.0);
    }

    // HPD windows are inside the histogram range and at least as tight as
    // the full range.
    let (range, low, high) = summary.hpd(0.95);
    for ((r, l), h) in range.iter().zip(&low).zip(&high) {
        assert!(*l >= 0.001 - 1e-12 && *h <= 1.0 + 1e-12);
        assert!((h - l) - r < 1e-12);
    }

    // Grids write with the run's dimensions.
    let mean_path = dir.path().join("mean.txt");
    summary.write_grid(&mean_path, summary.mean()).unwrap();
    let text = std::fs::read_to_string(&mean_path).unwrap();
    assert_eq!(text.lines().count(), 8);
    assert_eq!(
        text.lines().next().unwrap().split_whitespace().count(),
        16
    );
}

#[test]
fn khistory_counts_every_step() {
    let dir = tempfile::tempdir().unwrap();
    let p = run_pipeline(&dir);
    let out = dir.path().join("khistory.txt");
    let written = write_khistory(chain_file(Some(&p.prefix), "ch.dat", 0), &out, 0).unwrap();
    // One tree move plus one hierarchical move per iteration.
    assert_eq!(written, 2 * p.total);
    let text = std::fs::read_to_string(&out).unwrap();
    assert_eq!(text.lines().count(), written);
    for line in text.lines() {
        let k: usize = line.parse().unwrap();
        assert!(k >= 1 && k <= 64);
    }
}
