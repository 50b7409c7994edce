// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralEM — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! The forward-model contract and a reference implementation.
//!
//! The sampler treats the forward solver as an opaque deterministic map
//! from (acquisition geometry, layered 1-D conductivity) to one response
//! value per receiver window. Production solvers plug in behind the
//! [`ForwardModel`] trait; [`HalfspaceConvolution`] is a smooth analytic
//! stand-in built from the STM window list, adequate for synthetic studies
//! and for exercising the inversion machinery end to end.

use crate::constants::MU0;
use crate::error::CoreResult;
use crate::observations::Point;
use crate::stm::StmDescriptor;

/// Acquisition geometry of one sounding.
#[derive(Clone, Copy, Debug, Default)]
pub struct Geometry {
    pub tx_height: f64,
    pub tx_roll: f64,
    pub tx_pitch: f64,
    pub tx_yaw: f64,
    pub txrx_dx: f64,
    pub txrx_dy: f64,
    pub txrx_dz: f64,
    pub rx_roll: f64,
    pub rx_pitch: f64,
    pub rx_yaw: f64,
}

impl From<&Point> for Geometry {
    fn from(p: &Point) -> Self {
        Geometry {
            tx_height: p.tx_height,
            tx_roll: p.tx_roll,
            tx_pitch: p.tx_pitch,
            tx_yaw: p.tx_yaw,
            txrx_dx: p.txrx_dx,
            txrx_dy: p.txrx_dy,
            txrx_dz: p.txrx_dz,
            rx_roll: p.rx_roll,
            rx_pitch: p.rx_pitch,
            rx_yaw: p.rx_yaw,
        }
    }
}

/// Deterministic map from a layered conductivity column to a windowed
/// time-domain response.
pub trait ForwardModel: Send + Sync {
    /// Evaluates the response. `conductivity` has one entry per layer
    /// (linear S/m), `thickness` one entry per layer boundary
    /// (`conductivity.len() - 1` entries, the last layer being a half-space).
    /// `out` receives one value per window.
    fn eval(&self, geometry: &Geometry, conductivity: &[f64], thickness: &[f64], out: &mut [f64]);

    /// Number of receiver windows (the length `eval` writes).
    fn window_count(&self) -> usize;

    /// Window centre times in seconds, one per window.
    fn centre_times(&self) -> &[f64];
}

/// Analytic half-space diffusion approximation.
///
/// For each window the transient response is modelled as the classic
/// `t^{-5/2}` late-time half-space decay weighted by a conductivity average
/// over the diffusion depth reached at the window's centre time. Smooth in
/// every layer conductivity, monotone in the bulk conductivity, and cheap.
#[derive(Clone, Debug)]
pub struct HalfspaceConvolution {
    centre_times: Vec<f64>,
    moment: f64,
}

impl HalfspaceConvolution {
    pub fn from_descriptor(stm: &StmDescriptor) -> CoreResult<Self> {
        let area = stm.transmitter.f64_or("LoopArea", 400.0);
        let current = stm.transmitter.f64_or("PeakCurrent", 1.0);
        let turns = stm.transmitter.f64_or("NumberOfTurns", 1.0);
        Ok(HalfspaceConvolution {
            centre_times: stm.centre_times(),
            moment: area * current * turns,
        })
    }

    /// Depth-weighted mean conductivity seen at diffusion scale `delta`.
    fn effective_conductivity(delta: f64, conductivity: &[f64], thickness: &[f64]) -> f64 {
        let mut weight_sum = 0.0;
        let mut weighted = 0.0;
        let mut top = 0.0;
        for (layer, &sigma) in conductivity.iter().enumerate() {
            let thick = thickness.get(layer).copied().unwrap_or(delta * 4.0);
            let centre = top + 0.5 * thick;
            let w = (-2.0 * centre / delta).exp() * thick;
            weighted += w * sigma;
            weight_sum += w;
            top += thick;
        }
        if weight_sum > 0.0 {
            weighted / weight_sum
        } else {
            conductivity[0]
        }
    }
}

impl ForwardModel for HalfspaceConvolution {
    fn eval(&self, geometry: &Geometry, conductivity: &[f64], thickness: &[f64], out: &mut [f64]) {
        debug_assert_eq!(out.len(), self.centre_times.len());
        // Geometric attenuation from the elevated transmitter/receiver pair.
        let separation = (geometry.txrx_dx.powi(2)
            + geometry.txrx_dy.powi(2)
            + geometry.txrx_dz.powi(2))
        .sqrt();
        let altitude = geometry.tx_height.max(1.0) + 0.5 * geometry.txrx_dz;
        let geom = 1.0 / (1.0 + (altitude + 0.5 * separation) / 100.0).powi(3);

        for (k, &t) in self.centre_times.iter().enumerate() {
            // Two-pass diffusion depth: seed with the shallow conductivity,
            // refine with the average over the first estimate.
            let sigma0 = conductivity[0].max(1.0e-6);
            let delta0 = (2.0 * t / (MU0 * sigma0)).sqrt();
            let sigma_eff =
                Self::effective_conductivity(delta0, conductivity, thickness).max(1.0e-6);
            let delta = (2.0 * t / (MU0 * sigma_eff)).sqrt();
            let sigma = Self::effective_conductivity(delta, conductivity, thickness).max(1.0e-6);

            // Late-time central-loop dB/dt amplitude for a uniform half-space.
            let amplitude =
                self.moment * (MU0 * sigma).powf(1.5) / (20.0 * std::f64::consts::PI.sqrt());
            out[k] = geom * amplitude * t.powf(-2.5) * 1.0e-12;
        }
    }

    fn window_count(&self) -> usize {
        self.centre_times.len()
    }

    fn centre_times(&self) -> &[f64] {
        &self.centre_times
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::logspace_thicknesses;
    use crate::stm::StmDescriptor;

    const SAMPLE: &str = "\
Transmitter Begin
  LoopArea = 400.0
  PeakCurrent = 10.0
  NumberOfTurns = 1
Transmitter End
ForwardModelling Begin
  WindowTimes Begin
    1.0e-4 2.0e-4
    2.0e-4 4.0e-4
    4.0e-4 8.0e-4
    8.0e-4 1.6e-3
  WindowTimes End
ForwardModelling End
";

    fn model() -> HalfspaceConvolution {
        let stm = StmDescriptor::parse("mem.stm", SAMPLE).unwrap();
        HalfspaceConvolution::from_descriptor(&stm).unwrap()
    }

    #[test]
    fn response_is_deterministic() {
        let fm = model();
        let geometry = Geometry {
            tx_height: 100.0,
            txrx_dx: -12.5,
            txrx_dz: 2.0,
            ..Geometry::default()
        };
        let sigma = vec![0.25; 16];
        let thickness = logspace_thicknesses(16, 200.0);
        let mut a = vec![0.0; fm.window_count()];
        let mut b = vec![0.0; fm.window_count()];
        fm.eval(&geometry, &sigma, &thickness, &mut a);
        fm.eval(&geometry, &sigma, &thickness, &mut b);
        assert_eq!(a, b);
    }

    #[test]
    fn more_conductive_ground_rings_louder_late() {
        let fm = model();
        let geometry = Geometry {
            tx_height: 100.0,
            ..Geometry::default()
        };
        let thickness = logspace_thicknesses(16, 200.0);
        let mut weak = vec![0.0; fm.window_count()];
        let mut strong = vec![0.0; fm.window_count()];
        fm.eval(&geometry, &vec![0.05; 16], &thickness, &mut weak);
        fm.eval(&geometry, &vec![0.5; 16], &thickness, &mut strong);
        let last = fm.window_count() - 1;
        assert!(strong[last] > weak[last]);
    }

    #[test]
    fn response_decays_with_time() {
        let fm = model();
        let geometry = Geometry {
            tx_height: 100.0,
            ..Geometry::default()
        };
        let thickness = logspace_thicknesses(16, 200.0);
        let mut out = vec![0.0; fm.window_count()];
        fm.eval(&geometry, &vec![0.25; 16], &thickness, &mut out);
        for w in out.windows(2) {
            assert!(w[1] < w[0]);
        }
    }
}
