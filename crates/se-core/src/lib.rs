// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralEM — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Core building blocks shared by every SpiralEM crate.
//!
//! This crate holds the pieces that do not know anything about sampling:
//! the flight-path observation format, the conductivity section and its
//! log-spaced layering, the forward-model descriptor and contract, the
//! hierarchical noise models, the prior/proposal distributions, and the
//! in-process SPMD collective fabric that the sampler runs on.

pub mod comms;
pub mod constants;
pub mod error;
pub mod forward;
pub mod image;
pub mod noise;
pub mod observations;
pub mod prior;
pub mod stm;
pub mod tokens;

pub use comms::{Comm, Fabric, RankLayout};
pub use error::{CoreError, CoreResult};
pub use forward::{ForwardModel, Geometry, HalfspaceConvolution};
pub use image::ConductivitySection;
pub use noise::NoiseModel;
pub use observations::{Direction, Observations, Point, Response};
pub use prior::PriorProposal;
pub use stm::{StmDescriptor, Window};
