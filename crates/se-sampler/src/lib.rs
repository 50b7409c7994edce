// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralEM — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! The reversible-jump proposal engine and its coordinators.
//!
//! Five moves (birth, death, value, hierarchical noise scale, hierarchical
//! prior width), each following the same five-stage root-propose /
//! broadcast / evaluate / decide / commit protocol; the parallel-tempering
//! exchange and replica resampling operators; and the driver loop that
//! sequences one iteration across all ranks.

pub mod birth;
pub mod death;
pub mod driver;
pub mod hierarchical;
pub mod hierarchical_prior;
pub mod ptexchange;
pub mod resample;
pub mod stats;
pub mod value;

pub use birth::Birth;
pub use death::Death;
pub use driver::{chain_file, run_chain, run_world, RunConfig, RunSummary, WorldConfig};
pub use hierarchical::Hierarchical;
pub use hierarchical_prior::HierarchicalPrior;
pub use ptexchange::PtExchange;
pub use resample::Resample;
pub use stats::{MoveStats, StepRecord};
pub use value::Value;
