// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralEM — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Replica state and chain history.
//!
//! [`state::ChainState`] owns everything one replica mutates while
//! sampling; [`history::ChainHistory`] records every proposal into
//! replayable binary segments that the postprocessors consume.

pub mod history;
pub mod state;

pub use history::{
    read_record, replay, ChainHistory, DeltaKind, DeltaRecord, InitRecord, Record, ReplayStats,
};
pub use state::{ChainConfig, ChainState, System};
