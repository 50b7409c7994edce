// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralEM — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Acceptance bookkeeping shared by all moves.

use std::fmt::Write as _;

use se_chain::DeltaKind;

/// Proposal/acceptance counters, optionally resolved per tree depth.
#[derive(Clone, Debug)]
pub struct MoveStats {
    pub name: &'static str,
    pub propose: u64,
    pub accept: u64,
    pub propose_depth: Vec<u64>,
    pub accept_depth: Vec<u64>,
}

impl MoveStats {
    pub fn new(name: &'static str, max_depth: u32) -> Self {
        let levels = max_depth as usize + 1;
        MoveStats {
            name,
            propose: 0,
            accept: 0,
            propose_depth: vec![0; levels],
            accept_depth: vec![0; levels],
        }
    }

    /// Counters without depth resolution (hierarchical moves).
    pub fn scalar(name: &'static str) -> Self {
        MoveStats::new(name, 0)
    }

    pub fn note_proposal(&mut self, depth: u32) {
        self.propose_depth[depth as usize] += 1;
    }

    pub fn note_accept(&mut self, depth: u32) {
        self.accept += 1;
        self.accept_depth[depth as usize] += 1;
    }

    pub fn ratio(&self) -> f64 {
        if self.propose == 0 {
            0.0
        } else {
            self.accept as f64 / self.propose as f64
        }
    }

    pub fn write_short_stats(&self) -> String {
        format!(
            "{:<18} {:6}/{:6} {:7.3}",
            self.name,
            self.accept,
            self.propose,
            100.0 * self.ratio()
        )
    }

    pub fn write_long_stats(&self) -> String {
        let mut s = self.write_short_stats();
        if self.propose_depth.len() > 1 {
            s.push_str(" :");
            for (d, (&a, &p)) in self
                .accept_depth
                .iter()
                .zip(&self.propose_depth)
                .enumerate()
            {
                let pct = if p == 0 { 0.0 } else { 100.0 * a as f64 / p as f64 };
                let _ = write!(s, " {d}:{a}/{p}({pct:.1})");
            }
        }
        s
    }
}

/// What a move did this step, ready for the chain history.
#[derive(Clone, Copy, Debug)]
pub struct StepRecord {
    pub kind: DeltaKind,
    pub accepted: bool,
    pub idx: u32,
    pub depth: u32,
    pub new_value: f64,
    pub old_value: Option<f64>,
}

impl StepRecord {
    pub fn invalid(kind: DeltaKind) -> Self {
        StepRecord {
            kind,
            accepted: false,
            idx: 0,
            depth: 0,
            new_value: 0.0,
            old_value: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ratio_handles_zero_proposals() {
        let stats = MoveStats::new("Birth", 3);
        assert_eq!(stats.ratio(), 0.0);
    }

    #[test]
    fn long_stats_resolve_depths() {
        let mut stats = MoveStats::new("Birth", 2);
        stats.propose = 4;
        stats.note_proposal(1);
        stats.note_accept(1);
        let line = stats.write_long_stats();
        assert!(line.contains("Birth"));
        assert!(line.contains("1:1/1"));
    }
}
