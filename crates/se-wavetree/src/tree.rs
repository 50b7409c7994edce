// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralEM — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Sparse rooted quadtree over 2-D wavelet coefficients.
//!
//! A model is a set of live coefficient indices with values. Structure is
//! derived arithmetically from indices — no node objects, no pointers. The
//! tree property (every live non-root index has a live parent) is enforced
//! on every mutation, and the birth-eligible / death-eligible sets the
//! proposal engine needs are maintained incrementally.
//!
//! Linear index of grid position `(i, j)` is `j * width + i`; index 0 is
//! the root scale coefficient. The depth of an index is its wavelet scale:
//! the number of per-axis halvings separating it from the root.

use std::collections::{BTreeMap, BTreeSet};
use std::io::Write as _;
use std::path::Path;

use se_core::error::{CoreError, CoreResult};
use se_core::tokens::TokenReader;

/// What the most recent mutation did, for chain-history recording.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChangeKind {
    RootValue,
    Birth,
    Death,
    Value,
}

/// Delta of the last mutating call plus the live multiset after it.
#[derive(Clone, Debug)]
pub struct ChangeRecord {
    pub kind: ChangeKind,
    pub idx: u32,
    pub depth: u32,
    pub new_value: f64,
    pub old_value: Option<f64>,
    pub live_after: Vec<(u32, f64)>,
}

/// Sparse 2-D wavelet coefficient tree over a `2^degree_x` by `2^degree_y`
/// grid.
#[derive(Clone, Debug)]
pub struct WaveTree {
    degree_x: u32,
    degree_y: u32,
    width: u32,
    height: u32,
    max_depth: u32,
    values: BTreeMap<u32, f64>,
    live_children: BTreeMap<u32, u8>,
    birth_eligible: BTreeSet<u32>,
    death_eligible: BTreeSet<u32>,
    last_change: Option<ChangeRecord>,
}

impl WaveTree {
    pub fn new(degree_x: u32, degree_y: u32) -> CoreResult<Self> {
        if !(1..16).contains(&degree_x) || !(1..16).contains(&degree_y) {
            return Err(CoreError::Validation(format!(
                "tree degrees out of range: {degree_x} x {degree_y}"
            )));
        }
        Ok(WaveTree {
            degree_x,
            degree_y,
            width: 1 << degree_x,
            height: 1 << degree_y,
            max_depth: degree_x.max(degree_y),
            values: BTreeMap::new(),
            live_children: BTreeMap::new(),
            birth_eligible: BTreeSet::new(),
            death_eligible: BTreeSet::new(),
            last_change: None,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn degrees(&self) -> (u32, u32) {
        (self.degree_x, self.degree_y)
    }

    /// Total coefficient capacity of the grid.
    pub fn size(&self) -> usize {
        (self.width * self.height) as usize
    }

    pub fn max_depth(&self) -> u32 {
        self.max_depth
    }

    /// Number of live coefficients.
    pub fn coefficient_count(&self) -> usize {
        self.values.len()
    }

    pub fn root_value(&self) -> f64 {
        self.values.get(&0).copied().unwrap_or(0.0)
    }

    // -- index arithmetic ---------------------------------------------------

    pub fn from_2d(&self, i: u32, j: u32) -> u32 {
        j * self.width + i
    }

    pub fn to_2d(&self, idx: u32) -> (u32, u32) {
        (idx % self.width, idx / self.width)
    }

    fn axis_level(coord: u32) -> u32 {
        if coord == 0 {
            0
        } else {
            32 - coord.leading_zeros()
        }
    }

    /// Wavelet scale of an index: halvings to reach the root.
    pub fn depth_of(&self, idx: u32) -> u32 {
        let (i, j) = self.to_2d(idx);
        Self::axis_level(i).max(Self::axis_level(j))
    }

    /// Parent index; `None` for the root.
    pub fn parent_of(&self, idx: u32) -> Option<u32> {
        if idx == 0 {
            return None;
        }
        let (i, j) = self.to_2d(idx);
        Some(self.from_2d(i / 2, j / 2))
    }

    /// Child indices inside the grid, at most four (three for the root).
    pub fn children_of(&self, idx: u32) -> Vec<u32> {
        let (i, j) = self.to_2d(idx);
        let mut out = Vec::with_capacity(4);
        for cj in [2 * j, 2 * j + 1] {
            if cj >= self.height {
                continue;
            }
            for ci in [2 * i, 2 * i + 1] {
                if ci >= self.width {
                    continue;
                }
                let child = self.from_2d(ci, cj);
                if child != idx {
                    out.push(child);
                }
            }
        }
        out
    }

    fn in_grid(&self, idx: u32) -> bool {
        (idx as usize) < self.size()
    }

    // -- queries ------------------------------------------------------------

    pub fn contains(&self, idx: u32) -> bool {
        self.values.contains_key(&idx)
    }

    pub fn value(&self, idx: u32) -> Option<f64> {
        self.values.get(&idx).copied()
    }

    /// Sorted live (index, value) pairs — the S_v multiset.
    pub fn live_snapshot(&self) -> Vec<(u32, f64)> {
        self.values.iter().map(|(&k, &v)| (k, v)).collect()
    }

    pub fn birth_eligible_len(&self) -> usize {
        self.birth_eligible.len()
    }

    pub fn death_eligible_len(&self) -> usize {
        self.death_eligible.len()
    }

    /// `n`-th birth-eligible index in ascending order.
    pub fn birth_eligible_nth(&self, n: usize) -> Option<u32> {
        self.birth_eligible.iter().nth(n).copied()
    }

    /// `n`-th live coefficient in ascending index order.
    pub fn live_nth(&self, n: usize) -> Option<(u32, f64)> {
        self.values.iter().nth(n).map(|(&k, &v)| (k, v))
    }

    /// `n`-th death-eligible index in ascending order.
    pub fn death_eligible_nth(&self, n: usize) -> Option<u32> {
        self.death_eligible.iter().nth(n).copied()
    }

    // -- mutations ----------------------------------------------------------

    /// Resets to a single root coefficient.
    pub fn initialise(&mut self, root_value: f64) {
        self.values.clear();
        self.live_children.clear();
        self.birth_eligible.clear();
        self.death_eligible.clear();
        self.values.insert(0, root_value);
        self.live_children.insert(0, 0);
        for child in self.children_of(0) {
            self.birth_eligible.insert(child);
        }
        self.record(ChangeKind::RootValue, 0, root_value, None);
    }

    fn record(&mut self, kind: ChangeKind, idx: u32, new_value: f64, old_value: Option<f64>) {
        self.last_change = Some(ChangeRecord {
            kind,
            idx,
            depth: self.depth_of(idx),
            new_value,
            old_value,
            live_after: self.live_snapshot(),
        });
    }

    /// Adds a coefficient. Fails unless the index is vacant, inside the
    /// grid, and its parent is live.
    pub fn insert(&mut self, idx: u32, value: f64) -> CoreResult<()> {
        if !self.in_grid(idx) {
            return Err(CoreError::Invariant(format!("index {idx} outside grid")));
        }
        if self.values.contains_key(&idx) {
            return Err(CoreError::Invariant(format!("index {idx} already live")));
        }
        let parent = self
            .parent_of(idx)
            .ok_or_else(|| CoreError::Invariant("cannot insert the root; initialise instead".into()))?;
        if !self.values.contains_key(&parent) {
            return Err(CoreError::Invariant(format!(
                "insert of {idx} with dead parent {parent}"
            )));
        }

        self.values.insert(idx, value);
        self.live_children.insert(idx, 0);
        self.birth_eligible.remove(&idx);

        let siblings = *self.live_children.entry(parent).or_insert(0);
        self.live_children.insert(parent, siblings + 1);
        // Parent just lost its leaf status (root is never death-eligible).
        self.death_eligible.remove(&parent);
        self.death_eligible.insert(idx);

        for child in self.children_of(idx) {
            if !self.values.contains_key(&child) {
                self.birth_eligible.insert(child);
            }
        }

        self.record(ChangeKind::Birth, idx, value, None);
        Ok(())
    }

    /// Removes a leaf coefficient. Fails on the root, a vacant index, or an
    /// index with live children.
    pub fn remove(&mut self, idx: u32) -> CoreResult<f64> {
        if idx == 0 {
            return Err(CoreError::Invariant("the root is never removed".into()));
        }
        let value = *self
            .values
            .get(&idx)
            .ok_or_else(|| CoreError::Invariant(format!("remove of dead index {idx}")))?;
        if self.live_children.get(&idx).copied().unwrap_or(0) > 0 {
            return Err(CoreError::Invariant(format!(
                "remove of {idx} which still has live children"
            )));
        }

        self.values.remove(&idx);
        self.live_children.remove(&idx);
        self.death_eligible.remove(&idx);
        self.birth_eligible.insert(idx);
        for child in self.children_of(idx) {
            self.birth_eligible.remove(&child);
        }

        let parent = self.parent_of(idx).expect("non-root index has a parent");
        let siblings = self.live_children.get(&parent).copied().unwrap_or(1) - 1;
        self.live_children.insert(parent, siblings);
        if siblings == 0 && parent != 0 {
            self.death_eligible.insert(parent);
        }

        self.record(ChangeKind::Death, idx, 0.0, Some(value));
        Ok(value)
    }

    /// Changes the value of a live coefficient, returning the old value.
    pub fn update(&mut self, idx: u32, value: f64) -> CoreResult<f64> {
        let slot = self
            .values
            .get_mut(&idx)
            .ok_or_else(|| CoreError::Invariant(format!("update of dead index {idx}")))?;
        let old = *slot;
        *slot = value;
        let kind = if idx == 0 {
            ChangeKind::RootValue
        } else {
            ChangeKind::Value
        };
        self.record(kind, idx, value, Some(old));
        Ok(old)
    }

    pub fn last_perturbation(&self) -> Option<&ChangeRecord> {
        self.last_change.as_ref()
    }

    /// Rebuilds the tree from a sorted live multiset (ascending index order
    /// implies parents precede children). The tree property is re-verified.
    pub fn set_from_live(&mut self, live: &[(u32, f64)]) -> CoreResult<()> {
        self.values.clear();
        self.live_children.clear();
        self.birth_eligible.clear();
        self.death_eligible.clear();
        for (n, &(idx, value)) in live.iter().enumerate() {
            if n == 0 {
                if idx != 0 {
                    return Err(CoreError::Invariant(
                        "live multiset does not start at the root".into(),
                    ));
                }
                self.initialise(value);
            } else {
                self.insert(idx, value)?;
            }
        }
        self.last_change = None;
        Ok(())
    }

    /// Scatters live values into a dense row-major array, zeroing the rest.
    pub fn map_to_array(&self, out: &mut [f64]) -> CoreResult<()> {
        if out.len() != self.size() {
            return Err(CoreError::Invariant(format!(
                "dense buffer of {} for a grid of {}",
                out.len(),
                self.size()
            )));
        }
        out.fill(0.0);
        for (&idx, &v) in &self.values {
            out[idx as usize] = v;
        }
        Ok(())
    }

    // -- persistence --------------------------------------------------------

    /// Text format: `degree_x degree_y`, coefficient count, then sorted
    /// `i j value` lines.
    pub fn save(&self, path: impl AsRef<Path>) -> CoreResult<()> {
        let path = path.as_ref();
        let mut out =
            std::io::BufWriter::new(std::fs::File::create(path).map_err(|e| CoreError::io(path, e))?);
        let write = |out: &mut dyn std::io::Write| -> std::io::Result<()> {
            writeln!(out, "{} {}", self.degree_x, self.degree_y)?;
            writeln!(out, "{}", self.values.len())?;
            for (&idx, &v) in &self.values {
                let (i, j) = self.to_2d(idx);
                writeln!(out, "{i} {j} {v:.17e}")?;
            }
            Ok(())
        };
        write(&mut out).map_err(|e| CoreError::io(path, e))?;
        out.flush().map_err(|e| CoreError::io(path, e))
    }

    /// Loads a tree saved with [`save`](Self::save); degrees must match.
    pub fn load(&mut self, path: impl AsRef<Path>) -> CoreResult<()> {
        self.load_impl(path, false)
    }

    /// Loads a model saved on a grid no finer than this one, re-homing its
    /// coefficients here. Coefficients deeper than this tree's maximum
    /// depth are rejected.
    pub fn load_promote(&mut self, path: impl AsRef<Path>) -> CoreResult<()> {
        self.load_impl(path, true)
    }

    fn load_impl(&mut self, path: impl AsRef<Path>, promote: bool) -> CoreResult<()> {
        let mut tr = TokenReader::open(&path)?;
        let fdx = tr.next_u32()?;
        let fdy = tr.next_u32()?;
        if promote {
            if fdx > self.degree_x || fdy > self.degree_y {
                return Err(CoreError::parse(
                    tr.path(),
                    format!(
                        "model degrees {fdx} x {fdy} exceed tree degrees {} x {}",
                        self.degree_x, self.degree_y
                    ),
                ));
            }
        } else if fdx != self.degree_x || fdy != self.degree_y {
            return Err(CoreError::parse(
                tr.path(),
                format!(
                    "model degrees {fdx} x {fdy} do not match tree degrees {} x {}",
                    self.degree_x, self.degree_y
                ),
            ));
        }
        let n = tr.next_usize()?;
        let mut live = Vec::with_capacity(n);
        for _ in 0..n {
            let i = tr.next_u32()?;
            let j = tr.next_u32()?;
            let v = tr.next_f64()?;
            if i >= self.width || j >= self.height {
                return Err(CoreError::parse(
                    tr.path(),
                    format!("coefficient ({i}, {j}) outside the grid"),
                ));
            }
            let idx = self.from_2d(i, j);
            if self.depth_of(idx) > self.max_depth {
                return Err(CoreError::parse(
                    tr.path(),
                    format!("coefficient ({i}, {j}) deeper than {}", self.max_depth),
                ));
            }
            live.push((idx, v));
        }
        live.sort_by_key(|&(idx, _)| idx);
        self.set_from_live(&live)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tree() -> WaveTree {
        let mut t = WaveTree::new(3, 2).unwrap(); // 8 x 4 grid
        t.initialise(1.0);
        t
    }

    #[test]
    fn degrees_are_validated() {
        assert!(WaveTree::new(0, 3).is_err());
        assert!(WaveTree::new(3, 16).is_err());
        assert!(WaveTree::new(1, 15).is_ok());
    }

    #[test]
    fn index_arithmetic_matches_the_grid() {
        let t = tree();
        assert_eq!(t.from_2d(3, 1), 11);
        assert_eq!(t.to_2d(11), (3, 1));
        assert_eq!(t.depth_of(0), 0);
        assert_eq!(t.depth_of(t.from_2d(1, 1)), 1);
        assert_eq!(t.depth_of(t.from_2d(5, 0)), 3);
        assert_eq!(t.max_depth(), 3);
    }

    #[test]
    fn parent_chains_reach_the_root_with_descending_depth() {
        let t = tree();
        for idx in 1..t.size() as u32 {
            let mut hops = 0;
            let mut at = idx;
            while let Some(p) = t.parent_of(at) {
                assert_eq!(t.depth_of(at), t.depth_of(p) + 1);
                at = p;
                hops += 1;
            }
            assert_eq!(at, 0);
            assert_eq!(hops, t.depth_of(idx));
        }
    }

    #[test]
    fn children_and_parents_agree() {
        let t = tree();
        for idx in 0..t.size() as u32 {
            for child in t.children_of(idx) {
                assert_eq!(t.parent_of(child), Some(idx));
            }
        }
        assert_eq!(t.children_of(0).len(), 3);
    }

    #[test]
    fn insert_requires_a_live_parent() {
        let mut t = tree();
        let deep = t.from_2d(4, 0);
        assert!(t.insert(deep, 0.5).is_err());
        t.insert(t.from_2d(1, 0), 0.3).unwrap();
        t.insert(t.from_2d(2, 0), 0.2).unwrap();
        assert!(t.insert(t.from_2d(4, 0), 0.1).is_ok());
    }

    #[test]
    fn remove_requires_a_leaf() {
        let mut t = tree();
        let a = t.from_2d(1, 0);
        let b = t.from_2d(2, 0);
        t.insert(a, 0.3).unwrap();
        t.insert(b, 0.2).unwrap();
        assert!(t.remove(a).is_err()); // b is a's live child
        assert_eq!(t.remove(b).unwrap(), 0.2);
        assert_eq!(t.remove(a).unwrap(), 0.3);
        assert!(t.remove(0).is_err());
    }

    #[test]
    fn eligibility_sets_track_mutations() {
        let mut t = tree();
        assert_eq!(t.birth_eligible_len(), 3); // root's children
        assert_eq!(t.death_eligible_len(), 0); // root excluded

        let a = t.from_2d(1, 0);
        t.insert(a, 0.3).unwrap();
        // a's children join the frontier, a leaves it.
        assert_eq!(t.birth_eligible_len(), 2 + t.children_of(a).len());
        assert_eq!(t.death_eligible_len(), 1);

        t.remove(a).unwrap();
        assert_eq!(t.birth_eligible_len(), 3);
        assert_eq!(t.death_eligible_len(), 0);
    }

    #[test]
    fn last_perturbation_reports_the_delta() {
        let mut t = tree();
        let a = t.from_2d(0, 1);
        t.insert(a, -0.7).unwrap();
        let rec = t.last_perturbation().unwrap();
        assert_eq!(rec.kind, ChangeKind::Birth);
        assert_eq!(rec.idx, a);
        assert_eq!(rec.depth, 1);
        assert_eq!(rec.new_value, -0.7);
        assert_eq!(rec.live_after.len(), 2);

        t.update(a, 0.4).unwrap();
        let rec = t.last_perturbation().unwrap();
        assert_eq!(rec.kind, ChangeKind::Value);
        assert_eq!(rec.old_value, Some(-0.7));

        t.remove(a).unwrap();
        let rec = t.last_perturbation().unwrap();
        assert_eq!(rec.kind, ChangeKind::Death);
        assert_eq!(rec.old_value, Some(-0.7));
    }

    #[test]
    fn dense_mapping_scatters_live_values() {
        let mut t = tree();
        t.insert(t.from_2d(1, 1), 2.5).unwrap();
        let mut dense = vec![9.0; t.size()];
        t.map_to_array(&mut dense).unwrap();
        assert_eq!(dense[0], 1.0);
        assert_eq!(dense[t.from_2d(1, 1) as usize], 2.5);
        assert_eq!(dense.iter().filter(|&&v| v != 0.0).count(), 2);
    }

    #[test]
    fn save_load_round_trips_exactly() {
        let mut t = tree();
        t.insert(t.from_2d(1, 0), 0.125).unwrap();
        t.insert(t.from_2d(0, 1), -0.0625).unwrap();
        t.insert(t.from_2d(2, 0), 3.0e-17).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.txt");
        t.save(&path).unwrap();

        let mut again = WaveTree::new(3, 2).unwrap();
        again.load(&path).unwrap();
        assert_eq!(again.live_snapshot(), t.live_snapshot());
    }

    #[test]
    fn promote_accepts_coarser_and_rejects_finer_models() {
        let mut small = WaveTree::new(2, 2).unwrap();
        small.initialise(0.5);
        small.insert(small.from_2d(1, 0), 0.25).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("small.txt");
        small.save(&path).unwrap();

        let mut big = WaveTree::new(3, 3).unwrap();
        big.load_promote(&path).unwrap();
        assert_eq!(big.coefficient_count(), 2);
        assert_eq!(big.value(big.from_2d(1, 0)), Some(0.25));

        // The finer model must not demote.
        let mut tiny = WaveTree::new(1, 1).unwrap();
        assert!(tiny.load_promote(&path).is_err());
    }

    #[test]
    fn set_from_live_rejects_orphans() {
        let mut t = tree();
        let orphan = vec![(0u32, 1.0), (t.from_2d(4, 0), 0.5)];
        assert!(t.set_from_live(&orphan).is_err());
    }
}
