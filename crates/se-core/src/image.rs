// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralEM — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! The 2-D conductivity section (depth × along-line) and its layering.

use std::io::Write as _;
use std::path::Path;

use crate::error::{CoreError, CoreResult};
use crate::tokens::TokenReader;

/// Log-spaced layer thicknesses whose cumulative depths reach
/// `halfspace_depth`. Returns `n - 1` thicknesses for `n` layers; the last
/// layer is the underlying half-space.
pub fn logspace_thicknesses(n: usize, halfspace_depth: f64) -> Vec<f64> {
    let mut thickness = Vec::with_capacity(n.saturating_sub(1));
    let mut last = 0.0;
    for i in 1..n {
        let depth = ((halfspace_depth + 1.0).ln() * i as f64 / (n - 1) as f64).exp() - 1.0;
        thickness.push(depth - last);
        last = depth;
    }
    thickness
}

/// Row-major conductivity image: `rows` layers deep, `columns` soundings wide.
#[derive(Clone, Debug)]
pub struct ConductivitySection {
    pub rows: usize,
    pub columns: usize,
    pub depth: f64,
    pub conductivity: Vec<f64>,
    pub layer_thickness: Vec<f64>,
}

impl ConductivitySection {
    pub fn filled(rows: usize, columns: usize, depth: f64, value: f64) -> CoreResult<Self> {
        let mut section = ConductivitySection {
            rows,
            columns,
            depth,
            conductivity: vec![value; rows * columns],
            layer_thickness: Vec::new(),
        };
        section.update_layer_thickness()?;
        Ok(section)
    }

    pub fn at(&self, row: usize, column: usize) -> f64 {
        self.conductivity[row * self.columns + column]
    }

    pub fn set(&mut self, row: usize, column: usize, value: f64) {
        self.conductivity[row * self.columns + column] = value;
    }

    /// Copies one column into a layered 1-D profile, applying `exp` when the
    /// section stores log-conductivity.
    pub fn column_profile(&self, column: usize, exponentiate: bool, out: &mut [f64]) {
        debug_assert_eq!(out.len(), self.rows);
        for (row, slot) in out.iter_mut().enumerate() {
            let v = self.conductivity[row * self.columns + column];
            *slot = if exponentiate { v.exp() } else { v };
        }
    }

    fn update_layer_thickness(&mut self) -> CoreResult<()> {
        self.layer_thickness = logspace_thicknesses(self.rows, self.depth);
        let sum: f64 = self.layer_thickness.iter().sum();
        if (self.depth - sum).abs() > 1.0e-3 {
            return Err(CoreError::Invariant(format!(
                "layer thicknesses sum to {sum}, expected {}",
                self.depth
            )));
        }
        Ok(())
    }

    /// Reads the `rows columns depth` header followed by row-major values.
    pub fn load(path: impl AsRef<Path>) -> CoreResult<Self> {
        let mut tr = TokenReader::open(path)?;
        let rows = tr.next_usize()?;
        let columns = tr.next_usize()?;
        let depth = tr.next_f64()?;
        let mut conductivity = Vec::with_capacity(rows * columns);
        for _ in 0..rows * columns {
            conductivity.push(tr.next_f64()?);
        }
        let mut section = ConductivitySection {
            rows,
            columns,
            depth,
            conductivity,
            layer_thickness: Vec::new(),
        };
        section.update_layer_thickness()?;
        Ok(section)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> CoreResult<()> {
        let path = path.as_ref();
        let mut out =
            std::io::BufWriter::new(std::fs::File::create(path).map_err(|e| CoreError::io(path, e))?);
        let write = |out: &mut dyn std::io::Write| -> std::io::Result<()> {
            writeln!(out, "{} {} {:15.9}", self.rows, self.columns, self.depth)?;
            for row in 0..self.rows {
                for col in 0..self.columns {
                    write!(out, "{:15.9} ", self.at(row, col))?;
                }
                writeln!(out)?;
            }
            Ok(())
        };
        write(&mut out).map_err(|e| CoreError::io(path, e))?;
        out.flush().map_err(|e| CoreError::io(path, e))
    }

    /// Writes the bare value grid without the header line.
    pub fn save_grid(&self, path: impl AsRef<Path>) -> CoreResult<()> {
        let path = path.as_ref();
        let mut out =
            std::io::BufWriter::new(std::fs::File::create(path).map_err(|e| CoreError::io(path, e))?);
        let write = |out: &mut dyn std::io::Write| -> std::io::Result<()> {
            for row in 0..self.rows {
                for col in 0..self.columns {
                    write!(out, "{:15.9} ", self.at(row, col))?;
                }
                writeln!(out)?;
            }
            Ok(())
        };
        write(&mut out).map_err(|e| CoreError::io(path, e))?;
        out.flush().map_err(|e| CoreError::io(path, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn thicknesses_accumulate_to_depth() {
        let t = logspace_thicknesses(32, 200.0);
        assert_eq!(t.len(), 31);
        assert_abs_diff_eq!(t.iter().sum::<f64>(), 200.0, epsilon = 1e-9);
        // Strictly increasing with depth.
        for w in t.windows(2) {
            assert!(w[1] > w[0]);
        }
    }

    #[test]
    fn section_round_trips_through_text() {
        let mut section = ConductivitySection::filled(4, 8, 150.0, 0.25).unwrap();
        section.set(2, 3, 1.75);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("section.txt");
        section.save(&path).unwrap();
        let again = ConductivitySection::load(&path).unwrap();
        assert_eq!(again.rows, 4);
        assert_eq!(again.columns, 8);
        assert_abs_diff_eq!(again.at(2, 3), 1.75, epsilon = 1e-9);
        assert_abs_diff_eq!(again.depth, 150.0, epsilon = 1e-9);
    }

    #[test]
    fn column_profile_exponentiates_log_models() {
        let section = ConductivitySection::filled(4, 2, 100.0, (0.25f64).ln()).unwrap();
        let mut profile = vec![0.0; 4];
        section.column_profile(1, true, &mut profile);
        for v in profile {
            assert_abs_diff_eq!(v, 0.25, epsilon = 1e-12);
        }
    }
}
