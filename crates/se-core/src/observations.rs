// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralEM — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Flight-path observations: one record per sounding along the line.
//!
//! The text format is a stream of point records. Each record carries ten
//! geometry floats (transmitter height/roll/pitch/yaw, transmitter–receiver
//! offsets, receiver roll/pitch/yaw), the number of response systems, then
//! per system a direction id, a window count and that many response values.

use std::io::Write as _;
use std::path::Path;

use crate::error::{CoreError, CoreResult};
use crate::tokens::TokenReader;

/// Component of the secondary field a receiver records.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    X = 0,
    Y = 1,
    Z = 2,
}

impl Direction {
    pub fn from_id(id: usize) -> Option<Self> {
        match id {
            0 => Some(Direction::X),
            1 => Some(Direction::Y),
            2 => Some(Direction::Z),
            _ => None,
        }
    }
}

/// One system's windowed response at a single sounding.
#[derive(Clone, Debug)]
pub struct Response {
    pub direction: Direction,
    pub values: Vec<f64>,
}

/// A single sounding: acquisition geometry plus one response per system.
#[derive(Clone, Debug)]
pub struct Point {
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
    pub responses: Vec<Response>,
}

impl Point {
    fn read(tr: &mut TokenReader) -> CoreResult<Self> {
        let tx_height = tr.next_f64()?;
        let tx_roll = tr.next_f64()?;
        let tx_pitch = tr.next_f64()?;
        let tx_yaw = tr.next_f64()?;
        let txrx_dx = tr.next_f64()?;
        let txrx_dy = tr.next_f64()?;
        let txrx_dz = tr.next_f64()?;
        let rx_roll = tr.next_f64()?;
        let rx_pitch = tr.next_f64()?;
        let rx_yaw = tr.next_f64()?;
        let nresponse = tr.next_usize()?;

        let mut responses = Vec::with_capacity(nresponse);
        for _ in 0..nresponse {
            let id = tr.next_usize()?;
            let direction = Direction::from_id(id).ok_or_else(|| {
                CoreError::parse(tr.path(), format!("invalid direction id {id}"))
            })?;
            let n = tr.next_usize()?;
            let mut values = Vec::with_capacity(n);
            for _ in 0..n {
                values.push(tr.next_f64()?);
            }
            responses.push(Response { direction, values });
        }

        Ok(Point {
            tx_height,
            tx_roll,
            tx_pitch,
            tx_yaw,
            txrx_dx,
            txrx_dy,
            txrx_dz,
            rx_roll,
            rx_pitch,
            rx_yaw,
            responses,
        })
    }

    fn write(&self, out: &mut impl std::io::Write) -> std::io::Result<()> {
        write!(
            out,
            "{:15.9} {:15.9} {:15.9} {:15.9} {:15.9} {:15.9} {:15.9} {:15.9} {:15.9} {:15.9} {} ",
            self.tx_height,
            self.tx_roll,
            self.tx_pitch,
            self.tx_yaw,
            self.txrx_dx,
            self.txrx_dy,
            self.txrx_dz,
            self.rx_roll,
            self.rx_pitch,
            self.rx_yaw,
            self.responses.len()
        )?;
        for r in &self.responses {
            write!(out, "{} {} ", r.direction as usize, r.values.len())?;
            for v in &r.values {
                write!(out, "{v:.9e} ")?;
            }
        }
        writeln!(out)
    }
}

/// The full survey line, in acquisition order.
#[derive(Clone, Debug, Default)]
pub struct Observations {
    pub points: Vec<Point>,
}

impl Observations {
    pub fn read(path: impl AsRef<Path>) -> CoreResult<Self> {
        let mut tr = TokenReader::open(path)?;
        let mut points = Vec::new();
        while !tr.is_empty() {
            points.push(Point::read(&mut tr)?);
        }
        Ok(Observations { points })
    }

    pub fn save(&self, path: impl AsRef<Path>) -> CoreResult<()> {
        let path = path.as_ref();
        let mut out =
            std::io::BufWriter::new(std::fs::File::create(path).map_err(|e| CoreError::io(path, e))?);
        for p in &self.points {
            p.write(&mut out).map_err(|e| CoreError::io(path, e))?;
        }
        out.flush().map_err(|e| CoreError::io(path, e))
    }

    /// Total number of response samples across all points and systems.
    pub fn total_datapoints(&self) -> usize {
        self.points
            .iter()
            .map(|p| p.responses.iter().map(|r| r.values.len()).sum::<usize>())
            .sum()
    }

    /// Number of systems carried by each point; fails if points disagree.
    pub fn system_count(&self) -> CoreResult<usize> {
        let first = self
            .points
            .first()
            .map(|p| p.responses.len())
            .ok_or_else(|| CoreError::Validation("observation file holds no points".into()))?;
        for (i, p) in self.points.iter().enumerate() {
            if p.responses.len() != first {
                return Err(CoreError::Invariant(format!(
                    "point {i} carries {} responses, expected {first}",
                    p.responses.len()
                )));
            }
        }
        Ok(first)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_text() -> &'static str {
        "100.0 0 0 0 -12.5 0 2 0 0 0 2 2 3 1.0e-4 2.0e-4 3.0e-4 0 2 5.0e-5 6.0e-5\n\
         101.0 0 0 0 -12.5 0 2 0 0 0 2 2 3 1.1e-4 2.1e-4 3.1e-4 0 2 5.1e-5 6.1e-5\n"
    }

    fn sample_obs() -> Observations {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("line.obs");
        std::fs::write(&path, sample_text()).unwrap();
        Observations::read(&path).unwrap()
    }

    #[test]
    fn parses_points_and_directional_responses() {
        let obs = sample_obs();
        assert_eq!(obs.points.len(), 2);
        assert_eq!(obs.system_count().unwrap(), 2);
        assert_eq!(obs.total_datapoints(), 10);
        let p = &obs.points[0];
        assert_eq!(p.responses[0].direction, Direction::Z);
        assert_eq!(p.responses[1].direction, Direction::X);
        assert_eq!(p.responses[0].values, vec![1.0e-4, 2.0e-4, 3.0e-4]);
    }

    #[test]
    fn save_then_read_round_trips() {
        let obs = sample_obs();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("copy.obs");
        obs.save(&path).unwrap();
        let again = Observations::read(&path).unwrap();
        assert_eq!(again.points.len(), obs.points.len());
        assert_eq!(
            again.points[1].responses[1].values,
            obs.points[1].responses[1].values
        );
    }

    #[test]
    fn rejects_unknown_direction() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.obs");
        std::fs::write(&path, "0 0 0 0 0 0 0 0 0 0 1 7 1 1.0\n").unwrap();
        assert!(Observations::read(&path).is_err());
    }
}
