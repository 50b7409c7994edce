// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralEM — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Forward-model descriptor ("STM") files.
//!
//! Section-keyed text with `Name Begin` / `Name End` blocks of `key = value`
//! pairs. The `ForwardModelling` block embeds a `WindowTimes` block whose
//! lines are `(t_low, t_high)` pairs; window centre times drive both the
//! forward model and the time-dependent noise models.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::error::{CoreError, CoreResult};

/// One receiver gate: a time interval after transmitter turn-off.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Window {
    pub time_low: f64,
    pub time_high: f64,
}

impl Window {
    pub fn centre(&self) -> f64 {
        0.5 * (self.time_low + self.time_high)
    }
}

/// Key/value content of one `Begin`/`End` section.
#[derive(Clone, Debug, Default)]
pub struct SectionMap {
    entries: BTreeMap<String, String>,
}

impl SectionMap {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    /// Typed lookup with a descriptor-level error on absence or mis-parse.
    pub fn f64_required(&self, path: &Path, key: &str) -> CoreResult<f64> {
        let raw = self
            .entries
            .get(key)
            .ok_or_else(|| CoreError::parse(path, format!("missing key '{key}'")))?;
        raw.parse::<f64>()
            .map_err(|_| CoreError::parse(path, format!("key '{key}' is not a float: '{raw}'")))
    }

    pub fn f64_or(&self, key: &str, default: f64) -> f64 {
        self.entries
            .get(key)
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(default)
    }

    fn insert(&mut self, key: &str, value: &str) {
        self.entries.insert(key.trim().into(), value.trim().into());
    }
}

/// Parsed system descriptor.
#[derive(Clone, Debug)]
pub struct StmDescriptor {
    pub path: PathBuf,
    pub transmitter: SectionMap,
    pub receiver: SectionMap,
    pub modelling: SectionMap,
    pub windows: Vec<Window>,
}

impl StmDescriptor {
    pub fn load(path: impl AsRef<Path>) -> CoreResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| CoreError::io(path, e))?;
        Self::parse(path, &text)
    }

    pub fn parse(path: impl Into<PathBuf>, text: &str) -> CoreResult<Self> {
        let path = path.into();
        let mut transmitter = SectionMap::default();
        let mut receiver = SectionMap::default();
        let mut modelling = SectionMap::default();
        let mut windows = Vec::new();

        // Stack of open section names; key/value pairs land in the innermost
        // recognised section, window lines only inside WindowTimes.
        let mut stack: Vec<String> = Vec::new();
        for (lineno, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let is_marker = !line.contains('=');
            if is_marker {
                if let Some(name) = line.strip_suffix("Begin") {
                    stack.push(name.trim().to_string());
                    continue;
                }
            }
            if is_marker && line.ends_with("End") {
                let name = line.trim_end_matches("End").trim();
                match stack.pop() {
                    Some(open) if name.is_empty() || open == name => {}
                    Some(open) => {
                        return Err(CoreError::parse(
                            &path,
                            format!("line {}: '{name} End' closes open section '{open}'", lineno + 1),
                        ))
                    }
                    None => {
                        return Err(CoreError::parse(
                            &path,
                            format!("line {}: 'End' with no open section", lineno + 1),
                        ))
                    }
                }
                continue;
            }

            let here = stack.last().map(String::as_str);
            if here == Some("WindowTimes") {
                let mut it = line.split_ascii_whitespace();
                let (low, high) = match (it.next(), it.next()) {
                    (Some(a), Some(b)) => (a, b),
                    _ => {
                        return Err(CoreError::parse(
                            &path,
                            format!("line {}: window needs two times", lineno + 1),
                        ))
                    }
                };
                let time_low: f64 = low.parse().map_err(|_| {
                    CoreError::parse(&path, format!("line {}: bad window time", lineno + 1))
                })?;
                let time_high: f64 = high.parse().map_err(|_| {
                    CoreError::parse(&path, format!("line {}: bad window time", lineno + 1))
                })?;
                if time_high <= time_low {
                    return Err(CoreError::parse(
                        &path,
                        format!("line {}: window times not increasing", lineno + 1),
                    ));
                }
                windows.push(Window {
                    time_low,
                    time_high,
                });
                continue;
            }

            if let Some((key, value)) = line.split_once('=') {
                match here {
                    Some("Transmitter") => transmitter.insert(key, value),
                    Some("Receiver") => receiver.insert(key, value),
                    Some("ForwardModelling") => modelling.insert(key, value),
                    _ => {}
                }
            }
        }

        if !stack.is_empty() {
            return Err(CoreError::parse(
                &path,
                format!("unterminated section '{}'", stack.last().unwrap()),
            ));
        }
        if windows.is_empty() {
            return Err(CoreError::parse(&path, "descriptor holds no windows"));
        }

        Ok(StmDescriptor {
            path,
            transmitter,
            receiver,
            modelling,
            windows,
        })
    }

    pub fn centre_times(&self) -> Vec<f64> {
        self.windows.iter().map(Window::centre).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    const SAMPLE: &str = "\
Transmitter Begin
  LoopArea = 400.0
  PeakCurrent = 10.0
  NumberOfTurns = 1
Transmitter End
Receiver Begin
  WindowWeighting = AreaUnderCurve
Receiver End
ForwardModelling Begin
  OutputType = dB/dt
  WindowTimes Begin
    1.0e-4 2.0e-4
    2.0e-4 4.0e-4
    4.0e-4 8.0e-4
  WindowTimes End
ForwardModelling End
";

    #[test]
    fn parses_sections_and_windows() {
        let stm = StmDescriptor::parse("mem.stm", SAMPLE).unwrap();
        assert_eq!(stm.windows.len(), 3);
        assert_abs_diff_eq!(stm.windows[1].centre(), 3.0e-4, epsilon = 1e-12);
        assert_eq!(stm.transmitter.get("NumberOfTurns"), Some("1"));
        assert_abs_diff_eq!(
            stm.transmitter
                .f64_required(Path::new("mem.stm"), "LoopArea")
                .unwrap(),
            400.0
        );
    }

    #[test]
    fn rejects_mismatched_sections() {
        let text = "Transmitter Begin\nReceiver End\n";
        assert!(StmDescriptor::parse("mem.stm", text).is_err());
    }

    #[test]
    fn rejects_descriptor_without_windows() {
        let text = "Transmitter Begin\nLoopArea = 1\nTransmitter End\n";
        assert!(StmDescriptor::parse("mem.stm", text).is_err());
    }
}
