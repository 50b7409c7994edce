// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralEM — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Coefficient-count trace of a recorded chain.

use std::io::Write as _;
use std::path::Path;

use se_core::error::{CoreError, CoreResult};

/// Writes the live coefficient count of every thinned replayed step, one
/// per line. Returns the number of lines written.
pub fn write_khistory(
    input: impl AsRef<Path>,
    output: impl AsRef<Path>,
    thin: usize,
) -> CoreResult<usize> {
    let input = input.as_ref();
    let output = output.as_ref();
    let bytes = std::fs::read(input).map_err(|e| CoreError::io(input, e))?;
    let mut out = std::io::BufWriter::new(
        std::fs::File::create(output).map_err(|e| CoreError::io(output, e))?,
    );

    let mut written = 0usize;
    let mut cursor = std::io::Cursor::new(bytes);
    se_chain::replay(&mut cursor, |step, _delta, live| {
        if thin <= 1 || step % thin == 0 {
            writeln!(out, "{}", live.len()).map_err(|e| CoreError::io(output, e))?;
            written += 1;
        }
        Ok(())
    })?;
    out.flush().map_err(|e| CoreError::io(output, e))?;
    Ok(written)
}
