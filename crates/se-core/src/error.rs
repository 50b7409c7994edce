// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralEM — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use std::path::PathBuf;

use thiserror::Error;

/// Convenient result alias for the core crate.
pub type CoreResult<T> = Result<T, CoreError>;

/// Failure taxonomy shared across the workspace.
///
/// Proposal rejections are never represented here — a rejected move is an
/// ordinary sampler outcome. Errors of the `Invariant` kind indicate a bug
/// and terminate the run.
#[derive(Error, Debug)]
pub enum CoreError {
    /// Bad user input: out-of-range parameter, malformed argument.
    #[error("validation error: {0}")]
    Validation(String),

    /// Read or write failure, with the offending path surfaced.
    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A file opened fine but its contents did not parse.
    #[error("parse error in {path}: {detail}")]
    Parse { path: PathBuf, detail: String },

    /// Internal consistency violation. Unrecoverable.
    #[error("invariant violated: {0}")]
    Invariant(String),

    /// Non-finite value surfaced where a finite one is required.
    #[error("non-finite value in {context}")]
    Numeric { context: &'static str },

    /// A collective call failed or a peer rank poisoned the fabric.
    #[error("collective failure: {0}")]
    Collective(String),
}

impl CoreError {
    /// Wraps an I/O error with the path that produced it.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        CoreError::Io {
            path: path.into(),
            source,
        }
    }

    /// Builds a parse error for the given path.
    pub fn parse(path: impl Into<PathBuf>, detail: impl Into<String>) -> Self {
        CoreError::Parse {
            path: path.into(),
            detail: detail.into(),
        }
    }
}
