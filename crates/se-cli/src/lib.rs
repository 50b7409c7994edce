// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralEM — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Shared plumbing for the SpiralEM binaries: tracing bootstrap and the
//! loaders that turn command-line file lists into configured systems.

use std::path::PathBuf;
use std::sync::Arc;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

use se_core::error::{CoreError, CoreResult};
use se_core::forward::{ForwardModel, HalfspaceConvolution};
use se_core::noise::NoiseModel;
use se_core::stm::StmDescriptor;
use se_wavetree::Basis;

/// Errors raised while configuring the tracing subscriber.
#[derive(Debug, thiserror::Error)]
pub enum InitError {
    #[error("tracing has already been initialised")]
    AlreadyInitialised,
}

/// Installs the process-global subscriber for command-line output:
/// `RUST_LOG`-style filtering to stderr. Sampler ranks install their own
/// thread-scoped file subscribers on top of this, one `log.txt-NNN` each.
pub fn init_tracing() -> Result<(), InitError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr);
    Registry::default()
        .with(filter)
        .with(fmt_layer)
        .try_init()
        .map_err(|_| InitError::AlreadyInitialised)
}

/// Resolves a wavelet basis id from the command line.
pub fn basis_from_id(id: u32, axis: &str) -> CoreResult<Basis> {
    Basis::from_id(id).ok_or_else(|| {
        CoreError::Validation(format!(
            "{axis} wavelet id {id} out of range 0..={}",
            Basis::MAX_ID
        ))
    })
}

/// Loads the forward models named by `--stm` and the noise models named by
/// `--hierarchical`; the two lists pair up elementwise.
pub fn load_systems(
    stm_files: &[PathBuf],
    hierarchical_files: &[PathBuf],
) -> CoreResult<(Vec<Arc<dyn ForwardModel>>, Vec<NoiseModel>)> {
    if stm_files.is_empty() {
        return Err(CoreError::Validation(
            "at least one forward-model descriptor is required".into(),
        ));
    }
    if stm_files.len() != hierarchical_files.len() {
        return Err(CoreError::Validation(format!(
            "{} forward-model descriptors but {} noise files; one noise file per system",
            stm_files.len(),
            hierarchical_files.len()
        )));
    }
    let mut forwards: Vec<Arc<dyn ForwardModel>> = Vec::with_capacity(stm_files.len());
    for path in stm_files {
        let stm = StmDescriptor::load(path)?;
        forwards.push(Arc::new(HalfspaceConvolution::from_descriptor(&stm)?));
    }
    let mut noises = Vec::with_capacity(hierarchical_files.len());
    for path in hierarchical_files {
        noises.push(NoiseModel::load(path)?);
    }
    Ok((forwards, noises))
}

/// Prints the error chain and exits nonzero; the single exit path of every
/// binary.
pub fn fail(err: CoreError) -> ! {
    eprintln!("error: {err}");
    let mut source = std::error::Error::source(&err);
    while let Some(cause) = source {
        eprintln!("  caused by: {cause}");
        source = cause.source();
    }
    std::process::exit(1);
}
