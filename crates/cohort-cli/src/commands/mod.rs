//! CLI command implementations.

use std::future::Future;
use std::path::Path;

use anyhow::{Context, Result};
use cohort_config::{CohortConfig, ConfigLoader};

pub mod check;
pub mod config;
pub mod sync;
pub mod test_access;

/// Loads the effective configuration for `project`.
pub(crate) fn load_config(project: &Path) -> Result<CohortConfig> {
    ConfigLoader::new()
        .with_project_dir(project)
        .load()
        .context("Failed to load configuration")
}

/// Runs an engine future to completion on a fresh runtime.
pub(crate) fn block_on<F: Future>(future: F) -> Result<F::Output> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start async runtime")?;
    Ok(runtime.block_on(future))
}
