//! Configuration management for Cohort
//!
//! Provides hierarchical configuration loading from multiple sources:
//! 1. Environment variables (COHORT_* prefix, `__` between section and key)
//! 2. cohort.local.toml (gitignored, local overrides)
//! 3. cohort.toml (git-tracked, project config)
//! 4. ~/.config/cohort/config.toml (user defaults)
//! 5. Built-in defaults (lowest precedence)

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

mod error;
mod loader;
mod paths;

pub use error::ConfigError;
pub use loader::ConfigLoader;
pub use paths::Paths;

/// Main Cohort configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CohortConfig {
    pub sync: SyncConfig,
    pub history: HistoryConfig,
}

/// Tuning for sync passes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Policy/collection pairs reconciled in parallel.
    pub max_concurrency: usize,
    /// Attribute lookups in flight per resolution.
    pub lookup_concurrency: usize,
    /// Upper bound on one attribute lookup.
    pub provider_timeout_ms: u64,
    /// Upper bound on one membership add/remove.
    pub mutation_timeout_ms: u64,
    /// Pending sync requests before `enqueue` waits.
    pub queue_capacity: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 8,
            lookup_concurrency: 32,
            provider_timeout_ms: 2_000,
            mutation_timeout_ms: 5_000,
            queue_capacity: 256,
        }
    }
}

impl SyncConfig {
    pub fn provider_timeout(&self) -> Duration {
        Duration::from_millis(self.provider_timeout_ms)
    }

    pub fn mutation_timeout(&self) -> Duration {
        Duration::from_millis(self.mutation_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    /// Finalized sync runs kept in history; older runs are dropped.
    pub max_runs: usize,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self { max_runs: 100 }
    }
}

impl CohortConfig {
    /// Load configuration from default locations
    pub fn load() -> Result<Self> {
        ConfigLoader::new().load()
    }

    /// Load configuration from specific project directory
    pub fn load_from_dir(project_dir: impl AsRef<Path>) -> Result<Self> {
        ConfigLoader::new().with_project_dir(project_dir).load()
    }

    /// Rejects settings the engine cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let checks = [
            ("sync.max_concurrency", self.sync.max_concurrency as u64),
            ("sync.lookup_concurrency", self.sync.lookup_concurrency as u64),
            ("sync.provider_timeout_ms", self.sync.provider_timeout_ms),
            ("sync.mutation_timeout_ms", self.sync.mutation_timeout_ms),
            ("sync.queue_capacity", self.sync.queue_capacity as u64),
            ("history.max_runs", self.history.max_runs as u64),
        ];

        for (key, value) in checks {
            if value == 0 {
                return Err(ConfigError::ValidationError(format!(
                    "{key} must be greater than zero"
                )));
            }
        }
        Ok(())
    }

    /// Renders the effective configuration as TOML.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::SerializeError(e.to_string()))
    }

    /// Parses a single TOML document on top of the built-in defaults.
    pub fn from_toml(source: &str, path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        toml::from_str(source).map_err(|source| ConfigError::ParseError {
            path: path.as_ref().to_path_buf(),
            source,
        })
    }
}
