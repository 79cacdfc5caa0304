//! Configuration management commands.

use std::path::Path;

use anyhow::Result;

use super::load_config;
use crate::style::{print_heading, print_info_table};

/// Show the effective configuration.
pub fn show(project: &Path, format: &str) -> Result<()> {
    let config = load_config(project)?;

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&config)?),
        "toml" => println!("{}", config.to_toml()?),
        _ => {
            print_heading("Cohort Configuration");
            print_info_table(&[
                ("sync.max_concurrency", config.sync.max_concurrency.to_string()),
                ("sync.lookup_concurrency", config.sync.lookup_concurrency.to_string()),
                ("sync.provider_timeout_ms", config.sync.provider_timeout_ms.to_string()),
                ("sync.mutation_timeout_ms", config.sync.mutation_timeout_ms.to_string()),
                ("sync.queue_capacity", config.sync.queue_capacity.to_string()),
                ("history.max_runs", config.history.max_runs.to_string()),
            ]);
        }
    }

    Ok(())
}
