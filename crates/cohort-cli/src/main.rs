//! Cohort CLI.
//!
//! Attribute-based membership policies for restricted collections.
//!
//! # Quick Start
//!
//! ```bash
//! # Check that an expression compiles
//! cohort check 'Dept == "Engineering" && Office in ["Remote", "Berlin"]'
//!
//! # See who a draft policy would admit, without changing anything
//! cohort test-access --fixture world.json --expr 'Dept == "Engineering"'
//!
//! # Run a sync pass over the fixture's auto-synced policies
//! cohort sync --fixture world.json
//! ```

mod commands;
mod fixture;
mod style;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};

/// Cohort - attribute-based access policies that keep collection membership in sync.
#[derive(Parser)]
#[command(name = "cohort")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Disable colored output.
    #[arg(long, global = true)]
    no_color: bool,

    /// Project directory to read cohort.toml from.
    #[arg(long, global = true, default_value = ".")]
    project: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile a policy expression and show its canonical form.
    Check {
        /// Expression source, e.g. 'Dept == "Engineering"'.
        expression: String,
    },

    /// Show which users a policy admits, without mutating membership.
    TestAccess {
        /// JSON fixture with users, policies and collections.
        #[arg(short, long)]
        fixture: PathBuf,

        /// Draft expression to test.
        #[arg(short, long, conflicts_with = "policy", required_unless_present = "policy")]
        expr: Option<String>,

        /// Policy from the fixture to test.
        #[arg(short, long)]
        policy: Option<String>,

        /// Preview the membership changes on this collection.
        #[arg(short, long)]
        collection: Option<String>,

        /// Start listing after this user id.
        #[arg(long)]
        after: Option<String>,

        /// Maximum number of users to list.
        #[arg(short, long, default_value = "50")]
        limit: usize,

        #[arg(long, value_enum, default_value = "text")]
        format: Format,
    },

    /// Run a sync pass over the fixture and show the result.
    Sync {
        /// JSON fixture with users, policies and collections.
        #[arg(short, long)]
        fixture: PathBuf,

        /// Only sync this policy, as if it had just been saved.
        #[arg(short, long)]
        policy: Option<String>,

        /// Sweep the memberships of this inactive policy instead.
        #[arg(long, conflicts_with = "policy")]
        sweep: Option<String>,

        #[arg(long, value_enum, default_value = "text")]
        format: Format,
    },

    /// Configuration commands.
    #[command(subcommand)]
    Config(ConfigCommands),
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Show the effective configuration.
    Show {
        #[arg(long, value_enum, default_value = "text")]
        format: ConfigFormat,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Format {
    Text,
    Json,
}

#[derive(Clone, Copy, ValueEnum)]
enum ConfigFormat {
    Text,
    Toml,
    Json,
}

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    style::set_no_color(cli.no_color || std::env::var_os("NO_COLOR").is_some());

    match cli.command {
        Commands::Check { expression } => commands::check::run(&expression),
        Commands::TestAccess {
            fixture,
            expr,
            policy,
            collection,
            after,
            limit,
            format,
        } => commands::test_access::run(
            &cli.project,
            &commands::test_access::Args {
                fixture,
                expr,
                policy,
                collection,
                after,
                limit,
                json: matches!(format, Format::Json),
            },
        ),
        Commands::Sync {
            fixture,
            policy,
            sweep,
            format,
        } => commands::sync::run(
            &cli.project,
            &fixture,
            policy.as_deref(),
            sweep.as_deref(),
            matches!(format, Format::Json),
        ),
        Commands::Config(cmd) => match cmd {
            ConfigCommands::Show { format } => {
                let format = match format {
                    ConfigFormat::Text => "text",
                    ConfigFormat::Toml => "toml",
                    ConfigFormat::Json => "json",
                };
                commands::config::show(&cli.project, format)
            }
        },
    }
}
