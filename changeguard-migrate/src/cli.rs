//! Command-line arguments

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "changeguard-migrate")]
#[command(about = "Changelog-driven schema migrations for PostgreSQL and SQLite")]
#[command(version = "0.1.0")]
pub struct Cli {
    /// Configuration file (default: config/changeguard.toml, if present)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Target database connection string (overrides configuration)
    #[arg(long)]
    pub target_url: Option<String>,

    /// Reference database connection string, used by `diff`
    #[arg(long)]
    pub reference_url: Option<String>,

    /// Changelog file (.toml, .json or .sql)
    #[arg(long)]
    pub changelog: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, conflicts_with = "quiet")]
    pub verbose: bool,

    /// Quiet output (errors only)
    #[arg(short, long)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Commands {
    /// Apply pending changesets
    Migrate {
        /// Show what would be applied without touching the database
        #[arg(long)]
        dry_run: bool,
    },

    /// Roll back the most recently applied changesets
    Rollback {
        /// Number of changesets to roll back
        count: usize,
    },

    /// Show applied, pending and drifted changesets and the lock holder
    Status,

    /// Check the changelog and the checksums of applied changesets
    Validate,

    /// Remove a stale migration lock left by a crashed process
    ReleaseLocks,

    /// Compare tables and columns of the reference and target databases
    Diff,
}

impl Cli {
    /// Default log filter for the verbosity flags
    #[must_use]
    pub fn log_filter(&self) -> &'static str {
        if self.quiet {
            "error"
        } else if self.verbose {
            "debug"
        } else {
            "info"
        }
    }
}
