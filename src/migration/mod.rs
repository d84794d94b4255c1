//! Migration system for changeguard
//!
//! This module provides the migration engine and its parts:
//! - Changelog parsing (TOML, JSON and formatted SQL)
//! - Checksums for drift detection
//! - The history and lock tables inside the target database
//! - Precondition evaluation
//! - The run state machine with rollback of failed runs
//!
//! # Example
//!
//! ```rust,no_run
//! use changeguard::migration::{parse, ChangelogFormat, Migrator, RunOutcome};
//! use changeguard::{MigrationSettings, SqliteExecutor};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let changelog = parse(
//!     r#"
//! [[changeset]]
//! id = "create-users"
//! author = "alice"
//! sql = "CREATE TABLE users (id INTEGER PRIMARY KEY, email TEXT NOT NULL)"
//! rollback = "DROP TABLE users"
//! "#,
//!     ChangelogFormat::Toml,
//! )?;
//!
//! let db = SqliteExecutor::open("app.db")?;
//! let outcome = Migrator::new(changelog, MigrationSettings::default()).migrate(&db);
//! assert!(matches!(outcome, RunOutcome::Done(_)));
//! # Ok(())
//! # }
//! ```

pub mod changelog;
pub mod checksum;
pub mod error;
pub mod formatted_sql;
pub mod history;
pub mod lock;
pub mod migrator;
pub mod outcome;
pub mod precondition;
pub mod record;
pub mod startup;
pub mod status;

pub use changelog::{
    parse, parse_file, split_statements, ChangeEntry, ChangeKey, Changelog, ChangelogFormat,
};
pub use checksum::{compute_checksum, validate_checksum, ChecksumOptions};
pub use error::MigrationError;
pub use history::HistoryStore;
pub use lock::{Backoff, LockHandle, LockManager};
pub use migrator::Migrator;
pub use outcome::{RunFailure, RunOutcome, RunReport, RunState, SkippedChange};
pub use precondition::{evaluate, Check, OnFail, Precondition, PreconditionOutcome};
pub use record::{ExecType, HistoryRecord, LockRecord};
pub use startup::startup_migrations;
pub use status::{ChecksumDrift, MigrationStatus, PendingChange};
