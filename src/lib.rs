//! # changeguard
//!
//! Schema migration engine for PostgreSQL (over `may_postgres`) and SQLite.
//!
//! Applies an ordered changelog to a target database, records applied
//! changesets in a history table inside that database, serializes runs with a
//! database-resident lock, detects edited changesets by checksum, evaluates
//! preconditions, and rolls back the changesets of a failed run in reverse
//! order.
//!
//! ```rust,no_run
//! use changeguard::migration::{parse_file, Migrator, RunOutcome};
//! use changeguard::{connect, MigrationConfig};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = MigrationConfig::load(None)?;
//! let executor = connect(&config.target_connection_string)?;
//! let migrator = Migrator::new(parse_file(&config.changelog_path)?, config.settings());
//!
//! if let RunOutcome::Failed(failure) = migrator.migrate(executor.as_ref()) {
//!     eprintln!("migration failed: {failure}");
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod connection;
pub mod diff;
pub mod executor;
pub mod migration;
pub mod sqlite;
pub mod transaction;

#[cfg(feature = "tracing")]
mod tracing_helpers;

pub use config::{MigrationConfig, MigrationSettings, MismatchPolicy, SkipPolicy};
pub use connection::{connect, connect_postgres, validate_connection_string, ConnectionError};
pub use executor::{DbError, Dialect, MayPostgresExecutor, MigrationExecutor, Row, Value};
pub use migration::{MigrationError, Migrator, RunOutcome};
pub use sqlite::SqliteExecutor;
pub use transaction::{Transaction, TransactionError};
