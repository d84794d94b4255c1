//! Migration-specific error types

use crate::connection::ConnectionError;
use crate::executor::DbError;
use crate::migration::ChangeKey;
use crate::transaction::TransactionError;

/// Migration-specific errors
#[derive(Debug, thiserror::Error)]
pub enum MigrationError {
    /// Changelog structure is invalid; raised before any database access
    #[error("Malformed changelog: {0}")]
    MalformedChangelog(String),

    /// An applied changeset was edited after it ran
    #[error(
        "Changeset '{key}' has been modified after being applied.\n\
         Stored checksum: {stored}\n\
         Current checksum: {current}\n\
         This indicates the changelog was edited after deployment."
    )]
    ChecksumMismatch {
        key: ChangeKey,
        stored: String,
        current: String,
    },

    /// Migration lock timeout
    #[error(
        "Migration lock timeout: {0}\n\
         Another process may be running migrations. If this persists, check for:\n\
         - Stuck migration process\n\
         - Database connection issues\n\
         - A stale row in the lock table (release it with `release-locks`)"
    )]
    LockTimeout(String),

    /// Release was attempted with a handle whose row no longer exists
    #[error("Migration lock not held by '{0}'; it was released or taken over")]
    LockNotHeld(String),

    /// History table cannot be created, read or written
    #[error("History store unavailable: {0}")]
    HistoryStoreUnavailable(String),

    /// A precondition with `on_fail = HALT` failed
    #[error("Precondition halted changeset '{key}': {reason}")]
    PreconditionHalt { key: ChangeKey, reason: String },

    /// Rollback reached a changeset without a rollback body
    #[error(
        "Changeset '{key}' has no rollback and cannot be reverted; \
         operator intervention required"
    )]
    IrreversibleFailure { key: ChangeKey },

    /// Forward or rollback body failed
    #[error("Changeset '{key}' failed during execution: {error}")]
    ExecutionFailed { key: ChangeKey, error: String },

    /// Database execution error outside a changeset
    #[error("Database error: {0}")]
    Database(#[from] DbError),

    /// Target database could not be opened
    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Changelog file could not be read
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl MigrationError {
    /// Short, stable name of the error class (used in logs and CLI output)
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            MigrationError::MalformedChangelog(_) => "MalformedChangelog",
            MigrationError::ChecksumMismatch { .. } => "ChecksumMismatch",
            MigrationError::LockTimeout(_) => "LockTimeout",
            MigrationError::LockNotHeld(_) => "LockNotHeld",
            MigrationError::HistoryStoreUnavailable(_) => "HistoryStoreUnavailable",
            MigrationError::PreconditionHalt { .. } => "PreconditionHalt",
            MigrationError::IrreversibleFailure { .. } => "IrreversibleFailure",
            MigrationError::ExecutionFailed { .. } => "ExecutionFailed",
            MigrationError::Database(_) => "Database",
            MigrationError::Connection(_) => "Connection",
            MigrationError::Config(_) => "Config",
            MigrationError::Io(_) => "Io",
        }
    }
}

impl From<TransactionError> for MigrationError {
    fn from(error: TransactionError) -> Self {
        MigrationError::Database(error.into())
    }
}
