//! Rows of the engine-owned history and lock tables

use crate::executor::{DbError, Row};
use crate::migration::ChangeKey;
use chrono::{DateTime, Utc};
use std::fmt;

/// How a history row came to exist
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecType {
    /// The forward body ran
    Executed,
    /// A precondition asked for a skip and the skip was recorded
    MarkRan,
}

impl ExecType {
    /// Stored representation
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ExecType::Executed => "EXECUTED",
            ExecType::MarkRan => "MARK_RAN",
        }
    }

    /// # Errors
    ///
    /// Returns `DbError::Parse` for anything but `EXECUTED` or `MARK_RAN`.
    pub fn parse(raw: &str) -> Result<Self, DbError> {
        match raw.trim() {
            "EXECUTED" => Ok(ExecType::Executed),
            "MARK_RAN" => Ok(ExecType::MarkRan),
            other => Err(DbError::Parse(format!("unknown exec_type '{other}'"))),
        }
    }
}

impl fmt::Display for ExecType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One applied changeset, as stored in the history table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryRecord {
    pub key: ChangeKey,

    /// `SHA-256` checksum at the time of application
    pub checksum: String,

    pub applied_at: DateTime<Utc>,

    /// Assigned by the store; strictly increasing in application order
    pub execution_order: i64,

    pub exec_type: ExecType,
}

impl HistoryRecord {
    /// Column list matching [`HistoryRecord::from_row`]
    pub const COLUMNS: &'static str =
        "id, author, checksum, applied_at, execution_order, exec_type";

    /// Create a `HistoryRecord` from a database row
    ///
    /// Expected column order: `id`, `author`, `checksum`, `applied_at`,
    /// `execution_order`, `exec_type`
    ///
    /// # Errors
    ///
    /// Returns `DbError::Parse` if a column is missing or has the wrong shape.
    pub fn from_row(row: &Row) -> Result<Self, DbError> {
        Ok(Self {
            key: ChangeKey::new(row.text(0)?, row.text(1)?),
            checksum: row.text(2)?,
            applied_at: row.timestamp(3)?,
            execution_order: row.int(4)?,
            exec_type: ExecType::parse(&row.text(5)?)?,
        })
    }
}

/// The current holder of the migration lock
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockRecord {
    /// Owner token `<owner>:<pid>:<uuid>`
    pub locked_by: String,
    pub locked_at: DateTime<Utc>,
}

impl LockRecord {
    /// Expected column order: `locked_by`, `locked_at`
    ///
    /// # Errors
    ///
    /// Returns `DbError::Parse` if a column is missing or has the wrong shape.
    pub fn from_row(row: &Row) -> Result<Self, DbError> {
        Ok(Self {
            locked_by: row.text(0)?,
            locked_at: row.timestamp(1)?,
        })
    }
}
