//! Precondition evaluation
//!
//! Preconditions guard a changeset. Each one names a check and what to do when
//! it fails (`on_fail`) or cannot be evaluated (`on_error`):
//!
//! ```toml
//! [[changeset.preconditions]]
//! on_fail = "SKIP"
//! not = { table_exists = { table = "users" } }
//!
//! [[changeset.preconditions]]
//! sql_check = { sql = "SELECT COUNT(*) FROM users", expected = "0" }
//! ```
//!
//! Evaluation is read-only.

use crate::executor::{Dialect, MigrationExecutor, Value};
use crate::migration::ChangeKey;
use crate::migration::MigrationError;
use serde::Deserialize;
use std::collections::HashSet;
use std::fmt;

/// Failure class of a precondition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OnFail {
    /// Stop the run and roll back this run's changes
    #[default]
    Halt,
    /// Do not apply this changeset; continue with the next one
    Skip,
    /// Log and apply anyway
    Warn,
}

impl OnFail {
    /// Parse the spelling used in formatted SQL changelogs
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "HALT" => Some(OnFail::Halt),
            "SKIP" | "CONTINUE" | "MARK_RAN" => Some(OnFail::Skip),
            "WARN" => Some(OnFail::Warn),
            _ => None,
        }
    }
}

/// A condition checked against the target database
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Check {
    TableExists { table: String },
    ColumnExists { table: String, column: String },
    /// First column of the first row, rendered as text, must equal `expected`
    SqlCheck { sql: String, expected: String },
    ChangeExecuted { id: String, author: String },
    /// Comma-separated dialect names (`postgresql`, `sqlite`)
    Dbms { name: String },
    Not(Box<Check>),
    And(Vec<Check>),
    Or(Vec<Check>),
}

/// A check plus its failure handling
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Precondition {
    #[serde(default)]
    pub on_fail: OnFail,
    #[serde(default)]
    pub on_error: OnFail,
    #[serde(flatten)]
    pub check: Check,
}

impl Precondition {
    pub fn new(check: Check) -> Self {
        Self {
            on_fail: OnFail::Halt,
            on_error: OnFail::Halt,
            check,
        }
    }

    #[must_use]
    pub fn on_fail(mut self, on_fail: OnFail) -> Self {
        self.on_fail = on_fail;
        self
    }

    #[must_use]
    pub fn on_error(mut self, on_error: OnFail) -> Self {
        self.on_error = on_error;
        self
    }

    /// Structural validation done at parse time
    ///
    /// # Errors
    ///
    /// Returns a description of the first empty name or empty combinator.
    pub fn validate(&self) -> Result<(), String> {
        self.check.validate()
    }
}

/// Result of evaluating a changeset's preconditions
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PreconditionOutcome {
    Proceed,
    Skip { reason: String },
    Halt { reason: String },
}

impl Check {
    fn validate(&self) -> Result<(), String> {
        let non_empty = |what: &str, value: &str| {
            if value.trim().is_empty() {
                Err(format!("precondition {what} cannot be empty"))
            } else {
                Ok(())
            }
        };
        match self {
            Check::TableExists { table } => non_empty("table", table),
            Check::ColumnExists { table, column } => {
                non_empty("table", table)?;
                non_empty("column", column)
            }
            Check::SqlCheck { sql, .. } => non_empty("sql", sql),
            Check::ChangeExecuted { id, author } => {
                non_empty("id", id)?;
                non_empty("author", author)
            }
            Check::Dbms { name } => non_empty("dbms", name),
            Check::Not(inner) => inner.validate(),
            Check::And(checks) | Check::Or(checks) => {
                if checks.is_empty() {
                    return Err("precondition and/or needs at least one check".to_string());
                }
                checks.iter().try_for_each(Check::validate)
            }
        }
    }

    fn holds(
        &self,
        executor: &dyn MigrationExecutor,
        applied: &HashSet<ChangeKey>,
    ) -> Result<bool, MigrationError> {
        match self {
            Check::TableExists { table } => table_exists(executor, table),
            Check::ColumnExists { table, column } => column_exists(executor, table, column),
            Check::SqlCheck { sql, expected } => {
                let rows = executor.query(sql, &[])?;
                let actual = rows
                    .first()
                    .filter(|row| !row.is_empty())
                    .map(|row| row.value(0).map(Value::to_text))
                    .transpose()?
                    .flatten();
                Ok(actual.as_deref().map(str::trim) == Some(expected.trim()))
            }
            Check::ChangeExecuted { id, author } => {
                Ok(applied.contains(&ChangeKey::new(id.as_str(), author.as_str())))
            }
            Check::Dbms { name } => {
                let dialect = executor.dialect();
                Ok(name.split(',').any(|n| dialect.matches(n)))
            }
            Check::Not(inner) => Ok(!inner.holds(executor, applied)?),
            Check::And(checks) => {
                for check in checks {
                    if !check.holds(executor, applied)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            Check::Or(checks) => {
                for check in checks {
                    if check.holds(executor, applied)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
        }
    }
}

impl fmt::Display for Check {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Check::TableExists { table } => write!(f, "table {table} exists"),
            Check::ColumnExists { table, column } => write!(f, "column {table}.{column} exists"),
            Check::SqlCheck { sql, expected } => write!(f, "`{sql}` returns {expected}"),
            Check::ChangeExecuted { id, author } => write!(f, "changeset {id}::{author} executed"),
            Check::Dbms { name } => write!(f, "dbms is {name}"),
            Check::Not(inner) => write!(f, "not ({inner})"),
            Check::And(checks) => write_joined(f, checks, " and "),
            Check::Or(checks) => write_joined(f, checks, " or "),
        }
    }
}

fn write_joined(f: &mut fmt::Formatter<'_>, checks: &[Check], sep: &str) -> fmt::Result {
    f.write_str("(")?;
    for (i, check) in checks.iter().enumerate() {
        if i > 0 {
            f.write_str(sep)?;
        }
        write!(f, "{check}")?;
    }
    f.write_str(")")
}

fn split_schema(table: &str) -> (Option<&str>, &str) {
    match table.split_once('.') {
        Some((schema, name)) => (Some(schema), name),
        None => (None, table),
    }
}

fn count(
    executor: &dyn MigrationExecutor,
    sql: &str,
    params: &[Value],
) -> Result<bool, MigrationError> {
    let rows = executor.query(sql, params)?;
    let n = match rows.first() {
        Some(row) => row.int(0)?,
        None => 0,
    };
    Ok(n > 0)
}

pub(crate) fn table_exists(
    executor: &dyn MigrationExecutor,
    table: &str,
) -> Result<bool, MigrationError> {
    let (schema, name) = split_schema(table);
    match executor.dialect() {
        Dialect::Postgres => match schema {
            Some(schema) => count(
                executor,
                "SELECT COUNT(*) FROM information_schema.tables \
                 WHERE table_schema = $1::text AND table_name = $2::text",
                &[Value::from(schema), Value::from(name)],
            ),
            None => count(
                executor,
                "SELECT COUNT(*) FROM information_schema.tables \
                 WHERE table_schema = current_schema() AND table_name = $1::text",
                &[Value::from(name)],
            ),
        },
        Dialect::Sqlite => count(
            executor,
            "SELECT COUNT(*) FROM sqlite_master WHERE type IN ('table', 'view') AND name = ?1",
            &[Value::from(name)],
        ),
    }
}

fn column_exists(
    executor: &dyn MigrationExecutor,
    table: &str,
    column: &str,
) -> Result<bool, MigrationError> {
    let (schema, name) = split_schema(table);
    match executor.dialect() {
        Dialect::Postgres => match schema {
            Some(schema) => count(
                executor,
                "SELECT COUNT(*) FROM information_schema.columns \
                 WHERE table_schema = $1::text AND table_name = $2::text \
                   AND column_name = $3::text",
                &[Value::from(schema), Value::from(name), Value::from(column)],
            ),
            None => count(
                executor,
                "SELECT COUNT(*) FROM information_schema.columns \
                 WHERE table_schema = current_schema() AND table_name = $1::text \
                   AND column_name = $2::text",
                &[Value::from(name), Value::from(column)],
            ),
        },
        Dialect::Sqlite => count(
            executor,
            "SELECT COUNT(*) FROM pragma_table_info(?1) WHERE name = ?2",
            &[Value::from(name), Value::from(column)],
        ),
    }
}

/// Evaluate `preconditions` in declared order
///
/// Stops at the first failure classed `HALT` or `SKIP` and returns it; `WARN`
/// failures are logged and evaluation continues. `applied` is the set of
/// changesets already in history (for `change_executed`).
///
/// # Errors
///
/// Never fails for a check error: those are classed by `on_error`. The
/// `Result` is kept for callers that chain with `?`.
pub fn evaluate(
    preconditions: &[Precondition],
    executor: &dyn MigrationExecutor,
    applied: &HashSet<ChangeKey>,
) -> Result<PreconditionOutcome, MigrationError> {
    for precondition in preconditions {
        let (class, reason) = match precondition.check.holds(executor, applied) {
            Ok(true) => continue,
            Ok(false) => (
                precondition.on_fail,
                format!("precondition failed: {}", precondition.check),
            ),
            Err(e) => (
                precondition.on_error,
                format!("precondition could not be evaluated: {} ({e})", precondition.check),
            ),
        };
        match class {
            OnFail::Warn => log::warn!("{reason}; continuing"),
            OnFail::Skip => return Ok(PreconditionOutcome::Skip { reason }),
            OnFail::Halt => return Ok(PreconditionOutcome::Halt { reason }),
        }
    }
    Ok(PreconditionOutcome::Proceed)
}
