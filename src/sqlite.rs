//! SQLite implementation of [`MigrationExecutor`] over `rusqlite`.

use crate::executor::{DbError, Dialect, MigrationExecutor, Row, Value};
use rusqlite::types::{ToSqlOutput, ValueRef};
use rusqlite::{params_from_iter, Connection};
use std::path::Path;
use std::time::Duration;

#[cfg(feature = "tracing")]
use crate::tracing_helpers;

/// How long a new connection waits on a database locked by another writer
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

impl rusqlite::ToSql for Value {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            Value::Null => ToSqlOutput::Owned(rusqlite::types::Value::Null),
            Value::Int(i) => ToSqlOutput::from(*i),
            Value::Float(v) => ToSqlOutput::from(*v),
            Value::Text(s) => ToSqlOutput::from(s.as_str()),
            Value::Bool(b) => ToSqlOutput::from(*b),
            Value::Timestamp(ts) => ToSqlOutput::from(ts.to_rfc3339()),
        })
    }
}

/// Executor over a single `rusqlite::Connection`
pub struct SqliteExecutor {
    conn: Connection,
}

impl SqliteExecutor {
    /// Wrap an existing connection
    ///
    /// # Errors
    ///
    /// Returns `DbError::Sqlite` if the busy timeout cannot be set.
    pub fn new(conn: Connection) -> Result<Self, DbError> {
        conn.busy_timeout(DEFAULT_BUSY_TIMEOUT)?;
        Ok(Self { conn })
    }

    /// Change how long statements wait on a database locked by another writer
    ///
    /// Past this timeout a statement fails with `SQLITE_BUSY`
    /// (see [`DbError::is_lock_contention`]).
    ///
    /// # Errors
    ///
    /// Returns `DbError::Sqlite` if SQLite rejects the setting.
    pub fn set_busy_timeout(&self, timeout: Duration) -> Result<(), DbError> {
        self.conn.busy_timeout(timeout)?;
        Ok(())
    }

    /// Open (or create) a database file
    ///
    /// # Errors
    ///
    /// Returns `DbError::Sqlite` if the file cannot be opened.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, DbError> {
        Self::new(Connection::open(path)?)
    }

    /// Open a private in-memory database
    ///
    /// # Errors
    ///
    /// Returns `DbError::Sqlite` if SQLite cannot allocate the database.
    pub fn open_in_memory() -> Result<Self, DbError> {
        Self::new(Connection::open_in_memory()?)
    }

    /// Get a reference to the underlying connection
    pub fn connection(&self) -> &Connection {
        &self.conn
    }
}

fn decode_sqlite_value(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::Int(i),
        ValueRef::Real(v) => Value::Float(v),
        ValueRef::Text(bytes) | ValueRef::Blob(bytes) => {
            Value::Text(String::from_utf8_lossy(bytes).into_owned())
        }
    }
}

impl MigrationExecutor for SqliteExecutor {
    fn execute(&self, sql: &str, params: &[Value]) -> Result<u64, DbError> {
        #[cfg(feature = "tracing")]
        let _span = tracing_helpers::execute_statement_span(sql).entered();

        match self.conn.execute(sql, params_from_iter(params.iter())) {
            Ok(affected) => Ok(affected as u64),
            // PRAGMA and friends return rows; run them for their side effect only
            Err(rusqlite::Error::ExecuteReturnedResults) if params.is_empty() => {
                self.conn.execute_batch(sql)?;
                Ok(0)
            }
            Err(e) => Err(DbError::Sqlite(e)),
        }
    }

    fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>, DbError> {
        #[cfg(feature = "tracing")]
        let _span = tracing_helpers::execute_statement_span(sql).entered();

        let mut stmt = self.conn.prepare(sql)?;
        let columns = stmt.column_count();
        let rows = stmt.query_map(params_from_iter(params.iter()), |row| {
            let mut values = Vec::with_capacity(columns);
            for idx in 0..columns {
                values.push(decode_sqlite_value(row.get_ref(idx)?));
            }
            Ok(Row::new(values))
        })?;
        rows.collect::<Result<Vec<_>, _>>().map_err(DbError::from)
    }

    fn dialect(&self) -> Dialect {
        Dialect::Sqlite
    }
}
