//! Execution history table management
//!
//! The history table is the durable record of which changesets ran, with what
//! checksum and in what order. Writes go through the caller's executor so they
//! commit or roll back together with the changeset they describe.

use crate::executor::{Dialect, MigrationExecutor, Value};
use crate::migration::precondition::table_exists;
use crate::migration::record::{ExecType, HistoryRecord};
use crate::migration::{ChangeKey, MigrationError};
use chrono::{DateTime, Utc};
use sea_query::{
    ColumnDef, DynIden, Index, IndexCreateStatement, PostgresQueryBuilder, SqliteQueryBuilder,
    Table, TableCreateStatement,
};
use std::collections::HashSet;

pub(crate) fn render_table(statement: &TableCreateStatement, dialect: Dialect) -> String {
    match dialect {
        Dialect::Postgres => statement.build(PostgresQueryBuilder),
        Dialect::Sqlite => statement.build(SqliteQueryBuilder),
    }
}

pub(crate) fn render_index(statement: &IndexCreateStatement, dialect: Dialect) -> String {
    match dialect {
        Dialect::Postgres => statement.build(PostgresQueryBuilder),
        Dialect::Sqlite => statement.build(SqliteQueryBuilder),
    }
}

/// Execute the `CREATE` statement `sql` unless `exists` already reports the object
///
/// A failed `CREATE` still succeeds when the object exists afterwards: on
/// PostgreSQL two sessions racing on `CREATE TABLE IF NOT EXISTS` can make the
/// loser fail with a catalog unique violation although the table is there.
pub(crate) fn create_if_missing(
    executor: &dyn MigrationExecutor,
    what: &str,
    sql: &str,
    exists: impl Fn() -> Result<bool, MigrationError>,
) -> Result<(), MigrationError> {
    let check = || exists().map_err(|e| unavailable(&format!("cannot look up {what}"), e));
    if check()? {
        return Ok(());
    }
    let Err(err) = executor.execute(sql, &[]) else {
        return Ok(());
    };
    if check()? {
        log::debug!("{what} was created concurrently ({err})");
        return Ok(());
    }
    Err(unavailable(&format!("cannot create {what}"), err))
}

/// Whether an index named `name` exists in the current schema
pub(crate) fn index_exists(
    executor: &dyn MigrationExecutor,
    name: &str,
) -> Result<bool, MigrationError> {
    let sql = match executor.dialect() {
        Dialect::Postgres => {
            "SELECT indexname::text FROM pg_indexes \
             WHERE schemaname = current_schema() AND indexname = $1::text"
        }
        Dialect::Sqlite => "SELECT name FROM sqlite_master WHERE type = 'index' AND name = ?1",
    };
    Ok(!executor.query(sql, &[Value::from(name)])?.is_empty())
}

/// `CREATE TABLE IF NOT EXISTS` for the history table
///
/// Primary key `(id, author)`; at most one record per changeset.
pub fn create_history_table(table: &str) -> TableCreateStatement {
    Table::create()
        .table(DynIden::from(table.to_string()))
        .if_not_exists()
        .col(ColumnDef::new("id").string().string_len(255).not_null())
        .col(ColumnDef::new("author").string().string_len(255).not_null())
        .col(ColumnDef::new("checksum").string().string_len(64).not_null())
        .col(ColumnDef::new("applied_at").timestamp().not_null())
        .col(ColumnDef::new("execution_order").big_integer().not_null())
        .col(ColumnDef::new("exec_type").string().string_len(10).not_null())
        .primary_key(Index::create().col("id").col("author"))
        .to_owned()
}

/// Index on `execution_order` for ordered reads
pub fn create_history_index(table: &str) -> IndexCreateStatement {
    Index::create()
        .name(history_index_name(table))
        .table(DynIden::from(table.to_string()))
        .col("execution_order")
        .if_not_exists()
        .to_owned()
}

fn history_index_name(table: &str) -> String {
    format!("idx_{table}_execution_order")
}

/// Reads and writes the history table of one target database
pub struct HistoryStore<'a> {
    executor: &'a dyn MigrationExecutor,
    table: String,
}

fn unavailable(action: &str, err: impl std::fmt::Display) -> MigrationError {
    MigrationError::HistoryStoreUnavailable(format!("{action}: {err}"))
}

impl<'a> HistoryStore<'a> {
    /// `table` must be a plain identifier (see [`crate::config::is_identifier`])
    pub fn new(executor: &'a dyn MigrationExecutor, table: impl Into<String>) -> Self {
        Self {
            executor,
            table: table.into(),
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Create the history table and its index if they don't exist
    ///
    /// Safe to call from several processes at once.
    ///
    /// # Errors
    ///
    /// Returns `HistoryStoreUnavailable` if either object is missing and
    /// cannot be created.
    pub fn ensure_table(&self) -> Result<(), MigrationError> {
        let dialect = self.executor.dialect();
        create_if_missing(
            self.executor,
            &self.table,
            &render_table(&create_history_table(&self.table), dialect),
            || table_exists(self.executor, &self.table),
        )?;

        let index = history_index_name(&self.table);
        create_if_missing(
            self.executor,
            &index,
            &render_index(&create_history_index(&self.table), dialect),
            || index_exists(self.executor, &index),
        )
    }

    /// All records, ordered by `execution_order`
    ///
    /// # Errors
    ///
    /// Returns `HistoryStoreUnavailable` if the table cannot be read or a row
    /// cannot be decoded.
    pub fn applied(&self) -> Result<Vec<HistoryRecord>, MigrationError> {
        let sql = format!(
            "SELECT {} FROM \"{}\" ORDER BY execution_order ASC",
            HistoryRecord::COLUMNS,
            self.table
        );
        let rows = self
            .executor
            .query(&sql, &[])
            .map_err(|e| unavailable(&format!("cannot read {}", self.table), e))?;
        rows.iter()
            .map(|row| {
                HistoryRecord::from_row(row).map_err(|e| unavailable("corrupt history row", e))
            })
            .collect()
    }

    /// Identities of every recorded changeset
    ///
    /// # Errors
    ///
    /// See [`HistoryStore::applied`].
    pub fn applied_keys(&self) -> Result<HashSet<ChangeKey>, MigrationError> {
        Ok(self.applied()?.into_iter().map(|r| r.key).collect())
    }

    /// Append a record; `execution_order` is one past the current maximum
    ///
    /// Call inside the transaction that applied the changeset.
    ///
    /// # Errors
    ///
    /// Returns `HistoryStoreUnavailable` if the insert fails (including a
    /// duplicate `(id, author)`).
    pub fn record(
        &self,
        key: &ChangeKey,
        checksum: &str,
        applied_at: DateTime<Utc>,
        exec_type: ExecType,
    ) -> Result<HistoryRecord, MigrationError> {
        let next_sql = format!(
            "SELECT COALESCE(MAX(execution_order), 0) + 1 FROM \"{}\"",
            self.table
        );
        let rows = self
            .executor
            .query(&next_sql, &[])
            .map_err(|e| unavailable("cannot compute execution order", e))?;
        let execution_order = match rows.first() {
            Some(row) => row
                .int(0)
                .map_err(|e| unavailable("cannot compute execution order", e))?,
            None => 1,
        };

        let d = self.executor.dialect();
        let insert_sql = format!(
            "INSERT INTO \"{}\" (id, author, checksum, applied_at, execution_order, exec_type) \
             VALUES ({}, {}, {}, {}, {}, {})",
            self.table,
            d.placeholder(1),
            d.placeholder(2),
            d.placeholder(3),
            d.placeholder(4),
            d.placeholder(5),
            d.placeholder(6),
        );
        self.executor
            .execute(
                &insert_sql,
                &[
                    Value::from(key.id.as_str()),
                    Value::from(key.author.as_str()),
                    Value::from(checksum),
                    Value::Timestamp(applied_at),
                    Value::Int(execution_order),
                    Value::from(exec_type.as_str()),
                ],
            )
            .map_err(|e| unavailable(&format!("cannot record '{key}'"), e))?;

        Ok(HistoryRecord {
            key: key.clone(),
            checksum: checksum.to_string(),
            applied_at,
            execution_order,
            exec_type,
        })
    }

    /// Delete the record of `key`
    ///
    /// # Errors
    ///
    /// Returns `HistoryStoreUnavailable` if the delete fails or no record existed.
    pub fn remove(&self, key: &ChangeKey) -> Result<(), MigrationError> {
        let d = self.executor.dialect();
        let sql = format!(
            "DELETE FROM \"{}\" WHERE id = {} AND author = {}",
            self.table,
            d.placeholder(1),
            d.placeholder(2)
        );
        let deleted = self
            .executor
            .execute(&sql, &[Value::from(key.id.as_str()), Value::from(key.author.as_str())])
            .map_err(|e| unavailable(&format!("cannot remove '{key}'"), e))?;
        if deleted == 0 {
            return Err(unavailable(&format!("cannot remove '{key}'"), "no such record"));
        }
        Ok(())
    }
}
