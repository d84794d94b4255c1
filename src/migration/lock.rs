//! Table-based migration lock
//!
//! The lock table holds at most one row (`id = 1`). The process that inserts
//! it holds the lock; everyone else polls until the row disappears or their
//! timeout runs out. Only the holder's token can delete the row, except for the
//! operator-only [`LockManager::force_release`].

use crate::executor::{MigrationExecutor, Value};
use crate::migration::history::{create_if_missing, render_table};
use crate::migration::precondition::table_exists;
use crate::migration::record::LockRecord;
use crate::migration::MigrationError;
use chrono::Utc;
use sea_query::{ColumnDef, DynIden, Table, TableCreateStatement};
use std::time::{Duration, Instant};

#[cfg(feature = "tracing")]
use crate::tracing_helpers;

/// Primary key of the single lock row
const LOCK_ROW_ID: i64 = 1;

/// Polling schedule while the lock is held elsewhere
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(100),
            max: Duration::from_secs(2),
        }
    }
}

/// Proof of lock ownership, required to release
#[derive(Debug, Clone, PartialEq, Eq)]
#[must_use = "the lock stays held until released with this handle"]
pub struct LockHandle {
    owner_token: String,
}

impl LockHandle {
    /// `<owner>:<pid>:<uuid>`, as stored in `locked_by`
    pub fn owner_token(&self) -> &str {
        &self.owner_token
    }
}

/// `CREATE TABLE IF NOT EXISTS` for the lock table
pub fn create_lock_table(table: &str) -> TableCreateStatement {
    Table::create()
        .table(DynIden::from(table.to_string()))
        .if_not_exists()
        .col(ColumnDef::new("id").big_integer().not_null().primary_key())
        .col(ColumnDef::new("locked_by").string().string_len(255).not_null())
        .col(ColumnDef::new("locked_at").timestamp().not_null())
        .to_owned()
}

/// Acquires and releases the migration lock of one target database
pub struct LockManager<'a> {
    executor: &'a dyn MigrationExecutor,
    table: String,
}

impl<'a> LockManager<'a> {
    /// `table` must be a plain identifier (see [`crate::config::is_identifier`])
    pub fn new(executor: &'a dyn MigrationExecutor, table: impl Into<String>) -> Self {
        Self {
            executor,
            table: table.into(),
        }
    }

    /// Create the lock table if it doesn't exist; safe to call concurrently
    ///
    /// # Errors
    ///
    /// Returns `HistoryStoreUnavailable`; the lock table is engine-owned state
    /// just like history.
    pub fn ensure_table(&self) -> Result<(), MigrationError> {
        create_if_missing(
            self.executor,
            &self.table,
            &render_table(&create_lock_table(&self.table), self.executor.dialect()),
            || table_exists(self.executor, &self.table),
        )
    }

    /// Acquire the lock, waiting up to `timeout`
    ///
    /// `owner` prefixes the owner token so operators can tell holders apart.
    ///
    /// A busy or locked database counts as "held elsewhere": the attempt is
    /// retried on the backoff schedule rather than failing the wait.
    ///
    /// # Errors
    ///
    /// Returns `MigrationError::LockTimeout` if the lock is still held elsewhere
    /// when `timeout` elapses, or `MigrationError::Database` if the insert fails
    /// for any other reason.
    pub fn acquire(
        &self,
        owner: &str,
        timeout: Duration,
        backoff: Backoff,
    ) -> Result<LockHandle, MigrationError> {
        #[cfg(feature = "tracing")]
        let _span = tracing_helpers::acquire_lock_span(timeout.as_secs()).entered();

        let owner_token = format!("{owner}:{}:{}", std::process::id(), uuid::Uuid::new_v4());
        let d = self.executor.dialect();
        let sql = format!(
            "INSERT INTO \"{}\" (id, locked_by, locked_at) VALUES ({}, {}, {}) \
             ON CONFLICT (id) DO NOTHING",
            self.table,
            d.placeholder(1),
            d.placeholder(2),
            d.placeholder(3)
        );

        let start = Instant::now();
        let mut delay = backoff.initial;
        loop {
            let attempt = self.executor.execute(
                &sql,
                &[
                    Value::Int(LOCK_ROW_ID),
                    Value::from(owner_token.as_str()),
                    Value::Timestamp(Utc::now()),
                ],
            );
            match attempt {
                Ok(inserted) if inserted > 0 => {
                    log::debug!("Acquired migration lock as {owner_token}");
                    return Ok(LockHandle { owner_token });
                }
                Ok(_) => log::debug!("Migration lock is held elsewhere; retrying in {delay:?}"),
                Err(e) if e.is_lock_contention() => {
                    log::debug!("Lock table is busy ({e}); retrying in {delay:?}");
                }
                Err(e) => return Err(e.into()),
            }

            let elapsed = start.elapsed();
            if elapsed >= timeout {
                let holder = match self.current() {
                    Ok(Some(record)) => {
                        format!("held by {} since {}", record.locked_by, record.locked_at)
                    }
                    _ => "holder unknown".to_string(),
                };
                return Err(MigrationError::LockTimeout(format!(
                    "not acquired within {timeout:?} ({holder})"
                )));
            }

            may::coroutine::sleep(delay.min(timeout - elapsed));
            delay = delay.saturating_mul(2).min(backoff.max);
        }
    }

    /// Release a lock acquired with [`LockManager::acquire`]
    ///
    /// # Errors
    ///
    /// Returns `LockNotHeld` if the row is gone or belongs to another token,
    /// `Database` if the delete fails.
    pub fn release(&self, handle: LockHandle) -> Result<(), MigrationError> {
        let sql = format!(
            "DELETE FROM \"{}\" WHERE id = {} AND locked_by = {}",
            self.table,
            self.executor.dialect().placeholder(1),
            self.executor.dialect().placeholder(2)
        );
        let deleted = self.executor.execute(
            &sql,
            &[Value::Int(LOCK_ROW_ID), Value::from(handle.owner_token.as_str())],
        )?;
        if deleted == 0 {
            return Err(MigrationError::LockNotHeld(handle.owner_token));
        }
        log::debug!("Released migration lock held by {}", handle.owner_token);
        Ok(())
    }

    /// Delete the lock row whoever holds it; returns whether a row existed
    ///
    /// For operators clearing a lock left by a crashed process. The engine
    /// never calls this.
    ///
    /// # Errors
    ///
    /// Returns `Database` if the delete fails.
    pub fn force_release(&self) -> Result<bool, MigrationError> {
        let sql = format!("DELETE FROM \"{}\"", self.table);
        let deleted = self.executor.execute(&sql, &[])?;
        if deleted > 0 {
            log::warn!("Forcibly released migration lock in {}", self.table);
        }
        Ok(deleted > 0)
    }

    /// Current holder, if any
    ///
    /// # Errors
    ///
    /// Returns `Database` if the table cannot be read.
    pub fn current(&self) -> Result<Option<LockRecord>, MigrationError> {
        let sql = format!(
            "SELECT locked_by, locked_at FROM \"{}\" WHERE id = {}",
            self.table,
            self.executor.dialect().placeholder(1)
        );
        let rows = self.executor.query(&sql, &[Value::Int(LOCK_ROW_ID)])?;
        rows.first()
            .map(LockRecord::from_row)
            .transpose()
            .map_err(MigrationError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sqlite::SqliteExecutor;

    const FAST: Backoff = Backoff {
        initial: Duration::from_millis(5),
        max: Duration::from_millis(20),
    };

    fn manager(db: &SqliteExecutor) -> LockManager<'_> {
        let manager = LockManager::new(db, "changeguard_lock");
        manager.ensure_table().unwrap();
        manager
    }

    #[test]
    fn test_acquire_and_release() {
        let db = SqliteExecutor::open_in_memory().unwrap();
        let locks = manager(&db);

        let handle = locks.acquire("test", Duration::from_secs(1), FAST).unwrap();
        assert!(handle.owner_token().starts_with("test:"));
        let holder = locks.current().unwrap().unwrap();
        assert_eq!(holder.locked_by, handle.owner_token());

        locks.release(handle).unwrap();
        assert!(locks.current().unwrap().is_none());
    }

    #[test]
    fn test_second_acquire_times_out() {
        let db = SqliteExecutor::open_in_memory().unwrap();
        let locks = manager(&db);
        let _held = locks.acquire("first", Duration::from_secs(1), FAST).unwrap();

        let started = Instant::now();
        let err = locks.acquire("second", Duration::from_millis(100), FAST).unwrap_err();
        assert!(matches!(err, MigrationError::LockTimeout(ref m) if m.contains("first:")));
        assert!(started.elapsed() >= Duration::from_millis(100));
        // the holder is untouched
        assert!(locks.current().unwrap().unwrap().locked_by.starts_with("first:"));
    }

    #[test]
    fn test_unbounded_backoff_still_times_out() {
        let db = SqliteExecutor::open_in_memory().unwrap();
        let locks = manager(&db);
        let _held = locks.acquire("first", Duration::from_secs(1), FAST).unwrap();

        let huge = Backoff {
            initial: Duration::MAX,
            max: Duration::MAX,
        };
        let started = Instant::now();
        let err = locks.acquire("second", Duration::from_millis(50), huge).unwrap_err();
        assert!(matches!(err, MigrationError::LockTimeout(_)));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_release_with_stale_handle() {
        let db = SqliteExecutor::open_in_memory().unwrap();
        let locks = manager(&db);
        let handle = locks.acquire("a", Duration::from_secs(1), FAST).unwrap();
        let stale = handle.clone();
        locks.release(handle).unwrap();
        assert!(matches!(locks.release(stale), Err(MigrationError::LockNotHeld(_))));
    }

    #[test]
    fn test_force_release() {
        let db = SqliteExecutor::open_in_memory().unwrap();
        let locks = manager(&db);
        let handle = locks.acquire("crashed", Duration::from_secs(1), FAST).unwrap();
        assert!(locks.force_release().unwrap());
        assert!(!locks.force_release().unwrap());
        assert!(matches!(locks.release(handle), Err(MigrationError::LockNotHeld(_))));
    }

    #[test]
    fn test_owner_tokens_are_unique() {
        let db = SqliteExecutor::open_in_memory().unwrap();
        let locks = manager(&db);
        let a = locks.acquire("same", Duration::from_secs(1), FAST).unwrap();
        let token_a = a.owner_token().to_string();
        locks.release(a).unwrap();
        let b = locks.acquire("same", Duration::from_secs(1), FAST).unwrap();
        assert_ne!(token_a, b.owner_token());
    }
}
