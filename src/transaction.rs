//! Transaction guard over a [`MigrationExecutor`].
//!
//! Each forward apply (body + history record) and each rollback (rollback body
//! + history deletion) runs inside one `Transaction`. Dropping a transaction
//! that was neither committed nor rolled back issues `ROLLBACK`.

use crate::executor::{DbError, MigrationExecutor, Row, Value};
use std::fmt;

/// Transaction error type
#[derive(Debug)]
pub enum TransactionError {
    /// Error from the executor
    Database(DbError),
    /// Transaction already committed or rolled back
    TransactionClosed,
}

impl fmt::Display for TransactionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransactionError::Database(e) => write!(f, "{}", e),
            TransactionError::TransactionClosed => {
                write!(f, "Transaction has already been committed or rolled back")
            }
        }
    }
}

impl std::error::Error for TransactionError {}

impl From<DbError> for TransactionError {
    fn from(err: DbError) -> Self {
        TransactionError::Database(err)
    }
}

impl From<TransactionError> for DbError {
    fn from(err: TransactionError) -> Self {
        match err {
            TransactionError::Database(e) => e,
            TransactionError::TransactionClosed => DbError::Other("Transaction closed".to_string()),
        }
    }
}

/// An open database transaction
///
/// ```no_run
/// use changeguard::{connect, Transaction, Value};
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let executor = connect("sqlite::memory:")?;
/// let tx = Transaction::begin(executor.as_ref())?;
/// tx.execute("CREATE TABLE users (name TEXT)", &[])?;
/// tx.commit()?;
/// # Ok(())
/// # }
/// ```
pub struct Transaction<'a> {
    executor: &'a dyn MigrationExecutor,
    closed: bool,
}

impl<'a> Transaction<'a> {
    /// Start a transaction on `executor`
    ///
    /// # Errors
    ///
    /// Returns `TransactionError::Database` if `BEGIN` fails.
    pub fn begin(executor: &'a dyn MigrationExecutor) -> Result<Self, TransactionError> {
        executor.execute("BEGIN", &[])?;
        Ok(Self {
            executor,
            closed: false,
        })
    }

    /// The executor this transaction runs on
    pub fn executor(&self) -> &'a dyn MigrationExecutor {
        self.executor
    }

    /// # Errors
    ///
    /// Returns `TransactionClosed` after commit/rollback, otherwise the executor error.
    pub fn execute(&self, sql: &str, params: &[Value]) -> Result<u64, TransactionError> {
        self.check_open()?;
        Ok(self.executor.execute(sql, params)?)
    }

    /// # Errors
    ///
    /// Returns `TransactionClosed` after commit/rollback, otherwise the executor error.
    pub fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>, TransactionError> {
        self.check_open()?;
        Ok(self.executor.query(sql, params)?)
    }

    /// Commit the transaction
    ///
    /// # Errors
    ///
    /// Returns `TransactionError` if already closed or `COMMIT` fails. A failed
    /// commit is followed by a best-effort `ROLLBACK` on drop.
    pub fn commit(mut self) -> Result<(), TransactionError> {
        self.check_open()?;
        self.executor.execute("COMMIT", &[])?;
        self.closed = true;
        Ok(())
    }

    /// Roll the transaction back
    ///
    /// # Errors
    ///
    /// Returns `TransactionError` if already closed or `ROLLBACK` fails.
    pub fn rollback(mut self) -> Result<(), TransactionError> {
        self.check_open()?;
        self.closed = true;
        self.executor.execute("ROLLBACK", &[])?;
        Ok(())
    }

    fn check_open(&self) -> Result<(), TransactionError> {
        if self.closed {
            Err(TransactionError::TransactionClosed)
        } else {
            Ok(())
        }
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if !self.closed {
            if let Err(e) = self.executor.execute("ROLLBACK", &[]) {
                log::warn!("Rollback of abandoned transaction failed: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sqlite::SqliteExecutor;

    fn count(db: &SqliteExecutor) -> i64 {
        db.query("SELECT COUNT(*) FROM t", &[]).unwrap()[0].int(0).unwrap()
    }

    #[test]
    fn test_commit_persists() {
        let db = SqliteExecutor::open_in_memory().unwrap();
        db.execute("CREATE TABLE t (id INTEGER)", &[]).unwrap();
        let tx = Transaction::begin(&db).unwrap();
        tx.execute("INSERT INTO t VALUES (1)", &[]).unwrap();
        tx.commit().unwrap();
        assert_eq!(count(&db), 1);
    }

    #[test]
    fn test_rollback_discards() {
        let db = SqliteExecutor::open_in_memory().unwrap();
        db.execute("CREATE TABLE t (id INTEGER)", &[]).unwrap();
        let tx = Transaction::begin(&db).unwrap();
        tx.execute("INSERT INTO t VALUES (1)", &[]).unwrap();
        tx.rollback().unwrap();
        assert_eq!(count(&db), 0);
    }

    #[test]
    fn test_drop_rolls_back() {
        let db = SqliteExecutor::open_in_memory().unwrap();
        db.execute("CREATE TABLE t (id INTEGER)", &[]).unwrap();
        {
            let tx = Transaction::begin(&db).unwrap();
            tx.execute("INSERT INTO t VALUES (1)", &[]).unwrap();
        }
        assert_eq!(count(&db), 0);
    }

    #[test]
    fn test_ddl_is_transactional() {
        let db = SqliteExecutor::open_in_memory().unwrap();
        let tx = Transaction::begin(&db).unwrap();
        tx.execute("CREATE TABLE t (id INTEGER)", &[]).unwrap();
        tx.rollback().unwrap();
        let rows = db
            .query("SELECT COUNT(*) FROM sqlite_master WHERE name = 't'", &[])
            .unwrap();
        assert_eq!(rows[0].int(0).unwrap(), 0);
    }
}
