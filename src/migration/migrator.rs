//! Migrator - core migration execution engine
//!
//! A run walks `IDLE → LOCKING → PLANNING → APPLYING → COMMITTING → RELEASING →
//! DONE`. When a changeset fails or a precondition halts, the run goes through
//! `ROLLING_BACK` instead of `COMMITTING` and ends in `FAILED`. Each forward
//! apply and each rollback runs in its own transaction together with its
//! history write.

use crate::config::{MigrationSettings, MismatchPolicy, SkipPolicy};
use crate::executor::MigrationExecutor;
use crate::migration::checksum::{compute_checksum, validate_checksum, ChecksumOptions};
use crate::migration::history::HistoryStore;
use crate::migration::lock::{Backoff, LockManager};
use crate::migration::outcome::{RunFailure, RunOutcome, RunReport, RunState, SkippedChange};
use crate::migration::precondition::{self, table_exists, PreconditionOutcome};
use crate::migration::record::{ExecType, HistoryRecord};
use crate::migration::status::{ChecksumDrift, MigrationStatus, PendingChange};
use crate::migration::{ChangeEntry, ChangeKey, Changelog, MigrationError};
use crate::transaction::Transaction;
use chrono::Utc;
use std::collections::{HashMap, HashSet};

#[cfg(feature = "tracing")]
use crate::tracing_helpers;

/// Core migration execution engine
///
/// ```no_run
/// use changeguard::migration::{parse_file, Migrator, RunOutcome};
/// use changeguard::{connect, MigrationSettings};
/// use std::path::Path;
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let executor = connect("sqlite:app.db")?;
/// let changelog = parse_file(Path::new("db.changelog.toml"))?;
/// let migrator = Migrator::new(changelog, MigrationSettings::default());
///
/// match migrator.migrate(executor.as_ref()) {
///     RunOutcome::Done(report) => println!("applied {}", report.applied.len()),
///     RunOutcome::Failed(failure) => eprintln!("{failure}"),
/// }
/// # Ok(())
/// # }
/// ```
pub struct Migrator {
    changelog: Changelog,
    settings: MigrationSettings,
    backoff: Backoff,
}

struct Trace {
    states: Vec<RunState>,
}

impl Trace {
    fn new() -> Self {
        Self {
            states: vec![RunState::Idle],
        }
    }

    fn enter(&mut self, next: RunState) {
        if let Some(previous) = self.states.last() {
            log::debug!("Migration run {previous} -> {next}");
        }
        self.states.push(next);
    }
}

enum Step {
    Executed,
    Skipped { reason: String, recorded: bool },
}

impl Migrator {
    pub fn new(changelog: Changelog, settings: MigrationSettings) -> Self {
        Self {
            changelog,
            settings,
            backoff: Backoff::default(),
        }
    }

    /// Override the lock polling schedule
    #[must_use]
    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn changelog(&self) -> &Changelog {
        &self.changelog
    }

    pub fn settings(&self) -> &MigrationSettings {
        &self.settings
    }

    fn history<'e>(&self, executor: &'e dyn MigrationExecutor) -> HistoryStore<'e> {
        HistoryStore::new(executor, self.settings.history_table.as_str())
    }

    fn locks<'e>(&self, executor: &'e dyn MigrationExecutor) -> LockManager<'e> {
        LockManager::new(executor, self.settings.lock_table.as_str())
    }

    fn checksum(&self, entry: &ChangeEntry) -> String {
        compute_checksum(
            entry,
            ChecksumOptions {
                normalize_whitespace: self.settings.normalize_whitespace,
            },
        )
    }

    /// Apply every pending changeset
    ///
    /// Never panics and never returns early: every failure ends up in
    /// [`RunOutcome::Failed`] with the state trace and the rollback result.
    pub fn migrate(&self, executor: &dyn MigrationExecutor) -> RunOutcome {
        #[cfg(feature = "tracing")]
        let _span = tracing_helpers::migration_run_span(self.changelog.len()).entered();

        log::info!("Starting migration run over {} changeset(s)", self.changelog.len());
        self.locked_run(executor, |trace| self.apply_pending(executor, trace))
    }

    /// Revert the `count` most recently applied changesets, newest first
    ///
    /// Every targeted record must be reversible (a changelog entry with a
    /// rollback body, or a `MARK_RAN` record); otherwise the run fails with
    /// `IrreversibleFailure` before anything executes.
    pub fn rollback_last(&self, executor: &dyn MigrationExecutor, count: usize) -> RunOutcome {
        log::info!("Rolling back the last {count} changeset(s)");
        self.locked_run(executor, |trace| self.revert_latest(executor, count, trace))
    }

    /// Applied, pending, drifted and unknown changesets plus the lock holder
    ///
    /// Read-only: missing engine tables read as empty.
    ///
    /// # Errors
    ///
    /// Returns `HistoryStoreUnavailable` or `Database` if the tables exist but
    /// cannot be read.
    pub fn status(
        &self,
        executor: &dyn MigrationExecutor,
    ) -> Result<MigrationStatus, MigrationError> {
        let records = self.read_history(executor)?;
        let (pending, drifted) = self.plan(&records);

        let known: HashSet<&ChangeKey> = self.changelog.entries().map(ChangeEntry::key).collect();
        let (applied, unknown): (Vec<HistoryRecord>, Vec<HistoryRecord>) =
            records.into_iter().partition(|r| known.contains(&r.key));

        let lock = if table_exists(executor, &self.settings.lock_table)? {
            self.locks(executor).current()?
        } else {
            None
        };

        Ok(MigrationStatus {
            applied,
            pending: pending
                .into_iter()
                .map(|entry| PendingChange {
                    key: entry.key().clone(),
                    sequence_index: entry.sequence_index(),
                    checksum: self.checksum(entry),
                })
                .collect(),
            drifted,
            unknown,
            lock,
        })
    }

    /// Checksum drift of applied changesets, without taking the lock or writing
    ///
    /// # Errors
    ///
    /// See [`Migrator::status`].
    pub fn validate(
        &self,
        executor: &dyn MigrationExecutor,
    ) -> Result<Vec<ChecksumDrift>, MigrationError> {
        let records = self.read_history(executor)?;
        Ok(self.plan(&records).1)
    }

    fn read_history(
        &self,
        executor: &dyn MigrationExecutor,
    ) -> Result<Vec<HistoryRecord>, MigrationError> {
        if table_exists(executor, &self.settings.history_table)? {
            self.history(executor).applied()
        } else {
            Ok(Vec::new())
        }
    }

    /// Pending entries in apply order, and drift of the applied ones
    ///
    /// Identity decides: an applied entry is never pending again, wherever it
    /// moved in the changelog.
    fn plan(&self, records: &[HistoryRecord]) -> (Vec<&ChangeEntry>, Vec<ChecksumDrift>) {
        let by_key: HashMap<&ChangeKey, &HistoryRecord> =
            records.iter().map(|r| (&r.key, r)).collect();
        let mut pending = Vec::new();
        let mut drifted = Vec::new();
        for entry in self.changelog.entries() {
            match by_key.get(entry.key()) {
                Some(record) => {
                    let current = self.checksum(entry);
                    if validate_checksum(entry.key(), &record.checksum, &current).is_err() {
                        drifted.push(ChecksumDrift {
                            key: entry.key().clone(),
                            stored: record.checksum.clone(),
                            current,
                        });
                    }
                }
                None => pending.push(entry),
            }
        }
        (pending, drifted)
    }

    /// Ensure tables, hold the lock around `body`, release on every path
    fn locked_run(
        &self,
        executor: &dyn MigrationExecutor,
        body: impl FnOnce(&mut Trace) -> Result<RunReport, RunFailure>,
    ) -> RunOutcome {
        let mut trace = Trace::new();
        let locks = self.locks(executor);

        let ensured = self.history(executor).ensure_table().and_then(|()| locks.ensure_table());
        if let Err(error) = ensured {
            return finish(trace, Err(RunFailure::new(error, None)));
        }

        trace.enter(RunState::Locking);
        let acquired =
            locks.acquire(&self.settings.lock_owner, self.settings.lock_timeout, self.backoff);
        let handle = match acquired {
            Ok(handle) => handle,
            Err(error) => return finish(trace, Err(RunFailure::new(error, None))),
        };

        let result = body(&mut trace);

        trace.enter(RunState::Releasing);
        if let Err(e) = locks.release(handle) {
            log::error!("Failed to release migration lock: {e}");
        }
        finish(trace, result)
    }

    fn apply_pending(
        &self,
        executor: &dyn MigrationExecutor,
        trace: &mut Trace,
    ) -> Result<RunReport, RunFailure> {
        trace.enter(RunState::Planning);
        let records = self.history(executor).applied().map_err(|e| RunFailure::new(e, None))?;
        let (pending, drifted) = self.plan(&records);

        let mut report = RunReport::default();
        if let Some(first) = drifted.first() {
            match self.settings.on_checksum_mismatch {
                MismatchPolicy::Fail => {
                    validate_checksum(&first.key, &first.stored, &first.current)
                        .map_err(|error| RunFailure::new(error, Some(first.key.clone())))?;
                }
                MismatchPolicy::Warn => {
                    for drift in &drifted {
                        log::warn!(
                            "Changeset '{}' changed after being applied \
                             (stored {}, current {}); continuing",
                            drift.key,
                            drift.stored,
                            drift.current
                        );
                    }
                    report.checksum_warnings = drifted;
                }
            }
        }
        log::info!("{} changeset(s) pending", pending.len());

        trace.enter(RunState::Applying);
        let mut known: HashSet<ChangeKey> = records.into_iter().map(|r| r.key).collect();
        let mut this_run: Vec<(ChangeKey, ExecType)> = Vec::new();

        for entry in pending {
            let key = entry.key().clone();
            match self.step(executor, entry, &known) {
                Ok(Step::Executed) => {
                    report.applied.push(key.clone());
                    this_run.push((key.clone(), ExecType::Executed));
                    known.insert(key);
                }
                Ok(Step::Skipped { reason, recorded }) => {
                    if recorded {
                        this_run.push((key.clone(), ExecType::MarkRan));
                        known.insert(key.clone());
                    }
                    report.skipped.push(SkippedChange { key, reason, recorded });
                }
                Err(error) => {
                    log::error!("Changeset '{key}' failed: {error}");
                    let mut failure = RunFailure::new(error, Some(key));
                    trace.enter(RunState::RollingBack);
                    self.roll_back(executor, &this_run, &mut failure);
                    return Err(failure);
                }
            }
        }

        trace.enter(RunState::Committing);
        log::info!(
            "Applied {} changeset(s), skipped {}",
            report.applied.len(),
            report.skipped.len()
        );
        Ok(report)
    }

    fn step(
        &self,
        executor: &dyn MigrationExecutor,
        entry: &ChangeEntry,
        known: &HashSet<ChangeKey>,
    ) -> Result<Step, MigrationError> {
        match precondition::evaluate(entry.preconditions(), executor, known)? {
            PreconditionOutcome::Proceed => {
                self.apply_entry(executor, entry)?;
                Ok(Step::Executed)
            }
            PreconditionOutcome::Skip { reason } => {
                let recorded = self.settings.on_skip == SkipPolicy::Record;
                if recorded {
                    self.mark_ran(executor, entry)?;
                }
                log::info!("Skipped changeset '{}': {reason}", entry.key());
                Ok(Step::Skipped { reason, recorded })
            }
            PreconditionOutcome::Halt { reason } => Err(MigrationError::PreconditionHalt {
                key: entry.key().clone(),
                reason,
            }),
        }
    }

    fn apply_entry(
        &self,
        executor: &dyn MigrationExecutor,
        entry: &ChangeEntry,
    ) -> Result<(), MigrationError> {
        #[cfg(feature = "tracing")]
        let _span = tracing_helpers::apply_changeset_span(entry.id(), entry.author()).entered();

        let key = entry.key();
        let statements = entry.forward_statements()?;
        let checksum = self.checksum(entry);

        let tx = Transaction::begin(executor)?;
        for statement in &statements {
            tx.execute(statement, &[]).map_err(|e| MigrationError::ExecutionFailed {
                key: key.clone(),
                error: e.to_string(),
            })?;
        }
        self.history(executor).record(key, &checksum, Utc::now(), ExecType::Executed)?;
        tx.commit()?;

        log::info!("Applied changeset '{key}'");
        Ok(())
    }

    fn mark_ran(
        &self,
        executor: &dyn MigrationExecutor,
        entry: &ChangeEntry,
    ) -> Result<(), MigrationError> {
        let tx = Transaction::begin(executor)?;
        self.history(executor)
            .record(entry.key(), &self.checksum(entry), Utc::now(), ExecType::MarkRan)?;
        tx.commit()?;
        Ok(())
    }

    /// Undo one history record: rollback body (if executed) + record deletion
    fn revert(
        &self,
        executor: &dyn MigrationExecutor,
        key: &ChangeKey,
        exec_type: ExecType,
    ) -> Result<(), MigrationError> {
        #[cfg(feature = "tracing")]
        let _span = tracing_helpers::rollback_changeset_span(&key.id, &key.author).entered();

        let statements = match exec_type {
            ExecType::MarkRan => Vec::new(),
            ExecType::Executed => self
                .changelog
                .get(key)
                .map(ChangeEntry::rollback_statements)
                .transpose()?
                .flatten()
                .ok_or_else(|| MigrationError::IrreversibleFailure { key: key.clone() })?,
        };

        let tx = Transaction::begin(executor)?;
        for statement in &statements {
            tx.execute(statement, &[]).map_err(|e| MigrationError::ExecutionFailed {
                key: key.clone(),
                error: e.to_string(),
            })?;
        }
        self.history(executor).remove(key)?;
        tx.commit()?;

        log::info!("Rolled back changeset '{key}'");
        Ok(())
    }

    /// Revert this run's entries, newest first, stopping at the first that can't be
    fn roll_back(
        &self,
        executor: &dyn MigrationExecutor,
        this_run: &[(ChangeKey, ExecType)],
        failure: &mut RunFailure,
    ) {
        for (key, exec_type) in this_run.iter().rev() {
            match self.revert(executor, key, *exec_type) {
                Ok(()) => failure.rolled_back.push(key.clone()),
                Err(error) => {
                    failure.rollback_succeeded = false;
                    failure.irreversible =
                        matches!(error, MigrationError::IrreversibleFailure { .. });
                    log::error!("Rollback stopped at changeset '{key}': {error}");
                    failure.rollback_error = Some(error);
                    return;
                }
            }
        }
    }

    fn revert_latest(
        &self,
        executor: &dyn MigrationExecutor,
        count: usize,
        trace: &mut Trace,
    ) -> Result<RunReport, RunFailure> {
        trace.enter(RunState::Planning);
        let records = self.history(executor).applied().map_err(|e| RunFailure::new(e, None))?;
        let targets: Vec<&HistoryRecord> = records.iter().rev().take(count).collect();

        for record in &targets {
            let reversible = record.exec_type == ExecType::MarkRan
                || self
                    .changelog
                    .get(&record.key)
                    .is_some_and(|e| e.rollback_body().is_some());
            if !reversible {
                let mut failure = RunFailure::new(
                    MigrationError::IrreversibleFailure {
                        key: record.key.clone(),
                    },
                    Some(record.key.clone()),
                );
                failure.irreversible = true;
                failure.rollback_succeeded = false;
                return Err(failure);
            }
        }

        trace.enter(RunState::RollingBack);
        let mut report = RunReport::default();
        for record in targets {
            if let Err(error) = self.revert(executor, &record.key, record.exec_type) {
                let mut failure = RunFailure::new(error, Some(record.key.clone()));
                failure.rolled_back = report.rolled_back;
                failure.rollback_succeeded = false;
                return Err(failure);
            }
            report.rolled_back.push(record.key.clone());
        }

        trace.enter(RunState::Committing);
        Ok(report)
    }
}

fn finish(mut trace: Trace, result: Result<RunReport, RunFailure>) -> RunOutcome {
    match result {
        Ok(mut report) => {
            trace.enter(RunState::Done);
            report.trace = trace.states;
            log::info!("Migration run finished");
            RunOutcome::Done(report)
        }
        Err(mut failure) => {
            trace.enter(RunState::Failed);
            failure.trace = trace.states;
            log::error!("Migration run failed: {failure}");
            RunOutcome::Failed(failure)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sqlite::SqliteExecutor;

    fn migrator(entries: Vec<ChangeEntry>) -> Migrator {
        Migrator::new(Changelog::new(entries).unwrap(), MigrationSettings::default())
    }

    fn create(id: &str, seq: i64) -> ChangeEntry {
        ChangeEntry::new(id, "alice", seq, format!("CREATE TABLE {id} (id INTEGER)"))
            .with_rollback(format!("DROP TABLE {id}"))
    }

    #[test]
    fn test_done_trace() {
        let db = SqliteExecutor::open_in_memory().unwrap();
        let outcome = migrator(vec![create("a", 1)]).migrate(&db);
        assert_eq!(
            outcome.trace(),
            &[
                RunState::Idle,
                RunState::Locking,
                RunState::Planning,
                RunState::Applying,
                RunState::Committing,
                RunState::Releasing,
                RunState::Done,
            ]
        );
    }

    #[test]
    fn test_failed_trace_goes_through_rollback() {
        let db = SqliteExecutor::open_in_memory().unwrap();
        let broken = ChangeEntry::new("b", "alice", 2, "INSERT INTO missing VALUES (1)");
        let outcome = migrator(vec![create("a", 1), broken]).migrate(&db);
        let RunOutcome::Failed(failure) = outcome else {
            panic!("expected failure");
        };
        assert_eq!(failure.error.kind(), "ExecutionFailed");
        assert_eq!(failure.failed_entry, Some(ChangeKey::new("b", "alice")));
        assert_eq!(failure.rolled_back, vec![ChangeKey::new("a", "alice")]);
        assert!(failure.rollback_succeeded);
        assert_eq!(
            &failure.trace[failure.trace.len() - 3..],
            &[RunState::RollingBack, RunState::Releasing, RunState::Failed]
        );
    }

    #[test]
    fn test_status_on_fresh_database_reads_empty() {
        let db = SqliteExecutor::open_in_memory().unwrap();
        let m = migrator(vec![create("a", 1), create("b", 2)]);
        let status = m.status(&db).unwrap();
        assert!(status.applied.is_empty());
        assert_eq!(status.pending.len(), 2);
        assert!(status.lock.is_none());
        // status does not create engine tables
        assert!(!table_exists(&db, "changeguard_history").unwrap());
    }

    #[test]
    fn test_status_reports_unknown_and_drift() {
        let db = SqliteExecutor::open_in_memory().unwrap();
        assert!(migrator(vec![create("a", 1), create("gone", 2)]).migrate(&db).is_done());

        let edited = ChangeEntry::new("a", "alice", 1, "CREATE TABLE a (id INTEGER, v TEXT)");
        let m = migrator(vec![edited, create("c", 3)]);
        let status = m.status(&db).unwrap();
        assert_eq!(status.applied.len(), 1);
        assert_eq!(status.unknown[0].key, ChangeKey::new("gone", "alice"));
        assert_eq!(status.drifted[0].key, ChangeKey::new("a", "alice"));
        assert_eq!(status.pending[0].key, ChangeKey::new("c", "alice"));
        assert_eq!(m.validate(&db).unwrap().len(), 1);
    }

    #[test]
    fn test_lock_is_released_after_failure() {
        let db = SqliteExecutor::open_in_memory().unwrap();
        let broken = ChangeEntry::new("b", "alice", 1, "INSERT INTO missing VALUES (1)");
        let m = migrator(vec![broken]);
        assert!(!m.migrate(&db).is_done());
        assert!(m.status(&db).unwrap().lock.is_none());
    }
}
