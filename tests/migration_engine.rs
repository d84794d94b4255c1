//! End-to-end migration runs against SQLite

use changeguard::migration::{
    parse, ChangeEntry, ChangeKey, Changelog, ChangelogFormat, Check, ExecType, HistoryStore,
    MigrationError, Migrator, OnFail, Precondition, RunOutcome, RunState,
};
use changeguard::{
    MigrationExecutor, MigrationSettings, MismatchPolicy, SkipPolicy, SqliteExecutor,
};

const EDITED_A: &str = "CREATE TABLE a (id INTEGER PRIMARY KEY, v TEXT)";

fn create(id: &str, seq: i64) -> ChangeEntry {
    ChangeEntry::new(id, "alice", seq, format!("CREATE TABLE {id} (id INTEGER PRIMARY KEY)"))
        .with_rollback(format!("DROP TABLE {id}"))
}

fn migrator(entries: Vec<ChangeEntry>) -> Migrator {
    migrator_with(entries, MigrationSettings::default())
}

fn migrator_with(entries: Vec<ChangeEntry>, settings: MigrationSettings) -> Migrator {
    Migrator::new(Changelog::new(entries).unwrap(), settings)
}

fn key(id: &str) -> ChangeKey {
    ChangeKey::new(id, "alice")
}

fn table_exists(db: &SqliteExecutor, table: &str) -> bool {
    !db.query(
        "SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?1",
        &[table.into()],
    )
    .unwrap()
    .is_empty()
}

fn history(db: &SqliteExecutor) -> Vec<(String, i64, ExecType)> {
    HistoryStore::new(db, "changeguard_history")
        .applied()
        .unwrap()
        .into_iter()
        .map(|r| (r.key.id, r.execution_order, r.exec_type))
        .collect()
}

fn history_checksum(db: &SqliteExecutor) -> String {
    HistoryStore::new(db, "changeguard_history").applied().unwrap()[0]
        .checksum
        .clone()
}

fn failure(outcome: RunOutcome) -> changeguard::migration::RunFailure {
    match outcome {
        RunOutcome::Failed(failure) => failure,
        RunOutcome::Done(report) => panic!("expected a failed run, got {report:?}"),
    }
}

#[test]
fn test_second_run_is_a_no_op() {
    let db = SqliteExecutor::open_in_memory().unwrap();
    let m = migrator(vec![create("a", 1), create("b", 2)]);

    let first = m.migrate(&db).into_result().unwrap();
    assert_eq!(first.applied, vec![key("a"), key("b")]);

    let second = m.migrate(&db).into_result().unwrap();
    assert!(second.applied.is_empty());
    assert_eq!(history(&db).len(), 2);
}

#[test]
fn test_new_entry_gets_next_execution_order() {
    let db = SqliteExecutor::open_in_memory().unwrap();
    migrator(vec![create("a", 1)]).migrate(&db).into_result().unwrap();

    let report = migrator(vec![create("a", 1), create("b", 2)])
        .migrate(&db)
        .into_result()
        .unwrap();
    assert_eq!(report.applied, vec![key("b")]);
    assert_eq!(
        history(&db),
        vec![
            ("a".to_string(), 1, ExecType::Executed),
            ("b".to_string(), 2, ExecType::Executed),
        ]
    );
}

#[test]
fn test_checksum_mismatch_fails_before_anything_runs() {
    let db = SqliteExecutor::open_in_memory().unwrap();
    migrator(vec![create("a", 1)]).migrate(&db).into_result().unwrap();

    let stored = history_checksum(&db);
    let edited = ChangeEntry::new("a", "alice", 1, EDITED_A);
    let failure = failure(migrator(vec![edited, create("c", 2)]).migrate(&db));

    let MigrationError::ChecksumMismatch { key: ref k, stored: ref s, ref current } = failure.error
    else {
        panic!("expected a checksum mismatch, got {}", failure.error);
    };
    assert_eq!(k, &key("a"));
    assert_eq!(s, &stored);
    assert_ne!(current, &stored);
    assert_eq!(failure.failed_entry, Some(key("a")));
    assert!(!failure.trace.contains(&RunState::Applying));
    assert_eq!(
        &failure.trace[failure.trace.len() - 2..],
        &[RunState::Releasing, RunState::Failed]
    );
    assert!(!table_exists(&db, "c"));
    assert_eq!(history(&db).len(), 1);
}

#[test]
fn test_checksum_mismatch_warn_continues() {
    let db = SqliteExecutor::open_in_memory().unwrap();
    migrator(vec![create("a", 1)]).migrate(&db).into_result().unwrap();
    let stored = history_checksum(&db);

    let settings = MigrationSettings {
        on_checksum_mismatch: MismatchPolicy::Warn,
        ..MigrationSettings::default()
    };
    let edited = ChangeEntry::new("a", "alice", 1, EDITED_A);
    let report = migrator_with(vec![edited, create("c", 2)], settings)
        .migrate(&db)
        .into_result()
        .unwrap();

    assert_eq!(report.applied, vec![key("c")]);
    assert_eq!(report.checksum_warnings.len(), 1);
    assert_eq!(report.checksum_warnings[0].stored, stored);
    // The stored checksum is left as it was
    assert_eq!(history_checksum(&db), stored);
}

#[test]
fn test_whitespace_normalization_ignores_reformatting() {
    let db = SqliteExecutor::open_in_memory().unwrap();
    let settings = MigrationSettings {
        normalize_whitespace: true,
        ..MigrationSettings::default()
    };
    migrator_with(vec![create("a", 1)], settings.clone())
        .migrate(&db)
        .into_result()
        .unwrap();

    let reformatted_sql = "CREATE TABLE a\n    (id INTEGER PRIMARY KEY)";
    let reformatted =
        ChangeEntry::new("a", "alice", 1, reformatted_sql).with_rollback("DROP TABLE a");
    let m = migrator_with(vec![reformatted], settings);
    assert!(m.validate(&db).unwrap().is_empty());
    assert!(m.migrate(&db).is_done());
}

#[test]
fn test_precondition_halt_rolls_back_the_run_in_reverse() {
    let db = SqliteExecutor::open_in_memory().unwrap();
    let guarded = create("b", 3).with_precondition(Precondition::new(Check::TableExists {
        table: "never_created".to_string(),
    }));

    let failure = failure(migrator(vec![create("a1", 1), create("a2", 2), guarded]).migrate(&db));

    assert!(matches!(failure.error, MigrationError::PreconditionHalt { .. }));
    assert_eq!(failure.failed_entry, Some(key("b")));
    assert_eq!(failure.rolled_back, vec![key("a2"), key("a1")]);
    assert!(failure.rollback_succeeded);
    assert!(!failure.irreversible);
    assert!(!table_exists(&db, "a1"));
    assert!(!table_exists(&db, "a2"));
    assert!(!table_exists(&db, "b"));
    assert!(history(&db).is_empty());
}

#[test]
fn test_failed_run_keeps_entries_of_earlier_runs() {
    let db = SqliteExecutor::open_in_memory().unwrap();
    migrator(vec![create("p1", 1)]).migrate(&db).into_result().unwrap();

    let guarded = create("b", 4).with_precondition(Precondition::new(Check::TableExists {
        table: "never_created".to_string(),
    }));
    let entries = vec![create("p1", 1), create("x", 2), create("y", 3), guarded];
    let failure = failure(migrator(entries).migrate(&db));

    assert!(matches!(failure.error, MigrationError::PreconditionHalt { .. }));
    assert_eq!(failure.rolled_back, vec![key("y"), key("x")]);
    assert!(failure.rollback_succeeded);
    assert!(table_exists(&db, "p1"));
    assert!(!table_exists(&db, "x"));
    assert!(!table_exists(&db, "y"));
    assert_eq!(history(&db), vec![("p1".to_string(), 1, ExecType::Executed)]);
}

#[test]
fn test_rollback_stops_at_irreversible_entry() {
    let db = SqliteExecutor::open_in_memory().unwrap();
    let permanent = ChangeEntry::new("a1", "alice", 1, "CREATE TABLE a1 (id INTEGER PRIMARY KEY)");
    let broken = ChangeEntry::new("b", "alice", 3, "INSERT INTO missing VALUES (1)");

    let failure = failure(migrator(vec![permanent, create("a2", 2), broken]).migrate(&db));

    assert_eq!(failure.error.kind(), "ExecutionFailed");
    assert_eq!(failure.rolled_back, vec![key("a2")]);
    assert!(failure.irreversible);
    assert!(!failure.rollback_succeeded);
    assert!(matches!(
        failure.rollback_error,
        Some(MigrationError::IrreversibleFailure { .. })
    ));
    assert!(table_exists(&db, "a1"));
    assert!(!table_exists(&db, "a2"));
    assert_eq!(history(&db), vec![("a1".to_string(), 1, ExecType::Executed)]);

    assert_eq!(failure.into_error().kind(), "IrreversibleFailure");
}

#[test]
fn test_skip_is_recorded_as_mark_ran() {
    let db = SqliteExecutor::open_in_memory().unwrap();
    let guarded = || {
        create("b", 2).with_precondition(
            Precondition::new(Check::TableExists {
                table: "later".to_string(),
            })
            .on_fail(OnFail::Skip),
        )
    };

    let report = migrator(vec![create("a", 1), guarded()]).migrate(&db).into_result().unwrap();
    assert_eq!(report.applied, vec![key("a")]);
    assert_eq!(report.skipped.len(), 1);
    assert!(report.skipped[0].recorded);
    assert!(!table_exists(&db, "b"));
    assert_eq!(history(&db)[1], ("b".to_string(), 2, ExecType::MarkRan));

    // Once recorded, the precondition is not evaluated again
    db.execute("CREATE TABLE later (id INTEGER)", &[]).unwrap();
    let report = migrator(vec![create("a", 1), guarded()]).migrate(&db).into_result().unwrap();
    assert!(report.applied.is_empty());
    assert!(!table_exists(&db, "b"));
}

#[test]
fn test_ignored_skip_is_reevaluated() {
    let db = SqliteExecutor::open_in_memory().unwrap();
    let settings = MigrationSettings {
        on_skip: SkipPolicy::Ignore,
        ..MigrationSettings::default()
    };
    let m = migrator_with(
        vec![create("b", 1).with_precondition(
            Precondition::new(Check::TableExists {
                table: "later".to_string(),
            })
            .on_fail(OnFail::Skip),
        )],
        settings,
    );

    let report = m.migrate(&db).into_result().unwrap();
    assert!(!report.skipped[0].recorded);
    assert!(history(&db).is_empty());

    db.execute("CREATE TABLE later (id INTEGER)", &[]).unwrap();
    let report = m.migrate(&db).into_result().unwrap();
    assert_eq!(report.applied, vec![key("b")]);
    assert!(table_exists(&db, "b"));
}

#[test]
fn test_mark_ran_entries_lose_their_record_on_rollback() {
    let db = SqliteExecutor::open_in_memory().unwrap();
    let skipped = create("s", 2).with_precondition(
        Precondition::new(Check::TableExists {
            table: "never_created".to_string(),
        })
        .on_fail(OnFail::Skip),
    );
    let broken = ChangeEntry::new("x", "alice", 3, "INSERT INTO missing VALUES (1)");

    let failure = failure(migrator(vec![create("a", 1), skipped, broken]).migrate(&db));
    assert_eq!(failure.rolled_back, vec![key("s"), key("a")]);
    assert!(failure.rollback_succeeded);
    assert!(history(&db).is_empty());
}

#[test]
fn test_change_executed_sees_entries_of_the_same_run() {
    let db = SqliteExecutor::open_in_memory().unwrap();
    let dependent = create("b", 2).with_precondition(Precondition::new(Check::ChangeExecuted {
        id: "a".to_string(),
        author: "alice".to_string(),
    }));

    let report = migrator(vec![create("a", 1), dependent]).migrate(&db).into_result().unwrap();
    assert_eq!(report.applied, vec![key("a"), key("b")]);
}

#[test]
fn test_rollback_last_reverts_newest_first() {
    let db = SqliteExecutor::open_in_memory().unwrap();
    let m = migrator(vec![create("a", 1), create("b", 2), create("c", 3)]);
    m.migrate(&db).into_result().unwrap();

    let report = m.rollback_last(&db, 2).into_result().unwrap();
    assert_eq!(report.rolled_back, vec![key("c"), key("b")]);
    assert!(table_exists(&db, "a"));
    assert!(!table_exists(&db, "b"));
    assert!(!table_exists(&db, "c"));
    assert_eq!(history(&db), vec![("a".to_string(), 1, ExecType::Executed)]);

    // Reverted entries are pending again
    let report = m.migrate(&db).into_result().unwrap();
    assert_eq!(report.applied, vec![key("b"), key("c")]);
}

#[test]
fn test_rollback_last_checks_reversibility_first() {
    let db = SqliteExecutor::open_in_memory().unwrap();
    let permanent = ChangeEntry::new("a", "alice", 1, "CREATE TABLE a (id INTEGER PRIMARY KEY)");
    let m = migrator(vec![permanent, create("b", 2)]);
    m.migrate(&db).into_result().unwrap();

    let failure = failure(m.rollback_last(&db, 2));
    assert!(matches!(failure.error, MigrationError::IrreversibleFailure { .. }));
    assert!(failure.irreversible);
    assert!(failure.rolled_back.is_empty());
    // Nothing was executed, not even the reversible newer entry
    assert!(table_exists(&db, "b"));
    assert_eq!(history(&db).len(), 2);
}

#[test]
fn test_reordered_changelog_is_not_reapplied() {
    let db = SqliteExecutor::open_in_memory().unwrap();
    migrator(vec![create("a", 1), create("b", 2)]).migrate(&db).into_result().unwrap();

    let report = migrator(vec![create("b", 1), create("a", 2)]).migrate(&db).into_result().unwrap();
    assert!(report.applied.is_empty());
    assert!(report.checksum_warnings.is_empty());
}

#[test]
fn test_formatted_sql_changelog() {
    let db = SqliteExecutor::open_in_memory().unwrap();
    let changelog = parse(
        "\
-- changeguard formatted sql

-- changeset alice:create-users
CREATE TABLE users (id INTEGER PRIMARY KEY, email TEXT NOT NULL);
CREATE INDEX idx_users_email ON users (email);
-- rollback DROP TABLE users;

-- changeset alice:seed-admin
-- precondition-table-exists table:users
INSERT INTO users (email) VALUES ('admin@example.com');
-- rollback DELETE FROM users WHERE email = 'admin@example.com';
",
        ChangelogFormat::FormattedSql,
    )
    .unwrap();
    let m = Migrator::new(changelog, MigrationSettings::default());

    let report = m.migrate(&db).into_result().unwrap();
    assert_eq!(report.applied.len(), 2);
    let rows = db.query("SELECT email FROM users", &[]).unwrap();
    assert_eq!(rows[0].text(0).unwrap(), "admin@example.com");

    let report = m.rollback_last(&db, 2).into_result().unwrap();
    assert_eq!(
        report.rolled_back,
        vec![ChangeKey::new("seed-admin", "alice"), ChangeKey::new("create-users", "alice")]
    );
    assert!(!table_exists(&db, "users"));
}
