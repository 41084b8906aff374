//! Integration tests for the `SQLite` log store against real files.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::float_cmp, clippy::indexing_slicing)]

use std::time::Duration;

use rusqlite::Connection;
use steplog_db::{Access, DbError, LogStore, StoreTarget, upgrade_file};
use steplog_types::{Aggregator, CapturedRecord, ConstantValue, QuantityMeta, RecordKind, SeriesPoint};

fn create_store(path: &std::path::Path) -> LogStore {
    let mut store = LogStore::open(
        StoreTarget::File(path.to_path_buf()),
        Access::ReadWrite,
        Duration::from_millis(0),
    )
    .unwrap();
    store.initialize_schema().unwrap();
    store
}

#[test]
fn reopened_store_returns_what_was_written() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("run.sqlite");
    {
        let mut store = create_store(&path);
        store.upsert_constant("is_parallel", &ConstantValue::Bool(false)).unwrap();
        store.upsert_constant("n", &ConstantValue::Int(1)).unwrap();
        store.upsert_constant("x", &ConstantValue::Real(1.0)).unwrap();
        store
            .register_quantity(
                &QuantityMeta::new("t_step")
                    .with_unit("s")
                    .with_description("Time step duration")
                    .with_aggregator(Aggregator::Max),
            )
            .unwrap();
        for step in 0..3 {
            store
                .insert_sample("t_step", SeriesPoint { step, rank: 0, value: 0.5 })
                .unwrap();
        }
        store
            .insert_records(
                RecordKind::Warning,
                &[CapturedRecord {
                    rank: 0,
                    step: 1,
                    unixtime: 1.5,
                    category: "UserWarning".to_owned(),
                    message: "careful".to_owned(),
                    filename: Some("sim.rs".to_owned()),
                    lineno: Some(12),
                }],
            )
            .unwrap();
        store.commit().unwrap();
    }

    let store = LogStore::open_read(&path).unwrap();
    let constants = store.load_constants().unwrap();
    assert_eq!(constants.get("is_parallel"), Some(&ConstantValue::Bool(false)));
    assert_eq!(constants.get("n"), Some(&ConstantValue::Int(1)));
    assert_eq!(constants.get("x"), Some(&ConstantValue::Real(1.0)));

    let quantities = store.load_quantities().unwrap();
    assert_eq!(quantities.len(), 1);
    assert_eq!(quantities[0].default_aggregator, Some(Aggregator::Max));

    let series = store.read_series("t_step").unwrap();
    assert_eq!(series.iter().map(|p| p.step).collect::<Vec<_>>(), vec![0, 1, 2]);

    let warnings = store.read_records(RecordKind::Warning).unwrap();
    assert_eq!(warnings.len(), 1);
    assert_eq!(warnings[0].message, "careful");
    assert_eq!(warnings[0].lineno, Some(12));
    assert!(store.read_records(RecordKind::Logging).unwrap().is_empty());
}

#[test]
fn read_only_store_rejects_writes() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("run.sqlite");
    create_store(&path).commit().unwrap();

    let mut store = LogStore::open_read(&path).unwrap();
    assert!(store.is_read_only());
    let err = store.upsert_constant("a", &ConstantValue::Int(1)).unwrap_err();
    assert!(matches!(err, DbError::ReadOnly));
}

#[test]
fn uncommitted_writes_are_not_visible_to_other_connections() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("run.sqlite");
    let mut store = create_store(&path);
    store.commit().unwrap();
    store.upsert_constant("a", &ConstantValue::Int(1)).unwrap();
    assert!(store.in_transaction());

    let other = LogStore::open_read(&path).unwrap();
    assert!(other.load_constants().unwrap().is_empty());

    store.commit().unwrap();
    assert_eq!(other.load_constants().unwrap().len(), 1);
}

#[test]
fn busy_commit_is_reported_and_retried() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("run.sqlite");
    let mut store = create_store(&path);
    store.commit().unwrap();

    // A reader holding a shared lock blocks the writer's commit.
    let reader = Connection::open(&path).unwrap();
    reader.execute_batch("BEGIN").unwrap();
    let count: i64 = reader
        .query_row("SELECT count(*) FROM constants", [], |row| row.get(0))
        .unwrap();
    assert_eq!(count, 0);

    store.upsert_constant("a", &ConstantValue::Int(1)).unwrap();
    let err = store.commit().unwrap_err();
    assert!(err.is_busy());
    assert!(store.in_transaction());

    reader.execute_batch("COMMIT").unwrap();
    store.commit().unwrap();
    assert!(!store.in_transaction());
    assert_eq!(
        LogStore::open_read(&path).unwrap().load_constants().unwrap().get("a"),
        Some(&ConstantValue::Int(1))
    );
}

#[test]
fn upgrade_to_suffixed_copy_leaves_original_alone() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("old.sqlite");
    {
        let conn = Connection::open(&path).unwrap();
        conn.execute_batch(
            "CREATE TABLE quantities (name TEXT, unit TEXT, description TEXT, default_aggregator TEXT);
             CREATE TABLE constants (name TEXT, value TEXT);
             CREATE TABLE warnings (step INTEGER, message TEXT, category TEXT, filename TEXT, lineno INTEGER);",
        )
        .unwrap();
    }

    let (copy, report) = upgrade_file(&path, Some("-v4")).unwrap();
    assert_eq!(copy, dir.path().join("old-v4.sqlite"));
    assert_eq!(report.from, 1);
    assert_eq!(report.to, steplog_db::SCHEMA_VERSION);

    let original = Connection::open(&path).unwrap();
    assert_eq!(steplog_db::upgrade::detect_version(&original).unwrap(), 1);

    let (_, second) = upgrade_file(&copy, None).unwrap();
    assert!(!second.changed());
}

#[test]
fn gathered_store_constants_are_normalized() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("summary.sqlite");
    {
        let conn = Connection::open(&path).unwrap();
        conn.execute_batch(
            "CREATE TABLE runs (id INTEGER PRIMARY KEY, dirname TEXT, filename TEXT, dt REAL, machine TEXT);
             INSERT INTO runs VALUES (1, '.', 'a.sqlite', 0.5, 'node1');
             CREATE TABLE quantities (id INTEGER PRIMARY KEY, name TEXT, unit TEXT, description TEXT, rank_aggregator TEXT);
             CREATE TABLE warnings (run_id INTEGER, rank INTEGER, step INTEGER, unixtime REAL, message TEXT, category TEXT, filename TEXT, lineno INTEGER);
             CREATE TABLE logging (run_id INTEGER, rank INTEGER, step INTEGER, unixtime REAL, level TEXT, message TEXT, filename TEXT, lineno INTEGER);",
        )
        .unwrap();
    }

    let (_, report) = upgrade_file(&path, None).unwrap();
    assert_eq!(report.from, 3);

    let conn = Connection::open(&path).unwrap();
    let machine: String = conn
        .query_row(
            "SELECT value FROM constants WHERE run_id = 1 AND name = 'machine'",
            [],
            |row| row.get(0),
        )
        .unwrap();
    let value: ConstantValue = serde_json::from_str(&machine).unwrap();
    assert_eq!(value, ConstantValue::Text("node1".to_owned()));
    assert_eq!(
        steplog_db::upgrade::detect_version(&conn).unwrap(),
        steplog_db::SCHEMA_VERSION
    );
}
