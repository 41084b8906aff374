//! Gathering real single-run stores and querying the result.

#![allow(clippy::unwrap_used, clippy::float_cmp, clippy::indexing_slicing)]

use std::path::{Path, PathBuf};

use rusqlite::Connection;
use rusqlite::types::Value;
use steplog_core::quantities::PushQuantity;
use steplog_core::{Communicator, LogConfig, LogManager, OpenOptions, ThreadCommunicator, WatchOutput, thread_group};
use steplog_db::StoreTarget;
use steplog_query::{FeatureSource, GatherOptions, QueryError, RunDb, SqlType, gather, parse_name_map, scan};
use steplog_types::{ConstantValue, OpenMode, QuantityMeta};

fn quiet() -> OpenOptions {
    OpenOptions::default().with_config(LogConfig {
        watch_output: WatchOutput::Silent,
        ..LogConfig::default()
    })
}

fn record(mgr: &mut LogManager, t: &PushQuantity, values: &[f64]) {
    for value in values {
        t.push(*value).unwrap();
        mgr.tick_before().unwrap();
        mgr.tick_after().unwrap();
    }
}

fn serial_run(path: &Path) {
    let mut mgr = LogManager::open(Some(path), OpenMode::Create, None, quiet()).unwrap();
    mgr.set_constant("dt", 0.1).unwrap();
    let t = PushQuantity::new(QuantityMeta::new("t").with_unit("s"));
    mgr.register_quantity(t.clone(), 1).unwrap();
    record(&mut mgr, &t, &[1.0, 2.0, 3.0]);
    mgr.close().unwrap();
}

fn rank_run(comm: ThreadCommunicator, base: &Path) {
    let value = if comm.rank() == 0 { 1.0 } else { 2.0 };
    let mut mgr = LogManager::open(Some(base), OpenMode::Create, Some(Box::new(comm)), quiet()).unwrap();
    mgr.set_constant("dt", 1_i64).unwrap();
    let t = PushQuantity::new(QuantityMeta::new("t").with_unit("s"));
    mgr.register_quantity(t.clone(), 1).unwrap();
    record(&mut mgr, &t, &[value, value]);
    mgr.close().unwrap();
}

/// One serial run and one two-rank run, in directories whose names carry
/// features.
fn make_runs(root: &Path) -> Vec<PathBuf> {
    let serial_dir = root.join("np1-solverCG");
    let par_dir = root.join("np2-solverGMRES");
    std::fs::create_dir_all(&serial_dir).unwrap();
    std::fs::create_dir_all(&par_dir).unwrap();

    let serial = serial_dir.join("serial.sqlite");
    serial_run(&serial);

    let base = par_dir.join("par.sqlite");
    let handles: Vec<_> = thread_group(2)
        .into_iter()
        .map(|comm| {
            let base = base.clone();
            std::thread::spawn(move || rank_run(comm, &base))
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    vec![serial, par_dir.join("par-rank0.sqlite"), par_dir.join("par-rank1.sqlite")]
}

fn count(conn: &Connection, sql: &str) -> i64 {
    conn.query_row(sql, [], |row| row.get(0)).unwrap()
}

fn run_columns(conn: &Connection) -> Vec<(String, String)> {
    let mut stmt = conn.prepare("SELECT name, type FROM pragma_table_info('runs')").unwrap();
    stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap()
}

#[test]
fn scan_assigns_run_ids_and_widens_features() {
    let dir = tempfile::tempdir().unwrap();
    let paths = make_runs(dir.path());
    let source = FeatureSource::new().with_dir_features().unwrap();
    let scanned = scan(&source, &paths).unwrap();

    let ids: Vec<i64> = scanned.stores.iter().map(|s| s.run_id).collect();
    assert_eq!(ids, [1, 2, 2]);
    assert_eq!(scanned.run_count(), 2);

    let names: Vec<&str> = scanned.features.iter().map(|(n, _)| n.as_str()).collect();
    assert_eq!(&names[..3], ["np", "solver", "dt"]);
    let type_of = |name: &str| scanned.features.iter().find(|(n, _)| n == name).map(|(_, t)| *t);
    assert_eq!(type_of("np"), Some(SqlType::Integer));
    assert_eq!(type_of("solver"), Some(SqlType::Text));
    assert_eq!(type_of("dt"), Some(SqlType::Real));
    assert_eq!(type_of("unique_run_id"), Some(SqlType::Text));
}

#[test]
fn gathering_twice_gives_identical_stores() {
    let dir = tempfile::tempdir().unwrap();
    let paths = make_runs(dir.path());
    let source = FeatureSource::new().with_dir_features().unwrap();
    let scanned = scan(&source, &paths).unwrap();

    let first = dir.path().join("g1.sqlite");
    let second = dir.path().join("g2.sqlite");
    let a = gather(&StoreTarget::File(first.clone()), &source, &scanned, &GatherOptions::default()).unwrap();
    let b = gather(&StoreTarget::File(second), &source, &scanned, &GatherOptions::default()).unwrap();

    for sql in [
        "SELECT count(*) FROM runs",
        "SELECT count(*) FROM t",
        "SELECT count(*) FROM constants",
        "SELECT count(*) FROM quantities",
    ] {
        assert_eq!(count(&a, sql), count(&b, sql), "{sql}");
    }
    assert_eq!(run_columns(&a), run_columns(&b));

    assert_eq!(count(&a, "SELECT count(*) FROM runs"), 2);
    assert_eq!(count(&a, "SELECT count(*) FROM t"), 7);
    assert_eq!(count(&a, "SELECT count(*) FROM t WHERE run_id = 2"), 4);
    assert_eq!(count(&a, "SELECT count(*) FROM constants WHERE name = 'dt'"), 3);
    assert_eq!(count(&a, "SELECT count(*) FROM constants WHERE run_id IS NULL"), 1);
    assert!(run_columns(&a).contains(&("dt".to_owned(), "REAL".to_owned())));

    let (np, solver, dt, filename): (i64, String, f64, String) = a
        .query_row(
            "SELECT np, solver, dt, filename FROM runs WHERE id = 2",
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
        )
        .unwrap();
    assert_eq!((np, solver.as_str(), dt, filename.as_str()), (2, "GMRES", 1.0, "par-rank0.sqlite"));

    let json: String = a
        .query_row(
            "SELECT value FROM constants WHERE run_id = 1 AND name = 'dt'",
            [],
            |row| row.get(0),
        )
        .unwrap();
    assert_eq!(serde_json::from_str::<ConstantValue>(&json).unwrap(), ConstantValue::Real(0.1));

    let unit: String = a
        .query_row("SELECT unit FROM quantities WHERE name = 't'", [], |row| row.get(0))
        .unwrap();
    assert_eq!(unit, "s");

    let again = gather(&StoreTarget::File(first), &source, &scanned, &GatherOptions::default());
    assert!(matches!(again, Err(QueryError::OutputExists { .. })));
}

#[test]
fn quantities_can_be_renamed() {
    let dir = tempfile::tempdir().unwrap();
    let paths = make_runs(dir.path());
    let source = FeatureSource::new();
    let scanned = scan(&source, &paths).unwrap();
    let options = GatherOptions {
        quantity_names: parse_name_map("t=temperature").unwrap(),
        ..GatherOptions::default()
    };
    let conn = gather(&StoreTarget::Memory, &source, &scanned, &options).unwrap();
    assert_eq!(count(&conn, "SELECT count(*) FROM temperature"), 7);
    assert_eq!(count(&conn, "SELECT count(*) FROM quantities WHERE name = 'temperature'"), 1);
}

#[test]
fn magic_queries_over_raw_stores() {
    let dir = tempfile::tempdir().unwrap();
    let paths = make_runs(dir.path());
    let mut db = RunDb::open(&paths, true).unwrap();

    let result = db.query("select id, $t.max where id = 2 order by max_t.step").unwrap();
    assert_eq!(result.columns, ["id", "t"]);
    assert_eq!(
        result.rows,
        vec![
            vec![Value::Integer(2), Value::Real(2.0)],
            vec![Value::Integer(2), Value::Real(2.0)],
        ]
    );

    let result = db.query("select $t where id = 1 order by t.step").unwrap();
    let values: Vec<Value> = result.rows.into_iter().flatten().collect();
    assert_eq!(values, [Value::Real(1.0), Value::Real(2.0), Value::Real(3.0)]);

    let result = db.query("select sqrt(4.0), pow(2, 3)").unwrap();
    assert_eq!(result.rows, vec![vec![Value::Real(2.0), Value::Real(8.0)]]);
}

#[test]
fn auto_gather_input_rules() {
    let dir = tempfile::tempdir().unwrap();
    let paths = make_runs(dir.path());
    let source = FeatureSource::new();
    let scanned = scan(&source, &paths).unwrap();
    let gathered = dir.path().join("all.sqlite");
    let other = dir.path().join("other.sqlite");
    for target in [&gathered, &other] {
        gather(&StoreTarget::File(target.clone()), &source, &scanned, &GatherOptions::default()).unwrap();
    }

    let mut db = RunDb::open(std::slice::from_ref(&gathered), true).unwrap();
    assert_eq!(
        db.query("select count(*) from runs").unwrap().rows,
        vec![vec![Value::Integer(2)]]
    );

    assert!(matches!(
        RunDb::open(&[gathered, other], true),
        Err(QueryError::MultipleGathered { count: 2 })
    ));
    assert!(matches!(
        RunDb::open(&[dir.path().join("missing.sqlite")], true),
        Err(QueryError::NoInputs)
    ));
}
