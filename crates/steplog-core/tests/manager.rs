//! Integration tests for the tick engine against real store files.

#![allow(clippy::unwrap_used, clippy::float_cmp, clippy::indexing_slicing)]

use std::path::{Path, PathBuf};

use steplog_core::quantities::{CallableQuantity, EventCounter, PushQuantity};
use steplog_core::{
    CaptureLayer, CaptureSink, Communicator, LogConfig, LogError, LogManager, OpenOptions, TickState, WatchOutput,
    thread_group,
};
use steplog_types::{ConstantValue, OpenMode, QuantityMeta};
use tracing_subscriber::prelude::*;

fn quiet() -> OpenOptions {
    OpenOptions::default().with_config(LogConfig {
        watch_output: WatchOutput::Silent,
        ..LogConfig::default()
    })
}

fn create(path: &Path) -> LogManager {
    LogManager::open(Some(path), OpenMode::Create, None, quiet()).unwrap()
}

fn reopen(path: &Path) -> LogManager {
    LogManager::open(Some(path), OpenMode::Read, None, quiet()).unwrap()
}

fn run_ticks(mgr: &mut LogManager, n: u64) {
    for _ in 0..n {
        mgr.tick_before().unwrap();
        mgr.tick_after().unwrap();
    }
}

fn steps(mgr: &LogManager, name: &str) -> Vec<u64> {
    mgr.table(name).unwrap().iter().map(|p| p.step).collect()
}

#[test]
fn quantities_are_sampled_at_their_interval() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("run.sqlite");
    let mut mgr = create(&path);
    mgr.register_quantity(CallableQuantity::new(QuantityMeta::new("a"), || Some(1.0)), 1)
        .unwrap();
    mgr.register_quantity(CallableQuantity::new(QuantityMeta::new("b"), || Some(2.0)), 2)
        .unwrap();
    run_ticks(&mut mgr, 5);
    assert_eq!(mgr.tick_count(), 5);
    mgr.close().unwrap();

    let mgr = reopen(&path);
    assert_eq!(steps(&mgr, "a"), vec![0, 1, 2, 3, 4]);
    assert_eq!(steps(&mgr, "b"), vec![0, 2, 4]);
}

#[test]
fn general_quantities_record_every_tick() {
    let mut mgr = LogManager::open(None, OpenMode::Create, None, quiet()).unwrap();
    mgr.add_general_quantities().unwrap();
    run_ticks(&mut mgr, 3);

    let counter: Vec<f64> = mgr.table("step").unwrap().iter().map(|p| p.value).collect();
    assert_eq!(counter, vec![0.0, 1.0, 2.0]);
    let t_log = mgr.table("t_log").unwrap();
    assert_eq!(t_log.len(), 3);
    assert!(t_log.iter().all(|p| p.value >= 0.0));
    assert_eq!(steps(&mgr, "t_step"), vec![0, 1, 2]);
    assert_eq!(mgr.last_value("t_log"), Some(t_log[2].value));
}

#[test]
fn after_phase_counters_reset_each_tick() {
    let mut mgr = LogManager::open(None, OpenMode::Create, None, quiet()).unwrap();
    let events = EventCounter::new("n_events", "Events per step");
    mgr.register_quantity(events.clone(), 1).unwrap();

    mgr.tick_before().unwrap();
    events.add(3);
    mgr.tick_after().unwrap();
    mgr.tick_before().unwrap();
    events.add(1);
    mgr.tick_after().unwrap();

    let values: Vec<f64> = mgr.table("n_events").unwrap().iter().map(|p| p.value).collect();
    assert_eq!(values, vec![3.0, 1.0]);
}

#[test]
fn constants_and_metadata_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("constants.sqlite");
    let mut mgr = create(&path);
    mgr.set_constant("dt_target", 0.5).unwrap();
    mgr.set_constant("mesh", "unit_square").unwrap();
    mgr.add_run_info().unwrap();
    mgr.register_quantity(PushQuantity::new(QuantityMeta::new("energy").with_unit("J")), 1)
        .unwrap();
    mgr.close().unwrap();

    let mut mgr = reopen(&path);
    assert_eq!(mgr.constant("dt_target"), Some(&ConstantValue::Real(0.5)));
    assert_eq!(mgr.constant("mesh").and_then(ConstantValue::as_str), Some("unit_square"));
    assert!(mgr.constant("machine").is_some());
    assert!(mgr.constant("date").is_some());
    assert_eq!(mgr.quantity_meta("energy").unwrap().unit.as_deref(), Some("J"));
    assert!(!mgr.is_parallel());

    assert!(matches!(mgr.set_constant("x", 1_i64), Err(LogError::ReadOnly)));
    assert!(matches!(mgr.tick_before(), Err(LogError::ReadOnly)));
    assert_eq!(mgr.state(), TickState::Idle);
}

#[test]
fn duplicate_quantity_is_rejected() {
    let mut mgr = LogManager::open(None, OpenMode::Create, None, quiet()).unwrap();
    mgr.register_quantity(PushQuantity::new(QuantityMeta::new("x")), 1).unwrap();
    let err = mgr
        .register_quantity(PushQuantity::new(QuantityMeta::new("x")), 1)
        .unwrap_err();
    assert!(matches!(err, LogError::DuplicateQuantity { ref name } if name == "x"));
}

#[test]
fn open_modes_guard_existing_files() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("modes.sqlite");

    assert!(matches!(
        LogManager::open(Some(&path), OpenMode::Read, None, quiet()),
        Err(LogError::StoreNotFound { .. })
    ));
    create(&path).close().unwrap();
    assert!(matches!(
        LogManager::open(Some(&path), OpenMode::Create, None, quiet()),
        Err(LogError::StoreExists { .. })
    ));

    let mut mgr = LogManager::open(Some(&path), OpenMode::Overwrite, None, quiet()).unwrap();
    mgr.set_constant("fresh", true).unwrap();
    mgr.close().unwrap();
    assert_eq!(reopen(&path).constant("fresh"), Some(&ConstantValue::Bool(true)));
}

#[test]
fn unique_mode_picks_distinct_names() {
    let dir = tempfile::tempdir().unwrap();
    let base = dir.path().join("run.sqlite");
    let first = LogManager::open(Some(&base), OpenMode::CreateUnique, None, quiet()).unwrap();
    let second = LogManager::open(Some(&base), OpenMode::CreateUnique, None, quiet()).unwrap();

    let a = first.path().unwrap().to_path_buf();
    let b = second.path().unwrap().to_path_buf();
    assert_ne!(a, b);
    for path in [&a, &b] {
        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("run-"));
        assert!(name.ends_with(".sqlite"));
        assert!(path.exists());
    }
    assert!(!base.exists());
}

#[test]
fn failed_tick_after_still_returns_to_idle() {
    let mut mgr = LogManager::open(None, OpenMode::Create, None, quiet()).unwrap();
    mgr.tick_before().unwrap();
    mgr.tick_after().unwrap();
    assert!(matches!(
        mgr.tick_after(),
        Err(LogError::OutOfOrder { operation: "tick_after", .. })
    ));
    assert_eq!(mgr.tick_count(), 1);
}

#[test]
fn local_watches_render_every_due_tick() {
    let config = LogConfig {
        watch_output: WatchOutput::Silent,
        watch_interval_secs: 0.0,
        ..LogConfig::default()
    };
    let mut mgr = LogManager::open(None, OpenMode::Create, None, OpenOptions::default().with_config(config)).unwrap();
    let residual = PushQuantity::new(QuantityMeta::new("residual"));
    mgr.register_quantity(residual.clone(), 1).unwrap();
    mgr.add_watches([("res", "residual"), ("half", "residual/2")]).unwrap();

    residual.push(0.25).unwrap();
    run_ticks(&mut mgr, 1);
    assert_eq!(mgr.last_watch_report().unwrap().line, "res=0.25 | half=0.125");

    residual.push(1e-7).unwrap();
    run_ticks(&mut mgr, 1);
    let report = mgr.last_watch_report().unwrap();
    assert_eq!(report.tick, 2);
    assert_eq!(report.line, "res=1e-07 | half=5e-08");
}

#[test]
fn bad_watch_adds_nothing() {
    let mut mgr = LogManager::open(None, OpenMode::Create, None, quiet()).unwrap();
    mgr.register_quantity(PushQuantity::new(QuantityMeta::new("x")), 1).unwrap();
    assert!(matches!(mgr.add_watches(["x", "y"]), Err(LogError::Expr { .. })));
    assert!(mgr.watches().is_empty());
}

#[test]
fn warnings_and_log_events_are_captured_with_their_step() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("capture.sqlite");
    let sink = CaptureSink::new();
    let subscriber = tracing_subscriber::registry().with(CaptureLayer::new(sink.clone()));

    tracing::subscriber::with_default(subscriber, || {
        let mut mgr = LogManager::open(Some(&path), OpenMode::Create, None, quiet().with_sink(sink.clone())).unwrap();
        run_ticks(&mut mgr, 2);
        mgr.tick_before().unwrap();
        assert!(sink.warning("ConvergenceWarning", "residual stagnated"));
        tracing::warn!(iterations = 40, "solver stalled");
        mgr.tick_after().unwrap();
        mgr.close().unwrap();
    });
    assert!(!sink.warning("ConvergenceWarning", "after close"));

    let mgr = reopen(&path);
    let warnings = mgr.warnings().unwrap();
    assert_eq!(warnings.len(), 1);
    assert_eq!(warnings[0].step, 2);
    assert_eq!(warnings[0].category, "ConvergenceWarning");
    assert!(warnings[0].filename.as_deref().unwrap().ends_with("manager.rs"));

    let logged = mgr.logging_records().unwrap();
    let stalled: Vec<_> = logged.iter().filter(|r| r.message.starts_with("solver stalled")).collect();
    assert_eq!(stalled.len(), 1);
    assert_eq!(stalled[0].category, "WARN");
    assert_eq!(stalled[0].step, 2);
    assert_eq!(stalled[0].message, "solver stalled iterations=40");
}

#[test]
fn drop_saves_pending_data() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("dropped.sqlite");
    {
        let mut mgr = create(&path);
        mgr.register_quantity(CallableQuantity::new(QuantityMeta::new("a"), || Some(1.0)), 1)
            .unwrap();
        run_ticks(&mut mgr, 8);
    }
    assert_eq!(reopen(&path).table("a").unwrap().len(), 8);
}

fn rank_run(comm: steplog_core::ThreadCommunicator, base: PathBuf) -> (u32, Option<String>, ConstantValue) {
    let rank = comm.rank();
    let config = LogConfig {
        watch_output: WatchOutput::Silent,
        watch_interval_secs: 0.0,
        ..LogConfig::default()
    };
    let mut mgr = LogManager::open(
        Some(&base),
        OpenMode::Create,
        Some(Box::new(comm)),
        OpenOptions::default().with_config(config),
    )
    .unwrap();
    let a = PushQuantity::new(QuantityMeta::new("A"));
    mgr.register_quantity(a.clone(), 1).unwrap();
    assert!(matches!(mgr.add_watches(["A"]), Err(LogError::Expr { .. })));
    mgr.add_watches(["A.sum", "A.max", "A[1]"]).unwrap();

    a.push(if rank == 0 { 3.0 } else { 4.0 }).unwrap();
    run_ticks(&mut mgr, 1);

    let line = mgr.last_watch_report().map(|r| r.line.clone());
    let run_id = mgr.constant("unique_run_id").cloned().unwrap();
    assert_eq!(mgr.constant("rank_count"), Some(&ConstantValue::Int(2)));
    mgr.close().unwrap();
    (rank, line, run_id)
}

#[test]
fn distributed_watch_aggregates_across_ranks() {
    let dir = tempfile::tempdir().unwrap();
    let base = dir.path().join("par.sqlite");

    let handles: Vec<_> = thread_group(2)
        .into_iter()
        .map(|comm| {
            let base = base.clone();
            std::thread::spawn(move || rank_run(comm, base))
        })
        .collect();
    let mut results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    results.sort_by_key(|r| r.0);

    assert_eq!(results[0].1.as_deref(), Some("A.sum=7 | A.max=4 | A[1]=4"));
    assert_eq!(results[1].1, None);
    assert_eq!(results[0].2, results[1].2);

    for rank in 0..2 {
        let path = dir.path().join(format!("par-rank{rank}.sqlite"));
        let mgr = reopen(&path);
        assert!(mgr.is_parallel());
        assert_eq!(mgr.rank(), rank);
        assert_eq!(mgr.table("A").unwrap().len(), 1);
    }
}
