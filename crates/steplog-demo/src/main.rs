//! Demo driver for the steplog logger.
//!
//! Runs a toy relaxation solver under a few parameter settings, one of them
//! split across two in-process ranks, then gathers every store into one
//! multi-run store and queries it with magic SQL.
//!
//! # Startup Sequence
//!
//! 1. Initialize structured logging, with a capture layer feeding the log
//! 2. Load configuration from `steplog-config.yaml`
//! 3. Run every case, each in its own feature-named directory
//! 4. Gather the stores into `summary.sqlite`
//! 5. Print the final residual of every run
//!
//! The output directory is the first argument (default `steplog-out`).

mod workload;

use std::path::{Path, PathBuf};

use anyhow::Context;
use steplog_core::{CaptureLayer, CaptureSink, LogConfig};
use steplog_db::StoreTarget;
use steplog_query::{FeatureSource, GatherOptions, RunDb, gather, scan};
use tracing::info;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

use crate::workload::Case;

const CONFIG_FILE: &str = "steplog-config.yaml";

const SUMMARY_QUERY: &str = "select dirname, $residual.max, $t_step.max $$ \
                             where max_residual.step = (select max(step) from residual where run_id = runs.id) \
                             order by id";

fn main() -> anyhow::Result<()> {
    let sink = CaptureSink::new();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_err| EnvFilter::new("info"))),
        )
        .with(CaptureLayer::new(sink.clone()))
        .init();

    info!("steplog-demo starting");

    let config = load_config()?;
    info!(
        watch_interval_secs = config.watch_interval_secs,
        commit_interval = config.commit_interval,
        "Configuration loaded"
    );

    let root = std::env::args()
        .nth(1)
        .map_or_else(|| PathBuf::from("steplog-out"), PathBuf::from);
    std::fs::create_dir_all(&root).with_context(|| format!("creating {}", root.display()))?;

    let cases = [
        Case {
            name: "np1-schemeJacobi-relax0.9".to_owned(),
            relax: 0.9,
            ranks: 1,
            steps: 60,
        },
        Case {
            name: "np1-schemeSOR-relax0.6".to_owned(),
            relax: 0.6,
            ranks: 1,
            steps: 60,
        },
        Case {
            name: "np2-schemeJacobi-relax0.9".to_owned(),
            relax: 0.9,
            ranks: 2,
            steps: 60,
        },
    ];

    let mut stores = Vec::new();
    for case in &cases {
        let written = workload::run_case(&root, case, &config, &sink)?;
        info!(case = %case.name, stores = written.len(), "Case complete");
        stores.extend(written);
    }

    let summary = root.join("summary.sqlite");
    remove_stale(&summary)?;
    let source = FeatureSource::new().with_dir_features()?;
    let scanned = scan(&source, &stores)?;
    let conn = gather(
        &StoreTarget::File(summary.clone()),
        &source,
        &scanned,
        &GatherOptions::default(),
    )?;
    info!(path = %summary.display(), runs = scanned.run_count(), "Summary written");

    let mut db = RunDb::from_connection(conn, true)?;
    let result = db.query(SUMMARY_QUERY)?;
    println!("{result}");

    info!("steplog-demo finished");
    Ok(())
}

/// Load `steplog-config.yaml` if present, defaults otherwise.
fn load_config() -> anyhow::Result<LogConfig> {
    let config_path = Path::new(CONFIG_FILE);
    if config_path.exists() {
        Ok(LogConfig::from_file(config_path)?)
    } else {
        info!("Config file not found, using defaults");
        Ok(LogConfig::default())
    }
}

fn remove_stale(path: &Path) -> anyhow::Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).with_context(|| format!("removing {}", path.display())),
    }
}
