//! The toy workload: a residual shrinking by a relaxation factor each step,
//! with a little jitter, under a timed "solve".

use std::path::{Path, PathBuf};

use anyhow::{Context, anyhow};
use rand::Rng;
use steplog_core::manager::with_suffix;
use steplog_core::quantities::{IntervalTimer, PushQuantity};
use steplog_core::{CaptureSink, LogConfig, LogError, LogManager, OpenOptions, thread_group};
use steplog_types::{Aggregator, OpenMode, QuantityMeta};
use tracing::{info, warn};

/// Simulation time step.
const DT: f64 = 0.01;

/// Step-to-step residual ratio above which the solver counts as stalled.
const STALL_RATIO: f64 = 0.97;

/// One parameter setting.
#[derive(Debug, Clone)]
pub struct Case {
    /// Directory name; its `-` separated segments become run features.
    pub name: String,
    /// Factor applied to the residual each step.
    pub relax: f64,
    /// Number of ranks.
    pub ranks: u32,
    /// Number of steps.
    pub steps: u64,
}

/// Run one case below `root`, returning the store files it wrote.
pub fn run_case(root: &Path, case: &Case, config: &LogConfig, sink: &CaptureSink) -> anyhow::Result<Vec<PathBuf>> {
    let dir = root.join(&case.name);
    std::fs::create_dir_all(&dir).with_context(|| format!("creating {}", dir.display()))?;
    let base = dir.join("log.sqlite");

    if case.ranks <= 1 {
        let options = OpenOptions::default()
            .with_config(config.clone())
            .with_sink(sink.clone());
        let mut mgr = LogManager::open(Some(&base), OpenMode::Overwrite, None, options)?;
        drive(&mut mgr, case)?;
        mgr.close()?;
        return Ok(vec![base]);
    }

    let handles: Vec<_> = thread_group(case.ranks)
        .into_iter()
        .map(|comm| {
            let base = base.clone();
            let case = case.clone();
            let config = config.clone();
            std::thread::spawn(move || -> Result<(), LogError> {
                let options = OpenOptions::default().with_config(config);
                let mut mgr = LogManager::open(Some(&base), OpenMode::Overwrite, Some(Box::new(comm)), options)?;
                drive(&mut mgr, &case)?;
                mgr.close()
            })
        })
        .collect();
    for handle in handles {
        handle.join().map_err(|_panic| anyhow!("a rank of {} panicked", case.name))??;
    }
    Ok((0..case.ranks)
        .map(|rank| with_suffix(&base, &format!("-rank{rank}")))
        .collect())
}

fn drive(mgr: &mut LogManager, case: &Case) -> Result<(), LogError> {
    mgr.add_run_info()?;
    mgr.set_constant("relax", case.relax)?;
    mgr.add_general_quantities()?;
    mgr.add_simulation_quantities(Some(DT))?;

    let residual = PushQuantity::new(
        QuantityMeta::new("residual")
            .with_description("Solver residual")
            .with_aggregator(Aggregator::Max),
    );
    let t_solve = IntervalTimer::new("t_solve", "Time spent in the solver");
    mgr.register_quantity(residual.clone(), 1)?;
    mgr.register_quantity(t_solve.clone(), 1)?;
    mgr.add_watches([
        ("step", "step.loc"),
        ("t_sim", "t_sim.loc"),
        ("residual", "residual"),
        ("t_step", "t_step.max"),
    ])?;

    let mut rng = rand::rng();
    let mut value = f64::from(mgr.rank()) + 1.0;
    for _ in 0..case.steps {
        residual.push(value)?;
        mgr.tick_before()?;
        {
            let _solve = t_solve.start_sub_timer();
            let next = value * case.relax * rng.random_range(0.95..1.05);
            if next / value > STALL_RATIO {
                mgr.sink().warning("ConvergenceWarning", format!("residual stalled at {next:.3e}"));
            }
            value = next;
        }
        mgr.tick_after()?;
    }

    if value > 1e-3 {
        warn!(case = %case.name, residual = value, "Case ended above tolerance");
    }
    info!(case = %case.name, rank = mgr.rank(), steps = mgr.tick_count(), "Case finished");
    Ok(())
}
