//! The tick engine: [`LogManager`].
//!
//! A simulation brackets every step with two calls:
//!
//! 1. **`tick_before`** -- sample due before-phase quantities, let
//!    after-phase quantities snapshot their start state, and flush early
//!    during the first few ticks.
//!
//! 2. **`tick_after`** -- run every quantity's tick hook, sample due
//!    after-phase quantities, flush if enough wall time has passed, print
//!    watches when due, correct the self-timing row, and advance the tick
//!    counter.
//!
//! Calls must alternate strictly: `Idle -> Before -> After -> Idle`. An
//! out-of-order call fails with [`LogError::OutOfOrder`] and leaves the
//! state unchanged.
//!
//! Data points are written into an open transaction and become durable on
//! [`LogManager::save`]. Dropping the manager saves on a best-effort basis;
//! call [`LogManager::close`] to observe errors. Nothing can save on an
//! unmaskable termination signal.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Instant;

use rand::Rng;
use steplog_db::{Access, LogStore, SCHEMA_VERSION, StoreTarget};
use steplog_types::{ConstantValue, OpenMode, Phase, QuantityMeta, RecordKind, RunId, SeriesPoint};
use tracing::{debug, info, warn};

use crate::aggregate::AggregatorRegistry;
use crate::capture::{CaptureSink, unix_now};
use crate::comm::{Communicator, ROOT_RANK, broadcast_as, gather_as};
use crate::config::{LogConfig, WatchOutput};
use crate::error::LogError;
use crate::expr::{DefaultFrontend, ExpressionFrontend};
use crate::quantities::{
    LogUpdateDuration, SimulationTime, StepToStepDuration, TimestepCounter, TimestepDuration, Timestep,
    WallTime,
};
use crate::quantity::{Quantity, SampleContext};
use crate::resolve::{Scope, resolve};
use crate::watch::{DEFAULT_FORMAT, Watch, WatchReport, WatchRequest, render_report};

/// Where the engine is within a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickState {
    /// Between ticks.
    Idle,
    /// `tick_before` done, `tick_after` pending.
    Before,
    /// Inside `tick_after`.
    After,
}

/// Collaborators and settings for [`LogManager::open`].
pub struct OpenOptions {
    /// Engine configuration.
    pub config: LogConfig,
    /// Sink receiving captured warnings and log events. A private sink is
    /// created when `None`.
    pub sink: Option<CaptureSink>,
    /// Expression syntax used by watches and datasets.
    pub frontend: Box<dyn ExpressionFrontend>,
    /// Custom rank reductions available to expressions.
    pub registry: AggregatorRegistry,
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self {
            config: LogConfig::default(),
            sink: None,
            frontend: Box::new(DefaultFrontend),
            registry: AggregatorRegistry::default(),
        }
    }
}

impl core::fmt::Debug for OpenOptions {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("OpenOptions")
            .field("config", &self.config)
            .field("sink", &self.sink)
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

impl OpenOptions {
    /// Options with the given configuration.
    #[must_use]
    pub fn with_config(mut self, config: LogConfig) -> Self {
        self.config = config;
        self
    }

    /// Capture into `sink`.
    #[must_use]
    pub fn with_sink(mut self, sink: CaptureSink) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Parse expressions with `frontend`.
    #[must_use]
    pub fn with_frontend(mut self, frontend: impl ExpressionFrontend + 'static) -> Self {
        self.frontend = Box::new(frontend);
        self
    }

    /// Make custom reductions available.
    #[must_use]
    pub fn with_registry(mut self, registry: AggregatorRegistry) -> Self {
        self.registry = registry;
        self
    }
}

struct GatherDescriptor {
    quantity: Quantity,
    interval: u64,
}

impl GatherDescriptor {
    fn is_due(&self, tick_count: u64) -> bool {
        tick_count.checked_rem(self.interval) == Some(0)
    }
}

/// A diagnostic time-series logger bound to one store.
pub struct LogManager {
    store: LogStore,
    mode: OpenMode,
    config: LogConfig,
    comm: Option<Box<dyn Communicator>>,
    rank: u32,
    size: u32,
    is_parallel: bool,
    sink: CaptureSink,
    frontend: Box<dyn ExpressionFrontend>,
    registry: AggregatorRegistry,

    constants: BTreeMap<String, ConstantValue>,
    quantities: BTreeMap<String, QuantityMeta>,
    before: Vec<GatherDescriptor>,
    after: Vec<GatherDescriptor>,
    last_values: BTreeMap<String, f64>,

    watches: Vec<Watch>,
    have_nonlocal_watches: bool,
    next_watch_tick: u64,
    watch_interval_secs: f64,
    last_watch: Option<WatchReport>,

    tick_count: u64,
    state: TickState,
    t_log: f64,
    start_time: Instant,
    last_save: Instant,
    commit_countdown: u32,
    closed: bool,
}

impl core::fmt::Debug for LogManager {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("LogManager")
            .field("target", self.store.target())
            .field("mode", &self.mode)
            .field("rank", &self.rank)
            .field("size", &self.size)
            .field("tick_count", &self.tick_count)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl LogManager {
    // -----------------------------------------------------------------------
    // Opening
    // -----------------------------------------------------------------------

    /// Open a log store.
    ///
    /// `filename` of `None` keeps the log in memory. With a communicator the
    /// file name gets a `-rank{N}` suffix before its extension and every
    /// rank must call `open` collectively.
    ///
    /// # Errors
    ///
    /// - [`LogError::StoreExists`] in create mode when the store exists.
    /// - [`LogError::StoreNotFound`] in read mode when it does not.
    /// - [`LogError::UniqueNameExhausted`] when no unique name was found.
    /// - [`LogError::Db`], [`LogError::Io`] or [`LogError::Comm`] otherwise.
    pub fn open(
        filename: Option<&Path>,
        mode: OpenMode,
        comm: Option<Box<dyn Communicator>>,
        options: OpenOptions,
    ) -> Result<Self, LogError> {
        let (rank, size) = comm.as_ref().map_or((ROOT_RANK, 1), |c| (c.rank(), c.size()));
        let is_parallel = comm.is_some();
        let timeout = options.config.busy_timeout();

        let base = filename.map(|path| {
            if is_parallel {
                with_suffix(path, &format!("-rank{rank}"))
            } else {
                path.to_path_buf()
            }
        });

        let store = match base {
            None if mode == OpenMode::Read => {
                return Err(LogError::StoreNotFound {
                    path: PathBuf::from(":memory:"),
                });
            }
            None => LogStore::open(StoreTarget::Memory, Access::ReadWrite, timeout)?,
            Some(path) => match mode {
                OpenMode::Read => {
                    if !path.exists() {
                        return Err(LogError::StoreNotFound { path });
                    }
                    let store = LogStore::open(StoreTarget::File(path.clone()), Access::ReadOnly, timeout)?;
                    if !store.has_schema()? {
                        return Err(LogError::StoreNotFound { path });
                    }
                    store
                }
                OpenMode::Create => open_fresh(path, timeout)?,
                OpenMode::Overwrite => {
                    match std::fs::remove_file(&path) {
                        Ok(()) => debug!(path = %path.display(), "Removed existing log store"),
                        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                        Err(source) => return Err(LogError::Io { path, source }),
                    }
                    open_fresh(path, timeout)?
                }
                OpenMode::CreateUnique => open_unique(
                    &path,
                    comm.as_deref(),
                    options.config.unique_suffix_attempts,
                    timeout,
                )?,
            },
        };

        let sink = options.sink.unwrap_or_default();
        sink.set_rank(rank);
        sink.set_step(0);
        let now = Instant::now();
        let mut manager = Self {
            store,
            mode,
            comm,
            rank,
            size,
            is_parallel,
            sink,
            frontend: options.frontend,
            registry: options.registry,
            constants: BTreeMap::new(),
            quantities: BTreeMap::new(),
            before: Vec::new(),
            after: Vec::new(),
            last_values: BTreeMap::new(),
            watches: Vec::new(),
            have_nonlocal_watches: false,
            next_watch_tick: 1,
            watch_interval_secs: options.config.watch_interval_secs,
            last_watch: None,
            tick_count: 0,
            state: TickState::Idle,
            t_log: 0.0,
            start_time: now,
            last_save: now,
            commit_countdown: options.config.commit_interval,
            config: options.config,
            closed: false,
        };

        if mode.is_writable() {
            manager.initialize()?;
            if manager.config.capture_warnings {
                manager.capture_warnings(true);
            }
            if manager.config.capture_logging {
                manager.capture_logging(true);
            }
        } else {
            manager.load()?;
        }

        info!(
            target = ?manager.store.target(),
            mode = %mode,
            rank,
            size,
            quantities = manager.quantities.len(),
            "Opened log"
        );
        Ok(manager)
    }

    /// Set up a new store: schema plus run constants.
    fn initialize(&mut self) -> Result<(), LogError> {
        self.store.initialize_schema()?;
        self.set_constant("schema_version", SCHEMA_VERSION)?;
        self.set_constant("is_parallel", self.is_parallel)?;
        self.set_constant("rank", self.rank)?;
        self.set_constant("rank_count", self.size)?;

        let proposal = (self.rank == ROOT_RANK).then(|| RunId::new().to_string());
        let run_id = match self.comm.as_deref() {
            Some(comm) => broadcast_as(comm, proposal.as_ref())?,
            None => proposal.unwrap_or_default(),
        };
        self.set_constant("unique_run_id", run_id)?;
        self.commit_quietly()?;
        Ok(())
    }

    /// Load constants and quantity metadata from an existing store.
    fn load(&mut self) -> Result<(), LogError> {
        self.constants = self.store.load_constants()?;
        self.quantities = self
            .store
            .load_quantities()?
            .into_iter()
            .map(|meta| (meta.name.clone(), meta))
            .collect();
        self.is_parallel = matches!(self.constants.get("is_parallel"), Some(ConstantValue::Bool(true)));
        if let Some(ConstantValue::Int(rank)) = self.constants.get("rank") {
            self.rank = u32::try_from(*rank).unwrap_or(ROOT_RANK);
        }
        if let Some(ConstantValue::Int(size)) = self.constants.get("rank_count") {
            self.size = u32::try_from(*size).unwrap_or(1);
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    /// Completed tick cycles.
    pub const fn tick_count(&self) -> u64 {
        self.tick_count
    }

    /// Current position within the tick cycle.
    pub const fn state(&self) -> TickState {
        self.state
    }

    /// This process's rank.
    pub const fn rank(&self) -> u32 {
        self.rank
    }

    /// Number of ranks.
    pub const fn size(&self) -> u32 {
        self.size
    }

    /// Whether the store belongs to a distributed run.
    pub const fn is_parallel(&self) -> bool {
        self.is_parallel
    }

    /// The mode the store was opened with.
    pub const fn mode(&self) -> OpenMode {
        self.mode
    }

    /// The store file, if not in memory.
    pub fn path(&self) -> Option<&Path> {
        self.store.target().path()
    }

    /// The underlying store.
    pub const fn store(&self) -> &LogStore {
        &self.store
    }

    /// The capture sink this manager flushes.
    pub const fn sink(&self) -> &CaptureSink {
        &self.sink
    }

    /// Every constant.
    pub const fn constants(&self) -> &BTreeMap<String, ConstantValue> {
        &self.constants
    }

    /// One constant.
    pub fn constant(&self, name: &str) -> Option<&ConstantValue> {
        self.constants.get(name)
    }

    /// Metadata of every registered quantity.
    pub const fn quantities(&self) -> &BTreeMap<String, QuantityMeta> {
        &self.quantities
    }

    /// Metadata of one quantity.
    pub fn quantity_meta(&self, name: &str) -> Option<&QuantityMeta> {
        self.quantities.get(name)
    }

    /// The most recent value recorded for a quantity on this rank.
    pub fn last_value(&self, name: &str) -> Option<f64> {
        self.last_values.get(name).copied()
    }

    /// Registered watches.
    pub fn watches(&self) -> &[Watch] {
        &self.watches
    }

    /// The most recent watch report rendered on this rank.
    pub const fn last_watch_report(&self) -> Option<&WatchReport> {
        self.last_watch.as_ref()
    }

    /// Custom reductions.
    pub const fn registry(&self) -> &AggregatorRegistry {
        &self.registry
    }

    /// Register a custom reduction usable as `quantity.name` in expressions.
    pub fn register_aggregator<F>(&mut self, name: impl Into<String>, reduce: F)
    where
        F: Fn(&[f64]) -> Option<f64> + Send + Sync + 'static,
    {
        self.registry.register(name, reduce);
    }

    pub(crate) fn scope(&self) -> Scope<'_> {
        Scope {
            quantities: &self.quantities,
            constants: &self.constants,
            is_parallel: self.is_parallel,
            registry: &self.registry,
        }
    }

    pub(crate) fn frontend(&self) -> &dyn ExpressionFrontend {
        self.frontend.as_ref()
    }

    // -----------------------------------------------------------------------
    // Registration and constants
    // -----------------------------------------------------------------------

    /// Register a quantity sampled every `interval` ticks.
    ///
    /// All of the quantity's names are registered together or not at all.
    ///
    /// # Errors
    ///
    /// - [`LogError::ReadOnly`] in read mode.
    /// - [`LogError::InvalidInterval`] for an interval of zero.
    /// - [`LogError::DuplicateQuantity`] if any name is already registered.
    /// - [`LogError::Db`] if the store rejects the name.
    pub fn register_quantity(&mut self, quantity: impl Into<Quantity>, interval: u64) -> Result<(), LogError> {
        self.ensure_writable()?;
        let quantity = quantity.into();
        let metas = quantity.metas().to_vec();
        let first = metas.first().map(|m| m.name.clone()).unwrap_or_default();
        if interval == 0 {
            return Err(LogError::InvalidInterval { name: first });
        }
        for (i, meta) in metas.iter().enumerate() {
            let repeated = metas.iter().take(i).any(|m| m.name == meta.name);
            if repeated || self.quantities.contains_key(&meta.name) {
                return Err(LogError::DuplicateQuantity {
                    name: meta.name.clone(),
                });
            }
        }

        self.store.register_quantities(&metas)?;
        for meta in metas {
            debug!(name = %meta.name, interval, phase = ?quantity.phase(), "Registered quantity");
            self.quantities.insert(meta.name.clone(), meta);
        }

        let weight = quantity.sort_weight();
        let list = match quantity.phase() {
            Phase::Before => &mut self.before,
            Phase::After => &mut self.after,
        };
        let position = list
            .iter()
            .position(|gd| gd.quantity.sort_weight() > weight)
            .unwrap_or(list.len());
        list.insert(position, GatherDescriptor { quantity, interval });
        self.metadata_commit()
    }

    /// Set (or overwrite) a constant.
    ///
    /// Overwriting with a value of a different kind is allowed but logged.
    ///
    /// # Errors
    ///
    /// Returns [`LogError::ReadOnly`] in read mode or [`LogError::Db`].
    pub fn set_constant(&mut self, name: &str, value: impl Into<ConstantValue>) -> Result<(), LogError> {
        self.ensure_writable()?;
        let value = value.into();
        if let Some(previous) = self.constants.get(name) {
            if !previous.same_kind(&value) {
                warn!(
                    name,
                    from = previous.kind_name(),
                    to = value.kind_name(),
                    "Constant overwritten with a value of a different kind"
                );
            }
        }
        self.store.upsert_constant(name, &value)?;
        self.constants.insert(name.to_owned(), value);
        self.metadata_commit()
    }

    /// Record the command line, host, date and time as constants.
    ///
    /// # Errors
    ///
    /// Propagates [`LogManager::set_constant`] errors.
    pub fn add_run_info(&mut self) -> Result<(), LogError> {
        let cmdline = std::env::args().collect::<Vec<_>>().join(" ");
        self.set_constant("cmdline", cmdline)?;
        self.set_constant("machine", hostname())?;
        let date = chrono::Local::now().format("%a, %d %b %Y %H:%M:%S %Z").to_string();
        self.set_constant("date", date)?;
        self.set_constant("unixtime", unix_now())
    }

    /// Register `t_step`, `t_2step`, `t_wall`, `t_log` and `step`.
    ///
    /// # Errors
    ///
    /// Propagates [`LogManager::register_quantity`] errors.
    pub fn add_general_quantities(&mut self) -> Result<(), LogError> {
        self.register_quantity(TimestepDuration::default(), 1)?;
        self.register_quantity(StepToStepDuration::default(), 1)?;
        self.register_quantity(WallTime::default(), 1)?;
        self.register_quantity(LogUpdateDuration::default(), 1)?;
        self.register_quantity(TimestepCounter::default(), 1)
    }

    /// Register `t_sim` and `dt`.
    ///
    /// # Errors
    ///
    /// Propagates [`LogManager::register_quantity`] errors.
    pub fn add_simulation_quantities(&mut self, dt: Option<f64>) -> Result<(), LogError> {
        self.register_quantity(SimulationTime::new(dt, 0.0), 1)?;
        self.register_quantity(Timestep::new(dt), 1)
    }

    /// Pass a new simulation time step to every quantity that uses one.
    /// Returns how many quantities took it.
    pub fn set_dt(&mut self, dt: f64) -> usize {
        self.before
            .iter_mut()
            .chain(self.after.iter_mut())
            .filter_map(|gd| gd.quantity.set_dt(dt).then_some(()))
            .count()
    }

    // -----------------------------------------------------------------------
    // Watches
    // -----------------------------------------------------------------------

    /// Add watches printed at the watch cadence.
    ///
    /// # Errors
    ///
    /// Returns [`LogError::Expr`] if any expression fails to resolve; no
    /// watch is added in that case.
    pub fn add_watches<I, W>(&mut self, watches: I) -> Result<(), LogError>
    where
        I: IntoIterator<Item = W>,
        W: Into<WatchRequest>,
    {
        let scope = self.scope();
        let mut compiled = Vec::new();
        for request in watches {
            let request: WatchRequest = request.into();
            let resolved = resolve(self.frontend.as_ref(), &request.expr, &scope)?;
            compiled.push(Watch {
                display: request.display.unwrap_or_else(|| request.expr.clone()),
                format: request.format.unwrap_or_else(|| DEFAULT_FORMAT.to_owned()),
                resolved,
            });
        }
        self.have_nonlocal_watches |= compiled.iter().any(|w| w.resolved.is_nonlocal());
        self.watches.extend(compiled);
        Ok(())
    }

    /// Target seconds between watch prints.
    pub const fn set_watch_interval(&mut self, seconds: f64) {
        self.watch_interval_secs = seconds;
    }

    // -----------------------------------------------------------------------
    // Ticks
    // -----------------------------------------------------------------------

    /// Record before-phase data points for the current tick.
    ///
    /// # Errors
    ///
    /// - [`LogError::OutOfOrder`] unless the engine is idle.
    /// - [`LogError::ReadOnly`] in read mode.
    /// - [`LogError::Db`] or [`LogError::SampleMismatch`] from sampling.
    pub fn tick_before(&mut self) -> Result<(), LogError> {
        self.expect_state(TickState::Idle, "tick_before")?;
        self.ensure_writable()?;
        let tick_start = Instant::now();
        self.sink.set_step(self.tick_count);

        let ctx = SampleContext {
            tick_count: self.tick_count,
            t_log: 0.0,
        };
        let mut samples = Vec::new();
        for gd in &mut self.before {
            if gd.is_due(self.tick_count) {
                samples.extend(gd.quantity.sample(&ctx)?);
            }
        }
        for (name, value) in samples {
            self.insert_datapoint(&name, value)?;
        }
        for gd in &mut self.after {
            gd.quantity.prepare_for_tick();
        }

        if self.tick_count < self.config.early_flush_ticks {
            self.save()?;
        }

        self.t_log = tick_start.elapsed().as_secs_f64();
        self.state = TickState::Before;
        debug!(tick = self.tick_count, "tick_before");
        Ok(())
    }

    /// Record after-phase data points and complete the tick.
    ///
    /// The engine returns to idle even if this fails; the tick counter only
    /// advances on success.
    ///
    /// # Errors
    ///
    /// - [`LogError::OutOfOrder`] unless `tick_before` was called.
    /// - [`LogError::TickOverflow`] if the counter would overflow.
    /// - [`LogError::Db`], [`LogError::Comm`] or
    ///   [`LogError::SampleMismatch`] otherwise.
    pub fn tick_after(&mut self) -> Result<(), LogError> {
        self.expect_state(TickState::Before, "tick_after")?;
        self.state = TickState::After;
        let result = self.complete_tick();
        self.state = TickState::Idle;
        result
    }

    fn complete_tick(&mut self) -> Result<(), LogError> {
        let tick_start = Instant::now();
        let step = self.tick_count;
        let completed = step.checked_add(1).ok_or(LogError::TickOverflow)?;

        for gd in self.before.iter_mut().chain(self.after.iter_mut()) {
            gd.quantity.tick();
        }

        let ctx = SampleContext {
            tick_count: step,
            t_log: self.t_log,
        };
        let mut samples = Vec::new();
        for gd in &mut self.after {
            if gd.is_due(step) {
                samples.extend(gd.quantity.sample(&ctx)?);
            }
        }
        for (name, value) in samples {
            self.insert_datapoint(&name, value)?;
        }

        let runtime = self.start_time.elapsed().as_secs_f64();
        if self.last_save.elapsed().as_secs_f64() > self.config.save_interval(runtime) {
            self.save()?;
        }

        if completed >= self.next_watch_tick {
            self.watch_tick(completed)?;
        }

        self.t_log += tick_start.elapsed().as_secs_f64();
        self.correct_self_timing(step)?;
        self.tick_count = completed;
        Ok(())
    }

    /// Rewrite this tick's self-timing rows with the full engine overhead.
    fn correct_self_timing(&mut self, step: u64) -> Result<(), LogError> {
        let names: Vec<String> = self
            .before
            .iter()
            .chain(self.after.iter())
            .filter(|gd| gd.quantity.is_self_timing() && gd.is_due(step))
            .flat_map(|gd| gd.quantity.names().into_iter().map(str::to_owned))
            .collect();
        for name in names {
            let point = SeriesPoint {
                step,
                rank: self.rank,
                value: self.t_log,
            };
            self.store.update_sample(&name, point)?;
            self.last_values.insert(name, self.t_log);
        }
        Ok(())
    }

    fn insert_datapoint(&mut self, name: &str, value: Option<f64>) -> Result<(), LogError> {
        let Some(value) = value else {
            return Ok(());
        };
        self.last_values.insert(name.to_owned(), value);
        let point = SeriesPoint {
            step: self.tick_count,
            rank: self.rank,
            value,
        };
        self.store.insert_sample(name, point)?;
        Ok(())
    }

    /// Evaluate and print watches, then schedule the next round.
    fn watch_tick(&mut self, completed: u64) -> Result<(), LogError> {
        let collective = self.have_nonlocal_watches && self.comm.is_some();
        let block: BTreeMap<String, f64> = self
            .quantities
            .keys()
            .map(|name| (name.clone(), self.last_values.get(name).copied().unwrap_or(0.0)))
            .collect();

        let gathered = match self.comm.as_deref() {
            Some(comm) if collective => gather_as(comm, &block)?,
            _ => Some(vec![block]),
        };

        if self.rank == ROOT_RANK {
            if let Some(blocks) = gathered {
                self.render_watches(completed, blocks);
            }
        }

        #[allow(clippy::cast_precision_loss)]
        let ticks_per_sec = completed as f64 / self.start_time.elapsed().as_secs_f64().max(1.0);
        let stride = (ticks_per_sec * self.watch_interval_secs).floor();
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let stride = if stride.is_finite() && stride >= 1.0 { stride as u64 } else { 1 };
        let next = completed.saturating_add(stride);

        self.next_watch_tick = match self.comm.as_deref() {
            Some(comm) if collective => {
                let proposal = (self.rank == ROOT_RANK).then_some(next);
                broadcast_as(comm, proposal.as_ref())?
            }
            _ => next,
        };
        Ok(())
    }

    fn render_watches(&mut self, completed: u64, blocks: Vec<BTreeMap<String, f64>>) {
        if self.watches.is_empty() {
            return;
        }
        let mut values: BTreeMap<String, Vec<(u32, f64)>> = BTreeMap::new();
        let single = blocks.len() == 1;
        for (index, block) in blocks.into_iter().enumerate() {
            let rank = if single {
                self.rank
            } else {
                u32::try_from(index).unwrap_or(u32::MAX)
            };
            for (name, value) in block {
                values.entry(name).or_default().push((rank, value));
            }
        }
        let report = render_report(&self.watches, completed, &values, self.rank, &self.registry);
        match self.config.watch_output {
            WatchOutput::Stdout => println!("{}", report.line),
            WatchOutput::Log => info!(target: "steplog::watch", tick = completed, "{}", report.line),
            WatchOutput::Silent => {}
        }
        self.last_watch = Some(report);
    }

    // -----------------------------------------------------------------------
    // Capture
    // -----------------------------------------------------------------------

    /// Switch warning capture. Returns whether the setting changed; a
    /// redundant switch is logged, not an error.
    pub fn capture_warnings(&mut self, enable: bool) -> bool {
        self.set_capture(RecordKind::Warning, enable)
    }

    /// Switch log event capture. Returns whether the setting changed; a
    /// redundant switch is logged, not an error.
    pub fn capture_logging(&mut self, enable: bool) -> bool {
        self.set_capture(RecordKind::Logging, enable)
    }

    fn set_capture(&mut self, kind: RecordKind, enable: bool) -> bool {
        if enable && !self.mode.is_writable() {
            warn!(kind = ?kind, "Capture requested on a read-only log; ignored");
            return false;
        }
        let previous = self.sink.set_enabled(kind, enable);
        if previous == enable {
            if enable {
                warn!(kind = ?kind, "Capture was enabled twice");
            } else {
                warn!(kind = ?kind, "Capture was disabled, but never enabled");
            }
            return false;
        }
        true
    }

    // -----------------------------------------------------------------------
    // Persistence
    // -----------------------------------------------------------------------

    /// Flush captured records and commit.
    ///
    /// A commit blocked by another writer is logged and retried on the next
    /// save; the data stays buffered.
    ///
    /// # Errors
    ///
    /// Returns [`LogError::Db`] for store failures other than lock
    /// contention. Records that failed to insert are kept for the next save.
    pub fn save(&mut self) -> Result<(), LogError> {
        if !self.mode.is_writable() {
            return Ok(());
        }
        for kind in [RecordKind::Warning, RecordKind::Logging] {
            let records = self.sink.drain(kind);
            if records.is_empty() {
                continue;
            }
            if let Err(err) = self.store.insert_records(kind, &records) {
                self.sink.requeue(kind, records);
                return Err(err.into());
            }
        }
        self.commit_quietly()?;
        self.last_save = Instant::now();
        Ok(())
    }

    /// Stop capturing, save, and release the store.
    ///
    /// # Errors
    ///
    /// Propagates [`LogManager::save`] errors.
    pub fn close(mut self) -> Result<(), LogError> {
        self.closed = true;
        self.release_capture();
        let result = self.save();
        info!(target = ?self.store.target(), ticks = self.tick_count, "Closed log");
        result
    }

    fn release_capture(&self) {
        self.sink.set_enabled(RecordKind::Warning, false);
        self.sink.set_enabled(RecordKind::Logging, false);
    }

    fn metadata_commit(&mut self) -> Result<(), LogError> {
        self.commit_countdown = self.commit_countdown.saturating_sub(1);
        if self.commit_countdown == 0 {
            self.commit_countdown = self.config.commit_interval;
            self.commit_quietly()?;
        }
        Ok(())
    }

    fn commit_quietly(&mut self) -> Result<(), LogError> {
        match self.store.commit() {
            Ok(()) => Ok(()),
            Err(err) if err.is_busy() => {
                warn!(error = %err, "Encountered store error during commit; will retry");
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    fn ensure_writable(&self) -> Result<(), LogError> {
        if self.mode.is_writable() {
            Ok(())
        } else {
            Err(LogError::ReadOnly)
        }
    }

    const fn expect_state(&self, expected: TickState, operation: &'static str) -> Result<(), LogError> {
        if matches!(
            (self.state, expected),
            (TickState::Idle, TickState::Idle) | (TickState::Before, TickState::Before)
        ) {
            Ok(())
        } else {
            Err(LogError::OutOfOrder {
                operation,
                state: self.state,
            })
        }
    }
}

impl Drop for LogManager {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        self.release_capture();
        if let Err(err) = self.save() {
            warn!(error = %err, "Failed to save log on drop");
        }
    }
}

// ---------------------------------------------------------------------------
// File naming
// ---------------------------------------------------------------------------

/// Insert `suffix` between the file stem and its extension.
pub fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let mut name = format!("{stem}{suffix}");
    if let Some(ext) = path.extension() {
        name.push('.');
        name.push_str(&ext.to_string_lossy());
    }
    path.with_file_name(name)
}

fn open_fresh(path: PathBuf, timeout: std::time::Duration) -> Result<LogStore, LogError> {
    let store = LogStore::open(StoreTarget::File(path.clone()), Access::ReadWrite, timeout)?;
    if store.has_schema()? {
        return Err(LogError::StoreExists { path });
    }
    Ok(store)
}

/// Pick a timestamped name no rank has used yet. Rank 0 proposes the
/// suffix; all ranks retry together if any rank's candidate exists.
fn open_unique(
    base: &Path,
    comm: Option<&dyn Communicator>,
    attempts: u32,
    timeout: std::time::Duration,
) -> Result<LogStore, LogError> {
    let is_root = comm.is_none_or(|c| c.is_root());
    for _ in 0..attempts {
        let proposal = is_root.then(|| {
            format!(
                "-{}-{:04x}",
                chrono::Local::now().format("%Y%m%d-%H%M%S"),
                rand::rng().random::<u16>()
            )
        });
        let suffix = match comm {
            Some(comm) => broadcast_as(comm, proposal.as_ref())?,
            None => proposal.unwrap_or_default(),
        };
        let candidate = with_suffix(base, &suffix);
        let exists = candidate.exists();
        let any_exists = match comm {
            Some(comm) => {
                let decision = gather_as(comm, &exists)?.map(|flags| flags.contains(&true));
                broadcast_as(comm, decision.as_ref())?
            }
            None => exists,
        };
        if !any_exists {
            return open_fresh(candidate, timeout);
        }
        debug!(candidate = %candidate.display(), "Unique log name taken, retrying");
    }
    Err(LogError::UniqueNameExhausted { attempts })
}

fn hostname() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .or_else(|| {
            std::fs::read_to_string("/etc/hostname")
                .ok()
                .map(|h| h.trim().to_owned())
                .filter(|h| !h.is_empty())
        })
        .unwrap_or_else(|| "unknown".to_owned())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn suffix_goes_before_extension() {
        assert_eq!(
            with_suffix(Path::new("/tmp/run.sqlite"), "-rank3"),
            PathBuf::from("/tmp/run-rank3.sqlite")
        );
        assert_eq!(with_suffix(Path::new("run"), "-x"), PathBuf::from("run-x"));
    }

    #[test]
    fn memory_store_cannot_be_read() {
        let err = LogManager::open(None, OpenMode::Read, None, OpenOptions::default()).unwrap_err();
        assert!(matches!(err, LogError::StoreNotFound { .. }));
    }

    #[test]
    fn new_store_records_run_constants() {
        let mgr = LogManager::open(None, OpenMode::Create, None, OpenOptions::default()).unwrap();
        assert_eq!(
            mgr.constant("schema_version"),
            Some(&ConstantValue::from(SCHEMA_VERSION))
        );
        assert_eq!(mgr.constant("is_parallel"), Some(&ConstantValue::Bool(false)));
        assert_eq!(mgr.constant("rank_count"), Some(&ConstantValue::from(1_u32)));
        let run_id = mgr.constant("unique_run_id").and_then(ConstantValue::as_str).unwrap();
        assert_eq!(run_id.len(), 32);
    }

    #[test]
    fn ticks_must_alternate() {
        let mut mgr = LogManager::open(None, OpenMode::Create, None, OpenOptions::default()).unwrap();
        assert!(matches!(
            mgr.tick_after(),
            Err(LogError::OutOfOrder { state: TickState::Idle, .. })
        ));
        mgr.tick_before().unwrap();
        assert!(matches!(
            mgr.tick_before(),
            Err(LogError::OutOfOrder { state: TickState::Before, .. })
        ));
        mgr.tick_after().unwrap();
        assert_eq!(mgr.tick_count(), 1);
        assert_eq!(mgr.state(), TickState::Idle);
    }

    #[test]
    fn zero_interval_is_rejected() {
        let mut mgr = LogManager::open(None, OpenMode::Create, None, OpenOptions::default()).unwrap();
        assert!(matches!(
            mgr.register_quantity(TimestepCounter::default(), 0),
            Err(LogError::InvalidInterval { .. })
        ));
        assert!(mgr.quantity_meta("step").is_none());
    }

    #[test]
    fn redundant_capture_switch_is_reported_not_fatal() {
        let mut mgr = LogManager::open(None, OpenMode::Create, None, OpenOptions::default()).unwrap();
        assert!(!mgr.capture_warnings(true));
        assert!(mgr.capture_warnings(false));
        assert!(!mgr.capture_warnings(false));
    }

    #[test]
    fn set_dt_reaches_time_step_consumers() {
        let mut mgr = LogManager::open(None, OpenMode::Create, None, OpenOptions::default()).unwrap();
        mgr.add_general_quantities().unwrap();
        mgr.add_simulation_quantities(None).unwrap();
        assert_eq!(mgr.set_dt(0.1), 2);
    }
}
