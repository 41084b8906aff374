//! Built-in quantities.
//!
//! Quantities that the caller feeds while the simulation runs
//! ([`IntervalTimer`], [`EventCounter`], [`PushQuantity`]) are cheap handles:
//! clone one, register the clone, and keep using the original.
//!
//! ```no_run
//! # use steplog_core::{quantities::IntervalTimer, manager::LogManager};
//! # fn demo(mgr: &mut LogManager) -> Result<(), steplog_core::LogError> {
//! let t_solve = IntervalTimer::new("t_solve", "Time spent in the solver");
//! mgr.register_quantity(t_solve.clone(), 1)?;
//! {
//!     let _timer = t_solve.start_sub_timer();
//!     // solve ...
//! }
//! # Ok(())
//! # }
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use steplog_types::QuantityMeta;

use crate::error::LogError;
use crate::quantity::{Quantity, SampleContext, ScalarQuantity};

/// An `f64` shared between handles.
#[derive(Debug, Clone, Default)]
struct SharedF64(Arc<AtomicU64>);

impl SharedF64 {
    fn get(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Acquire))
    }

    fn take(&self) -> f64 {
        f64::from_bits(self.0.swap(0.0_f64.to_bits(), Ordering::AcqRel))
    }

    fn add(&self, delta: f64) {
        // The closure never returns None, so the update cannot fail.
        let _ = self
            .0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |bits| {
                Some((f64::from_bits(bits) + delta).to_bits())
            });
    }
}

fn seconds(meta: QuantityMeta) -> QuantityMeta {
    meta.with_unit("s")
}

// ---------------------------------------------------------------------------
// IntervalTimer
// ---------------------------------------------------------------------------

/// Accumulates time spent in user-delimited intervals during a tick.
///
/// The accumulated time is reported and reset each time the quantity is
/// sampled.
#[derive(Debug, Clone)]
pub struct IntervalTimer {
    meta: QuantityMeta,
    elapsed: SharedF64,
}

impl IntervalTimer {
    /// A timer named `name`, in seconds.
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            meta: seconds(QuantityMeta::new(name)).with_description(description),
            elapsed: SharedF64::default(),
        }
    }

    /// Start timing an interval; the time is added when the guard is
    /// stopped or dropped.
    pub fn start_sub_timer(&self) -> SubTimer {
        SubTimer {
            elapsed: self.elapsed.clone(),
            start: Some(Instant::now()),
        }
    }

    /// Add `seconds` measured elsewhere.
    pub fn add_time(&self, seconds: f64) {
        self.elapsed.add(seconds);
    }

    /// Time accumulated since the last sample.
    pub fn elapsed(&self) -> f64 {
        self.elapsed.get()
    }
}

impl ScalarQuantity for IntervalTimer {
    fn meta(&self) -> &QuantityMeta {
        &self.meta
    }

    fn sample(&mut self, _ctx: &SampleContext) -> Option<f64> {
        Some(self.elapsed.take())
    }
}

impl From<IntervalTimer> for Quantity {
    fn from(q: IntervalTimer) -> Self {
        Self::after(q)
    }
}

/// Guard returned by [`IntervalTimer::start_sub_timer`].
#[derive(Debug)]
pub struct SubTimer {
    elapsed: SharedF64,
    start: Option<Instant>,
}

impl SubTimer {
    /// Stop timing and submit the interval. Further calls do nothing.
    pub fn stop(&mut self) {
        if let Some(start) = self.start.take() {
            self.elapsed.add(start.elapsed().as_secs_f64());
        }
    }
}

impl Drop for SubTimer {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Run `f`, timing it into `timer` and counting `increment` events into
/// `counter`.
pub fn time_and_count<T>(
    timer: &IntervalTimer,
    counter: Option<&EventCounter>,
    increment: u64,
    f: impl FnOnce() -> T,
) -> T {
    if let Some(counter) = counter {
        counter.add(increment);
    }
    let _guard = timer.start_sub_timer();
    f()
}

// ---------------------------------------------------------------------------
// LogUpdateDuration
// ---------------------------------------------------------------------------

/// Time spent inside the tick engine during each tick (`t_log`).
///
/// Sampled before the step; the stored row is corrected at the end of
/// `tick_after` with the full overhead of the tick.
#[derive(Debug, Clone)]
pub struct LogUpdateDuration {
    meta: QuantityMeta,
}

impl LogUpdateDuration {
    /// The quantity under `name`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            meta: seconds(QuantityMeta::new(name)).with_description("Time spent updating the log"),
        }
    }
}

impl Default for LogUpdateDuration {
    fn default() -> Self {
        Self::new("t_log")
    }
}

impl ScalarQuantity for LogUpdateDuration {
    fn meta(&self) -> &QuantityMeta {
        &self.meta
    }

    fn is_self_timing(&self) -> bool {
        true
    }

    fn sample(&mut self, ctx: &SampleContext) -> Option<f64> {
        Some(ctx.t_log)
    }
}

impl From<LogUpdateDuration> for Quantity {
    fn from(q: LogUpdateDuration) -> Self {
        Self::before(q)
    }
}

// ---------------------------------------------------------------------------
// EventCounter
// ---------------------------------------------------------------------------

/// Counts events signalled during each tick. Reset before every tick.
#[derive(Debug, Clone)]
pub struct EventCounter {
    meta: QuantityMeta,
    events: Arc<AtomicU64>,
}

impl EventCounter {
    /// A counter named `name`.
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            meta: QuantityMeta::new(name).with_unit("1").with_description(description),
            events: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Count `n` events.
    pub fn add(&self, n: u64) {
        let _ = self
            .events
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |e| Some(e.saturating_add(n)));
    }

    /// Move all of `other`'s pending events into this counter.
    pub fn transfer(&self, other: &Self) {
        self.add(other.events.swap(0, Ordering::AcqRel));
    }

    /// Events counted so far in this tick.
    pub fn events(&self) -> u64 {
        self.events.load(Ordering::Acquire)
    }
}

impl ScalarQuantity for EventCounter {
    fn meta(&self) -> &QuantityMeta {
        &self.meta
    }

    fn prepare_for_tick(&mut self) {
        self.events.store(0, Ordering::Release);
    }

    fn sample(&mut self, _ctx: &SampleContext) -> Option<f64> {
        #[allow(clippy::cast_precision_loss)]
        let events = self.events() as f64;
        Some(events)
    }
}

impl From<EventCounter> for Quantity {
    fn from(q: EventCounter) -> Self {
        Self::after(q)
    }
}

// ---------------------------------------------------------------------------
// Step and timing quantities
// ---------------------------------------------------------------------------

/// Number of ticks sampled so far (`step`).
#[derive(Debug, Clone)]
pub struct TimestepCounter {
    meta: QuantityMeta,
    steps: u64,
}

impl TimestepCounter {
    /// The counter under `name`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            meta: QuantityMeta::new(name).with_unit("1").with_description("Timesteps"),
            steps: 0,
        }
    }
}

impl Default for TimestepCounter {
    fn default() -> Self {
        Self::new("step")
    }
}

impl ScalarQuantity for TimestepCounter {
    fn meta(&self) -> &QuantityMeta {
        &self.meta
    }

    fn sample(&mut self, _ctx: &SampleContext) -> Option<f64> {
        #[allow(clippy::cast_precision_loss)]
        let steps = self.steps as f64;
        self.steps = self.steps.saturating_add(1);
        Some(steps)
    }
}

impl From<TimestepCounter> for Quantity {
    fn from(q: TimestepCounter) -> Self {
        Self::before(q)
    }
}

/// Time between the starts of consecutive ticks (`t_2step`).
#[derive(Debug, Clone)]
pub struct StepToStepDuration {
    meta: QuantityMeta,
    last_start: Option<Instant>,
    previous_start: Option<Instant>,
}

impl StepToStepDuration {
    /// The quantity under `name`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            meta: seconds(QuantityMeta::new(name)).with_description("Step-to-step duration"),
            last_start: None,
            previous_start: None,
        }
    }
}

impl Default for StepToStepDuration {
    fn default() -> Self {
        Self::new("t_2step")
    }
}

impl ScalarQuantity for StepToStepDuration {
    fn meta(&self) -> &QuantityMeta {
        &self.meta
    }

    fn prepare_for_tick(&mut self) {
        self.previous_start = self.last_start.replace(Instant::now());
    }

    fn sample(&mut self, _ctx: &SampleContext) -> Option<f64> {
        let last = self.last_start?;
        let previous = self.previous_start?;
        Some(last.saturating_duration_since(previous).as_secs_f64())
    }
}

impl From<StepToStepDuration> for Quantity {
    fn from(q: StepToStepDuration) -> Self {
        Self::after(q)
    }
}

/// Duration of each tick, from `tick_before` to the sample in `tick_after`
/// (`t_step`).
///
/// Sorted last so that the engine's own sampling time is included.
#[derive(Debug, Clone)]
pub struct TimestepDuration {
    meta: QuantityMeta,
    start: Option<Instant>,
}

impl TimestepDuration {
    /// Sort weight placing this after ordinary quantities.
    pub const SORT_WEIGHT: i32 = 1000;

    /// The quantity under `name`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            meta: seconds(QuantityMeta::new(name)).with_description("Time step duration"),
            start: None,
        }
    }
}

impl Default for TimestepDuration {
    fn default() -> Self {
        Self::new("t_step")
    }
}

impl ScalarQuantity for TimestepDuration {
    fn meta(&self) -> &QuantityMeta {
        &self.meta
    }

    fn sort_weight(&self) -> i32 {
        Self::SORT_WEIGHT
    }

    fn prepare_for_tick(&mut self) {
        self.start = Some(Instant::now());
    }

    fn sample(&mut self, _ctx: &SampleContext) -> Option<f64> {
        self.start.take().map(|start| start.elapsed().as_secs_f64())
    }
}

impl From<TimestepDuration> for Quantity {
    fn from(q: TimestepDuration) -> Self {
        Self::after(q)
    }
}

/// Wall-clock seconds since the quantity was created (`t_wall`).
#[derive(Debug, Clone)]
pub struct WallTime {
    meta: QuantityMeta,
    start: Instant,
}

impl WallTime {
    /// The quantity under `name`, starting now.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            meta: seconds(QuantityMeta::new(name)).with_description("Wall time"),
            start: Instant::now(),
        }
    }
}

impl Default for WallTime {
    fn default() -> Self {
        Self::new("t_wall")
    }
}

impl ScalarQuantity for WallTime {
    fn meta(&self) -> &QuantityMeta {
        &self.meta
    }

    fn sample(&mut self, _ctx: &SampleContext) -> Option<f64> {
        Some(self.start.elapsed().as_secs_f64())
    }
}

impl From<WallTime> for Quantity {
    fn from(q: WallTime) -> Self {
        Self::before(q)
    }
}

/// Estimated remaining wall time given a total step count (`t_eta`).
#[derive(Debug, Clone)]
pub struct Eta {
    meta: QuantityMeta,
    total_steps: u64,
    steps: u64,
    start: Instant,
}

impl Eta {
    /// Estimate against `total_steps`, under `t_eta`.
    pub fn new(total_steps: u64) -> Self {
        Self::named("t_eta", total_steps)
    }

    /// Estimate against `total_steps`, under `name`.
    pub fn named(name: impl Into<String>, total_steps: u64) -> Self {
        Self {
            meta: seconds(QuantityMeta::new(name)).with_description("Estimated remaining duration"),
            total_steps,
            steps: 0,
            start: Instant::now(),
        }
    }
}

impl ScalarQuantity for Eta {
    fn meta(&self) -> &QuantityMeta {
        &self.meta
    }

    fn sample(&mut self, _ctx: &SampleContext) -> Option<f64> {
        #[allow(clippy::cast_precision_loss)]
        let fraction_done = self.steps as f64 / self.total_steps.max(1) as f64;
        self.steps = self.steps.saturating_add(1);
        let spent = self.start.elapsed().as_secs_f64();
        if fraction_done > 1e-9 {
            Some(spent / fraction_done - spent)
        } else {
            Some(0.0)
        }
    }
}

impl From<Eta> for Quantity {
    fn from(q: Eta) -> Self {
        Self::before(q)
    }
}

// ---------------------------------------------------------------------------
// Simulation time
// ---------------------------------------------------------------------------

/// Simulated time, advanced by the time step on every tick (`t_sim`).
#[derive(Debug, Clone)]
pub struct SimulationTime {
    meta: QuantityMeta,
    dt: Option<f64>,
    t: f64,
}

impl SimulationTime {
    /// Start at `start` with time step `dt` (set later with
    /// `LogManager::set_dt` when `None`).
    pub fn new(dt: Option<f64>, start: f64) -> Self {
        Self {
            meta: seconds(QuantityMeta::new("t_sim")).with_description("Simulation Time"),
            dt,
            t: start,
        }
    }
}

impl ScalarQuantity for SimulationTime {
    fn meta(&self) -> &QuantityMeta {
        &self.meta
    }

    fn tick(&mut self) {
        if let Some(dt) = self.dt {
            self.t += dt;
        }
    }

    fn set_dt(&mut self, dt: f64) -> bool {
        self.dt = Some(dt);
        true
    }

    fn sample(&mut self, _ctx: &SampleContext) -> Option<f64> {
        Some(self.t)
    }
}

impl From<SimulationTime> for Quantity {
    fn from(q: SimulationTime) -> Self {
        Self::before(q)
    }
}

/// The simulation time step (`dt`).
#[derive(Debug, Clone)]
pub struct Timestep {
    meta: QuantityMeta,
    dt: Option<f64>,
}

impl Timestep {
    /// The time step quantity, in seconds.
    pub fn new(dt: Option<f64>) -> Self {
        Self {
            meta: seconds(QuantityMeta::new("dt")).with_description("Simulation Timestep"),
            dt,
        }
    }
}

impl ScalarQuantity for Timestep {
    fn meta(&self) -> &QuantityMeta {
        &self.meta
    }

    fn set_dt(&mut self, dt: f64) -> bool {
        self.dt = Some(dt);
        true
    }

    fn sample(&mut self, _ctx: &SampleContext) -> Option<f64> {
        self.dt
    }
}

impl From<Timestep> for Quantity {
    fn from(q: Timestep) -> Self {
        Self::after(q)
    }
}

// ---------------------------------------------------------------------------
// Adapters
// ---------------------------------------------------------------------------

/// A value pushed by the caller once per tick.
#[derive(Debug, Clone)]
pub struct PushQuantity {
    meta: QuantityMeta,
    value: Arc<Mutex<Option<f64>>>,
}

impl PushQuantity {
    /// An empty push slot described by `meta`.
    pub fn new(meta: QuantityMeta) -> Self {
        Self {
            meta,
            value: Arc::new(Mutex::new(None)),
        }
    }

    /// Provide this tick's value.
    ///
    /// # Errors
    ///
    /// Returns [`LogError::PushedTwice`] if a value is already waiting.
    pub fn push(&self, value: f64) -> Result<(), LogError> {
        let mut slot = self.value.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            return Err(LogError::PushedTwice {
                name: self.meta.name.clone(),
            });
        }
        *slot = Some(value);
        Ok(())
    }
}

impl ScalarQuantity for PushQuantity {
    fn meta(&self) -> &QuantityMeta {
        &self.meta
    }

    fn sample(&mut self, _ctx: &SampleContext) -> Option<f64> {
        self.value.lock().unwrap_or_else(PoisonError::into_inner).take()
    }
}

impl From<PushQuantity> for Quantity {
    fn from(q: PushQuantity) -> Self {
        Self::before(q)
    }
}

/// Adapts a closure into a quantity.
pub struct CallableQuantity<F> {
    meta: QuantityMeta,
    f: F,
}

impl<F> core::fmt::Debug for CallableQuantity<F> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CallableQuantity")
            .field("meta", &self.meta)
            .finish_non_exhaustive()
    }
}

impl<F> CallableQuantity<F>
where
    F: FnMut() -> Option<f64>,
{
    /// Sample by calling `f`.
    pub const fn new(meta: QuantityMeta, f: F) -> Self {
        Self { meta, f }
    }
}

impl<F> ScalarQuantity for CallableQuantity<F>
where
    F: FnMut() -> Option<f64>,
{
    fn meta(&self) -> &QuantityMeta {
        &self.meta
    }

    fn sample(&mut self, _ctx: &SampleContext) -> Option<f64> {
        (self.f)()
    }
}

impl<F> From<CallableQuantity<F>> for Quantity
where
    F: FnMut() -> Option<f64> + 'static,
{
    fn from(q: CallableQuantity<F>) -> Self {
        Self::before(q)
    }
}
