//! The quantity abstraction.
//!
//! A quantity produces one value ([`ScalarQuantity`]) or several named
//! values ([`VectorQuantity`]) per sampled tick. Whether it is sampled in
//! `tick_before` or `tick_after` is fixed when it is wrapped into a
//! [`Quantity`], so the tick engine keeps two ordered lists and never
//! inspects types at runtime.

use steplog_types::{Phase, QuantityMeta};

use crate::error::LogError;

/// What the tick engine knows when it samples a quantity.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SampleContext {
    /// Completed ticks so far; the step the sample is recorded under.
    pub tick_count: u64,
    /// Seconds spent inside the tick engine during the current tick so far.
    pub t_log: f64,
}

/// A producer of one named value per tick.
pub trait ScalarQuantity {
    /// Name, unit, description and default aggregator.
    fn meta(&self) -> &QuantityMeta;

    /// Ordering key within a phase; higher runs later.
    fn sort_weight(&self) -> i32 {
        0
    }

    /// Called on every quantity at the start of `tick_after`.
    fn tick(&mut self) {}

    /// Called on after-phase quantities during `tick_before`.
    fn prepare_for_tick(&mut self) {}

    /// Receive a new simulation time step. Returns whether the quantity
    /// uses it.
    fn set_dt(&mut self, _dt: f64) -> bool {
        false
    }

    /// Whether the stored sample is corrected at the end of the tick with
    /// the final engine overhead.
    fn is_self_timing(&self) -> bool {
        false
    }

    /// The current value. `None` records nothing for this tick.
    fn sample(&mut self, ctx: &SampleContext) -> Option<f64>;
}

/// A producer of several named values per tick.
pub trait VectorQuantity {
    /// One entry per produced value.
    fn metas(&self) -> &[QuantityMeta];

    /// Ordering key within a phase; higher runs later.
    fn sort_weight(&self) -> i32 {
        0
    }

    /// Called on every quantity at the start of `tick_after`.
    fn tick(&mut self) {}

    /// Called on after-phase quantities during `tick_before`.
    fn prepare_for_tick(&mut self) {}

    /// Receive a new simulation time step. Returns whether the quantity
    /// uses it.
    fn set_dt(&mut self, _dt: f64) -> bool {
        false
    }

    /// One value per entry of [`VectorQuantity::metas`], in order.
    fn sample(&mut self, ctx: &SampleContext) -> Vec<Option<f64>>;
}

enum Producer {
    Single(Box<dyn ScalarQuantity>),
    Multi(Box<dyn VectorQuantity>),
}

/// A quantity bound to its sampling phase.
pub struct Quantity {
    phase: Phase,
    producer: Producer,
}

impl core::fmt::Debug for Quantity {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Quantity")
            .field("phase", &self.phase)
            .field("names", &self.names())
            .finish_non_exhaustive()
    }
}

impl Quantity {
    /// Sample `quantity` in `tick_before`.
    pub fn before(quantity: impl ScalarQuantity + 'static) -> Self {
        Self {
            phase: Phase::Before,
            producer: Producer::Single(Box::new(quantity)),
        }
    }

    /// Sample `quantity` in `tick_after`.
    pub fn after(quantity: impl ScalarQuantity + 'static) -> Self {
        Self {
            phase: Phase::After,
            producer: Producer::Single(Box::new(quantity)),
        }
    }

    /// Sample a multi-valued quantity in `tick_before`.
    pub fn before_multi(quantity: impl VectorQuantity + 'static) -> Self {
        Self {
            phase: Phase::Before,
            producer: Producer::Multi(Box::new(quantity)),
        }
    }

    /// Sample a multi-valued quantity in `tick_after`.
    pub fn after_multi(quantity: impl VectorQuantity + 'static) -> Self {
        Self {
            phase: Phase::After,
            producer: Producer::Multi(Box::new(quantity)),
        }
    }

    /// When the quantity is sampled.
    pub const fn phase(&self) -> Phase {
        self.phase
    }

    /// Metadata of every value produced.
    pub fn metas(&self) -> &[QuantityMeta] {
        match &self.producer {
            Producer::Single(q) => core::slice::from_ref(q.meta()),
            Producer::Multi(q) => q.metas(),
        }
    }

    /// Names of every value produced.
    pub fn names(&self) -> Vec<&str> {
        self.metas().iter().map(|m| m.name.as_str()).collect()
    }

    pub(crate) fn sort_weight(&self) -> i32 {
        match &self.producer {
            Producer::Single(q) => q.sort_weight(),
            Producer::Multi(q) => q.sort_weight(),
        }
    }

    pub(crate) fn is_self_timing(&self) -> bool {
        match &self.producer {
            Producer::Single(q) => q.is_self_timing(),
            Producer::Multi(_) => false,
        }
    }

    pub(crate) fn tick(&mut self) {
        match &mut self.producer {
            Producer::Single(q) => q.tick(),
            Producer::Multi(q) => q.tick(),
        }
    }

    pub(crate) fn prepare_for_tick(&mut self) {
        match &mut self.producer {
            Producer::Single(q) => q.prepare_for_tick(),
            Producer::Multi(q) => q.prepare_for_tick(),
        }
    }

    pub(crate) fn set_dt(&mut self, dt: f64) -> bool {
        match &mut self.producer {
            Producer::Single(q) => q.set_dt(dt),
            Producer::Multi(q) => q.set_dt(dt),
        }
    }

    /// Sample every value, paired with its name.
    pub(crate) fn sample(&mut self, ctx: &SampleContext) -> Result<Vec<(String, Option<f64>)>, LogError> {
        match &mut self.producer {
            Producer::Single(q) => {
                let value = q.sample(ctx);
                Ok(vec![(q.meta().name.clone(), value)])
            }
            Producer::Multi(q) => {
                let values = q.sample(ctx);
                let metas = q.metas();
                if values.len() != metas.len() {
                    return Err(LogError::SampleMismatch {
                        name: metas.first().map(|m| m.name.clone()).unwrap_or_default(),
                        expected: metas.len(),
                        got: values.len(),
                    });
                }
                Ok(metas.iter().map(|m| m.name.clone()).zip(values).collect())
            }
        }
    }
}
