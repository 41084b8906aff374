//! Rank reductions.
//!
//! A [`RankReduction`] says how the per-rank values of one step collapse
//! into the single value an expression sees. Built-in [`Aggregator`]s are
//! computed directly; custom ones are looked up by name in an
//! [`AggregatorRegistry`].

use std::collections::BTreeMap;
use std::sync::Arc;

use steplog_types::Aggregator;

/// A reduction function over per-rank values. Returns `None` for input it
/// cannot reduce (for example an empty slice).
pub type ReduceFn = Arc<dyn Fn(&[f64]) -> Option<f64> + Send + Sync>;

/// Named custom reductions available to expressions.
#[derive(Clone, Default)]
pub struct AggregatorRegistry {
    custom: BTreeMap<String, ReduceFn>,
}

impl core::fmt::Debug for AggregatorRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("AggregatorRegistry")
            .field("custom", &self.custom.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl AggregatorRegistry {
    /// A registry with only the built-in reductions.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) a custom reduction.
    pub fn register<F>(&mut self, name: impl Into<String>, reduce: F)
    where
        F: Fn(&[f64]) -> Option<f64> + Send + Sync + 'static,
    {
        self.custom.insert(name.into(), Arc::new(reduce));
    }

    /// Whether `name` is a registered custom reduction.
    pub fn contains(&self, name: &str) -> bool {
        self.custom.contains_key(name)
    }

    /// Reduce `values` with `aggregator`.
    ///
    /// Unregistered custom aggregators yield `None`.
    pub fn reduce(&self, aggregator: &Aggregator, values: &[f64]) -> Option<f64> {
        if values.is_empty() {
            return None;
        }
        match aggregator {
            Aggregator::Min => values.iter().copied().reduce(f64::min),
            Aggregator::Max => values.iter().copied().reduce(f64::max),
            Aggregator::Sum => Some(values.iter().sum()),
            Aggregator::Avg => {
                #[allow(clippy::cast_precision_loss)]
                let count = values.len() as f64;
                Some(values.iter().sum::<f64>() / count)
            }
            Aggregator::Median => median(values),
            Aggregator::Norm2 => Some(values.iter().map(|v| v * v).sum::<f64>().sqrt()),
            Aggregator::Custom(name) => self.custom.get(name).and_then(|f| f(values)),
        }
    }
}

fn median(values: &[f64]) -> Option<f64> {
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 1 {
        sorted.get(mid).copied()
    } else {
        let upper = sorted.get(mid)?;
        let lower = sorted.get(mid.checked_sub(1)?)?;
        Some((lower + upper) / 2.0)
    }
}

/// How one dependency's per-rank values become one value.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RankReduction {
    /// Single-rank store: take the only value.
    First,
    /// This rank's own value (`.loc`).
    Local,
    /// The value of one specific rank (`[i]`).
    Rank(u32),
    /// Reduce over all ranks.
    Aggregate(Aggregator),
}

impl RankReduction {
    /// Whether evaluation needs values from other ranks.
    pub const fn is_nonlocal(&self) -> bool {
        matches!(self, Self::Rank(_) | Self::Aggregate(_))
    }

    /// Apply to the `(rank, value)` pairs of one step.
    pub fn apply(&self, values: &[(u32, f64)], own_rank: u32, registry: &AggregatorRegistry) -> Option<f64> {
        match self {
            Self::First => values.first().map(|(_, v)| *v),
            Self::Local => values
                .iter()
                .find(|(rank, _)| *rank == own_rank)
                .or_else(|| values.first())
                .map(|(_, v)| *v),
            Self::Rank(wanted) => values
                .iter()
                .find(|(rank, _)| rank == wanted)
                .map(|(_, v)| *v),
            Self::Aggregate(aggregator) => {
                let plain: Vec<f64> = values.iter().map(|(_, v)| *v).collect();
                registry.reduce(aggregator, &plain)
            }
        }
    }
}

impl core::fmt::Display for RankReduction {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::First => f.write_str("first"),
            Self::Local => f.write_str("loc"),
            Self::Rank(rank) => write!(f, "[{rank}]"),
            Self::Aggregate(aggregator) => write!(f, "{aggregator}"),
        }
    }
}
