//! Core record types: quantity metadata, constants, captured records and
//! time-series points.

use serde::{Deserialize, Serialize};

use crate::enums::Aggregator;

// ---------------------------------------------------------------------------
// Quantity metadata
// ---------------------------------------------------------------------------

/// Descriptive metadata of one logged quantity.
///
/// One row of the `quantities` table. The name doubles as the name of the
/// quantity's own `(step, rank, value)` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuantityMeta {
    /// Unique name within a store.
    pub name: String,
    /// Unit as an algebraic expression (`s`, `m/s`, `1`), if known.
    pub unit: Option<String>,
    /// Human-readable description.
    pub description: Option<String>,
    /// Reduction used when an expression names the quantity without a suffix.
    pub default_aggregator: Option<Aggregator>,
}

impl QuantityMeta {
    /// Metadata with only a name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            unit: None,
            description: None,
            default_aggregator: None,
        }
    }

    /// Set the unit.
    #[must_use]
    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = Some(unit.into());
        self
    }

    /// Set the description.
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Set the default rank aggregator.
    #[must_use]
    pub fn with_aggregator(mut self, aggregator: Aggregator) -> Self {
        self.default_aggregator = Some(aggregator);
        self
    }
}

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Value of a run constant.
///
/// Serialized with an explicit type tag so that a stored `1` comes back as an
/// integer and a stored `true` as a boolean.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum ConstantValue {
    /// No value.
    Null,
    /// A flag.
    Bool(bool),
    /// An integer.
    Int(i64),
    /// A floating point number.
    Real(f64),
    /// Free text.
    Text(String),
}

impl ConstantValue {
    /// Numeric view used when the constant appears inside an expression.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            #[allow(clippy::cast_precision_loss)]
            Self::Int(i) => Some(*i as f64),
            Self::Real(r) => Some(*r),
            Self::Null | Self::Text(_) => None,
        }
    }

    /// Text view, if the value is text.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Short name of the variant, used in diagnostics.
    pub const fn kind_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Real(_) => "real",
            Self::Text(_) => "text",
        }
    }

    /// Whether both values carry the same variant.
    pub fn same_kind(&self, other: &Self) -> bool {
        core::mem::discriminant(self) == core::mem::discriminant(other)
    }
}

impl From<bool> for ConstantValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for ConstantValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<u32> for ConstantValue {
    fn from(v: u32) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<f64> for ConstantValue {
    fn from(v: f64) -> Self {
        Self::Real(v)
    }
}

impl From<&str> for ConstantValue {
    fn from(v: &str) -> Self {
        Self::Text(v.to_owned())
    }
}

impl From<String> for ConstantValue {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl core::fmt::Display for ConstantValue {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Null => f.write_str("null"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Real(r) => write!(f, "{r}"),
            Self::Text(s) => f.write_str(s),
        }
    }
}

// ---------------------------------------------------------------------------
// Captured records
// ---------------------------------------------------------------------------

/// One captured warning or log event.
///
/// `category` holds the warning category for warnings and the level name
/// (`WARN`, `ERROR`, ...) for log events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapturedRecord {
    /// Rank that produced the record.
    pub rank: u32,
    /// Tick count when the record was captured.
    pub step: u64,
    /// Seconds since the Unix epoch.
    pub unixtime: f64,
    /// Category (warnings) or level (logging).
    pub category: String,
    /// Message text.
    pub message: String,
    /// Source file, if known.
    pub filename: Option<String>,
    /// Source line, if known.
    pub lineno: Option<u32>,
}

// ---------------------------------------------------------------------------
// Time series
// ---------------------------------------------------------------------------

/// One persisted sample of a quantity.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SeriesPoint {
    /// Tick count at which the sample was taken.
    pub step: u64,
    /// Rank that produced it.
    pub rank: u32,
    /// Sampled value.
    pub value: f64,
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::float_cmp)]
mod tests {
    use super::*;

    #[test]
    fn constant_round_trip_keeps_type() {
        for value in [
            ConstantValue::Null,
            ConstantValue::Bool(true),
            ConstantValue::Int(1),
            ConstantValue::Real(1.0),
            ConstantValue::Text("1".to_owned()),
        ] {
            let json = serde_json::to_string(&value).unwrap();
            let back: ConstantValue = serde_json::from_str(&json).unwrap();
            assert_eq!(back, value);
            assert!(back.same_kind(&value));
        }
    }

    #[test]
    fn int_and_real_are_different_kinds() {
        assert!(!ConstantValue::Int(1).same_kind(&ConstantValue::Real(1.0)));
    }

    #[test]
    fn numeric_view() {
        assert_eq!(ConstantValue::Bool(true).as_f64(), Some(1.0));
        assert_eq!(ConstantValue::Int(-3).as_f64(), Some(-3.0));
        assert_eq!(ConstantValue::Text("x".to_owned()).as_f64(), None);
    }

    #[test]
    fn meta_builder() {
        let meta = QuantityMeta::new("t_step")
            .with_unit("s")
            .with_description("Time step duration")
            .with_aggregator(Aggregator::Max);
        assert_eq!(meta.unit.as_deref(), Some("s"));
        assert_eq!(meta.default_aggregator, Some(Aggregator::Max));
    }
}
