//! Enumeration types shared across the workspace.
//!
//! Every enum that reaches the store has a stable string tag. Tags are what
//! gets persisted, so renaming a variant never changes an existing file.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Error returned when a string tag does not name a known variant.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind} tag: {tag:?}")]
pub struct ParseTagError {
    /// Which enum was being parsed.
    pub kind: &'static str,
    /// The offending tag.
    pub tag: String,
}

// ---------------------------------------------------------------------------
// Aggregator
// ---------------------------------------------------------------------------

/// A reduction collapsing the per-rank values of one step into one value.
///
/// Persisted as a string tag in the `quantities.default_aggregator` column.
/// [`Aggregator::Custom`] carries the name of a reduction registered at
/// runtime; it is resolved by name when an expression is compiled.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub enum Aggregator {
    /// Smallest per-rank value.
    Min,
    /// Largest per-rank value.
    Max,
    /// Arithmetic mean.
    Avg,
    /// Middle value (mean of the two middle values for even counts).
    Median,
    /// Sum over ranks.
    Sum,
    /// Euclidean norm over ranks.
    Norm2,
    /// A reduction registered by name.
    Custom(String),
}

impl Aggregator {
    /// All built-in reductions, in tag order.
    pub const BUILTIN: [Self; 6] = [
        Self::Min,
        Self::Max,
        Self::Avg,
        Self::Median,
        Self::Sum,
        Self::Norm2,
    ];

    /// The persisted tag. Also the name of the matching SQL aggregate.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Min => "min",
            Self::Max => "max",
            Self::Avg => "avg",
            Self::Median => "median",
            Self::Sum => "sum",
            Self::Norm2 => "norm2",
            Self::Custom(name) => name,
        }
    }

    /// Parse a persisted tag. Unknown tags become [`Aggregator::Custom`].
    pub fn from_tag(tag: &str) -> Self {
        tag.parse().unwrap_or_else(|_| Self::Custom(tag.to_owned()))
    }

    /// Whether this is one of the built-in reductions.
    pub const fn is_builtin(&self) -> bool {
        !matches!(self, Self::Custom(_))
    }
}

impl FromStr for Aggregator {
    type Err = ParseTagError;

    /// Parse a built-in reduction name. Custom names are rejected here so
    /// that typos in expressions surface as errors.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "min" => Ok(Self::Min),
            "max" => Ok(Self::Max),
            "avg" => Ok(Self::Avg),
            "median" => Ok(Self::Median),
            "sum" => Ok(Self::Sum),
            "norm2" => Ok(Self::Norm2),
            other => Err(ParseTagError {
                kind: "aggregator",
                tag: other.to_owned(),
            }),
        }
    }
}

impl From<Aggregator> for String {
    fn from(agg: Aggregator) -> Self {
        match agg {
            Aggregator::Custom(name) => name,
            builtin => builtin.as_str().to_owned(),
        }
    }
}

impl From<String> for Aggregator {
    fn from(tag: String) -> Self {
        Self::from_tag(&tag)
    }
}

impl core::fmt::Display for Aggregator {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Phase
// ---------------------------------------------------------------------------

/// When a quantity is sampled relative to the simulation step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Sampled in `tick_before`, ahead of the step's work.
    Before,
    /// Sampled in `tick_after`, once the step's work is done.
    After,
}

// ---------------------------------------------------------------------------
// OpenMode
// ---------------------------------------------------------------------------

/// How a log store is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpenMode {
    /// `w`: create a new store; an existing store is an error.
    Create,
    /// `r`: open an existing store read-only; a missing store is an error.
    Read,
    /// `wu`: create a new store under a unique timestamped name.
    CreateUnique,
    /// `wo`: delete any existing store, then create a new one.
    Overwrite,
}

impl OpenMode {
    /// The short tag (`w`, `r`, `wu`, `wo`).
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Create => "w",
            Self::Read => "r",
            Self::CreateUnique => "wu",
            Self::Overwrite => "wo",
        }
    }

    /// Whether the mode creates a store and records into it.
    pub const fn is_writable(self) -> bool {
        !matches!(self, Self::Read)
    }
}

impl FromStr for OpenMode {
    type Err = ParseTagError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "w" => Ok(Self::Create),
            "r" => Ok(Self::Read),
            "wu" => Ok(Self::CreateUnique),
            "wo" => Ok(Self::Overwrite),
            other => Err(ParseTagError {
                kind: "open mode",
                tag: other.to_owned(),
            }),
        }
    }
}

impl core::fmt::Display for OpenMode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// RecordKind
// ---------------------------------------------------------------------------

/// The two kinds of ambient records captured during a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    /// Warnings raised by the simulation code.
    Warning,
    /// Log events at any level.
    Logging,
}

impl RecordKind {
    /// Name of the table the records are persisted in.
    pub const fn table_name(self) -> &'static str {
        match self {
            Self::Warning => "warnings",
            Self::Logging => "logging",
        }
    }

    /// Name of the column holding the category (warnings) or level (logging).
    pub const fn category_column(self) -> &'static str {
        match self {
            Self::Warning => "category",
            Self::Logging => "level",
        }
    }
}
