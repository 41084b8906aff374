//! Shared type definitions for the steplog diagnostic logger.
//!
//! This crate is the vocabulary shared by the store, the tick engine and
//! the query side. Nothing here touches `SQLite` or the clock.
//!
//! # Modules
//!
//! - [`ids`] -- Run identifier shared by all ranks of one execution
//! - [`enums`] -- Rank aggregators, sampling phases, open modes, record kinds
//! - [`structs`] -- Quantity metadata, constants, captured records, series points

pub mod enums;
pub mod ids;
pub mod structs;

pub use enums::{Aggregator, OpenMode, ParseTagError, Phase, RecordKind};
pub use ids::RunId;
pub use structs::{CapturedRecord, ConstantValue, QuantityMeta, SeriesPoint};
