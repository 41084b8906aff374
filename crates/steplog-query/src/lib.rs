//! Multi-run gathering and magic SQL for steplog stores.
//!
//! Each simulation process writes its own store. This crate merges any
//! number of them into one store with a `runs` table and lets queries name
//! quantities directly:
//!
//! ```text
//! select $t_step.max, dt where np > 2
//! ```
//!
//! # Modules
//!
//! - [`error`] -- [`QueryError`].
//! - [`functions`] -- Custom SQL aggregates and scalar helpers.
//! - [`gather`] -- Scan and merge single-run stores.
//! - [`mangle`] -- The magic SQL rewriter.
//! - [`rundb`] -- [`RunDb`], opening inputs and running queries.

pub mod error;
pub mod functions;
pub mod gather;
pub mod mangle;
pub mod rundb;

pub use error::QueryError;
pub use functions::register_functions;
pub use gather::{FeatureSource, GatherOptions, ScanResult, SqlType, gather, parse_name_map, scan};
pub use mangle::{MagicColumn, Mangler};
pub use rundb::{QueryResult, RunDb, Series, auto_gather};
