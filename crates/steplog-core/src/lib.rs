//! Tick engine, quantities, expressions and watches for the steplog
//! diagnostic logger.
//!
//! A simulation registers quantities with a [`LogManager`] and brackets each
//! step with [`LogManager::tick_before`] and [`LogManager::tick_after`]. The
//! engine samples each quantity at its own interval into the store, prints
//! live watch expressions, and later extracts datasets from the stored
//! series, reducing across ranks where the run was distributed.
//!
//! # Modules
//!
//! - [`aggregate`] -- Rank reductions and the custom [`AggregatorRegistry`].
//! - [`capture`] -- [`CaptureSink`] and the `tracing` [`CaptureLayer`].
//! - [`comm`] -- The [`Communicator`] trait and an in-process thread group.
//! - [`config`] -- [`LogConfig`] loaded from YAML.
//! - [`dataset`] -- Historical dataset extraction on [`LogManager`].
//! - [`error`] -- [`LogError`].
//! - [`expr`] -- Expression parsing, display and compiled evaluation.
//! - [`join`] -- Merge-join of step-ordered sequences.
//! - [`manager`] -- The tick engine.
//! - [`quantities`] -- Built-in quantities.
//! - [`quantity`] -- The quantity traits and [`Quantity`] wrapper.
//! - [`resolve`] -- Dependency resolution of expressions.
//! - [`watch`] -- Watch templates and rendering.

pub mod aggregate;
pub mod capture;
pub mod comm;
pub mod config;
pub mod dataset;
pub mod error;
pub mod expr;
pub mod join;
pub mod manager;
pub mod quantities;
pub mod quantity;
pub mod resolve;
pub mod watch;

pub use aggregate::{AggregatorRegistry, RankReduction};
pub use capture::{CaptureLayer, CaptureSink};
pub use comm::{CommError, Communicator, ThreadCommunicator, thread_group};
pub use config::{ConfigError, LogConfig, WatchOutput};
pub use dataset::{Dataset, DatasetRequest, JointDataset, PlotAxis};
pub use error::LogError;
pub use manager::{LogManager, OpenOptions, TickState};
pub use quantity::{Quantity, SampleContext, ScalarQuantity, VectorQuantity};
pub use watch::{WatchReport, WatchRequest};
