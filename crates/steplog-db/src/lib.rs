//! Storage engine for the steplog diagnostic logger.
//!
//! One embedded `SQLite` file per process (or an in-memory database) holds
//! quantity metadata, run constants, captured warnings and log records,
//! and one append-only `(step, rank, value)` table per quantity.
//!
//! # Modules
//!
//! - [`error`] -- [`DbError`] covering every storage failure
//! - [`schema`] -- DDL, reserved names and the current schema version
//! - [`store`] -- [`LogStore`], the connection wrapper used by the tick engine
//! - [`upgrade`] -- Version-transition contract bringing old stores to the
//!   current schema

pub mod error;
pub mod schema;
pub mod store;
pub mod upgrade;

pub use error::DbError;
pub use schema::SCHEMA_VERSION;
pub use store::{Access, LogStore, StoreTarget};
pub use upgrade::{UpgradeReport, upgrade_connection, upgrade_file};
