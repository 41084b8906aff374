//! Error types for the storage engine.
//!
//! All errors are propagated via [`DbError`], which wraps the underlying
//! [`rusqlite`] and [`serde_json`] errors and adds context about which
//! operation failed.

use std::path::PathBuf;

/// Errors that can occur in the storage engine.
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    /// An `SQLite` operation failed.
    #[error("SQLite error: {source}")]
    Sqlite {
        /// The underlying `SQLite` error.
        #[from]
        source: rusqlite::Error,
    },

    /// A constant could not be encoded or decoded.
    #[error("serialization error: {source}")]
    Serialization {
        /// The underlying JSON error.
        #[from]
        source: serde_json::Error,
    },

    /// A filesystem operation on a store file failed.
    #[error("I/O error on {path}: {source}")]
    Io {
        /// The file involved.
        path: PathBuf,
        /// The underlying I/O error.
        source: std::io::Error,
    },

    /// The store was locked by another writer and the commit did not go
    /// through. Pending writes stay in the open transaction.
    #[error("store busy during {operation}")]
    Busy {
        /// The operation that hit the lock.
        operation: &'static str,
    },

    /// A quantity name cannot be used as a table name.
    #[error("invalid quantity name {name:?}: {reason}")]
    InvalidName {
        /// The rejected name.
        name: String,
        /// Why it was rejected.
        reason: &'static str,
    },

    /// A quantity with this name is already registered.
    #[error("quantity {name:?} is already registered")]
    DuplicateQuantity {
        /// The duplicated name.
        name: String,
    },

    /// No quantity with this name exists in the store.
    #[error("unknown quantity {name:?}")]
    UnknownQuantity {
        /// The missing name.
        name: String,
    },

    /// A write was attempted on a store opened read-only.
    #[error("store is read-only")]
    ReadOnly,

    /// A step or count did not fit the integer range `SQLite` stores.
    #[error("{what} out of range: {value}")]
    OutOfRange {
        /// What was being converted.
        what: &'static str,
        /// The offending value, rendered.
        value: String,
    },
}

impl DbError {
    /// Whether the error is a lock conflict with another writer.
    pub const fn is_busy(&self) -> bool {
        matches!(self, Self::Busy { .. })
    }
}
