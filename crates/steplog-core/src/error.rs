//! Error types for the tick engine.
//!
//! [`LogError`] is the single error type returned by [`LogManager`]
//! operations. Subsystem errors are wrapped with `#[from]` so `?` works
//! across layers.
//!
//! [`LogManager`]: crate::manager::LogManager

use std::path::PathBuf;

use crate::comm::CommError;
use crate::expr::{EvalError, ExprError};
use crate::manager::TickState;

/// Errors raised by the tick engine and its collaborators.
#[derive(Debug, thiserror::Error)]
pub enum LogError {
    /// The storage engine failed.
    #[error("store error: {source}")]
    Db {
        /// The underlying storage error.
        #[from]
        source: steplog_db::DbError,
    },

    /// An expression could not be parsed or resolved.
    #[error("expression error: {source}")]
    Expr {
        /// The underlying expression error.
        #[from]
        source: ExprError,
    },

    /// An expression failed during evaluation.
    #[error("evaluation error: {source}")]
    Eval {
        /// The underlying evaluation error.
        #[from]
        source: EvalError,
    },

    /// A collective call between ranks failed.
    #[error("communication error: {source}")]
    Comm {
        /// The underlying communicator error.
        #[from]
        source: CommError,
    },

    /// A filesystem operation failed.
    #[error("I/O error on {path}: {source}")]
    Io {
        /// The file involved.
        path: PathBuf,
        /// The underlying I/O error.
        source: std::io::Error,
    },

    /// Create mode found a store already at the path.
    #[error("log store {path} already exists")]
    StoreExists {
        /// Path of the existing store.
        path: PathBuf,
    },

    /// Read mode found no store at the path.
    #[error("log store {path} not found")]
    StoreNotFound {
        /// Path that was looked up.
        path: PathBuf,
    },

    /// No unused unique file name was found.
    #[error("no unused unique store name after {attempts} attempts")]
    UniqueNameExhausted {
        /// Number of names tried.
        attempts: u32,
    },

    /// A quantity of this name is already registered.
    #[error("cannot add the same quantity {name:?} twice")]
    DuplicateQuantity {
        /// The duplicated name.
        name: String,
    },

    /// No quantity of this name is registered.
    #[error("unknown quantity {name:?}")]
    UnknownQuantity {
        /// The missing name.
        name: String,
    },

    /// A sampling interval of zero ticks was requested.
    #[error("sampling interval for {name:?} must be at least 1 tick")]
    InvalidInterval {
        /// Name of the quantity being registered.
        name: String,
    },

    /// A multi-valued quantity returned the wrong number of values.
    #[error("quantity {name:?} produced {got} values, expected {expected}")]
    SampleMismatch {
        /// First name of the quantity.
        name: String,
        /// Number of declared names.
        expected: usize,
        /// Number of values produced.
        got: usize,
    },

    /// The store was opened read-only.
    #[error("log store is read-only")]
    ReadOnly,

    /// A tick phase was entered out of order.
    #[error("{operation} called in state {state:?}")]
    OutOfOrder {
        /// The call that was rejected.
        operation: &'static str,
        /// The state the engine was in.
        state: TickState,
    },

    /// The tick counter would overflow.
    #[error("tick counter overflow")]
    TickOverflow,

    /// A second value was pushed before the previous one was sampled.
    #[error("can't push two values per cycle into {name:?}")]
    PushedTwice {
        /// Name of the push quantity.
        name: String,
    },
}
