//! Error types for querying and gathering.

use std::path::PathBuf;

/// Errors raised by the query engine and the gatherer.
#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    /// An `SQLite` operation failed.
    #[error("SQLite error: {source}")]
    Sqlite {
        /// The underlying `SQLite` error.
        #[from]
        source: rusqlite::Error,
    },

    /// Reading an input store failed.
    #[error("log store error: {source}")]
    Log {
        /// The underlying tick engine error.
        #[from]
        source: steplog_core::LogError,
    },

    /// The storage engine failed.
    #[error("store error: {source}")]
    Db {
        /// The underlying storage error.
        #[from]
        source: steplog_db::DbError,
    },

    /// A constant could not be encoded.
    #[error("serialization error: {source}")]
    Serialization {
        /// The underlying JSON error.
        #[from]
        source: serde_json::Error,
    },

    /// A built-in pattern failed to compile.
    #[error("pattern error: {source}")]
    Pattern {
        /// The underlying regex error.
        #[from]
        source: regex::Error,
    },

    /// A filesystem operation failed.
    #[error("I/O error on {path}: {source}")]
    Io {
        /// The file involved.
        path: PathBuf,
        /// The underlying I/O error.
        source: std::io::Error,
    },

    /// A `$quantity.suffix` token names no known reduction.
    #[error("unknown rank aggregator {suffix:?} on ${quantity}")]
    UnknownAggregator {
        /// The quantity the suffix was attached to.
        quantity: String,
        /// The unrecognized suffix.
        suffix: String,
    },

    /// More than one already-gathered store was given.
    #[error("cannot query {count} gathered stores at once")]
    MultipleGathered {
        /// Number of inputs.
        count: usize,
    },

    /// No usable input store was given.
    #[error("no input stores")]
    NoInputs,

    /// The gather output already exists.
    #[error("output file {path} already exists")]
    OutputExists {
        /// Path of the existing file.
        path: PathBuf,
    },

    /// A line of a features file is malformed.
    #[error("{path}:{line}: {message}")]
    FeaturesFile {
        /// The features file.
        path: PathBuf,
        /// One-based line number.
        line: usize,
        /// What is wrong with it.
        message: String,
    },

    /// A rename map entry is not of the form `FROM=TO`.
    #[error("invalid name map entry {entry:?}, expected FROM=TO")]
    NameMap {
        /// The offending entry.
        entry: String,
    },
}
