//! [`LogStore`]: the connection wrapper the tick engine writes through.
//!
//! Writes are batched: the first write after a commit opens a transaction,
//! and [`LogStore::commit`] closes it. A commit that hits another writer's
//! lock reports [`DbError::Busy`] and leaves the transaction open, so the
//! next commit retries the same batch.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use rusqlite::{Connection, ErrorCode, OpenFlags, OptionalExtension, params};
use steplog_types::{Aggregator, CapturedRecord, ConstantValue, QuantityMeta, RecordKind, SeriesPoint};
use tracing::{debug, warn};

use crate::error::DbError;
use crate::schema::{CREATE_LOG_TABLES, quantity_table_ddl, validate_quantity_name};

/// Where a store lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreTarget {
    /// A private in-memory database, gone when the store is dropped.
    Memory,
    /// An `SQLite` file.
    File(PathBuf),
}

impl StoreTarget {
    /// The file path, if the target is a file.
    pub fn path(&self) -> Option<&Path> {
        match self {
            Self::Memory => None,
            Self::File(path) => Some(path),
        }
    }
}

/// Access level requested when opening a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    /// Never writes; a file target must already exist.
    ReadOnly,
    /// Reads and writes; a missing file is created.
    ReadWrite,
}

/// An open log store.
#[derive(Debug)]
pub struct LogStore {
    conn: Connection,
    target: StoreTarget,
    access: Access,
}

impl LogStore {
    /// Open (or create) a store.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Sqlite`] if the file cannot be opened or the busy
    /// timeout cannot be configured.
    pub fn open(target: StoreTarget, access: Access, busy_timeout: Duration) -> Result<Self, DbError> {
        let conn = match (&target, access) {
            (StoreTarget::Memory, _) => Connection::open_in_memory()?,
            (StoreTarget::File(path), Access::ReadOnly) => Connection::open_with_flags(
                path,
                OpenFlags::SQLITE_OPEN_READ_ONLY
                    | OpenFlags::SQLITE_OPEN_URI
                    | OpenFlags::SQLITE_OPEN_NO_MUTEX,
            )?,
            (StoreTarget::File(path), Access::ReadWrite) => Connection::open(path)?,
        };
        conn.busy_timeout(busy_timeout)?;
        debug!(target = ?target, access = ?access, "Opened log store");
        Ok(Self { conn, target, access })
    }

    /// Open an existing file read-only with the default busy timeout.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Sqlite`] if the file cannot be opened.
    pub fn open_read(path: &Path) -> Result<Self, DbError> {
        Self::open(
            StoreTarget::File(path.to_path_buf()),
            Access::ReadOnly,
            Duration::from_secs(30),
        )
    }

    /// The underlying connection, for ad-hoc queries.
    pub const fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Where this store lives.
    pub const fn target(&self) -> &StoreTarget {
        &self.target
    }

    /// Whether the store rejects writes.
    pub fn is_read_only(&self) -> bool {
        self.access == Access::ReadOnly
    }

    /// Whether uncommitted writes are pending.
    pub fn in_transaction(&self) -> bool {
        !self.conn.is_autocommit()
    }

    // -----------------------------------------------------------------------
    // Schema
    // -----------------------------------------------------------------------

    /// Whether a table of this name exists.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Sqlite`] if the catalog query fails.
    pub fn has_table(&self, name: &str) -> Result<bool, DbError> {
        table_exists(&self.conn, name)
    }

    /// Whether the store already carries the log schema.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Sqlite`] if the catalog query fails.
    pub fn has_schema(&self) -> Result<bool, DbError> {
        self.has_table("quantities")
    }

    /// Create the base tables of a fresh store.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::ReadOnly`] on a read-only store, or
    /// [`DbError::Sqlite`] if the DDL fails (for example because the tables
    /// already exist).
    pub fn initialize_schema(&mut self) -> Result<(), DbError> {
        self.begin_write()?;
        self.conn.execute_batch(CREATE_LOG_TABLES)?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Constants
    // -----------------------------------------------------------------------

    /// Load every constant.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Sqlite`] if the query fails or
    /// [`DbError::Serialization`] if a value cannot be decoded.
    pub fn load_constants(&self) -> Result<BTreeMap<String, ConstantValue>, DbError> {
        let mut stmt = self.conn.prepare("SELECT name, value FROM constants")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, Option<String>>(1)?))
        })?;
        let mut constants = BTreeMap::new();
        for row in rows {
            let (name, raw) = row?;
            let value = match raw {
                Some(json) => serde_json::from_str(&json)?,
                None => ConstantValue::Null,
            };
            constants.insert(name, value);
        }
        Ok(constants)
    }

    /// Insert or overwrite a constant.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::ReadOnly`] on a read-only store, or
    /// [`DbError::Sqlite`] / [`DbError::Serialization`] on failure.
    pub fn upsert_constant(&mut self, name: &str, value: &ConstantValue) -> Result<(), DbError> {
        self.begin_write()?;
        let json = serde_json::to_string(value)?;
        let updated = self
            .conn
            .prepare_cached("UPDATE constants SET value = ?2 WHERE name = ?1")?
            .execute(params![name, json])?;
        if updated == 0 {
            self.conn
                .prepare_cached("INSERT INTO constants (name, value) VALUES (?1, ?2)")?
                .execute(params![name, json])?;
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Quantities
    // -----------------------------------------------------------------------

    /// Load the metadata of every registered quantity, in registration order.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Sqlite`] if the query fails.
    pub fn load_quantities(&self) -> Result<Vec<QuantityMeta>, DbError> {
        let mut stmt = self.conn.prepare(
            "SELECT name, unit, description, default_aggregator FROM quantities ORDER BY rowid",
        )?;
        let rows = stmt.query_map([], |row| {
            let tag: Option<String> = row.get(3)?;
            Ok(QuantityMeta {
                name: row.get(0)?,
                unit: row.get(1)?,
                description: row.get(2)?,
                default_aggregator: tag.as_deref().map(Aggregator::from_tag),
            })
        })?;
        rows.collect::<Result<Vec<_>, _>>().map_err(DbError::from)
    }

    /// Register a quantity: one metadata row plus its own table.
    ///
    /// # Errors
    ///
    /// See [`LogStore::register_quantities`].
    pub fn register_quantity(&mut self, meta: &QuantityMeta) -> Result<(), DbError> {
        self.register_quantities(core::slice::from_ref(meta))
    }

    /// Register several quantities at once.
    ///
    /// All metadata rows and tables are created inside one savepoint, so a
    /// failure leaves none of them behind.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::InvalidName`] for unusable names,
    /// [`DbError::DuplicateQuantity`] if a name is taken (or repeated in
    /// `metas`), or [`DbError::ReadOnly`] / [`DbError::Sqlite`].
    pub fn register_quantities(&mut self, metas: &[QuantityMeta]) -> Result<(), DbError> {
        for (i, meta) in metas.iter().enumerate() {
            validate_quantity_name(&meta.name)?;
            let repeated = metas.iter().take(i).any(|m| m.name == meta.name);
            if repeated || self.quantity_exists(&meta.name)? || self.has_table(&meta.name)? {
                return Err(DbError::DuplicateQuantity {
                    name: meta.name.clone(),
                });
            }
        }
        self.begin_write()?;
        let sp = self.conn.savepoint()?;
        for meta in metas {
            sp.execute(
                "INSERT INTO quantities (name, unit, description, default_aggregator)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    meta.name,
                    meta.unit,
                    meta.description,
                    meta.default_aggregator.as_ref().map(Aggregator::as_str),
                ],
            )?;
            sp.execute_batch(&quantity_table_ddl(&meta.name))?;
            debug!(quantity = %meta.name, "Registered quantity");
        }
        sp.commit()?;
        Ok(())
    }

    /// Whether a metadata row exists for this quantity.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Sqlite`] if the query fails.
    pub fn quantity_exists(&self, name: &str) -> Result<bool, DbError> {
        let found: Option<i64> = self
            .conn
            .query_row("SELECT 1 FROM quantities WHERE name = ?1", [name], |row| row.get(0))
            .optional()?;
        Ok(found.is_some())
    }

    /// Append one sample.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::ReadOnly`], [`DbError::OutOfRange`] for steps past
    /// `i64::MAX`, or [`DbError::Sqlite`].
    pub fn insert_sample(&mut self, quantity: &str, point: SeriesPoint) -> Result<(), DbError> {
        self.begin_write()?;
        let step = step_to_sql(point.step)?;
        self.conn
            .prepare_cached(&format!(
                "INSERT INTO \"{quantity}\" (step, rank, value) VALUES (?1, ?2, ?3)"
            ))?
            .execute(params![step, point.rank, point.value])?;
        Ok(())
    }

    /// Overwrite the value of an existing `(step, rank)` sample.
    ///
    /// Returns the number of rows changed.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::ReadOnly`], [`DbError::OutOfRange`] or
    /// [`DbError::Sqlite`].
    pub fn update_sample(&mut self, quantity: &str, point: SeriesPoint) -> Result<usize, DbError> {
        self.begin_write()?;
        let step = step_to_sql(point.step)?;
        let changed = self
            .conn
            .prepare_cached(&format!(
                "UPDATE \"{quantity}\" SET value = ?3 WHERE step = ?1 AND rank = ?2"
            ))?
            .execute(params![step, point.rank, point.value])?;
        Ok(changed)
    }

    /// Read the full series of a quantity ordered by step, then rank.
    ///
    /// Rows with a NULL value are skipped.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::UnknownQuantity`] if the quantity is not
    /// registered, or [`DbError::Sqlite`].
    pub fn read_series(&self, quantity: &str) -> Result<Vec<SeriesPoint>, DbError> {
        if validate_quantity_name(quantity).is_err() || !self.quantity_exists(quantity)? {
            return Err(DbError::UnknownQuantity {
                name: quantity.to_owned(),
            });
        }
        let mut stmt = self.conn.prepare(&format!(
            "SELECT step, rank, value FROM \"{quantity}\"
             WHERE value IS NOT NULL ORDER BY step, rank"
        ))?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, Option<u32>>(1)?,
                row.get::<_, f64>(2)?,
            ))
        })?;
        let mut points = Vec::new();
        for row in rows {
            let (step, rank, value) = row?;
            points.push(SeriesPoint {
                step: step_from_sql(step)?,
                rank: rank.unwrap_or(0),
                value,
            });
        }
        Ok(points)
    }

    // -----------------------------------------------------------------------
    // Warnings and log records
    // -----------------------------------------------------------------------

    /// Append captured records to the warnings or logging table.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::ReadOnly`], [`DbError::OutOfRange`] or
    /// [`DbError::Sqlite`].
    pub fn insert_records(&mut self, kind: RecordKind, records: &[CapturedRecord]) -> Result<(), DbError> {
        if records.is_empty() {
            return Ok(());
        }
        self.begin_write()?;
        let sql = format!(
            "INSERT INTO {table} (rank, step, unixtime, {category}, message, filename, lineno)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            table = kind.table_name(),
            category = kind.category_column(),
        );
        let mut stmt = self.conn.prepare_cached(&sql)?;
        for record in records {
            stmt.execute(params![
                record.rank,
                step_to_sql(record.step)?,
                record.unixtime,
                record.category,
                record.message,
                record.filename,
                record.lineno,
            ])?;
        }
        Ok(())
    }

    /// Read every record of one kind in insertion order.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Sqlite`] if the query fails.
    pub fn read_records(&self, kind: RecordKind) -> Result<Vec<CapturedRecord>, DbError> {
        let sql = format!(
            "SELECT rank, step, unixtime, {category}, message, filename, lineno
             FROM {table} ORDER BY rowid",
            table = kind.table_name(),
            category = kind.category_column(),
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, Option<u32>>(0)?,
                row.get::<_, Option<i64>>(1)?,
                row.get::<_, Option<f64>>(2)?,
                row.get::<_, Option<String>>(3)?,
                row.get::<_, Option<String>>(4)?,
                row.get::<_, Option<String>>(5)?,
                row.get::<_, Option<u32>>(6)?,
            ))
        })?;
        let mut records = Vec::new();
        for row in rows {
            let (rank, step, unixtime, category, message, filename, lineno) = row?;
            records.push(CapturedRecord {
                rank: rank.unwrap_or(0),
                step: step_from_sql(step.unwrap_or(0))?,
                unixtime: unixtime.unwrap_or(0.0),
                category: category.unwrap_or_default(),
                message: message.unwrap_or_default(),
                filename,
                lineno,
            });
        }
        Ok(records)
    }

    // -----------------------------------------------------------------------
    // Transactions
    // -----------------------------------------------------------------------

    /// Commit pending writes.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Busy`] if another writer holds the lock (pending
    /// writes are kept for the next attempt), or [`DbError::Sqlite`].
    pub fn commit(&mut self) -> Result<(), DbError> {
        if self.conn.is_autocommit() {
            return Ok(());
        }
        match self.conn.execute_batch("COMMIT") {
            Ok(()) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(err, _))
                if matches!(err.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked) =>
            {
                warn!(target = ?self.target, "Commit deferred: store is locked by another writer");
                Err(DbError::Busy { operation: "commit" })
            }
            Err(err) => Err(err.into()),
        }
    }

    fn begin_write(&self) -> Result<(), DbError> {
        if self.is_read_only() {
            return Err(DbError::ReadOnly);
        }
        if self.conn.is_autocommit() {
            self.conn.execute_batch("BEGIN")?;
        }
        Ok(())
    }
}

/// Whether a table of this name exists on a raw connection.
///
/// # Errors
///
/// Returns [`DbError::Sqlite`] if the catalog query fails.
pub fn table_exists(conn: &Connection, name: &str) -> Result<bool, DbError> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1",
            [name],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

/// Convert a step counter to the signed integer `SQLite` stores.
///
/// # Errors
///
/// Returns [`DbError::OutOfRange`] past `i64::MAX`.
pub fn step_to_sql(step: u64) -> Result<i64, DbError> {
    i64::try_from(step).map_err(|_overflow| DbError::OutOfRange {
        what: "step",
        value: step.to_string(),
    })
}

/// Convert a stored step back to a counter.
///
/// # Errors
///
/// Returns [`DbError::OutOfRange`] for negative steps.
pub fn step_from_sql(step: i64) -> Result<u64, DbError> {
    u64::try_from(step).map_err(|_overflow| DbError::OutOfRange {
        what: "step",
        value: step.to_string(),
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::float_cmp, clippy::indexing_slicing)]
mod tests {
    use super::*;

    fn memory_store() -> LogStore {
        let mut store =
            LogStore::open(StoreTarget::Memory, Access::ReadWrite, Duration::from_secs(1)).unwrap();
        store.initialize_schema().unwrap();
        store
    }

    #[test]
    fn fresh_store_has_schema() {
        let store = memory_store();
        assert!(store.has_schema().unwrap());
        assert!(store.has_table("logging").unwrap());
    }

    #[test]
    fn constant_upsert_overwrites() {
        let mut store = memory_store();
        store.upsert_constant("dt", &ConstantValue::Real(0.1)).unwrap();
        store.upsert_constant("dt", &ConstantValue::Real(0.2)).unwrap();
        let constants = store.load_constants().unwrap();
        assert_eq!(constants.len(), 1);
        assert_eq!(constants.get("dt"), Some(&ConstantValue::Real(0.2)));
    }

    #[test]
    fn duplicate_registration_fails_and_leaves_one_row() {
        let mut store = memory_store();
        let meta = QuantityMeta::new("A").with_unit("s");
        store.register_quantity(&meta).unwrap();
        let err = store.register_quantity(&meta).unwrap_err();
        assert!(matches!(err, DbError::DuplicateQuantity { .. }));
        assert_eq!(store.load_quantities().unwrap().len(), 1);
    }

    #[test]
    fn update_sample_changes_value_in_place() {
        let mut store = memory_store();
        store.register_quantity(&QuantityMeta::new("t_log")).unwrap();
        let point = SeriesPoint { step: 3, rank: 0, value: 1.0 };
        store.insert_sample("t_log", point).unwrap();
        let changed = store
            .update_sample("t_log", SeriesPoint { value: 2.5, ..point })
            .unwrap();
        assert_eq!(changed, 1);
        let series = store.read_series("t_log").unwrap();
        assert_eq!(series.len(), 1);
        assert_eq!(series[0].value, 2.5);
    }

    #[test]
    fn reading_unknown_quantity_fails() {
        let store = memory_store();
        assert!(matches!(
            store.read_series("nope"),
            Err(DbError::UnknownQuantity { .. })
        ));
    }

    #[test]
    fn commit_without_writes_is_a_no_op() {
        let mut store = memory_store();
        store.commit().unwrap();
        assert!(!store.in_transaction());
        store.commit().unwrap();
    }
}
