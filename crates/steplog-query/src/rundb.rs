//! [`RunDb`]: the query facade over a gathered store.

use std::collections::BTreeSet;
use std::path::Path;

use rusqlite::types::Value;
use rusqlite::{Connection, OpenFlags, Params};
use steplog_db::StoreTarget;
use steplog_db::store::table_exists;
use tracing::{debug, info, warn};

use crate::error::QueryError;
use crate::functions::{display_owned, register_functions};
use crate::gather::{FeatureSource, GatherOptions, gather, scan};
use crate::mangle::{MagicColumn, Mangler, rank_agg_table, sql_aggregate};

/// Open `paths` as one multi-run connection.
///
/// A single already-gathered store (one with a `runs` table) is opened as
/// is. Otherwise every existing path is gathered into memory; missing paths
/// are skipped with a warning.
///
/// # Errors
///
/// - [`QueryError::NoInputs`] if none of the paths exists.
/// - [`QueryError::MultipleGathered`] if a gathered store is given together
///   with other inputs.
/// - Scan and gather errors otherwise.
pub fn auto_gather<P: AsRef<Path>>(paths: &[P]) -> Result<Connection, QueryError> {
    let existing: Vec<&Path> = paths
        .iter()
        .map(AsRef::as_ref)
        .filter(|path| {
            let found = path.exists();
            if !found {
                warn!(path = %path.display(), "Skipping missing input");
            }
            found
        })
        .collect();
    let Some(first) = existing.first() else {
        return Err(QueryError::NoInputs);
    };

    let mut gathered = false;
    for path in &existing {
        let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY)?;
        gathered |= table_exists(&conn, "runs")?;
    }
    if gathered {
        if existing.len() > 1 {
            return Err(QueryError::MultipleGathered { count: existing.len() });
        }
        debug!(path = %first.display(), "Opening gathered store");
        return Ok(Connection::open(first)?);
    }

    info!(inputs = existing.len(), "Creating an in-memory store from the inputs");
    let source = FeatureSource::new();
    let scanned = scan(&source, &existing)?;
    gather(&StoreTarget::Memory, &source, &scanned, &GatherOptions::default())
}

/// A multi-run store ready for (optionally magic) queries.
#[derive(Debug)]
pub struct RunDb {
    conn: Connection,
    magic: bool,
    mangler: Mangler,
    rank_agg_tables: BTreeSet<MagicColumn>,
}

impl RunDb {
    /// Open inputs through [`auto_gather`]. With `magic` set, queries are
    /// rewritten by the mangler before they run.
    ///
    /// # Errors
    ///
    /// See [`auto_gather`].
    pub fn open<P: AsRef<Path>>(paths: &[P], magic: bool) -> Result<Self, QueryError> {
        Self::from_connection(auto_gather(paths)?, magic)
    }

    /// Wrap an existing gathered connection.
    ///
    /// # Errors
    ///
    /// Returns [`QueryError::Sqlite`] if the custom functions cannot be
    /// registered.
    pub fn from_connection(conn: Connection, magic: bool) -> Result<Self, QueryError> {
        register_functions(&conn)?;
        Ok(Self {
            conn,
            magic,
            mangler: Mangler::new()?,
            rank_agg_tables: BTreeSet::new(),
        })
    }

    /// The underlying connection.
    pub const fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Whether queries are mangled.
    pub const fn is_magic(&self) -> bool {
        self.magic
    }

    /// Rewrite `query`, materializing the rank aggregation tables it needs.
    /// Without magic the query is returned as is.
    pub fn mangle(&mut self, query: &str) -> Result<String, QueryError> {
        if !self.magic {
            return Ok(query.to_owned());
        }
        let Self {
            conn,
            mangler,
            rank_agg_tables,
            ..
        } = self;
        mangler.mangle(query, |column| materialize(conn, rank_agg_tables, column))
    }

    /// Run a query.
    pub fn query(&mut self, query: &str) -> Result<QueryResult, QueryError> {
        self.query_with(query, [])
    }

    /// Run a query with bound parameters.
    pub fn query_with<P: Params>(&mut self, query: &str, params: P) -> Result<QueryResult, QueryError> {
        let sql = self.mangle(query)?;
        debug!(query, sql = %sql, "Running query");
        let mut stmt = self.conn.prepare(&sql)?;
        let columns: Vec<String> = stmt.column_names().into_iter().map(str::to_owned).collect();
        let width = columns.len();
        let mut rows = Vec::new();
        let mut cursor = stmt.query(params)?;
        while let Some(row) = cursor.next()? {
            let values = (0..width)
                .map(|i| row.get::<_, Value>(i))
                .collect::<Result<Vec<_>, _>>()?;
            rows.push(values);
        }
        Ok(QueryResult { columns, rows })
    }
}

/// Build (once) the temporary table of `column` reduced across ranks.
fn materialize(
    conn: &Connection,
    built: &mut BTreeSet<MagicColumn>,
    column: &MagicColumn,
) -> Result<String, QueryError> {
    let aggregator = column.aggregator.as_deref().unwrap_or_default();
    let table = rank_agg_table(&column.quantity, aggregator);
    if built.contains(column) {
        return Ok(table);
    }
    let function = sql_aggregate(aggregator).ok_or_else(|| QueryError::UnknownAggregator {
        quantity: column.quantity.clone(),
        suffix: aggregator.to_owned(),
    })?;

    info!(table = %table, "Building temporary rank aggregation table");
    conn.execute_batch(&format!(
        "CREATE TEMPORARY TABLE {table} AS
             SELECT run_id, step, {function}(value) AS value
             FROM {quantity} GROUP BY run_id, step;
         CREATE INDEX {table}_run_step ON {table} (run_id, step);",
        quantity = column.quantity,
    ))?;
    built.insert(column.clone());
    Ok(table)
}

/// Rows returned by [`RunDb::query`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryResult {
    /// Column names.
    pub columns: Vec<String>,
    /// Rows, each as wide as `columns`.
    pub rows: Vec<Vec<Value>>,
}

/// One curve out of [`QueryResult::split_series`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Series {
    /// First column.
    pub x: Vec<Value>,
    /// Second column.
    pub y: Vec<Value>,
    /// The remaining columns shared by every row of the curve.
    pub key: Vec<Value>,
}

impl QueryResult {
    /// Split rows into `(x, y)` curves. Consecutive rows whose columns after
    /// the second are equal belong to the same curve.
    pub fn split_series(&self) -> Vec<Series> {
        let mut series: Vec<Series> = Vec::new();
        for row in &self.rows {
            let key = row.get(2..).unwrap_or_default();
            let x = row.first().cloned().unwrap_or(Value::Null);
            let y = row.get(1).cloned().unwrap_or(Value::Null);
            match series.last_mut() {
                Some(current) if current.key == key => {
                    current.x.push(x);
                    current.y.push(y);
                }
                _ => series.push(Series {
                    x: vec![x],
                    y: vec![y],
                    key: key.to_vec(),
                }),
            }
        }
        series
    }
}

impl core::fmt::Display for QueryResult {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let cells: Vec<Vec<String>> = self
            .rows
            .iter()
            .map(|row| row.iter().map(display_owned).collect())
            .collect();
        let widths: Vec<usize> = self
            .columns
            .iter()
            .enumerate()
            .map(|(i, name)| {
                cells
                    .iter()
                    .filter_map(|row| row.get(i))
                    .map(|cell| cell.chars().count())
                    .fold(name.chars().count(), usize::max)
            })
            .collect();

        let line = |row: &[String]| -> String {
            row.iter()
                .zip(&widths)
                .map(|(cell, &width)| format!("{cell:<width$}"))
                .collect::<Vec<_>>()
                .join(" | ")
                .trim_end()
                .to_owned()
        };

        writeln!(f, "{}", line(&self.columns))?;
        let rule: Vec<String> = widths.iter().map(|w| "-".repeat(*w)).collect();
        write!(f, "{}", rule.join("-+-"))?;
        for row in &cells {
            write!(f, "\n{}", line(row))?;
        }
        Ok(())
    }
}
