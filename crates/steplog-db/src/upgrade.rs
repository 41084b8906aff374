//! Bring a store of any earlier schema version up to [`SCHEMA_VERSION`].
//!
//! The version is detected from the table layout first and from the
//! `schema_version` constant second (versions 3 and 4 of a single-run store
//! are structurally identical). Each transition is applied in order inside
//! one transaction, then the version constant is stamped. Upgrading a store
//! that is already current changes nothing.

use std::path::{Path, PathBuf};

use rusqlite::Connection;
use rusqlite::types::ValueRef;
use steplog_types::ConstantValue;
use tracing::info;

use crate::error::DbError;
use crate::schema::{SCHEMA_VERSION, SCHEMA_VERSION_KEY};
use crate::store::table_exists;

/// Outcome of an upgrade.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpgradeReport {
    /// Version detected before the upgrade.
    pub from: u32,
    /// Version after the upgrade.
    pub to: u32,
}

impl UpgradeReport {
    /// Whether anything had to change.
    pub const fn changed(self) -> bool {
        self.from != self.to
    }
}

/// Upgrade a store file.
///
/// With `suffix == None` the file is upgraded in place. Otherwise the file is
/// first copied to `<stem><suffix><ext>` next to the original and the copy is
/// upgraded; the original is left untouched. Returns the path of the
/// upgraded file together with the report.
///
/// # Errors
///
/// Returns [`DbError::Io`] if the copy fails, or [`DbError::Sqlite`] if any
/// transition fails (the transaction is rolled back).
pub fn upgrade_file(path: &Path, suffix: Option<&str>) -> Result<(PathBuf, UpgradeReport), DbError> {
    let target = match suffix {
        None => path.to_path_buf(),
        Some(suffix) => {
            let copy = suffixed_path(path, suffix);
            std::fs::copy(path, &copy).map_err(|source| DbError::Io {
                path: copy.clone(),
                source,
            })?;
            copy
        }
    };
    let mut conn = Connection::open(&target)?;
    let report = upgrade_connection(&mut conn)?;
    info!(
        path = %target.display(),
        from = report.from,
        to = report.to,
        "Store upgrade finished"
    );
    Ok((target, report))
}

/// Upgrade an open connection in place.
///
/// # Errors
///
/// Returns [`DbError::Sqlite`] if detection or any transition fails.
pub fn upgrade_connection(conn: &mut Connection) -> Result<UpgradeReport, DbError> {
    let from = detect_version(conn)?;
    if from >= SCHEMA_VERSION {
        return Ok(UpgradeReport { from, to: from });
    }
    let gathered = table_exists(conn, "runs")?;
    let run_id_column = if gathered { ", run_id INTEGER" } else { "" };

    let tx = conn.transaction()?;
    if from < 1 {
        tx.execute_batch(&format!(
            "CREATE TABLE warnings (step INTEGER, message TEXT, category TEXT,
             filename TEXT, lineno INTEGER{run_id_column})"
        ))?;
    }
    if from < 2 {
        tx.execute_batch("ALTER TABLE warnings ADD COLUMN rank INTEGER DEFAULT 0")?;
    }
    if from < 3 {
        tx.execute_batch("ALTER TABLE warnings ADD COLUMN unixtime REAL DEFAULT NULL")?;
        if !table_exists(&tx, "logging")? {
            tx.execute_batch(&format!(
                "CREATE TABLE logging (rank INTEGER, step INTEGER, unixtime REAL,
                 level TEXT, message TEXT, filename TEXT, lineno INTEGER{run_id_column})"
            ))?;
        }
    }
    if gathered {
        normalize_gathered_constants(&tx)?;
    }
    stamp_version(&tx, gathered)?;
    tx.commit()?;
    Ok(UpgradeReport {
        from,
        to: SCHEMA_VERSION,
    })
}

/// Detect the schema version of a store.
///
/// # Errors
///
/// Returns [`DbError::Sqlite`] if the catalog cannot be read.
pub fn detect_version(conn: &Connection) -> Result<u32, DbError> {
    if !table_exists(conn, "warnings")? {
        return Ok(0);
    }
    if !has_column(conn, "warnings", "rank")? {
        return Ok(1);
    }
    if !has_column(conn, "warnings", "unixtime")? || !table_exists(conn, "logging")? {
        return Ok(2);
    }
    if table_exists(conn, "runs")?
        && !(table_exists(conn, "constants")? && has_column(conn, "constants", "run_id")?)
    {
        return Ok(3);
    }
    Ok(stamped_version(conn)?.unwrap_or(3).min(SCHEMA_VERSION))
}

fn stamped_version(conn: &Connection) -> Result<Option<u32>, DbError> {
    if !table_exists(conn, "constants")? {
        return Ok(None);
    }
    let mut stmt = conn.prepare("SELECT value FROM constants WHERE name = ?1")?;
    let rows = stmt.query_map([SCHEMA_VERSION_KEY], |row| row.get::<_, Option<String>>(0))?;
    let mut best = None;
    for raw in rows {
        let decoded = raw?
            .and_then(|json| serde_json::from_str::<ConstantValue>(&json).ok())
            .and_then(|value| match value {
                ConstantValue::Int(v) => u32::try_from(v).ok(),
                _ => None,
            });
        best = best.max(decoded);
    }
    Ok(best)
}

fn has_column(conn: &Connection, table: &str, column: &str) -> Result<bool, DbError> {
    let mut stmt = conn.prepare("SELECT name FROM pragma_table_info(?1)")?;
    let names = stmt.query_map([table], |row| row.get::<_, String>(0))?;
    for name in names {
        if name?.eq_ignore_ascii_case(column) {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Move the per-run feature columns of a gathered store into the
/// `constants(run_id, rank, name, value)` table.
fn normalize_gathered_constants(conn: &Connection) -> Result<(), DbError> {
    if table_exists(conn, "constants")? {
        if !has_column(conn, "constants", "run_id")? {
            conn.execute_batch(
                "ALTER TABLE constants ADD COLUMN run_id INTEGER;
                 ALTER TABLE constants ADD COLUMN rank INTEGER;",
            )?;
        }
    } else {
        conn.execute_batch(
            "CREATE TABLE constants (run_id INTEGER, rank INTEGER, name TEXT, value TEXT)",
        )?;
    }

    let mut features = Vec::new();
    {
        let mut stmt = conn.prepare("SELECT name FROM pragma_table_info('runs')")?;
        let names = stmt.query_map([], |row| row.get::<_, String>(0))?;
        for name in names {
            let name = name?;
            if !matches!(name.as_str(), "id" | "dirname" | "filename") {
                features.push(name);
            }
        }
    }

    let mut insert =
        conn.prepare("INSERT INTO constants (run_id, rank, name, value) VALUES (?1, NULL, ?2, ?3)")?;
    for feature in &features {
        let mut stmt = conn.prepare(&format!("SELECT id, \"{feature}\" FROM runs"))?;
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let run_id: i64 = row.get(0)?;
            let value = match row.get_ref(1)? {
                ValueRef::Null => ConstantValue::Null,
                ValueRef::Integer(i) => ConstantValue::Int(i),
                ValueRef::Real(r) => ConstantValue::Real(r),
                ValueRef::Text(t) | ValueRef::Blob(t) => {
                    ConstantValue::Text(String::from_utf8_lossy(t).into_owned())
                }
            };
            insert.execute(rusqlite::params![run_id, feature, serde_json::to_string(&value)?])?;
        }
    }
    Ok(())
}

fn stamp_version(conn: &Connection, gathered: bool) -> Result<(), DbError> {
    let json = serde_json::to_string(&ConstantValue::Int(i64::from(SCHEMA_VERSION)))?;
    if gathered {
        conn.execute(
            "DELETE FROM constants WHERE name = ?1 AND run_id IS NULL",
            [SCHEMA_VERSION_KEY],
        )?;
        conn.execute(
            "INSERT INTO constants (run_id, rank, name, value) VALUES (NULL, NULL, ?1, ?2)",
            [SCHEMA_VERSION_KEY, json.as_str()],
        )?;
    } else {
        let updated = conn.execute(
            "UPDATE constants SET value = ?2 WHERE name = ?1",
            [SCHEMA_VERSION_KEY, json.as_str()],
        )?;
        if updated == 0 {
            conn.execute(
                "INSERT INTO constants (name, value) VALUES (?1, ?2)",
                [SCHEMA_VERSION_KEY, json.as_str()],
            )?;
        }
    }
    Ok(())
}

/// `dir/run.sqlite` with suffix `-v4` becomes `dir/run-v4.sqlite`.
fn suffixed_path(path: &Path, suffix: &str) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let name = match path.extension() {
        Some(ext) => format!("{stem}{suffix}.{}", ext.to_string_lossy()),
        None => format!("{stem}{suffix}"),
    };
    path.with_file_name(name)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn suffixed_path_keeps_extension() {
        assert_eq!(
            suffixed_path(Path::new("/tmp/run.sqlite"), "-v4"),
            PathBuf::from("/tmp/run-v4.sqlite")
        );
        assert_eq!(
            suffixed_path(Path::new("run"), ".new"),
            PathBuf::from("run.new")
        );
    }

    #[test]
    fn version_zero_store_reaches_current() {
        let mut conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE quantities (name TEXT, unit TEXT, description TEXT, default_aggregator TEXT);
             CREATE TABLE constants (name TEXT, value TEXT);",
        )
        .unwrap();
        assert_eq!(detect_version(&conn).unwrap(), 0);

        let report = upgrade_connection(&mut conn).unwrap();
        assert_eq!(report, UpgradeReport { from: 0, to: SCHEMA_VERSION });
        assert!(has_column(&conn, "warnings", "rank").unwrap());
        assert!(has_column(&conn, "warnings", "unixtime").unwrap());
        assert!(table_exists(&conn, "logging").unwrap());
        assert_eq!(detect_version(&conn).unwrap(), SCHEMA_VERSION);

        let again = upgrade_connection(&mut conn).unwrap();
        assert!(!again.changed());
    }
}
