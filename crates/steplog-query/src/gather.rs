//! Merge single-run stores into one multi-run store.
//!
//! Gathering happens in two passes. [`scan`] opens every input read-only,
//! assigns run ids and collects the run features (constants, plus optional
//! directory-name and features-file entries) with their widened column
//! types. [`gather`] then writes the merged store:
//!
//! - `runs(id, dirname, filename, <feature columns>)`, one row per run
//! - `quantities`, metadata taken from the first store that has the quantity
//! - `constants(run_id, rank, name, value)`
//! - `warnings` and `logging`, each record tagged with its `run_id`
//! - one `(run_id, step, rank, value)` table per quantity
//!
//! Stores sharing a `unique_run_id` constant (the ranks of one distributed
//! run) collapse into one run.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use regex::Regex;
use rusqlite::types::Value;
use rusqlite::{Connection, params, params_from_iter};
use steplog_core::{LogManager, OpenOptions};
use steplog_db::StoreTarget;
use steplog_db::schema::{SCHEMA_VERSION, SCHEMA_VERSION_KEY, validate_quantity_name};
use steplog_db::store::step_to_sql;
use steplog_types::{Aggregator, ConstantValue, OpenMode, RecordKind};
use tracing::{debug, info, warn};

use crate::error::QueryError;

/// Words `SQLite` reserves. A feature column with one of these names gets a
/// trailing underscore so it can be used unquoted.
const SQLITE_KEYWORDS: [&str; 121] = [
    "abort", "action", "add", "after", "all", "alter", "analyze", "and", "as", "asc", "attach",
    "autoincrement", "before", "begin", "between", "by", "cascade", "case", "cast", "check",
    "collate", "column", "commit", "conflict", "constraint", "create", "cross", "current_date",
    "current_time", "current_timestamp", "database", "default", "deferrable", "deferred",
    "delete", "desc", "detach", "distinct", "drop", "each", "else", "end", "escape", "except",
    "exclusive", "exists", "explain", "fail", "for", "foreign", "from", "full", "glob", "group",
    "having", "if", "ignore", "immediate", "in", "index", "indexed", "initially", "inner",
    "insert", "instead", "intersect", "into", "is", "isnull", "join", "key", "left", "like",
    "limit", "match", "natural", "no", "not", "notnull", "null", "of", "offset", "on", "or",
    "order", "outer", "plan", "pragma", "primary", "query", "raise", "references", "regexp",
    "reindex", "release", "rename", "replace", "restrict", "right", "rollback", "row",
    "savepoint", "select", "set", "table", "temp", "temporary", "then", "to", "transaction",
    "trigger", "union", "unique", "update", "using", "vacuum", "values", "view", "virtual",
    "when", "where",
];

/// Columns of `runs` that features may not take.
const FIXED_RUN_COLUMNS: [&str; 3] = ["id", "dirname", "filename"];

const GATHERED_TABLES: &str = "
CREATE TABLE quantities (
    name TEXT PRIMARY KEY,
    unit TEXT,
    description TEXT,
    default_aggregator TEXT
);
CREATE TABLE constants (
    run_id INTEGER,
    rank INTEGER,
    name TEXT,
    value TEXT
);
CREATE TABLE warnings (
    run_id INTEGER,
    rank INTEGER,
    step INTEGER,
    unixtime REAL,
    message TEXT,
    category TEXT,
    filename TEXT,
    lineno INTEGER
);
CREATE TABLE logging (
    run_id INTEGER,
    rank INTEGER,
    step INTEGER,
    unixtime REAL,
    level TEXT,
    message TEXT,
    filename TEXT,
    lineno INTEGER
);
";

// ---------------------------------------------------------------------------
// Column types
// ---------------------------------------------------------------------------

/// Column type of a run feature, ordered from narrowest to widest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SqlType {
    /// Integers and flags.
    Integer,
    /// Floating point numbers.
    Real,
    /// Anything else.
    Text,
}

impl SqlType {
    /// The type name used in DDL.
    pub const fn as_sql(self) -> &'static str {
        match self {
            Self::Integer => "INTEGER",
            Self::Real => "REAL",
            Self::Text => "TEXT",
        }
    }
}

/// The type able to hold values of both `a` and `b`. An unknown type
/// defers to the other one.
pub fn wider(a: Option<SqlType>, b: Option<SqlType>) -> Option<SqlType> {
    a.max(b)
}

/// Column type and value of a stored constant. Null has no type.
pub fn sql_type_and_value(value: &ConstantValue) -> (Option<SqlType>, Value) {
    match value {
        ConstantValue::Null => (None, Value::Null),
        ConstantValue::Bool(b) => (Some(SqlType::Integer), Value::Integer(i64::from(*b))),
        ConstantValue::Int(i) => (Some(SqlType::Integer), Value::Integer(*i)),
        ConstantValue::Real(r) => (Some(SqlType::Real), Value::Real(*r)),
        ConstantValue::Text(s) => (Some(SqlType::Text), Value::Text(s.clone())),
    }
}

/// Column type and value of a feature written as text.
///
/// `None` is null, `True` and `False` are integers, then integer and real
/// parses are tried before falling back to text.
pub fn sql_type_and_value_from_str(value: &str) -> (Option<SqlType>, Value) {
    match value {
        "None" => (None, Value::Null),
        "True" => (Some(SqlType::Integer), Value::Integer(1)),
        "False" => (Some(SqlType::Integer), Value::Integer(0)),
        _ => {
            if let Ok(i) = value.parse::<i64>() {
                (Some(SqlType::Integer), Value::Integer(i))
            } else if let Ok(r) = value.parse::<f64>() {
                (Some(SqlType::Real), Value::Real(r))
            } else {
                (Some(SqlType::Text), Value::Text(value.to_owned()))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Features
// ---------------------------------------------------------------------------

/// One run feature: a future column of `runs`.
#[derive(Debug, Clone, PartialEq)]
pub struct Feature {
    /// Feature (column) name before renaming.
    pub name: String,
    /// Column type of this value, `None` for null.
    pub sql_type: Option<SqlType>,
    /// The value.
    pub value: Value,
}

impl Feature {
    fn new(name: impl Into<String>, (sql_type, value): (Option<SqlType>, Value)) -> Self {
        Self {
            name: name.into(),
            sql_type,
            value,
        }
    }
}

/// Parses features out of directory names like `mesh0.1-np4-solverCG`.
#[derive(Debug, Clone)]
struct DirFeatureParser {
    boolean: Regex,
    integer: Regex,
    real: Regex,
    text: Regex,
}

impl DirFeatureParser {
    fn new() -> Result<Self, QueryError> {
        Ok(Self {
            boolean: Regex::new(r"^([a-z]+)(True|False)$")?,
            integer: Regex::new(r"^([a-z]+)([0-9]+)$")?,
            real: Regex::new(r"^([a-z]+)([0-9]+\.?[0-9]*)$")?,
            text: Regex::new(r"^([a-z]+)([A-Z][A-Za-z_0-9]+)$")?,
        })
    }

    fn parse(&self, segment: &str, index: usize) -> Feature {
        if let Some(caps) = self.boolean.captures(segment) {
            let flag = group(&caps, 2) == "True";
            return Feature::new(group(&caps, 1), (Some(SqlType::Integer), Value::Integer(i64::from(flag))));
        }
        if let Some(caps) = self.integer.captures(segment) {
            if let Ok(i) = group(&caps, 2).parse::<i64>() {
                return Feature::new(group(&caps, 1), (Some(SqlType::Integer), Value::Integer(i)));
            }
        }
        if let Some(caps) = self.real.captures(segment) {
            if let Ok(r) = group(&caps, 2).parse::<f64>() {
                return Feature::new(group(&caps, 1), (Some(SqlType::Real), Value::Real(r)));
            }
        }
        if let Some(caps) = self.text.captures(segment) {
            return Feature::new(
                group(&caps, 1),
                (Some(SqlType::Text), Value::Text(group(&caps, 2).to_owned())),
            );
        }
        Feature::new(
            format!("dirfeat{index}"),
            (Some(SqlType::Text), Value::Text(segment.to_owned())),
        )
    }
}

fn group<'t>(caps: &regex::Captures<'t>, index: usize) -> &'t str {
    caps.get(index).map_or("", |m| m.as_str())
}

/// Where run features come from besides the stored constants.
#[derive(Debug, Clone, Default)]
pub struct FeatureSource {
    dir_parser: Option<DirFeatureParser>,
    dir_features: BTreeMap<String, Vec<Feature>>,
}

impl FeatureSource {
    /// Constants only.
    pub fn new() -> Self {
        Self::default()
    }

    /// Also parse features from the name of each store's directory, split
    /// at `-`.
    pub fn with_dir_features(mut self) -> Result<Self, QueryError> {
        self.dir_parser = Some(DirFeatureParser::new()?);
        Ok(self)
    }

    /// Also read features from a file of `dirname: name=value, ...` lines.
    pub fn with_features_file(mut self, path: &Path) -> Result<Self, QueryError> {
        let text = std::fs::read_to_string(path).map_err(|source| QueryError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        self.dir_features.extend(parse_features_file(&text, path)?);
        Ok(self)
    }

    /// Every feature of the store at `path`, in column order. Later sources
    /// override earlier ones of the same name: features file, then directory
    /// name, then constants.
    pub fn features_for(&self, path: &Path, constants: &BTreeMap<String, ConstantValue>) -> Vec<Feature> {
        let dir = path.parent().unwrap_or_else(|| Path::new(""));
        let mut features = self
            .dir_features
            .get(dir.to_string_lossy().as_ref())
            .cloned()
            .unwrap_or_default();

        if let Some(parser) = &self.dir_parser {
            let leaf = dir.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
            if !leaf.is_empty() {
                for (index, segment) in leaf.split('-').enumerate() {
                    push_feature(&mut features, parser.parse(segment, index));
                }
            }
        }

        for (name, value) in constants {
            push_feature(&mut features, Feature::new(name.as_str(), sql_type_and_value(value)));
        }
        features
    }
}

fn push_feature(features: &mut Vec<Feature>, feature: Feature) {
    match features.iter_mut().find(|f| f.name == feature.name) {
        Some(existing) => *existing = feature,
        None => features.push(feature),
    }
}

/// Parse a features file. Blank lines and empty entries are skipped.
///
/// # Errors
///
/// Returns [`QueryError::FeaturesFile`] for a line without `:` or an entry
/// without `=`.
pub fn parse_features_file(text: &str, path: &Path) -> Result<BTreeMap<String, Vec<Feature>>, QueryError> {
    let mut by_dir = BTreeMap::new();
    for (index, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let line_no = index.saturating_add(1);
        let Some((dir, entries)) = line.split_once(':') else {
            return Err(QueryError::FeaturesFile {
                path: path.to_path_buf(),
                line: line_no,
                message: "expected `dirname: name=value, ...`".to_owned(),
            });
        };
        let mut features = Vec::new();
        for entry in entries.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let Some((name, value)) = entry.split_once('=') else {
                return Err(QueryError::FeaturesFile {
                    path: path.to_path_buf(),
                    line: line_no,
                    message: format!("entry {entry:?} is not name=value"),
                });
            };
            push_feature(
                &mut features,
                Feature::new(name.trim(), sql_type_and_value_from_str(value.trim())),
            );
        }
        by_dir.insert(dir.trim().to_owned(), features);
    }
    Ok(by_dir)
}

/// Parse a rename map of the form `F1=NAME1,F2=NAME2`. An empty string is
/// an empty map.
///
/// # Errors
///
/// Returns [`QueryError::NameMap`] for an entry that is not `FROM=TO` with
/// both sides made of letters, digits and underscores.
pub fn parse_name_map(map: &str) -> Result<BTreeMap<String, String>, QueryError> {
    let mut names = BTreeMap::new();
    if map.trim().is_empty() {
        return Ok(names);
    }
    let is_word = |s: &str| !s.is_empty() && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    for entry in map.split(',') {
        match entry.split_once('=') {
            Some((from, to)) if is_word(from) && is_word(to) => {
                names.insert(from.to_owned(), to.to_owned());
            }
            _ => {
                return Err(QueryError::NameMap {
                    entry: entry.to_owned(),
                });
            }
        }
    }
    Ok(names)
}

// ---------------------------------------------------------------------------
// Scan
// ---------------------------------------------------------------------------

/// One input store and the run it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScannedStore {
    /// Path of the store.
    pub path: PathBuf,
    /// Run id in the gathered store, starting at 1.
    pub run_id: i64,
}

/// Result of [`scan`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanResult {
    /// Every feature with its widened type, in order of first appearance.
    pub features: Vec<(String, SqlType)>,
    /// Every input in the order given.
    pub stores: Vec<ScannedStore>,
}

impl ScanResult {
    /// Number of distinct runs.
    pub fn run_count(&self) -> usize {
        self.stores.iter().map(|s| s.run_id).collect::<BTreeSet<_>>().len()
    }
}

/// Read every input's features and assign run ids.
///
/// # Errors
///
/// Returns [`QueryError::Log`] if an input cannot be opened as a log store.
pub fn scan<P: AsRef<Path>>(source: &FeatureSource, paths: &[P]) -> Result<ScanResult, QueryError> {
    let mut result = ScanResult::default();
    let mut by_unique_id: BTreeMap<String, i64> = BTreeMap::new();
    let mut next_run_id: i64 = 1;

    for path in paths {
        let path = path.as_ref();
        let manager = open_input(path)?;

        let unique = manager
            .constant("unique_run_id")
            .and_then(ConstantValue::as_str)
            .map(str::to_owned);
        let existing = unique.as_deref().and_then(|u| by_unique_id.get(u)).copied();
        let run_id = match existing {
            Some(id) => id,
            None => {
                let id = next_run_id;
                next_run_id = next_run_id.saturating_add(1);
                if let Some(unique) = unique {
                    by_unique_id.insert(unique, id);
                }
                id
            }
        };

        for feature in source.features_for(path, manager.constants()) {
            match result.features.iter_mut().find(|(name, _)| *name == feature.name) {
                Some((_, sql_type)) => *sql_type = feature.sql_type.map_or(*sql_type, |t| t.max(*sql_type)),
                None => result
                    .features
                    .push((feature.name, feature.sql_type.unwrap_or(SqlType::Text))),
            }
        }

        debug!(path = %path.display(), run_id, "Scanned store");
        result.stores.push(ScannedStore {
            path: path.to_path_buf(),
            run_id,
        });
        manager.close()?;
    }

    info!(
        stores = result.stores.len(),
        runs = result.run_count(),
        features = result.features.len(),
        "Scan complete"
    );
    Ok(result)
}

fn open_input(path: &Path) -> Result<LogManager, QueryError> {
    LogManager::open(Some(path), OpenMode::Read, None, OpenOptions::default()).map_err(|err| {
        warn!(path = %path.display(), error = %err, "Trouble with input store");
        QueryError::from(err)
    })
}

// ---------------------------------------------------------------------------
// Gather
// ---------------------------------------------------------------------------

/// Renames applied while gathering.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GatherOptions {
    /// Feature name to column name.
    pub feature_names: BTreeMap<String, String>,
    /// Quantity name to table name. Several quantities may share a target.
    pub quantity_names: BTreeMap<String, String>,
}

struct FeatureColumn<'a> {
    feature: &'a str,
    column: String,
    sql_type: SqlType,
}

fn feature_columns<'a>(scan: &'a ScanResult, options: &GatherOptions) -> Vec<FeatureColumn<'a>> {
    scan.features
        .iter()
        .map(|(name, sql_type)| {
            let target = options.feature_names.get(name).unwrap_or(name);
            let lower = target.to_ascii_lowercase();
            let column = if SQLITE_KEYWORDS.contains(&lower.as_str()) || FIXED_RUN_COLUMNS.contains(&lower.as_str())
            {
                format!("{target}_")
            } else {
                target.clone()
            };
            FeatureColumn {
                feature: name,
                column,
                sql_type: *sql_type,
            }
        })
        .collect()
}

fn quote(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Write the multi-run store described by `scan`.
///
/// Everything is written inside one transaction.
///
/// # Errors
///
/// - [`QueryError::OutputExists`] if the target file exists.
/// - [`QueryError::Db`] if a renamed quantity is not a usable table name.
/// - [`QueryError::Log`] or [`QueryError::Sqlite`] for input or output
///   failures.
pub fn gather(
    target: &StoreTarget,
    source: &FeatureSource,
    scan: &ScanResult,
    options: &GatherOptions,
) -> Result<Connection, QueryError> {
    let columns = feature_columns(scan, options);
    let mut conn = match target {
        StoreTarget::Memory => Connection::open_in_memory()?,
        StoreTarget::File(path) => {
            if path.exists() {
                return Err(QueryError::OutputExists { path: path.clone() });
            }
            Connection::open(path)?
        }
    };

    let tx = conn.transaction()?;
    create_schema(&tx, &columns)?;

    let mut written_runs = BTreeSet::new();
    let mut created_tables = BTreeSet::new();
    for store in &scan.stores {
        let manager = open_input(&store.path)?;
        if written_runs.insert(store.run_id) {
            let features = source.features_for(&store.path, manager.constants());
            insert_run(&tx, store, &features, &columns)?;
        }
        copy_constants(&tx, store.run_id, &manager)?;
        copy_records(&tx, store.run_id, &manager)?;
        copy_quantities(&tx, store.run_id, &manager, options, &mut created_tables)?;
        manager.close()?;
    }

    tx.execute(
        "INSERT INTO constants (run_id, rank, name, value) VALUES (NULL, NULL, ?1, ?2)",
        params![
            SCHEMA_VERSION_KEY,
            serde_json::to_string(&ConstantValue::from(SCHEMA_VERSION))?
        ],
    )?;
    tx.commit()?;

    info!(
        output = ?target,
        runs = written_runs.len(),
        quantities = created_tables.len(),
        "Gathered stores"
    );
    Ok(conn)
}

fn create_schema(conn: &Connection, columns: &[FeatureColumn<'_>]) -> Result<(), QueryError> {
    let mut run_columns = vec![
        "id INTEGER PRIMARY KEY".to_owned(),
        "dirname TEXT".to_owned(),
        "filename TEXT".to_owned(),
    ];
    run_columns.extend(
        columns
            .iter()
            .map(|c| format!("{} {}", quote(&c.column), c.sql_type.as_sql())),
    );
    conn.execute_batch(&format!("CREATE TABLE runs ({});", run_columns.join(", ")))?;
    conn.execute_batch(GATHERED_TABLES)?;
    Ok(())
}

fn insert_run(
    conn: &Connection,
    store: &ScannedStore,
    features: &[Feature],
    columns: &[FeatureColumn<'_>],
) -> Result<(), QueryError> {
    let dirname = store
        .path
        .parent()
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_default();
    let filename = store
        .path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    let mut names = vec!["id".to_owned(), "dirname".to_owned(), "filename".to_owned()];
    let mut values = vec![Value::Integer(store.run_id), Value::Text(dirname), Value::Text(filename)];
    for feature in features {
        if let Some(column) = columns.iter().find(|c| c.feature == feature.name) {
            names.push(quote(&column.column));
            values.push(feature.value.clone());
        }
    }
    let placeholders = vec!["?"; values.len()].join(", ");
    conn.execute(
        &format!("INSERT INTO runs ({}) VALUES ({placeholders})", names.join(", ")),
        params_from_iter(values.iter()),
    )?;
    Ok(())
}

fn copy_constants(conn: &Connection, run_id: i64, manager: &LogManager) -> Result<(), QueryError> {
    let mut insert =
        conn.prepare_cached("INSERT INTO constants (run_id, rank, name, value) VALUES (?1, ?2, ?3, ?4)")?;
    for (name, value) in manager.constants() {
        insert.execute(params![run_id, manager.rank(), name, serde_json::to_string(value)?])?;
    }
    Ok(())
}

fn copy_records(conn: &Connection, run_id: i64, manager: &LogManager) -> Result<(), QueryError> {
    for kind in [RecordKind::Warning, RecordKind::Logging] {
        let records = match kind {
            RecordKind::Warning => manager.warnings()?,
            RecordKind::Logging => manager.logging_records()?,
        };
        let mut insert = conn.prepare_cached(&format!(
            "INSERT INTO {table} (run_id, rank, step, unixtime, {category}, message, filename, lineno)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            table = kind.table_name(),
            category = kind.category_column(),
        ))?;
        for record in &records {
            insert.execute(params![
                run_id,
                record.rank,
                step_to_sql(record.step)?,
                record.unixtime,
                record.category,
                record.message,
                record.filename,
                record.lineno,
            ])?;
        }
    }
    Ok(())
}

fn copy_quantities(
    conn: &Connection,
    run_id: i64,
    manager: &LogManager,
    options: &GatherOptions,
    created: &mut BTreeSet<String>,
) -> Result<(), QueryError> {
    for meta in manager.quantities().values() {
        let target = options.quantity_names.get(&meta.name).unwrap_or(&meta.name);
        validate_quantity_name(target)?;
        if created.insert(target.clone()) {
            conn.execute_batch(&format!(
                "CREATE TABLE \"{target}\" (run_id INTEGER, step INTEGER, rank INTEGER, value REAL);
                 CREATE INDEX \"{target}_main\" ON \"{target}\" (run_id, step, rank);"
            ))?;
        }
        conn.execute(
            "INSERT OR IGNORE INTO quantities (name, unit, description, default_aggregator)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                target,
                meta.unit,
                meta.description,
                meta.default_aggregator.as_ref().map(Aggregator::as_str),
            ],
        )?;

        let mut select = manager
            .store()
            .connection()
            .prepare(&format!("SELECT step, rank, value FROM \"{}\"", meta.name))?;
        let mut insert = conn.prepare_cached(&format!(
            "INSERT INTO \"{target}\" (run_id, step, rank, value) VALUES (?1, ?2, ?3, ?4)"
        ))?;
        let mut rows = select.query([])?;
        let mut copied: usize = 0;
        while let Some(row) = rows.next()? {
            insert.execute(params![
                run_id,
                row.get::<_, Option<i64>>(0)?,
                row.get::<_, Option<i64>>(1)?,
                row.get::<_, Option<f64>>(2)?,
            ])?;
            copied = copied.saturating_add(1);
        }
        debug!(quantity = %meta.name, table = %target, run_id, rows = copied, "Copied quantity");
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use super::*;

    #[test]
    fn widening_prefers_the_wider_type() {
        assert_eq!(wider(Some(SqlType::Integer), Some(SqlType::Real)), Some(SqlType::Real));
        assert_eq!(wider(Some(SqlType::Text), Some(SqlType::Real)), Some(SqlType::Text));
        assert_eq!(wider(None, Some(SqlType::Integer)), Some(SqlType::Integer));
        assert_eq!(wider(None, None), None);
    }

    #[test]
    fn values_from_text() {
        assert_eq!(sql_type_and_value_from_str("None"), (None, Value::Null));
        assert_eq!(
            sql_type_and_value_from_str("True"),
            (Some(SqlType::Integer), Value::Integer(1))
        );
        assert_eq!(
            sql_type_and_value_from_str("-3"),
            (Some(SqlType::Integer), Value::Integer(-3))
        );
        assert_eq!(
            sql_type_and_value_from_str("0.5"),
            (Some(SqlType::Real), Value::Real(0.5))
        );
        assert_eq!(
            sql_type_and_value_from_str("cg"),
            (Some(SqlType::Text), Value::Text("cg".to_owned()))
        );
    }

    #[test]
    fn constants_map_to_columns() {
        assert_eq!(
            sql_type_and_value(&ConstantValue::Bool(true)),
            (Some(SqlType::Integer), Value::Integer(1))
        );
        assert_eq!(sql_type_and_value(&ConstantValue::Null), (None, Value::Null));
    }

    #[test]
    fn directory_segments() {
        let parser = DirFeatureParser::new().unwrap();
        assert_eq!(
            parser.parse("adaptiveTrue", 0),
            Feature::new("adaptive", (Some(SqlType::Integer), Value::Integer(1)))
        );
        assert_eq!(
            parser.parse("np4", 1),
            Feature::new("np", (Some(SqlType::Integer), Value::Integer(4)))
        );
        assert_eq!(
            parser.parse("mesh0.25", 2),
            Feature::new("mesh", (Some(SqlType::Real), Value::Real(0.25)))
        );
        assert_eq!(
            parser.parse("solverCG", 3),
            Feature::new("solver", (Some(SqlType::Text), Value::Text("CG".to_owned())))
        );
        assert_eq!(
            parser.parse("3d", 4),
            Feature::new("dirfeat4", (Some(SqlType::Text), Value::Text("3d".to_owned())))
        );
    }

    #[test]
    fn features_from_directory_and_constants() {
        let source = FeatureSource::new().with_dir_features().unwrap();
        let mut constants = BTreeMap::new();
        constants.insert("np".to_owned(), ConstantValue::Int(8));
        constants.insert("dt".to_owned(), ConstantValue::Real(0.1));
        let features = source.features_for(Path::new("out/np4-solverCG/run.sqlite"), &constants);
        let names: Vec<&str> = features.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, ["np", "solver", "dt"]);
        assert_eq!(features[0].value, Value::Integer(8));
    }

    #[test]
    fn features_file_lines() {
        let path = Path::new("features.txt");
        let parsed = parse_features_file("runs/a: mesh=0.5, solver=cg\n\nruns/b: mesh=1\n", path).unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(
            parsed["runs/a"],
            vec![
                Feature::new("mesh", (Some(SqlType::Real), Value::Real(0.5))),
                Feature::new("solver", (Some(SqlType::Text), Value::Text("cg".to_owned()))),
            ]
        );

        let err = parse_features_file("runs/a mesh=1\n", path).unwrap_err();
        assert!(matches!(err, QueryError::FeaturesFile { line: 1, .. }));
        let err = parse_features_file("ok: a=1\nruns/a: mesh\n", path).unwrap_err();
        assert!(matches!(err, QueryError::FeaturesFile { line: 2, .. }));
    }

    #[test]
    fn name_maps() {
        assert!(parse_name_map("").unwrap().is_empty());
        let map = parse_name_map("dt=timestep,np=ranks").unwrap();
        assert_eq!(map["dt"], "timestep");
        assert_eq!(map["np"], "ranks");
        assert!(matches!(parse_name_map("dt=a-b"), Err(QueryError::NameMap { .. })));
        assert!(matches!(parse_name_map("dt"), Err(QueryError::NameMap { .. })));
    }

    #[test]
    fn keyword_and_reserved_columns_get_suffix() {
        let scan = ScanResult {
            features: vec![
                ("order".to_owned(), SqlType::Integer),
                ("id".to_owned(), SqlType::Text),
                ("dt".to_owned(), SqlType::Real),
                ("np".to_owned(), SqlType::Integer),
            ],
            stores: Vec::new(),
        };
        let options = GatherOptions {
            feature_names: parse_name_map("np=ranks").unwrap(),
            ..GatherOptions::default()
        };
        let columns: Vec<String> = feature_columns(&scan, &options).into_iter().map(|c| c.column).collect();
        assert_eq!(columns, ["order_", "id_", "dt", "ranks"]);
    }
}
