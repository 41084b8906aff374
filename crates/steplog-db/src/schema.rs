//! Persisted schema of a single-run log store.
//!
//! | Version | Change                                              |
//! |---------|-----------------------------------------------------|
//! | 0       | quantities, constants, per-quantity tables          |
//! | 1       | `warnings` table                                    |
//! | 2       | `warnings.rank`                                     |
//! | 3       | `warnings.unixtime`, `logging` table                |
//! | 4       | gathered constants normalized into `(run_id, rank)` |
//!
//! New stores are always created at [`SCHEMA_VERSION`].

use crate::error::DbError;

/// Schema version written into the `schema_version` constant of new stores.
pub const SCHEMA_VERSION: u32 = 4;

/// Name of the constant carrying the schema version.
pub const SCHEMA_VERSION_KEY: &str = "schema_version";

/// Table names that quantities may not take.
pub const RESERVED_TABLES: [&str; 5] = ["quantities", "constants", "warnings", "logging", "runs"];

/// Tables every single-run store starts with.
pub const CREATE_LOG_TABLES: &str = "
CREATE TABLE quantities (
    name TEXT PRIMARY KEY,
    unit TEXT,
    description TEXT,
    default_aggregator TEXT
);
CREATE TABLE constants (
    name TEXT PRIMARY KEY,
    value TEXT
);
CREATE TABLE warnings (
    rank INTEGER,
    step INTEGER,
    unixtime REAL,
    message TEXT,
    category TEXT,
    filename TEXT,
    lineno INTEGER
);
CREATE TABLE logging (
    rank INTEGER,
    step INTEGER,
    unixtime REAL,
    level TEXT,
    message TEXT,
    filename TEXT,
    lineno INTEGER
);
";

/// DDL for the append-only table of one quantity.
///
/// The name must have passed [`validate_quantity_name`].
pub fn quantity_table_ddl(name: &str) -> String {
    format!("CREATE TABLE \"{name}\" (step INTEGER, rank INTEGER, value REAL)")
}

/// Whether `name` is a plain SQL identifier (`[A-Za-z_][A-Za-z0-9_]*`).
pub fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Check that a quantity name can safely become a table name.
///
/// # Errors
///
/// Returns [`DbError::InvalidName`] if the name is not an identifier,
/// collides with a reserved table, or uses the `sqlite_` prefix.
pub fn validate_quantity_name(name: &str) -> Result<(), DbError> {
    let reason = if !is_identifier(name) {
        Some("must match [A-Za-z_][A-Za-z0-9_]*")
    } else if RESERVED_TABLES.iter().any(|t| t.eq_ignore_ascii_case(name)) {
        Some("collides with a reserved table")
    } else if name.to_ascii_lowercase().starts_with("sqlite_") {
        Some("the sqlite_ prefix is reserved")
    } else {
        None
    };
    match reason {
        Some(reason) => Err(DbError::InvalidName {
            name: name.to_owned(),
            reason,
        }),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifiers() {
        assert!(is_identifier("t_step"));
        assert!(is_identifier("_x1"));
        assert!(!is_identifier("1x"));
        assert!(!is_identifier("a-b"));
        assert!(!is_identifier(""));
    }

    #[test]
    fn reserved_names_are_rejected() {
        assert!(validate_quantity_name("warnings").is_err());
        assert!(validate_quantity_name("Runs").is_err());
        assert!(validate_quantity_name("sqlite_master").is_err());
        assert!(validate_quantity_name("t_log").is_ok());
    }
}
