//! Magic SQL: quantities referenced by name.
//!
//! In a gathered store every quantity is a table of `(run_id, step, rank,
//! value)` rows and every run a row of `runs`. A magic query names
//! quantities directly and leaves the joins to the mangler:
//!
//! ```text
//! select $t_step.max, $dt where mesh_size > 0.1
//! ```
//!
//! becomes
//!
//! ```text
//! select max_t_step.value AS t_step, dt.value AS dt
//! FROM runs
//!   INNER JOIN rankagg_max_t_step AS max_t_step ON (max_t_step.run_id = runs.id)
//!   INNER JOIN dt ON (dt.run_id = runs.id AND max_t_step.step = dt.step)
//! where mesh_size > 0.1
//! ```
//!
//! A `$name` token reads the quantity's own table, one row per rank. A
//! `$name.agg` token reads a temporary table holding one row per run and
//! step, reduced across ranks. Tokens in the select list get an `AS name`
//! alias; tokens after it are plain column references.
//!
//! The `FROM` clause goes where the query has a `$$` marker, otherwise in
//! front of the first trailing clause keyword, otherwise at the end. A query
//! that already has a `FROM` and no marker, or that has neither tokens nor a
//! marker, is left alone.

use regex::Regex;

use crate::error::QueryError;

/// Placeholder replaced by the generated `FROM` clause.
pub const FROM_MARKER: &str = "$$";

/// Reductions a `$name.suffix` token may use, with the SQL aggregate each
/// one maps to.
pub const RANK_AGGREGATORS: [(&str, &str); 9] = [
    ("min", "min"),
    ("max", "max"),
    ("avg", "avg"),
    ("sum", "sum"),
    ("median", "median"),
    ("norm1", "norm1"),
    ("norm2", "norm2"),
    ("var", "var"),
    ("stddev", "stddev"),
];

/// One quantity reference found in a query.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MagicColumn {
    /// Quantity (table) name.
    pub quantity: String,
    /// Rank reduction, if any.
    pub aggregator: Option<String>,
}

impl MagicColumn {
    /// Alias of the joined table inside the query.
    pub fn alias(&self) -> String {
        match &self.aggregator {
            Some(agg) => format!("{agg}_{}", self.quantity),
            None => self.quantity.clone(),
        }
    }
}

/// Name of the temporary table holding `quantity` reduced with `aggregator`.
pub fn rank_agg_table(quantity: &str, aggregator: &str) -> String {
    format!("rankagg_{aggregator}_{quantity}")
}

/// SQL aggregate function for a token suffix.
pub fn sql_aggregate(suffix: &str) -> Option<&'static str> {
    RANK_AGGREGATORS
        .iter()
        .find(|(name, _)| *name == suffix)
        .map(|(_, sql)| *sql)
}

/// Rewrites magic queries.
#[derive(Debug, Clone)]
pub struct Mangler {
    token: Regex,
    clause: Regex,
}

impl Mangler {
    /// Compile the token and clause patterns.
    pub fn new() -> Result<Self, QueryError> {
        Ok(Self {
            token: Regex::new(r"\$([a-zA-Z][A-Za-z0-9_]*)(\.[a-z]*)?")?,
            clause: Regex::new(r"(?i)\b(UNION|INTERSECT|EXCEPT|WHERE|GROUP|HAVING|ORDER|LIMIT)\b|;")?,
        })
    }

    /// The distinct quantity references of `query`, in order of first
    /// appearance.
    ///
    /// # Errors
    ///
    /// Returns [`QueryError::UnknownAggregator`] for an unrecognized suffix.
    pub fn columns(&self, query: &str) -> Result<Vec<MagicColumn>, QueryError> {
        let mut columns: Vec<MagicColumn> = Vec::new();
        for caps in self.token.captures_iter(query) {
            let column = Self::column_of(&caps)?;
            if !columns.contains(&column) {
                columns.push(column);
            }
        }
        Ok(columns)
    }

    /// Rewrite `query`.
    ///
    /// `materialize` is called once per distinct aggregated reference, in
    /// order of first appearance, and returns the table to join under the
    /// reference's alias.
    ///
    /// # Errors
    ///
    /// Returns [`QueryError::UnknownAggregator`] for an unrecognized suffix,
    /// or whatever `materialize` returns.
    pub fn mangle<F>(&self, query: &str, mut materialize: F) -> Result<String, QueryError>
    where
        F: FnMut(&MagicColumn) -> Result<String, QueryError>,
    {
        let marker = query.find(FROM_MARKER);
        if marker.is_none() && query.to_uppercase().contains("FROM") {
            return Ok(query.to_owned());
        }
        let columns = self.columns(query)?;
        if columns.is_empty() && marker.is_none() {
            return Ok(query.to_owned());
        }

        let (head, tail) = match marker {
            Some(pos) => (
                query.get(..pos).unwrap_or_default(),
                query.get(pos.saturating_add(FROM_MARKER.len())..).unwrap_or_default(),
            ),
            None => {
                let split = self.clause.find(query).map_or(query.len(), |m| m.start());
                query.split_at(split)
            }
        };

        let head = self.substitute(head, true)?;
        let tail = self.substitute(tail, false)?;
        let from = from_clause(&columns, &mut materialize)?;
        Ok(format!("{} {from} {}", head.trim_end(), tail.trim_start()).trim_end().to_owned())
    }

    fn column_of(caps: &regex::Captures<'_>) -> Result<MagicColumn, QueryError> {
        let quantity = caps.get(1).map(|m| m.as_str().to_owned()).unwrap_or_default();
        let aggregator = match caps.get(2) {
            None => None,
            Some(m) => {
                let suffix = m.as_str().trim_start_matches('.');
                if sql_aggregate(suffix).is_none() {
                    return Err(QueryError::UnknownAggregator {
                        quantity,
                        suffix: suffix.to_owned(),
                    });
                }
                Some(suffix.to_owned())
            }
        };
        Ok(MagicColumn { quantity, aggregator })
    }

    fn substitute(&self, text: &str, alias: bool) -> Result<String, QueryError> {
        let mut out = String::with_capacity(text.len());
        let mut last = 0;
        for caps in self.token.captures_iter(text) {
            let Some(whole) = caps.get(0) else {
                continue;
            };
            let column = Self::column_of(&caps)?;
            out.push_str(text.get(last..whole.start()).unwrap_or_default());
            out.push_str(&column.alias());
            out.push_str(".value");
            if alias {
                out.push_str(" AS ");
                out.push_str(&column.quantity);
            }
            last = whole.end();
        }
        out.push_str(text.get(last..).unwrap_or_default());
        Ok(out)
    }
}

/// Build `FROM runs INNER JOIN ...` for `columns`.
///
/// Each table joins on `run_id`; every table after the first also matches
/// the step of the table before it. A per-rank table additionally matches
/// the rank of the most recent per-rank table, since reduced tables carry no
/// rank.
fn from_clause<F>(columns: &[MagicColumn], materialize: &mut F) -> Result<String, QueryError>
where
    F: FnMut(&MagicColumn) -> Result<String, QueryError>,
{
    let mut clause = String::from("FROM runs");
    let mut previous: Option<String> = None;
    let mut previous_per_rank: Option<String> = None;
    for column in columns {
        let alias = column.alias();
        let source = match column.aggregator {
            Some(_) => format!("{} AS {alias}", materialize(column)?),
            None => alias.clone(),
        };
        let mut on = format!("{alias}.run_id = runs.id");
        if let Some(prev) = &previous {
            on.push_str(&format!(" AND {prev}.step = {alias}.step"));
        }
        if column.aggregator.is_none() {
            if let Some(prev) = &previous_per_rank {
                on.push_str(&format!(" AND {prev}.rank = {alias}.rank"));
            }
            previous_per_rank = Some(alias.clone());
        }
        clause.push_str(&format!(" INNER JOIN {source} ON ({on})"));
        previous = Some(alias);
    }
    Ok(clause)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn mangle(query: &str) -> Result<String, QueryError> {
        Mangler::new()
            .unwrap()
            .mangle(query, |c| Ok(rank_agg_table(&c.quantity, c.aggregator.as_deref().unwrap_or_default())))
    }

    #[test]
    fn plain_queries_are_untouched() {
        for query in [
            "select * from runs",
            "SELECT $A FROM runs",
            "select 1",
            "select count(*) where 1",
        ] {
            assert_eq!(mangle(query).unwrap(), query);
        }
    }

    #[test]
    fn aggregated_and_per_rank_references() {
        assert_eq!(
            mangle("select $A.max, $B").unwrap(),
            "select max_A.value AS A, B.value AS B FROM runs \
             INNER JOIN rankagg_max_A AS max_A ON (max_A.run_id = runs.id) \
             INNER JOIN B ON (B.run_id = runs.id AND max_A.step = B.step)"
        );
    }

    #[test]
    fn per_rank_tables_match_rank() {
        assert_eq!(
            mangle("select $A, $B").unwrap(),
            "select A.value AS A, B.value AS B FROM runs \
             INNER JOIN A ON (A.run_id = runs.id) \
             INNER JOIN B ON (B.run_id = runs.id AND A.step = B.step AND A.rank = B.rank)"
        );
    }

    #[test]
    fn from_goes_before_first_trailing_clause() {
        assert_eq!(
            mangle("select $t_step.sum where $t_step.sum > 1 order by 1").unwrap(),
            "select sum_t_step.value AS t_step FROM runs \
             INNER JOIN rankagg_sum_t_step AS sum_t_step ON (sum_t_step.run_id = runs.id) \
             where sum_t_step.value > 1 order by 1"
        );
    }

    #[test]
    fn marker_takes_precedence() {
        assert_eq!(
            mangle("select $dt $$ where id = 2").unwrap(),
            "select dt.value AS dt FROM runs INNER JOIN dt ON (dt.run_id = runs.id) where id = 2"
        );
    }

    #[test]
    fn materializes_each_aggregate_once_in_order() {
        let mangler = Mangler::new().unwrap();
        let mut seen = Vec::new();
        mangler
            .mangle("select $b.min, $a.max, $b.min, $a", |c| {
                seen.push(c.alias());
                Ok(c.alias())
            })
            .unwrap();
        assert_eq!(seen, vec!["min_b", "max_a"]);
    }

    #[test]
    fn unknown_suffix_is_an_error() {
        assert!(matches!(
            mangle("select $A.foo"),
            Err(QueryError::UnknownAggregator { ref suffix, .. }) if suffix == "foo"
        ));
        assert!(matches!(mangle("select $A.loc"), Err(QueryError::UnknownAggregator { .. })));
    }
}
