//! Custom SQL functions available to queries.
//!
//! | Name     | Kind      | Result                                   |
//! |----------|-----------|------------------------------------------|
//! | `var`    | aggregate | population variance                      |
//! | `stddev` | aggregate | population standard deviation            |
//! | `norm1`  | aggregate | sum of absolute values                   |
//! | `norm2`  | aggregate | Euclidean norm                           |
//! | `median` | aggregate | median (mean of the middle pair if even) |
//! | `sqrt`   | scalar    | square root                              |
//! | `pow`    | scalar    | `x` raised to `y`                        |
//! | `sprintf`| scalar    | one `printf` conversion applied to a value |
//!
//! Aggregates skip `NULL` inputs and return `NULL` when nothing was seen.

use rusqlite::Connection;
use rusqlite::functions::{Aggregate, Context, FunctionFlags};
use rusqlite::types::{Value, ValueRef};
use steplog_core::watch::{format_e, format_g};

/// Register every custom function on `conn`.
///
/// # Errors
///
/// Returns the `SQLite` error if a registration is rejected.
pub fn register_functions(conn: &Connection) -> rusqlite::Result<()> {
    let flags = FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC;
    conn.create_aggregate_function("var", 1, flags, Moments { root: false })?;
    conn.create_aggregate_function("stddev", 1, flags, Moments { root: true })?;
    conn.create_aggregate_function("norm1", 1, flags, Norm1)?;
    conn.create_aggregate_function("norm2", 1, flags, Norm2)?;
    conn.create_aggregate_function("median", 1, flags, Median)?;

    conn.create_scalar_function("sqrt", 1, flags, |ctx| {
        Ok(ctx.get::<Option<f64>>(0)?.map(f64::sqrt))
    })?;
    conn.create_scalar_function("pow", 2, flags, |ctx| {
        let base = ctx.get::<Option<f64>>(0)?;
        let exponent = ctx.get::<Option<f64>>(1)?;
        Ok(base.zip(exponent).map(|(b, e)| b.powf(e)))
    })?;
    conn.create_scalar_function("sprintf", 2, flags, |ctx| {
        let format = ctx.get::<String>(0)?;
        let arg = ctx.get_raw(1);
        Ok(sprintf(&format, arg))
    })?;
    Ok(())
}

fn next_value(ctx: &Context<'_>) -> rusqlite::Result<Option<f64>> {
    ctx.get::<Option<f64>>(0)
}

/// Running count, sum and sum of squares.
#[derive(Debug, Default, Clone, Copy)]
struct Sums {
    count: u64,
    sum: f64,
    sum_sq: f64,
}

struct Moments {
    root: bool,
}

impl Aggregate<Sums, Option<f64>> for Moments {
    fn init(&self, _ctx: &mut Context<'_>) -> rusqlite::Result<Sums> {
        Ok(Sums::default())
    }

    fn step(&self, ctx: &mut Context<'_>, acc: &mut Sums) -> rusqlite::Result<()> {
        if let Some(x) = next_value(ctx)? {
            acc.count = acc.count.saturating_add(1);
            acc.sum += x;
            acc.sum_sq = x.mul_add(x, acc.sum_sq);
        }
        Ok(())
    }

    fn finalize(&self, _ctx: &mut Context<'_>, acc: Option<Sums>) -> rusqlite::Result<Option<f64>> {
        Ok(acc.filter(|a| a.count > 0).map(|a| {
            #[allow(clippy::cast_precision_loss)]
            let n = a.count as f64;
            let variance = ((a.sum_sq - a.sum * a.sum / n) / n).max(0.0);
            if self.root { variance.sqrt() } else { variance }
        }))
    }
}

struct Norm1;

impl Aggregate<Option<f64>, Option<f64>> for Norm1 {
    fn init(&self, _ctx: &mut Context<'_>) -> rusqlite::Result<Option<f64>> {
        Ok(None)
    }

    fn step(&self, ctx: &mut Context<'_>, acc: &mut Option<f64>) -> rusqlite::Result<()> {
        if let Some(x) = next_value(ctx)? {
            *acc = Some(acc.unwrap_or_default() + x.abs());
        }
        Ok(())
    }

    fn finalize(&self, _ctx: &mut Context<'_>, acc: Option<Option<f64>>) -> rusqlite::Result<Option<f64>> {
        Ok(acc.flatten())
    }
}

struct Norm2;

impl Aggregate<Option<f64>, Option<f64>> for Norm2 {
    fn init(&self, _ctx: &mut Context<'_>) -> rusqlite::Result<Option<f64>> {
        Ok(None)
    }

    fn step(&self, ctx: &mut Context<'_>, acc: &mut Option<f64>) -> rusqlite::Result<()> {
        if let Some(x) = next_value(ctx)? {
            *acc = Some(x.mul_add(x, acc.unwrap_or_default()));
        }
        Ok(())
    }

    fn finalize(&self, _ctx: &mut Context<'_>, acc: Option<Option<f64>>) -> rusqlite::Result<Option<f64>> {
        Ok(acc.flatten().map(f64::sqrt))
    }
}

struct Median;

impl Aggregate<Vec<f64>, Option<f64>> for Median {
    fn init(&self, _ctx: &mut Context<'_>) -> rusqlite::Result<Vec<f64>> {
        Ok(Vec::new())
    }

    fn step(&self, ctx: &mut Context<'_>, acc: &mut Vec<f64>) -> rusqlite::Result<()> {
        if let Some(x) = next_value(ctx)? {
            acc.push(x);
        }
        Ok(())
    }

    fn finalize(&self, _ctx: &mut Context<'_>, acc: Option<Vec<f64>>) -> rusqlite::Result<Option<f64>> {
        let Some(mut values) = acc else {
            return Ok(None);
        };
        values.sort_by(f64::total_cmp);
        let mid = values.len() / 2;
        let median = if values.len() % 2 == 0 {
            values
                .get(mid.saturating_sub(1))
                .zip(values.get(mid))
                .map(|(a, b)| (a + b) / 2.0)
        } else {
            values.get(mid).copied()
        };
        Ok(median)
    }
}

// ---------------------------------------------------------------------------
// sprintf
// ---------------------------------------------------------------------------

struct Conversion {
    left: bool,
    zero: bool,
    plus: bool,
    width: usize,
    precision: Option<usize>,
    kind: char,
}

/// Apply the single conversion in `format` to `arg`. `%%` is a literal
/// percent sign; text around the conversion is kept. A format without a
/// valid conversion is returned unchanged.
pub fn sprintf(format: &str, arg: ValueRef<'_>) -> String {
    let mut out = String::with_capacity(format.len().saturating_add(16));
    let mut rest = format;
    let mut converted = false;
    while let Some(pos) = rest.find('%') {
        let (literal, tail) = rest.split_at(pos);
        out.push_str(literal);
        if let Some(after) = tail.strip_prefix("%%") {
            out.push('%');
            rest = after;
            continue;
        }
        match parse_conversion(tail.get(1..).unwrap_or_default()) {
            Some((conversion, used)) if !converted => {
                out.push_str(&apply(&conversion, arg));
                converted = true;
                rest = tail.get(used.saturating_add(1)..).unwrap_or_default();
            }
            _ => {
                out.push('%');
                rest = tail.get(1..).unwrap_or_default();
            }
        }
    }
    out.push_str(rest);
    out
}

fn parse_conversion(spec: &str) -> Option<(Conversion, usize)> {
    let mut conversion = Conversion {
        left: false,
        zero: false,
        plus: false,
        width: 0,
        precision: None,
        kind: 's',
    };
    let mut chars = spec.char_indices().peekable();
    while let Some(&(_, c)) = chars.peek() {
        match c {
            '-' => conversion.left = true,
            '0' => conversion.zero = true,
            '+' => conversion.plus = true,
            _ => break,
        }
        chars.next();
    }
    let mut width = String::new();
    while let Some(&(_, c)) = chars.peek().filter(|(_, c)| c.is_ascii_digit()) {
        width.push(c);
        chars.next();
    }
    conversion.width = width.parse().unwrap_or_default();
    if chars.peek().is_some_and(|&(_, c)| c == '.') {
        chars.next();
        let mut digits = String::new();
        while let Some(&(_, c)) = chars.peek().filter(|(_, c)| c.is_ascii_digit()) {
            digits.push(c);
            chars.next();
        }
        conversion.precision = Some(digits.parse().unwrap_or_default());
    }
    let (index, kind) = chars.next()?;
    if !matches!(kind, 's' | 'd' | 'i' | 'f' | 'e' | 'g') {
        return None;
    }
    conversion.kind = kind;
    Some((conversion, index.saturating_add(kind.len_utf8())))
}

fn apply(conversion: &Conversion, arg: ValueRef<'_>) -> String {
    let number = match arg {
        ValueRef::Integer(i) => {
            #[allow(clippy::cast_precision_loss)]
            let as_float = i as f64;
            Some(as_float)
        }
        ValueRef::Real(r) => Some(r),
        ValueRef::Text(t) => std::str::from_utf8(t).ok().and_then(|s| s.trim().parse().ok()),
        ValueRef::Null | ValueRef::Blob(_) => None,
    };
    let body = match (conversion.kind, number) {
        ('s', _) | (_, None) => {
            let text = display_value(arg);
            match conversion.precision {
                Some(p) => text.chars().take(p).collect(),
                None => text,
            }
        }
        ('d' | 'i', Some(n)) => format!("{:.0}", n.trunc()),
        ('f', Some(n)) => format!("{n:.prec$}", prec = conversion.precision.unwrap_or(6)),
        ('e', Some(n)) => format_e(n, conversion.precision.unwrap_or(6)),
        (_, Some(n)) => format_g(n, conversion.precision.unwrap_or(6)),
    };
    let body = if conversion.plus && conversion.kind != 's' && !body.starts_with('-') {
        format!("+{body}")
    } else {
        body
    };
    pad(&body, conversion)
}

fn pad(body: &str, conversion: &Conversion) -> String {
    let len = body.chars().count();
    if len >= conversion.width {
        return body.to_owned();
    }
    let fill = conversion.width.saturating_sub(len);
    if conversion.left {
        format!("{body}{}", " ".repeat(fill))
    } else if conversion.zero && conversion.kind != 's' {
        let (sign, digits) = match body.strip_prefix(['-', '+']) {
            Some(digits) => body.split_at(body.len().saturating_sub(digits.len())),
            None => ("", body),
        };
        format!("{sign}{}{digits}", "0".repeat(fill))
    } else {
        format!("{}{body}", " ".repeat(fill))
    }
}

/// Render a column value the way result tables show it.
pub fn display_value(value: ValueRef<'_>) -> String {
    match value {
        ValueRef::Null => "NULL".to_owned(),
        ValueRef::Integer(i) => i.to_string(),
        ValueRef::Real(r) => r.to_string(),
        ValueRef::Text(t) => String::from_utf8_lossy(t).into_owned(),
        ValueRef::Blob(b) => format!("<{} bytes>", b.len()),
    }
}

/// Owned variant of [`display_value`].
pub fn display_owned(value: &Value) -> String {
    display_value(ValueRef::from(value))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::float_cmp)]
mod tests {
    use super::*;

    fn conn_with_values(values: &[Option<f64>]) -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        register_functions(&conn).unwrap();
        conn.execute_batch("CREATE TABLE t (x REAL)").unwrap();
        for v in values {
            conn.execute("INSERT INTO t VALUES (?1)", [v]).unwrap();
        }
        conn
    }

    fn scalar(conn: &Connection, sql: &str) -> Option<f64> {
        conn.query_row(sql, [], |row| row.get(0)).unwrap()
    }

    #[test]
    fn aggregates() {
        let conn = conn_with_values(&[Some(2.0), Some(4.0), None, Some(4.0), Some(4.0), Some(5.0), Some(5.0), Some(7.0), Some(9.0)]);
        assert_eq!(scalar(&conn, "SELECT var(x) FROM t"), Some(4.0));
        assert_eq!(scalar(&conn, "SELECT stddev(x) FROM t"), Some(2.0));
        assert_eq!(scalar(&conn, "SELECT norm1(x) FROM t"), Some(40.0));
        assert_eq!(scalar(&conn, "SELECT median(x) FROM t"), Some(4.5));
    }

    #[test]
    fn norm2_and_empty_input() {
        let conn = conn_with_values(&[Some(3.0), Some(-4.0)]);
        assert_eq!(scalar(&conn, "SELECT norm2(x) FROM t"), Some(5.0));
        assert_eq!(scalar(&conn, "SELECT var(x) FROM t WHERE x > 100"), None);
        assert_eq!(scalar(&conn, "SELECT median(x) FROM t WHERE x > 100"), None);
    }

    #[test]
    fn scalars() {
        let conn = conn_with_values(&[]);
        assert_eq!(scalar(&conn, "SELECT sqrt(16.0)"), Some(4.0));
        assert_eq!(scalar(&conn, "SELECT pow(2, 10)"), Some(1024.0));
        let text: String = conn
            .query_row("SELECT sprintf('t=%8.3f s', 3.14159)", [], |row| row.get(0))
            .unwrap();
        assert_eq!(text, "t=   3.142 s");
    }

    #[test]
    fn sprintf_conversions() {
        assert_eq!(sprintf("%05d", ValueRef::Integer(42)), "00042");
        assert_eq!(sprintf("%-6s|", ValueRef::Text(b"ab")), "ab    |");
        assert_eq!(sprintf("%.2e", ValueRef::Real(1500.0)), "1.50e+03");
        assert_eq!(sprintf("%g%%", ValueRef::Real(0.5)), "0.5%");
        assert_eq!(sprintf("%+.1f", ValueRef::Real(2.26)), "+2.3");
        assert_eq!(sprintf("no conversion", ValueRef::Null), "no conversion");
        assert_eq!(sprintf("%s", ValueRef::Null), "NULL");
    }
}
