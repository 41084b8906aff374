//! Live watch rendering.
//!
//! A watch is a resolved expression plus a display name and a format
//! template. Templates understand these placeholders:
//!
//! | Placeholder   | Replaced by                                   |
//! |---------------|-----------------------------------------------|
//! | `{display}`   | the display name                              |
//! | `{value}`     | the value, shortest round-trip form           |
//! | `{value:g}`   | the value, `%g` style with 6 significant digits |
//! | `{value:.Nf}` | fixed notation with N decimals (also `e`, `g`) |
//! | `{unit}`      | the inferred unit, or nothing                 |
//!
//! `{{` and `}}` produce literal braces.

use std::collections::BTreeMap;

use crate::aggregate::AggregatorRegistry;
use crate::expr::EvalError;
use crate::resolve::ResolvedExpr;

/// Template used when a watch does not supply one.
pub const DEFAULT_FORMAT: &str = "{display}={value:g}";

/// Separator between rendered watches on one line.
pub const SEPARATOR: &str = " | ";

/// A watch as requested by the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchRequest {
    /// Expression text.
    pub expr: String,
    /// Display name; defaults to the expression text.
    pub display: Option<String>,
    /// Format template; defaults to [`DEFAULT_FORMAT`].
    pub format: Option<String>,
}

impl WatchRequest {
    /// Watch `expr` under its own text.
    pub fn new(expr: impl Into<String>) -> Self {
        Self {
            expr: expr.into(),
            display: None,
            format: None,
        }
    }

    /// Show the watch under a different name.
    #[must_use]
    pub fn with_display(mut self, display: impl Into<String>) -> Self {
        self.display = Some(display.into());
        self
    }

    /// Use a custom format template.
    #[must_use]
    pub fn with_format(mut self, format: impl Into<String>) -> Self {
        self.format = Some(format.into());
        self
    }
}

impl From<&str> for WatchRequest {
    fn from(expr: &str) -> Self {
        Self::new(expr)
    }
}

impl From<(&str, &str)> for WatchRequest {
    /// `(display, expr)`
    fn from((display, expr): (&str, &str)) -> Self {
        Self::new(expr).with_display(display)
    }
}

/// A compiled watch.
#[derive(Debug, Clone)]
pub struct Watch {
    /// Name shown in the output.
    pub display: String,
    /// Format template.
    pub format: String,
    /// The resolved expression.
    pub resolved: ResolvedExpr,
}

/// The rendering of one watch.
#[derive(Debug, Clone, PartialEq)]
pub struct WatchEntry {
    /// Name shown in the output.
    pub display: String,
    /// The evaluated value, if evaluation succeeded.
    pub value: Option<f64>,
    /// The rendered text.
    pub text: String,
}

/// The rendering of all watches at one tick.
#[derive(Debug, Clone, PartialEq)]
pub struct WatchReport {
    /// Completed tick count when the report was made.
    pub tick: u64,
    /// One entry per watch, in registration order.
    pub entries: Vec<WatchEntry>,
    /// The entries joined with [`SEPARATOR`].
    pub line: String,
}

impl Watch {
    /// Evaluate against per-quantity `(rank, value)` lists and render.
    pub fn render(
        &self,
        values: &BTreeMap<String, Vec<(u32, f64)>>,
        own_rank: u32,
        registry: &AggregatorRegistry,
    ) -> WatchEntry {
        let inputs: Option<Vec<f64>> = self
            .resolved
            .deps
            .iter()
            .map(|dep| {
                let per_rank = values.get(&dep.name)?;
                dep.reduction.apply(per_rank, own_rank, registry)
            })
            .collect();
        let Some(inputs) = inputs else {
            return WatchEntry {
                display: self.display.clone(),
                value: None,
                text: format!("{}:n/a", self.display),
            };
        };
        match self.resolved.eval(&inputs) {
            Ok(value) => WatchEntry {
                display: self.display.clone(),
                value: Some(value),
                text: render_template(
                    &self.format,
                    &self.display,
                    value,
                    self.resolved.unit.as_deref().unwrap_or_default(),
                ),
            },
            Err(EvalError::DivisionByZero) => WatchEntry {
                display: self.display.clone(),
                value: None,
                text: format!("{}:div0", self.display),
            },
            Err(_) => WatchEntry {
                display: self.display.clone(),
                value: None,
                text: format!("{}:err", self.display),
            },
        }
    }
}

/// Render every watch and join the results.
pub fn render_report(
    watches: &[Watch],
    tick: u64,
    values: &BTreeMap<String, Vec<(u32, f64)>>,
    own_rank: u32,
    registry: &AggregatorRegistry,
) -> WatchReport {
    let entries: Vec<WatchEntry> = watches
        .iter()
        .map(|w| w.render(values, own_rank, registry))
        .collect();
    let line = entries
        .iter()
        .map(|e| e.text.as_str())
        .collect::<Vec<_>>()
        .join(SEPARATOR);
    WatchReport { tick, entries, line }
}

/// Substitute placeholders in `template`. Unknown placeholders are kept
/// verbatim.
pub fn render_template(template: &str, display: &str, value: f64, unit: &str) -> String {
    let mut out = String::with_capacity(template.len().saturating_add(16));
    let mut rest = template;
    while let Some(open) = rest.find(['{', '}']) {
        let (literal, tail) = rest.split_at(open);
        out.push_str(literal);
        if let Some(after) = tail.strip_prefix("{{") {
            out.push('{');
            rest = after;
            continue;
        }
        if let Some(after) = tail.strip_prefix("}}") {
            out.push('}');
            rest = after;
            continue;
        }
        let Some(close) = tail.find('}').filter(|_| tail.starts_with('{')) else {
            out.push_str(tail.get(..1).unwrap_or_default());
            rest = tail.get(1..).unwrap_or_default();
            continue;
        };
        let placeholder = tail.get(1..close).unwrap_or_default();
        match expand(placeholder, display, value, unit) {
            Some(expanded) => out.push_str(&expanded),
            None => out.push_str(tail.get(..=close).unwrap_or_default()),
        }
        rest = tail.get(close.saturating_add(1)..).unwrap_or_default();
    }
    out.push_str(rest);
    out
}

fn expand(placeholder: &str, display: &str, value: f64, unit: &str) -> Option<String> {
    match placeholder {
        "display" => Some(display.to_owned()),
        "unit" => Some(unit.to_owned()),
        "value" => Some(value.to_string()),
        "value:g" => Some(format_g(value, 6)),
        other => {
            let spec = other.strip_prefix("value:.")?;
            let (digits, kind) = spec.split_at(spec.len().checked_sub(1)?);
            let precision: usize = digits.parse().ok()?;
            match kind {
                "f" => Some(format!("{value:.precision$}")),
                "e" => Some(format_e(value, precision)),
                "g" => Some(format_g(value, precision)),
                _ => None,
            }
        }
    }
}

/// `%e` formatting: mantissa with `precision` decimals, signed two-digit
/// exponent.
pub fn format_e(value: f64, precision: usize) -> String {
    if !value.is_finite() {
        return non_finite(value);
    }
    let raw = format!("{value:.precision$e}");
    let (mantissa, exponent) = raw.split_once('e').unwrap_or((raw.as_str(), "0"));
    let exponent: i32 = exponent.parse().unwrap_or_default();
    format!("{mantissa}e{}{:02}", if exponent < 0 { '-' } else { '+' }, exponent.unsigned_abs())
}

/// `%g` formatting with `precision` significant digits.
pub fn format_g(value: f64, precision: usize) -> String {
    if !value.is_finite() {
        return non_finite(value);
    }
    if value == 0.0 {
        return if value.is_sign_negative() { "-0" } else { "0" }.to_owned();
    }
    let precision = precision.max(1);
    let sig = precision.saturating_sub(1);
    let raw = format!("{value:.sig$e}");
    let exponent: i64 = raw
        .split_once('e')
        .and_then(|(_, e)| e.parse().ok())
        .unwrap_or_default();
    let upper = i64::try_from(precision).unwrap_or(i64::MAX);
    if exponent < -4 || exponent >= upper {
        let formatted = format_e(value, sig);
        let (mantissa, exp) = formatted.split_once('e').unwrap_or((formatted.as_str(), ""));
        format!("{}e{exp}", strip_zeros(mantissa))
    } else {
        let decimals = usize::try_from(upper.saturating_sub(1).saturating_sub(exponent)).unwrap_or_default();
        strip_zeros(&format!("{value:.decimals$}")).to_owned()
    }
}

fn strip_zeros(number: &str) -> &str {
    if number.contains('.') {
        number.trim_end_matches('0').trim_end_matches('.')
    } else {
        number
    }
}

fn non_finite(value: f64) -> String {
    if value.is_nan() {
        "nan".to_owned()
    } else if value.is_sign_negative() {
        "-inf".to_owned()
    } else {
        "inf".to_owned()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use crate::aggregate::RankReduction;
    use crate::expr::DefaultFrontend;
    use crate::resolve::{Scope, resolve};
    use steplog_types::{Aggregator, ConstantValue, QuantityMeta};

    #[test]
    fn g_formatting_matches_printf() {
        assert_eq!(format_g(7.0, 6), "7");
        assert_eq!(format_g(0.5, 6), "0.5");
        assert_eq!(format_g(1_234_567.0, 6), "1.23457e+06");
        assert_eq!(format_g(0.000_123_456, 6), "0.000123456");
        assert_eq!(format_g(0.000_012_345_6, 6), "1.23456e-05");
        assert_eq!(format_g(-42.125, 3), "-42.1");
        assert_eq!(format_g(100_000.0, 6), "100000");
        assert_eq!(format_g(f64::NAN, 6), "nan");
        assert_eq!(format_e(1500.0, 2), "1.50e+03");
    }

    #[test]
    fn template_placeholders() {
        assert_eq!(render_template("{display}={value:g}", "t", 0.25, ""), "t=0.25");
        assert_eq!(render_template("{display}: {value:.2f} {unit}", "t", 1.0, "s"), "t: 1.00 s");
        assert_eq!(render_template("{{{display}}} {other}", "x", 1.0, ""), "{x} {other}");
    }

    fn watch(expr: &str, display: Option<&str>, is_parallel: bool) -> Watch {
        let quantities: BTreeMap<String, QuantityMeta> = [QuantityMeta::new("A").with_unit("s"), QuantityMeta::new("B")]
            .into_iter()
            .map(|m| (m.name.clone(), m))
            .collect();
        let constants: BTreeMap<String, ConstantValue> = BTreeMap::new();
        let registry = AggregatorRegistry::new();
        let scope = Scope {
            quantities: &quantities,
            constants: &constants,
            is_parallel,
            registry: &registry,
        };
        Watch {
            display: display.unwrap_or(expr).to_owned(),
            format: DEFAULT_FORMAT.to_owned(),
            resolved: resolve(&DefaultFrontend, expr, &scope).unwrap(),
        }
    }

    #[test]
    fn report_joins_entries_and_flags_division_by_zero() {
        let values: BTreeMap<String, Vec<(u32, f64)>> = [
            ("A".to_owned(), vec![(0, 3.0), (1, 4.0)]),
            ("B".to_owned(), vec![(0, 0.0), (1, 0.0)]),
        ]
        .into_iter()
        .collect();
        let watches = [
            watch("A.sum", None, true),
            watch("A.max / B.max", Some("ratio"), true),
            watch("A[5]", None, true),
        ];
        assert_eq!(
            watches[0].resolved.deps[0].reduction,
            RankReduction::Aggregate(Aggregator::Sum)
        );
        let report = render_report(&watches, 1, &values, 0, &AggregatorRegistry::new());
        assert_eq!(report.entries[0].value, Some(7.0));
        assert_eq!(report.line, "A.sum=7 | ratio:div0 | A[5]:n/a");
    }
}
