//! Binding expression names to quantities and rank reductions.
//!
//! Resolution turns expression text into a [`ResolvedExpr`]: the compiled
//! callable plus one [`DependencyDatum`] per distinct quantity reference.
//! Numeric constants are folded in first, so `t_step / dt0` works when
//! `dt0` is a constant.

use std::collections::BTreeMap;

use steplog_types::{Aggregator, ConstantValue, QuantityMeta};

use crate::aggregate::{AggregatorRegistry, RankReduction};
use crate::expr::{CompiledExpr, EvalError, Expr, ExprError, ExpressionFrontend};

/// Suffix selecting this rank's own value.
pub const LOCAL_SUFFIX: &str = "loc";

/// Names an expression may refer to.
#[derive(Debug, Clone, Copy)]
pub struct Scope<'a> {
    /// Registered quantities by name.
    pub quantities: &'a BTreeMap<String, QuantityMeta>,
    /// Store constants by name.
    pub constants: &'a BTreeMap<String, ConstantValue>,
    /// Whether the store belongs to a distributed run.
    pub is_parallel: bool,
    /// Custom reductions.
    pub registry: &'a AggregatorRegistry,
}

/// One quantity reference inside an expression.
#[derive(Debug, Clone, PartialEq)]
pub struct DependencyDatum {
    /// The referenced quantity.
    pub name: String,
    /// The reference as written (`A`, `A.max`, `A[2]`).
    pub reference: Expr,
    /// How per-rank values collapse.
    pub reduction: RankReduction,
    /// Index into the value vector passed to [`ResolvedExpr::eval`].
    pub slot: usize,
}

impl DependencyDatum {
    /// Whether this dependency needs values from other ranks.
    pub const fn is_nonlocal(&self) -> bool {
        self.reduction.is_nonlocal()
    }
}

/// An expression ready for repeated evaluation.
#[derive(Debug, Clone)]
pub struct ResolvedExpr {
    /// The text the expression was parsed from.
    pub source: String,
    /// The tree after constant folding.
    pub expr: Expr,
    /// Dependencies in slot order.
    pub deps: Vec<DependencyDatum>,
    /// Unit derived from the dependencies' units, if all of them have one.
    pub unit: Option<String>,
    compiled: CompiledExpr,
}

impl ResolvedExpr {
    /// Whether any dependency needs values from other ranks.
    pub fn is_nonlocal(&self) -> bool {
        self.deps.iter().any(DependencyDatum::is_nonlocal)
    }

    /// Evaluate with one value per dependency, in slot order.
    ///
    /// # Errors
    ///
    /// Propagates [`EvalError`] from the compiled expression.
    pub fn eval(&self, values: &[f64]) -> Result<f64, EvalError> {
        self.compiled.eval(values)
    }
}

/// Parse and resolve `source` against `scope`.
///
/// # Errors
///
/// Returns [`ExprError`] for syntax errors, unknown names, unknown or
/// ambiguous aggregators and invalid rank indices.
pub fn resolve(
    frontend: &dyn ExpressionFrontend,
    source: &str,
    scope: &Scope<'_>,
) -> Result<ResolvedExpr, ExprError> {
    let parsed = frontend.parse(source)?;
    let expr = parsed.substitute(&mut |node| match node {
        Expr::Variable(name) if !scope.quantities.contains_key(name) => scope
            .constants
            .get(name)
            .and_then(ConstantValue::as_f64)
            .map(Expr::Number),
        _ => None,
    });

    let mut deps: Vec<DependencyDatum> = Vec::new();
    let mut failure: Option<ExprError> = None;
    expr.walk(&mut |node| {
        if failure.is_some() {
            return false;
        }
        match classify(node, scope) {
            Ok(Some((name, reduction))) => {
                if !deps.iter().any(|d| d.reference == *node) {
                    let slot = deps.len();
                    deps.push(DependencyDatum {
                        name,
                        reference: node.clone(),
                        reduction,
                        slot,
                    });
                }
                false
            }
            Ok(None) => true,
            Err(err) => {
                failure = Some(err);
                false
            }
        }
    });
    if let Some(err) = failure {
        return Err(err);
    }

    let compiled = expr.compile(&|node| deps.iter().find(|d| d.reference == *node).map(|d| d.slot))?;
    let unit = infer_unit(&expr, &deps, scope, frontend);
    Ok(ResolvedExpr {
        source: source.to_owned(),
        expr,
        deps,
        unit,
        compiled,
    })
}

/// Decide whether `node` is a quantity reference. `Ok(None)` means "not a
/// reference, keep walking".
fn classify(node: &Expr, scope: &Scope<'_>) -> Result<Option<(String, RankReduction)>, ExprError> {
    match node {
        Expr::Variable(name) => {
            let meta = scope
                .quantities
                .get(name)
                .ok_or_else(|| ExprError::UnknownQuantity { name: name.clone() })?;
            let reduction = match (&meta.default_aggregator, scope.is_parallel) {
                (Some(aggregator), _) => RankReduction::Aggregate(aggregator.clone()),
                (None, true) => return Err(ExprError::AmbiguousAggregator { name: name.clone() }),
                (None, false) => RankReduction::First,
            };
            Ok(Some((name.clone(), reduction)))
        }
        Expr::Attribute { base, name: suffix } => {
            let Expr::Variable(name) = base.as_ref() else {
                return Ok(None);
            };
            if !scope.quantities.contains_key(name) {
                return Err(ExprError::UnknownQuantity { name: name.clone() });
            }
            let reduction = if suffix == LOCAL_SUFFIX {
                RankReduction::Local
            } else if let Ok(builtin) = suffix.parse::<Aggregator>() {
                RankReduction::Aggregate(builtin)
            } else if scope.registry.contains(suffix) {
                RankReduction::Aggregate(Aggregator::Custom(suffix.clone()))
            } else {
                return Err(ExprError::UnknownAggregator {
                    name: name.clone(),
                    suffix: suffix.clone(),
                });
            };
            Ok(Some((name.clone(), reduction)))
        }
        Expr::Subscript { base, index } => {
            let Expr::Variable(name) = base.as_ref() else {
                return Ok(None);
            };
            if !scope.quantities.contains_key(name) {
                return Err(ExprError::UnknownQuantity { name: name.clone() });
            }
            let rank = rank_index(index).ok_or_else(|| ExprError::InvalidRankIndex { name: name.clone() })?;
            Ok(Some((name.clone(), RankReduction::Rank(rank))))
        }
        _ => Ok(None),
    }
}

fn rank_index(index: &Expr) -> Option<u32> {
    let Expr::Number(n) = index else {
        return None;
    };
    if n.fract() != 0.0 || *n < 0.0 || *n > f64::from(u32::MAX) {
        return None;
    }
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let rank = *n as u32;
    Some(rank)
}

fn infer_unit(
    expr: &Expr,
    deps: &[DependencyDatum],
    scope: &Scope<'_>,
    frontend: &dyn ExpressionFrontend,
) -> Option<String> {
    let mut units = Vec::with_capacity(deps.len());
    for dep in deps {
        let unit = scope.quantities.get(&dep.name)?.unit.as_deref()?;
        units.push((&dep.reference, frontend.parse(unit).ok()?));
    }
    let replaced = expr.substitute(&mut |node| {
        units
            .iter()
            .find(|(reference, _)| *reference == node)
            .map(|(_, unit)| unit.clone())
    });
    Some(replaced.to_string())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::float_cmp, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use crate::expr::DefaultFrontend;

    fn quantities() -> BTreeMap<String, QuantityMeta> {
        [
            QuantityMeta::new("t_step").with_unit("s"),
            QuantityMeta::new("step").with_unit("1"),
            QuantityMeta::new("mem").with_aggregator(Aggregator::Max),
            QuantityMeta::new("A"),
        ]
        .into_iter()
        .map(|m| (m.name.clone(), m))
        .collect()
    }

    fn run(source: &str, is_parallel: bool) -> Result<ResolvedExpr, ExprError> {
        let quantities = quantities();
        let constants: BTreeMap<String, ConstantValue> =
            [("dt0".to_owned(), ConstantValue::Real(0.5))].into_iter().collect();
        let registry = AggregatorRegistry::new();
        let scope = Scope {
            quantities: &quantities,
            constants: &constants,
            is_parallel,
            registry: &registry,
        };
        resolve(&DefaultFrontend, source, &scope)
    }

    #[test]
    fn suffixes_select_reductions() {
        let resolved = run("A.max + A.loc + A[1] + A.max", true).unwrap();
        let reductions: Vec<_> = resolved.deps.iter().map(|d| d.reduction.clone()).collect();
        assert_eq!(
            reductions,
            vec![
                RankReduction::Aggregate(Aggregator::Max),
                RankReduction::Local,
                RankReduction::Rank(1),
            ]
        );
        assert!(resolved.is_nonlocal());
        assert_eq!(resolved.eval(&[1.0, 2.0, 3.0]).unwrap(), 7.0);
    }

    #[test]
    fn bare_names_use_default_or_fail_when_distributed() {
        let serial = run("A", false).unwrap();
        assert_eq!(serial.deps[0].reduction, RankReduction::First);
        assert!(!serial.is_nonlocal());

        assert!(matches!(run("A", true), Err(ExprError::AmbiguousAggregator { .. })));

        let mem = run("mem", true).unwrap();
        assert_eq!(mem.deps[0].reduction, RankReduction::Aggregate(Aggregator::Max));
    }

    #[test]
    fn invalid_references_are_rejected() {
        assert!(matches!(
            run("A.mean", false),
            Err(ExprError::UnknownAggregator { .. })
        ));
        assert!(matches!(run("B + 1", false), Err(ExprError::UnknownQuantity { .. })));
        assert!(matches!(run("A[0.5]", false), Err(ExprError::InvalidRankIndex { .. })));
        assert!(matches!(run("A[-1]", false), Err(ExprError::InvalidRankIndex { .. })));
    }

    #[test]
    fn constants_fold_and_units_infer() {
        let resolved = run("t_step / dt0", false).unwrap();
        assert_eq!(resolved.deps.len(), 1);
        assert_eq!(resolved.eval(&[2.0]).unwrap(), 4.0);
        assert_eq!(resolved.unit.as_deref(), Some("s/0.5"));

        let mixed = run("t_step + A", false).unwrap();
        assert_eq!(mixed.unit, None);

        let per_step = run("t_step.max / step", false).unwrap();
        assert_eq!(per_step.unit.as_deref(), Some("s/1"));
    }

    #[test]
    fn functions_are_not_quantities() {
        let resolved = run("sqrt(A) + math.sqrt(t_step)", false).unwrap();
        assert_eq!(resolved.deps.len(), 2);
        assert_eq!(resolved.eval(&[4.0, 9.0]).unwrap(), 5.0);
    }
}
