//! Arithmetic expressions over quantities and constants.
//!
//! Expressions are parsed into an [`Expr`] tree that can be walked,
//! rewritten with [`Expr::substitute`], printed back with minimal
//! parentheses, and compiled into a [`CompiledExpr`] that evaluates against
//! a vector of slot values.
//!
//! The parser is reachable through the [`ExpressionFrontend`] trait so a
//! different surface syntax can be plugged into the tick engine.
//!
//! # Modules
//!
//! - [`parser`] -- Tokenizer and recursive-descent parser

pub mod parser;

use core::fmt;

pub use parser::parse;

/// Errors raised while parsing or resolving an expression.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExprError {
    /// The text is not a well-formed expression.
    #[error("syntax error at offset {position}: {message}")]
    Syntax {
        /// Byte offset of the problem.
        position: usize,
        /// What was expected or found.
        message: String,
    },

    /// A name is neither a quantity nor a constant.
    #[error("unknown quantity {name:?}")]
    UnknownQuantity {
        /// The unresolved name.
        name: String,
    },

    /// A `.suffix` does not name a rank aggregator.
    #[error("invalid rank aggregator {suffix:?} on {name:?}")]
    UnknownAggregator {
        /// Quantity the suffix was attached to.
        name: String,
        /// The rejected suffix.
        suffix: String,
    },

    /// A bare quantity has no default aggregator in a distributed store.
    #[error("must specify an explicit aggregator (e.g. {name}.max) in distributed mode")]
    AmbiguousAggregator {
        /// The quantity referenced without a suffix.
        name: String,
    },

    /// A `[index]` did not evaluate to a non-negative integer.
    #[error("invalid rank index on {name:?}")]
    InvalidRankIndex {
        /// Quantity being indexed.
        name: String,
    },

    /// A call names a function that does not exist or has the wrong arity.
    #[error("unknown function {name:?} with {arity} argument(s)")]
    UnknownFunction {
        /// The function name.
        name: String,
        /// Number of arguments supplied.
        arity: usize,
    },

    /// A construct that cannot be compiled (for example an attribute on a
    /// number).
    #[error("unsupported expression {expr}")]
    Unsupported {
        /// The offending sub-expression, rendered.
        expr: String,
    },
}

/// Errors raised while evaluating a compiled expression.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum EvalError {
    /// Division or modulo by zero.
    #[error("division by zero")]
    DivisionByZero,

    /// A function argument outside its domain (`sqrt(-1)`, `log(0)`).
    #[error("math domain error in {function}")]
    Domain {
        /// The function that rejected its argument.
        function: &'static str,
    },

    /// Fewer values were supplied than the expression has slots.
    #[error("missing value for slot {slot}")]
    MissingSlot {
        /// The slot index.
        slot: usize,
    },
}

// ---------------------------------------------------------------------------
// Tree
// ---------------------------------------------------------------------------

/// Unary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    /// `-x`
    Neg,
}

/// Binary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    /// `a + b`
    Add,
    /// `a - b`
    Sub,
    /// `a * b`
    Mul,
    /// `a / b`
    Div,
    /// `a // b`
    FloorDiv,
    /// `a % b` (sign follows the divisor)
    Mod,
    /// `a ** b`
    Pow,
}

impl BinaryOp {
    const fn symbol(self) -> &'static str {
        match self {
            Self::Add => " + ",
            Self::Sub => " - ",
            Self::Mul => "*",
            Self::Div => "/",
            Self::FloorDiv => "//",
            Self::Mod => "%",
            Self::Pow => "**",
        }
    }

    const fn precedence(self) -> u8 {
        match self {
            Self::Add | Self::Sub => 1,
            Self::Mul | Self::Div | Self::FloorDiv | Self::Mod => 2,
            Self::Pow => 4,
        }
    }
}

/// A parsed expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// A literal.
    Number(f64),
    /// A bare name.
    Variable(String),
    /// `base.name`
    Attribute {
        /// Expression before the dot.
        base: Box<Expr>,
        /// Name after the dot.
        name: String,
    },
    /// `base[index]`
    Subscript {
        /// Expression being indexed.
        base: Box<Expr>,
        /// The index expression.
        index: Box<Expr>,
    },
    /// A unary operation.
    Unary {
        /// The operator.
        op: UnaryOp,
        /// Its operand.
        operand: Box<Expr>,
    },
    /// A binary operation.
    Binary {
        /// The operator.
        op: BinaryOp,
        /// Left operand.
        lhs: Box<Expr>,
        /// Right operand.
        rhs: Box<Expr>,
    },
    /// `function(args...)`
    Call {
        /// The callee, a name or `math.name`.
        function: Box<Expr>,
        /// Arguments.
        args: Vec<Expr>,
    },
}

impl Expr {
    /// Build a binary node.
    pub fn binary(op: BinaryOp, lhs: Self, rhs: Self) -> Self {
        Self::Binary {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        }
    }

    /// Rebuild the tree bottom-up, replacing every node for which `f`
    /// returns `Some`. Replaced nodes are not descended into.
    #[must_use]
    pub fn substitute(&self, f: &mut dyn FnMut(&Self) -> Option<Self>) -> Self {
        if let Some(replacement) = f(self) {
            return replacement;
        }
        match self {
            Self::Number(_) | Self::Variable(_) => self.clone(),
            Self::Attribute { base, name } => Self::Attribute {
                base: Box::new(base.substitute(f)),
                name: name.clone(),
            },
            Self::Subscript { base, index } => Self::Subscript {
                base: Box::new(base.substitute(f)),
                index: Box::new(index.substitute(f)),
            },
            Self::Unary { op, operand } => Self::Unary {
                op: *op,
                operand: Box::new(operand.substitute(f)),
            },
            Self::Binary { op, lhs, rhs } => Self::Binary {
                op: *op,
                lhs: Box::new(lhs.substitute(f)),
                rhs: Box::new(rhs.substitute(f)),
            },
            Self::Call { function, args } => Self::Call {
                function: function.clone(),
                args: args.iter().map(|a| a.substitute(f)).collect(),
            },
        }
    }

    /// Visit nodes top-down. Returning `false` from `f` skips the node's
    /// children. Callees of calls are not visited.
    pub fn walk(&self, f: &mut dyn FnMut(&Self) -> bool) {
        if !f(self) {
            return;
        }
        match self {
            Self::Number(_) | Self::Variable(_) => {}
            Self::Attribute { base, .. } => base.walk(f),
            Self::Subscript { base, index } => {
                base.walk(f);
                index.walk(f);
            }
            Self::Unary { operand, .. } => operand.walk(f),
            Self::Binary { lhs, rhs, .. } => {
                lhs.walk(f);
                rhs.walk(f);
            }
            Self::Call { args, .. } => {
                for arg in args {
                    arg.walk(f);
                }
            }
        }
    }

    /// Compile into an evaluable form. `slot_of` maps a node to a slot
    /// index; any node it maps is read from the slot vector at evaluation.
    ///
    /// # Errors
    ///
    /// Returns [`ExprError::UnknownQuantity`] for unmapped names,
    /// [`ExprError::UnknownFunction`] for unknown calls and
    /// [`ExprError::Unsupported`] for other unmapped constructs.
    pub fn compile(&self, slot_of: &dyn Fn(&Self) -> Option<usize>) -> Result<CompiledExpr, ExprError> {
        let mut slots = 0;
        let root = self.lower(slot_of, &mut slots)?;
        Ok(CompiledExpr { root, slots })
    }

    fn lower(&self, slot_of: &dyn Fn(&Self) -> Option<usize>, slots: &mut usize) -> Result<Node, ExprError> {
        if let Some(slot) = slot_of(self) {
            *slots = (*slots).max(slot.saturating_add(1));
            return Ok(Node::Slot(slot));
        }
        match self {
            Self::Number(n) => Ok(Node::Const(*n)),
            Self::Variable(name) => Err(ExprError::UnknownQuantity { name: name.clone() }),
            Self::Attribute { .. } | Self::Subscript { .. } => Err(ExprError::Unsupported {
                expr: self.to_string(),
            }),
            Self::Unary { op, operand } => Ok(Node::Unary(*op, Box::new(operand.lower(slot_of, slots)?))),
            Self::Binary { op, lhs, rhs } => Ok(Node::Binary(
                *op,
                Box::new(lhs.lower(slot_of, slots)?),
                Box::new(rhs.lower(slot_of, slots)?),
            )),
            Self::Call { function, args } => {
                let name = callee_name(function).ok_or_else(|| ExprError::Unsupported {
                    expr: function.to_string(),
                })?;
                let function = Function::lookup(name, args.len()).ok_or_else(|| {
                    ExprError::UnknownFunction {
                        name: name.to_owned(),
                        arity: args.len(),
                    }
                })?;
                let args = args
                    .iter()
                    .map(|a| a.lower(slot_of, slots))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Node::Call(function, args))
            }
        }
    }

    const fn precedence(&self) -> u8 {
        match self {
            Self::Number(n) if n.is_sign_negative() => 3,
            Self::Unary { .. } => 3,
            Self::Binary { op, .. } => op.precedence(),
            _ => 6,
        }
    }
}

/// `sqrt` or `math.sqrt` both name the function `sqrt`.
fn callee_name(function: &Expr) -> Option<&str> {
    match function {
        Expr::Variable(name) => Some(name),
        Expr::Attribute { base, name } if matches!(base.as_ref(), Expr::Variable(m) if m == "math") => {
            Some(name)
        }
        _ => None,
    }
}

struct Wrapped<'a>(&'a Expr, bool);

impl fmt::Display for Wrapped<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.1 {
            write!(f, "({})", self.0)
        } else {
            write!(f, "{}", self.0)
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::Variable(name) => f.write_str(name),
            Self::Attribute { base, name } => {
                write!(f, "{}.{name}", Wrapped(base, base.precedence() < 6))
            }
            Self::Subscript { base, index } => {
                write!(f, "{}[{index}]", Wrapped(base, base.precedence() < 6))
            }
            Self::Unary { operand, .. } => {
                write!(f, "-{}", Wrapped(operand, operand.precedence() < 4))
            }
            Self::Binary { op, lhs, rhs } => {
                let prec = op.precedence();
                let (lhs_parens, rhs_parens) = if *op == BinaryOp::Pow {
                    (lhs.precedence() <= prec, rhs.precedence() < prec)
                } else {
                    (lhs.precedence() < prec, rhs.precedence() <= prec)
                };
                write!(
                    f,
                    "{}{}{}",
                    Wrapped(lhs, lhs_parens),
                    op.symbol(),
                    Wrapped(rhs, rhs_parens)
                )
            }
            Self::Call { function, args } => {
                write!(f, "{function}(")?;
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{arg}")?;
                }
                f.write_str(")")
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Compiled form
// ---------------------------------------------------------------------------

/// Built-in functions callable from expressions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Function {
    /// Square root.
    Sqrt,
    /// Absolute value.
    Abs,
    /// `e**x`
    Exp,
    /// Natural logarithm.
    Log,
    /// Base-10 logarithm.
    Log10,
    /// Sine.
    Sin,
    /// Cosine.
    Cos,
    /// Tangent.
    Tan,
    /// Round toward negative infinity.
    Floor,
    /// Round toward positive infinity.
    Ceil,
    /// Smallest argument.
    Min,
    /// Largest argument.
    Max,
}

impl Function {
    /// Find a function by name and arity.
    pub fn lookup(name: &str, arity: usize) -> Option<Self> {
        let function = match name {
            "sqrt" => Self::Sqrt,
            "abs" | "fabs" => Self::Abs,
            "exp" => Self::Exp,
            "log" => Self::Log,
            "log10" => Self::Log10,
            "sin" => Self::Sin,
            "cos" => Self::Cos,
            "tan" => Self::Tan,
            "floor" => Self::Floor,
            "ceil" => Self::Ceil,
            "min" => Self::Min,
            "max" => Self::Max,
            _ => return None,
        };
        let arity_ok = match function {
            Self::Min | Self::Max => arity >= 1,
            _ => arity == 1,
        };
        arity_ok.then_some(function)
    }

    fn apply(self, args: &[f64]) -> Result<f64, EvalError> {
        let first = args.first().copied().unwrap_or(f64::NAN);
        let value = match self {
            Self::Sqrt if first < 0.0 => return Err(EvalError::Domain { function: "sqrt" }),
            Self::Sqrt => first.sqrt(),
            Self::Abs => first.abs(),
            Self::Exp => first.exp(),
            Self::Log if first <= 0.0 => return Err(EvalError::Domain { function: "log" }),
            Self::Log => first.ln(),
            Self::Log10 if first <= 0.0 => return Err(EvalError::Domain { function: "log10" }),
            Self::Log10 => first.log10(),
            Self::Sin => first.sin(),
            Self::Cos => first.cos(),
            Self::Tan => first.tan(),
            Self::Floor => first.floor(),
            Self::Ceil => first.ceil(),
            Self::Min => args.iter().copied().fold(f64::INFINITY, f64::min),
            Self::Max => args.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        };
        Ok(value)
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Node {
    Const(f64),
    Slot(usize),
    Unary(UnaryOp, Box<Node>),
    Binary(BinaryOp, Box<Node>, Box<Node>),
    Call(Function, Vec<Node>),
}

impl Node {
    fn eval(&self, values: &[f64]) -> Result<f64, EvalError> {
        match self {
            Self::Const(n) => Ok(*n),
            Self::Slot(slot) => values
                .get(*slot)
                .copied()
                .ok_or(EvalError::MissingSlot { slot: *slot }),
            Self::Unary(UnaryOp::Neg, operand) => Ok(-operand.eval(values)?),
            Self::Binary(op, lhs, rhs) => {
                let a = lhs.eval(values)?;
                let b = rhs.eval(values)?;
                let is_zero = b == 0.0;
                match op {
                    BinaryOp::Add => Ok(a + b),
                    BinaryOp::Sub => Ok(a - b),
                    BinaryOp::Mul => Ok(a * b),
                    BinaryOp::Div | BinaryOp::FloorDiv | BinaryOp::Mod if is_zero => {
                        Err(EvalError::DivisionByZero)
                    }
                    BinaryOp::Div => Ok(a / b),
                    BinaryOp::FloorDiv => Ok((a / b).floor()),
                    BinaryOp::Mod => Ok(a - b * (a / b).floor()),
                    BinaryOp::Pow => Ok(a.powf(b)),
                }
            }
            Self::Call(function, args) => {
                let args = args
                    .iter()
                    .map(|a| a.eval(values))
                    .collect::<Result<Vec<_>, _>>()?;
                function.apply(&args)
            }
        }
    }
}

/// An expression lowered for repeated evaluation.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledExpr {
    root: Node,
    slots: usize,
}

impl CompiledExpr {
    /// Number of slot values the expression reads.
    pub const fn slot_count(&self) -> usize {
        self.slots
    }

    /// Evaluate with one value per slot.
    ///
    /// # Errors
    ///
    /// Returns [`EvalError::DivisionByZero`], [`EvalError::Domain`], or
    /// [`EvalError::MissingSlot`] if `values` is too short.
    pub fn eval(&self, values: &[f64]) -> Result<f64, EvalError> {
        self.root.eval(values)
    }
}

// ---------------------------------------------------------------------------
// Front end
// ---------------------------------------------------------------------------

/// Turns expression text into an [`Expr`] tree.
pub trait ExpressionFrontend {
    /// Parse `source`.
    ///
    /// # Errors
    ///
    /// Returns [`ExprError::Syntax`] for malformed input.
    fn parse(&self, source: &str) -> Result<Expr, ExprError>;
}

/// The built-in arithmetic syntax.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultFrontend;

impl ExpressionFrontend for DefaultFrontend {
    fn parse(&self, source: &str) -> Result<Expr, ExprError> {
        parse(source)
    }
}
