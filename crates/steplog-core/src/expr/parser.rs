//! Tokenizer and recursive-descent parser.
//!
//! Precedence, loosest first: `+ -`, `* / // %`, unary `- +`, `**`
//! (right-associative), then postfix calls, `.attribute` and `[index]`.

use super::{BinaryOp, Expr, ExprError, UnaryOp};

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Ident(String),
    Op(&'static str),
}

const OPERATORS: [&str; 12] = ["**", "//", "+", "-", "*", "/", "%", "(", ")", "[", "]", ","];

fn tokenize(source: &str) -> Result<Vec<(usize, Token)>, ExprError> {
    let mut tokens: Vec<(usize, Token)> = Vec::new();
    let bytes = source.as_bytes();
    let mut pos = 0;
    while let Some(&c) = bytes.get(pos) {
        if c.is_ascii_whitespace() {
            pos = pos.saturating_add(1);
            continue;
        }
        let after_operand = matches!(
            tokens.last(),
            Some((_, Token::Number(_) | Token::Ident(_) | Token::Op(")" | "]")))
        );
        let next_is_digit = bytes.get(pos.saturating_add(1)).is_some_and(u8::is_ascii_digit);
        if c.is_ascii_digit() || (c == b'.' && next_is_digit && !after_operand) {
            let end = scan_number(bytes, pos);
            let text = source.get(pos..end).unwrap_or_default();
            let value = text.parse::<f64>().map_err(|_err| ExprError::Syntax {
                position: pos,
                message: format!("invalid number {text:?}"),
            })?;
            tokens.push((pos, Token::Number(value)));
            pos = end;
        } else if c.is_ascii_alphabetic() || c == b'_' {
            let end = bytes
                .iter()
                .skip(pos)
                .position(|b| !(b.is_ascii_alphanumeric() || *b == b'_'))
                .map_or(bytes.len(), |len| pos.saturating_add(len));
            tokens.push((pos, Token::Ident(source.get(pos..end).unwrap_or_default().to_owned())));
            pos = end;
        } else if c == b'.' {
            tokens.push((pos, Token::Op(".")));
            pos = pos.saturating_add(1);
        } else if let Some(op) = OPERATORS
            .iter()
            .find(|op| source.get(pos..).is_some_and(|rest| rest.starts_with(**op)))
        {
            tokens.push((pos, Token::Op(*op)));
            pos = pos.saturating_add(op.len());
        } else {
            return Err(ExprError::Syntax {
                position: pos,
                message: format!("unexpected character {:?}", char::from(c)),
            });
        }
    }
    Ok(tokens)
}

fn scan_number(bytes: &[u8], start: usize) -> usize {
    let mut end = start;
    let mut seen_dot = false;
    let mut seen_exp = false;
    while let Some(&b) = bytes.get(end) {
        let accept = if b.is_ascii_digit() {
            true
        } else if b == b'.' && !seen_dot && !seen_exp {
            // `1.max` is not a number followed by an attribute
            let next = bytes.get(end.saturating_add(1));
            if next.is_some_and(u8::is_ascii_alphabetic) {
                false
            } else {
                seen_dot = true;
                true
            }
        } else if (b == b'e' || b == b'E') && !seen_exp {
            let next = bytes.get(end.saturating_add(1)).copied();
            let after_sign = bytes.get(end.saturating_add(2)).copied();
            let digit_follows = next.is_some_and(|n| n.is_ascii_digit())
                || (matches!(next, Some(b'+' | b'-'))
                    && after_sign.is_some_and(|n| n.is_ascii_digit()));
            if digit_follows {
                seen_exp = true;
                if matches!(next, Some(b'+' | b'-')) {
                    end = end.saturating_add(1);
                }
            }
            digit_follows
        } else {
            false
        };
        if !accept {
            break;
        }
        end = end.saturating_add(1);
    }
    end
}

struct Parser {
    tokens: Vec<(usize, Token)>,
    pos: usize,
    len: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(_, t)| t)
    }

    fn position(&self) -> usize {
        self.tokens.get(self.pos).map_or(self.len, |(p, _)| *p)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).map(|(_, t)| t.clone());
        if token.is_some() {
            self.pos = self.pos.saturating_add(1);
        }
        token
    }

    fn eat_op(&mut self, op: &str) -> bool {
        if matches!(self.peek(), Some(Token::Op(o)) if *o == op) {
            self.pos = self.pos.saturating_add(1);
            true
        } else {
            false
        }
    }

    fn expect_op(&mut self, op: &str) -> Result<(), ExprError> {
        if self.eat_op(op) {
            Ok(())
        } else {
            Err(self.error(format!("expected {op:?}")))
        }
    }

    fn error(&self, message: String) -> ExprError {
        ExprError::Syntax {
            position: self.position(),
            message,
        }
    }

    fn additive(&mut self) -> Result<Expr, ExprError> {
        let mut lhs = self.multiplicative()?;
        loop {
            let op = if self.eat_op("+") {
                BinaryOp::Add
            } else if self.eat_op("-") {
                BinaryOp::Sub
            } else {
                return Ok(lhs);
            };
            let rhs = self.multiplicative()?;
            lhs = Expr::binary(op, lhs, rhs);
        }
    }

    fn multiplicative(&mut self) -> Result<Expr, ExprError> {
        let mut lhs = self.unary()?;
        loop {
            let op = if self.eat_op("*") {
                BinaryOp::Mul
            } else if self.eat_op("//") {
                BinaryOp::FloorDiv
            } else if self.eat_op("/") {
                BinaryOp::Div
            } else if self.eat_op("%") {
                BinaryOp::Mod
            } else {
                return Ok(lhs);
            };
            let rhs = self.unary()?;
            lhs = Expr::binary(op, lhs, rhs);
        }
    }

    fn unary(&mut self) -> Result<Expr, ExprError> {
        if self.eat_op("-") {
            let operand = self.unary()?;
            return Ok(match operand {
                Expr::Number(n) => Expr::Number(-n),
                other => Expr::Unary {
                    op: UnaryOp::Neg,
                    operand: Box::new(other),
                },
            });
        }
        if self.eat_op("+") {
            return self.unary();
        }
        self.power()
    }

    fn power(&mut self) -> Result<Expr, ExprError> {
        let base = self.postfix()?;
        if self.eat_op("**") {
            let exponent = self.unary()?;
            return Ok(Expr::binary(BinaryOp::Pow, base, exponent));
        }
        Ok(base)
    }

    fn postfix(&mut self) -> Result<Expr, ExprError> {
        let mut expr = self.primary()?;
        loop {
            if self.eat_op(".") {
                match self.advance() {
                    Some(Token::Ident(name)) => {
                        expr = Expr::Attribute {
                            base: Box::new(expr),
                            name,
                        };
                    }
                    _ => return Err(self.error("expected a name after '.'".to_owned())),
                }
            } else if self.eat_op("[") {
                let index = self.additive()?;
                self.expect_op("]")?;
                expr = Expr::Subscript {
                    base: Box::new(expr),
                    index: Box::new(index),
                };
            } else if self.eat_op("(") {
                let mut args = Vec::new();
                if !self.eat_op(")") {
                    loop {
                        args.push(self.additive()?);
                        if self.eat_op(")") {
                            break;
                        }
                        self.expect_op(",")?;
                    }
                }
                expr = Expr::Call {
                    function: Box::new(expr),
                    args,
                };
            } else {
                return Ok(expr);
            }
        }
    }

    fn primary(&mut self) -> Result<Expr, ExprError> {
        match self.advance() {
            Some(Token::Number(n)) => Ok(Expr::Number(n)),
            Some(Token::Ident(name)) => Ok(Expr::Variable(name)),
            Some(Token::Op("(")) => {
                let inner = self.additive()?;
                self.expect_op(")")?;
                Ok(inner)
            }
            Some(Token::Op(op)) => {
                self.pos = self.pos.saturating_sub(1);
                Err(self.error(format!("unexpected {op:?}")))
            }
            None => Err(self.error("unexpected end of expression".to_owned())),
        }
    }
}

/// Parse an expression.
///
/// # Errors
///
/// Returns [`ExprError::Syntax`] with the byte offset of the problem.
pub fn parse(source: &str) -> Result<Expr, ExprError> {
    let tokens = tokenize(source)?;
    let mut parser = Parser {
        tokens,
        pos: 0,
        len: source.len(),
    };
    let expr = parser.additive()?;
    if parser.peek().is_some() {
        return Err(parser.error("unexpected trailing input".to_owned()));
    }
    Ok(expr)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::float_cmp)]
mod tests {
    use super::*;

    fn var(name: &str) -> Expr {
        Expr::Variable(name.to_owned())
    }

    #[test]
    fn attribute_and_subscript() {
        assert_eq!(
            parse("t_step.max").unwrap(),
            Expr::Attribute {
                base: Box::new(var("t_step")),
                name: "max".to_owned()
            }
        );
        assert_eq!(
            parse("A[1]").unwrap(),
            Expr::Subscript {
                base: Box::new(var("A")),
                index: Box::new(Expr::Number(1.0))
            }
        );
    }

    #[test]
    fn precedence_and_associativity() {
        assert_eq!(parse("1 + 2 * 3").unwrap().to_string(), "1 + 2*3");
        assert_eq!(parse("(1 + 2) * 3").unwrap().to_string(), "(1 + 2)*3");
        assert_eq!(parse("2 ** 3 ** 2").unwrap().to_string(), "2**3**2");
        assert_eq!(parse("a - (b - c)").unwrap().to_string(), "a - (b - c)");
        assert_eq!(parse("-x ** 2").unwrap().to_string(), "-x**2");
    }

    #[test]
    fn numbers() {
        assert_eq!(parse("1.5e3").unwrap(), Expr::Number(1500.0));
        assert_eq!(parse(".25").unwrap(), Expr::Number(0.25));
        assert_eq!(parse("-2").unwrap(), Expr::Number(-2.0));
        assert!(parse("2e").unwrap_err().to_string().contains("trailing"));
    }

    #[test]
    fn calls_with_module_prefix() {
        let parsed = parse("math.sqrt(x, 2)").unwrap();
        let Expr::Call { function, args } = parsed else {
            panic!("expected a call");
        };
        assert_eq!(args.len(), 2);
        assert_eq!(function.to_string(), "math.sqrt");
    }

    #[test]
    fn syntax_errors_report_position() {
        let err = parse("a + ").unwrap_err();
        assert!(matches!(err, ExprError::Syntax { position: 4, .. }));
        assert!(parse("a $ b").is_err());
        assert!(parse("(a").is_err());
    }
}
