//! Restricted boolean expressions for conditional jobs.
//!
//! Expressions are parsed into a small AST and interpreted against a JSON
//! snapshot; nothing in here can reach the host environment.
//!
//! ```text
//! or      := and ( "||" and )*
//! and     := unary ( "&&" unary )*
//! unary   := "!" unary | cmp
//! cmp     := primary ( op primary )?
//! op      := "==" | "!=" | "<" | "<=" | ">" | ">=" | "contains"
//! primary := number | string | "true" | "false" | "null" | path | "(" or ")"
//! path    := ("job" | "stats") ( "." ident )*
//! ```
//!
//! Example: `job.priority == "urgent" && stats.total_failed < 10`.

use std::cmp::Ordering;

use serde_json::Value;
use thiserror::Error;

pub const MAX_SOURCE_LEN: usize = 1024;
pub const MAX_DEPTH: usize = 32;
const ROOTS: [&str; 2] = ["job", "stats"];

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExprError {
    #[error("expression longer than 1024 bytes")]
    TooLong,
    #[error("expression nested deeper than 32 levels")]
    TooDeep,
    #[error("unexpected character '{ch}' at offset {offset}")]
    UnexpectedChar { ch: char, offset: usize },
    #[error("unterminated string starting at offset {offset}")]
    UnterminatedString { offset: usize },
    #[error("invalid number '{0}'")]
    InvalidNumber(String),
    #[error("unexpected {found}, expected {expected}")]
    UnexpectedToken { found: String, expected: String },
    #[error("unknown root '{0}', expected 'job' or 'stats'")]
    UnknownRoot(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Contains,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    Path(Vec<String>),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Cmp(CmpOp, Box<Expr>, Box<Expr>),
}

impl Expr {
    pub fn parse(source: &str) -> Result<Expr, ExprError> {
        if source.len() > MAX_SOURCE_LEN {
            return Err(ExprError::TooLong);
        }
        let tokens = tokenize(source)?;
        let mut parser = Parser {
            tokens,
            pos: 0,
            depth: 0,
        };
        let expr = parser.or()?;
        match parser.peek() {
            Token::End => Ok(expr),
            other => Err(ExprError::UnexpectedToken {
                found: other.describe(),
                expected: "end of expression".to_string(),
            }),
        }
    }

    /// Evaluate to a boolean against `ctx`, a JSON object with `job` and
    /// `stats` members. Missing paths read as `null`.
    pub fn eval(&self, ctx: &Value) -> bool {
        truthy(&self.value(ctx))
    }

    fn value(&self, ctx: &Value) -> Value {
        match self {
            Expr::Literal(v) => v.clone(),
            Expr::Path(segments) => segments
                .iter()
                .try_fold(ctx, |node, seg| node.get(seg.as_str()))
                .cloned()
                .unwrap_or(Value::Null),
            Expr::Not(inner) => Value::Bool(!inner.eval(ctx)),
            Expr::And(l, r) => Value::Bool(l.eval(ctx) && r.eval(ctx)),
            Expr::Or(l, r) => Value::Bool(l.eval(ctx) || r.eval(ctx)),
            Expr::Cmp(op, l, r) => Value::Bool(compare(*op, &l.value(ctx), &r.value(ctx))),
        }
    }
}

fn truthy(v: &Value) -> bool {
    match v {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

fn order(l: &Value, r: &Value) -> Option<Ordering> {
    match (l, r) {
        (Value::Number(a), Value::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

fn compare(op: CmpOp, l: &Value, r: &Value) -> bool {
    match op {
        CmpOp::Eq => order(l, r).map_or(l == r, |o| o == Ordering::Equal),
        CmpOp::Ne => order(l, r).map_or(l != r, |o| o != Ordering::Equal),
        CmpOp::Lt => order(l, r) == Some(Ordering::Less),
        CmpOp::Le => matches!(order(l, r), Some(Ordering::Less | Ordering::Equal)),
        CmpOp::Gt => order(l, r) == Some(Ordering::Greater),
        CmpOp::Ge => matches!(order(l, r), Some(Ordering::Greater | Ordering::Equal)),
        CmpOp::Contains => match (l, r) {
            (Value::Array(items), needle) => items.iter().any(|i| i == needle),
            (Value::String(hay), Value::String(needle)) => hay.contains(needle.as_str()),
            (Value::Object(map), Value::String(key)) => map.contains_key(key),
            _ => false,
        },
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Num(f64),
    Op(CmpOp),
    And,
    Or,
    Not,
    Dot,
    LParen,
    RParen,
    End,
}

impl Token {
    fn describe(&self) -> String {
        match self {
            Token::Ident(s) => format!("identifier '{s}'"),
            Token::Str(s) => format!("string {s:?}"),
            Token::Num(n) => format!("number {n}"),
            Token::Op(op) => format!("operator {op:?}"),
            Token::And => "'&&'".to_string(),
            Token::Or => "'||'".to_string(),
            Token::Not => "'!'".to_string(),
            Token::Dot => "'.'".to_string(),
            Token::LParen => "'('".to_string(),
            Token::RParen => "')'".to_string(),
            Token::End => "end of expression".to_string(),
        }
    }
}

fn tokenize(src: &str) -> Result<Vec<Token>, ExprError> {
    let mut tokens = Vec::new();
    let mut chars = src.char_indices().peekable();

    while let Some(&(offset, ch)) = chars.peek() {
        if ch.is_whitespace() {
            chars.next();
            continue;
        }
        let two = src.get(offset..offset + 2).unwrap_or("");
        let symbol = match two {
            "&&" => Some(Token::And),
            "||" => Some(Token::Or),
            "==" => Some(Token::Op(CmpOp::Eq)),
            "!=" => Some(Token::Op(CmpOp::Ne)),
            "<=" => Some(Token::Op(CmpOp::Le)),
            ">=" => Some(Token::Op(CmpOp::Ge)),
            _ => None,
        };
        if let Some(tok) = symbol {
            chars.next();
            chars.next();
            tokens.push(tok);
            continue;
        }

        match ch {
            '(' | ')' | '.' | '!' | '<' | '>' => {
                chars.next();
                tokens.push(match ch {
                    '(' => Token::LParen,
                    ')' => Token::RParen,
                    '.' => Token::Dot,
                    '!' => Token::Not,
                    '<' => Token::Op(CmpOp::Lt),
                    _ => Token::Op(CmpOp::Gt),
                });
            }
            '"' | '\'' => {
                chars.next();
                let mut s = String::new();
                let mut closed = false;
                while let Some((_, c)) = chars.next() {
                    match c {
                        c if c == ch => {
                            closed = true;
                            break;
                        }
                        '\\' => match chars.next() {
                            Some((_, escaped)) => s.push(escaped),
                            None => break,
                        },
                        c => s.push(c),
                    }
                }
                if !closed {
                    return Err(ExprError::UnterminatedString { offset });
                }
                tokens.push(Token::Str(s));
            }
            c if c.is_ascii_digit() || c == '-' => {
                let mut end = offset + c.len_utf8();
                chars.next();
                while let Some(&(i, d)) = chars.peek() {
                    if d.is_ascii_digit() || d == '.' {
                        end = i + d.len_utf8();
                        chars.next();
                    } else {
                        break;
                    }
                }
                let text = &src[offset..end];
                let n = text
                    .parse::<f64>()
                    .map_err(|_| ExprError::InvalidNumber(text.to_string()))?;
                tokens.push(Token::Num(n));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let mut end = offset;
                while let Some(&(i, d)) = chars.peek() {
                    if d.is_ascii_alphanumeric() || d == '_' {
                        end = i + d.len_utf8();
                        chars.next();
                    } else {
                        break;
                    }
                }
                let word = &src[offset..end];
                tokens.push(match word {
                    "contains" => Token::Op(CmpOp::Contains),
                    _ => Token::Ident(word.to_string()),
                });
            }
            other => return Err(ExprError::UnexpectedChar { ch: other, offset }),
        }
    }
    tokens.push(Token::End);
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> &Token {
        self.tokens.get(self.pos).unwrap_or(&Token::End)
    }

    fn advance(&mut self) -> Token {
        let tok = self.peek().clone();
        if self.pos < self.tokens.len() {
            self.pos += 1;
        }
        tok
    }

    fn descend(&mut self) -> Result<(), ExprError> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(ExprError::TooDeep);
        }
        Ok(())
    }

    fn or(&mut self) -> Result<Expr, ExprError> {
        let mut lhs = self.and()?;
        while *self.peek() == Token::Or {
            self.advance();
            let rhs = self.and()?;
            lhs = Expr::Or(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn and(&mut self) -> Result<Expr, ExprError> {
        let mut lhs = self.unary()?;
        while *self.peek() == Token::And {
            self.advance();
            let rhs = self.unary()?;
            lhs = Expr::And(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn unary(&mut self) -> Result<Expr, ExprError> {
        if *self.peek() == Token::Not {
            self.advance();
            self.descend()?;
            let inner = self.unary()?;
            self.depth -= 1;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.cmp()
    }

    fn cmp(&mut self) -> Result<Expr, ExprError> {
        let lhs = self.primary()?;
        if let Token::Op(op) = *self.peek() {
            self.advance();
            let rhs = self.primary()?;
            return Ok(Expr::Cmp(op, Box::new(lhs), Box::new(rhs)));
        }
        Ok(lhs)
    }

    fn primary(&mut self) -> Result<Expr, ExprError> {
        match self.advance() {
            Token::Num(n) => Ok(Expr::Literal(
                serde_json::Number::from_f64(n).map_or(Value::Null, Value::Number),
            )),
            Token::Str(s) => Ok(Expr::Literal(Value::String(s))),
            Token::LParen => {
                self.descend()?;
                let inner = self.or()?;
                self.depth -= 1;
                match self.advance() {
                    Token::RParen => Ok(inner),
                    other => Err(ExprError::UnexpectedToken {
                        found: other.describe(),
                        expected: "')'".to_string(),
                    }),
                }
            }
            Token::Ident(word) => match word.as_str() {
                "true" => Ok(Expr::Literal(Value::Bool(true))),
                "false" => Ok(Expr::Literal(Value::Bool(false))),
                "null" => Ok(Expr::Literal(Value::Null)),
                root if ROOTS.contains(&root) => self.path(word),
                _ => Err(ExprError::UnknownRoot(word)),
            },
            other => Err(ExprError::UnexpectedToken {
                found: other.describe(),
                expected: "value".to_string(),
            }),
        }
    }

    fn path(&mut self, root: String) -> Result<Expr, ExprError> {
        let mut segments = vec![root];
        while *self.peek() == Token::Dot {
            self.advance();
            match self.advance() {
                Token::Ident(seg) => segments.push(seg),
                other => {
                    return Err(ExprError::UnexpectedToken {
                        found: other.describe(),
                        expected: "field name".to_string(),
                    })
                }
            }
        }
        Ok(Expr::Path(segments))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx() -> Value {
        json!({
            "job": {
                "name": "nightly-report",
                "priority": "low",
                "queue_name": "reports",
                "tags": ["billing", "nightly"],
                "metadata": {"attempt": 2, "region": "eu"}
            },
            "stats": {
                "total_failed": 3,
                "queues": {"reports": {"backlog": 120, "error_rate": 0.02}}
            }
        })
    }

    fn eval(src: &str) -> bool {
        Expr::parse(src).unwrap().eval(&ctx())
    }

    #[test]
    fn comparisons_over_paths() {
        assert!(eval(r#"job.priority == "low""#));
        assert!(eval("job.priority != 'urgent'"));
        assert!(eval("stats.total_failed < 10"));
        assert!(eval("stats.queues.reports.backlog >= 120"));
        assert!(!eval("stats.queues.reports.error_rate > 0.5"));
        assert!(eval("job.metadata.attempt == 2"));
    }

    #[test]
    fn boolean_connectives_and_precedence() {
        assert!(eval(r#"job.queue_name == "reports" && !(stats.total_failed > 5)"#));
        assert!(eval("false || true && true"));
        assert!(!eval("false && true || false"));
        assert!(eval("!false"));
    }

    #[test]
    fn contains_operator() {
        assert!(eval(r#"job.tags contains "nightly""#));
        assert!(!eval(r#"job.tags contains "weekly""#));
        assert!(eval(r#"job.name contains "report""#));
        assert!(eval(r#"job.metadata contains "region""#));
    }

    #[test]
    fn missing_paths_are_null() {
        assert!(!eval("job.metadata.nope"));
        assert!(eval("job.metadata.nope == null"));
        assert!(!eval("job.metadata.nope > 1"));
    }

    #[test]
    fn rejects_host_access_and_garbage() {
        assert!(matches!(
            Expr::parse("process.exit(1)"),
            Err(ExprError::UnknownRoot(_))
        ));
        assert!(Expr::parse("job.name ==").is_err());
        assert!(Expr::parse("job.name == 'x").is_err());
        assert!(Expr::parse("job.name; rm").is_err());
        assert!(Expr::parse("(job.name == 'x'").is_err());
        assert!(Expr::parse("job.name == 'x' job").is_err());
    }

    #[test]
    fn limits_length_and_depth() {
        let long = format!("job.name == '{}'", "x".repeat(MAX_SOURCE_LEN));
        assert_eq!(Expr::parse(&long), Err(ExprError::TooLong));

        let deep = format!("{}true{}", "(".repeat(MAX_DEPTH + 1), ")".repeat(MAX_DEPTH + 1));
        assert_eq!(Expr::parse(&deep), Err(ExprError::TooDeep));
        let ok = format!("{}true{}", "(".repeat(MAX_DEPTH), ")".repeat(MAX_DEPTH));
        assert!(Expr::parse(&ok).is_ok());
    }
}
