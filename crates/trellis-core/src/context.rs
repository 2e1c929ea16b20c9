//! Caller identity and access predicates.
//!
//! A [`Context`] carries zero or one authenticated user. The *absence* of a
//! context (`Option<&Context>::None` at the call sites) means context-free
//! admin mode: no access checks run at all. A context without a user is an
//! anonymous caller, which still goes through every declared predicate.
//!
//! Predicates are short expressions over two terms: `u` (the user) and `i`
//! (the item being accessed), e.g. `u.id == i.ownerId || u.role == 'admin'`.

use crate::storage::{Model, Operation};
use crate::transform::{compare_values, loose_eq, truthy};
use serde_json::Value;

/// Immutable caller identity. Once built, the user never changes.
#[derive(Debug, Clone, Default)]
pub struct Context {
    user: Option<Value>,
}

impl Context {
    /// Context for an authenticated user (a JSON object with at least `id`).
    pub fn new(user: Value) -> Self {
        Self { user: Some(user) }
    }

    /// Context for an unauthenticated caller.
    pub fn anonymous() -> Self {
        Self { user: None }
    }

    pub fn user(&self) -> Option<&Value> {
        self.user.as_ref()
    }

    pub fn user_id(&self) -> Option<&Value> {
        self.user.as_ref().and_then(|u| u.get("id"))
    }

    /// Evaluate the model's declared access rule for an operation (entity
    /// level) or a single field. Models without a rule allow the operation.
    /// A rule that fails to parse denies.
    pub fn access(
        &self,
        model: &dyn Model,
        operation: &Operation,
        data: &Value,
        field: Option<&str>,
    ) -> bool {
        let Some(rule) = model.access_rule(operation, field) else {
            return true;
        };
        match eval_predicate(rule, self.user.as_ref(), data) {
            Ok(allowed) => allowed,
            Err(err) => {
                tracing::warn!(
                    model = model.name(),
                    rule,
                    error = %err,
                    "access rule failed to evaluate; denying"
                );
                false
            }
        }
    }
}

/// Evaluate a predicate string with `u` bound to the user and `i` to the item.
pub fn eval_predicate(
    rule: &str,
    user: Option<&Value>,
    item: &Value,
) -> Result<bool, PredicateError> {
    let tokens = tokenize(rule)?;
    let mut parser = Parser { tokens, pos: 0 };
    let value = parser.or_expr(user, item)?;
    if parser.pos != parser.tokens.len() {
        return Err(PredicateError(format!(
            "trailing input after position {}",
            parser.pos
        )));
    }
    Ok(truthy(&value))
}

#[derive(Debug, Clone, PartialEq)]
pub struct PredicateError(String);

impl std::fmt::Display for PredicateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "bad predicate: {}", self.0)
    }
}

impl std::error::Error for PredicateError {}

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    LParen,
    RParen,
    Not,
    And,
    Or,
    Op(&'static str),
    Sym(String),
    Str(String),
    Num(f64),
}

fn tokenize(input: &str) -> Result<Vec<Tok>, PredicateError> {
    let mut chars = input.chars().peekable();
    let mut out = Vec::new();
    while let Some(&c) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
                chars.next();
            }
            '(' => {
                chars.next();
                out.push(Tok::LParen);
            }
            ')' => {
                chars.next();
                out.push(Tok::RParen);
            }
            '&' => {
                chars.next();
                if chars.next() != Some('&') {
                    return Err(PredicateError("expected '&&'".into()));
                }
                out.push(Tok::And);
            }
            '|' => {
                chars.next();
                if chars.next() != Some('|') {
                    return Err(PredicateError("expected '||'".into()));
                }
                out.push(Tok::Or);
            }
            '=' => {
                chars.next();
                if chars.next() != Some('=') {
                    return Err(PredicateError("expected '=='".into()));
                }
                out.push(Tok::Op("=="));
            }
            '!' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    out.push(Tok::Op("!="));
                } else {
                    out.push(Tok::Not);
                }
            }
            '<' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    out.push(Tok::Op("<="));
                } else {
                    out.push(Tok::Op("<"));
                }
            }
            '>' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    out.push(Tok::Op(">="));
                } else {
                    out.push(Tok::Op(">"));
                }
            }
            '\'' | '"' => {
                let quote = c;
                chars.next();
                let mut s = String::new();
                loop {
                    match chars.next() {
                        Some(nc) if nc == quote => break,
                        Some('\\') => {
                            if let Some(escaped) = chars.next() {
                                s.push(escaped);
                            }
                        }
                        Some(nc) => s.push(nc),
                        None => return Err(PredicateError("unterminated string".into())),
                    }
                }
                out.push(Tok::Str(s));
            }
            c if c.is_ascii_digit() || c == '-' => {
                let mut s = String::new();
                s.push(c);
                chars.next();
                while let Some(&nc) = chars.peek() {
                    if nc.is_ascii_digit() || nc == '.' {
                        s.push(nc);
                        chars.next();
                    } else {
                        break;
                    }
                }
                let n = s
                    .parse::<f64>()
                    .map_err(|_| PredicateError(format!("invalid number '{s}'")))?;
                out.push(Tok::Num(n));
            }
            c if c.is_alphanumeric() || c == '_' => {
                let mut s = String::new();
                while let Some(&nc) = chars.peek() {
                    if nc.is_alphanumeric() || nc == '_' || nc == '.' {
                        s.push(nc);
                        chars.next();
                    } else {
                        break;
                    }
                }
                out.push(Tok::Sym(s));
            }
            other => return Err(PredicateError(format!("unexpected character '{other}'"))),
        }
    }
    Ok(out)
}

struct Parser {
    tokens: Vec<Tok>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Tok> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Tok> {
        let t = self.tokens.get(self.pos).cloned();
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn or_expr(&mut self, user: Option<&Value>, item: &Value) -> Result<Value, PredicateError> {
        let mut left = self.and_expr(user, item)?;
        while self.peek() == Some(&Tok::Or) {
            self.next();
            let right = self.and_expr(user, item)?;
            left = Value::Bool(truthy(&left) || truthy(&right));
        }
        Ok(left)
    }

    fn and_expr(&mut self, user: Option<&Value>, item: &Value) -> Result<Value, PredicateError> {
        let mut left = self.not_expr(user, item)?;
        while self.peek() == Some(&Tok::And) {
            self.next();
            let right = self.not_expr(user, item)?;
            left = Value::Bool(truthy(&left) && truthy(&right));
        }
        Ok(left)
    }

    fn not_expr(&mut self, user: Option<&Value>, item: &Value) -> Result<Value, PredicateError> {
        if self.peek() == Some(&Tok::Not) {
            self.next();
            let inner = self.not_expr(user, item)?;
            return Ok(Value::Bool(!truthy(&inner)));
        }
        self.cmp_expr(user, item)
    }

    fn cmp_expr(&mut self, user: Option<&Value>, item: &Value) -> Result<Value, PredicateError> {
        let left = self.term(user, item)?;
        let op = match self.peek() {
            Some(Tok::Op(op)) => *op,
            Some(Tok::Sym(s)) if s == "in" => "in",
            _ => return Ok(left),
        };
        self.next();
        let right = self.term(user, item)?;
        let result = match op {
            "==" => loose_eq(&left, &right),
            "!=" => !loose_eq(&left, &right),
            "<" => compare_values(&left, &right) == Some(std::cmp::Ordering::Less),
            ">" => compare_values(&left, &right) == Some(std::cmp::Ordering::Greater),
            "<=" => matches!(
                compare_values(&left, &right),
                Some(std::cmp::Ordering::Less | std::cmp::Ordering::Equal)
            ),
            ">=" => matches!(
                compare_values(&left, &right),
                Some(std::cmp::Ordering::Greater | std::cmp::Ordering::Equal)
            ),
            "in" => right
                .as_array()
                .map(|items| items.contains(&left))
                .unwrap_or(false),
            _ => unreachable!("tokenizer emits known operators"),
        };
        Ok(Value::Bool(result))
    }

    fn term(&mut self, user: Option<&Value>, item: &Value) -> Result<Value, PredicateError> {
        match self.next() {
            Some(Tok::LParen) => {
                let inner = self.or_expr(user, item)?;
                if self.next() != Some(Tok::RParen) {
                    return Err(PredicateError("missing ')'".into()));
                }
                Ok(inner)
            }
            Some(Tok::Str(s)) => Ok(Value::String(s)),
            Some(Tok::Num(n)) => Ok(serde_json::Number::from_f64(n)
                .map(Value::Number)
                .unwrap_or(Value::Null)),
            Some(Tok::Sym(s)) => match s.as_str() {
                "true" => Ok(Value::Bool(true)),
                "false" => Ok(Value::Bool(false)),
                "null" => Ok(Value::Null),
                _ => resolve_path(&s, user, item),
            },
            other => Err(PredicateError(format!("unexpected token {other:?}"))),
        }
    }
}

fn resolve_path(
    path: &str,
    user: Option<&Value>,
    item: &Value,
) -> Result<Value, PredicateError> {
    let mut parts = path.split('.');
    let root = parts.next().expect("split yields at least one part");
    let mut current = match root {
        "u" => match user {
            Some(u) => u.clone(),
            None => Value::Null,
        },
        "i" => item.clone(),
        other => return Err(PredicateError(format!("unknown term '{other}'"))),
    };
    for part in parts {
        current = current.get(part).cloned().unwrap_or(Value::Null);
    }
    Ok(current)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn check(rule: &str, user: Option<Value>, item: Value) -> bool {
        eval_predicate(rule, user.as_ref(), &item).expect("predicate should parse")
    }

    #[test]
    fn user_item_comparison() {
        assert!(check(
            "u.id == i.ownerId",
            Some(json!({"id": 7})),
            json!({"ownerId": 7})
        ));
        assert!(!check(
            "u.id == i.ownerId",
            Some(json!({"id": 7})),
            json!({"ownerId": 8})
        ));
    }

    #[test]
    fn boolean_combinators() {
        let user = Some(json!({"id": 1, "role": "editor"}));
        assert!(check(
            "u.role == 'admin' || u.id == i.ownerId",
            user.clone(),
            json!({"ownerId": 1})
        ));
        assert!(!check(
            "u.role == 'admin' && u.id == i.ownerId",
            user.clone(),
            json!({"ownerId": 1})
        ));
        assert!(check("!(u.role == 'admin')", user, json!({})));
    }

    #[test]
    fn membership_and_ordering() {
        assert!(check(
            "u.role in i.allowed",
            Some(json!({"role": "editor"})),
            json!({"allowed": ["viewer", "editor"]})
        ));
        assert!(check("i.age >= 18", None, json!({"age": 21})));
        assert!(!check("i.age >= 18", None, json!({"age": 12})));
    }

    #[test]
    fn missing_user_is_null() {
        assert!(!check("u.id == i.ownerId", None, json!({"ownerId": 1})));
        assert!(check("u == null", None, json!({})));
    }

    #[test]
    fn bare_truthy_term() {
        assert!(check("i.active", None, json!({"active": true})));
        assert!(!check("i.active", None, json!({"active": 0})));
    }

    #[test]
    fn parse_errors_reported() {
        assert!(eval_predicate("u.id === 1", None, &json!({})).is_err());
        assert!(eval_predicate("(u.id == 1", None, &json!({})).is_err());
        assert!(eval_predicate("x.y == 1", None, &json!({})).is_err());
    }
}
