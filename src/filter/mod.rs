//! Message Filters
//!
//! A bridge may be given a selector over message properties. Only messages
//! for which the selector evaluates to TRUE are forwarded. The selector
//! language is the familiar SQL-92 conditional subset:
//!
//! - comparisons `= <> < <= > >=`, arithmetic `+ - * /`
//! - `AND`, `OR`, `NOT` with three-valued logic (a missing property is NULL)
//! - `[NOT] BETWEEN a AND b`, `[NOT] IN ('x', 'y')`
//! - `[NOT] LIKE 'pat%' [ESCAPE '\']`, `IS [NOT] NULL`
//! - string, integer, float and boolean literals

use std::cmp::Ordering;
use std::fmt;

use regex::Regex;

use crate::message::{Properties, PropertyValue};

mod parser;

pub use parser::{parse, ArithOp, CompareOp, Expr, Literal};

/// Selector syntax error
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterError {
    /// Character offset of the failure
    pub position: usize,
    pub message: String,
}

impl FilterError {
    pub fn new(position: usize, message: impl Into<String>) -> Self {
        Self {
            position,
            message: message.into(),
        }
    }
}

impl fmt::Display for FilterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "invalid filter at position {}: {}",
            self.position, self.message
        )
    }
}

impl std::error::Error for FilterError {}

/// Predicate deciding whether a message is forwarded
pub trait Filter: Send + Sync {
    /// True if the message with these properties should be forwarded
    fn evaluate(&self, properties: &Properties) -> bool;

    /// Source text, for logging
    fn expression(&self) -> &str;
}

/// Runtime value during evaluation
#[derive(Debug, Clone, PartialEq)]
enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl From<&Literal> for Value {
    fn from(lit: &Literal) -> Self {
        match lit {
            Literal::Null => Value::Null,
            Literal::Bool(b) => Value::Bool(*b),
            Literal::Int(v) => Value::Int(*v),
            Literal::Float(v) => Value::Float(*v),
            Literal::Str(s) => Value::Str(s.clone()),
        }
    }
}

impl From<&PropertyValue> for Value {
    fn from(value: &PropertyValue) -> Self {
        match value {
            PropertyValue::Bool(b) => Value::Bool(*b),
            PropertyValue::Int(v) => Value::Int(*v as i64),
            PropertyValue::Long(v) => Value::Int(*v),
            PropertyValue::Double(v) => Value::Float(*v),
            PropertyValue::String(s) => Value::Str(s.clone()),
            // Byte properties are not comparable in selectors
            PropertyValue::Bytes(_) => Value::Null,
        }
    }
}

/// Compare two values; `None` when either is NULL or the types differ
fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Int(x), Value::Int(y)) => Some(x.cmp(y)),
        (Value::Int(x), Value::Float(y)) => (*x as f64).partial_cmp(y),
        (Value::Float(x), Value::Int(y)) => x.partial_cmp(&(*y as f64)),
        (Value::Float(x), Value::Float(y)) => x.partial_cmp(y),
        (Value::Str(x), Value::Str(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

fn arith(op: ArithOp, a: Value, b: Value) -> Value {
    match (a, b) {
        (Value::Int(x), Value::Int(y)) => match op {
            ArithOp::Add => x.checked_add(y).map(Value::Int).unwrap_or(Value::Null),
            ArithOp::Sub => x.checked_sub(y).map(Value::Int).unwrap_or(Value::Null),
            ArithOp::Mul => x.checked_mul(y).map(Value::Int).unwrap_or(Value::Null),
            ArithOp::Div => x.checked_div(y).map(Value::Int).unwrap_or(Value::Null),
        },
        (a, b) => {
            let (Some(x), Some(y)) = (as_f64(&a), as_f64(&b)) else {
                return Value::Null;
            };
            Value::Float(match op {
                ArithOp::Add => x + y,
                ArithOp::Sub => x - y,
                ArithOp::Mul => x * y,
                ArithOp::Div => x / y,
            })
        }
    }
}

fn as_f64(v: &Value) -> Option<f64> {
    match v {
        Value::Int(x) => Some(*x as f64),
        Value::Float(x) => Some(*x),
        _ => None,
    }
}

/// Three-valued NOT
fn not(v: Option<bool>) -> Option<bool> {
    v.map(|b| !b)
}

/// Translate a LIKE pattern into an anchored regex
fn like_regex(pattern: &str, escape: Option<char>) -> Result<Regex, regex::Error> {
    let mut out = String::from("(?s)^");
    let mut chars = pattern.chars();
    while let Some(c) = chars.next() {
        if Some(c) == escape {
            if let Some(next) = chars.next() {
                out.push_str(&regex::escape(&next.to_string()));
            }
            continue;
        }
        match c {
            '%' => out.push_str(".*"),
            '_' => out.push('.'),
            other => out.push_str(&regex::escape(&other.to_string())),
        }
    }
    out.push('$');
    Regex::new(&out)
}

/// Compiled expression node; LIKE patterns are compiled once up front
enum Compiled {
    Expr(Expr),
    Like {
        value: Expr,
        regex: Regex,
        negated: bool,
    },
    Not(Box<Compiled>),
    And(Box<Compiled>, Box<Compiled>),
    Or(Box<Compiled>, Box<Compiled>),
}

impl Compiled {
    fn build(expr: Expr) -> Result<Self, FilterError> {
        Ok(match expr {
            Expr::Like {
                value,
                pattern,
                escape,
                negated,
            } => {
                let regex = like_regex(&pattern, escape)
                    .map_err(|e| FilterError::new(0, format!("bad LIKE pattern: {}", e)))?;
                Compiled::Like {
                    value: *value,
                    regex,
                    negated,
                }
            }
            Expr::Not(inner) => Compiled::Not(Box::new(Self::build(*inner)?)),
            Expr::And(a, b) => Compiled::And(Box::new(Self::build(*a)?), Box::new(Self::build(*b)?)),
            Expr::Or(a, b) => Compiled::Or(Box::new(Self::build(*a)?), Box::new(Self::build(*b)?)),
            other => Compiled::Expr(other),
        })
    }

    fn truth(&self, props: &Properties) -> Option<bool> {
        match self {
            Compiled::Expr(expr) => truth(expr, props),
            Compiled::Like {
                value,
                regex,
                negated,
            } => match value_of(value, props) {
                Value::Str(s) => Some(regex.is_match(&s) != *negated),
                _ => None,
            },
            Compiled::Not(inner) => not(inner.truth(props)),
            Compiled::And(a, b) => match (a.truth(props), b.truth(props)) {
                (Some(false), _) | (_, Some(false)) => Some(false),
                (Some(true), Some(true)) => Some(true),
                _ => None,
            },
            Compiled::Or(a, b) => match (a.truth(props), b.truth(props)) {
                (Some(true), _) | (_, Some(true)) => Some(true),
                (Some(false), Some(false)) => Some(false),
                _ => None,
            },
        }
    }
}

fn value_of(expr: &Expr, props: &Properties) -> Value {
    match expr {
        Expr::Literal(lit) => Value::from(lit),
        Expr::Property(name) => props.get(name).map(Value::from).unwrap_or(Value::Null),
        Expr::Neg(inner) => match value_of(inner, props) {
            Value::Int(v) => v.checked_neg().map(Value::Int).unwrap_or(Value::Null),
            Value::Float(v) => Value::Float(-v),
            _ => Value::Null,
        },
        Expr::Arith(op, a, b) => arith(*op, value_of(a, props), value_of(b, props)),
        // Boolean-valued expressions used as operands
        other => match truth(other, props) {
            Some(b) => Value::Bool(b),
            None => Value::Null,
        },
    }
}

fn truth(expr: &Expr, props: &Properties) -> Option<bool> {
    match expr {
        Expr::Compare(op, a, b) => {
            let ord = compare(&value_of(a, props), &value_of(b, props))?;
            Some(match op {
                CompareOp::Eq => ord == Ordering::Equal,
                CompareOp::Ne => ord != Ordering::Equal,
                CompareOp::Lt => ord == Ordering::Less,
                CompareOp::Le => ord != Ordering::Greater,
                CompareOp::Gt => ord == Ordering::Greater,
                CompareOp::Ge => ord != Ordering::Less,
            })
        }
        Expr::Between {
            value,
            low,
            high,
            negated,
        } => {
            let v = value_of(value, props);
            let lo = compare(&v, &value_of(low, props))?;
            let hi = compare(&v, &value_of(high, props))?;
            let inside = lo != Ordering::Less && hi != Ordering::Greater;
            Some(inside != *negated)
        }
        Expr::In {
            value,
            list,
            negated,
        } => {
            let v = value_of(value, props);
            if v == Value::Null {
                return None;
            }
            let found = list
                .iter()
                .any(|lit| compare(&v, &Value::from(lit)) == Some(Ordering::Equal));
            Some(found != *negated)
        }
        Expr::IsNull { value, negated } => {
            let is_null = value_of(value, props) == Value::Null;
            Some(is_null != *negated)
        }
        Expr::Like { .. } | Expr::Not(_) | Expr::And(_, _) | Expr::Or(_, _) => {
            // Nested boolean operators inside arithmetic context are rare;
            // compile on the fly
            Compiled::build(expr.clone()).ok()?.truth(props)
        }
        other => match value_of(other, props) {
            Value::Bool(b) => Some(b),
            _ => None,
        },
    }
}

/// Filter backed by a parsed selector expression
pub struct SelectorFilter {
    expression: String,
    compiled: Compiled,
}

impl SelectorFilter {
    /// Parse a selector; fails on syntax errors
    pub fn new(expression: &str) -> Result<Self, FilterError> {
        let expr = parse(expression)?;
        Ok(Self {
            expression: expression.to_string(),
            compiled: Compiled::build(expr)?,
        })
    }
}

impl Filter for SelectorFilter {
    fn evaluate(&self, properties: &Properties) -> bool {
        self.compiled.truth(properties) == Some(true)
    }

    fn expression(&self) -> &str {
        &self.expression
    }
}

impl fmt::Debug for SelectorFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SelectorFilter")
            .field("expression", &self.expression)
            .finish()
    }
}

/// Build a filter from an optional expression; blank means no filter
pub fn from_expression(expression: Option<&str>) -> Result<Option<SelectorFilter>, FilterError> {
    match expression.map(str::trim) {
        None | Some("") => Ok(None),
        Some(expr) => SelectorFilter::new(expr).map(Some),
    }
}

#[cfg(test)]
mod tests;
