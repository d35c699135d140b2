//! Sandboxed predicate compiler based on JSON selectors.
//!
//! Stored filter source is a JSON object, not host code:
//!
//! ```text
//! {"type": "author", "age": {"$gte": 18}, "$or": [{"tags": "x"}, {"tags": "y"}]}
//! ```
//!
//! Field names may be dotted paths. Operand objects of the form
//! `{"$query": "param"}` read from the request's query parameters. A view
//! map source uses the same syntax and emits `(doc._id, null)` when the
//! document matches.

use crate::error::{FeedError, Result};
use crate::filter::{Emit, FilterContext, MapFunction, Predicate, PredicateCompiler};
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::sync::Arc;

/// An operand, either literal or taken from the query parameters.
#[derive(Clone, Debug, PartialEq)]
enum Operand {
    Literal(Value),
    Query(String),
}

impl Operand {
    fn parse(value: &Value) -> Self {
        if let Some(obj) = value.as_object() {
            if obj.len() == 1 {
                if let Some(Value::String(param)) = obj.get("$query") {
                    return Operand::Query(param.clone());
                }
            }
        }
        Operand::Literal(value.clone())
    }

    fn resolve<'v>(&'v self, ctx: &'v FilterContext) -> Option<&'v Value> {
        match self {
            Operand::Literal(value) => Some(value),
            Operand::Query(param) => ctx.query.get(param),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
enum Condition {
    Eq(Operand),
    Ne(Operand),
    Gt(Operand),
    Gte(Operand),
    Lt(Operand),
    Lte(Operand),
    In(Operand),
    Nin(Operand),
    Exists(bool),
}

/// A parsed selector.
#[derive(Clone, Debug, PartialEq)]
pub struct Selector {
    clauses: Vec<Clause>,
}

#[derive(Clone, Debug, PartialEq)]
enum Clause {
    And(Vec<Selector>),
    Or(Vec<Selector>),
    Not(Box<Selector>),
    Field { path: String, conditions: Vec<Condition> },
}

impl Selector {
    /// Parse selector source text.
    pub fn parse(source: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(source)?;
        Self::from_value(&value)
    }

    pub fn from_value(value: &Value) -> Result<Self> {
        let obj = value
            .as_object()
            .ok_or_else(|| FeedError::BadRequest("selector must be a JSON object".to_string()))?;

        let mut clauses = Vec::with_capacity(obj.len());
        for (key, operand) in obj {
            let clause = match key.as_str() {
                "$and" => Clause::And(parse_list(key, operand)?),
                "$or" => Clause::Or(parse_list(key, operand)?),
                "$not" => Clause::Not(Box::new(Self::from_value(operand)?)),
                op if op.starts_with('$') => return Err(unknown_operator(op)),
                path => Clause::Field {
                    path: path.to_string(),
                    conditions: parse_conditions(operand)?,
                },
            };
            clauses.push(clause);
        }
        Ok(Self { clauses })
    }

    /// Evaluate against a document. Clauses are combined with AND.
    pub fn matches(&self, doc: &Value, ctx: &FilterContext) -> bool {
        self.clauses.iter().all(|clause| match clause {
            Clause::And(all) => all.iter().all(|s| s.matches(doc, ctx)),
            Clause::Or(any) => any.iter().any(|s| s.matches(doc, ctx)),
            Clause::Not(inner) => !inner.matches(doc, ctx),
            Clause::Field { path, conditions } => {
                let value = field_value(doc, path);
                conditions.iter().all(|c| evaluate(value, c, ctx))
            }
        })
    }
}

fn parse_list(op: &str, operand: &Value) -> Result<Vec<Selector>> {
    operand
        .as_array()
        .ok_or_else(|| FeedError::BadRequest(format!("{} expects an array", op)))?
        .iter()
        .map(Selector::from_value)
        .collect()
}

fn is_operator_object(value: &Value) -> Option<&Map<String, Value>> {
    match value.as_object() {
        Some(obj)
            if !obj.is_empty()
                && obj.keys().all(|k| k.starts_with('$'))
                && !obj.contains_key("$query") =>
        {
            Some(obj)
        }
        _ => None,
    }
}

fn parse_conditions(operand: &Value) -> Result<Vec<Condition>> {
    let ops = match is_operator_object(operand) {
        Some(ops) => ops,
        None => return Ok(vec![Condition::Eq(Operand::parse(operand))]),
    };

    ops.iter()
        .map(|(op, arg)| {
            Ok(match op.as_str() {
                "$eq" => Condition::Eq(Operand::parse(arg)),
                "$ne" => Condition::Ne(Operand::parse(arg)),
                "$gt" => Condition::Gt(Operand::parse(arg)),
                "$gte" => Condition::Gte(Operand::parse(arg)),
                "$lt" => Condition::Lt(Operand::parse(arg)),
                "$lte" => Condition::Lte(Operand::parse(arg)),
                "$in" => Condition::In(Operand::parse(arg)),
                "$nin" => Condition::Nin(Operand::parse(arg)),
                "$exists" => Condition::Exists(arg.as_bool().ok_or_else(|| {
                    FeedError::BadRequest("$exists expects a boolean".to_string())
                })?),
                other => return Err(unknown_operator(other)),
            })
        })
        .collect()
}

fn unknown_operator(op: &str) -> FeedError {
    FeedError::BadRequest(format!("unknown selector operator: {}", op))
}

fn field_value<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = doc;
    for part in path.split('.') {
        current = current.as_object()?.get(part)?;
    }
    Some(current)
}

/// Order numbers, strings and booleans among themselves; other pairs are
/// incomparable.
fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

fn equals(value: &Value, target: &Value) -> bool {
    if value == target {
        return true;
    }
    // A scalar target matches any element of an array field.
    match (value, target) {
        (Value::Array(items), t) if !t.is_array() => items.iter().any(|item| item == t),
        _ => false,
    }
}

fn evaluate(value: Option<&Value>, condition: &Condition, ctx: &FilterContext) -> bool {
    let ordered = |operand: &Operand, accept: fn(Ordering) -> bool| {
        match (value, operand.resolve(ctx)) {
            (Some(v), Some(t)) => compare(v, t).map_or(false, accept),
            _ => false,
        }
    };

    match condition {
        Condition::Exists(expected) => value.is_some() == *expected,
        Condition::Eq(operand) => match (value, operand.resolve(ctx)) {
            (Some(v), Some(t)) => equals(v, t),
            _ => false,
        },
        Condition::Ne(operand) => match (value, operand.resolve(ctx)) {
            (Some(v), Some(t)) => !equals(v, t),
            (None, _) => true,
            (Some(_), None) => true,
        },
        Condition::Gt(operand) => ordered(operand, |o| o == Ordering::Greater),
        Condition::Gte(operand) => ordered(operand, |o| o != Ordering::Less),
        Condition::Lt(operand) => ordered(operand, |o| o == Ordering::Less),
        Condition::Lte(operand) => ordered(operand, |o| o != Ordering::Greater),
        Condition::In(operand) => match (value, operand.resolve(ctx).and_then(Value::as_array)) {
            (Some(v), Some(items)) => items.iter().any(|t| equals(v, t)),
            _ => false,
        },
        Condition::Nin(operand) => match (value, operand.resolve(ctx).and_then(Value::as_array)) {
            (Some(v), Some(items)) => !items.iter().any(|t| equals(v, t)),
            _ => true,
        },
    }
}

/// [`PredicateCompiler`] that evaluates JSON selectors. Stored text never
/// reaches anything but the selector parser.
#[derive(Clone, Copy, Debug, Default)]
pub struct SelectorCompiler;

impl PredicateCompiler for SelectorCompiler {
    fn compile_filter(&self, source: &str) -> Result<Predicate> {
        let selector = Selector::parse(source)?;
        Ok(Arc::new(move |doc: &Value, ctx: &FilterContext| {
            selector.matches(doc, ctx)
        }))
    }

    fn compile_map(&self, source: &str) -> Result<MapFunction> {
        let selector = Selector::parse(source)?;
        let ctx = FilterContext::default();
        Ok(Arc::new(move |doc: &Value, emit: &mut Emit<'_>| {
            if selector.matches(doc, &ctx) {
                emit(doc.get("_id").cloned().unwrap_or(Value::Null), Value::Null);
            }
        }))
    }
}
