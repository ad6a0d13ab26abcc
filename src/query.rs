use serde_json::{Map, Value};

use crate::config::Strictness;
use crate::document::Document;
use crate::error::{Error, Result};
use crate::value::{values_equal, Comparable};

// ---------------------------------------------------------------------------
// Query AST
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum QueryOp {
    Eq(Value),
    Ne(Value),
    Gt(Value),
    Gte(Value),
    Lt(Value),
    Lte(Value),
    In(Vec<Value>),
    Nin(Vec<Value>),
    Exists(bool),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Query {
    Field { field: String, op: QueryOp },
    And(Vec<Query>),
    Or(Vec<Query>),
    All, // match everything
}

// ---------------------------------------------------------------------------
// Parsing: JSON → Query AST
// ---------------------------------------------------------------------------

impl Query {
    /// Parse with lenient handling of unknown operators.
    pub fn parse(query: &Value) -> Result<Query> {
        Self::parse_with(query, Strictness::Lenient)
    }

    /// Parse a query document. `null` and `{}` match everything.
    pub fn parse_with(query: &Value, strictness: Strictness) -> Result<Query> {
        let obj = match query {
            Value::Null => return Ok(Query::All),
            Value::Object(obj) => obj,
            _ => return Err(Error::InvalidQuery("query must be a JSON object".into())),
        };

        let mut conditions: Vec<Query> = Vec::new();

        for (key, value) in obj {
            match key.as_str() {
                "$and" | "$or" => {
                    let Some(arr) = value.as_array() else {
                        reject(strictness, format!("{key} must be an array"))?;
                        continue;
                    };
                    let subs = arr
                        .iter()
                        .map(|sub| Self::parse_with(sub, strictness))
                        .collect::<Result<Vec<_>>>()?;
                    conditions.push(if key == "$and" {
                        Query::And(subs)
                    } else {
                        Query::Or(subs)
                    });
                }
                op if op.starts_with('$') => {
                    reject(strictness, format!("unknown top-level operator: {op}"))?;
                }
                field => match value {
                    Value::Object(ops) if ops.keys().any(|k| k.starts_with('$')) => {
                        parse_field_ops(field, ops, strictness, &mut conditions)?;
                    }
                    // Plain value (or object without operators): equality
                    _ => conditions.push(Query::Field {
                        field: field.to_string(),
                        op: QueryOp::Eq(value.clone()),
                    }),
                },
            }
        }

        Ok(match conditions.len() {
            0 => Query::All,
            1 => conditions.remove(0),
            _ => Query::And(conditions),
        })
    }

    pub fn matches(&self, doc: &Document) -> bool {
        match self {
            Query::All => true,
            Query::Field { field, op } => matches_op(doc.get(field), op),
            Query::And(subs) => subs.iter().all(|s| s.matches(doc)),
            Query::Or(subs) => subs.iter().any(|s| s.matches(doc)),
        }
    }
}

/// In strict mode turn `msg` into an error; in lenient mode log and carry on.
fn reject(strictness: Strictness, msg: String) -> Result<()> {
    if strictness.is_strict() {
        return Err(Error::InvalidQuery(msg));
    }
    log::warn!("ignoring {msg}");
    Ok(())
}

fn parse_field_ops(
    field: &str,
    ops: &Map<String, Value>,
    strictness: Strictness,
    out: &mut Vec<Query>,
) -> Result<()> {
    for (op_key, op_val) in ops {
        let op = match op_key.as_str() {
            "$eq" => QueryOp::Eq(op_val.clone()),
            "$ne" => QueryOp::Ne(op_val.clone()),
            "$gt" => QueryOp::Gt(op_val.clone()),
            "$gte" => QueryOp::Gte(op_val.clone()),
            "$lt" => QueryOp::Lt(op_val.clone()),
            "$lte" => QueryOp::Lte(op_val.clone()),
            "$in" | "$nin" => {
                let Some(arr) = op_val.as_array() else {
                    reject(strictness, format!("{op_key} on '{field}' must be an array"))?;
                    continue;
                };
                if op_key == "$in" {
                    QueryOp::In(arr.clone())
                } else {
                    QueryOp::Nin(arr.clone())
                }
            }
            "$exists" => QueryOp::Exists(truthy(op_val)),
            other if other.starts_with('$') => {
                reject(strictness, format!("unknown operator {other} on '{field}'"))?;
                continue;
            }
            // Non-operator keys inside an operator object carry no meaning.
            _ => continue,
        };
        out.push(Query::Field {
            field: field.to_string(),
            op,
        });
    }
    Ok(())
}

fn truthy(v: &Value) -> bool {
    match v {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

fn matches_op(field_val: Option<&Value>, op: &QueryOp) -> bool {
    match op {
        QueryOp::Exists(expected) => field_val.is_some() == *expected,
        QueryOp::Eq(v) => field_val.is_some_and(|f| values_equal(f, v)),
        QueryOp::Ne(v) => !field_val.is_some_and(|f| values_equal(f, v)),
        QueryOp::In(vals) => field_val.is_some_and(|f| vals.iter().any(|v| values_equal(f, v))),
        QueryOp::Nin(vals) => !field_val.is_some_and(|f| vals.iter().any(|v| values_equal(f, v))),
        QueryOp::Gt(v) => compare_range(field_val, v, |o| o.is_gt()),
        QueryOp::Gte(v) => compare_range(field_val, v, |o| o.is_ge()),
        QueryOp::Lt(v) => compare_range(field_val, v, |o| o.is_lt()),
        QueryOp::Lte(v) => compare_range(field_val, v, |o| o.is_le()),
    }
}

/// Range comparison after date canonicalization. Missing, null and
/// mismatched kinds never satisfy a range operator.
fn compare_range(
    field_val: Option<&Value>,
    bound: &Value,
    pred: impl Fn(std::cmp::Ordering) -> bool,
) -> bool {
    let Some(val) = field_val else {
        return false;
    };
    let a = Comparable::from_json(val);
    let b = Comparable::from_json(bound);
    a.same_kind(&b) && pred(a.cmp(&b))
}
