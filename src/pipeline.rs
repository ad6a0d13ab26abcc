use std::collections::HashMap;

use chrono::Datelike;
use serde_json::{Map, Value};

use crate::config::Strictness;
use crate::document::{Document, ID_FIELD};
use crate::error::{Error, Result};
use crate::query::Query;
use crate::shape::SortSpec;
use crate::value::{normalize_date, parse_datetime};

// ---------------------------------------------------------------------------
// Expression
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Expression {
    Literal(Value),
    FieldRef(String),
    IfNull(Box<Expression>, Box<Expression>),
    Month(Box<Expression>),
    Year(Box<Expression>),
}

// ---------------------------------------------------------------------------
// Group key
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum GroupKey {
    Null,
    Single(Expression),
    Compound(Vec<(String, Expression)>),
}

// ---------------------------------------------------------------------------
// Accumulators
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Accumulator {
    /// Adds the expression's numeric value; non-numbers add 0.
    Sum(Expression),
}

// ---------------------------------------------------------------------------
// Pipeline stages
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Stage {
    Match(Query),
    Group {
        key: GroupKey,
        accumulators: Vec<(String, Accumulator)>,
    },
    Sort(SortSpec),
    Bucket {
        group_by: Expression,
        boundaries: Vec<(f64, Value)>,
        default: Option<Value>,
        accumulators: Vec<(String, Accumulator)>,
        drop_empty: bool,
    },
}

/// A parsed aggregation pipeline. Stages run strictly in order, each one
/// consuming the previous stage's output.
#[derive(Debug, Clone, PartialEq)]
pub struct Pipeline {
    stages: Vec<Stage>,
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn to_f64(v: &Value) -> Option<f64> {
    v.as_f64()
}

fn number_to_value(n: f64) -> Value {
    if n.fract() == 0.0 && n >= i64::MIN as f64 && n <= i64::MAX as f64 {
        Value::Number((n as i64).into())
    } else {
        serde_json::Number::from_f64(n)
            .map(Value::Number)
            .unwrap_or(Value::Null)
    }
}

fn reject(strictness: Strictness, msg: String) -> Result<()> {
    if strictness.is_strict() {
        return Err(Error::InvalidPipeline(msg));
    }
    log::warn!("ignoring {msg}");
    Ok(())
}

/// Month and year are taken in UTC. Numbers are epoch milliseconds.
fn to_datetime(v: &Value) -> Option<chrono::DateTime<chrono::Utc>> {
    match v {
        Value::String(s) => parse_datetime(s),
        Value::Number(n) => chrono::DateTime::from_timestamp_millis(n.as_i64()?),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Expression parsing & evaluation
// ---------------------------------------------------------------------------

fn parse_expression(val: &Value, strictness: Strictness) -> Result<Expression> {
    match val {
        Value::String(s) if s.starts_with('$') => Ok(Expression::FieldRef(s[1..].to_string())),
        Value::Object(map) if map.len() == 1 => {
            let Some((key, arg)) = map.iter().next() else {
                return Ok(Expression::Literal(val.clone()));
            };
            match key.as_str() {
                "$ifNull" => {
                    let arr = arg
                        .as_array()
                        .filter(|a| a.len() == 2)
                        .ok_or_else(|| {
                            Error::InvalidPipeline("$ifNull requires [expr, default]".into())
                        })?;
                    Ok(Expression::IfNull(
                        Box::new(parse_expression(&arr[0], strictness)?),
                        Box::new(parse_expression(&arr[1], strictness)?),
                    ))
                }
                "$month" => Ok(Expression::Month(Box::new(parse_expression(arg, strictness)?))),
                "$year" => Ok(Expression::Year(Box::new(parse_expression(arg, strictness)?))),
                op if op.starts_with('$') => {
                    reject(strictness, format!("unknown expression operator: {op}"))?;
                    Ok(Expression::Literal(val.clone()))
                }
                _ => Ok(Expression::Literal(val.clone())),
            }
        }
        _ => Ok(Expression::Literal(val.clone())),
    }
}

impl Expression {
    fn eval(&self, doc: &Document) -> Value {
        match self {
            Expression::Literal(v) => v.clone(),
            Expression::FieldRef(path) => doc.get(path).cloned().unwrap_or(Value::Null),
            Expression::IfNull(expr, default) => match expr.eval(doc) {
                Value::Null => default.eval(doc),
                v => v,
            },
            Expression::Month(expr) => to_datetime(&expr.eval(doc))
                .map(|dt| Value::from(dt.month()))
                .unwrap_or(Value::Null),
            Expression::Year(expr) => to_datetime(&expr.eval(doc))
                .map(|dt| Value::from(dt.year()))
                .unwrap_or(Value::Null),
        }
    }
}

// ---------------------------------------------------------------------------
// Stage parsing helpers
// ---------------------------------------------------------------------------

/// Parse `{name: {$sum: expr}, ...}`. Returns only the accumulators that are
/// understood; the rest are dropped (lenient) or rejected (strict).
fn parse_accumulators<'a>(
    specs: impl Iterator<Item = (&'a String, &'a Value)>,
    strictness: Strictness,
) -> Result<Vec<(String, Accumulator)>> {
    let mut accumulators = Vec::new();
    for (name, spec) in specs {
        let op = spec.as_object().filter(|o| o.len() == 1).and_then(|o| o.iter().next());
        match op {
            Some((op, arg)) if op == "$sum" => {
                accumulators.push((name.clone(), Accumulator::Sum(parse_expression(arg, strictness)?)));
            }
            Some((op, _)) => reject(strictness, format!("unsupported accumulator {op} for '{name}'"))?,
            None => reject(strictness, format!("accumulator '{name}' must be {{$op: expr}}"))?,
        }
    }
    Ok(accumulators)
}

fn parse_group_stage(val: &Value, strictness: Strictness) -> Result<Stage> {
    let obj = val
        .as_object()
        .ok_or_else(|| Error::InvalidPipeline("$group must be an object".into()))?;

    let key = match obj.get(ID_FIELD) {
        None => {
            reject(strictness, "$group without '_id', grouping everything".into())?;
            GroupKey::Null
        }
        Some(Value::Null) => GroupKey::Null,
        Some(Value::Object(map)) if !map.keys().any(|k| k.starts_with('$')) => {
            let fields: Result<Vec<_>> = map
                .iter()
                .map(|(k, v)| Ok((k.clone(), parse_expression(v, strictness)?)))
                .collect();
            GroupKey::Compound(fields?)
        }
        Some(other) => GroupKey::Single(parse_expression(other, strictness)?),
    };

    let accumulators = parse_accumulators(obj.iter().filter(|(k, _)| *k != ID_FIELD), strictness)?;
    Ok(Stage::Group { key, accumulators })
}

fn parse_bucket_stage(val: &Value, strictness: Strictness) -> Result<Stage> {
    let obj = val
        .as_object()
        .ok_or_else(|| Error::InvalidPipeline("$bucket must be an object".into()))?;

    let group_by = obj
        .get("groupBy")
        .ok_or_else(|| Error::InvalidPipeline("$bucket requires 'groupBy'".into()))?;
    let group_by = parse_expression(group_by, strictness)?;

    let raw = obj
        .get("boundaries")
        .and_then(Value::as_array)
        .ok_or_else(|| Error::InvalidPipeline("$bucket requires a 'boundaries' array".into()))?;
    if raw.len() < 2 {
        return Err(Error::InvalidPipeline(
            "$bucket needs at least two boundaries".into(),
        ));
    }
    let mut boundaries = Vec::with_capacity(raw.len());
    for b in raw {
        let n = to_f64(b).ok_or_else(|| {
            Error::InvalidPipeline(format!("$bucket boundary {b} is not a number"))
        })?;
        if boundaries.last().is_some_and(|(prev, _)| *prev >= n) {
            return Err(Error::InvalidPipeline(
                "$bucket boundaries must be strictly ascending".into(),
            ));
        }
        boundaries.push((n, b.clone()));
    }

    let (accumulators, drop_empty) = match obj.get("output") {
        Some(Value::Object(output)) => (parse_accumulators(output.iter(), strictness)?, true),
        Some(_) => return Err(Error::InvalidPipeline("$bucket 'output' must be an object".into())),
        None => (
            vec![("count".to_string(), Accumulator::Sum(Expression::Literal(Value::from(1))))],
            false,
        ),
    };

    Ok(Stage::Bucket {
        group_by,
        boundaries,
        default: obj.get("default").cloned(),
        accumulators,
        drop_empty,
    })
}

// ---------------------------------------------------------------------------
// Stage execution
// ---------------------------------------------------------------------------

fn accumulate(accumulators: &[(String, Accumulator)], states: &mut [f64], doc: &Document) {
    for ((_, acc), state) in accumulators.iter().zip(states.iter_mut()) {
        match acc {
            Accumulator::Sum(expr) => *state += to_f64(&expr.eval(doc)).unwrap_or(0.0),
        }
    }
}

fn finish(id: Value, accumulators: &[(String, Accumulator)], states: &[f64]) -> Document {
    let mut doc = Map::new();
    doc.insert(ID_FIELD.to_string(), id);
    for ((name, _), state) in accumulators.iter().zip(states) {
        doc.insert(name.clone(), number_to_value(*state));
    }
    Document::from_map(doc)
}

fn exec_match(docs: Vec<Document>, query: &Query) -> Vec<Document> {
    docs.into_iter().filter(|doc| query.matches(doc)).collect()
}

fn exec_group(
    docs: Vec<Document>,
    key: &GroupKey,
    accumulators: &[(String, Accumulator)],
) -> Vec<Document> {
    let mut slots: HashMap<String, usize> = HashMap::new();
    let mut groups: Vec<(Value, Vec<f64>)> = Vec::new();

    for doc in &docs {
        let key_val = match key {
            GroupKey::Null => Value::Null,
            GroupKey::Single(expr) => expr.eval(doc),
            GroupKey::Compound(fields) => {
                let mut map = Map::new();
                for (name, expr) in fields {
                    map.insert(name.clone(), expr.eval(doc));
                }
                Value::Object(map)
            }
        };

        let slot = *slots.entry(group_key(&key_val)).or_insert_with(|| {
            groups.push((key_val, vec![0.0; accumulators.len()]));
            groups.len() - 1
        });
        accumulate(accumulators, &mut groups[slot].1, doc);
    }

    groups
        .into_iter()
        .map(|(id, states)| finish(id, accumulators, &states))
        .collect()
}

/// Slot key for a group `_id`: equal values (`1` and `1.0`, one instant
/// written two ways, objects in any key order) map to the same string.
fn group_key(value: &Value) -> String {
    fn canonical(value: &Value) -> Value {
        match value {
            Value::Number(n) => match n.as_f64() {
                Some(f) if !n.is_i64() && !n.is_u64() => number_to_value(f),
                _ => value.clone(),
            },
            Value::String(_) => normalize_date(value.clone()),
            Value::Array(items) => Value::Array(items.iter().map(canonical).collect()),
            Value::Object(map) => {
                let mut keys: Vec<&String> = map.keys().collect();
                keys.sort();
                Value::Object(keys.into_iter().map(|k| (k.clone(), canonical(&map[k]))).collect())
            }
            _ => value.clone(),
        }
    }
    canonical(value).to_string()
}

fn exec_sort(mut docs: Vec<Document>, spec: &SortSpec) -> Vec<Document> {
    spec.apply(&mut docs);
    docs
}

fn exec_bucket(
    docs: Vec<Document>,
    group_by: &Expression,
    boundaries: &[(f64, Value)],
    default: Option<&Value>,
    accumulators: &[(String, Accumulator)],
    drop_empty: bool,
) -> Vec<Document> {
    // One slot per [lower, upper) interval, plus a trailing default slot.
    let intervals = boundaries.len() - 1;
    let mut states = vec![vec![0.0; accumulators.len()]; intervals + 1];

    for doc in &docs {
        let slot = to_f64(&group_by.eval(doc)).and_then(|v| {
            boundaries
                .windows(2)
                .position(|w| v >= w[0].0 && v < w[1].0)
        });
        match (slot, default) {
            (Some(i), _) => accumulate(accumulators, &mut states[i], doc),
            (None, Some(_)) => accumulate(accumulators, &mut states[intervals], doc),
            (None, None) => {}
        }
    }

    let ids = boundaries[..intervals]
        .iter()
        .map(|(_, raw)| raw.clone())
        .chain(default.cloned());
    ids.zip(states)
        .filter(|(_, s)| !drop_empty || s.iter().any(|v| *v != 0.0))
        .map(|(id, s)| finish(id, accumulators, &s))
        .collect()
}

// ---------------------------------------------------------------------------
// Pipeline parsing & execution
// ---------------------------------------------------------------------------

impl Pipeline {
    pub fn parse(pipeline_json: &Value) -> Result<Self> {
        Self::parse_with(pipeline_json, Strictness::Lenient)
    }

    pub fn parse_with(pipeline_json: &Value, strictness: Strictness) -> Result<Self> {
        let arr = pipeline_json
            .as_array()
            .ok_or_else(|| Error::InvalidPipeline("pipeline must be an array".into()))?;

        let mut stages = Vec::new();
        for stage_val in arr {
            let obj = stage_val.as_object().ok_or_else(|| {
                Error::InvalidPipeline("each pipeline stage must be an object".into())
            })?;
            if obj.len() != 1 {
                reject(
                    strictness,
                    format!("stage with {} keys, running them in order", obj.len()),
                )?;
            }

            for (stage_name, stage_body) in obj {
                let stage = match stage_name.as_str() {
                    "$match" => Stage::Match(Query::parse_with(stage_body, strictness)?),
                    "$group" => parse_group_stage(stage_body, strictness)?,
                    "$sort" => Stage::Sort(SortSpec::parse_with(stage_body, strictness)?),
                    "$bucket" => parse_bucket_stage(stage_body, strictness)?,
                    other => {
                        reject(strictness, format!("unknown stage: {other}"))?;
                        continue;
                    }
                };
                stages.push(stage);
            }
        }

        Ok(Pipeline { stages })
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn run(&self, docs: Vec<Document>) -> Vec<Document> {
        let mut current = docs;
        for stage in &self.stages {
            current = match stage {
                Stage::Match(query) => exec_match(current, query),
                Stage::Group { key, accumulators } => exec_group(current, key, accumulators),
                Stage::Sort(spec) => exec_sort(current, spec),
                Stage::Bucket {
                    group_by,
                    boundaries,
                    default,
                    accumulators,
                    drop_empty,
                } => exec_bucket(
                    current,
                    group_by,
                    boundaries,
                    default.as_ref(),
                    accumulators,
                    *drop_empty,
                ),
            };
        }
        current
    }
}

// ===========================================================================
// Tests
// ===========================================================================
