use std::cmp::Ordering;

use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use serde_json::Value;

/// A JSON value canonicalized for comparison.
///
/// Strings shaped like ISO-8601 date-times become `DateTime(millis)` so that
/// two spellings of the same instant compare equal and dates order
/// chronologically rather than lexically.
#[derive(Debug, Clone)]
pub enum Comparable {
    Null,
    Boolean(bool),
    Integer(i64),
    Float(f64),
    DateTime(i64), // millis since epoch
    String(String),
    /// Arrays and objects, ordered by their serialized form.
    Composite(String),
}

impl PartialEq for Comparable {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Comparable {}

impl PartialOrd for Comparable {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Comparable {
    fn cmp(&self, other: &Self) -> Ordering {
        use Comparable::*;
        match (self, other) {
            (Null, Null) => Ordering::Equal,
            (Null, _) => Ordering::Less,
            (_, Null) => Ordering::Greater,

            (Boolean(a), Boolean(b)) => a.cmp(b),
            (Boolean(_), _) => Ordering::Less,
            (_, Boolean(_)) => Ordering::Greater,

            (Integer(a), Integer(b)) => a.cmp(b),
            (Integer(a), Float(b)) => (*a as f64).total_cmp(b),
            (Float(a), Integer(b)) => a.total_cmp(&(*b as f64)),
            (Float(a), Float(b)) => a.total_cmp(b),
            (Integer(_) | Float(_), _) => Ordering::Less,
            (_, Integer(_) | Float(_)) => Ordering::Greater,

            (DateTime(a), DateTime(b)) => a.cmp(b),
            (DateTime(_), _) => Ordering::Less,
            (_, DateTime(_)) => Ordering::Greater,

            (String(a), String(b)) => a.cmp(b),
            (String(_), _) => Ordering::Less,
            (_, String(_)) => Ordering::Greater,

            (Composite(a), Composite(b)) => a.cmp(b),
        }
    }
}

impl Comparable {
    pub fn from_json(value: &Value) -> Self {
        match value {
            Value::Null => Comparable::Null,
            Value::Bool(b) => Comparable::Boolean(*b),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Comparable::Integer(i)
                } else if let Some(f) = n.as_f64() {
                    Comparable::Float(f)
                } else {
                    Comparable::Null
                }
            }
            Value::String(s) => Self::parse_string(s),
            other => Comparable::Composite(other.to_string()),
        }
    }

    pub fn parse_string(s: &str) -> Self {
        match parse_datetime(s) {
            Some(dt) => Comparable::DateTime(dt.timestamp_millis()),
            None => Comparable::String(s.to_string()),
        }
    }

    /// True when both values belong to the same ordered domain, i.e. a range
    /// comparison between them is meaningful.
    pub fn same_kind(&self, other: &Self) -> bool {
        use Comparable::*;
        matches!(
            (self, other),
            (Boolean(_), Boolean(_))
                | (Integer(_) | Float(_), Integer(_) | Float(_))
                | (DateTime(_), DateTime(_))
                | (String(_), String(_))
        )
    }
}

/// Parse a string that looks like an ISO-8601 date-time (`YYYY-MM-DDT...`).
/// Offsets are honored; strings without one are taken as UTC.
pub fn parse_datetime(s: &str) -> Option<DateTime<Utc>> {
    let b = s.as_bytes();
    // Fast path: skip parsing for strings that don't start with a date and a 'T'.
    if b.len() < 16
        || !b[0..4].iter().all(u8::is_ascii_digit)
        || b[4] != b'-'
        || !b[5..7].iter().all(u8::is_ascii_digit)
        || b[7] != b'-'
        || !b[8..10].iter().all(u8::is_ascii_digit)
        || b[10] != b'T'
    {
        return None;
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(dt.and_utc());
        }
    }
    None
}

/// Render an instant the way every timestamp in the store is written:
/// UTC, millisecond precision, `Z` suffix.
pub fn format_datetime(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Rewrite a date-like string into canonical timestamp form. Any other value
/// is returned unchanged.
pub fn normalize_date(value: Value) -> Value {
    match value {
        Value::String(s) => match parse_datetime(&s) {
            Some(dt) => Value::String(format_datetime(dt)),
            None => Value::String(s),
        },
        other => other,
    }
}

/// Equality used by the query matcher: scalars are canonicalized (dates by
/// instant, integers and floats numerically), arrays and objects compare
/// element by element.
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Array(x), Value::Array(y)) => {
            x.len() == y.len() && x.iter().zip(y).all(|(l, r)| values_equal(l, r))
        }
        (Value::Object(x), Value::Object(y)) => {
            x.len() == y.len()
                && x.iter()
                    .all(|(k, v)| y.get(k).is_some_and(|other| values_equal(v, other)))
        }
        (Value::Array(_) | Value::Object(_), _) | (_, Value::Array(_) | Value::Object(_)) => {
            false
        }
        _ => Comparable::from_json(a) == Comparable::from_json(b),
    }
}

/// Total order used for sorting. Missing values sort before everything.
pub fn compare_optional(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(x), Some(y)) => Comparable::from_json(x).cmp(&Comparable::from_json(y)),
    }
}
