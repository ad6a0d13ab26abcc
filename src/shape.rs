use std::cmp::Ordering;

use serde_json::{Map, Value};

use crate::config::Strictness;
use crate::document::{set_path, Document, ID_FIELD};
use crate::error::{Error, Result};
use crate::value::compare_optional;

// ---------------------------------------------------------------------------
// Sort
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Asc,
    Desc,
}

impl SortOrder {
    fn from_json(dir: &Value) -> Option<Self> {
        match dir {
            Value::Number(n) => match n.as_f64() {
                Some(f) if f > 0.0 => Some(SortOrder::Asc),
                Some(f) if f < 0.0 => Some(SortOrder::Desc),
                _ => None,
            },
            Value::String(s) => match s.to_ascii_lowercase().as_str() {
                "asc" | "ascending" => Some(SortOrder::Asc),
                "desc" | "descending" => Some(SortOrder::Desc),
                _ => None,
            },
            _ => None,
        }
    }
}

/// Ordered list of sort keys; earlier keys take precedence.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SortSpec(Vec<(String, SortOrder)>);

impl SortSpec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn asc(mut self, field: impl Into<String>) -> Self {
        self.0.push((field.into(), SortOrder::Asc));
        self
    }

    pub fn desc(mut self, field: impl Into<String>) -> Self {
        self.0.push((field.into(), SortOrder::Desc));
        self
    }

    pub fn parse(spec: &Value) -> Result<Self> {
        Self::parse_with(spec, Strictness::Lenient)
    }

    /// Parse a `{field: 1 | -1, ...}` mapping, keeping key order.
    pub fn parse_with(spec: &Value, strictness: Strictness) -> Result<Self> {
        let obj = spec
            .as_object()
            .ok_or_else(|| Error::InvalidQuery("sort spec must be an object".into()))?;
        let mut keys = Vec::with_capacity(obj.len());
        for (field, dir) in obj {
            match SortOrder::from_json(dir) {
                Some(order) => keys.push((field.clone(), order)),
                None if strictness.is_strict() => {
                    return Err(Error::InvalidQuery(format!(
                        "sort direction for '{field}' must be 1 or -1"
                    )))
                }
                None => log::warn!("ignoring sort key '{field}' with direction {dir}"),
            }
        }
        Ok(Self(keys))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn keys(&self) -> &[(String, SortOrder)] {
        &self.0
    }

    pub fn compare(&self, a: &Document, b: &Document) -> Ordering {
        for (field, order) in &self.0 {
            let cmp = compare_optional(a.get(field), b.get(field));
            let cmp = match order {
                SortOrder::Asc => cmp,
                SortOrder::Desc => cmp.reverse(),
            };
            if cmp != Ordering::Equal {
                return cmp;
            }
        }
        Ordering::Equal
    }

    /// Stable sort: documents with equal keys keep their relative order.
    pub fn apply(&self, docs: &mut [Document]) {
        if !self.0.is_empty() {
            docs.sort_by(|a, b| self.compare(a, b));
        }
    }
}

// ---------------------------------------------------------------------------
// Projection
// ---------------------------------------------------------------------------

/// Field selection parsed from a whitespace separated list such as
/// `"name email"` or `"-password"`. The first field's prefix picks the mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Projection {
    Include(Vec<String>),
    Exclude(Vec<String>),
}

impl Projection {
    /// Returns `None` for a list with no fields.
    pub fn parse(fields: &str) -> Option<Self> {
        let parts: Vec<&str> = fields.split_whitespace().collect();
        let first = parts.first()?;
        if first.starts_with('-') {
            Some(Projection::Exclude(
                parts
                    .iter()
                    .map(|p| p.strip_prefix('-').unwrap_or(p).to_string())
                    .collect(),
            ))
        } else {
            Some(Projection::Include(
                parts.iter().map(|p| p.to_string()).collect(),
            ))
        }
    }

    pub fn apply(&self, doc: &Document) -> Document {
        match self {
            Projection::Exclude(fields) => {
                let mut result = doc.clone();
                for field in fields {
                    result.remove(field);
                }
                result
            }
            Projection::Include(fields) => {
                let mut result = Map::new();
                if let Some(id) = doc.as_map().get(ID_FIELD) {
                    result.insert(ID_FIELD.to_string(), id.clone());
                }
                for field in fields {
                    if let Some(val) = doc.get(field) {
                        set_path(&mut result, field, val.clone());
                    }
                }
                Document::from_map(result)
            }
        }
    }
}
