use serde_json::{Map, Value};

use crate::config::Strictness;
use crate::document::{Document, CREATED_AT, ID_FIELD};
use crate::error::{Error, Result};

/// A parsed update: assignments (direct fields first, then `$set`) followed
/// by removals (`$unset`).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpdateSpec {
    assignments: Vec<(String, Value)>,
    unset: Vec<String>,
}

impl UpdateSpec {
    pub fn parse(update: &Value) -> Result<Self> {
        Self::parse_with(update, Strictness::Lenient)
    }

    pub fn parse_with(update: &Value, strictness: Strictness) -> Result<Self> {
        let obj = update
            .as_object()
            .ok_or_else(|| Error::InvalidUpdate("update must be an object".into()))?;

        let mut direct = Vec::new();
        let mut set = Vec::new();
        let mut unset = Vec::new();

        for (key, value) in obj {
            match key.as_str() {
                "$set" => match value.as_object() {
                    Some(fields) => collect_assignments(fields, &mut set),
                    None => reject(strictness, "$set value must be an object".into())?,
                },
                "$unset" => match value {
                    Value::Object(fields) => unset.extend(fields.keys().cloned()),
                    Value::Array(names) => {
                        unset.extend(names.iter().filter_map(Value::as_str).map(String::from))
                    }
                    Value::String(name) => unset.push(name.clone()),
                    _ => reject(strictness, "$unset value must be an object".into())?,
                },
                op if op.starts_with('$') => {
                    reject(strictness, format!("unknown update operator: {op}"))?
                }
                field => {
                    if !is_protected(field) {
                        direct.push((field.to_string(), value.clone()));
                    }
                }
            }
        }

        unset.retain(|path| !is_protected(path));
        direct.extend(set);
        Ok(Self {
            assignments: direct,
            unset,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.assignments.is_empty() && self.unset.is_empty()
    }

    /// Apply assignments then removals. Timestamps are left to the caller.
    pub fn apply(&self, doc: &mut Document) {
        for (path, value) in &self.assignments {
            doc.insert(path, value.clone());
        }
        for path in &self.unset {
            doc.remove(path);
        }
    }
}

fn collect_assignments(fields: &Map<String, Value>, out: &mut Vec<(String, Value)>) {
    for (path, value) in fields {
        if !is_protected(path) {
            out.push((path.clone(), value.clone()));
        }
    }
}

/// `_id` and `createdAt` are fixed once a document is created.
fn is_protected(path: &str) -> bool {
    if path == ID_FIELD || path == CREATED_AT {
        log::debug!("update ignores write to immutable field '{path}'");
        return true;
    }
    false
}

fn reject(strictness: Strictness, msg: String) -> Result<()> {
    if strictness.is_strict() {
        return Err(Error::InvalidUpdate(msg));
    }
    log::warn!("ignoring {msg}");
    Ok(())
}
