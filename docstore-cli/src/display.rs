use colored::Colorize;
use docstore::Document;
use serde_json::Value;

/// Render a list of documents. `raw_json` prints one compact JSON array
/// suitable for piping.
pub fn format_documents(docs: Vec<Document>, raw_json: bool) -> String {
    let values: Vec<Value> = docs.into_iter().map(Document::into_value).collect();
    if raw_json {
        return Value::Array(values).to_string();
    }
    if values.is_empty() {
        return "(empty)".dimmed().to_string();
    }

    let count = values.len();
    let mut lines: Vec<String> = values.iter().map(pretty_json).collect();
    lines.push(format!("{count} document(s)").dimmed().to_string());
    lines.join("\n")
}

pub fn format_document(doc: Option<Document>, raw_json: bool) -> String {
    match doc {
        Some(doc) if raw_json => doc.into_value().to_string(),
        Some(doc) => pretty_json(&doc.into_value()),
        None if raw_json => "null".to_string(),
        None => "not found".dimmed().to_string(),
    }
}

pub fn format_scalar(value: Value, raw_json: bool) -> String {
    if raw_json {
        return value.to_string();
    }
    match value {
        Value::Number(n) => n.to_string().cyan().to_string(),
        Value::String(s) => s.green().to_string(),
        other => pretty_json(&other),
    }
}

pub fn format_error(err: &dyn std::fmt::Display) -> String {
    format!("{} {}", "Error:".red().bold(), err.to_string().red())
}

fn pretty_json(value: &Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}
