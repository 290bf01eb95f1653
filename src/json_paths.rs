use serde::Serialize;
use serde_json::Value as JsonValue;

use crate::{field_path::ROOT_PATH, utils::parse_date_ms};

pub const DEFAULT_MAX_DEPTH: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    Null,
    Array,
    Number,
    Boolean,
    Date,
    String,
    Object,
    Undefined,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExtractedField {
    pub path: String,
    #[serde(rename = "type")]
    pub inferred_type: FieldType,
    /// `None` when the sample had nothing at this path (empty arrays).
    pub sample: Option<JsonValue>,
}

impl ExtractedField {
    fn new(path: String, sample: Option<&JsonValue>) -> Self {
        Self {
            path,
            inferred_type: infer_type(sample),
            sample: sample.cloned(),
        }
    }
}

pub fn infer_type(v: Option<&JsonValue>) -> FieldType {
    match v {
        None => FieldType::Undefined,
        Some(JsonValue::Null) => FieldType::Null,
        Some(JsonValue::Array(_)) => FieldType::Array,
        Some(JsonValue::Number(_)) => FieldType::Number,
        Some(JsonValue::Bool(_)) => FieldType::Boolean,
        Some(JsonValue::String(s)) if parse_date_ms(s).is_some() => FieldType::Date,
        Some(JsonValue::String(_)) => FieldType::String,
        Some(JsonValue::Object(_)) => FieldType::Object,
    }
}

/// Lists the addressable leaves of `sample` in traversal order.
///
/// Object keys are visited in insertion order. A branch deeper than
/// `max_depth` contributes nothing; scalar members of an object are emitted
/// without a depth check of their own.
pub fn extract_paths(sample: &JsonValue, max_depth: usize) -> Vec<ExtractedField> {
    let mut out = Vec::new();
    walk(sample, "", max_depth, 0, &mut out);
    out
}

fn walk(node: &JsonValue, prefix: &str, max_depth: usize, depth: usize, out: &mut Vec<ExtractedField>) {
    if depth > max_depth {
        return;
    }

    match node {
        JsonValue::Array(items) => {
            let path = format!("{prefix}[0]");
            match items.first() {
                None => out.push(ExtractedField::new(path, None)),
                Some(first) => walk(first, &path, max_depth, depth + 1, out),
            }
        }
        JsonValue::Object(map) => {
            for (key, value) in map {
                let path = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{prefix}.{key}")
                };
                match value {
                    JsonValue::Array(_) | JsonValue::Object(_) => {
                        walk(value, &path, max_depth, depth + 1, out)
                    }
                    _ => out.push(ExtractedField::new(path, Some(value))),
                }
            }
        }
        _ => {
            let path = if prefix.is_empty() { ROOT_PATH.to_string() } else { prefix.to_string() };
            out.push(ExtractedField::new(path, Some(node)));
        }
    }
}

pub const RECOMMENDED_FIELDS: usize = 3;

/// Keys pre-selected for a new widget: the first few number or string members
/// of the sample (or of its first element when the sample is an array).
pub fn recommended_fields(sample: &JsonValue) -> Vec<String> {
    let first = match sample {
        JsonValue::Array(items) => items.first(),
        other => Some(other),
    };
    let scalar = |v: &JsonValue| matches!(v, JsonValue::Number(_) | JsonValue::String(_));
    match first {
        Some(JsonValue::Object(map)) => map
            .iter()
            .filter(|(_, v)| scalar(v))
            .map(|(k, _)| k.clone())
            .take(RECOMMENDED_FIELDS)
            .collect(),
        Some(JsonValue::Array(items)) => items
            .iter()
            .enumerate()
            .filter(|(_, v)| scalar(v))
            .map(|(i, _)| i.to_string())
            .take(RECOMMENDED_FIELDS)
            .collect(),
        _ => Vec::new(),
    }
}
