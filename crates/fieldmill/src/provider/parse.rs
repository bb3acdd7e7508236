//! Parsing of model output into extractions.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::{Map, Value};

use crate::checkpoint::record::FieldValue;
use crate::error::ProviderError;

use super::Extraction;

/// Value recorded when the model gives none.
pub const DEFAULT_VALUE: &str = "Not specified";
/// Justification recorded when the model gives none.
pub const DEFAULT_JUSTIFICATION: &str = "Not found";

static RE_FENCED_JSON: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```(?:json)?\s*(\{.*?\})\s*```").unwrap());

/// Extracts the JSON object from raw model text or a fenced block.
fn parse_object(text: &str) -> Result<Map<String, Value>, ProviderError> {
    let value = match serde_json::from_str::<Value>(text.trim()) {
        Ok(value) => value,
        Err(_) => {
            let captures = RE_FENCED_JSON.captures(text).ok_or_else(|| {
                ProviderError::Malformed(
                    "response does not contain valid JSON or a JSON markdown block".to_string(),
                )
            })?;
            serde_json::from_str(&captures[1]).map_err(|e| {
                ProviderError::Malformed(format!("failed to parse JSON from markdown block: {}", e))
            })?
        }
    };

    match value {
        Value::Object(map) => Ok(map),
        _ => Err(ProviderError::Malformed(
            "parsed response is not a JSON object".to_string(),
        )),
    }
}

/// Renders a JSON scalar as cell text; `null` becomes `None`.
fn cell_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

fn is_falsy(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Bool(b) => !b,
        Value::String(s) => s.is_empty(),
        Value::Number(n) => n.as_f64() == Some(0.0),
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
    }
}

/// Parses model output into one extraction.
///
/// Each key maps to `{value, justification}`; a missing or empty value
/// becomes [`DEFAULT_VALUE`] and a missing justification
/// [`DEFAULT_JUSTIFICATION`]. Keys listed in `bare_fields` may instead
/// carry a plain scalar, recorded with an empty justification.
pub fn parse_extraction(text: &str, bare_fields: &[String]) -> Result<Extraction, ProviderError> {
    let object = parse_object(text)?;

    let mut extraction = Extraction::new();
    for (field, info) in object {
        let value = match info {
            Value::Object(ref entry) => {
                let value = match entry.get("value") {
                    Some(v) if !is_falsy(v) => cell_text(v).unwrap_or_default(),
                    _ => DEFAULT_VALUE.to_string(),
                };
                let justification = match entry.get("justification") {
                    Some(j) => cell_text(j).unwrap_or_default(),
                    None => DEFAULT_JUSTIFICATION.to_string(),
                };
                FieldValue { value, justification }
            }
            ref scalar if bare_fields.iter().any(|b| b == &field) => {
                let value = match cell_text(scalar) {
                    Some(text) if !text.is_empty() => text,
                    _ => DEFAULT_VALUE.to_string(),
                };
                FieldValue::new(&value, "")
            }
            other => {
                return Err(ProviderError::Malformed(format!(
                    "field '{}' has unexpected structure: {}",
                    field, other
                )))
            }
        };
        extraction.insert(field, value);
    }

    Ok(extraction)
}
