//! Extraction field specifications.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::checkpoint::record::{ERROR_COLUMN, SOURCE_FILE_COLUMN};
use crate::error::FieldSpecError;

/// Maximum description length, in characters.
pub const MAX_DESCRIPTION_CHARS: usize = 300;

/// Suffix appended to a field name to form its justification column.
pub const JUSTIFICATION_SUFFIX: &str = "_justification";

/// Column name holding the justification for `field`.
pub fn justification_column(field: &str) -> String {
    format!("{}{}", field, JUSTIFICATION_SUFFIX)
}

fn is_reserved(name: &str) -> bool {
    name == SOURCE_FILE_COLUMN || name == ERROR_COLUMN || name.ends_with(JUSTIFICATION_SUFFIX)
}

/// A named, described value to extract from every document.
///
/// The name is normalized on construction and is always a legal identifier
/// (`[a-zA-Z_][a-zA-Z0-9_]*`) that does not shadow a result column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "FieldSpecInput")]
pub struct FieldSpec {
    name: String,
    description: String,
}

impl FieldSpec {
    pub fn new(name: &str, description: &str) -> Result<Self, FieldSpecError> {
        let normalized = normalize_name(name);
        if !is_identifier(&normalized) {
            return Err(FieldSpecError::InvalidFieldName {
                raw: name.to_string(),
                normalized,
            });
        }
        if is_reserved(&normalized) {
            return Err(FieldSpecError::ReservedName { name: normalized });
        }

        let length = description.chars().count();
        if length > MAX_DESCRIPTION_CHARS {
            return Err(FieldSpecError::DescriptionTooLong {
                name: normalized,
                length,
                limit: MAX_DESCRIPTION_CHARS,
            });
        }

        Ok(Self {
            name: normalized,
            description: description.to_string(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }
}

/// Unvalidated field as it arrives at the submission boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldSpecInput {
    pub name: String,
    #[serde(default)]
    pub description: String,
}

impl FieldSpecInput {
    pub fn new(name: &str, description: &str) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
        }
    }
}

impl TryFrom<FieldSpecInput> for FieldSpec {
    type Error = FieldSpecError;

    fn try_from(input: FieldSpecInput) -> Result<Self, Self::Error> {
        FieldSpec::new(&input.name, &input.description)
    }
}

/// Lower-cases the name, maps separators to `_`, and drops quotes and brackets.
pub fn normalize_name(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.to_lowercase().chars() {
        match c {
            ' ' | '-' | '+' | '/' | '\\' => out.push('_'),
            '\'' | '"' | '(' | ')' => {}
            '&' => out.push_str("_and_"),
            other => out.push(other),
        }
    }
    out
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    }
}

/// Validates a list of boundary inputs into field specs.
///
/// Rejects an empty list, blank names, and names that collide after
/// normalization.
pub fn build_field_specs(inputs: &[FieldSpecInput]) -> Result<Vec<FieldSpec>, FieldSpecError> {
    if inputs.is_empty() {
        return Err(FieldSpecError::NoFields);
    }

    let mut specs = Vec::with_capacity(inputs.len());
    for (index, input) in inputs.iter().enumerate() {
        if input.name.trim().is_empty() {
            return Err(FieldSpecError::EmptyName { index: index + 1 });
        }
        specs.push(FieldSpec::new(&input.name, &input.description)?);
    }

    let mut seen = BTreeSet::new();
    let mut duplicates = BTreeSet::new();
    for spec in &specs {
        if !seen.insert(spec.name()) {
            duplicates.insert(spec.name().to_string());
        }
    }
    if !duplicates.is_empty() {
        return Err(FieldSpecError::Duplicate(duplicates.into_iter().collect()));
    }

    Ok(specs)
}

/// Parses a JSON list of `{name, description}` objects.
pub fn parse_fields_payload(raw: &str) -> Result<Vec<FieldSpec>, FieldSpecError> {
    let inputs: Vec<FieldSpecInput> =
        serde_json::from_str(raw).map_err(|e| FieldSpecError::Payload(e.to_string()))?;
    build_field_specs(&inputs)
}
