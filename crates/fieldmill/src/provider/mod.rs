//! Inference capability: turns a document plus instructions into field values.

use std::collections::BTreeMap;
use std::path::Path;

use async_trait::async_trait;

use crate::checkpoint::record::FieldValue;
use crate::error::ProviderError;
use crate::job::FieldSpec;

pub mod gemini;
pub mod parse;
pub mod prompt;

pub use gemini::GeminiProvider;
pub use parse::{parse_extraction, DEFAULT_JUSTIFICATION, DEFAULT_VALUE};
pub use prompt::render_instructions;

/// One structured record returned for a document, keyed by field name.
pub type Extraction = BTreeMap<String, FieldValue>;

/// A service that extracts structured records from a document.
///
/// Implementations must be shareable across job tasks.
#[async_trait]
pub trait InferenceProvider: Send + Sync {
    /// Short identifier used in logs.
    fn name(&self) -> &str;

    async fn process(
        &self,
        document: &Path,
        instructions: &str,
    ) -> Result<Vec<Extraction>, ProviderError>;
}

/// Lines an extraction up with the job's fields.
///
/// Keys the job did not ask for are ignored and missing fields get the
/// default placeholders. An extraction sharing no key with the job's
/// fields is rejected as malformed.
pub fn resolve_fields(
    extraction: &Extraction,
    fields: &[FieldSpec],
) -> Result<Vec<FieldValue>, ProviderError> {
    if !fields.iter().any(|f| extraction.contains_key(f.name())) {
        let returned: Vec<&str> = extraction.keys().map(String::as_str).collect();
        return Err(ProviderError::Malformed(format!(
            "none of the requested fields were returned (got {:?})",
            returned
        )));
    }

    Ok(fields
        .iter()
        .map(|f| {
            extraction
                .get(f.name())
                .cloned()
                .unwrap_or_else(|| FieldValue::new(DEFAULT_VALUE, DEFAULT_JUSTIFICATION))
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields() -> Vec<FieldSpec> {
        vec![
            FieldSpec::new("country", "").unwrap(),
            FieldSpec::new("has_policy", "").unwrap(),
        ]
    }

    #[test]
    fn test_resolve_fields_orders_by_spec() {
        let mut extraction = Extraction::new();
        extraction.insert("has_policy".to_string(), FieldValue::new("yes", "p. 3"));
        extraction.insert("country".to_string(), FieldValue::new("Austria", ""));
        extraction.insert("extra".to_string(), FieldValue::new("ignored", ""));

        let values = resolve_fields(&extraction, &fields()).unwrap();
        assert_eq!(
            values,
            vec![FieldValue::new("Austria", ""), FieldValue::new("yes", "p. 3")]
        );
    }

    #[test]
    fn test_resolve_fields_fills_missing() {
        let mut extraction = Extraction::new();
        extraction.insert("country".to_string(), FieldValue::new("Austria", ""));

        let values = resolve_fields(&extraction, &fields()).unwrap();
        assert_eq!(
            values[1],
            FieldValue::new(DEFAULT_VALUE, DEFAULT_JUSTIFICATION)
        );
    }

    #[test]
    fn test_resolve_fields_rejects_unrelated_output() {
        let mut extraction = Extraction::new();
        extraction.insert("weather".to_string(), FieldValue::new("sunny", ""));
        assert!(matches!(
            resolve_fields(&extraction, &fields()),
            Err(ProviderError::Malformed(_))
        ));
    }
}
