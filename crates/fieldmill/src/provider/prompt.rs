//! Instruction text sent alongside each document.

use crate::job::FieldSpec;

const TEMPLATE: &str = r#"
You are an AI assistant tasked with extracting structured data from the provided document text.

**Context:**
{context}

**Fields to extract:**
{fields}

For each field listed above, determine:
  1. `value` - the extracted value (string) or "not specified".
  2. `justification` - a brief reference to where you found it (e.g. "Page 4, paragraph 2") or "not found".

**Document to process:**
{file_name}

**Important**
Output a single JSON object with one key per field, where each key maps to an object with `value` and `justification`.
If a field names countries and the document clearly applies to more than one, list every value separated by comma (e.g. "Austria, Germany" or "AUT, DEU").
Do **not** output any additional text.
You **can** extract information from the document name.
Always return the 'justification' field even if the value is "not found".
"#;

/// Renders the instructions for one document.
pub fn render_instructions(context: &str, fields: &[FieldSpec], file_name: &str) -> String {
    let field_lines = fields
        .iter()
        .map(|f| format!("- **{}**: {}", f.name(), f.description()))
        .collect::<Vec<_>>()
        .join("\n");

    TEMPLATE
        .replace("{context}", context.trim())
        .replace("{fields}", &field_lines)
        .replace("{file_name}", file_name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_lists_fields_in_order() {
        let fields = vec![
            FieldSpec::new("Country", "Country the policy covers").unwrap(),
            FieldSpec::new("PrEP available", "Is PrEP offered?").unwrap(),
        ];
        let text = render_instructions("  HIV prevention policies \n", &fields, "austria.pdf");

        assert!(text.contains("**Context:**\nHIV prevention policies\n"));
        assert!(text.contains(
            "- **country**: Country the policy covers\n- **prep_available**: Is PrEP offered?"
        ));
        assert!(text.contains("**Document to process:**\naustria.pdf"));
        assert!(!text.contains("{fields}"));
    }
}
