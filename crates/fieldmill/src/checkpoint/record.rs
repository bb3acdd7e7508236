//! Per-document outcome records and their tabular layout.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::job::field::justification_column;
use crate::job::FieldSpec;

/// Upper bound on the stored error message, in characters.
pub const MAX_ERROR_CHARS: usize = 1000;

pub const SOURCE_FILE_COLUMN: &str = "source_file";
pub const ERROR_COLUMN: &str = "error";

/// An extracted value and where in the document it was found.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldValue {
    pub value: String,
    pub justification: String,
}

impl FieldValue {
    pub fn new(value: &str, justification: &str) -> Self {
        Self {
            value: value.to_string(),
            justification: justification.to_string(),
        }
    }
}

/// Outcome of one document within a job.
///
/// `values` is positional: entry `i` belongs to the job's `i`-th field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub source_file: String,
    pub values: Vec<FieldValue>,
    /// Empty on success.
    pub error: String,
}

impl CheckpointRecord {
    pub fn success(source_file: &str, values: Vec<FieldValue>) -> Self {
        Self {
            source_file: source_file.to_string(),
            values,
            error: String::new(),
        }
    }

    /// Builds an error row with every field empty.
    pub fn failure(source_file: &str, field_count: usize, message: &str) -> Self {
        Self {
            source_file: source_file.to_string(),
            values: vec![FieldValue::default(); field_count],
            error: truncate_chars(message, MAX_ERROR_CHARS),
        }
    }

    pub fn is_error(&self) -> bool {
        !self.error.trim().is_empty()
    }
}

/// Returns at most `limit` characters of `s`.
pub fn truncate_chars(s: &str, limit: usize) -> String {
    match s.char_indices().nth(limit) {
        Some((idx, _)) => s[..idx].to_string(),
        None => s.to_string(),
    }
}

/// The identifier a document is recorded under: its file name.
pub fn source_file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string_lossy().into_owned())
}

/// Column layout of a job's checkpoint rows:
/// `source_file, (field, field_justification)*, error`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordSchema {
    fields: Vec<String>,
}

impl RecordSchema {
    pub fn from_fields(fields: &[FieldSpec]) -> Self {
        Self {
            fields: fields.iter().map(|f| f.name().to_string()).collect(),
        }
    }

    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    pub fn width(&self) -> usize {
        2 + self.fields.len() * 2
    }

    pub fn header(&self) -> Vec<String> {
        let mut header = Vec::with_capacity(self.width());
        header.push(SOURCE_FILE_COLUMN.to_string());
        for field in &self.fields {
            header.push(field.clone());
            header.push(justification_column(field));
        }
        header.push(ERROR_COLUMN.to_string());
        header
    }

    pub fn to_row(&self, record: &CheckpointRecord) -> Vec<String> {
        let mut row = Vec::with_capacity(self.width());
        row.push(record.source_file.clone());
        for i in 0..self.fields.len() {
            let value = record.values.get(i).cloned().unwrap_or_default();
            row.push(value.value);
            row.push(value.justification);
        }
        row.push(record.error.clone());
        row
    }

    /// Rebuilds a record from a row; `None` when the width is wrong.
    pub fn from_row(&self, row: &[String]) -> Option<CheckpointRecord> {
        if row.len() != self.width() {
            return None;
        }
        let values = row[1..row.len() - 1]
            .chunks(2)
            .map(|pair| FieldValue::new(&pair[0], &pair[1]))
            .collect();
        Some(CheckpointRecord {
            source_file: row[0].clone(),
            values,
            error: row[row.len() - 1].clone(),
        })
    }

    /// Flat JSON object keyed by column name.
    pub fn to_json(&self, record: &CheckpointRecord) -> serde_json::Value {
        let map = self
            .header()
            .into_iter()
            .zip(self.to_row(record))
            .map(|(k, v)| (k, serde_json::Value::String(v)))
            .collect::<serde_json::Map<_, _>>();
        serde_json::Value::Object(map)
    }

    /// Renders records as delimited text with a header row.
    pub fn to_csv(&self, records: &[CheckpointRecord]) -> String {
        let mut out = String::new();
        super::csv::write_row(&mut out, &self.header());
        for record in records {
            super::csv::write_row(&mut out, &self.to_row(record));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema() -> RecordSchema {
        RecordSchema::from_fields(&[
            FieldSpec::new("country", "").unwrap(),
            FieldSpec::new("has_policy", "").unwrap(),
        ])
    }

    #[test]
    fn test_header_layout() {
        assert_eq!(
            schema().header(),
            vec![
                "source_file",
                "country",
                "country_justification",
                "has_policy",
                "has_policy_justification",
                "error"
            ]
        );
    }

    #[test]
    fn test_row_conversion() {
        let record = CheckpointRecord::success(
            "a.pdf",
            vec![FieldValue::new("Austria", "p1"), FieldValue::new("yes", "p2")],
        );
        let row = schema().to_row(&record);
        assert_eq!(row, vec!["a.pdf", "Austria", "p1", "yes", "p2", ""]);
        assert_eq!(schema().from_row(&row), Some(record));
        assert_eq!(schema().from_row(&row[..3]), None);
    }

    #[test]
    fn test_failure_truncates_message() {
        let message = "é".repeat(MAX_ERROR_CHARS + 50);
        let record = CheckpointRecord::failure("b.pdf", 2, &message);
        assert!(record.is_error());
        assert_eq!(record.error.chars().count(), MAX_ERROR_CHARS);
        assert_eq!(record.values, vec![FieldValue::default(); 2]);
    }

    #[test]
    fn test_whitespace_error_is_not_an_error() {
        let mut record = CheckpointRecord::success("c.pdf", vec![]);
        record.error = "  ".to_string();
        assert!(!record.is_error());
    }

    #[test]
    fn test_to_json_is_flat() {
        let record = CheckpointRecord::failure("d.pdf", 2, "boom");
        let json = schema().to_json(&record);
        assert_eq!(json["source_file"], "d.pdf");
        assert_eq!(json["has_policy_justification"], "");
        assert_eq!(json["error"], "boom");
    }

    #[test]
    fn test_source_file_name() {
        assert_eq!(source_file_name(Path::new("/tmp/jobs/x/report.pdf")), "report.pdf");
    }
}
