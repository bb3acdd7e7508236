//! Tabular input for the aggregator.

use crate::checkpoint::csv;
use crate::checkpoint::{CheckpointRecord, RecordSchema};
use crate::error::AggregateError;

/// Named columns over rows of optional cells. Blank cells are `None`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordTable {
    columns: Vec<String>,
    rows: Vec<Vec<Option<String>>>,
}

fn cell(text: &str) -> Option<String> {
    if text.trim().is_empty() {
        None
    } else {
        Some(text.to_string())
    }
}

impl RecordTable {
    pub fn new(columns: Vec<String>, rows: Vec<Vec<Option<String>>>) -> Result<Self, AggregateError> {
        for (i, row) in rows.iter().enumerate() {
            if row.len() != columns.len() {
                return Err(AggregateError::RowWidth {
                    row: i + 1,
                    found: row.len(),
                    expected: columns.len(),
                });
            }
        }
        Ok(Self { columns, rows })
    }

    /// Parses delimited text whose first record is the header.
    pub fn from_csv(text: &str) -> Result<Self, AggregateError> {
        let text = text.strip_prefix('\u{feff}').unwrap_or(text);
        let mut records = csv::parse_document(text)?.into_iter();
        let columns: Vec<String> = records
            .next()
            .ok_or(AggregateError::EmptyInput)?
            .into_iter()
            .map(|c| c.trim().to_string())
            .collect();

        let rows = records
            .map(|record| record.iter().map(|c| cell(c)).collect())
            .collect();
        Self::new(columns, rows)
    }

    /// Builds a table from checkpoint records using the log's column layout.
    pub fn from_records(schema: &RecordSchema, records: &[CheckpointRecord]) -> Self {
        Self {
            columns: schema.header(),
            rows: records
                .iter()
                .map(|r| schema.to_row(r).iter().map(|c| cell(c)).collect())
                .collect(),
        }
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[Vec<Option<String>>] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }
}
