//! Reduces per-document records to one row per entity key.
//!
//! Rows naming several entities (`"AUT, DEU"` / `"Austria, Germany"`) are
//! split first. Within each key group, any `yes` for a field wins; the
//! justifications of the rows that support the resolved answer are merged
//! with their source file names.

use std::collections::{BTreeMap, BTreeSet};

use log::{debug, info};

use crate::checkpoint::csv;
use crate::checkpoint::record::{ERROR_COLUMN, SOURCE_FILE_COLUMN};
use crate::config::AggregationConfig;
use crate::error::AggregateError;
use crate::job::field::{justification_column, JUSTIFICATION_SUFFIX};
use crate::provider::DEFAULT_VALUE;

pub mod table;

pub use table::RecordTable;

/// Justification used when the supporting rows gave nothing usable.
pub const NO_JUSTIFICATION: &str = "Justification not provided";

const UNKNOWN_FILE: &str = "Unknown_File";

/// Values that count as a negative answer when no row says yes.
const NO_LIKE: &[&str] = &["no", "not specified", "", "nan"];

/// Values whose justification is kept when the group is negative.
const NO_INCLUDED: &[&str] = &["no", "not specified"];

/// Justification texts that carry no information.
const EMPTY_JUSTIFICATIONS: &[&str] = &["not specified", "not found", "nan", "none", ""];

fn normalize(value: Option<&str>) -> String {
    value.unwrap_or_default().trim().to_lowercase()
}

fn is_yes(value: &str) -> bool {
    value.trim().eq_ignore_ascii_case("yes")
}

fn is_valid_justification(text: &str) -> bool {
    !EMPTY_JUSTIFICATIONS.contains(&text.trim().to_lowercase().as_str())
}

/// One resolved field of an aggregated row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregatedField {
    pub value: String,
    pub justification: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregatedRow {
    pub key: String,
    /// Display name; `None` when the input has no name column.
    pub name: Option<String>,
    /// Positional, matching [`AggregatedTable::fields`].
    pub fields: Vec<AggregatedField>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregatedTable {
    key_field: String,
    name_field: Option<String>,
    fields: Vec<String>,
    rows: Vec<AggregatedRow>,
}

impl AggregatedTable {
    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    /// Rows ordered by key.
    pub fn rows(&self) -> &[AggregatedRow] {
        &self.rows
    }

    pub fn row(&self, key: &str) -> Option<&AggregatedRow> {
        self.rows.iter().find(|r| r.key == key)
    }

    /// Name first, key second, then each field followed by its justification.
    pub fn columns(&self) -> Vec<String> {
        let mut columns = Vec::with_capacity(2 + self.fields.len() * 2);
        if let Some(name) = &self.name_field {
            columns.push(name.clone());
        }
        columns.push(self.key_field.clone());
        for field in &self.fields {
            columns.push(field.clone());
            columns.push(justification_column(field));
        }
        columns
    }

    pub fn to_csv(&self) -> String {
        let mut out = String::new();
        csv::write_row(&mut out, &self.columns());
        for row in &self.rows {
            let mut cells = Vec::with_capacity(2 + row.fields.len() * 2);
            if self.name_field.is_some() {
                cells.push(row.name.clone().unwrap_or_default());
            }
            cells.push(row.key.clone());
            for field in &row.fields {
                cells.push(field.value.clone());
                cells.push(field.justification.clone());
            }
            csv::write_row(&mut out, &cells);
        }
        out
    }
}

/// A row after multi-entity splitting, still pointing at its source cells.
struct Observation<'a> {
    name: Option<String>,
    cells: &'a [Option<String>],
}

impl Observation<'_> {
    fn get(&self, idx: usize) -> Option<&str> {
        self.cells.get(idx).and_then(|c| c.as_deref())
    }
}

#[derive(Debug, Clone)]
pub struct Aggregator {
    key_field: String,
    name_field: String,
}

impl Default for Aggregator {
    fn default() -> Self {
        Self::from_config(&AggregationConfig::default())
    }
}

impl Aggregator {
    pub fn new(key_field: &str, name_field: &str) -> Self {
        Self {
            key_field: key_field.to_string(),
            name_field: name_field.to_string(),
        }
    }

    pub fn from_config(config: &AggregationConfig) -> Self {
        Self::new(&config.key_field, &config.name_field)
    }

    pub fn aggregate(&self, table: &RecordTable) -> Result<AggregatedTable, AggregateError> {
        info!("Aggregating {} raw records by '{}'", table.len(), self.key_field);

        let key_idx = table
            .column_index(&self.key_field)
            .ok_or_else(|| AggregateError::MissingKeyColumn(self.key_field.clone()))?;
        let name_idx = table.column_index(&self.name_field);

        let groups = self.group(table, key_idx, name_idx);

        // Every other column is a field, unless it is bookkeeping or a
        // justification. The name column has no justification of its own.
        let fields: Vec<(usize, &str)> = table
            .columns()
            .iter()
            .enumerate()
            .filter(|(i, c)| {
                *i != key_idx
                    && Some(*i) != name_idx
                    && !c.ends_with(JUSTIFICATION_SUFFIX)
                    && c.as_str() != SOURCE_FILE_COLUMN
                    && c.as_str() != ERROR_COLUMN
            })
            .map(|(i, c)| (i, c.as_str()))
            .collect();
        let source_idx = table.column_index(SOURCE_FILE_COLUMN);

        let rows: Vec<AggregatedRow> = groups
            .into_iter()
            .map(|(key, observations)| {
                let name = name_idx.map(|_| {
                    observations
                        .iter()
                        .find_map(|o| o.name.clone())
                        .unwrap_or_default()
                });
                let resolved = fields
                    .iter()
                    .map(|&(idx, field)| {
                        let justification_idx = table.column_index(&justification_column(field));
                        AggregatedField {
                            value: resolve_value(&observations, idx),
                            justification: merge_justifications(
                                &observations,
                                idx,
                                justification_idx,
                                source_idx,
                            ),
                        }
                    })
                    .collect();
                AggregatedRow {
                    key,
                    name,
                    fields: resolved,
                }
            })
            .collect();

        info!("Aggregation produced {} rows", rows.len());
        Ok(AggregatedTable {
            key_field: self.key_field.clone(),
            name_field: name_idx.map(|_| self.name_field.clone()),
            fields: fields.iter().map(|(_, f)| f.to_string()).collect(),
            rows,
        })
    }

    /// Splits multi-entity rows and groups the result by key.
    ///
    /// A row is split only when key and name list the same number of
    /// entries; otherwise it is dropped. Rows without a key are dropped.
    fn group<'a>(
        &self,
        table: &'a RecordTable,
        key_idx: usize,
        name_idx: Option<usize>,
    ) -> BTreeMap<String, Vec<Observation<'a>>> {
        let mut groups: BTreeMap<String, Vec<Observation<'a>>> = BTreeMap::new();

        for (i, cells) in table.rows().iter().enumerate() {
            let key_cell = cells[key_idx].as_deref().unwrap_or_default();
            let pairs: Vec<(String, Option<String>)> = match name_idx {
                Some(name_idx) => {
                    let name_cell = cells[name_idx].as_deref().unwrap_or_default();
                    let keys: Vec<&str> = key_cell.split(',').map(str::trim).collect();
                    let names: Vec<&str> = name_cell.split(',').map(str::trim).collect();
                    if keys.len() != names.len() {
                        debug!(
                            "Dropping row {}: {} keys but {} names ({:?} / {:?})",
                            i + 1,
                            keys.len(),
                            names.len(),
                            key_cell,
                            name_cell
                        );
                        continue;
                    }
                    keys.into_iter()
                        .zip(names)
                        .map(|(k, n)| (k.to_string(), Some(n.to_string()).filter(|n| !n.is_empty())))
                        .collect()
                }
                None => vec![(key_cell.trim().to_string(), None)],
            };

            for (key, name) in pairs {
                if key.is_empty() {
                    debug!("Dropping row {}: no {}", i + 1, self.key_field);
                    continue;
                }
                groups.entry(key).or_default().push(Observation { name, cells });
            }
        }

        groups
    }
}

/// Yes wins; otherwise the first value given, or the default placeholder.
fn resolve_value(observations: &[Observation<'_>], idx: usize) -> String {
    let values: Vec<&str> = observations.iter().filter_map(|o| o.get(idx)).collect();
    match values.first() {
        None => DEFAULT_VALUE.to_string(),
        Some(_) if values.iter().any(|v| is_yes(v)) => "yes".to_string(),
        Some(first) => first.to_string(),
    }
}

/// Merges the justifications of the rows backing the resolved answer.
///
/// Returns an empty string when the group mixes answers other than yes,
/// since then no row can be said to support the result.
fn merge_justifications(
    observations: &[Observation<'_>],
    idx: usize,
    justification_idx: Option<usize>,
    source_idx: Option<usize>,
) -> String {
    let normalized: Vec<String> = observations.iter().map(|o| normalize(o.get(idx))).collect();

    let wanted: &[&str] = if normalized.iter().any(|v| v == "yes") {
        &["yes"]
    } else if normalized.iter().all(|v| NO_LIKE.contains(&v.as_str())) {
        NO_INCLUDED
    } else {
        return String::new();
    };

    let merged: BTreeSet<String> = observations
        .iter()
        .zip(&normalized)
        .filter(|(_, v)| wanted.contains(&v.as_str()))
        .filter_map(|(o, _)| {
            let text = o.get(justification_idx?)?;
            if !is_valid_justification(text) {
                return None;
            }
            let source = source_idx.and_then(|s| o.get(s)).unwrap_or(UNKNOWN_FILE);
            Some(format!("{}: {}", source, text))
        })
        .collect();

    if merged.is_empty() {
        NO_JUSTIFICATION.to_string()
    } else {
        merged.into_iter().collect::<Vec<_>>().join(" | ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(text: &str) -> RecordTable {
        RecordTable::from_csv(text).unwrap()
    }

    const HEADER: &str = "source_file,country,country_justification,country_alpha_3_code,country_alpha_3_code_justification,has_policy,has_policy_justification,error\n";

    #[test]
    fn test_yes_wins() {
        let input = format!(
            "{}a,Austria,,AUT,,no,j1,\nb,Austria,,AUT,,yes,j2,\nc,Austria,,AUT,,no,j3,\n",
            HEADER
        );
        let result = Aggregator::default().aggregate(&table(&input)).unwrap();

        let row = result.row("AUT").unwrap();
        assert_eq!(row.name.as_deref(), Some("Austria"));
        assert_eq!(row.fields[0].value, "yes");
        assert_eq!(row.fields[0].justification, "b: j2");
    }

    #[test]
    fn test_all_no_keeps_first_value_and_filters_empty_justifications() {
        let input = format!(
            "{}a,Austria,,AUT,,no,not found,\nb,Austria,,AUT,,not specified,note,\n",
            HEADER
        );
        let result = Aggregator::default().aggregate(&table(&input)).unwrap();

        let field = &result.row("AUT").unwrap().fields[0];
        assert_eq!(field.value, "no");
        assert_eq!(field.justification, "b: note");
    }

    #[test]
    fn test_multi_country_rows_explode_or_drop() {
        let input = format!(
            "{}a,\"Austria, Germany\",,\"AUT, DEU\",,yes,p. 1,\nb,Austria,,\"AUT, DEU\",,yes,p. 2,\n",
            HEADER
        );
        let result = Aggregator::default().aggregate(&table(&input)).unwrap();

        let keys: Vec<&str> = result.rows().iter().map(|r| r.key.as_str()).collect();
        assert_eq!(keys, vec!["AUT", "DEU"]);
        assert_eq!(result.row("DEU").unwrap().name.as_deref(), Some("Germany"));
        // Row b is dropped, so only a's justification survives.
        assert_eq!(result.row("AUT").unwrap().fields[0].justification, "a: p. 1");
    }

    #[test]
    fn test_mixed_answers_leave_justification_blank() {
        let input = format!(
            "{}a,Austria,,AUT,,partially,j1,\nb,Austria,,AUT,,no,j2,\n",
            HEADER
        );
        let result = Aggregator::default().aggregate(&table(&input)).unwrap();

        let field = &result.row("AUT").unwrap().fields[0];
        assert_eq!(field.value, "partially");
        assert_eq!(field.justification, "");
    }

    #[test]
    fn test_empty_group_values() {
        let input = format!("{}a,Austria,,AUT,,,,timeout\n", HEADER);
        let result = Aggregator::default().aggregate(&table(&input)).unwrap();

        let field = &result.row("AUT").unwrap().fields[0];
        assert_eq!(field.value, DEFAULT_VALUE);
        assert_eq!(field.justification, NO_JUSTIFICATION);
    }

    #[test]
    fn test_justifications_deduplicated_and_sorted() {
        let input = format!(
            "{}b,Austria,,AUT,,YES,p. 4,\na,Austria,,AUT,,yes,p. 9,\nb,Austria,,AUT,,yes,p. 4,\n",
            HEADER
        );
        let result = Aggregator::default().aggregate(&table(&input)).unwrap();
        assert_eq!(
            result.row("AUT").unwrap().fields[0].justification,
            "a: p. 9 | b: p. 4"
        );
    }

    #[test]
    fn test_rows_without_key_are_dropped() {
        let input = format!("{}a,,,,,,,timeout\nb,Austria,,AUT,,no,,\n", HEADER);
        let result = Aggregator::default().aggregate(&table(&input)).unwrap();
        assert_eq!(result.rows().len(), 1);
    }

    #[test]
    fn test_missing_key_column() {
        let err = Aggregator::default()
            .aggregate(&table("source_file,has_policy\na,yes\n"))
            .unwrap_err();
        assert!(matches!(err, AggregateError::MissingKeyColumn(ref c) if c == "country_alpha_3_code"));
    }

    #[test]
    fn test_column_order_and_csv() {
        let input = format!(
            "{}a,Austria,,AUT,,yes,\"p. 1, table 2\",\n",
            HEADER
        );
        let result = Aggregator::default().aggregate(&table(&input)).unwrap();
        assert_eq!(
            result.columns(),
            vec![
                "country",
                "country_alpha_3_code",
                "has_policy",
                "has_policy_justification"
            ]
        );
        assert_eq!(
            result.to_csv(),
            "country,country_alpha_3_code,has_policy,has_policy_justification\nAustria,AUT,yes,\"a: p. 1, table 2\"\n"
        );
    }

    #[test]
    fn test_without_name_column() {
        let result = Aggregator::new("code", "label")
            .aggregate(&table("source_file,code,flag\na,X,yes\nb,X,no\n"))
            .unwrap();
        assert_eq!(result.columns(), vec!["code", "flag", "flag_justification"]);
        assert_eq!(result.row("X").unwrap().name, None);
        assert_eq!(result.row("X").unwrap().fields[0].justification, NO_JUSTIFICATION);
    }
}
