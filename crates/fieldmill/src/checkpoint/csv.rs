//! Minimal delimited-text codec for checkpoint logs.
//!
//! Cells containing a comma, quote, CR or LF are quoted with inner quotes
//! doubled. A record ends at an unquoted LF (an optional preceding CR is
//! dropped). Completely empty lines are skipped.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CsvError {
    #[error("unterminated quoted cell in row {row}")]
    UnterminatedQuote { row: usize },
}

/// Quotes a cell when it would otherwise break the row structure.
pub fn escape(cell: &str) -> String {
    if cell.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", cell.replace('"', "\"\""))
    } else {
        cell.to_string()
    }
}

/// Appends one newline-terminated row to `out`.
pub fn write_row<S: AsRef<str>>(out: &mut String, cells: &[S]) {
    for (i, cell) in cells.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        out.push_str(&escape(cell.as_ref()));
    }
    out.push('\n');
}

/// Result of scanning text that may end in a partially written record.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Prefix {
    /// Every newline-terminated record.
    pub rows: Vec<Vec<String>>,
    /// Byte length of the text covering exactly `rows`.
    pub clean_len: usize,
}

struct Scan {
    prefix: Prefix,
    pending: Option<Vec<String>>,
    in_quotes: bool,
}

fn scan(text: &str) -> Scan {
    let mut rows = Vec::new();
    let mut clean_len = 0;
    let mut row: Vec<String> = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;
    let mut has_content = false;

    let mut chars = text.char_indices().peekable();
    while let Some((idx, c)) = chars.next() {
        if in_quotes {
            if c == '"' {
                if matches!(chars.peek(), Some((_, '"'))) {
                    field.push('"');
                    chars.next();
                } else {
                    in_quotes = false;
                }
            } else {
                field.push(c);
            }
            continue;
        }

        match c {
            '"' => {
                in_quotes = true;
                has_content = true;
            }
            ',' => {
                row.push(std::mem::take(&mut field));
                has_content = true;
            }
            '\r' if matches!(chars.peek(), Some((_, '\n'))) => {}
            '\n' => {
                if has_content {
                    row.push(std::mem::take(&mut field));
                    rows.push(std::mem::take(&mut row));
                }
                field.clear();
                has_content = false;
                clean_len = idx + 1;
            }
            other => {
                field.push(other);
                has_content = true;
            }
        }
    }

    let pending = if has_content || in_quotes {
        row.push(field);
        Some(row)
    } else {
        None
    };

    Scan {
        prefix: Prefix { rows, clean_len },
        pending,
        in_quotes,
    }
}

/// Parses the complete records of `text`, ignoring any unterminated tail.
pub fn parse_prefix(text: &str) -> Prefix {
    scan(text).prefix
}

/// Parses a whole document. The last record may omit its trailing newline.
pub fn parse_document(text: &str) -> Result<Vec<Vec<String>>, CsvError> {
    let scan = scan(text);
    let mut rows = scan.prefix.rows;
    if scan.in_quotes {
        return Err(CsvError::UnterminatedQuote {
            row: rows.len() + 1,
        });
    }
    if let Some(row) = scan.pending {
        rows.push(row);
    }
    Ok(rows)
}
