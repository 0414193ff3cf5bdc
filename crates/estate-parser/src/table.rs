use std::collections::HashMap;

use csv::{ReaderBuilder, Trim};

use crate::errors::TableError;

/// One data record keyed by normalized header name.
///
/// `row_number` follows spreadsheet numbering: the header is row 1, so the
/// first data record is row 2. Row-level errors report this number.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawRow {
    pub row_number: usize,
    values: HashMap<String, String>,
}

impl RawRow {
    pub fn new(row_number: usize, values: HashMap<String, String>) -> Self {
        Self { row_number, values }
    }

    /// Builds a row from `(header, value)` pairs, normalizing each header.
    pub fn from_pairs(row_number: usize, pairs: &[(&str, &str)]) -> Self {
        let values = pairs
            .iter()
            .map(|(header, value)| (normalize_header(header), value.trim().to_string()))
            .collect();
        Self { row_number, values }
    }

    /// Returns the first non-blank value among `aliases`, or `""`.
    ///
    /// Aliases are matched against normalized headers, so callers pass them
    /// in normalized form (`bags_sold`, not `Bags Sold`).
    pub fn field(&self, aliases: &[&str]) -> &str {
        aliases
            .iter()
            .filter_map(|alias| self.values.get(*alias))
            .map(|value| value.trim())
            .find(|value| !value.is_empty())
            .unwrap_or("")
    }

    pub fn is_blank(&self) -> bool {
        self.values.values().all(|value| value.trim().is_empty())
    }
}

#[derive(Debug, Clone, Default)]
pub struct Table {
    pub headers: Vec<String>,
    pub rows: Vec<RawRow>,
}

impl Table {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Lower-cases a header and collapses every run of non-alphanumeric
/// characters into a single `_`.
pub fn normalize_header(header: &str) -> String {
    let mut normalized = String::with_capacity(header.len());
    let mut pending_separator = false;

    for ch in header.trim().trim_start_matches('\u{feff}').chars() {
        if ch.is_alphanumeric() {
            if pending_separator && !normalized.is_empty() {
                normalized.push('_');
            }
            pending_separator = false;
            normalized.extend(ch.to_lowercase());
        } else {
            pending_separator = true;
        }
    }

    normalized
}

pub fn parse_table(content: &str) -> Result<Table, TableError> {
    let content = content.trim_start_matches('\u{feff}');
    if content.trim().is_empty() {
        return Err(TableError::MissingHeader);
    }

    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .trim(Trim::All)
        .from_reader(content.as_bytes());

    let headers: Vec<String> = reader.headers()?.iter().map(normalize_header).collect();
    if headers.iter().all(|header| header.is_empty()) {
        return Err(TableError::MissingHeader);
    }

    let mut rows = Vec::new();
    for (index, record) in reader.records().enumerate() {
        let record = record?;
        let mut values = HashMap::with_capacity(headers.len());
        for (header, value) in headers.iter().zip(record.iter()) {
            if header.is_empty() {
                continue;
            }
            // Duplicate columns: keep the first non-blank value.
            let slot = values.entry(header.clone()).or_insert_with(String::new);
            if slot.is_empty() {
                *slot = value.to_string();
            }
        }

        let row = RawRow::new(index + 2, values);
        if !row.is_blank() {
            rows.push(row);
        }
    }

    if rows.is_empty() {
        return Err(TableError::Empty);
    }

    Ok(Table { headers, rows })
}
