//! Total, side-effect free normalizers for individual cell values.
//!
//! Every function here returns a sentinel (`None`, or a defaulted variant)
//! instead of failing, so row validators can report precise per-row errors.

use std::fmt;

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};

const PRIMARY_DATE_FORMATS: [&str; 3] = ["%Y-%m-%d", "%d/%m/%Y", "%Y/%m/%d"];

const FALLBACK_DATE_FORMATS: [&str; 8] = [
    "%d-%m-%Y",
    "%d.%m.%Y",
    "%d %b %Y",
    "%d %B %Y",
    "%b %d, %Y",
    "%B %d, %Y",
    "%b %d %Y",
    "%B %d %Y",
];

const FALLBACK_DATETIME_FORMATS: [&str; 4] = [
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%d/%m/%Y %H:%M",
];

pub fn parse_date(value: &str) -> Option<NaiveDate> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }

    for format in PRIMARY_DATE_FORMATS.iter().chain(FALLBACK_DATE_FORMATS.iter()) {
        if let Ok(date) = NaiveDate::parse_from_str(value, format) {
            return Some(date);
        }
    }

    if let Ok(timestamp) = DateTime::parse_from_rfc3339(value) {
        return Some(timestamp.date_naive());
    }

    FALLBACK_DATETIME_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(value, format).ok())
        .map(|timestamp| timestamp.date())
}

/// Canonical `YYYY-MM-DD` rendering.
pub fn format_date(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

pub fn parse_number(value: &str) -> Option<f64> {
    let cleaned: String = value
        .trim()
        .chars()
        .filter(|ch| *ch != ',' && !ch.is_whitespace())
        .collect();
    if cleaned.is_empty() {
        return None;
    }
    cleaned.parse::<f64>().ok().filter(|number| number.is_finite())
}

pub fn number_or(value: &str, fallback: f64) -> f64 {
    parse_number(value).unwrap_or(fallback)
}

pub fn normalize_coffee_type(value: &str) -> Option<String> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }

    let lowered = value.to_lowercase();
    if lowered.contains("arabica") {
        return Some("Arabica".to_string());
    }
    if lowered.contains("robusta") {
        return Some("Robusta".to_string());
    }

    let mut chars = value.chars();
    chars
        .next()
        .map(|first| first.to_uppercase().chain(chars).collect())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BagType {
    #[serde(rename = "Dry Parchment")]
    DryParchment,
    #[serde(rename = "Dry Cherry")]
    DryCherry,
}

impl BagType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BagType::DryParchment => "Dry Parchment",
            BagType::DryCherry => "Dry Cherry",
        }
    }
}

impl fmt::Display for BagType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn normalize_bag_type(value: &str) -> BagType {
    if value.to_lowercase().contains("cherry") {
        BagType::DryCherry
    } else {
        BagType::DryParchment
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionKind {
    Restock,
    Deplete,
}

impl TransactionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionKind::Restock => "restock",
            TransactionKind::Deplete => "deplete",
        }
    }
}

impl fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn normalize_transaction_type(value: &str) -> TransactionKind {
    if value.to_lowercase().contains("restock") {
        TransactionKind::Restock
    } else {
        TransactionKind::Deplete
    }
}
