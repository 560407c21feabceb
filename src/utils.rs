use chrono::{Duration, NaiveDate};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;
use tracing::{debug, info};

use crate::errors::IngestError;

/// Every calendar date from `start` to `end`, inclusive and ascending
pub fn dates_between(start: NaiveDate, end: NaiveDate) -> Vec<NaiveDate> {
    if start > end {
        return Vec::new();
    }
    let days = (end - start).num_days();
    (0..=days).map(|offset| start + Duration::days(offset)).collect()
}

/// Parse a date given as `YYYY-MM-DD` or `YYYYMMDD`
pub fn parse_date_arg(value: &str) -> Result<NaiveDate, String> {
    let value = value.trim();
    let parsed = if value.len() == 8 && value.chars().all(|c| c.is_ascii_digit()) {
        NaiveDate::parse_from_str(value, "%Y%m%d")
    } else {
        NaiveDate::parse_from_str(value, "%Y-%m-%d")
    };
    parsed.map_err(|_| format!("expected YYYY-MM-DD or YYYYMMDD, got: {}", value))
}

/// Split a comma separated code list, uppercased and deduplicated in order
pub fn parse_code_list(value: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    value
        .split(',')
        .map(|code| code.trim().to_uppercase())
        .filter(|code| !code.is_empty())
        .filter(|code| seen.insert(code.clone()))
        .collect()
}

#[derive(Debug, Deserialize)]
struct CurrencyRow {
    alphabetic_code: String,
    #[serde(default)]
    name: String,
}

/// Load the entity codes to backfill from the currency metadata export.
///
/// Rows without a name are not tradeable currencies and are skipped.
pub fn load_currency_codes(path: &Path) -> Result<Vec<String>, IngestError> {
    let bytes = std::fs::read(path)?;
    let mut reader = csv::Reader::from_reader(bytes.as_slice());
    let mut seen = HashSet::new();
    let mut codes = Vec::new();

    for row in reader.deserialize::<CurrencyRow>() {
        let row = row.map_err(|e| IngestError::parse(path.display().to_string(), e.to_string()))?;
        let code = row.alphabetic_code.trim().to_uppercase();
        if code.is_empty() || row.name.trim().is_empty() {
            debug!("Skipping currency row {:?}", row);
            continue;
        }
        if seen.insert(code.clone()) {
            codes.push(code);
        }
    }

    info!("📋 Loaded {} currency codes from {}", codes.len(), path.display());
    Ok(codes)
}
