//! Decimal normalization
//!
//! Turns the textual value of an observation into an exact decimal plus the
//! precision (digits as written) and scale (fractional digits) the sink
//! stores next to it. Parsing is locale independent: `.` is the only separator.

use chrono::NaiveDate;
use rust_decimal::Decimal;

use crate::errors::IngestError;
use crate::models::{NormalizedRate, RawObservation};

/// Parsed decimal with its digit counts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParsedDecimal {
    pub value: Decimal,
    pub precision: u32,
    pub scale: u32,
}

/// Parse `text` into (value, precision, scale).
///
/// Precision and scale count the digits as written, sign excluded: `"00.5"`
/// is precision 3, `".5"` precision 1, `"5."` scale 0. The value itself is
/// canonical, so rebuilding text from (value, scale) drops redundant leading
/// zeros; the round trip is exact for canonical text only.
pub fn parse_decimal(text: &str) -> Result<ParsedDecimal, IngestError> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(IngestError::malformed(text, "empty"));
    }

    let (negative, unsigned) = match trimmed.as_bytes()[0] {
        b'-' => (true, &trimmed[1..]),
        b'+' => (false, &trimmed[1..]),
        _ => (false, trimmed),
    };

    let (int_part, frac_part) = unsigned.split_once('.').unwrap_or((unsigned, ""));
    if int_part.is_empty() && frac_part.is_empty() {
        return Err(IngestError::malformed(text, "no digits"));
    }
    if !int_part.bytes().all(|b| b.is_ascii_digit()) || !frac_part.bytes().all(|b| b.is_ascii_digit()) {
        return Err(IngestError::malformed(text, "unexpected character"));
    }

    let scale = frac_part.len() as u32;
    let precision = (int_part.len() + frac_part.len()) as u32;

    let canonical_int = match int_part.trim_start_matches('0') {
        "" => "0",
        stripped => stripped,
    };
    let mut canonical = String::with_capacity(canonical_int.len() + frac_part.len() + 2);
    if negative {
        canonical.push('-');
    }
    canonical.push_str(canonical_int);
    if !frac_part.is_empty() {
        canonical.push('.');
        canonical.push_str(frac_part);
    }

    let value = Decimal::from_str_exact(&canonical)
        .map_err(|_| IngestError::malformed(text, "out of decimal range"))?;

    Ok(ParsedDecimal {
        value,
        precision,
        scale,
    })
}

/// Normalize one raw observation into a rate ready for delivery.
pub fn normalize(raw: &RawObservation) -> Result<NormalizedRate, IngestError> {
    let parsed = parse_decimal(&raw.value)?;
    let date = NaiveDate::parse_from_str(raw.date.trim(), "%Y-%m-%d").map_err(|_| IngestError::MalformedDate {
        text: raw.date.clone(),
    })?;

    Ok(NormalizedRate {
        base: raw.base.trim().to_string(),
        target: raw.target.trim().to_string(),
        date,
        source: raw.source.to_string(),
        value: parsed.value,
        precision: parsed.precision,
        scale: parsed.scale,
    })
}
