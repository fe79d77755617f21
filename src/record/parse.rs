//! Decoding of raw result lines.
//!
//! The raw result writer emits one line per request with a fixed column
//! order. Lines are split exactly once; numeric columns are decoded in place
//! and only the scenario label is copied out.

use thiserror::Error;

use super::{Record, TRANSPORT_FAILURE_STATUS};

/// Number of comma-separated columns in a raw result line.
pub const FIELD_COUNT: usize = 8;

const FIELD_NAMES: [&str; FIELD_COUNT] = [
    "timestamp",
    "elapsed",
    "label",
    "status",
    "success",
    "bytes",
    "ttfb",
    "connect",
];

/// Errors that can occur while decoding a raw result line.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("expected 8 fields, found {found}")]
    FieldCount { found: usize },

    #[error("field {field}: invalid number {value:?}")]
    InvalidNumber { field: &'static str, value: String },
}

/// Parse one raw result line into a [`Record`].
///
/// Column order: `timestamp,elapsed,label,status,success,bytes,ttfb,connect`.
/// Surrounding whitespace of every column (and a trailing `\r`) is ignored.
pub fn parse_record(line: &str) -> Result<Record, ParseError> {
    let mut fields = [""; FIELD_COUNT];
    let mut found = 0usize;

    for part in line.trim_end_matches(['\r', '\n']).split(',') {
        if found < FIELD_COUNT {
            fields[found] = part.trim();
        }
        found += 1;
    }

    if found != FIELD_COUNT {
        return Err(ParseError::FieldCount { found });
    }

    Ok(Record {
        timestamp_ms: number(&fields, 0)?,
        elapsed: number(&fields, 1)?,
        label: fields[2].to_string(),
        status: fields[3].parse().unwrap_or(TRANSPORT_FAILURE_STATUS),
        success: fields[4].eq_ignore_ascii_case("true"),
        bytes: number(&fields, 5)?,
        ttfb: number(&fields, 6)?,
        connect: number(&fields, 7)?,
    })
}

/// Largest value a numeric column may carry; the raw writer emits signed
/// 64-bit values.
pub const MAX_FIELD_VALUE: u64 = i64::MAX as u64;

#[inline]
fn number(fields: &[&str; FIELD_COUNT], idx: usize) -> Result<u64, ParseError> {
    fields[idx]
        .parse::<u64>()
        .ok()
        .filter(|v| *v <= MAX_FIELD_VALUE)
        .ok_or_else(|| ParseError::InvalidNumber {
            field: FIELD_NAMES[idx],
            value: fields[idx].to_string(),
        })
}
