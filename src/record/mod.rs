pub mod parse;

pub use parse::{parse_record, ParseError};

/// Response code recorded when the raw writer emitted a non-numeric code,
/// typically an exception class name for a transport failure.
pub const TRANSPORT_FAILURE_STATUS: u64 = 504;

/// One ingested per-request sample.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// Epoch milliseconds at which the request started.
    pub timestamp_ms: u64,
    /// Total request time in milliseconds.
    pub elapsed: u64,
    /// Scenario label (sampler or transaction name).
    pub label: String,
    pub status: u64,
    pub success: bool,
    /// Response size in bytes.
    pub bytes: u64,
    /// Time to first byte in milliseconds.
    pub ttfb: u64,
    /// Connect time in milliseconds.
    pub connect: u64,
}

impl Record {
    /// Whole-second epoch timestamp this sample belongs to.
    pub fn second(&self) -> u64 {
        self.timestamp_ms / 1000
    }

    /// 0 for a successful sample, 1 for a failed one.
    pub fn error_count(&self) -> u64 {
        u64::from(!self.success)
    }
}
