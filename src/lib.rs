//! Real-time aggregation of load-test result records into per-second
//! statistics buckets.

pub mod aggregate;
pub mod clock;
pub mod config;
pub mod export;
pub mod identity;
pub mod record;
pub mod sink;

pub use aggregate::{
    AggregateError, Aggregator, AggregatorSettings, AggregatorStats, DrainReport, FinalReport,
    Ingested,
};
