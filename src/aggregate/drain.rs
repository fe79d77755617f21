use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::bucket::StatisticsBucket;
use super::key::AggregationKey;
use super::row::encode_row;
use super::{lock_interruptible, AggregateError, Inner, TableState};
use crate::export::HealthMetrics;

/// Outcome of one drain invocation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Buckets emitted and removed.
    pub buckets: u64,
    /// Sum of their request counts.
    pub requests: u64,
    /// Rows the sink failed to write.
    pub write_errors: u64,
}

/// Spawn the periodic drain. It waits `initial_delay`, then drains on every
/// tick until `token` is cancelled.
pub(crate) fn spawn(inner: Arc<Inner>, token: CancellationToken) -> JoinHandle<()> {
    let initial_delay = inner.settings.initial_delay;
    let period = inner.settings.interval;

    tokio::spawn(async move {
        tokio::select! {
            _ = token.cancelled() => {
                debug!("drain scheduler cancelled before first run");
                return;
            }
            _ = tokio::time::sleep(initial_delay) => {}
        }

        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        info!(?period, "drain scheduler started");

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    debug!("drain scheduler stopped");
                    break;
                }
                _ = ticker.tick() => {
                    match drain_once(&inner, &token).await {
                        Ok(report) if report.buckets > 0 => {
                            debug!(
                                buckets = report.buckets,
                                requests = report.requests,
                                "drained closed buckets",
                            );
                        }
                        Ok(_) => {}
                        Err(e) => warn!(error = %e, "drain abandoned"),
                    }
                }
            }
        }
    })
}

/// Drain every bucket whose second is below the current second minus the
/// allowed lateness.
///
/// Lock acquisition is abandoned if `token` is cancelled first; once the lock
/// is held the invocation runs to completion.
pub(crate) async fn drain_once(
    inner: &Inner,
    token: &CancellationToken,
) -> Result<DrainReport, AggregateError> {
    let Some(mut state) = lock_interruptible(&inner.state, token).await else {
        inner.metrics.drains_abandoned.inc();
        return Err(AggregateError::LockInterrupted);
    };

    let cutoff = inner
        .clock
        .now_second()
        .saturating_sub(inner.settings.allowed_lateness.as_secs());
    let closed = state.table.drain_closed(cutoff);
    let report = emit(&mut state, closed, &inner.metrics);
    if report.buckets > 0 {
        inner.keys.prune();
    }
    Ok(report)
}

/// Drain every remaining bucket, then flush and close the sink.
///
/// After an abort the remaining buckets are discarded unwritten; the sink is
/// still closed.
pub(crate) async fn final_drain(inner: &Inner) -> DrainReport {
    let mut state = inner.state.lock().await;
    let remaining = state.table.drain_all();

    let report = if inner.cancel.is_cancelled() {
        if !remaining.is_empty() {
            warn!(
                buckets = remaining.len(),
                "aggregator aborted, discarding buckets without writing",
            );
        }
        drop(remaining);
        inner.metrics.live_buckets.set(0);
        DrainReport::default()
    } else {
        emit(&mut state, remaining, &inner.metrics)
    };
    inner.keys.prune();

    if let Some(sink) = state.sink.take() {
        let name = sink.name();
        if let Err(e) = sink.close() {
            error!(sink = name, error = %e, "closing aggregated output failed");
        }
    }

    report
}

/// Serialize and write drained buckets. Write failures are logged and
/// counted; the remaining buckets are still written.
fn emit(
    state: &mut TableState,
    buckets: Vec<(AggregationKey, StatisticsBucket)>,
    metrics: &HealthMetrics,
) -> DrainReport {
    let mut report = DrainReport::default();
    let TableState { table, sink, row } = state;

    for (key, bucket) in buckets {
        row.clear();
        encode_row(&key, &bucket, row);

        let written = match sink.as_mut() {
            Some(sink) => sink.write_row(row.as_str()).map_err(|e| {
                error!(sink = sink.name(), key = %key, error = %e, "writing aggregated row failed");
            }),
            None => {
                error!(key = %key, "no aggregated output open, row dropped");
                Err(())
            }
        };
        if written.is_err() {
            report.write_errors += 1;
        }

        report.buckets += 1;
        report.requests += bucket.request_count;
    }

    metrics.buckets_drained.inc_by(report.buckets);
    metrics.requests_aggregated.inc_by(report.requests);
    metrics.sink_write_errors.inc_by(report.write_errors);
    metrics.live_buckets.set(table.len() as i64);

    report
}
