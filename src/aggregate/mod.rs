//! Per-second aggregation of result records.
//!
//! [`Aggregator`] owns the aggregation table behind a single async lock.
//! Ingest parses a line, builds its key and either seeds a new bucket under
//! the lock or spawns a [`combine::CombineTask`] for an existing one. A
//! periodic drain task moves buckets whose second has closed to the sink, and
//! the last run to end triggers a final drain of everything left.

pub mod bucket;
pub(crate) mod combine;
pub(crate) mod drain;
pub mod key;
pub mod row;
pub mod table;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use thiserror::Error;
use tokio::sync::{Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::clock::WallClock;
use crate::config::Config;
use crate::export::HealthMetrics;
use crate::identity::{IdentityCache, IdentityResolver, UNRESOLVED};
use crate::record::{parse_record, ParseError};
use crate::sink::{RowSink, SinkTarget};

use self::combine::CombineTask;
pub use self::drain::DrainReport;
use self::key::{KeyBuilder, KeyError};
use self::table::{AggregationTable, Entry};

/// Errors returned by [`Aggregator::ingest`] and [`Aggregator::drain_once`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AggregateError {
    #[error("malformed record: {0}")]
    MalformedRecord(#[from] ParseError),

    #[error("malformed key: {0}")]
    MalformedKey(#[from] KeyError),

    #[error("interrupted while waiting for the aggregation table lock")]
    LockInterrupted,

    #[error("aggregator has finished its final drain")]
    Closed,
}

/// What ingest did with a well-formed record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ingested {
    /// The record seeded a new bucket.
    Seeded,
    /// A combine task was spawned for an existing bucket.
    Queued,
    /// The record's second was already drained; it was dropped.
    Late,
}

/// Timing and identity settings of one aggregator.
#[derive(Debug, Clone)]
pub struct AggregatorSettings {
    /// Run identifier; `-1` when not configured.
    pub run_id: String,
    /// Delay before the first periodic drain.
    pub initial_delay: Duration,
    /// Period of the drain task.
    pub interval: Duration,
    /// Extra whole seconds a closed second stays in memory before draining.
    pub allowed_lateness: Duration,
    /// Wait between the last run ending and the final drain.
    pub final_grace: Duration,
}

impl Default for AggregatorSettings {
    fn default() -> Self {
        Self {
            run_id: UNRESOLVED.to_string(),
            initial_delay: Duration::from_secs(3),
            interval: Duration::from_secs(1),
            allowed_lateness: Duration::ZERO,
            final_grace: Duration::from_secs(2),
        }
    }
}

impl AggregatorSettings {
    pub fn from_config(cfg: &Config) -> Self {
        let run_id = if cfg.run_id.is_empty() {
            UNRESOLVED.to_string()
        } else {
            cfg.run_id.clone()
        };

        Self {
            run_id,
            initial_delay: cfg.drain.initial_delay,
            interval: cfg.drain.interval,
            allowed_lateness: cfg.drain.allowed_lateness,
            final_grace: cfg.drain.final_grace,
        }
    }
}

/// Point-in-time view of the aggregator counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AggregatorStats {
    pub records_ingested: u64,
    pub records_malformed: u64,
    pub records_late: u64,
    pub combines_abandoned: u64,
    pub drains_abandoned: u64,
    pub buckets_drained: u64,
    pub requests_aggregated: u64,
    pub sink_write_errors: u64,
    pub live_buckets: u64,
    pub active_runs: u64,
}

/// Summary returned when the last run ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FinalReport {
    /// Rows written by the final drain alone.
    pub drain: DrainReport,
    pub stats: AggregatorStats,
}

/// State guarded by the aggregation lock. The sink is only written while the
/// lock is held.
pub(crate) struct TableState {
    pub(crate) table: AggregationTable,
    pub(crate) sink: Option<RowSink>,
    /// Reused row encoding buffer.
    pub(crate) row: String,
}

pub(crate) struct Inner {
    pub(crate) settings: AggregatorSettings,
    pub(crate) state: Mutex<TableState>,
    pub(crate) metrics: Arc<HealthMetrics>,
    pub(crate) clock: Arc<dyn WallClock>,
    /// Hard abort: interrupts every pending lock acquisition.
    pub(crate) cancel: CancellationToken,
    /// Stops the periodic drain. Child of `cancel`.
    scheduler: CancellationToken,
    keys: KeyBuilder,
    identity: IdentityCache,
    target: SinkTarget,
    combines: TaskTracker,
    drain_task: Mutex<Option<JoinHandle<()>>>,
    scheduled: AtomicBool,
    closed: AtomicBool,
    active_runs: parking_lot::Mutex<u64>,
}

/// Acquire `mutex` unless `cancel` fires first.
pub(crate) async fn lock_interruptible<'a, T>(
    mutex: &'a Mutex<T>,
    cancel: &CancellationToken,
) -> Option<MutexGuard<'a, T>> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => None,
        guard = mutex.lock() => Some(guard),
    }
}

/// Real-time aggregation engine. Cheap to clone; clones share one table.
#[derive(Clone)]
pub struct Aggregator {
    inner: Arc<Inner>,
}

impl Aggregator {
    pub fn new(
        settings: AggregatorSettings,
        target: SinkTarget,
        resolver: Arc<dyn IdentityResolver>,
        clock: Arc<dyn WallClock>,
        metrics: Arc<HealthMetrics>,
    ) -> Result<Self, AggregateError> {
        let keys = KeyBuilder::new(&settings.run_id)?;
        let cancel = CancellationToken::new();
        let scheduler = cancel.child_token();

        Ok(Self {
            inner: Arc::new(Inner {
                settings,
                state: Mutex::new(TableState {
                    table: AggregationTable::new(),
                    sink: None,
                    row: String::with_capacity(256),
                }),
                metrics,
                clock,
                cancel,
                scheduler,
                keys,
                identity: IdentityCache::new(resolver),
                target,
                combines: TaskTracker::new(),
                drain_task: Mutex::new(None),
                scheduled: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                active_runs: parking_lot::Mutex::new(0),
            }),
        })
    }

    pub fn run_id(&self) -> &str {
        self.inner.keys.run_id()
    }

    pub fn metrics(&self) -> &Arc<HealthMetrics> {
        &self.inner.metrics
    }

    /// Ingest one raw result line.
    ///
    /// Malformed lines are counted and rejected without touching the table.
    /// Only waits for the table lock, never for aggregation itself.
    pub async fn ingest(&self, line: &str) -> Result<Ingested, AggregateError> {
        let inner = &self.inner;
        inner.metrics.records_ingested.inc();

        if inner.closed.load(Ordering::Acquire) {
            return Err(AggregateError::Closed);
        }

        let record = parse_record(line).map_err(|e| {
            inner.metrics.records_malformed.inc();
            debug!(error = %e, "discarding malformed record");
            e
        })?;

        let machine_id = self.machine_id().await;
        let key = inner
            .keys
            .build(&machine_id, &record.label, record.timestamp_ms)
            .map_err(|e| {
                inner.metrics.records_malformed.inc();
                debug!(error = %e, "discarding record with unusable key");
                e
            })?;

        let Some(mut state) = lock_interruptible(&inner.state, &inner.cancel).await else {
            inner.metrics.combines_abandoned.inc();
            return Err(AggregateError::LockInterrupted);
        };

        match state.table.get_or_create(&key, &record) {
            Entry::Created => {
                inner.metrics.live_buckets.set(state.table.len() as i64);
                Ok(Ingested::Seeded)
            }
            Entry::Late => {
                inner.metrics.records_late.inc();
                debug!(key = %key, "sample arrived after its second was drained");
                Ok(Ingested::Late)
            }
            Entry::Existing => {
                drop(state);
                let task = CombineTask::new(key, record);
                inner.combines.spawn(task.run(Arc::clone(inner)));
                Ok(Ingested::Queued)
            }
        }
    }

    /// Resolve the machine id, retrying the resolver off the async workers
    /// while it is still unresolved.
    async fn machine_id(&self) -> Arc<str> {
        if let Some(id) = self.inner.identity.current() {
            return id;
        }

        let inner = Arc::clone(&self.inner);
        match tokio::task::spawn_blocking(move || inner.identity.resolve()).await {
            Ok(id) => id,
            Err(e) => {
                warn!(error = %e, "machine id resolution task failed");
                Arc::from(UNRESOLVED)
            }
        }
    }

    /// Signal that a run started on `host`.
    ///
    /// The first call opens the sink and schedules the periodic drain; later
    /// calls only count the run.
    pub async fn on_run_started(&self, host: &str) -> Result<()> {
        let inner = &self.inner;
        if inner.closed.load(Ordering::Acquire) {
            bail!("aggregator already finished, cannot start run on {host}");
        }

        if !inner.scheduled.swap(true, Ordering::SeqCst) {
            let sink = match inner.target.open() {
                Ok(sink) => sink,
                Err(e) => {
                    inner.scheduled.store(false, Ordering::SeqCst);
                    return Err(e.context("opening aggregated output"));
                }
            };
            let sink_name = sink.name();
            inner.state.lock().await.sink = Some(sink);

            let handle = drain::spawn(Arc::clone(inner), inner.scheduler.clone());
            *inner.drain_task.lock().await = Some(handle);

            info!(
                sink = sink_name,
                initial_delay = ?inner.settings.initial_delay,
                interval = ?inner.settings.interval,
                "drain scheduled",
            );
        }

        let active = {
            let mut runs = inner.active_runs.lock();
            *runs += 1;
            *runs
        };
        inner.metrics.active_runs.set(active as i64);
        info!(host, active_runs = active, run_id = self.run_id(), "run started");

        Ok(())
    }

    /// Signal that a run ended on `host`.
    ///
    /// When no run remains active this waits the grace period, waits for
    /// in-flight combines, drains everything, closes the sink and stops the
    /// drain task. Returns the final report in that case.
    pub async fn on_run_ended(&self, host: &str) -> Result<Option<FinalReport>> {
        let remaining = {
            let mut runs = self.inner.active_runs.lock();
            if *runs == 0 {
                warn!(host, "run ended without a matching start");
                return Ok(None);
            }
            *runs -= 1;
            *runs
        };
        self.inner.metrics.active_runs.set(remaining as i64);
        info!(host, active_runs = remaining, "run ended");

        if remaining > 0 {
            return Ok(None);
        }

        Ok(Some(self.finish().await))
    }

    async fn finish(&self) -> FinalReport {
        let inner = &self.inner;

        tokio::time::sleep(inner.settings.final_grace).await;
        inner.closed.store(true, Ordering::Release);

        inner.combines.close();
        inner.combines.wait().await;

        let report = drain::final_drain(inner).await;

        inner.scheduler.cancel();
        if let Some(handle) = inner.drain_task.lock().await.take() {
            if let Err(e) = handle.await {
                warn!(error = %e, "drain task did not shut down cleanly");
            }
        }

        let stats = self.stats();
        info!(
            buckets = report.buckets,
            requests = report.requests,
            records_ingested = stats.records_ingested,
            requests_aggregated = stats.requests_aggregated,
            records_malformed = stats.records_malformed,
            records_late = stats.records_late,
            "final drain complete",
        );
        if stats.records_late > 0 || stats.combines_abandoned > 0 {
            warn!(
                records_late = stats.records_late,
                combines_abandoned = stats.combines_abandoned,
                "samples were lost after their second was drained",
            );
        }

        FinalReport {
            drain: report,
            stats,
        }
    }

    /// Run one drain invocation now, independent of the schedule.
    pub async fn drain_once(&self) -> Result<DrainReport, AggregateError> {
        drain::drain_once(&self.inner, &self.inner.scheduler).await
    }

    /// Wait until every combine spawned so far has finished.
    pub async fn quiesce(&self) {
        let tracker = &self.inner.combines;
        tracker.close();
        tracker.wait().await;
        if !self.inner.closed.load(Ordering::Acquire) {
            tracker.reopen();
        }
    }

    /// Hard abort: interrupts pending lock waits and stops the drain task.
    /// Buckets still in the table are discarded by the final drain instead
    /// of being written; the sink is still closed.
    pub fn abort(&self) {
        self.inner.cancel.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Number of buckets currently in memory.
    pub async fn live_buckets(&self) -> usize {
        self.inner.state.lock().await.table.len()
    }

    pub fn stats(&self) -> AggregatorStats {
        let m = &self.inner.metrics;
        AggregatorStats {
            records_ingested: m.records_ingested.get(),
            records_malformed: m.records_malformed.get(),
            records_late: m.records_late.get(),
            combines_abandoned: m.combines_abandoned.get(),
            drains_abandoned: m.drains_abandoned.get(),
            buckets_drained: m.buckets_drained.get(),
            requests_aggregated: m.requests_aggregated.get(),
            sink_write_errors: m.sink_write_errors.get(),
            live_buckets: m.live_buckets.get().max(0) as u64,
            active_runs: *self.inner.active_runs.lock(),
        }
    }
}
