use std::sync::Arc;

use tracing::{debug, warn};

use super::key::AggregationKey;
use super::{lock_interruptible, Inner};
use crate::record::Record;

/// Folds one record into an already existing bucket.
///
/// Spawned by ingest once the key is known to exist. The bucket may have been
/// drained by the time the lock is acquired; the sample is then counted late.
pub(crate) struct CombineTask {
    key: AggregationKey,
    record: Record,
}

impl CombineTask {
    pub(crate) fn new(key: AggregationKey, record: Record) -> Self {
        Self { key, record }
    }

    pub(crate) async fn run(self, inner: Arc<Inner>) {
        let Some(mut state) = lock_interruptible(&inner.state, &inner.cancel).await else {
            inner.metrics.combines_abandoned.inc();
            warn!(key = %self.key, "combine abandoned: aggregator cancelled");
            return;
        };

        if !state.table.combine(&self.key, &self.record) {
            inner.metrics.records_late.inc();
            debug!(key = %self.key, "combine target already drained");
        }
    }
}
