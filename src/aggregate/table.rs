use std::collections::BTreeMap;

use super::bucket::StatisticsBucket;
use super::key::AggregationKey;
use crate::record::Record;

/// Result of [`AggregationTable::get_or_create`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Entry {
    /// No bucket existed; one was seeded from the record.
    Created,
    /// A bucket already exists; the record still needs to be combined.
    Existing,
    /// The key's second has already been drained; nothing was inserted.
    Late,
}

/// Map from key to live bucket, ordered by second.
///
/// `drained_before` is the drain cursor: every second strictly below it has
/// been emitted, and keys in that range are never created again.
#[derive(Debug, Default)]
pub struct AggregationTable {
    buckets: BTreeMap<AggregationKey, StatisticsBucket>,
    drained_before: u64,
}

impl AggregationTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    pub fn contains(&self, key: &AggregationKey) -> bool {
        self.buckets.contains_key(key)
    }

    pub fn get(&self, key: &AggregationKey) -> Option<&StatisticsBucket> {
        self.buckets.get(key)
    }

    /// First second that has not been drained yet.
    pub fn drained_before(&self) -> u64 {
        self.drained_before
    }

    /// Insert a bucket seeded from `seed` unless `key` already exists.
    ///
    /// Keys older than the drain cursor are rejected so a drained bucket is
    /// never revived.
    pub fn get_or_create(&mut self, key: &AggregationKey, seed: &Record) -> Entry {
        if key.second() < self.drained_before {
            return Entry::Late;
        }
        if self.buckets.contains_key(key) {
            return Entry::Existing;
        }
        self.buckets
            .insert(key.clone(), StatisticsBucket::seeded(seed));
        Entry::Created
    }

    /// Fold `record` into the bucket for `key`. Returns false when the bucket
    /// no longer exists (it was drained in between).
    pub fn combine(&mut self, key: &AggregationKey, record: &Record) -> bool {
        match self.buckets.get_mut(key) {
            Some(bucket) => {
                bucket.combine(record);
                true
            }
            None => false,
        }
    }

    /// Remove and return every bucket whose second is strictly below
    /// `before_second`, in key order. Advances the drain cursor.
    pub fn drain_closed(&mut self, before_second: u64) -> Vec<(AggregationKey, StatisticsBucket)> {
        self.drained_before = self.drained_before.max(before_second);

        match self.first_second() {
            Some(first) if first < before_second => {
                let open = self.buckets.split_off(&AggregationKey::floor(before_second));
                std::mem::replace(&mut self.buckets, open)
                    .into_iter()
                    .collect()
            }
            _ => Vec::new(),
        }
    }

    /// Remove and return every remaining bucket. Used by the final drain;
    /// afterwards no key can be created again.
    pub fn drain_all(&mut self) -> Vec<(AggregationKey, StatisticsBucket)> {
        let all = std::mem::take(&mut self.buckets);
        self.drained_before = u64::MAX;
        all.into_iter().collect()
    }

    /// Remove `key` if it is present.
    pub fn remove_if_present(&mut self, key: &AggregationKey) -> Option<StatisticsBucket> {
        self.buckets.remove(key)
    }

    fn first_second(&self) -> Option<u64> {
        self.buckets.keys().next().map(AggregationKey::second)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(elapsed: u64) -> Record {
        Record {
            timestamp_ms: 0,
            elapsed,
            label: "s".to_string(),
            status: 200,
            success: true,
            bytes: 10,
            ttfb: 1,
            connect: 0,
        }
    }

    fn key(scenario: &str, second: u64) -> AggregationKey {
        AggregationKey::new("r".into(), "m".into(), scenario.into(), second).expect("valid key")
    }

    #[test]
    fn test_get_or_create_inserts_once() {
        let mut table = AggregationTable::new();
        let k = key("a", 100);

        assert_eq!(table.get_or_create(&k, &rec(5)), Entry::Created);
        assert_eq!(table.get_or_create(&k, &rec(9)), Entry::Existing);
        assert_eq!(table.len(), 1);

        let bucket = table.get(&k).expect("bucket exists");
        assert_eq!(bucket.request_count, 1);
        assert_eq!(bucket.elapsed_sum, 5);
    }

    #[test]
    fn test_combine_missing_key() {
        let mut table = AggregationTable::new();
        assert!(!table.combine(&key("a", 1), &rec(1)));
        assert!(table.is_empty());
    }

    #[test]
    fn test_drain_closed_only_takes_past_seconds() {
        let mut table = AggregationTable::new();
        let t = 1_000u64;
        table.get_or_create(&key("a", t), &rec(1));
        table.get_or_create(&key("b", t), &rec(1));
        table.get_or_create(&key("a", t + 5), &rec(1));

        let drained = table.drain_closed(t + 1);
        let seconds: Vec<u64> = drained.iter().map(|(k, _)| k.second()).collect();
        assert_eq!(seconds, vec![t, t]);
        assert_eq!(table.len(), 1);
        assert!(table.contains(&key("a", t + 5)));
        assert_eq!(table.drained_before(), t + 1);
    }

    #[test]
    fn test_drained_key_is_never_revived() {
        let mut table = AggregationTable::new();
        let k = key("a", 50);
        table.get_or_create(&k, &rec(1));
        assert_eq!(table.drain_closed(51).len(), 1);

        assert_eq!(table.get_or_create(&k, &rec(2)), Entry::Late);
        assert!(!table.contains(&k));
        assert!(!table.combine(&k, &rec(2)));
    }

    #[test]
    fn test_drain_closed_cursor_never_moves_back() {
        let mut table = AggregationTable::new();
        table.drain_closed(100);
        table.drain_closed(90);
        assert_eq!(table.drained_before(), 100);
        assert_eq!(table.get_or_create(&key("a", 95), &rec(1)), Entry::Late);
        assert_eq!(table.get_or_create(&key("a", 100), &rec(1)), Entry::Created);
    }

    #[test]
    fn test_drain_all_empties_table_and_closes_it() {
        let mut table = AggregationTable::new();
        table.get_or_create(&key("a", 1), &rec(1));
        table.get_or_create(&key("b", 2_000_000), &rec(1));

        assert_eq!(table.drain_all().len(), 2);
        assert!(table.is_empty());
        assert_eq!(table.get_or_create(&key("c", 3_000_000), &rec(1)), Entry::Late);
    }

    #[test]
    fn test_remove_if_present() {
        let mut table = AggregationTable::new();
        let k = key("a", 1);
        assert!(table.remove_if_present(&k).is_none());
        table.get_or_create(&k, &rec(1));
        assert!(table.remove_if_present(&k).is_some());
        assert!(table.is_empty());
    }
}
