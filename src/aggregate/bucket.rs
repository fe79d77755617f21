use std::collections::BTreeMap;

use crate::record::Record;

/// Per-key accumulator for one (run, machine, scenario, second) cell.
///
/// Buckets are plain owned values; every mutation happens under the
/// aggregation table lock. Combining is order-independent: all fields are
/// sums, maxima or per-value counts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatisticsBucket {
    pub elapsed_sum: u64,
    pub elapsed_max: u64,
    /// Exact elapsed value -> occurrence count, ascending by value.
    pub histogram: BTreeMap<u64, u64>,
    pub errors: u64,
    pub status_1xx: u64,
    pub status_2xx: u64,
    pub status_3xx: u64,
    pub status_4xx: u64,
    pub status_5xx: u64,
    pub response_len_sum: u64,
    /// Failed samples that still carried a non-error (< 400) status.
    pub response_errors: u64,
    pub connect_sum: u64,
    pub connect_max: u64,
    pub ttfb_sum: u64,
    pub ttfb_max: u64,
    /// Successful samples that opened a connection (non-zero connect time).
    pub new_connections: u64,
    pub request_count: u64,
}

impl StatisticsBucket {
    /// Creates a bucket seeded from the first sample of its key.
    pub fn seeded(record: &Record) -> Self {
        let err = record.error_count();
        let ok = err == 0;
        let status = StatusClass::of(record.status);

        Self {
            elapsed_sum: record.elapsed,
            elapsed_max: record.elapsed,
            histogram: BTreeMap::from([(record.elapsed, 1)]),
            errors: err,
            status_1xx: class_count(status, StatusClass::Informational),
            status_2xx: class_count(status, StatusClass::Success),
            status_3xx: class_count(status, StatusClass::Redirect),
            status_4xx: class_count(status, StatusClass::ClientError),
            status_5xx: class_count(status, StatusClass::ServerError),
            response_len_sum: if ok { record.bytes } else { 0 },
            response_errors: u64::from(!ok && record.status < 400),
            connect_sum: if ok { record.connect } else { 0 },
            connect_max: if ok { record.connect } else { 0 },
            ttfb_sum: if ok { record.ttfb } else { 0 },
            ttfb_max: if ok { record.ttfb } else { 0 },
            new_connections: u64::from(ok && record.connect > 0),
            request_count: 1,
        }
    }

    /// Folds one sample into the bucket.
    ///
    /// Sums saturate at `u64::MAX` rather than overflow.
    pub fn combine(&mut self, record: &Record) {
        let err = record.error_count();
        self.errors = self.errors.saturating_add(err);
        self.request_count = self.request_count.saturating_add(1);

        match StatusClass::of(record.status) {
            Some(StatusClass::Informational) => self.status_1xx += 1,
            Some(StatusClass::Success) => self.status_2xx += 1,
            Some(StatusClass::Redirect) => self.status_3xx += 1,
            Some(StatusClass::ClientError) => self.status_4xx += 1,
            Some(StatusClass::ServerError) => self.status_5xx += 1,
            None => {}
        }

        self.elapsed_sum = self.elapsed_sum.saturating_add(record.elapsed);
        self.elapsed_max = self.elapsed_max.max(record.elapsed);
        let count = self.histogram.entry(record.elapsed).or_insert(0);
        *count = count.saturating_add(1);

        if err == 0 {
            self.response_len_sum = self.response_len_sum.saturating_add(record.bytes);
            self.connect_sum = self.connect_sum.saturating_add(record.connect);
            self.connect_max = self.connect_max.max(record.connect);
            self.ttfb_sum = self.ttfb_sum.saturating_add(record.ttfb);
            self.ttfb_max = self.ttfb_max.max(record.ttfb);
            if record.connect > 0 {
                self.new_connections += 1;
            }
        } else if record.status < 400 {
            self.response_errors += 1;
        }
    }

    /// Sum of all histogram counts. Always equal to `request_count`.
    pub fn histogram_total(&self) -> u64 {
        self.histogram
            .values()
            .fold(0u64, |acc, c| acc.saturating_add(*c))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StatusClass {
    Informational,
    Success,
    Redirect,
    ClientError,
    ServerError,
}

impl StatusClass {
    /// Codes of 600 and above are unclassified.
    fn of(status: u64) -> Option<Self> {
        match status {
            0..=199 => Some(Self::Informational),
            200..=299 => Some(Self::Success),
            300..=399 => Some(Self::Redirect),
            400..=499 => Some(Self::ClientError),
            500..=599 => Some(Self::ServerError),
            _ => None,
        }
    }
}

fn class_count(status: Option<StatusClass>, class: StatusClass) -> u64 {
    u64::from(status == Some(class))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(elapsed: u64, status: u64, success: bool, bytes: u64, ttfb: u64, connect: u64) -> Record {
        Record {
            timestamp_ms: 1_700_000_000_000,
            elapsed,
            label: "checkout".to_string(),
            status,
            success,
            bytes,
            ttfb,
            connect,
        }
    }

    #[test]
    fn test_seed_then_combine_success_and_failure() {
        let mut bucket = StatisticsBucket::seeded(&rec(10, 200, true, 100, 5, 2));
        bucket.combine(&rec(20, 500, false, 0, 0, 0));

        assert_eq!(bucket.elapsed_sum, 30);
        assert_eq!(bucket.elapsed_max, 20);
        assert_eq!(bucket.errors, 1);
        assert_eq!(bucket.status_2xx, 1);
        assert_eq!(bucket.status_5xx, 1);
        assert_eq!(bucket.request_count, 2);
        assert_eq!(bucket.response_len_sum, 100);
        assert_eq!(bucket.connect_sum, 2);
        assert_eq!(bucket.connect_max, 2);
        assert_eq!(bucket.ttfb_sum, 5);
        assert_eq!(bucket.ttfb_max, 5);
        assert_eq!(bucket.new_connections, 1);
        assert_eq!(bucket.response_errors, 0);
        assert_eq!(bucket.histogram.get(&10), Some(&1));
        assert_eq!(bucket.histogram.get(&20), Some(&1));
    }

    #[test]
    fn test_failed_sample_skips_response_fields() {
        let bucket = StatisticsBucket::seeded(&rec(7, 200, false, 4096, 3, 9));
        assert_eq!(bucket.errors, 1);
        assert_eq!(bucket.response_len_sum, 0);
        assert_eq!(bucket.connect_sum, 0);
        assert_eq!(bucket.ttfb_max, 0);
        assert_eq!(bucket.new_connections, 0);
        assert_eq!(bucket.response_errors, 1);
    }

    #[test]
    fn test_status_classes() {
        let mut bucket = StatisticsBucket::default();
        for status in [100, 199, 200, 304, 404, 503, 600, 999] {
            bucket.combine(&rec(1, status, true, 0, 0, 0));
        }
        assert_eq!(bucket.status_1xx, 2);
        assert_eq!(bucket.status_2xx, 1);
        assert_eq!(bucket.status_3xx, 1);
        assert_eq!(bucket.status_4xx, 1);
        assert_eq!(bucket.status_5xx, 1);
        assert_eq!(bucket.request_count, 8);
    }

    #[test]
    fn test_request_count_matches_histogram_total() {
        let mut bucket = StatisticsBucket::seeded(&rec(5, 200, true, 1, 1, 0));
        for i in 0..200u64 {
            bucket.combine(&rec(i % 13, 200 + (i % 4) * 100, i % 3 != 0, i, i % 5, i % 2));
            assert_eq!(bucket.request_count, bucket.histogram_total());
        }
        assert_eq!(bucket.histogram.get(&5).copied(), Some(1 + 15));
    }

    #[test]
    fn test_combine_is_order_independent() {
        let samples = [
            rec(10, 200, true, 100, 5, 2),
            rec(20, 500, false, 0, 0, 0),
            rec(10, 404, true, 30, 1, 0),
            rec(35, 302, false, 10, 2, 1),
            rec(3, 200, true, 8, 8, 8),
        ];
        let orders: [[usize; 5]; 6] = [
            [0, 1, 2, 3, 4],
            [4, 3, 2, 1, 0],
            [2, 0, 4, 1, 3],
            [1, 4, 0, 3, 2],
            [3, 2, 1, 4, 0],
            [0, 2, 4, 3, 1],
        ];

        let build = |order: &[usize; 5]| {
            let mut bucket = StatisticsBucket::seeded(&samples[order[0]]);
            for &i in &order[1..] {
                bucket.combine(&samples[i]);
            }
            bucket
        };

        let expected = build(&orders[0]);
        for order in &orders[1..] {
            assert_eq!(build(order), expected, "order {order:?} diverged");
        }
    }

    #[test]
    fn test_seeded_matches_combine_into_empty_bucket() {
        let samples = [
            rec(10, 200, true, 100, 5, 2),
            rec(20, 500, false, 0, 0, 0),
            rec(7, 200, false, 4096, 3, 9),
            rec(3, 101, true, 0, 1, 0),
            rec(9, 700, true, 1, 1, 1),
        ];
        for sample in &samples {
            let mut combined = StatisticsBucket::default();
            combined.combine(sample);
            assert_eq!(StatisticsBucket::seeded(sample), combined, "{sample:?}");
        }
    }

    #[test]
    fn test_huge_values_saturate_without_breaking_invariants() {
        let huge = u64::MAX / 2 + 1;
        let mut bucket = StatisticsBucket::seeded(&rec(huge, 200, true, huge, huge, huge));
        bucket.combine(&rec(huge, 200, true, huge, huge, huge));

        assert_eq!(bucket.elapsed_sum, u64::MAX);
        assert_eq!(bucket.elapsed_max, huge);
        assert_eq!(bucket.response_len_sum, u64::MAX);
        assert_eq!(bucket.connect_sum, u64::MAX);
        assert_eq!(bucket.ttfb_sum, u64::MAX);
        assert_eq!(bucket.request_count, 2);
        assert_eq!(bucket.histogram_total(), bucket.request_count);
        assert_eq!(bucket.histogram.get(&huge), Some(&2));
    }

    #[test]
    fn test_max_bounds_every_sample() {
        let elapsed = [4u64, 99, 17, 0, 98];
        let mut bucket = StatisticsBucket::seeded(&rec(elapsed[0], 200, true, 0, 0, 0));
        for &e in &elapsed[1..] {
            bucket.combine(&rec(e, 200, true, 0, 0, 0));
        }
        assert!(elapsed.iter().all(|&e| bucket.elapsed_max >= e));
        assert_eq!(bucket.elapsed_max, 99);
    }
}
