//! Output row encoding.
//!
//! Base columns:
//! `run,machine,scenario,second,sum,max,histogram,errors,requests`.
//! When the bucket saw any successful response bytes, the HTTP columns follow:
//! `1xx,2xx,3xx,4xx,5xx,respLen,respErrors,resolveSum,resolveMax,
//! connectSum,connectMax,ttfbSum,ttfbMax,newConnections`.

use std::fmt::Write;

use super::bucket::StatisticsBucket;
use super::key::{AggregationKey, KEY_DELIMITER, ROW_DELIMITER};

/// Column count of a row without the HTTP group.
pub const BASE_COLUMNS: usize = 9;

/// Column count of a row with the HTTP group.
pub const EXTENDED_COLUMNS: usize = BASE_COLUMNS + 14;

/// Append the row for `bucket` to `out`, without a line terminator.
pub fn encode_row(key: &AggregationKey, bucket: &StatisticsBucket, out: &mut String) {
    // Writing into a String cannot fail.
    let _ = write!(
        out,
        "{run}{d}{machine}{d}{scenario}{d}{second}{d}{sum}{d}{max}{d}",
        run = key.run_id(),
        machine = key.machine_id(),
        scenario = key.scenario(),
        second = key.second(),
        sum = bucket.elapsed_sum,
        max = bucket.elapsed_max,
        d = ROW_DELIMITER,
    );

    encode_histogram(bucket, out);

    let _ = write!(
        out,
        "{d}{errors}{d}{requests}",
        errors = bucket.errors,
        requests = bucket.request_count,
        d = ROW_DELIMITER,
    );

    if bucket.response_len_sum > 0 {
        // Records carry no DNS timing, so the resolve-host pair is always zero.
        let _ = write!(
            out,
            "{d}{}{d}{}{d}{}{d}{}{d}{}{d}{}{d}{}{d}0{d}0{d}{}{d}{}{d}{}{d}{}{d}{}",
            bucket.status_1xx,
            bucket.status_2xx,
            bucket.status_3xx,
            bucket.status_4xx,
            bucket.status_5xx,
            bucket.response_len_sum,
            bucket.response_errors,
            bucket.connect_sum,
            bucket.connect_max,
            bucket.ttfb_sum,
            bucket.ttfb_max,
            bucket.new_connections,
            d = ROW_DELIMITER,
        );
    }
}

/// `value:count` pairs joined by `|`, ascending by value.
fn encode_histogram(bucket: &StatisticsBucket, out: &mut String) {
    for (i, (value, count)) in bucket.histogram.iter().enumerate() {
        if i > 0 {
            out.push(KEY_DELIMITER);
        }
        let _ = write!(out, "{value}:{count}");
    }
}

/// Convenience wrapper returning a freshly allocated row.
pub fn row_string(key: &AggregationKey, bucket: &StatisticsBucket) -> String {
    let mut out = String::with_capacity(128);
    encode_row(key, bucket, &mut out);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Record;

    fn rec(elapsed: u64, status: u64, success: bool, bytes: u64) -> Record {
        Record {
            timestamp_ms: 12_345,
            elapsed,
            label: "s".to_string(),
            status,
            success,
            bytes,
            ttfb: 4,
            connect: 1,
        }
    }

    fn key() -> AggregationKey {
        AggregationKey::new("r1".into(), "m1".into(), "login".into(), 12).expect("valid key")
    }

    #[test]
    fn test_row_without_http_group() {
        let mut bucket = StatisticsBucket::seeded(&rec(30, 200, true, 0));
        bucket.combine(&rec(10, 200, true, 0));
        bucket.combine(&rec(30, 500, false, 0));

        let row = row_string(&key(), &bucket);
        assert_eq!(row, "r1,m1,login,12,70,30,10:1|30:2,1,3");
        assert_eq!(row.split(',').count(), BASE_COLUMNS);
    }

    #[test]
    fn test_row_with_http_group() {
        let mut bucket = StatisticsBucket::seeded(&rec(10, 200, true, 100));
        bucket.combine(&rec(20, 500, false, 0));

        let row = row_string(&key(), &bucket);
        assert_eq!(
            row,
            "r1,m1,login,12,30,20,10:1|20:1,1,2,0,1,0,0,1,100,0,0,0,1,1,4,4,1"
        );
        assert_eq!(row.split(',').count(), EXTENDED_COLUMNS);
    }

    #[test]
    fn test_histogram_has_no_trailing_delimiter() {
        let bucket = StatisticsBucket::seeded(&rec(7, 200, true, 0));
        let row = row_string(&key(), &bucket);
        let histogram = row.split(',').nth(6).expect("histogram column");
        assert_eq!(histogram, "7:1");
    }

    #[test]
    fn test_encode_row_appends() {
        let bucket = StatisticsBucket::seeded(&rec(7, 200, true, 0));
        let mut out = String::from("prefix;");
        encode_row(&key(), &bucket, &mut out);
        assert!(out.starts_with("prefix;r1,"));
    }
}
