use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use loadtally::aggregate::bucket::StatisticsBucket;
use loadtally::aggregate::key::{AggregationKey, KeyBuilder};
use loadtally::aggregate::row::encode_row;
use loadtally::aggregate::table::{AggregationTable, Entry};
use loadtally::record::{parse_record, Record};

const LINE: &str = "1700000000123,42,checkout,200,true,512,7,3";

fn sample(second: u64, elapsed: u64) -> Record {
    Record {
        timestamp_ms: second * 1000 + 123,
        elapsed,
        label: "checkout".to_string(),
        status: 200 + (elapsed % 4) * 100,
        success: elapsed % 11 != 0,
        bytes: 512,
        ttfb: 7,
        connect: elapsed % 2,
    }
}

fn build_table(builder: &KeyBuilder, machine: &Arc<str>) -> AggregationTable {
    let mut table = AggregationTable::new();
    for second in 0..60u64 {
        for scenario in ["login", "browse", "checkout", "search"] {
            let key = builder
                .build(machine, scenario, second * 1000)
                .expect("key");
            for elapsed in 0..32u64 {
                let rec = sample(second, elapsed);
                if table.get_or_create(&key, &rec) == Entry::Existing {
                    table.combine(&key, &rec);
                }
            }
        }
    }
    table
}

fn bench_parse(c: &mut Criterion) {
    c.bench_function("parse_record/valid_line", |b| {
        b.iter(|| parse_record(black_box(LINE)).expect("parse line"))
    });

    c.bench_function("parse_record/wrong_arity", |b| {
        b.iter(|| parse_record(black_box("1700000000123,42,checkout,200")).is_err())
    });
}

fn bench_combine(c: &mut Criterion) {
    let records: Vec<Record> = (0..256).map(|i| sample(1, i % 64)).collect();

    c.bench_function("bucket/combine_256", |b| {
        b.iter(|| {
            let mut bucket = StatisticsBucket::default();
            for rec in &records {
                bucket.combine(black_box(rec));
            }
            black_box(bucket.request_count)
        })
    });
}

fn bench_encode(c: &mut Criterion) {
    let key = AggregationKey::new("round-1".into(), "sn-7".into(), "checkout".into(), 1)
        .expect("valid key");
    let mut bucket = StatisticsBucket::default();
    for i in 0..256 {
        bucket.combine(&sample(1, i % 64));
    }
    let mut row = String::with_capacity(1024);

    c.bench_function("row/encode_64_value_histogram", |b| {
        b.iter(|| {
            row.clear();
            encode_row(black_box(&key), black_box(&bucket), &mut row);
            black_box(row.len())
        })
    });
}

fn bench_drain(c: &mut Criterion) {
    let builder = KeyBuilder::new("round-1").expect("run id");
    let machine: Arc<str> = Arc::from("sn-7");

    c.bench_function("table/drain_closed_half_of_240_buckets", |b| {
        b.iter_batched(
            || build_table(&builder, &machine),
            |mut table| black_box(table.drain_closed(30).len()),
            criterion::BatchSize::SmallInput,
        )
    });
}

fn bench_suite(c: &mut Criterion) {
    bench_parse(c);
    bench_combine(c);
    bench_encode(c);
    bench_drain(c);
}

criterion_group!(benches, bench_suite);
criterion_main!(benches);
