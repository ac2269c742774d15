//! Sluice benchmark suite.
//!
//! Benchmarks for the ingestion hot path:
//! - Sink appends with and without rollup
//! - NDJSON line parsing
//! - Plumber routing across buckets

use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};

use sluice::coordination::{
    InMemorySegmentAnnouncer, InMemorySegmentPublisher, InMemoryServerView, NoopSegmentPusher,
};
use sluice::source::parse_row;
use sluice::time::parse_timestamp;
use sluice::{
    AggregatorSpec, InputRow, PlumberConfig, PlumberMetrics, RealtimePlumberSchool, Schema,
    SegmentGranularity, Sink,
};

fn schema() -> Schema {
    Schema::new(
        "bench",
        vec![
            AggregatorSpec::Count {
                name: "rows".into(),
            },
            AggregatorSpec::DoubleSum {
                name: "added".into(),
                field_name: "added".into(),
            },
            AggregatorSpec::Max {
                name: "max_added".into(),
                field_name: "added".into(),
            },
        ],
    )
}

fn base() -> DateTime<Utc> {
    parse_timestamp("2013-01-01T00:00:00Z").unwrap()
}

/// Rows spread over one hour. `cardinality` distinct pages controls how much rolls up.
fn rows(count: usize, cardinality: usize) -> Vec<InputRow> {
    (0..count)
        .map(|i| {
            InputRow::new(base() + TimeDelta::milliseconds((i % 3_600_000) as i64))
                .with_dimension("page", format!("page_{}", i % cardinality))
                .with_dimension("language", if i % 3 == 0 { "en" } else { "de" })
                .with_metric("added", (i % 97) as f64)
        })
        .collect()
}

fn sink_add_benchmarks(c: &mut Criterion) {
    let mut group = c.benchmark_group("sink_add");
    let interval = SegmentGranularity::Hour.bucket(base());

    for size in [1_000, 10_000, 100_000] {
        let input = rows(size, 100);
        group.throughput(Throughput::Elements(size as u64));

        group.bench_with_input(BenchmarkId::new("distinct", size), &input, |b, input| {
            let schema = Arc::new(schema());
            b.iter(|| {
                let sink = Sink::new(schema.clone(), interval, "v1");
                for row in input {
                    sink.add(row).unwrap();
                }
                sink.num_rows()
            });
        });

        let rollup = Arc::new(
            schema().with_query_granularity(sluice::QueryGranularity::Hour),
        );
        group.bench_with_input(BenchmarkId::new("rollup", size), &input, |b, input| {
            b.iter(|| {
                let sink = Sink::new(rollup.clone(), interval, "v1");
                for row in input {
                    sink.add(row).unwrap();
                }
                sink.num_rows()
            });
        });

        group.bench_with_input(
            BenchmarkId::new("swap_every_1000", size),
            &input,
            |b, input| {
                let schema = Arc::new(schema());
                b.iter(|| {
                    let sink = Sink::new(schema.clone(), interval, "v1");
                    for (i, row) in input.iter().enumerate() {
                        sink.add(row).unwrap();
                        if i % 1000 == 999 {
                            sink.swap();
                        }
                    }
                    sink.chunk_count()
                });
            },
        );
    }

    group.finish();
}

fn parse_benchmarks(c: &mut Criterion) {
    let mut group = c.benchmark_group("ndjson_parse");
    let schema = schema();

    for size in [1_000, 10_000] {
        let lines: Vec<String> = (0..size)
            .map(|i| {
                format!(
                    r#"{{"timestamp":{},"page":"page_{}","language":"en","added":{}}}"#,
                    1_356_998_400_000i64 + i as i64,
                    i % 100,
                    i % 97
                )
            })
            .collect();

        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::new("parse_row", size), &lines, |b, lines| {
            b.iter(|| {
                lines
                    .iter()
                    .filter(|line| parse_row(line, &schema).is_ok())
                    .count()
            });
        });
    }

    group.finish();
}

fn plumber_routing_benchmarks(c: &mut Criterion) {
    let mut group = c.benchmark_group("plumber_add");
    let temp_dir = tempfile::TempDir::new().unwrap();
    let school = RealtimePlumberSchool::new(
        PlumberConfig::default()
            .with_base_persist_directory(temp_dir.path())
            .with_segment_granularity(SegmentGranularity::FifteenMinute),
    )
    .with_announcer(Arc::new(InMemorySegmentAnnouncer::new()))
    .with_publisher(Arc::new(InMemorySegmentPublisher::new()))
    .with_pusher(Arc::new(NoopSegmentPusher::new()))
    .with_server_view(Arc::new(InMemoryServerView::new()));

    let size = 10_000;
    let input = rows(size, 1000);
    group.throughput(Throughput::Elements(size as u64));
    group.bench_function("four_buckets", |b| {
        b.iter(|| {
            let plumber = school
                .find_plumber(schema(), Arc::new(PlumberMetrics::new()))
                .unwrap();
            for row in &input {
                plumber.add(row).unwrap();
            }
            plumber.sink_count()
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    sink_add_benchmarks,
    parse_benchmarks,
    plumber_routing_benchmarks
);
criterion_main!(benches);
