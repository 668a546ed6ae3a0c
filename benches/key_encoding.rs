//! Key encoding and bucket labelling throughput

use bitesized::{Granularity, IntervalCatalog, KeyEncoder};
use chrono::{TimeZone, Utc};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

fn bench_labels(c: &mut Criterion) {
    let at = Utc.with_ymd_and_hms(2024, 3, 9, 14, 30, 0).unwrap();
    let mut group = c.benchmark_group("label");

    for granularity in Granularity::ALL_GRANULARITIES {
        group.bench_with_input(
            BenchmarkId::from_parameter(granularity),
            &granularity,
            |b, g| b.iter(|| black_box(g.label(black_box(at)))),
        );
    }
    group.finish();
}

fn bench_encode(c: &mut Criterion) {
    let keys = KeyEncoder::default();
    let catalog = IntervalCatalog::default();
    let at = Utc.with_ymd_and_hms(2024, 3, 9, 14, 30, 0).unwrap();

    c.bench_function("encode_plain_event", |b| {
        b.iter(|| keys.encode(black_box("login"), black_box("day:2024-03-09")))
    });

    c.bench_function("encode_escaped_event", |b| {
        b.iter(|| keys.encode(black_box("checkout:step:2"), black_box("day:2024-03-09")))
    });

    c.bench_function("encode_default_catalog", |b| {
        b.iter(|| {
            catalog
                .labels(black_box(at))
                .iter()
                .map(|(_, label)| keys.encode("login", label))
                .collect::<Result<Vec<_>, _>>()
        })
    });

    c.bench_function("scratch_key", |b| b.iter(|| keys.scratch_key()));
}

criterion_group!(benches, bench_labels, bench_encode);
criterion_main!(benches);
