//! Benchmarks for dispatch overhead.
//!
//! The task body is a trivial multiply, so these measure the cost of the
//! factory, the shared result slab, and thread startup rather than any real
//! work.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use fanout::{map, Options};

fn bench_thread_map(c: &mut Criterion) {
    let mut group = c.benchmark_group("thread_map");

    for size in [100usize, 1_000, 10_000] {
        let items: Vec<u64> = (0..size as u64).collect();
        group.bench_with_input(BenchmarkId::new("square", size), &items, |b, items| {
            b.iter(|| {
                let out = map(
                    items.clone(),
                    Options::new().in_threads().workers(4),
                    |x: &u64| Ok(x * x),
                )
                .unwrap();
                black_box(out)
            });
        });
    }

    group.finish();
}

fn bench_serial_map(c: &mut Criterion) {
    let mut group = c.benchmark_group("serial_map");

    for size in [100usize, 1_000, 10_000] {
        let items: Vec<u64> = (0..size as u64).collect();
        group.bench_with_input(BenchmarkId::new("square", size), &items, |b, items| {
            b.iter(|| {
                let out = map(items.clone(), Options::new().workers(0), |x: &u64| Ok(x * x))
                    .unwrap();
                black_box(out)
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_thread_map, bench_serial_map);
criterion_main!(benches);
