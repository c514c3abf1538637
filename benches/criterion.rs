//! Criterion benchmark entry for smallworld.
//!
//! Run with
//! ```bash
//! cargo bench
//! ```

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use smallworld::{Cosine, Hnsw, HnswBuilder, Item};

const DIMS: usize = 128;
const NUM_VECS: usize = 10_000;
const K: usize = 10;

fn build_index() -> Hnsw<u64, Cosine> {
    let h = HnswBuilder::default()
        .dims(DIMS)
        .max_items(NUM_VECS)
        .m(16)
        .ef_construction(200)
        .ef_search(50)
        .build::<u64>();

    // Deterministic vectors (i as f32) to keep distance monotonic.
    for i in 0..NUM_VECS {
        h.add(Item::new(i as u64, vec![i as f32; DIMS])).unwrap();
    }
    h
}

fn bench_knn(c: &mut Criterion) {
    let h = build_index();
    let query = vec![0.0_f32; DIMS];

    let mut group = c.benchmark_group("knn_search");
    group.throughput(Throughput::Elements(1));

    group.bench_function(BenchmarkId::from_parameter(K), |b| {
        b.iter(|| h.search(&query, K))
    });

    group.finish();
}

fn bench_insert(c: &mut Criterion) {
    let mut group = c.benchmark_group("insert");
    group.throughput(Throughput::Elements(1));

    group.bench_function("sequential", |b| {
        let h = HnswBuilder::default()
            .dims(DIMS)
            .max_items(1_000_000)
            .m(16)
            .ef_construction(100)
            .build::<u64>();
        let mut next = 0u64;
        b.iter(|| {
            // Wraps before the capacity; repeat ids take the duplicate path.
            h.add(Item::new(next, vec![next as f32; DIMS])).unwrap();
            next = (next + 1) % 1_000_000;
        })
    });

    group.finish();
}

criterion_group!(benches, bench_knn, bench_insert);
criterion_main!(benches);
