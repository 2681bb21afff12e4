use criterion::{Criterion, black_box, criterion_group, criterion_main};
use rand::Rng;

// Reference the main crate
extern crate cachestore;

// Import the hash functions from the main crate
use cachestore::infrastructure::hash::{djb2_hash, fnv1a_hash, fullhash, xxh64_hash};

// Generate a random byte buffer of the specified length
fn generate_random_bytes(length: usize) -> Vec<u8> {
    let mut rng = rand::thread_rng();
    (0..length).map(|_| rng.gen_range(0..=u8::MAX)).collect()
}

// Benchmark hash functions with pair-identity sized input (16 bytes)
pub fn bench_pair_identity(c: &mut Criterion) {
    let data = generate_random_bytes(16);

    let mut group = c.benchmark_group("PairIdentity");

    group.bench_function("fnv1a_hash", |b: &mut criterion::Bencher| {
        b.iter(|| fnv1a_hash(black_box(&data)))
    });
    group.bench_function("djb2_hash", |b: &mut criterion::Bencher| {
        b.iter(|| djb2_hash(black_box(&data)))
    });
    group.bench_function("xxh64_hash", |b: &mut criterion::Bencher| {
        b.iter(|| xxh64_hash(black_box(&data)))
    });

    group.finish();
}

// Benchmark hash functions with page-sized input
pub fn bench_page_sized(c: &mut Criterion) {
    let data = generate_random_bytes(4096);

    let mut group = c.benchmark_group("PageSized");

    group.bench_function("fnv1a_hash", |b: &mut criterion::Bencher| {
        b.iter(|| fnv1a_hash(black_box(&data)))
    });
    group.bench_function("djb2_hash", |b: &mut criterion::Bencher| {
        b.iter(|| djb2_hash(black_box(&data)))
    });
    group.bench_function("xxh64_hash", |b: &mut criterion::Bencher| {
        b.iter(|| xxh64_hash(black_box(&data)))
    });

    group.finish();
}

// Benchmark the fullhash path used on every cache operation
pub fn bench_fullhash(c: &mut Criterion) {
    let mut rng = rand::thread_rng();
    let filenum: u64 = rng.gen_range(0..u64::MAX);
    let blocknum: u64 = rng.gen_range(0..u64::MAX);

    c.bench_function("fullhash", |b: &mut criterion::Bencher| {
        b.iter(|| fullhash(black_box(filenum), black_box(blocknum)))
    });
}

criterion_group!(benches, bench_pair_identity, bench_page_sized, bench_fullhash);
criterion_main!(benches);
