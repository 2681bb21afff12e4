use criterion::{Criterion, black_box, criterion_group, criterion_main};
use parking_lot::Mutex;

// Reference the main crate
extern crate cachestore;

use cachestore::infrastructure::pairlock::PairLock;

// Benchmark an uncontended pin/unpin cycle under the coarse mutex
pub fn bench_read_cycle(c: &mut Criterion) {
    let mutex = Mutex::new(());
    let lock = PairLock::new();

    c.bench_function("read_lock_unlock", |b: &mut criterion::Bencher| {
        b.iter(|| {
            let mut guard = mutex.lock();
            lock.read_lock(black_box(&mut guard));
            lock.read_unlock(&mut guard);
        })
    });
}

// Benchmark an uncontended write acquire/release cycle
pub fn bench_write_cycle(c: &mut Criterion) {
    let mutex = Mutex::new(());
    let lock = PairLock::new();

    c.bench_function("write_lock_unlock", |b: &mut criterion::Bencher| {
        b.iter(|| {
            let mut guard = mutex.lock();
            lock.write_lock(black_box(&mut guard));
            lock.write_unlock(&mut guard);
        })
    });
}

// Benchmark the fetch-path pattern: write acquire, downgrade, read release
pub fn bench_write_downgrade(c: &mut Criterion) {
    let mutex = Mutex::new(());
    let lock = PairLock::new();

    c.bench_function("write_downgrade_read", |b: &mut criterion::Bencher| {
        b.iter(|| {
            let mut guard = mutex.lock();
            lock.write_lock(black_box(&mut guard));
            lock.write_unlock_to_read(&mut guard);
            lock.read_unlock(&mut guard);
        })
    });
}

// Benchmark stacked readers, the common hit-path shape
pub fn bench_shared_readers(c: &mut Criterion) {
    let mutex = Mutex::new(());
    let lock = PairLock::new();

    c.bench_function("four_shared_readers", |b: &mut criterion::Bencher| {
        b.iter(|| {
            let mut guard = mutex.lock();
            for _ in 0..4 {
                lock.read_lock(black_box(&mut guard));
            }
            for _ in 0..4 {
                lock.read_unlock(&mut guard);
            }
        })
    });
}

criterion_group!(
    benches,
    bench_read_cycle,
    bench_write_cycle,
    bench_write_downgrade,
    bench_shared_readers
);
criterion_main!(benches);
