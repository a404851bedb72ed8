//! Benchmarks for uncontended reader/writer spin lock round trips.

use concgc::RwSpinlock;
use criterion::Criterion;
use std::hint::black_box;

pub fn bench(c: &mut Criterion) {
    let lock = RwSpinlock::new(0usize, 256);

    c.bench_function("rw_spinlock_read", |b| {
        b.iter(|| black_box(*lock.read()))
    });

    c.bench_function("rw_spinlock_write", |b| {
        b.iter(|| {
            *lock.write() += 1;
        })
    });
}
