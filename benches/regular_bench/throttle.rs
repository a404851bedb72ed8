//! Benchmarks for the adaptive throttle tracker's sample path.

use concgc::util::constants::SLOTS_SCANNED_PER_THREAD_UPDATE;
use concgc::util::copy::throttle::scaled_cache_size;
use concgc::AdaptiveThrottleTracker;
use criterion::Criterion;
use std::hint::black_box;

pub fn bench(c: &mut Criterion) {
    c.bench_function("throttle_update_uncontended", |b| {
        let tracker = AdaptiveThrottleTracker::new();
        tracker.reset(1, true);
        b.iter(|| {
            let mut scanned = SLOTS_SCANNED_PER_THREAD_UPDATE;
            let mut copied = SLOTS_SCANNED_PER_THREAD_UPDATE / 2;
            if let Some(update) = tracker.update(0, &mut scanned, &mut copied, 0) {
                tracker.major_update(update, 1, 4);
            }
        })
    });

    c.bench_function("throttle_scaled_cache_size", |b| {
        let tracker = AdaptiveThrottleTracker::new();
        tracker.reset(4, true);
        b.iter(|| {
            black_box(scaled_cache_size(
                tracker.scaling_factor(),
                black_box(8 << 10),
                black_box(128 << 10),
            ))
        })
    });
}
