pub mod rw_spinlock;
pub mod throttle;

pub use criterion::Criterion;

pub fn bench(c: &mut Criterion) {
    throttle::bench(c);
    rw_spinlock::bench(c);
}
