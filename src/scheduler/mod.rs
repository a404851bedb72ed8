//! Worker-side glue for the parallel copy/scan phase: per-worker state that feeds the
//! adaptive throttle tracker, and the state shared by all workers of one cycle.

mod worker;
pub use worker::{CopyScanWorker, CopyScanWorkerShared, WorkerCopyStat};

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// State shared by all workers during one copy/scan cycle.
#[derive(Debug, Default)]
pub struct CycleState {
    /// Workers currently waiting for scan work.
    stalled: AtomicUsize,
    aborted: AtomicBool,
}

impl CycleState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stalled_threads(&self) -> usize {
        self.stalled.load(Ordering::Relaxed)
    }

    pub(crate) fn stall(&self) {
        self.stalled.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn unstall(&self) {
        let previous = self.stalled.fetch_sub(1, Ordering::Relaxed);
        debug_assert!(previous > 0);
    }

    /// Abort the cycle, e.g. on evacuation failure. Workers notice between buffer operations.
    pub fn abort(&self) {
        if !self.aborted.swap(true, Ordering::AcqRel) {
            info!("Copy/scan cycle aborted");
        }
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }

    pub fn reset(&self) {
        debug_assert_eq!(self.stalled_threads(), 0);
        self.stalled.store(0, Ordering::Relaxed);
        self.aborted.store(false, Ordering::Release);
    }
}
