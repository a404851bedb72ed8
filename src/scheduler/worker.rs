use super::CycleState;
use crate::util::copy::pool::BufferPool;
use crate::util::copy::throttle::{scaled_cache_size, AdaptiveThrottleTracker};
use crate::util::copy::{CopyScanBuffer, HomeSpace};
use crate::util::options::Options;
use atomic_refcell::{AtomicRef, AtomicRefCell, AtomicRefMut};
use std::sync::Arc;

/// Copy/scan counters of one worker over a cycle.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct WorkerCopyStat {
    pub slots_scanned: u64,
    pub slots_copied: u64,
    pub buffers_acquired: usize,
    pub stalls: usize,
    pub major_updates: usize,
}

/// The part of a worker that others may look at.
#[derive(Default)]
pub struct CopyScanWorkerShared {
    stat: AtomicRefCell<WorkerCopyStat>,
}

// Error message for borrowing `CopyScanWorkerShared::stat`.
const STAT_BORROWED_MSG: &str = "CopyScanWorkerShared.stat is already borrowed. This may happen \
    if the stats are read while the worker is updating them.";

impl CopyScanWorkerShared {
    pub fn borrow_stat(&self) -> AtomicRef<WorkerCopyStat> {
        self.stat.try_borrow().expect(STAT_BORROWED_MSG)
    }

    pub fn borrow_stat_mut(&self) -> AtomicRefMut<WorkerCopyStat> {
        self.stat.try_borrow_mut().expect(STAT_BORROWED_MSG)
    }
}

/// A worker of the parallel copy/scan phase. Privately owned by its thread.
pub struct CopyScanWorker<'a, P: BufferPool> {
    pub ordinal: usize,
    tracker: &'a AdaptiveThrottleTracker,
    pool: &'a P,
    cycle: &'a CycleState,
    threads: usize,
    adaptive_scaling: bool,
    min_cache_size: usize,
    max_cache_size: usize,
    /// Slots scanned/copied since the last sample reported to the tracker.
    slots_scanned: u64,
    slots_copied: u64,
    stalled: bool,
    pub shared: Arc<CopyScanWorkerShared>,
}

impl<'a, P: BufferPool> CopyScanWorker<'a, P> {
    pub fn new(
        ordinal: usize,
        tracker: &'a AdaptiveThrottleTracker,
        pool: &'a P,
        cycle: &'a CycleState,
        options: &Options,
    ) -> Self {
        CopyScanWorker {
            ordinal,
            tracker,
            pool,
            cycle,
            threads: options.threads,
            adaptive_scaling: options.adaptive_scaling,
            min_cache_size: options.min_cache_size,
            max_cache_size: options.max_cache_size,
            slots_scanned: 0,
            slots_copied: 0,
            stalled: false,
            shared: Arc::new(CopyScanWorkerShared::default()),
        }
    }

    /// Enter the parallel phase. Every joining worker resets the tracker's accumulator, so
    /// nothing is throttled before all workers run.
    pub fn start(&mut self) {
        self.slots_scanned = 0;
        self.slots_copied = 0;
        *self.shared.borrow_stat_mut() = WorkerCopyStat::default();
        self.tracker.reset(self.threads, false);
        trace!("Copy/scan worker {} started", self.ordinal);
    }

    /// Count slots processed while scanning, and report a sample to the tracker once a batch is
    /// complete. The worker that completes an aggregate publishes it.
    pub fn on_slots_scanned(&mut self, scanned: u64, copied: u64) {
        debug_assert!(copied <= scanned);
        self.slots_scanned += scanned;
        self.slots_copied += copied;
        {
            let mut stat = self.shared.borrow_stat_mut();
            stat.slots_scanned += scanned;
            stat.slots_copied += copied;
        }
        let waiting = self.cycle.stalled_threads() as u64;
        if let Some(update) = self.tracker.update(
            self.ordinal,
            &mut self.slots_scanned,
            &mut self.slots_copied,
            waiting,
        ) {
            self.tracker.major_update(
                update,
                self.pool.non_empty_scan_lists(),
                self.pool.caches_queued(),
            );
            self.shared.borrow_stat_mut().major_updates += 1;
        }
    }

    /// Size in bytes for the next copy/scan buffer this worker sets up.
    pub fn next_cache_size(&self) -> usize {
        if self.adaptive_scaling {
            scaled_cache_size(
                self.tracker.scaling_factor(),
                self.min_cache_size,
                self.max_cache_size,
            )
        } else {
            self.max_cache_size
        }
    }

    /// A buffer to copy into. `None` if the pool has none or the cycle was aborted.
    pub fn acquire_copy_buffer(&mut self, home: HomeSpace) -> Option<CopyScanBuffer> {
        if self.cycle.is_aborted() {
            return None;
        }
        let buffer = self.pool.acquire(home)?;
        self.shared.borrow_stat_mut().buffers_acquired += 1;
        Some(buffer)
    }

    /// A buffer with scan work. Without one the worker counts as stalled until it gets work
    /// again or finishes.
    pub fn next_scan_work(&mut self) -> Option<CopyScanBuffer> {
        if self.cycle.is_aborted() {
            self.unstall();
            return None;
        }
        match self.pool.next_scan_work() {
            Some(buffer) => {
                self.unstall();
                Some(buffer)
            }
            None => {
                if !self.stalled {
                    self.stalled = true;
                    self.cycle.stall();
                    self.shared.borrow_stat_mut().stalls += 1;
                }
                None
            }
        }
    }

    pub fn release(&self, buffer: CopyScanBuffer) {
        self.pool.release(buffer);
    }

    pub fn is_stalled(&self) -> bool {
        self.stalled
    }

    fn unstall(&mut self) {
        if self.stalled {
            self.stalled = false;
            self.cycle.unstall();
        }
    }

    /// Leave the parallel phase. Slots of an incomplete batch are not reported.
    pub fn finish(&mut self) {
        self.unstall();
        trace!(
            "Copy/scan worker {} finished: {:?}",
            self.ordinal,
            *self.shared.borrow_stat()
        );
    }
}
