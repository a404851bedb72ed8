//! Adaptive copy/scan throttling.
//!
//! Every GC worker counts the slots it scans and the slots it copies. Each time its scanned
//! count reaches [`SLOTS_SCANNED_PER_THREAD_UPDATE`], the worker folds its counts (plus the
//! number of workers stalled right now) into one shared 64-bit accumulator with a single CAS.
//! A worker that loses the CAS drops its sample. Every
//! [`THREAD_UPDATES_PER_MAJOR_UPDATE`] samples the accumulator is latched into a snapshot, from
//! which [`AdaptiveThrottleTracker::scaling_factor`] derives a factor in `[0, 1]`:
//!
//! ```text
//! run_ratio       = (threads - ceil(waits / updates)) / threads
//! copy_scan_ratio = ceil32(copied) / ceil32(scanned)
//! factor          = run_ratio * copy_scan_ratio
//! ```
//!
//! Copy/scan buffers shrink with the factor: a low copy/scan ratio means most scanned slots
//! do not produce work, and stalled threads mean work is not getting distributed.

use crate::util::constants::*;
use crate::util::conversions::{raw_align_up, round_to_ceiling_u64};
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Instant;

/// Bits in the update count field.
pub const SAMPLE_COUNT_BITS: u32 = 6;
/// Bits in each of the scanned and copied slot count fields.
pub const SAMPLE_SLOTS_BITS: u32 = 16;
/// Bits in the stalled thread count field.
pub const SAMPLE_WAITS_BITS: u32 = 64 - 2 * SAMPLE_SLOTS_BITS - SAMPLE_COUNT_BITS;

const SLOTS_SCANNED_SHIFT: u32 = SAMPLE_COUNT_BITS;
const SLOTS_COPIED_SHIFT: u32 = SLOTS_SCANNED_SHIFT + SAMPLE_SLOTS_BITS;
const THREAD_WAITS_SHIFT: u32 = SLOTS_COPIED_SHIFT + SAMPLE_SLOTS_BITS;

const UPDATE_MASK: u64 = (1 << SAMPLE_COUNT_BITS) - 1;
const SLOTS_MASK: u64 = (1 << SAMPLE_SLOTS_BITS) - 1;

const SLOTS_SCANNED_OVERFLOW: u64 = 1 << (SLOTS_SCANNED_SHIFT + SAMPLE_SLOTS_BITS - 1);
const SLOTS_COPIED_OVERFLOW: u64 = 1 << (SLOTS_COPIED_SHIFT + SAMPLE_SLOTS_BITS - 1);
const THREAD_WAITS_OVERFLOW: u64 = 1 << (THREAD_WAITS_SHIFT + SAMPLE_WAITS_BITS - 1);
// The top bit of the update count is the publication threshold itself, so it is not a sentinel.
const COUNTER_OVERFLOW: u64 = SLOTS_SCANNED_OVERFLOW | SLOTS_COPIED_OVERFLOW | THREAD_WAITS_OVERFLOW;

const_assert_eq!(THREAD_WAITS_SHIFT + SAMPLE_WAITS_BITS, 64);
const_assert_eq!(1u64 << (SAMPLE_COUNT_BITS - 1), THREAD_UPDATES_PER_MAJOR_UPDATE);
// A sample never carries more than twice the batch size, so 32 samples stay below the
// scanned field's sentinel unless every single one was maximal.
const_assert!(
    THREAD_UPDATES_PER_MAJOR_UPDATE * (SLOTS_SCANNED_PER_THREAD_UPDATE << 1)
        <= SLOTS_SCANNED_OVERFLOW >> SLOTS_SCANNED_SHIFT
);

/// One packed copy/scan sample, or a sum of samples:
///
/// ```text
/// | waits (26) | copied (16) | scanned (16) | updates (6) |
/// 63         38 37         22 21          6 5           0
/// ```
#[derive(Copy, Clone, Default, PartialEq, Eq)]
pub struct PackedSample(u64);

impl PackedSample {
    pub const ZERO: PackedSample = PackedSample(0);

    /// A single thread sample.
    pub const fn new(scanned: u64, copied: u64, waits: u64) -> Self {
        PackedSample(
            1 | (scanned << SLOTS_SCANNED_SHIFT)
                | (copied << SLOTS_COPIED_SHIFT)
                | (waits << THREAD_WAITS_SHIFT),
        )
    }

    pub const fn from_raw(raw: u64) -> Self {
        PackedSample(raw)
    }

    pub const fn raw(self) -> u64 {
        self.0
    }

    pub const fn updates(self) -> u64 {
        self.0 & UPDATE_MASK
    }

    pub const fn scanned(self) -> u64 {
        (self.0 >> SLOTS_SCANNED_SHIFT) & SLOTS_MASK
    }

    pub const fn copied(self) -> u64 {
        (self.0 >> SLOTS_COPIED_SHIFT) & SLOTS_MASK
    }

    pub const fn waits(self) -> u64 {
        self.0 >> THREAD_WAITS_SHIFT
    }

    /// Has any field reached its sentinel bit?
    pub const fn has_overflow(self) -> bool {
        self.0 & COUNTER_OVERFLOW != 0
    }
}

impl fmt::Debug for PackedSample {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("PackedSample")
            .field("updates", &self.updates())
            .field("scanned", &self.scanned())
            .field("copied", &self.copied())
            .field("waits", &self.waits())
            .finish()
    }
}

/// Proof that the calling worker owns the current major update. It must be handed to
/// [`AdaptiveThrottleTracker::major_update`], which publishes the sample and releases
/// ownership.
#[must_use = "a claimed major update blocks all other major updates until it is published"]
#[derive(Debug)]
pub struct MajorUpdate {
    sample: PackedSample,
    owner: usize,
}

impl MajorUpdate {
    pub fn sample(&self) -> PackedSample {
        self.sample
    }
}

/// One record of the rolling history. A record aggregates `folding_factor` major updates.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct UpdateHistory {
    /// Sum of stalled thread counts.
    pub waits: u64,
    pub copied: u64,
    pub scanned: u64,
    /// Number of thread samples.
    pub updates: u64,
    /// Sum of active worker counts, one per major update.
    pub threads: u64,
    /// Sum of non-empty scan list counts.
    pub lists: u64,
    /// Sum of queued cache counts.
    pub caches: u64,
    /// Microseconds since reset at the most recent major update in this record.
    pub time: u64,
}

impl UpdateHistory {
    fn merge(&self, other: &UpdateHistory) -> UpdateHistory {
        UpdateHistory {
            waits: self.waits + other.waits,
            copied: self.copied + other.copied,
            scanned: self.scanned + other.scanned,
            updates: self.updates + other.updates,
            threads: self.threads + other.threads,
            lists: self.lists + other.lists,
            caches: self.caches + other.caches,
            time: self.time.max(other.time),
        }
    }

    pub fn major_updates(&self) -> u64 {
        self.updates / THREAD_UPDATES_PER_MAJOR_UPDATE
    }
}

struct History {
    table: [UpdateHistory; UPDATE_HISTORY_SIZE],
    /// The record receiving the next major update.
    index: usize,
    /// Major updates per record.
    folding_factor: u64,
    reset_at: Instant,
}

impl History {
    fn new() -> Self {
        History {
            table: [UpdateHistory::default(); UPDATE_HISTORY_SIZE],
            index: 0,
            folding_factor: 1,
            reset_at: Instant::now(),
        }
    }

    /// Pairwise-sum the table into its first half, halving its resolution.
    fn fold(&mut self) {
        const HALF: usize = UPDATE_HISTORY_SIZE / 2;
        for i in 0..HALF {
            self.table[i] = self.table[2 * i].merge(&self.table[2 * i + 1]);
        }
        for record in self.table[HALF..].iter_mut() {
            *record = UpdateHistory::default();
        }
        self.index = HALF;
        self.folding_factor <<= 1;
    }

    fn filled(&self) -> &[UpdateHistory] {
        if self.index < UPDATE_HISTORY_SIZE && self.table[self.index].updates > 0 {
            &self.table[..=self.index]
        } else {
            &self.table[..self.index]
        }
    }
}

/// Aggregates per-worker copy/scan samples into a scaling factor for copy/scan buffer sizes.
///
/// `update` never blocks and never retries. At most one worker at a time holds the
/// major update token, and only that worker writes the snapshot and the history.
pub struct AdaptiveThrottleTracker {
    /// Samples aggregated since the last major update.
    accumulating: AtomicU64,
    /// The last published aggregate of `THREAD_UPDATES_PER_MAJOR_UPDATE` samples.
    accumulated: AtomicU64,
    /// 0 when free, otherwise the owning worker's ordinal + 1.
    major_update_owner: AtomicUsize,
    thread_count: AtomicUsize,
    scaling_update_count: AtomicUsize,
    overflow_count: AtomicUsize,
    failed_update_count: AtomicUsize,
    history: spin::Mutex<History>,
}

impl Default for AdaptiveThrottleTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl AdaptiveThrottleTracker {
    pub fn new() -> Self {
        AdaptiveThrottleTracker {
            accumulating: AtomicU64::new(0),
            accumulated: AtomicU64::new(0),
            major_update_owner: AtomicUsize::new(0),
            thread_count: AtomicUsize::new(0),
            scaling_update_count: AtomicUsize::new(0),
            overflow_count: AtomicUsize::new(0),
            failed_update_count: AtomicUsize::new(0),
            history: spin::Mutex::new(History::new()),
        }
    }

    /// Clear the accumulator and the snapshot so that the factor is 1.0 until enough new samples
    /// arrive. `thread_count` is the number of workers taking part in this cycle.
    pub fn reset(&self, thread_count: usize, reset_history: bool) {
        self.accumulating.store(0, Ordering::SeqCst);
        self.accumulated.store(0, Ordering::SeqCst);
        self.thread_count.store(thread_count, Ordering::Relaxed);
        if reset_history {
            self.scaling_update_count.store(0, Ordering::Relaxed);
            self.overflow_count.store(0, Ordering::Relaxed);
            self.failed_update_count.store(0, Ordering::Relaxed);
            *self.history.lock() = History::new();
        }
    }

    pub fn thread_count(&self) -> usize {
        self.thread_count.load(Ordering::Relaxed)
    }

    /// Report a worker's running slot counts. Below the batch size this does nothing. Otherwise
    /// the counts are consumed (zeroed) and offered to the accumulator once; the sample is
    /// dropped if another worker updated the accumulator concurrently.
    ///
    /// Returns the major update token if this sample completed an aggregate and this worker won
    /// the right to publish it.
    pub fn update(
        &self,
        ordinal: usize,
        slots_scanned: &mut u64,
        slots_copied: &mut u64,
        waiting_count: u64,
    ) -> Option<MajorUpdate> {
        if *slots_scanned < SLOTS_SCANNED_PER_THREAD_UPDATE {
            return None;
        }
        let mut scanned = std::mem::take(slots_scanned);
        let mut copied = std::mem::take(slots_copied);

        // A long array segment can produce a sample large enough to overflow the accumulator.
        while (SLOTS_SCANNED_PER_THREAD_UPDATE << 1) < scanned {
            scanned >>= 1;
            copied >>= 1;
        }

        let result = self.add_thread_update(PackedSample::new(scanned, copied, waiting_count))?;
        if result.updates() != THREAD_UPDATES_PER_MAJOR_UPDATE {
            return None;
        }
        let owner = ordinal + 1;
        self.major_update_owner
            .compare_exchange(0, owner, Ordering::AcqRel, Ordering::Relaxed)
            .ok()
            .map(|_| MajorUpdate {
                sample: result,
                owner,
            })
    }

    /// A single CAS adding `sample` to the accumulator. Returns the new aggregate if the CAS
    /// won. An aggregate that reached the threshold is cleared from the accumulator; one that
    /// went past it is discarded.
    fn add_thread_update(&self, sample: PackedSample) -> Option<PackedSample> {
        let old = self.accumulating.load(Ordering::Relaxed);
        let new = PackedSample(old.wrapping_add(sample.raw()));
        self.accumulating
            .compare_exchange(old, new.raw(), Ordering::AcqRel, Ordering::Relaxed)
            .ok()?;
        let updates = new.updates();
        if updates >= THREAD_UPDATES_PER_MAJOR_UPDATE {
            self.accumulating.store(0, Ordering::Release);
            if updates > THREAD_UPDATES_PER_MAJOR_UPDATE {
                return None;
            }
        }
        Some(new)
    }

    /// Publish a completed aggregate and release the major update token. An aggregate with an
    /// overflowed counter is discarded instead.
    pub fn major_update(
        &self,
        update: MajorUpdate,
        non_empty_scan_lists: usize,
        caches_queued: usize,
    ) {
        debug_assert_eq!(
            self.major_update_owner.load(Ordering::Relaxed),
            update.owner,
            "major update published by a worker that does not own it"
        );
        let sample = update.sample;
        if !sample.has_overflow() {
            self.accumulated.store(sample.raw(), Ordering::Release);
            let count = self.scaling_update_count.fetch_add(1, Ordering::Relaxed) + 1;
            self.record(sample, non_empty_scan_lists, caches_queued);
            trace!(
                "Major update #{} by worker {}: {:?}",
                count,
                update.owner - 1,
                sample
            );
        } else {
            self.overflow_count.fetch_add(1, Ordering::Relaxed);
            debug!("Discarding overflowed copy/scan aggregate {:?}", sample);
        }
        self.major_update_owner.store(0, Ordering::Release);
    }

    fn record(&self, sample: PackedSample, non_empty_scan_lists: usize, caches_queued: usize) {
        let threads = self.thread_count() as u64;
        let mut history = self.history.lock();
        if history.index >= UPDATE_HISTORY_SIZE {
            history.fold();
        }
        let time = history.reset_at.elapsed().as_micros() as u64;
        let folding_factor = history.folding_factor;
        let index = history.index;
        let record = &mut history.table[index];
        record.waits += sample.waits();
        record.copied += sample.copied();
        record.scanned += sample.scanned();
        record.updates += sample.updates();
        record.threads += threads;
        record.lists += non_empty_scan_lists as u64;
        record.caches += caches_queued as u64;
        record.time = time;
        if record.major_updates() >= folding_factor {
            history.index += 1;
        }
    }

    /// The latest published aggregate.
    pub fn snapshot(&self) -> PackedSample {
        PackedSample(self.accumulated.load(Ordering::Acquire))
    }

    /// The scaling factor from the latest published aggregate: 1.0 without one.
    pub fn scaling_factor(&self) -> f64 {
        let sample = self.snapshot();
        self.compute_scaling_factor(
            self.thread_count() as u64,
            sample.waits(),
            sample.copied(),
            sample.scanned(),
            sample.updates(),
        )
    }

    /// The maximal lower bound for the scaling factor over a history record: the thread count
    /// is averaged over the record's major updates and rounded up. 0.0 for an empty record.
    pub fn history_scaling_factor(&self, record: &UpdateHistory) -> f64 {
        let major_updates = record.major_updates();
        if major_updates == 0 {
            return 0.0;
        }
        let threads = record.threads.div_ceil(major_updates);
        self.compute_scaling_factor(
            threads,
            record.waits,
            record.copied,
            record.scanned,
            record.updates,
        )
    }

    fn compute_scaling_factor(
        &self,
        threads: u64,
        waits: u64,
        copied: u64,
        scanned: u64,
        updates: u64,
    ) -> f64 {
        if copied > scanned {
            self.failed_update(copied, scanned);
            return 1.0;
        }
        if updates == 0 {
            return 1.0;
        }

        // Quantize to whole thread updates so the ratio steps down from 1.
        let copy_count = round_to_ceiling_u64(THREAD_UPDATES_PER_MAJOR_UPDATE, copied);
        let scan_count = round_to_ceiling_u64(THREAD_UPDATES_PER_MAJOR_UPDATE, scanned);
        let copy_scan_ratio = if scan_count > 0 {
            copy_count as f64 / scan_count as f64
        } else {
            1.0
        };

        let run_ratio = if threads > 0 {
            let stalled = waits.div_ceil(updates);
            threads.saturating_sub(stalled) as f64 / threads as f64
        } else {
            1.0
        };

        run_ratio * copy_scan_ratio
    }

    fn failed_update(&self, copied: u64, scanned: u64) {
        self.failed_update_count.fetch_add(1, Ordering::Relaxed);
        error!(
            "Copy/scan sample has copied > scanned ({} > {}), scaling disabled for it",
            copied, scanned
        );
    }

    /// Number of published major updates.
    pub fn scaling_update_count(&self) -> usize {
        self.scaling_update_count.load(Ordering::Relaxed)
    }

    /// Number of aggregates discarded because a counter overflowed.
    pub fn overflow_count(&self) -> usize {
        self.overflow_count.load(Ordering::Relaxed)
    }

    /// Number of samples rejected for copied > scanned.
    pub fn failed_update_count(&self) -> usize {
        self.failed_update_count.load(Ordering::Relaxed)
    }

    /// The history records filled so far, oldest first.
    pub fn history(&self) -> Vec<UpdateHistory> {
        self.history.lock().filled().to_vec()
    }

    /// Major updates aggregated per history record.
    pub fn history_folding_factor(&self) -> u64 {
        self.history.lock().folding_factor
    }

    /// Time spanned by the history record at `index`: from the end of the previous record (or
    /// the reset) to its latest update.
    pub fn spanned_micros(&self, index: usize) -> u64 {
        let history = self.history.lock();
        let records = history.filled();
        match records.get(index) {
            Some(record) => {
                let start = if index == 0 { 0 } else { records[index - 1].time };
                record.time.saturating_sub(start)
            }
            None => 0,
        }
    }
}

/// The size of the next copy/scan buffer: `factor * max_size`, never below `min_size`, aligned
/// up to a word.
pub fn scaled_cache_size(factor: f64, min_size: usize, max_size: usize) -> usize {
    let factor = if factor.is_nan() { 1.0 } else { factor.clamp(0.0, 1.0) };
    let scaled = (factor * max_size as f64) as usize;
    raw_align_up(scaled.max(min_size), BYTES_IN_ADDRESS)
}
