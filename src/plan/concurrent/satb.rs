//! The remembered set of a snapshot-at-the-beginning barrier.
//!
//! Every mutator records overwritten referents into its own [`RememberedSetFragment`]. A
//! fragment carries the global fragment index it was stamped with and is valid only while
//! that index is still current. The barrier is switched off by storing
//! [`FRAGMENT_INDEX_DISABLED`] into the global index: no thread-local fragment has to be
//! visited, they all become invalid at once. Indices are never reused, so a fragment from
//! before a `disable`/`enable` round trip, or before a flush, never becomes valid again.

use crate::util::constants::{LOG_HEAP_BYTES_PER_POOLED_FRAGMENT, MIN_POOLED_FRAGMENTS};
use crate::util::error::InitError;
use crate::util::heap::HeapRangeListener;
use crate::util::options::Options;
use crate::util::Address;
use crossbeam::queue::SegQueue;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// The global fragment index while the barrier is disabled.
pub const FRAGMENT_INDEX_DISABLED: usize = 0;

/// A mutator's buffer of recorded references.
#[derive(Debug, Default)]
pub struct RememberedSetFragment {
    local_index: usize,
    entries: Vec<Address>,
}

impl RememberedSetFragment {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn local_index(&self) -> usize {
        self.local_index
    }

    pub fn entries(&self) -> &[Address] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Hands out fragment indices and collects filled fragments for the collector.
pub struct RememberedSetFragmentManager {
    global_index: AtomicUsize,
    /// Source of fresh indices. Starts above `FRAGMENT_INDEX_DISABLED`.
    next_index: AtomicUsize,
    /// The index `enable` installed for the current cycle. Fragments stamped below it are
    /// left over from an earlier cycle.
    cycle_start_index: AtomicUsize,
    fragment_size: usize,
    filled: SegQueue<Vec<Address>>,
    pooled: AtomicUsize,
    heap_bytes: AtomicUsize,
    overflow: AtomicBool,
}

impl RememberedSetFragmentManager {
    pub fn new(options: &Options) -> Self {
        RememberedSetFragmentManager {
            global_index: AtomicUsize::new(FRAGMENT_INDEX_DISABLED),
            next_index: AtomicUsize::new(FRAGMENT_INDEX_DISABLED + 1),
            cycle_start_index: AtomicUsize::new(usize::MAX),
            fragment_size: options.satb_fragment_size,
            filled: SegQueue::new(),
            pooled: AtomicUsize::new(0),
            heap_bytes: AtomicUsize::new(0),
            overflow: AtomicBool::new(false),
        }
    }

    fn fresh_index(&self) -> usize {
        self.next_index.fetch_add(1, Ordering::Relaxed)
    }

    pub fn global_index(&self) -> usize {
        self.global_index.load(Ordering::Acquire)
    }

    pub fn is_enabled(&self) -> bool {
        self.global_index() != FRAGMENT_INDEX_DISABLED
    }

    /// Is `fragment` still stamped with the current global index?
    pub fn is_valid(&self, fragment: &RememberedSetFragment) -> bool {
        let global = self.global_index();
        global != FRAGMENT_INDEX_DISABLED && fragment.local_index == global
    }

    /// Invalidate every fragment at once.
    pub fn disable(&self) {
        self.global_index
            .store(FRAGMENT_INDEX_DISABLED, Ordering::Release);
        debug!("SATB barrier disabled");
    }

    /// Install a fresh global index. Enabling a disabled barrier starts a new cycle: fragments
    /// and pooled entries of earlier cycles are dropped and the overflow state is cleared.
    ///
    /// The pool is emptied before the index is published. Until then no mutator can record
    /// anything, so every fragment published during the drain carries an old stamp.
    pub fn enable(&self) {
        let index = self.fresh_index();
        if self.is_enabled() {
            self.global_index.store(index, Ordering::Release);
            return;
        }
        self.cycle_start_index.store(index, Ordering::Release);
        let mut dropped = 0;
        while self.filled.pop().is_some() {
            self.pooled.fetch_sub(1, Ordering::Relaxed);
            dropped += 1;
        }
        self.overflow.store(false, Ordering::Relaxed);
        self.global_index.store(index, Ordering::Release);
        debug!(
            "SATB barrier enabled with fragment index {} ({} stale fragments dropped)",
            index, dropped
        );
    }

    /// Make every fragment stale, so each mutator publishes its entries on its next store.
    /// Does nothing while disabled.
    pub fn flush_fragments(&self) {
        let index = self.fresh_index();
        let mut current = self.global_index();
        while current != FRAGMENT_INDEX_DISABLED {
            match self.global_index.compare_exchange_weak(
                current,
                index,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    debug!("SATB fragments flushed, new fragment index {}", index);
                    return;
                }
                Err(actual) => current = actual,
            }
        }
    }

    /// Record `reference` in the caller's fragment. A stale or full fragment is published and
    /// replaced first. Returns false, recording nothing, while the barrier is disabled.
    pub fn store_in_fragment(
        &self,
        fragment: &mut RememberedSetFragment,
        reference: Address,
    ) -> bool {
        let global = self.global_index();
        if global == FRAGMENT_INDEX_DISABLED {
            return false;
        }
        if fragment.local_index != global || fragment.entries.len() >= self.fragment_size {
            self.refresh_fragment(fragment, global);
        }
        fragment.entries.push(reference);
        true
    }

    fn refresh_fragment(&self, fragment: &mut RememberedSetFragment, index: usize) {
        let entries = std::mem::replace(
            &mut fragment.entries,
            Vec::with_capacity(self.fragment_size),
        );
        self.publish(fragment.local_index, entries);
        fragment.local_index = index;
    }

    /// Hand a mutator's remaining entries to the collector, e.g. at a safepoint.
    pub fn release_fragment(&self, fragment: &mut RememberedSetFragment) {
        let entries = std::mem::take(&mut fragment.entries);
        self.publish(fragment.local_index, entries);
        fragment.local_index = FRAGMENT_INDEX_DISABLED;
    }

    fn publish(&self, stamp: usize, entries: Vec<Address>) {
        if entries.is_empty()
            || stamp == FRAGMENT_INDEX_DISABLED
            || stamp < self.cycle_start_index.load(Ordering::Acquire)
        {
            return;
        }
        if self.pooled.fetch_add(1, Ordering::Relaxed) >= self.pool_capacity() {
            self.pooled.fetch_sub(1, Ordering::Relaxed);
            if !self.overflow.swap(true, Ordering::Relaxed) {
                warn!(
                    "Remembered set overflowed ({} fragments pooled), entries are dropped",
                    self.pool_capacity()
                );
            }
            return;
        }
        self.filled.push(entries);
    }

    /// Take a published fragment's entries.
    pub fn pop_filled(&self) -> Option<Vec<Address>> {
        let entries = self.filled.pop()?;
        self.pooled.fetch_sub(1, Ordering::Relaxed);
        Some(entries)
    }

    pub fn filled_fragments(&self) -> usize {
        self.pooled.load(Ordering::Relaxed)
    }

    /// Entries were dropped this cycle; the collector has to rescan instead.
    pub fn is_overflowed(&self) -> bool {
        self.overflow.load(Ordering::Relaxed)
    }

    /// Maximum number of published fragments, proportional to the heap size.
    pub fn pool_capacity(&self) -> usize {
        (self.heap_bytes.load(Ordering::Relaxed) >> LOG_HEAP_BYTES_PER_POOLED_FRAGMENT)
            .max(MIN_POOLED_FRAGMENTS)
    }
}

impl HeapRangeListener for RememberedSetFragmentManager {
    fn heap_add_range(
        &self,
        low: Address,
        high: Address,
        _under_concurrent_collection: bool,
    ) -> Result<(), InitError> {
        if high <= low {
            return Err(InitError::BadHeapRange { low, high });
        }
        self.heap_bytes.fetch_add(high - low, Ordering::Relaxed);
        debug!(
            "Remembered set pool capacity {} fragments",
            self.pool_capacity()
        );
        Ok(())
    }

    fn heap_remove_range(&self, low: Address, high: Address) -> Result<(), InitError> {
        if high <= low {
            return Err(InitError::BadHeapRange { low, high });
        }
        let size = high - low;
        self.heap_bytes
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |bytes| {
                bytes.checked_sub(size)
            })
            .map_err(|_| InitError::UncoveredHeapRange { low, high })?;
        debug!(
            "Remembered set pool capacity {} fragments",
            self.pool_capacity()
        );
        Ok(())
    }
}
