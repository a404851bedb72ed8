use crate::util::error::InitError;
use crate::util::heap::card_table::{CardCleanHook, CardCleaningDelegate, ConcurrentCardTable};
use crate::util::heap::HeapRangeListener;
use crate::util::options::Options;
use crate::util::Address;
use atomic::Atomic;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

/// How a concurrent cycle ended.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct CycleCompletion {
    /// Concurrent card cleaning had not finished its last phase, so the stop-the-world
    /// cleaning had to pick up the rest.
    pub escalated: bool,
    /// Bytes traced by the stop-the-world card cleaning.
    pub final_bytes_traced: usize,
}

/// Card marking for an incremental-update barrier.
///
/// Mutators pay for their allocation during concurrent marking by cleaning cards: `bytes`
/// allocated buy `bytes * rate` of card cleaning. When the card table enters its second
/// cleaning pass the rate is boosted so the remaining dirty cards are cleaned before marking
/// has to end.
pub struct IncrementalUpdateCardMarker {
    card_table: ConcurrentCardTable,
    alloc_to_trace_rate: Atomic<f64>,
    alloc_to_trace_rate_normal: f64,
    pass2_boost: f64,
    concurrent_marking: AtomicBool,
    pass2_started: AtomicBool,
    /// Bytes traced by the marker since the cycle started.
    traced_total: AtomicUsize,
    /// Bytes traced through card cleaning since the cycle started.
    cleaned_total: AtomicUsize,
    traced_at_pass2: AtomicUsize,
    cleaned_at_pass2: AtomicUsize,
}

impl IncrementalUpdateCardMarker {
    pub fn new(options: &Options) -> Arc<Self> {
        Arc::new_cyclic(|me: &Weak<Self>| {
            let card_table = ConcurrentCardTable::new(options);
            let hook: Weak<dyn CardCleanHook> = me.clone();
            card_table.register_hook(hook);
            let rate = options.concurrent_level as f64;
            IncrementalUpdateCardMarker {
                card_table,
                alloc_to_trace_rate: Atomic::new(rate),
                alloc_to_trace_rate_normal: rate,
                pass2_boost: options.card_clean_pass2_boost,
                concurrent_marking: AtomicBool::new(false),
                pass2_started: AtomicBool::new(false),
                traced_total: AtomicUsize::new(0),
                cleaned_total: AtomicUsize::new(0),
                traced_at_pass2: AtomicUsize::new(0),
                cleaned_at_pass2: AtomicUsize::new(0),
            }
        })
    }

    pub fn card_table(&self) -> &ConcurrentCardTable {
        &self.card_table
    }

    /// The barrier's effect: the card holding `slot` must be cleaned again.
    pub fn mark_card_dirty(&self, slot: Address) {
        self.card_table.dirty_card(slot);
    }

    pub fn is_concurrent_marking(&self) -> bool {
        self.concurrent_marking.load(Ordering::Acquire)
    }

    pub fn alloc_to_trace_rate(&self) -> f64 {
        self.alloc_to_trace_rate.load(Ordering::Relaxed)
    }

    pub fn is_pass2_started(&self) -> bool {
        self.pass2_started.load(Ordering::Relaxed)
    }

    /// Traced and card-cleaned byte totals at the moment pass 2 started.
    pub fn pass2_kickoff_totals(&self) -> (usize, usize) {
        (
            self.traced_at_pass2.load(Ordering::Relaxed),
            self.cleaned_at_pass2.load(Ordering::Relaxed),
        )
    }

    /// Start concurrent marking: restore the normal rate and begin card cleaning.
    pub fn start_concurrent_cycle(&self) {
        self.alloc_to_trace_rate
            .store(self.alloc_to_trace_rate_normal, Ordering::Relaxed);
        self.pass2_started.store(false, Ordering::Relaxed);
        self.traced_total.store(0, Ordering::Relaxed);
        self.cleaned_total.store(0, Ordering::Relaxed);
        self.traced_at_pass2.store(0, Ordering::Relaxed);
        self.cleaned_at_pass2.store(0, Ordering::Relaxed);
        self.card_table.initialize_card_cleaning();
        self.concurrent_marking.store(true, Ordering::Release);
        debug!(
            "Concurrent cycle started, alloc-to-trace rate {}",
            self.alloc_to_trace_rate_normal
        );
    }

    /// Report bytes traced by the marker outside card cleaning.
    pub fn record_traced(&self, bytes: usize) {
        self.traced_total.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Bytes of card cleaning owed for allocating `bytes`.
    pub fn allocation_tax(&self, bytes: usize) -> usize {
        (bytes as f64 * self.alloc_to_trace_rate()) as usize
    }

    /// A mutator allocated `bytes` during concurrent marking and pays for it by cleaning cards.
    /// Returns the bytes traced.
    pub fn pay_allocation_tax(&self, bytes: usize, delegate: &dyn CardCleaningDelegate) -> usize {
        if !self.is_concurrent_marking() {
            return 0;
        }
        let tax = self.allocation_tax(bytes);
        self.clean_cards(true, tax, delegate)
    }

    /// Card cleaning by a background helper thread. Helpers never prepare a phase.
    pub fn help_clean_cards(&self, budget: usize, delegate: &dyn CardCleaningDelegate) -> usize {
        if !self.is_concurrent_marking() {
            return 0;
        }
        self.clean_cards(false, budget, delegate)
    }

    fn clean_cards(
        &self,
        is_mutator: bool,
        budget: usize,
        delegate: &dyn CardCleaningDelegate,
    ) -> usize {
        let traced = self
            .card_table
            .clean_cards(is_mutator, budget, delegate)
            .unwrap_or(0);
        self.cleaned_total.fetch_add(traced, Ordering::Relaxed);
        traced
    }

    /// End concurrent marking. Runs with the world stopped: every card still dirty is cleaned
    /// here. If concurrent cleaning missed its deadline this is an escalation, not a retry.
    pub fn complete_concurrent_cycle(
        &self,
        delegate: &dyn CardCleaningDelegate,
    ) -> CycleCompletion {
        self.concurrent_marking.store(false, Ordering::Release);
        let escalated = !self.card_table.is_card_cleaning_complete();
        if escalated {
            info!(
                "Concurrent card cleaning stopped in {}, finishing with the world stopped",
                self.card_table.phase()
            );
        }
        self.card_table.initialize_final_card_cleaning();
        let mut final_bytes_traced = 0;
        loop {
            let (traced, more) = self.card_table.final_clean_cards(usize::MAX, delegate);
            final_bytes_traced += traced;
            if !more {
                break;
            }
        }
        self.alloc_to_trace_rate
            .store(self.alloc_to_trace_rate_normal, Ordering::Relaxed);
        CycleCompletion {
            escalated,
            final_bytes_traced,
        }
    }
}

impl CardCleanHook for IncrementalUpdateCardMarker {
    fn card_clean_pass2_start(&self) {
        self.pass2_started.store(true, Ordering::Relaxed);
        self.traced_at_pass2
            .store(self.traced_total.load(Ordering::Relaxed), Ordering::Relaxed);
        self.cleaned_at_pass2
            .store(self.cleaned_total.load(Ordering::Relaxed), Ordering::Relaxed);
        let rate = self.alloc_to_trace_rate() * self.pass2_boost;
        self.alloc_to_trace_rate.store(rate, Ordering::Relaxed);
        info!("Card cleaning pass 2: alloc-to-trace rate boosted to {}", rate);
    }
}

impl HeapRangeListener for IncrementalUpdateCardMarker {
    fn heap_add_range(
        &self,
        low: Address,
        high: Address,
        under_concurrent_collection: bool,
    ) -> Result<(), InitError> {
        self.card_table
            .heap_add_range(low, high, under_concurrent_collection)
    }

    fn heap_remove_range(&self, low: Address, high: Address) -> Result<(), InitError> {
        self.card_table.heap_remove_range(low, high)
    }
}
