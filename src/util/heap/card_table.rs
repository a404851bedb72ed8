//! The card table used by concurrent marking.
//!
//! Cards are cleaned concurrently in up to three phases. Each phase goes
//! PREPARING -> CLEANING -> COMPLETE:
//!
//! * PHASE1 cleans the cards from the start of the table up to the first free address of the
//!   old space.
//! * PHASE2 cleans the rest of the table.
//! * PHASE3 (only with two cleaning passes) re-cleans the whole table. Entering it raises the
//!   pass-2 event to registered [`CardCleanHook`]s.
//!
//! Exactly one thread prepares a phase: it wins a CAS on the phase word. Everybody else waits
//! until the phase is prepared. Only mutator threads prepare. Cards left dirty when the
//! concurrent window closes are cleaned by [`ConcurrentCardTable::final_clean_cards`] while
//! the world is stopped.

use super::HeapRangeListener;
use crate::util::constants::*;
use crate::util::conversions::{bytes_to_cards_up, card_align_down, card_align_up};
use crate::util::error::InitError;
use crate::util::options::Options;
use crate::util::rw_spinlock::RwSpinlock;
use crate::util::Address;
use atomic::Atomic;
use bytemuck::NoUninit;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Weak;
use strum_macros::Display;

/// Card cleaning phases. The numbering matters: `phase % 3` is 1 while preparing, 2 while
/// cleaning and 0 when complete (or uninitialised).
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, NoUninit, Display)]
pub enum CardCleanPhase {
    Uninitialized = 0,
    Phase1Preparing = 1,
    Phase1Cleaning = 2,
    Phase1Complete = 3,
    Phase2Preparing = 4,
    Phase2Cleaning = 5,
    Phase2Complete = 6,
    Phase3Preparing = 7,
    Phase3Cleaning = 8,
    Phase3Complete = 9,
}

impl CardCleanPhase {
    fn next(self) -> CardCleanPhase {
        use CardCleanPhase::*;
        match self {
            Uninitialized => Phase1Preparing,
            Phase1Preparing => Phase1Cleaning,
            Phase1Cleaning => Phase1Complete,
            Phase1Complete => Phase2Preparing,
            Phase2Preparing => Phase2Cleaning,
            Phase2Cleaning => Phase2Complete,
            Phase2Complete => Phase3Preparing,
            Phase3Preparing => Phase3Cleaning,
            Phase3Cleaning | Phase3Complete => Phase3Complete,
        }
    }

    pub fn is_being_prepared(self) -> bool {
        self as u8 % 3 == 1
    }

    pub fn is_cleaning(self) -> bool {
        self as u8 % 3 == 2
    }

    /// 0 for phase 1, 1 for phase 2, 2 for phase 3. `None` when uninitialised.
    fn ordinal(self) -> Option<usize> {
        match self {
            CardCleanPhase::Uninitialized => None,
            p => Some((p as usize - 1) / 3),
        }
    }
}

/// Notified when the second card cleaning pass begins.
pub trait CardCleanHook: Send + Sync {
    fn card_clean_pass2_start(&self);
}

/// What the card table needs from the marker while it cleans cards.
pub trait CardCleaningDelegate {
    /// The first free address of the old space, if it has any free memory. Cards below it are
    /// cleaned in phase 1.
    fn first_free_address(&self) -> Option<Address>;

    /// Re-trace the marked objects that start in `[low, high)`, tracing roughly `budget` bytes
    /// (at least the whole card). Returns the bytes traced, or `None` if the scan gave up
    /// because another thread requested exclusive access.
    fn scan_card(&self, low: Address, high: Address, budget: usize) -> Option<usize>;
}

/// Cards cleaned per phase.
#[derive(Debug, Default)]
pub struct CardCleaningStats {
    concurrent_cleaned: [AtomicUsize; 3],
    final_cleaned: [AtomicUsize; 2],
}

impl CardCleaningStats {
    fn clear(&self) {
        for counter in self.concurrent_cleaned.iter().chain(self.final_cleaned.iter()) {
            counter.store(0, Ordering::Relaxed);
        }
    }

    /// Cards cleaned concurrently in phase `1..=3`.
    pub fn concurrent_cleaned_cards(&self, phase: usize) -> usize {
        self.concurrent_cleaned[phase - 1].load(Ordering::Relaxed)
    }

    /// Cards cleaned by the final stop-the-world cleaning, split into cards below the phase-2
    /// boundary (`phase2 == false`) and above it.
    pub fn final_cleaned_cards(&self, phase2: bool) -> usize {
        self.final_cleaned[phase2 as usize].load(Ordering::Relaxed)
    }
}

struct CardTableInner {
    base: Address,
    cards: Vec<AtomicU8>,
}

impl CardTableInner {
    fn top(&self) -> Address {
        self.base + (self.cards.len() << LOG_BYTES_IN_CARD)
    }

    fn covers(&self, low: Address, high: Address) -> bool {
        !self.cards.is_empty() && self.base <= low && high <= self.top()
    }

    fn card_index(&self, addr: Address) -> Option<usize> {
        if self.cards.is_empty() || addr < self.base || addr >= self.top() {
            None
        } else {
            Some((addr - self.base) >> LOG_BYTES_IN_CARD)
        }
    }

    fn card_address(&self, index: usize) -> Address {
        self.base + (index << LOG_BYTES_IN_CARD)
    }

    fn set_range(&self, low: Address, high: Address, value: u8) {
        let from = (low - self.base) >> LOG_BYTES_IN_CARD;
        let to = bytes_to_cards_up(high - self.base);
        for card in &self.cards[from..to] {
            card.store(value, Ordering::Relaxed);
        }
    }
}

fn allocate_cards(count: usize, value: u8) -> Result<Vec<AtomicU8>, InitError> {
    let mut cards = Vec::new();
    cards
        .try_reserve_exact(count)
        .map_err(|_| InitError::CardTableAllocation { cards: count })?;
    cards.extend((0..count).map(|_| AtomicU8::new(value)));
    Ok(cards)
}

/// A card table that grows and shrinks with the heap and is cleaned concurrently with the
/// mutator.
pub struct ConcurrentCardTable {
    inner: RwSpinlock<CardTableInner>,
    phase: Atomic<CardCleanPhase>,
    last_phase: CardCleanPhase,
    /// Phase range as card indices, written by the preparing thread only.
    first_card_in_phase: AtomicUsize,
    last_card_in_phase: AtomicUsize,
    first_card_in_phase2: AtomicUsize,
    /// Next card index to hand out in the current phase.
    cursor: AtomicUsize,
    stats: CardCleaningStats,
    hooks: spin::Mutex<Vec<Weak<dyn CardCleanHook>>>,
}

impl ConcurrentCardTable {
    pub fn new(options: &Options) -> Self {
        let last_phase = if options.card_cleaning_passes == 2 {
            CardCleanPhase::Phase3Complete
        } else {
            CardCleanPhase::Phase2Complete
        };
        ConcurrentCardTable {
            inner: RwSpinlock::from_options(
                CardTableInner {
                    base: Address::ZERO,
                    cards: Vec::new(),
                },
                options,
            ),
            phase: Atomic::new(CardCleanPhase::Uninitialized),
            last_phase,
            first_card_in_phase: AtomicUsize::new(0),
            last_card_in_phase: AtomicUsize::new(0),
            first_card_in_phase2: AtomicUsize::new(0),
            cursor: AtomicUsize::new(0),
            stats: CardCleaningStats::default(),
            hooks: spin::Mutex::new(Vec::new()),
        }
    }

    pub fn register_hook(&self, hook: Weak<dyn CardCleanHook>) {
        self.hooks.lock().push(hook);
    }

    pub fn phase(&self) -> CardCleanPhase {
        self.phase.load(Ordering::Acquire)
    }

    pub fn last_phase(&self) -> CardCleanPhase {
        self.last_phase
    }

    pub fn stats(&self) -> &CardCleaningStats {
        &self.stats
    }

    /// Number of cards in the table.
    pub fn card_count(&self) -> usize {
        self.inner.read().cards.len()
    }

    /// The covered heap range, `None` while the heap is empty.
    pub fn covered_range(&self) -> Option<std::ops::Range<Address>> {
        let inner = self.inner.read();
        if inner.cards.is_empty() {
            None
        } else {
            Some(inner.base..inner.top())
        }
    }

    pub fn is_card_cleaning_started(&self) -> bool {
        self.phase() >= CardCleanPhase::Phase1Cleaning
    }

    pub fn is_card_cleaning_complete(&self) -> bool {
        self.phase() == self.last_phase
    }

    /// Card indices the current phase covers. Meaningful once the phase is prepared.
    pub fn cards_in_phase(&self) -> std::ops::Range<usize> {
        self.first_card_in_phase.load(Ordering::Relaxed)
            ..self.last_card_in_phase.load(Ordering::Relaxed)
    }

    /// Mark the card holding `addr` dirty. Addresses outside the table are ignored: a store
    /// can race with the removal of its heap range.
    pub fn dirty_card(&self, addr: Address) {
        let inner = self.inner.read();
        match inner.card_index(addr) {
            Some(index) => inner.cards[index].store(CARD_DIRTY, Ordering::Relaxed),
            None => trace!("Ignoring card dirtying for {} outside the card table", addr),
        }
    }

    pub fn is_card_dirty(&self, addr: Address) -> bool {
        let inner = self.inner.read();
        inner
            .card_index(addr)
            .is_some_and(|index| inner.cards[index].load(Ordering::Relaxed) == CARD_DIRTY)
    }

    /// Number of dirty cards in the whole table.
    pub fn dirty_card_count(&self) -> usize {
        self.inner
            .read()
            .cards
            .iter()
            .filter(|c| c.load(Ordering::Relaxed) == CARD_DIRTY)
            .count()
    }

    /// Dirty every card overlapping `[low, high)`.
    pub fn dirty_cards_in_range(&self, low: Address, high: Address) {
        let inner = self.inner.read();
        let (low, high) = (card_align_down(low), card_align_up(high));
        if inner.covers(low, high) {
            inner.set_range(low, high, CARD_DIRTY);
        }
    }

    /// Clean every card overlapping `[low, high)`.
    pub fn clear_cards_in_range(&self, low: Address, high: Address) {
        let inner = self.inner.read();
        let (low, high) = (card_align_down(low), card_align_up(high));
        if inner.covers(low, high) {
            inner.set_range(low, high, CARD_CLEAN);
        }
    }

    /// Clean the cards of regions that are not collected concurrently.
    pub fn clear_non_concurrent_cards<I>(&self, regions: I)
    where
        I: IntoIterator<Item = std::ops::Range<Address>>,
    {
        for region in regions {
            self.clear_cards_in_range(region.start, region.end);
        }
    }

    /// Start a new cycle of concurrent card cleaning.
    pub fn initialize_card_cleaning(&self) {
        self.stats.clear();
        self.phase
            .store(CardCleanPhase::Uninitialized, Ordering::Release);
    }

    fn needs_preparing(&self, phase: CardCleanPhase) -> bool {
        phase < self.last_phase && (phase as u8 % 3) < 2
    }

    /// Try to become the thread that prepares the phase after `current`. Losers wait until the
    /// winner is done.
    fn get_exclusive_card_table_access(&self, current: CardCleanPhase) -> bool {
        if !current.is_being_prepared()
            && self
                .phase
                .compare_exchange(current, current.next(), Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            return true;
        }
        while self.phase().is_being_prepared() {
            std::thread::yield_now();
        }
        false
    }

    fn release_exclusive_card_table_access(&self) {
        let current = self.phase();
        debug_assert!(current.is_being_prepared());
        let _ = self.phase.compare_exchange(
            current,
            current.next(),
            Ordering::AcqRel,
            Ordering::Relaxed,
        );
        debug!("Card cleaning phase: {}", current.next());
    }

    fn prepare_cards_for_cleaning(&self, delegate: &dyn CardCleaningDelegate) {
        let inner = self.inner.read();
        let last_card = inner.cards.len();
        let phase = self.phase();
        match phase {
            CardCleanPhase::Phase1Preparing => {
                let end = delegate
                    .first_free_address()
                    .map_or(last_card, |free| {
                        inner
                            .card_index(free)
                            .unwrap_or(if free < inner.base { 0 } else { last_card })
                    });
                self.first_card_in_phase.store(0, Ordering::Relaxed);
                self.last_card_in_phase.store(end, Ordering::Relaxed);
                self.first_card_in_phase2.store(end, Ordering::Relaxed);
                self.cursor.store(0, Ordering::Relaxed);
            }
            CardCleanPhase::Phase2Preparing => {
                let start = self.last_card_in_phase.load(Ordering::Relaxed);
                self.first_card_in_phase.store(start, Ordering::Relaxed);
                self.last_card_in_phase.store(last_card, Ordering::Relaxed);
                self.cursor.store(start, Ordering::Relaxed);
            }
            CardCleanPhase::Phase3Preparing => {
                self.first_card_in_phase.store(0, Ordering::Relaxed);
                self.last_card_in_phase.store(last_card, Ordering::Relaxed);
                self.cursor.store(0, Ordering::Relaxed);
                drop(inner);
                self.report_card_clean_pass2_start();
            }
            _ => debug_assert!(false, "preparing card table in phase {}", phase),
        }
    }

    fn report_card_clean_pass2_start(&self) {
        info!("Card cleaning pass 2 started");
        let hooks: Vec<_> = self.hooks.lock().iter().filter_map(Weak::upgrade).collect();
        for hook in hooks {
            hook.card_clean_pass2_start();
        }
    }

    /// Claim the next dirty card in `[cursor, end)`.
    fn next_dirty_card(&self, inner: &CardTableInner, end: usize) -> Option<usize> {
        let end = end.min(inner.cards.len());
        loop {
            let index = self.cursor.fetch_add(1, Ordering::Relaxed);
            if index >= end {
                return None;
            }
            if inner.cards[index].load(Ordering::Relaxed) == CARD_DIRTY {
                return Some(index);
            }
        }
    }

    /// Clean cards concurrently until about `size_to_do` bytes were traced, the phase ends, or
    /// another thread requests exclusive access.
    ///
    /// Returns `None` if there was nothing this thread could do (the phase is not cleaning, or
    /// all phases are done), otherwise the bytes traced. Non-mutator threads never prepare a
    /// phase; they get `Some(0)` while preparation is pending.
    pub fn clean_cards(
        &self,
        is_mutator: bool,
        size_to_do: usize,
        delegate: &dyn CardCleaningDelegate,
    ) -> Option<usize> {
        let mut current = self.phase();
        if self.needs_preparing(current) {
            if !is_mutator {
                return Some(0);
            }
            if self.get_exclusive_card_table_access(current) {
                self.prepare_cards_for_cleaning(delegate);
                self.release_exclusive_card_table_access();
            }
            current = self.phase();
        }
        if !current.is_cleaning() {
            return None;
        }

        let inner = self.inner.read();
        let end = self.last_card_in_phase.load(Ordering::Relaxed);
        let mut cleaned_so_far = 0;
        let mut cards_cleaned = 0;
        let mut exhausted = false;
        while cleaned_so_far < size_to_do && self.phase() == current {
            let Some(index) = self.next_dirty_card(&inner, end) else {
                exhausted = true;
                break;
            };
            inner.cards[index].store(CARD_CLEAN, Ordering::Relaxed);
            cards_cleaned += 1;
            let low = inner.card_address(index);
            let budget = (size_to_do - cleaned_so_far).max(BYTES_IN_CARD);
            match delegate.scan_card(low, low + BYTES_IN_CARD, budget) {
                Some(traced) => cleaned_so_far += traced,
                None => {
                    // Not finished: the card must be seen again.
                    inner.cards[index].store(CARD_DIRTY, Ordering::Relaxed);
                    break;
                }
            }
        }
        drop(inner);

        if let Some(ordinal) = current.ordinal() {
            self.stats.concurrent_cleaned[ordinal].fetch_add(cards_cleaned, Ordering::Relaxed);
        }
        if exhausted
            && self
                .phase
                .compare_exchange(current, current.next(), Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
        {
            debug!("Card cleaning phase: {}", current.next());
        }
        Some(cleaned_so_far)
    }

    /// Prepare to clean every remaining dirty card while the world is stopped.
    pub fn initialize_final_card_cleaning(&self) {
        let cards = self.inner.read().cards.len();
        self.cursor.store(0, Ordering::Relaxed);
        self.last_card_in_phase.store(cards, Ordering::Relaxed);
        if self.phase() == CardCleanPhase::Uninitialized {
            // Concurrent cleaning never started: everything counts as below the phase-2 boundary.
            self.first_card_in_phase2.store(cards, Ordering::Relaxed);
        }
    }

    /// Clean dirty cards while the world is stopped, stopping after roughly `max_bytes` bytes
    /// were traced. Returns the bytes traced and whether dirty cards remain.
    pub fn final_clean_cards(
        &self,
        max_bytes: usize,
        delegate: &dyn CardCleaningDelegate,
    ) -> (usize, bool) {
        let inner = self.inner.read();
        let end = self.last_card_in_phase.load(Ordering::Relaxed);
        let phase2_start = self.first_card_in_phase2.load(Ordering::Relaxed);
        let mut traced = 0;
        let mut cards = [0usize; 2];
        let mut more = true;
        while traced < max_bytes {
            let Some(index) = self.next_dirty_card(&inner, end) else {
                more = false;
                break;
            };
            inner.cards[index].store(CARD_CLEAN, Ordering::Relaxed);
            cards[(index >= phase2_start) as usize] += 1;
            let low = inner.card_address(index);
            let scanned = delegate.scan_card(low, low + BYTES_IN_CARD, usize::MAX);
            debug_assert!(scanned.is_some(), "card scan interrupted while the world is stopped");
            traced += scanned.unwrap_or(0);
        }
        for (counter, n) in self.stats.final_cleaned.iter().zip(cards) {
            counter.fetch_add(n, Ordering::Relaxed);
        }
        (traced, more)
    }
}

impl HeapRangeListener for ConcurrentCardTable {
    /// Grow the table to cover `[low, high)`. New cards start dirty when the region is already
    /// under concurrent collection, clean otherwise. Any gap between the old and new coverage
    /// is filled with clean cards.
    fn heap_add_range(
        &self,
        low: Address,
        high: Address,
        under_concurrent_collection: bool,
    ) -> Result<(), InitError> {
        if high <= low || !low.is_aligned_to(BYTES_IN_CARD) {
            return Err(InitError::BadHeapRange { low, high });
        }
        let high_card = card_align_up(high);
        let seed = if under_concurrent_collection {
            CARD_DIRTY
        } else {
            CARD_CLEAN
        };

        let mut inner = self.inner.write();
        if inner.cards.is_empty() {
            inner.base = low;
            inner.cards = allocate_cards(bytes_to_cards_up(high - low), seed)?;
        } else {
            let (base, top) = (inner.base, inner.top());
            if low < top && base < high_card {
                return Err(InitError::BadHeapRange { low, high });
            }
            let new_base = base.min(low);
            let new_top = top.max(high_card);
            let mut cards = allocate_cards((new_top - new_base) >> LOG_BYTES_IN_CARD, CARD_CLEAN)?;
            let old_offset = (base - new_base) >> LOG_BYTES_IN_CARD;
            for (i, card) in inner.cards.iter().enumerate() {
                *cards[old_offset + i].get_mut() = card.load(Ordering::Relaxed);
            }
            let new_offset = (low - new_base) >> LOG_BYTES_IN_CARD;
            for card in &mut cards[new_offset..new_offset + bytes_to_cards_up(high - low)] {
                *card.get_mut() = seed;
            }
            inner.base = new_base;
            inner.cards = cards;
        }
        debug!(
            "Card table covers {}..{} after adding {}..{} ({} cards, seeded {})",
            inner.base,
            inner.top(),
            low,
            high,
            inner.cards.len(),
            if under_concurrent_collection { "dirty" } else { "clean" }
        );
        Ok(())
    }

    /// Shrink the table if `[low, high)` is at either end of it; cards of a range in the
    /// middle are only cleaned.
    fn heap_remove_range(&self, low: Address, high: Address) -> Result<(), InitError> {
        if high <= low || !low.is_aligned_to(BYTES_IN_CARD) {
            return Err(InitError::BadHeapRange { low, high });
        }
        let high_card = card_align_up(high);
        let mut inner = self.inner.write();
        if !inner.covers(low, high_card) {
            return Err(InitError::UncoveredHeapRange { low, high });
        }
        let removed = (high_card - low) >> LOG_BYTES_IN_CARD;
        if low == inner.base {
            inner.cards.drain(..removed);
            inner.base = high_card;
        } else if high_card == inner.top() {
            let keep = inner.cards.len() - removed;
            inner.cards.truncate(keep);
        } else {
            inner.set_range(low, high_card, CARD_CLEAN);
        }
        if inner.cards.is_empty() {
            inner.base = Address::ZERO;
        }
        debug!("Card table removed {}..{} ({} cards left)", low, high, inner.cards.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    const BASE: usize = 0x1000_0000;

    fn table(passes: usize) -> ConcurrentCardTable {
        let mut options = Options::builtin();
        options.card_cleaning_passes = passes;
        ConcurrentCardTable::new(&options)
    }

    fn addr(offset: usize) -> Address {
        Address::from_usize(BASE + offset)
    }

    /// Scans every card fully, charging one card of work per card.
    struct Scanner {
        first_free: Option<Address>,
        scanned: AtomicUsize,
        interrupt: bool,
    }

    impl Scanner {
        fn new(first_free: Option<Address>) -> Self {
            Scanner {
                first_free,
                scanned: AtomicUsize::new(0),
                interrupt: false,
            }
        }
    }

    impl CardCleaningDelegate for Scanner {
        fn first_free_address(&self) -> Option<Address> {
            self.first_free
        }

        fn scan_card(&self, _low: Address, _high: Address, _budget: usize) -> Option<usize> {
            if self.interrupt {
                return None;
            }
            self.scanned.fetch_add(1, Ordering::Relaxed);
            Some(BYTES_IN_CARD)
        }
    }

    struct CountingHook(AtomicUsize);

    impl CardCleanHook for CountingHook {
        fn card_clean_pass2_start(&self) {
            self.0.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn phase_arithmetic() {
        assert!(CardCleanPhase::Phase2Preparing.is_being_prepared());
        assert!(CardCleanPhase::Phase3Cleaning.is_cleaning());
        assert!(!CardCleanPhase::Phase1Complete.is_cleaning());
        assert_eq!(CardCleanPhase::Phase1Complete.next(), CardCleanPhase::Phase2Preparing);
        assert_eq!(CardCleanPhase::Phase3Complete.next(), CardCleanPhase::Phase3Complete);
        assert_eq!(CardCleanPhase::Phase2Cleaning.ordinal(), Some(1));
        assert_eq!(CardCleanPhase::Uninitialized.ordinal(), None);
    }

    #[test]
    fn add_range_seeds_cards() {
        let t = table(2);
        t.heap_add_range(addr(0), addr(10 * BYTES_IN_CARD + 1), false).unwrap();
        assert_eq!(t.card_count(), 11);
        assert_eq!(t.dirty_card_count(), 0);

        t.heap_add_range(addr(11 * BYTES_IN_CARD), addr(15 * BYTES_IN_CARD), true)
            .unwrap();
        assert_eq!(t.card_count(), 15);
        assert_eq!(t.dirty_card_count(), 4);
        assert!(t.is_card_dirty(addr(14 * BYTES_IN_CARD)));
        assert!(!t.is_card_dirty(addr(10 * BYTES_IN_CARD)));
    }

    #[test]
    fn add_range_below_base_and_with_gap() {
        let t = table(2);
        t.heap_add_range(addr(8 * BYTES_IN_CARD), addr(10 * BYTES_IN_CARD), true)
            .unwrap();
        t.heap_add_range(addr(0), addr(2 * BYTES_IN_CARD), false).unwrap();
        assert_eq!(t.covered_range(), Some(addr(0)..addr(10 * BYTES_IN_CARD)));
        assert_eq!(t.card_count(), 10);
        assert_eq!(t.dirty_card_count(), 2);
        assert!(t.is_card_dirty(addr(9 * BYTES_IN_CARD)));
    }

    #[test]
    fn bad_ranges_are_rejected() {
        let t = table(2);
        assert_eq!(
            t.heap_add_range(addr(1), addr(BYTES_IN_CARD), false),
            Err(InitError::BadHeapRange {
                low: addr(1),
                high: addr(BYTES_IN_CARD)
            })
        );
        t.heap_add_range(addr(0), addr(4 * BYTES_IN_CARD), false).unwrap();
        assert!(t
            .heap_add_range(addr(2 * BYTES_IN_CARD), addr(6 * BYTES_IN_CARD), false)
            .is_err());
        assert!(matches!(
            t.heap_remove_range(addr(4 * BYTES_IN_CARD), addr(5 * BYTES_IN_CARD)),
            Err(InitError::UncoveredHeapRange { .. })
        ));
    }

    #[test]
    fn remove_range_shrinks_at_the_ends() {
        let t = table(2);
        t.heap_add_range(addr(0), addr(8 * BYTES_IN_CARD), true).unwrap();
        t.heap_remove_range(addr(6 * BYTES_IN_CARD), addr(8 * BYTES_IN_CARD))
            .unwrap();
        assert_eq!(t.card_count(), 6);
        t.heap_remove_range(addr(0), addr(2 * BYTES_IN_CARD)).unwrap();
        assert_eq!(t.covered_range(), Some(addr(2 * BYTES_IN_CARD)..addr(6 * BYTES_IN_CARD)));
        t.heap_remove_range(addr(3 * BYTES_IN_CARD), addr(4 * BYTES_IN_CARD))
            .unwrap();
        assert_eq!(t.card_count(), 4);
        assert_eq!(t.dirty_card_count(), 3);
    }

    #[test]
    fn dirty_and_clear_ranges() {
        let t = table(2);
        t.heap_add_range(addr(0), addr(8 * BYTES_IN_CARD), false).unwrap();
        t.dirty_cards_in_range(addr(BYTES_IN_CARD + 8), addr(3 * BYTES_IN_CARD + 8));
        assert_eq!(t.dirty_card_count(), 3);
        t.clear_non_concurrent_cards([addr(0)..addr(2 * BYTES_IN_CARD)]);
        assert_eq!(t.dirty_card_count(), 2);
        t.dirty_card(addr(7 * BYTES_IN_CARD + 100));
        assert!(t.is_card_dirty(addr(7 * BYTES_IN_CARD)));
    }

    #[test]
    fn dirtying_a_removed_range_is_ignored() {
        let t = table(2);
        t.heap_add_range(addr(0), addr(4 * BYTES_IN_CARD), false).unwrap();
        t.heap_remove_range(addr(2 * BYTES_IN_CARD), addr(4 * BYTES_IN_CARD))
            .unwrap();
        // A store racing with the removal of its range.
        t.dirty_card(addr(3 * BYTES_IN_CARD));
        t.dirty_card(addr(100 * BYTES_IN_CARD));
        assert_eq!(t.dirty_card_count(), 0);
        assert!(!t.is_card_dirty(addr(3 * BYTES_IN_CARD)));
    }

    #[test]
    fn helpers_never_prepare() {
        let t = table(2);
        t.heap_add_range(addr(0), addr(4 * BYTES_IN_CARD), true).unwrap();
        t.initialize_card_cleaning();
        let scanner = Scanner::new(None);
        assert_eq!(t.clean_cards(false, usize::MAX, &scanner), Some(0));
        assert_eq!(t.phase(), CardCleanPhase::Uninitialized);
        assert_eq!(t.dirty_card_count(), 4);
    }

    #[test]
    fn two_pass_cleaning_walks_all_phases() {
        let t = table(2);
        let hook = Arc::new(CountingHook(AtomicUsize::new(0)));
        let weak: Weak<dyn CardCleanHook> = Arc::downgrade(&hook) as Weak<CountingHook>;
        t.register_hook(weak);
        t.heap_add_range(addr(0), addr(8 * BYTES_IN_CARD), true).unwrap();
        t.initialize_card_cleaning();
        let scanner = Scanner::new(Some(addr(5 * BYTES_IN_CARD)));

        // Phase 1: cards 0..5
        assert_eq!(t.clean_cards(true, usize::MAX, &scanner), Some(5 * BYTES_IN_CARD));
        assert_eq!(t.phase(), CardCleanPhase::Phase1Complete);
        assert_eq!(t.cards_in_phase(), 0..5);
        assert_eq!(t.dirty_card_count(), 3);

        // Phase 2: the rest
        t.dirty_card(addr(0));
        assert_eq!(t.clean_cards(true, usize::MAX, &scanner), Some(3 * BYTES_IN_CARD));
        assert_eq!(t.phase(), CardCleanPhase::Phase2Complete);
        assert_eq!(t.cards_in_phase(), 5..8);
        assert_eq!(hook.0.load(Ordering::Relaxed), 0);

        // Phase 3 picks up the card re-dirtied during phase 2.
        assert_eq!(t.clean_cards(true, usize::MAX, &scanner), Some(BYTES_IN_CARD));
        assert_eq!(hook.0.load(Ordering::Relaxed), 1);
        assert!(t.is_card_cleaning_complete());
        assert_eq!(t.clean_cards(true, usize::MAX, &scanner), None);

        assert_eq!(t.stats().concurrent_cleaned_cards(1), 5);
        assert_eq!(t.stats().concurrent_cleaned_cards(2), 3);
        assert_eq!(t.stats().concurrent_cleaned_cards(3), 1);
    }

    #[test]
    fn single_pass_ends_after_phase2() {
        let t = table(1);
        t.heap_add_range(addr(0), addr(4 * BYTES_IN_CARD), true).unwrap();
        t.initialize_card_cleaning();
        let scanner = Scanner::new(None);
        assert_eq!(t.clean_cards(true, usize::MAX, &scanner), Some(4 * BYTES_IN_CARD));
        assert_eq!(t.phase(), CardCleanPhase::Phase1Complete);
        assert_eq!(t.clean_cards(true, usize::MAX, &scanner), Some(0));
        assert_eq!(t.phase(), CardCleanPhase::Phase2Complete);
        assert!(t.is_card_cleaning_complete());
        assert_eq!(t.clean_cards(true, usize::MAX, &scanner), None);
    }

    #[test]
    fn budget_limits_cleaning() {
        let t = table(2);
        t.heap_add_range(addr(0), addr(8 * BYTES_IN_CARD), true).unwrap();
        t.initialize_card_cleaning();
        let scanner = Scanner::new(None);
        assert_eq!(t.clean_cards(true, 2 * BYTES_IN_CARD, &scanner), Some(2 * BYTES_IN_CARD));
        assert_eq!(t.phase(), CardCleanPhase::Phase1Cleaning);
        assert_eq!(t.dirty_card_count(), 6);
    }

    #[test]
    fn interrupted_card_is_redirtied() {
        let t = table(2);
        t.heap_add_range(addr(0), addr(2 * BYTES_IN_CARD), true).unwrap();
        t.initialize_card_cleaning();
        let mut scanner = Scanner::new(None);
        scanner.interrupt = true;
        assert_eq!(t.clean_cards(true, usize::MAX, &scanner), Some(0));
        assert_eq!(t.dirty_card_count(), 2);
        assert_eq!(t.phase(), CardCleanPhase::Phase1Cleaning);
    }

    #[test]
    fn final_cleaning_splits_stats_by_phase2_boundary() {
        let t = table(2);
        t.heap_add_range(addr(0), addr(8 * BYTES_IN_CARD), false).unwrap();
        t.initialize_card_cleaning();
        let scanner = Scanner::new(Some(addr(4 * BYTES_IN_CARD)));
        // Prepare phase 1 and clean nothing (all cards are clean).
        assert_eq!(t.clean_cards(true, usize::MAX, &scanner), Some(0));
        t.dirty_card(addr(BYTES_IN_CARD));
        t.dirty_card(addr(6 * BYTES_IN_CARD));
        t.dirty_card(addr(7 * BYTES_IN_CARD));

        t.initialize_final_card_cleaning();
        let (traced, more) = t.final_clean_cards(usize::MAX, &scanner);
        assert_eq!(traced, 3 * BYTES_IN_CARD);
        assert!(!more);
        assert_eq!(t.dirty_card_count(), 0);
        assert_eq!(t.stats().final_cleaned_cards(false), 1);
        assert_eq!(t.stats().final_cleaned_cards(true), 2);
    }

    #[test]
    fn final_cleaning_respects_budget() {
        let t = table(2);
        t.heap_add_range(addr(0), addr(4 * BYTES_IN_CARD), true).unwrap();
        t.initialize_final_card_cleaning();
        let scanner = Scanner::new(None);
        let (traced, more) = t.final_clean_cards(BYTES_IN_CARD, &scanner);
        assert_eq!(traced, BYTES_IN_CARD);
        assert!(more);
        let (_, more) = t.final_clean_cards(usize::MAX, &scanner);
        assert!(!more);
        assert_eq!(t.dirty_card_count(), 0);
    }
}
