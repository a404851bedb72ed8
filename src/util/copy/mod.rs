//! Copy/scan buffers ("caches") used by parallel GC workers while evacuating objects.
//!
//! A worker owns at most a few buffers at a time. It copies survivors to `alloc` and scans the
//! copied objects from `scan`, so the buffer itself is the worker's to-do list: scan work is left
//! exactly while `scan < alloc`. Buffers move between workers through the
//! [pool](pool::CopyScanBufferPool), by value.

pub mod pool;
pub mod throttle;

use crate::util::{Address, ByteSize};
use enum_map::Enum;
use strum_macros::{Display, EnumIter};

/// Which space a buffer's memory belongs to. Fixed when the buffer is created.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Enum, EnumIter, Display)]
pub enum HomeSpace {
    /// Survivor memory in the nursery.
    Nursery,
    /// Memory in the tenured (old) space, receiving promoted objects.
    Tenure,
    /// A scan-only buffer over objects that are already in the heap (e.g. remembered objects).
    InHeap,
}

/// The mutable state flags of a buffer.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct BufferFlags(u8);

impl BufferFlags {
    /// A worker is scanning this buffer right now.
    pub const SCANNING: BufferFlags = BufferFlags(1 << 0);
    /// The buffer is scanning a pointer array in segments.
    pub const SPLIT_ARRAY: BufferFlags = BufferFlags(1 << 1);
    /// The buffer was retired. It owns no memory until it is reinitialised with a fresh extent.
    pub const CLEARED: BufferFlags = BufferFlags(1 << 2);

    pub const fn empty() -> Self {
        BufferFlags(0)
    }

    pub const fn contains(self, other: BufferFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: BufferFlags) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: BufferFlags) {
        self.0 &= !other.0;
    }
}

/// Progress through a pointer array that is scanned in segments. The array itself may be
/// handed to other workers between segments, so the buffer remembers where to resume and the
/// slot that referred to the array.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SplitArrayScan {
    /// The array being scanned.
    pub array: Address,
    /// The slot the array was reached through.
    pub source_slot: Address,
    /// The next element index to scan.
    pub index: usize,
    /// Elements left to scan from `index`.
    pub remaining: usize,
}

/// A bounded region `[base, top)` one worker copies into and scans.
///
/// Invariant: `base <= scan <= alloc <= top`.
#[derive(Debug)]
pub struct CopyScanBuffer {
    base: Address,
    top: Address,
    alloc: Address,
    scan: Address,
    home: HomeSpace,
    flags: BufferFlags,
    split_array: Option<SplitArrayScan>,
    /// An object whose scan was interrupted part way; scanning resumes from it.
    partially_scanned: Option<Address>,
}

impl CopyScanBuffer {
    pub fn new(base: Address, top: Address, home: HomeSpace) -> Self {
        debug_assert!(base <= top, "buffer base {} above top {}", base, top);
        CopyScanBuffer {
            base,
            top,
            alloc: base,
            scan: base,
            home,
            flags: BufferFlags::empty(),
            split_array: None,
            partially_scanned: None,
        }
    }

    /// A buffer that only scans `[base, top)`, which already holds objects.
    pub fn new_scan_only(base: Address, top: Address) -> Self {
        let mut buffer = Self::new(base, top, HomeSpace::InHeap);
        buffer.alloc = top;
        buffer
    }

    /// Re-point a buffer at a new extent. The home space is kept.
    pub fn reinit(&mut self, base: Address, top: Address) {
        debug_assert!(base <= top);
        debug_assert!(!self.is_scanning());
        self.base = base;
        self.top = top;
        self.alloc = base;
        self.scan = base;
        self.flags = BufferFlags::empty();
        self.split_array = None;
        self.partially_scanned = None;
    }

    pub fn base(&self) -> Address {
        self.base
    }

    pub fn top(&self) -> Address {
        self.top
    }

    pub fn alloc_pointer(&self) -> Address {
        self.alloc
    }

    pub fn scan_pointer(&self) -> Address {
        self.scan
    }

    pub fn home(&self) -> HomeSpace {
        self.home
    }

    pub fn flags(&self) -> BufferFlags {
        self.flags
    }

    pub fn capacity(&self) -> ByteSize {
        self.top - self.base
    }

    pub fn free_bytes(&self) -> ByteSize {
        self.top - self.alloc
    }

    /// Is there anything copied into this buffer that has not been scanned yet?
    pub fn is_scan_work_available(&self) -> bool {
        self.scan < self.alloc
    }

    /// Bytes copied but not yet scanned.
    pub fn unscanned_bytes(&self) -> ByteSize {
        self.alloc - self.scan
    }

    /// Cannot take another copy of `min_bytes` bytes.
    pub fn is_full(&self, min_bytes: ByteSize) -> bool {
        self.free_bytes() < min_bytes
    }

    /// Reserve `bytes` at the allocation pointer for an object copy. Returns `None` when the
    /// buffer cannot hold the copy; the worker then releases it and claims another.
    pub fn alloc_copy(&mut self, bytes: ByteSize) -> Option<Address> {
        if self.is_cleared() || bytes > self.free_bytes() {
            return None;
        }
        let result = self.alloc;
        self.alloc += bytes;
        Some(result)
    }

    /// Move the scan pointer past `bytes` of scanned objects. Never passes the allocation pointer.
    pub fn advance_scan(&mut self, bytes: ByteSize) {
        debug_assert!(
            bytes <= self.unscanned_bytes(),
            "scan {} + {} passes alloc {}",
            self.scan,
            bytes,
            self.alloc
        );
        self.scan += bytes.min(self.unscanned_bytes());
    }

    /// Move the scan pointer to `to`, which must lie between the scan and alloc pointers.
    pub fn scan_to(&mut self, to: Address) {
        debug_assert!(self.scan <= to && to <= self.alloc);
        self.scan = to.min(self.alloc).max(self.scan);
    }

    pub fn is_scanning(&self) -> bool {
        self.flags.contains(BufferFlags::SCANNING)
    }

    pub fn set_scanning(&mut self) {
        debug_assert!(!self.is_scanning());
        self.flags.insert(BufferFlags::SCANNING);
    }

    pub fn clear_scanning(&mut self) {
        self.flags.remove(BufferFlags::SCANNING);
    }

    /// Remember an object whose scan has to be resumed.
    pub fn set_partially_scanned(&mut self, object: Option<Address>) {
        self.partially_scanned = object;
    }

    pub fn partially_scanned(&self) -> Option<Address> {
        self.partially_scanned
    }

    /// Turn this buffer into a split array scan over `length - start_index` elements of
    /// `array`, starting at `start_index`.
    pub fn begin_split_array(
        &mut self,
        array: Address,
        source_slot: Address,
        start_index: usize,
        length: usize,
    ) {
        debug_assert!(start_index <= length);
        self.flags.insert(BufferFlags::SPLIT_ARRAY);
        self.split_array = Some(SplitArrayScan {
            array,
            source_slot,
            index: start_index,
            remaining: length - start_index,
        });
    }

    pub fn is_split_array(&self) -> bool {
        self.flags.contains(BufferFlags::SPLIT_ARRAY)
    }

    pub fn split_array(&self) -> Option<&SplitArrayScan> {
        self.split_array.as_ref()
    }

    /// Claim the next segment of at most `max_elements` elements of the split array. Returns
    /// the element index range to scan, or `None` once the array is done (which also clears the
    /// split state).
    pub fn next_split_segment(&mut self, max_elements: usize) -> Option<std::ops::Range<usize>> {
        debug_assert!(max_elements > 0);
        let split = self.split_array.as_mut()?;
        if split.remaining == 0 {
            self.end_split_array();
            return None;
        }
        let count = split.remaining.min(max_elements);
        let range = split.index..split.index + count;
        split.index += count;
        split.remaining -= count;
        Some(range)
    }

    /// Detach the unscanned rest of the split array so it can be queued for another worker.
    pub fn take_split_array(&mut self) -> Option<SplitArrayScan> {
        let split = self.split_array.take();
        self.flags.remove(BufferFlags::SPLIT_ARRAY);
        split.filter(|s| s.remaining > 0)
    }

    fn end_split_array(&mut self) {
        self.split_array = None;
        self.flags.remove(BufferFlags::SPLIT_ARRAY);
    }

    /// Retire the buffer. Its extent holds copied objects now and is never handed out again:
    /// the buffer is left without memory until [`reinit`](Self::reinit) gives it a fresh extent.
    pub fn clear(&mut self) {
        self.base = self.top;
        self.alloc = self.top;
        self.scan = self.top;
        self.split_array = None;
        self.partially_scanned = None;
        self.flags = BufferFlags::CLEARED;
    }

    pub fn is_cleared(&self) -> bool {
        self.flags.contains(BufferFlags::CLEARED)
    }

    #[cfg(any(test, feature = "extreme_assertions"))]
    pub fn assert_invariants(&self) {
        assert!(self.base <= self.scan);
        assert!(self.scan <= self.alloc);
        assert!(self.alloc <= self.top);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffer(bytes: usize) -> CopyScanBuffer {
        let base = Address::from_usize(0x10_0000);
        CopyScanBuffer::new(base, base + bytes, HomeSpace::Nursery)
    }

    #[test]
    fn scan_work_tracks_alloc() {
        let mut b = buffer(256);
        assert!(!b.is_scan_work_available());
        let first = b.alloc_copy(64).unwrap();
        assert_eq!(first, b.base());
        assert!(b.is_scan_work_available());
        assert_eq!(b.unscanned_bytes(), 64);
        b.advance_scan(64);
        assert!(!b.is_scan_work_available());
        assert_eq!(b.scan_pointer(), b.alloc_pointer());
        b.assert_invariants();
    }

    #[test]
    fn alloc_fails_when_full() {
        let mut b = buffer(128);
        assert!(b.alloc_copy(100).is_some());
        assert!(b.is_full(64));
        assert!(b.alloc_copy(64).is_none());
        assert_eq!(b.alloc_copy(28), Some(b.base() + 100));
        assert_eq!(b.free_bytes(), 0);
        b.assert_invariants();
    }

    #[test]
    fn scan_never_passes_alloc() {
        let mut b = buffer(128);
        b.alloc_copy(32).unwrap();
        b.scan_to(b.base() + 16);
        assert!(b.is_scan_work_available());
        b.scan_to(b.alloc_pointer());
        assert!(!b.is_scan_work_available());
        b.assert_invariants();
    }

    #[test]
    fn scanning_flag() {
        let mut b = buffer(64);
        assert!(!b.is_scanning());
        b.set_scanning();
        assert!(b.is_scanning());
        b.clear_scanning();
        assert!(!b.is_scanning());
        assert_eq!(b.home(), HomeSpace::Nursery);
    }

    #[test]
    fn scan_only_buffer_has_work() {
        let base = Address::from_usize(0x2000);
        let b = CopyScanBuffer::new_scan_only(base, base + 512usize);
        assert_eq!(b.home(), HomeSpace::InHeap);
        assert!(b.is_scan_work_available());
        assert_eq!(b.free_bytes(), 0);
    }

    #[test]
    fn split_array_segments() {
        let mut b = buffer(64);
        let array = Address::from_usize(0x9000);
        let slot = Address::from_usize(0x8008);
        b.begin_split_array(array, slot, 2, 10);
        assert!(b.is_split_array());
        assert_eq!(b.split_array().unwrap().source_slot, slot);
        assert_eq!(b.next_split_segment(4), Some(2..6));
        assert_eq!(b.split_array().unwrap().remaining, 4);
        assert_eq!(b.next_split_segment(4), Some(6..10));
        assert_eq!(b.next_split_segment(4), None);
        assert!(!b.is_split_array());
        assert!(b.split_array().is_none());
    }

    #[test]
    fn split_array_can_be_requeued() {
        let mut b = buffer(64);
        b.begin_split_array(Address::from_usize(0x9000), Address::from_usize(0x8000), 0, 100);
        b.next_split_segment(30);
        let rest = b.take_split_array().unwrap();
        assert_eq!((rest.index, rest.remaining), (30, 70));
        assert!(!b.is_split_array());
    }

    #[test]
    fn clear_and_reinit() {
        let mut b = buffer(64);
        b.alloc_copy(8).unwrap();
        b.set_partially_scanned(Some(b.base()));
        b.clear();
        assert!(b.is_cleared());
        assert!(!b.is_scan_work_available());
        assert!(b.partially_scanned().is_none());
        assert_eq!(b.capacity(), 0);
        assert_eq!(b.alloc_copy(0), None);
        b.assert_invariants();
        let base = Address::from_usize(0x40_0000);
        b.reinit(base, base + 1024usize);
        assert!(!b.is_cleared());
        assert_eq!(b.capacity(), 1024);
        assert_eq!(b.home(), HomeSpace::Nursery);
    }
}
