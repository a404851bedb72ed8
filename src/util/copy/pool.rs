use super::{CopyScanBuffer, HomeSpace};
use crossbeam::queue::SegQueue;
use enum_map::EnumMap;
use std::sync::atomic::{AtomicUsize, Ordering};

/// The shared side of copy/scan buffers. Buffers are handed over by value: a worker that
/// acquires a buffer owns it exclusively until it releases it back.
pub trait BufferPool: Sync {
    /// Take a buffer for copying into `home`, if one is free. A retired buffer
    /// ([`is_cleared`](CopyScanBuffer::is_cleared)) comes back without memory: the caller
    /// reinits it with a fresh extent before copying into it.
    fn acquire(&self, home: HomeSpace) -> Option<CopyScanBuffer>;
    /// Give a buffer back. Buffers with scan work left are queued for scanning; the others are
    /// retired, their extent is never handed out again.
    fn release(&self, buffer: CopyScanBuffer);
    /// Take a buffer with scan work, if any is queued.
    fn next_scan_work(&self) -> Option<CopyScanBuffer>;
    /// Number of buffers waiting to be scanned.
    fn caches_queued(&self) -> usize;
    /// Number of scan lists that currently hold work.
    fn non_empty_scan_lists(&self) -> usize;
}

/// Lock-free pool of copy/scan buffers: one free list per home space plus one scan queue.
#[derive(Default)]
pub struct CopyScanBufferPool {
    free: EnumMap<HomeSpace, SegQueue<CopyScanBuffer>>,
    scan: SegQueue<CopyScanBuffer>,
    /// Buffers currently sitting in the scan queue.
    queued: AtomicUsize,
}

impl CopyScanBufferPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Donate a fresh buffer to the free list of its home space.
    pub fn add_buffer(&self, buffer: CopyScanBuffer) {
        debug_assert!(!buffer.is_scan_work_available());
        self.free[buffer.home()].push(buffer);
    }

    pub fn free_buffers(&self, home: HomeSpace) -> usize {
        self.free[home].len()
    }

    /// Discard every buffer at the end of a cycle. Returns how many were dropped.
    pub fn flush(&self) -> usize {
        let mut flushed = 0;
        for (_, list) in self.free.iter() {
            while list.pop().is_some() {
                flushed += 1;
            }
        }
        while self.scan.pop().is_some() {
            self.queued.fetch_sub(1, Ordering::Relaxed);
            flushed += 1;
        }
        debug!("Flushed {} copy/scan buffers", flushed);
        flushed
    }
}

impl BufferPool for CopyScanBufferPool {
    fn acquire(&self, home: HomeSpace) -> Option<CopyScanBuffer> {
        self.free[home].pop()
    }

    fn release(&self, mut buffer: CopyScanBuffer) {
        #[cfg(feature = "extreme_assertions")]
        buffer.assert_invariants();
        buffer.clear_scanning();
        if buffer.is_scan_work_available() || buffer.is_split_array() {
            self.queued.fetch_add(1, Ordering::Relaxed);
            self.scan.push(buffer);
        } else {
            buffer.clear();
            self.free[buffer.home()].push(buffer);
        }
    }

    fn next_scan_work(&self) -> Option<CopyScanBuffer> {
        let mut buffer = self.scan.pop()?;
        self.queued.fetch_sub(1, Ordering::Relaxed);
        buffer.set_scanning();
        Some(buffer)
    }

    fn caches_queued(&self) -> usize {
        self.queued.load(Ordering::Relaxed)
    }

    fn non_empty_scan_lists(&self) -> usize {
        usize::from(!self.scan.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::Address;
    use strum::IntoEnumIterator;

    fn buffer_at(start: usize, home: HomeSpace) -> CopyScanBuffer {
        let base = Address::from_usize(start);
        CopyScanBuffer::new(base, base + 1024usize, home)
    }

    #[test]
    fn acquire_by_home_space() {
        let pool = CopyScanBufferPool::new();
        pool.add_buffer(buffer_at(0x1_0000, HomeSpace::Nursery));
        pool.add_buffer(buffer_at(0x2_0000, HomeSpace::Tenure));
        assert!(pool.acquire(HomeSpace::InHeap).is_none());
        let tenure = pool.acquire(HomeSpace::Tenure).unwrap();
        assert_eq!(tenure.base(), Address::from_usize(0x2_0000));
        assert!(pool.acquire(HomeSpace::Tenure).is_none());
        assert_eq!(pool.free_buffers(HomeSpace::Nursery), 1);
    }

    #[test]
    fn release_routes_scan_work() {
        let pool = CopyScanBufferPool::new();
        pool.add_buffer(buffer_at(0x1_0000, HomeSpace::Nursery));
        let mut buffer = pool.acquire(HomeSpace::Nursery).unwrap();
        buffer.alloc_copy(64).unwrap();
        pool.release(buffer);
        assert_eq!(pool.caches_queued(), 1);
        assert_eq!(pool.non_empty_scan_lists(), 1);
        assert_eq!(pool.free_buffers(HomeSpace::Nursery), 0);

        let mut work = pool.next_scan_work().unwrap();
        assert!(work.is_scanning());
        assert_eq!(pool.caches_queued(), 0);
        assert_eq!(pool.non_empty_scan_lists(), 0);
        work.advance_scan(64);
        pool.release(work);
        assert_eq!(pool.free_buffers(HomeSpace::Nursery), 1);
        let again = pool.acquire(HomeSpace::Nursery).unwrap();
        assert!(!again.is_scanning());
        assert!(again.is_cleared());
    }

    #[test]
    fn released_extents_are_never_reused() {
        let pool = CopyScanBufferPool::new();
        pool.add_buffer(buffer_at(0x10_0000, HomeSpace::Tenure));
        let mut handed_out = Vec::new();
        let mut next_extent = 0x20_0000;
        for _ in 0..4 {
            let mut buffer = pool.acquire(HomeSpace::Tenure).unwrap();
            if buffer.is_cleared() {
                assert_eq!(buffer.alloc_copy(64), None);
                let base = Address::from_usize(next_extent);
                buffer.reinit(base, base + 1024usize);
                next_extent += 0x10_0000;
            }
            let survivor = buffer.alloc_copy(64).unwrap();
            assert!(!handed_out.contains(&survivor), "{} handed out twice", survivor);
            handed_out.push(survivor);
            buffer.advance_scan(64);
            pool.release(buffer);
        }
        assert_eq!(handed_out.len(), 4);
    }

    #[test]
    fn flush_discards_everything() {
        let pool = CopyScanBufferPool::new();
        pool.add_buffer(buffer_at(0x1_0000, HomeSpace::Nursery));
        pool.add_buffer(buffer_at(0x2_0000, HomeSpace::Tenure));
        let mut buffer = buffer_at(0x3_0000, HomeSpace::Nursery);
        buffer.alloc_copy(8).unwrap();
        pool.release(buffer);
        assert_eq!(pool.flush(), 3);
        assert_eq!(pool.caches_queued(), 0);
        assert!(pool.next_scan_work().is_none());
        for home in HomeSpace::iter() {
            assert_eq!(pool.free_buffers(home), 0, "{} free list not flushed", home);
        }
    }
}
