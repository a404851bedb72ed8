//! A writer-priority reader/writer spin lock.
//!
//! The whole lock lives in one `u32` word, manipulated only with compare-and-swap:
//!
//! ```text
//!  31            16 15             1   0
//! +----------------+----------------+----+
//! | waiting writers|    readers     |mode|
//! +----------------+----------------+----+
//! ```
//!
//! `mode` is 0 in reader mode (unlocked, or held by `readers` readers) and 1 while a writer holds
//! the lock. A reader is only admitted by a CAS that expects reader mode *and* zero waiting
//! writers, so as soon as a writer registers as waiting, new readers spin until the writers are
//! done. Writers are not ordered among themselves. Nobody ever parks: contention degrades into
//! busy-waiting and yielding.

use crate::util::error::InitError;
use crate::util::options::Options;
use std::cell::UnsafeCell;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU32, Ordering};

const MODE_WRITER: u32 = 1;
const READER_SHIFT: u32 = 1;
const READER_BITS: u32 = 15;
const READER_UNIT: u32 = 1 << READER_SHIFT;
const READER_MASK: u32 = ((1 << READER_BITS) - 1) << READER_SHIFT;
const WAITER_SHIFT: u32 = READER_SHIFT + READER_BITS;
const WAITER_UNIT: u32 = 1 << WAITER_SHIFT;
const WAITER_MASK: u32 = !(MODE_WRITER | READER_MASK);

const_assert_eq!(WAITER_SHIFT, 16);
const_assert_eq!(MODE_WRITER & READER_MASK, 0);
const_assert_eq!(WAITER_MASK & READER_MASK, 0);

/// Whether the lock word is in reader mode or held by a writer.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LockMode {
    Reader,
    Writer,
}

/// The unpacked lock word.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct LockState {
    pub mode: LockMode,
    pub readers: u32,
    pub waiting_writers: u32,
}

impl LockState {
    pub const UNLOCKED: LockState = LockState {
        mode: LockMode::Reader,
        readers: 0,
        waiting_writers: 0,
    };

    pub fn unpack(word: u32) -> Self {
        LockState {
            mode: if word & MODE_WRITER != 0 {
                LockMode::Writer
            } else {
                LockMode::Reader
            },
            readers: (word & READER_MASK) >> READER_SHIFT,
            waiting_writers: word >> WAITER_SHIFT,
        }
    }

    pub fn pack(&self) -> u32 {
        debug_assert!(self.readers < (1 << READER_BITS));
        debug_assert!(self.readers == 0 || self.mode == LockMode::Reader);
        let mode = match self.mode {
            LockMode::Reader => 0,
            LockMode::Writer => MODE_WRITER,
        };
        mode | (self.readers << READER_SHIFT) | (self.waiting_writers << WAITER_SHIFT)
    }
}

/// A reader/writer spin lock protecting a value of type `T`.
///
/// Use [`read`](RwSpinlock::read) and [`write`](RwSpinlock::write) to get RAII guards. The raw
/// `enter_*`/`exit_*` operations are also exposed for callers that pair them manually.
pub struct RwSpinlock<T: ?Sized = ()> {
    state: AtomicU32,
    spin_count: usize,
    data: UnsafeCell<T>,
}

unsafe impl<T: ?Sized + Send> Send for RwSpinlock<T> {}
unsafe impl<T: ?Sized + Send + Sync> Sync for RwSpinlock<T> {}

impl<T> RwSpinlock<T> {
    /// Create an unlocked lock. `spin_count` is the number of busy-wait iterations between
    /// yields while the lock is contended.
    pub fn new(data: T, spin_count: usize) -> Self {
        RwSpinlock {
            state: AtomicU32::new(0),
            spin_count: spin_count.max(1),
            data: UnsafeCell::new(data),
        }
    }

    pub fn from_options(data: T, options: &Options) -> Self {
        Self::new(data, options.rw_spin_count)
    }

    /// Consume the lock, returning the protected value.
    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: ?Sized> RwSpinlock<T> {
    fn spin(&self) {
        for _ in 0..self.spin_count {
            std::hint::spin_loop();
        }
        std::thread::yield_now();
    }

    /// Try once to admit a reader. Fails if a writer holds the lock, if any writer is waiting,
    /// or if another thread changed the word concurrently.
    pub fn try_enter_read(&self) -> bool {
        // Expect reader mode and no waiting writers: any other state makes the CAS fail.
        let readers = self.state.load(Ordering::Relaxed) & READER_MASK;
        self.state
            .compare_exchange_weak(
                readers,
                readers + READER_UNIT,
                Ordering::Acquire,
                Ordering::Relaxed,
            )
            .is_ok()
    }

    /// Acquire the lock for reading, spinning while a writer holds or waits for it.
    pub fn enter_read(&self) {
        while !self.try_enter_read() {
            self.spin();
        }
    }

    /// Release a read hold.
    ///
    /// # Safety
    /// The caller must hold the lock for reading (a matching [`enter_read`](RwSpinlock::enter_read)).
    pub unsafe fn exit_read(&self) {
        let mut current = self.state.load(Ordering::Relaxed);
        loop {
            debug_assert!(current & READER_MASK != 0, "exit_read without readers");
            debug_assert!(current & MODE_WRITER == 0);
            match self.state.compare_exchange_weak(
                current,
                current - READER_UNIT,
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }

    /// Try once to take the lock for writing from the fully unlocked state.
    pub fn try_enter_write(&self) -> bool {
        self.state
            .compare_exchange(0, MODE_WRITER, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    /// Acquire the lock for writing. If the fast path fails, register as a waiting writer (which
    /// stops new readers from being admitted) and spin until the readers have drained.
    pub fn enter_write(&self) {
        if self.try_enter_write() {
            return;
        }
        self.state.fetch_add(WAITER_UNIT, Ordering::Relaxed);
        loop {
            let current = self.state.load(Ordering::Relaxed);
            if current & (MODE_WRITER | READER_MASK) == 0
                && self
                    .state
                    .compare_exchange_weak(
                        current,
                        (current - WAITER_UNIT) | MODE_WRITER,
                        Ordering::Acquire,
                        Ordering::Relaxed,
                    )
                    .is_ok()
            {
                return;
            }
            self.spin();
        }
    }

    /// Release the write hold, returning the word to reader mode.
    ///
    /// # Safety
    /// The caller must hold the lock for writing (a matching [`enter_write`](RwSpinlock::enter_write)).
    pub unsafe fn exit_write(&self) {
        let mut current = self.state.load(Ordering::Relaxed);
        loop {
            debug_assert!(current & MODE_WRITER != 0, "exit_write without a writer");
            match self.state.compare_exchange_weak(
                current,
                current & !MODE_WRITER,
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }

    /// Lock for reading.
    pub fn read(&self) -> RwSpinlockReadGuard<'_, T> {
        self.enter_read();
        RwSpinlockReadGuard { lock: self }
    }

    /// Lock for writing.
    pub fn write(&self) -> RwSpinlockWriteGuard<'_, T> {
        self.enter_write();
        RwSpinlockWriteGuard { lock: self }
    }

    /// A snapshot of the lock word. Only meaningful for diagnostics and tests.
    pub fn state(&self) -> LockState {
        LockState::unpack(self.state.load(Ordering::Relaxed))
    }

    /// Mutable access without locking; the borrow checker proves exclusivity.
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }

    /// Check the lock is released before it is destroyed.
    pub fn teardown(&self) -> Result<(), InitError> {
        let state = self.state.load(Ordering::Acquire);
        if state == 0 {
            Ok(())
        } else {
            Err(InitError::LockHeld { state })
        }
    }
}

impl<T: Default> Default for RwSpinlock<T> {
    fn default() -> Self {
        Self::new(T::default(), crate::util::options::DEFAULT_RW_SPIN_COUNT)
    }
}

pub struct RwSpinlockReadGuard<'a, T: ?Sized> {
    lock: &'a RwSpinlock<T>,
}

impl<T: ?Sized> Deref for RwSpinlockReadGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> Drop for RwSpinlockReadGuard<'_, T> {
    fn drop(&mut self) {
        unsafe { self.lock.exit_read() }
    }
}

pub struct RwSpinlockWriteGuard<'a, T: ?Sized> {
    lock: &'a RwSpinlock<T>,
}

impl<T: ?Sized> Deref for RwSpinlockWriteGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> DerefMut for RwSpinlockWriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T: ?Sized> Drop for RwSpinlockWriteGuard<'_, T> {
    fn drop(&mut self) {
        unsafe { self.lock.exit_write() }
    }
}
