extern crate concgc;

use concgc::RwSpinlock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

#[test]
fn writers_are_exclusive() {
    const THREADS: usize = 4;
    const ITERATIONS: usize = 10_000;

    let lock = Arc::new(RwSpinlock::new((0usize, 0usize), 16));
    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let lock = lock.clone();
            thread::spawn(move || {
                for i in 0..ITERATIONS {
                    if i % 4 == 0 {
                        let mut pair = lock.write();
                        pair.0 += 1;
                        pair.1 += 1;
                    } else {
                        let pair = lock.read();
                        assert_eq!(pair.0, pair.1);
                    }
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(*lock.read(), (THREADS * ITERATIONS / 4, THREADS * ITERATIONS / 4));
    assert!(lock.teardown().is_ok());
}

#[test]
fn readers_share_the_lock() {
    let lock = Arc::new(RwSpinlock::new(7, 16));
    let first = lock.read();
    let second = lock.read();
    assert_eq!(lock.state().readers, 2);
    assert!(!lock.try_enter_write());
    assert_eq!(*first + *second, 14);
    drop(first);
    drop(second);
    assert!(lock.teardown().is_ok());
}

#[test]
fn waiting_writer_blocks_new_readers() {
    let lock = Arc::new(RwSpinlock::new(0u32, 16));
    let reader = lock.read();
    let acquired = Arc::new(AtomicBool::new(false));

    let writer = {
        let lock = lock.clone();
        let acquired = acquired.clone();
        thread::spawn(move || {
            *lock.write() = 1;
            acquired.store(true, Ordering::SeqCst);
        })
    };

    while lock.state().waiting_writers == 0 && !acquired.load(Ordering::SeqCst) {
        thread::yield_now();
    }
    assert!(!acquired.load(Ordering::SeqCst));
    assert!(!lock.try_enter_read());

    drop(reader);
    writer.join().unwrap();
    assert_eq!(*lock.read(), 1);
}
