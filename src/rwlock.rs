//! C-RW-WP: a writer-preference reader-writer spinlock, grounded on the
//! `CRWWPSpinLock` used by Trinity-FC to let readers and the combiner
//! thread coexist during back-propagation.
//!
//! Readers never block each other and never take the writer mutex; they
//! only raise a per-thread indicator. A writer raises a global "writer
//! present" flag first (so new readers spin-wait instead of entering), then
//! waits for readers already inside to leave, preferring writers over a
//! continuous stream of incoming readers.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::thread_registry::MAX_THREADS;

/// One cache line per reader slot to avoid false sharing between
/// unrelated threads' indicators.
const CLPAD: usize = 8;

pub struct CRwWpLock {
    writer_present: AtomicBool,
    writer_mutex: AtomicBool,
    // [thread][CLPAD] so each reader's slot lives on its own cache line.
    readers: Box<[AtomicUsize]>,
}

impl CRwWpLock {
    pub fn new() -> Self {
        let mut readers = Vec::with_capacity(MAX_THREADS * CLPAD);
        for _ in 0..MAX_THREADS * CLPAD {
            readers.push(AtomicUsize::new(0));
        }
        CRwWpLock {
            writer_present: AtomicBool::new(false),
            writer_mutex: AtomicBool::new(false),
            readers: readers.into_boxed_slice(),
        }
    }

    #[inline]
    fn reader_slot(&self, tid: usize) -> &AtomicUsize {
        &self.readers[tid * CLPAD]
    }

    /// Enters a read-side critical section for thread `tid`.
    pub fn shared_lock(&self, tid: usize) {
        loop {
            self.reader_slot(tid).store(1, Ordering::SeqCst);
            if !self.writer_present.load(Ordering::SeqCst) {
                return;
            }
            // A writer showed up after we raised our indicator; back off
            // and let it proceed so it does not starve.
            self.reader_slot(tid).store(0, Ordering::Release);
            while self.writer_present.load(Ordering::Acquire) {
                std::hint::spin_loop();
            }
        }
    }

    pub fn shared_unlock(&self, tid: usize) {
        self.reader_slot(tid).store(0, Ordering::Release);
    }

    /// Enters the write-side critical section, blocking until no reader is
    /// active and no other writer holds the lock.
    pub fn exclusive_lock(&self) {
        while self
            .writer_mutex
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            std::hint::spin_loop();
        }
        self.writer_present.store(true, Ordering::SeqCst);
        self.wait_for_readers();
    }

    pub fn try_exclusive_lock(&self) -> bool {
        if self
            .writer_mutex
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            return false;
        }
        self.writer_present.store(true, Ordering::SeqCst);
        self.wait_for_readers();
        true
    }

    pub fn exclusive_unlock(&self) {
        self.writer_present.store(false, Ordering::Release);
        self.writer_mutex.store(false, Ordering::Release);
    }

    fn wait_for_readers(&self) {
        for tid in 0..MAX_THREADS {
            while self.reader_slot(tid).load(Ordering::SeqCst) == 1 {
                std::hint::spin_loop();
            }
        }
    }
}

impl Default for CRwWpLock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn readers_do_not_block_each_other() {
        let lock = Arc::new(CRwWpLock::new());
        lock.shared_lock(0);
        lock.shared_lock(1);
        lock.shared_unlock(0);
        lock.shared_unlock(1);
    }

    #[test]
    fn writer_excludes_readers() {
        let lock = Arc::new(CRwWpLock::new());
        let counter = Arc::new(AtomicUsize::new(0));

        let l2 = lock.clone();
        let c2 = counter.clone();
        let writer = std::thread::spawn(move || {
            for _ in 0..1000 {
                l2.exclusive_lock();
                let before = c2.load(Ordering::Relaxed);
                c2.store(before + 1, Ordering::Relaxed);
                l2.exclusive_unlock();
            }
        });
        writer.join().unwrap();
        assert_eq!(counter.load(Ordering::Relaxed), 1000);
    }
}
