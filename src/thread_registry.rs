//! Wait-free bounded thread registration, grounded on the original's
//! `ThreadRegistry`/`ThreadCheckInCheckOut`.
//!
//! Each runtime instance owns one `ThreadRegistry`. A thread calls
//! [`ThreadRegistry::register`] once (typically lazily, via a thread-local)
//! to obtain a [`ThreadSlot`] guard holding its tid in `0..MAX_THREADS`; the
//! slot is released automatically when the guard drops, e.g. on thread
//! exit.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Upper bound on concurrently registered threads, matching
/// `REGISTRY_MAX_THREADS` in the original.
pub const MAX_THREADS: usize = 128;

/// Bounded, wait-free thread-id allocator.
pub struct ThreadRegistry {
    used: [AtomicBool; MAX_THREADS],
    max_tid: AtomicUsize,
}

impl ThreadRegistry {
    pub const fn new() -> Self {
        // AtomicBool::new(false) is not const-generic-friendly across an
        // array literal without Copy, so build it via a const fn helper.
        #[allow(clippy::declare_interior_mutable_const)]
        const FALSE: AtomicBool = AtomicBool::new(false);
        ThreadRegistry {
            used: [FALSE; MAX_THREADS],
            max_tid: AtomicUsize::new(0),
        }
    }

    /// Claims the lowest free slot, or returns `None` if all `MAX_THREADS`
    /// slots are taken.
    pub fn register(&self) -> Option<ThreadSlot<'_>> {
        for tid in 0..MAX_THREADS {
            if self.used[tid]
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                let mut cur = self.max_tid.load(Ordering::Relaxed);
                while cur <= tid {
                    match self.max_tid.compare_exchange_weak(
                        cur,
                        tid + 1,
                        Ordering::AcqRel,
                        Ordering::Relaxed,
                    ) {
                        Ok(_) => break,
                        Err(v) => cur = v,
                    }
                }
                return Some(ThreadSlot { registry: self, tid });
            }
        }
        None
    }

    /// One past the highest tid ever registered; recovery and iteration
    /// loops use this as their upper bound instead of `MAX_THREADS`.
    pub fn max_tid(&self) -> usize {
        self.max_tid.load(Ordering::Acquire)
    }
}

impl Default for ThreadRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII handle to a registered thread slot; releases the slot on drop.
pub struct ThreadSlot<'a> {
    registry: &'a ThreadRegistry,
    tid: usize,
}

impl ThreadSlot<'_> {
    pub fn tid(&self) -> usize {
        self.tid
    }
}

impl Drop for ThreadSlot<'_> {
    fn drop(&mut self) {
        self.registry.used[self.tid].store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn register_and_release() {
        let reg = ThreadRegistry::new();
        let a = reg.register().unwrap();
        let b = reg.register().unwrap();
        assert_ne!(a.tid(), b.tid());
        assert_eq!(reg.max_tid(), 2);
        drop(a);
        let c = reg.register().unwrap();
        assert_eq!(c.tid(), 0);
    }

    #[test]
    fn exhaustion() {
        let reg = ThreadRegistry::new();
        let mut slots = Vec::new();
        for _ in 0..MAX_THREADS {
            slots.push(reg.register().unwrap());
        }
        assert!(reg.register().is_none());
    }

    #[test]
    fn concurrent_registration_is_unique() {
        use std::sync::Arc;
        let reg = Arc::new(ThreadRegistry::new());
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let reg = reg.clone();
                std::thread::spawn(move || reg.register().unwrap().tid())
            })
            .collect();
        let mut tids: Vec<usize> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        tids.sort_unstable();
        tids.dedup();
        assert_eq!(tids.len(), 16);
    }
}
