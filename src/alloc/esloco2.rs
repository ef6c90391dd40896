//! EsLoco2: EsLoco plus per-thread slabs, grounded on
//! `TLData`/`ThreadFreeList`/`ELMetadata` in `TrinityTL2.hpp`. Used by
//! Trinity-TL2 and Trinity-VR-TL2, whose higher commit rate makes a single
//! shared free list and pool-top a contention point EsLoco alone doesn't
//! have to deal with.
//!
//! Each registered thread bump-allocates out of its own [`SLAB_SIZE`]-byte
//! slab (refilled from the shared pool-top on exhaustion) and keeps a small
//! thread-local free list per size class; once a thread-local free list
//! exceeds [`MIGRATE_THRESHOLD`] entries it is spliced wholesale onto the
//! shared `EsLoco` free list for that class, exactly as `ThreadFreeList::
//! flush()` does in the original.

use std::cell::UnsafeCell;

use crate::error::Error;
use crate::ll::{pfence, pwb_range};
use crate::thread_registry::MAX_THREADS;

use super::esloco::EsLoco;
use super::{size_class_for, BlockHeader, MAX_BLOCK_SIZE};

/// Per-thread slab size: a few MB bump-allocated from the shared pool-top
/// before falling back to the global allocator again.
pub const SLAB_SIZE: u64 = 4 * 1024 * 1024;

/// Thread-local free-list entries accumulated before migrating to the
/// shared `EsLoco` free list for that size class.
pub const MIGRATE_THRESHOLD: usize = 64;

const NIL: u64 = u64::MAX;
const HEADER_SIZE: u64 = std::mem::size_of::<BlockHeader>() as u64;

struct LocalFreeList {
    head: u64,
    tail: u64,
    len: usize,
}

impl LocalFreeList {
    fn new() -> Self {
        LocalFreeList {
            head: NIL,
            tail: NIL,
            len: 0,
        }
    }
}

struct ThreadLocalState {
    slab_base: u64,
    slab_remaining: u64,
    free_lists: [LocalFreeList; MAX_BLOCK_SIZE],
}

impl ThreadLocalState {
    fn new() -> Self {
        ThreadLocalState {
            slab_base: 0,
            slab_remaining: 0,
            free_lists: std::array::from_fn(|_| LocalFreeList::new()),
        }
    }
}

/// A per-thread-slab allocator layered on top of [`EsLoco`]'s shared
/// pool-top and free lists.
pub struct EsLoco2 {
    shared: EsLoco,
    threads: Box<[UnsafeCell<ThreadLocalState>]>,
}

unsafe impl Send for EsLoco2 {}
unsafe impl Sync for EsLoco2 {}

impl EsLoco2 {
    /// # Safety
    /// Same requirements as [`EsLoco::init`].
    pub unsafe fn init(base: *mut u8, arena_size: u64) -> Self {
        EsLoco2 {
            shared: EsLoco::init(base, arena_size),
            threads: (0..MAX_THREADS)
                .map(|_| UnsafeCell::new(ThreadLocalState::new()))
                .collect(),
        }
    }

    /// Re-attaches to an arena previously initialized by [`EsLoco2::init`],
    /// restoring the shared pool-top from its persisted value. Per-thread
    /// slabs and free lists are not persisted (see `EsLoco::attach`'s doc
    /// for the same tradeoff on the shared free lists), so every thread
    /// starts fresh and slabs not yet fully handed out before the crash are
    /// abandoned rather than reclaimed.
    ///
    /// # Safety
    /// Same requirements as [`EsLoco2::init`]; `pool_top` must be a value
    /// this allocator (or a crashed predecessor) actually produced.
    pub unsafe fn attach(base: *mut u8, arena_size: u64, pool_top: u64) -> Self {
        EsLoco2 {
            shared: EsLoco::attach(base, arena_size, pool_top, [u64::MAX; MAX_BLOCK_SIZE]),
            threads: (0..MAX_THREADS)
                .map(|_| UnsafeCell::new(ThreadLocalState::new()))
                .collect(),
        }
    }

    pub fn pool_top(&self) -> u64 {
        self.shared.pool_top()
    }

    /// # Safety
    /// `tid` must be a slot this thread currently owns (see
    /// [`crate::thread_registry::ThreadSlot`]); no other thread may call
    /// `malloc`/`free` with the same `tid` concurrently.
    pub unsafe fn malloc(&self, tid: usize, bytes: usize) -> Result<u64, Error> {
        let class = size_class_for(bytes);
        if class >= MAX_BLOCK_SIZE {
            return Err(Error::OutOfMemory);
        }
        let block_size = 1u64 << class;
        let state = &mut *self.threads[tid].get();

        if let Some(block_off) = self.pop_local(state, class) {
            return Ok(block_off + HEADER_SIZE);
        }

        if state.slab_remaining < block_size {
            let slab_bytes = SLAB_SIZE.max(block_size);
            state.slab_base = self.shared.bump_pool_top(slab_bytes)?;
            state.slab_remaining = slab_bytes;
        }

        let off = state.slab_base;
        state.slab_base += block_size;
        state.slab_remaining -= block_size;

        let hdr = self.shared.header_at(off);
        (*hdr).size_class = class as u64;
        pwb_range(hdr as usize, HEADER_SIZE as usize);
        pfence();
        Ok(off + HEADER_SIZE)
    }

    /// # Safety
    /// `offset` must have come from `malloc` on this allocator and not
    /// already be freed; `tid` must be the calling thread's owned slot.
    pub unsafe fn free(&self, tid: usize, offset: u64) {
        let hdr_off = offset - HEADER_SIZE;
        let hdr = self.shared.header_at(hdr_off);
        let class = (*hdr).size_class as usize;
        let state = &mut *self.threads[tid].get();

        let local = &mut state.free_lists[class];
        (*hdr).next = local.head;
        pwb_range(hdr as usize, HEADER_SIZE as usize);
        pfence();
        local.head = hdr_off;
        if local.tail == NIL {
            local.tail = hdr_off;
        }
        local.len += 1;

        if local.len > MIGRATE_THRESHOLD {
            self.shared.splice_free_list(class, local.head, local.tail);
            *local = LocalFreeList::new();
        }
    }

    unsafe fn pop_local(&self, state: &mut ThreadLocalState, class: usize) -> Option<u64> {
        let local = &mut state.free_lists[class];
        if local.head == NIL {
            return None;
        }
        let off = local.head;
        let next = (*self.shared.header_at(off)).next;
        local.head = next;
        local.len -= 1;
        if local.head == NIL {
            local.tail = NIL;
        }
        Some(off)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn per_thread_alloc_and_free() {
        let mut arena = vec![0u8; 8 * 1024 * 1024];
        let alloc = unsafe { EsLoco2::init(arena.as_mut_ptr(), arena.len() as u64) };
        unsafe {
            let a = alloc.malloc(0, 64).unwrap();
            let b = alloc.malloc(1, 64).unwrap();
            assert_ne!(a, b);
            alloc.free(0, a);
            let c = alloc.malloc(0, 64).unwrap();
            assert_eq!(a, c, "freed block should be reused by the same thread");
        }
    }

    #[test]
    fn migration_threshold_does_not_corrupt_state() {
        let mut arena = vec![0u8; 8 * 1024 * 1024];
        let alloc = unsafe { EsLoco2::init(arena.as_mut_ptr(), arena.len() as u64) };
        unsafe {
            let mut allocs = Vec::new();
            for _ in 0..(MIGRATE_THRESHOLD + 10) {
                allocs.push(alloc.malloc(0, 32).unwrap());
            }
            for off in allocs {
                alloc.free(0, off);
            }
            // After crossing the migration threshold, allocation must still
            // succeed (either from the migrated global list or a fresh
            // slab carve).
            alloc.malloc(0, 32).unwrap();
        }
    }
}
