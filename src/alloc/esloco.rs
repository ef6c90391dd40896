//! EsLoco: a simple persistent free-list allocator, grounded on `EsLoco<P>`
//! in `TrinityFC.hpp`. Used by Trinity-FC.
//!
//! Blocks are binned by power-of-two size class into `MAX_BLOCK_SIZE` free
//! lists. Freeing links a block intrusively through its header onto the
//! matching free list; allocation pops from that list or, if empty, bumps
//! the pool-top pointer. Pool-top and each free-list head live on their own
//! cache line (128-byte aligned, exceeding one cache line as the original's
//! `aligned()` helper does) so unrelated threads' CAS loops don't collide.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::Error;
use crate::ll::{pfence, pwb_range};

use super::{size_class_for, BlockHeader, MAX_BLOCK_SIZE};

/// Sentinel meaning "no block" in a free-list head or a block's `next`.
const NIL: u64 = u64::MAX;

#[repr(align(128))]
struct Aligned<T>(T);

/// A free-list allocator operating over an arena of `arena_size` bytes
/// starting at `base`. `base` and `arena_size` are supplied by the owning
/// runtime, which carves the arena out of its mapped region past the
/// runtime's own header and root table.
pub struct EsLoco {
    base: *mut u8,
    arena_size: u64,
    pool_top: Aligned<AtomicU64>,
    free_lists: [Aligned<AtomicU64>; MAX_BLOCK_SIZE],
}

unsafe impl Send for EsLoco {}
unsafe impl Sync for EsLoco {}

impl EsLoco {
    /// Initializes a fresh, empty arena.
    ///
    /// # Safety
    /// `base` must point to at least `arena_size` writable bytes, valid for
    /// the lifetime of this allocator and not aliased by anything else.
    pub unsafe fn init(base: *mut u8, arena_size: u64) -> Self {
        EsLoco {
            base,
            arena_size,
            pool_top: Aligned(AtomicU64::new(0)),
            free_lists: std::array::from_fn(|_| Aligned(AtomicU64::new(NIL))),
        }
    }

    /// Re-attaches to an arena previously initialized by [`EsLoco::init`],
    /// restoring `pool_top` and free-list heads from their persisted
    /// values recorded in the runtime's header.
    ///
    /// # Safety
    /// Same requirements as [`EsLoco::init`]; `pool_top`/`free_lists` must
    /// be values this allocator (or a crashed predecessor, post-recovery)
    /// actually produced.
    pub unsafe fn attach(
        base: *mut u8,
        arena_size: u64,
        pool_top: u64,
        free_lists: [u64; MAX_BLOCK_SIZE],
    ) -> Self {
        EsLoco {
            base,
            arena_size,
            pool_top: Aligned(AtomicU64::new(pool_top)),
            free_lists: std::array::from_fn(|i| Aligned(AtomicU64::new(free_lists[i]))),
        }
    }

    pub fn pool_top(&self) -> u64 {
        self.pool_top.0.load(Ordering::Acquire)
    }

    pub fn free_list_heads(&self) -> [u64; MAX_BLOCK_SIZE] {
        std::array::from_fn(|i| self.free_lists[i].0.load(Ordering::Acquire))
    }

    pub(crate) unsafe fn header_at(&self, off: u64) -> *mut BlockHeader {
        self.base.add(off as usize) as *mut BlockHeader
    }

    /// Bumps the shared pool-top by `bytes` without writing a block header;
    /// used by `EsLoco2` to carve whole slabs rather than individual
    /// blocks.
    pub(crate) fn bump_pool_top(&self, bytes: u64) -> Result<u64, Error> {
        loop {
            let top = self.pool_top.0.load(Ordering::Acquire);
            let new_top = top + bytes;
            if new_top > self.arena_size {
                return Err(Error::OutOfMemory);
            }
            if self
                .pool_top
                .0
                .compare_exchange(top, new_top, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return Ok(top);
            }
        }
    }

    /// Splices an already-linked chain `head..=tail` (linked via each
    /// block's `next` field) onto the shared free list for `class` in one
    /// CAS. Used by `EsLoco2` to migrate a drained thread-local free list.
    ///
    /// # Safety
    /// `head..=tail` must already form a valid intrusive chain and `tail`'s
    /// header must belong to size class `class`.
    pub(crate) unsafe fn splice_free_list(&self, class: usize, head: u64, tail: u64) {
        loop {
            let global_head = self.free_lists[class].0.load(Ordering::Acquire);
            let tail_hdr = self.header_at(tail);
            (*tail_hdr).next = global_head;
            pwb_range(tail_hdr as usize, std::mem::size_of::<BlockHeader>());
            pfence();
            if self.free_lists[class]
                .0
                .compare_exchange(global_head, head, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return;
            }
        }
    }

    /// Allocates at least `bytes` usable bytes, returning the arena-relative
    /// offset of the usable region, just past the block's header.
    pub fn malloc(&self, bytes: usize) -> Result<u64, Error> {
        let class = size_class_for(bytes);
        if class >= MAX_BLOCK_SIZE {
            return Err(Error::OutOfMemory);
        }
        let block_size = 1u64 << class;

        loop {
            let head = self.free_lists[class].0.load(Ordering::Acquire);
            if head == NIL {
                break;
            }
            let next = unsafe { (*self.header_at(head)).next };
            if self.free_lists[class]
                .0
                .compare_exchange(head, next, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return Ok(head + std::mem::size_of::<BlockHeader>() as u64);
            }
        }

        loop {
            let top = self.pool_top.0.load(Ordering::Acquire);
            let new_top = top + block_size;
            if new_top > self.arena_size {
                return Err(Error::OutOfMemory);
            }
            if self
                .pool_top
                .0
                .compare_exchange(top, new_top, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                unsafe {
                    let hdr = self.header_at(top);
                    (*hdr).size_class = class as u64;
                    pwb_range(hdr as usize, std::mem::size_of::<BlockHeader>());
                    pfence();
                }
                return Ok(top + std::mem::size_of::<BlockHeader>() as u64);
            }
        }
    }

    /// Returns a block previously handed out by [`EsLoco::malloc`] to its
    /// size class's free list.
    ///
    /// # Safety
    /// `offset` must have been returned by `malloc` on this allocator and
    /// not already freed; nothing may still reference it.
    pub unsafe fn free(&self, offset: u64) {
        let hdr_off = offset - std::mem::size_of::<BlockHeader>() as u64;
        let hdr = self.header_at(hdr_off);
        let class = (*hdr).size_class as usize;
        loop {
            let head = self.free_lists[class].0.load(Ordering::Acquire);
            (*hdr).next = head;
            pwb_range(hdr as usize, std::mem::size_of::<BlockHeader>());
            pfence();
            if self.free_lists[class]
                .0
                .compare_exchange(head, hdr_off, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return;
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn alloc_and_free_reuses_block() {
        let mut arena = vec![0u8; 1 << 20];
        let alloc = unsafe { EsLoco::init(arena.as_mut_ptr(), arena.len() as u64) };
        let a = alloc.malloc(64).unwrap();
        unsafe { alloc.free(a) };
        let b = alloc.malloc(64).unwrap();
        assert_eq!(a, b, "freed block should be reused for an equal-size request");
    }

    #[test]
    fn distinct_live_allocations_do_not_overlap() {
        let mut arena = vec![0u8; 1 << 20];
        let alloc = unsafe { EsLoco::init(arena.as_mut_ptr(), arena.len() as u64) };
        let a = alloc.malloc(64).unwrap();
        let b = alloc.malloc(64).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn exhaustion_returns_out_of_memory() {
        let mut arena = vec![0u8; 256];
        let alloc = unsafe { EsLoco::init(arena.as_mut_ptr(), arena.len() as u64) };
        let mut count = 0;
        while alloc.malloc(32).is_ok() {
            count += 1;
            if count > 1000 {
                panic!("allocator never exhausted");
            }
        }
    }
}
