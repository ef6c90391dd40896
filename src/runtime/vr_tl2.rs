//! Trinity-VR-TL2: the volatile-replica variant of Trinity-TL2, grounded on
//! `TrinityVRTL2.hpp`. Two differences from plain Trinity-TL2:
//!
//! * Reads go through a **volatile replica (VR)** — a DRAM mirror of every
//!   cell's live value, mapped at its own fixed address, at the same
//!   relative offset as its persistent-memory counterpart. Real PM has
//!   higher read latency than DRAM, so this buys read-mostly workloads a
//!   cheaper hot path; a crash loses nothing since PM's `main` stays
//!   authoritative.
//! * Locking is **external and volatile**: a small striped lock table
//!   (hashed by cache-line address, i.e. by *range*, not by individual
//!   cell) replaces the lock bit Trinity-TL2 packs into its cell's version
//!   word, so acquiring a lock never dirties a persistent cache line.
//!   Writes are buffered and applied at commit, once every touched range's
//!   stripe is held — locked in address order to avoid deadlock between
//!   concurrent commits touching overlapping ranges.

use std::marker::PhantomData;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::alloc::esloco2::EsLoco2;
use crate::cell::{PersistentCell, Word};
use crate::error::Error;
use crate::ll::{pfence, psync, pwb_range};
use crate::region::{map_fixed, map_fixed_anon, Region};
use crate::roots::{check_index, MAX_ROOT_POINTERS};
use crate::runtime::{catch_abort, AbortSignal, Runtime};
use crate::stat::Stats;
use crate::thread_registry::{ThreadRegistry, MAX_THREADS};

pub const REGION_BASE: usize = 0x7fec_0000_0000;
pub const REGION_SIZE: usize = 1 << 30;
/// Fixed address for the volatile replica; must not overlap any runtime's
/// persistent region.
pub const VR_BASE: usize = 0x7fed_0000_0000;

const MAGIC: u64 = 0x5472_696e_5f56_5232; // "Trin_VR2"

/// Number of stripes in the volatile lock table. A power of two so hashing
/// is a mask, not a modulo.
const STRIPE_COUNT: usize = 4096;
const CACHE_LINE_SIZE: u64 = 64;

/// `tseq` carries the owning thread's id alongside its version, the same
/// way Trinity-TL2's `lseq` carries a tid next to its lock bit — without a
/// lock bit, since locking here lives in the runtime's volatile stripe
/// table instead of the cell itself.
const TID_BITS: u32 = 7;
const TID_SHIFT: u32 = 64 - TID_BITS;
const TID_MASK: u64 = ((1u64 << TID_BITS) - 1) << TID_SHIFT;
const SEQ_MASK: u64 = (1u64 << TID_SHIFT) - 1;

#[inline]
fn compose_tseq(tid: usize, seq: u64) -> u64 {
    (((tid as u64) << TID_SHIFT) & TID_MASK) | (seq & SEQ_MASK)
}

#[inline]
fn tseq_tid(v: u64) -> usize {
    ((v & TID_MASK) >> TID_SHIFT) as usize
}

#[inline]
fn tseq_seq(v: u64) -> u64 {
    v & SEQ_MASK
}

#[repr(C)]
struct Header {
    magic: AtomicU64,
    gclock: AtomicU64,
    p_seq: [AtomicU64; MAX_THREADS],
    /// Root-pointer slots, stored as ordinary `Cell<u64>`s so a root write
    /// goes through the same buffered/stripe-locked commit path as any
    /// other write.
    roots: [Cell<u64>; MAX_ROOT_POINTERS],
    esloco_pool_top: AtomicU64,
}

const ARENA_OFFSET: usize = std::mem::size_of::<Header>();
const CELL_STRIDE: usize = std::mem::size_of::<Cell<u64>>();

/// A Trinity-VR-TL2 persistent cell: `main`/`back` plus a version number
/// tagged with its writer's tid (`tseq`) — no lock bit, since locking lives
/// in the runtime's volatile stripe table instead.
#[repr(C)]
pub struct Cell<T> {
    main: AtomicU64,
    back: AtomicU64,
    tseq: AtomicU64,
    _marker: PhantomData<T>,
}

impl<T: Word> Cell<T> {
    pub fn new(init: T) -> Self {
        Cell {
            main: AtomicU64::new(init.to_u64()),
            back: AtomicU64::new(0),
            tseq: AtomicU64::new(0),
            _marker: PhantomData,
        }
    }

    fn addr(&self) -> usize {
        self as *const _ as usize
    }

    /// Restores a cell from an interrupted commit. `tseq`'s tag is the tid
    /// that last touched this cell and the version it tentatively wrote
    /// under; if that version still matches `owner_p_seq(tid)` the owning
    /// thread never reached its durability point, so the write never
    /// became durable and `main` rolls back to `back`. Otherwise the
    /// owner's `p_seq` already moved past this write (it was confirmed
    /// before the crash) and `back` is brought forward to match `main`
    /// instead — a no-op for cells untouched since the last recovery.
    ///
    /// # Safety
    /// Must only run during single-threaded recovery before any
    /// transaction begins.
    pub unsafe fn recover(&self, owner_p_seq: impl Fn(usize) -> u64) {
        let raw = self.tseq.load(Ordering::Relaxed);
        let tid = tseq_tid(raw);
        let seq = tseq_seq(raw);
        if seq == owner_p_seq(tid) {
            self.main.store(self.back.load(Ordering::Relaxed), Ordering::Relaxed);
        } else {
            self.back.store(self.main.load(Ordering::Relaxed), Ordering::Relaxed);
        }
        self.tseq.store(0, Ordering::Relaxed);
        pwb_range(self as *const _ as usize, std::mem::size_of::<Self>());
    }
}

/// Scans the header's root slots plus the whole arena in cell-sized
/// strides, resolving any write a crash left unconfirmed, then rebuilds the
/// volatile replica from the now-consistent `main` words — the replica
/// itself lives in anonymous memory and does not survive a restart.
fn recover_all(header: *mut Header, arena_base: *mut u8, arena_size: u64, vr_base: *mut u8, pm_base: usize) {
    let owner_p_seq = |tid: usize| unsafe { (*header).p_seq[tid].load(Ordering::Relaxed) };
    unsafe {
        for cell in &(*header).roots {
            cell.recover(owner_p_seq);
        }
    }
    let count = (arena_size as usize) / CELL_STRIDE;
    for i in 0..count {
        let cell = unsafe { &*(arena_base.add(i * CELL_STRIDE) as *const Cell<u64>) };
        unsafe { cell.recover(owner_p_seq) };
    }
    pfence();

    unsafe {
        for cell in &(*header).roots {
            let off = cell as *const _ as usize - pm_base;
            let slot = &*(vr_base.add(off) as *const AtomicU64);
            slot.store(cell.main.load(Ordering::Relaxed), Ordering::Relaxed);
        }
        for i in 0..count {
            let cell = &*(arena_base.add(i * CELL_STRIDE) as *const Cell<u64>);
            let off = cell as *const _ as usize - pm_base;
            let slot = &*(vr_base.add(off) as *const AtomicU64);
            slot.store(cell.main.load(Ordering::Relaxed), Ordering::Relaxed);
        }
    }

    let max_p_seq = unsafe {
        (*header)
            .p_seq
            .iter()
            .map(|s| s.load(Ordering::Relaxed))
            .max()
            .unwrap_or(1)
    };
    unsafe { (*header).gclock.store(max_p_seq, Ordering::Relaxed) };
}

struct WriteEntry {
    cell_addr: usize,
    value: u64,
}

struct ReadEntry {
    cell_addr: usize,
    tseq_seen: u64,
}

#[inline]
fn stripe_of(addr: usize) -> usize {
    ((addr as u64 / CACHE_LINE_SIZE) as usize) & (STRIPE_COUNT - 1)
}

/// Transaction context for a Trinity-VR-TL2 write transaction.
pub struct VrTl2Tx<'a> {
    runtime: &'a VrTl2Runtime,
    tid: usize,
    rv: u64,
    /// Tentative write tag: this thread's id plus its read-version, stamped
    /// on every cell this transaction writes before the commit point is
    /// durable. Recovery tells a tentative write apart from a confirmed one
    /// by comparing this tag's version against the owner's `p_seq`.
    p_tseq: u64,
    write_set: Vec<WriteEntry>,
    read_set: Vec<ReadEntry>,
}

impl<'a> VrTl2Tx<'a> {
    pub fn malloc(&mut self, bytes: usize) -> Result<u64, Error> {
        self.runtime.tm_malloc(self, bytes)
    }

    fn find_write(&self, addr: usize) -> Option<usize> {
        self.write_set.iter().position(|e| e.cell_addr == addr)
    }

    fn abort(&self) -> ! {
        std::panic::panic_any(AbortSignal);
    }

    fn read_cell(&mut self, cell: &Cell<impl Word>) -> u64 {
        let addr = cell.addr();
        if let Some(idx) = self.find_write(addr) {
            return self.write_set[idx].value;
        }
        // Spin briefly on the stripe; a held stripe means some commit is
        // applying writes to this cache line right now.
        let stripe = &self.runtime.stripes[stripe_of(addr)];
        for _ in 0..1000 {
            if !stripe.load(Ordering::Acquire) {
                break;
            }
            std::hint::spin_loop();
        }
        if stripe.load(Ordering::Acquire) {
            self.abort();
        }
        let seq = tseq_seq(cell.tseq.load(Ordering::Acquire));
        if seq > self.rv {
            self.abort();
        }
        let val = self
            .runtime
            .vr_slot(addr)
            .map(|slot| slot.load(Ordering::Acquire))
            .unwrap_or_else(|| cell.main.load(Ordering::Acquire));
        self.read_set.push(ReadEntry {
            cell_addr: addr,
            tseq_seen: seq,
        });
        val
    }

    fn write_cell(&mut self, cell: &Cell<impl Word>, value: u64) {
        let addr = cell.addr();
        if let Some(idx) = self.find_write(addr) {
            self.write_set[idx].value = value;
            return;
        }
        self.write_set.push(WriteEntry { cell_addr: addr, value });
    }

    /// Acquires every distinct stripe touched by this transaction's
    /// read-set and write-set, in address order, to avoid deadlocking
    /// against another transaction committing overlapping ranges.
    fn lock_stripes(&self) -> Vec<usize> {
        let mut stripes: Vec<usize> = self
            .write_set
            .iter()
            .map(|e| stripe_of(e.cell_addr))
            .chain(self.read_set.iter().map(|e| stripe_of(e.cell_addr)))
            .collect();
        stripes.sort_unstable();
        stripes.dedup();
        for &s in &stripes {
            while self.runtime.stripes[s]
                .compare_exchange_weak(false, true, Ordering::AcqRel, Ordering::Relaxed)
                .is_err()
            {
                std::hint::spin_loop();
            }
        }
        stripes
    }

    fn unlock_stripes(&self, stripes: &[usize]) {
        for &s in stripes {
            self.runtime.stripes[s].store(false, Ordering::Release);
        }
    }

    /// Validates the read-set, tentatively applies the write-set tagged
    /// with `p_tseq`, persists the commit point, then re-tags each write
    /// with the final version — mirroring Trinity-TL2's lock/validate/
    /// durability-stamp/finalize order, just against a volatile stripe
    /// instead of a lock bit in the cell itself.
    fn try_commit(&mut self) -> bool {
        if self.write_set.is_empty() {
            return true;
        }

        let held = self.lock_stripes();

        for entry in &self.read_set {
            if self.find_write(entry.cell_addr).is_some() {
                continue;
            }
            let cell = unsafe { &*(entry.cell_addr as *const Cell<u64>) };
            if tseq_seq(cell.tseq.load(Ordering::Acquire)) != entry.tseq_seen {
                self.unlock_stripes(&held);
                return false;
            }
        }

        for entry in &self.write_set {
            let cell = unsafe { &*(entry.cell_addr as *const Cell<u64>) };
            cell.back.store(cell.main.load(Ordering::Relaxed), Ordering::Relaxed);
            pwb_range(entry.cell_addr, std::mem::size_of::<Cell<u64>>());
            pfence();
            cell.main.store(entry.value, Ordering::Release);
            cell.tseq.store(self.p_tseq, Ordering::Release);
            pwb_range(entry.cell_addr, std::mem::size_of::<Cell<u64>>());
            if let Some(slot) = self.runtime.vr_slot(entry.cell_addr) {
                slot.store(entry.value, Ordering::Release);
            }
        }

        let next_clock = unsafe { (*self.runtime.header).gclock.fetch_add(1, Ordering::AcqRel) + 1 };
        unsafe {
            (*self.runtime.header).p_seq[self.tid].store(next_clock, Ordering::Relaxed);
            pwb_range(&(*self.runtime.header).p_seq[self.tid] as *const _ as usize, 8);
        }
        psync();

        for entry in &self.write_set {
            let cell = unsafe { &*(entry.cell_addr as *const Cell<u64>) };
            cell.tseq.store(compose_tseq(self.tid, next_clock), Ordering::Release);
            pwb_range(entry.cell_addr, std::mem::size_of::<Cell<u64>>());
        }
        psync();
        self.unlock_stripes(&held);
        true
    }
}

impl<T: Word> PersistentCell<T, VrTl2Tx<'_>> for Cell<T> {
    fn load(&self, tx: &mut VrTl2Tx<'_>) -> T {
        T::from_u64(tx.read_cell(self))
    }

    fn store(&self, tx: &mut VrTl2Tx<'_>, val: T) {
        tx.write_cell(self, val.to_u64());
    }

    fn load_for_write(&self, tx: &mut VrTl2Tx<'_>) -> T {
        T::from_u64(tx.read_cell(self))
    }
}

pub struct VrTl2ReadTx<'a> {
    _runtime: &'a VrTl2Runtime,
}

impl<T: Word> Cell<T> {
    pub fn read(&self, _tx: &VrTl2ReadTx<'_>) -> T {
        T::from_u64(self.main.load(Ordering::Acquire))
    }
}

pub struct VrTl2Runtime {
    region: Region,
    vr_base: *mut u8,
    vr_size: usize,
    header: *mut Header,
    esloco: EsLoco2,
    stripes: Box<[AtomicBool]>,
    registry: ThreadRegistry,
    stats: Stats,
}

unsafe impl Send for VrTl2Runtime {}
unsafe impl Sync for VrTl2Runtime {}

impl Drop for VrTl2Runtime {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.vr_base as *mut libc::c_void, self.vr_size);
        }
    }
}

impl VrTl2Runtime {
    pub fn open(path: &str) -> Result<Self, Error> {
        Self::open_sized(path, REGION_SIZE)
    }

    pub fn open_sized(path: &str, size: usize) -> Result<Self, Error> {
        let region = map_fixed(path, REGION_BASE, size)?;
        let vr_base = map_fixed_anon(VR_BASE, size)?;
        let header = region.as_ptr() as *mut Header;
        let arena_base = unsafe { region.as_ptr().add(ARENA_OFFSET) };
        let arena_size = (size - ARENA_OFFSET) as u64;

        let esloco = if region.is_new {
            unsafe {
                (*header).magic.store(MAGIC, Ordering::Relaxed);
                (*header).gclock.store(1, Ordering::Relaxed);
                for slot in &(*header).p_seq {
                    slot.store(1, Ordering::Relaxed);
                }
                (*header).esloco_pool_top.store(0, Ordering::Relaxed);
                for slot in &mut (*header).roots {
                    *slot = Cell::new(0u64);
                }
                pwb_range(header as usize, ARENA_OFFSET);
                pfence();
            }
            unsafe { EsLoco2::init(arena_base, arena_size) }
        } else {
            let magic = unsafe { (*header).magic.load(Ordering::Relaxed) };
            if magic != MAGIC {
                return Err(Error::CorruptRegion(format!("bad magic 0x{magic:x} in {path}")));
            }
            recover_all(header, arena_base, arena_size, vr_base, header as usize);
            let pool_top = unsafe { (*header).esloco_pool_top.load(Ordering::Relaxed) };
            unsafe { EsLoco2::attach(arena_base, arena_size, pool_top) }
        };

        Ok(VrTl2Runtime {
            region,
            vr_base,
            vr_size: size,
            header,
            esloco,
            stripes: (0..STRIPE_COUNT).map(|_| AtomicBool::new(false)).collect(),
            registry: ThreadRegistry::new(),
            stats: Stats::new(),
        })
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    /// The volatile-replica mirror of the `main` word at `pm_addr`, if
    /// `pm_addr` falls within this runtime's mapped region (it always does
    /// for cells this runtime allocated; the `None` path only guards
    /// pointers from a different runtime instance).
    fn vr_slot(&self, pm_addr: usize) -> Option<&AtomicU64> {
        let base = self.region.as_ptr() as usize;
        if pm_addr < base || pm_addr >= base + self.region.size() {
            return None;
        }
        let off = pm_addr - base;
        Some(unsafe { &*(self.vr_base.add(off) as *const AtomicU64) })
    }
}

impl Runtime for VrTl2Runtime {
    type UpdateTx<'a> = VrTl2Tx<'a>;
    type ReadTx<'a> = VrTl2ReadTx<'a>;

    fn base_ptr(&self) -> *mut u8 {
        self.region.as_ptr()
    }

    fn update_tx<F, R>(&self, f: F) -> R
    where
        F: Fn(&mut Self::UpdateTx<'_>) -> R + Send + 'static,
        R: Send + 'static,
    {
        let slot = self.registry.register().expect("thread registry exhausted");
        let tid = slot.tid();
        loop {
            let rv = unsafe { (*self.header).gclock.load(Ordering::Acquire) };
            unsafe {
                (*self.header).p_seq[tid].store(rv, Ordering::Relaxed);
                pwb_range(&(*self.header).p_seq[tid] as *const _ as usize, 8);
            }
            let mut tx = VrTl2Tx {
                runtime: self,
                tid,
                rv,
                p_tseq: compose_tseq(tid, rv),
                write_set: Vec::new(),
                read_set: Vec::new(),
            };
            let result = catch_abort(AssertUnwindSafe(|| f(&mut tx)));
            let Some(result) = result else {
                self.stats.record_abort();
                continue;
            };
            if tx.try_commit() {
                self.stats.record_commit();
                return result;
            }
            self.stats.record_abort();
        }
    }

    fn update_tx_seq<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&mut Self::UpdateTx<'_>) -> R,
    {
        let slot = self.registry.register().expect("thread registry exhausted");
        let tid = slot.tid();
        let rv = unsafe { (*self.header).gclock.load(Ordering::Acquire) };
        unsafe {
            (*self.header).p_seq[tid].store(rv, Ordering::Relaxed);
            pwb_range(&(*self.header).p_seq[tid] as *const _ as usize, 8);
        }
        let mut tx = VrTl2Tx {
            runtime: self,
            tid,
            rv,
            p_tseq: compose_tseq(tid, rv),
            write_set: Vec::new(),
            read_set: Vec::new(),
        };
        let result = f(&mut tx);
        let committed = tx.try_commit();
        debug_assert!(committed, "update_tx_seq called under concurrent access");
        self.stats.record_commit();
        result
    }

    fn read_tx<F, R>(&self, f: F) -> R
    where
        F: Fn(&Self::ReadTx<'_>) -> R,
    {
        let tx = VrTl2ReadTx { _runtime: self };
        f(&tx)
    }

    fn tm_malloc(&self, tx: &mut Self::UpdateTx<'_>, bytes: usize) -> Result<u64, Error> {
        let off = unsafe { self.esloco.malloc(tx.tid, bytes) }?;
        self.stats.record_alloc(bytes);
        unsafe {
            (*self.header)
                .esloco_pool_top
                .store(self.esloco.pool_top(), Ordering::Relaxed);
        }
        Ok(ARENA_OFFSET as u64 + off)
    }

    fn tm_free(&self, tx: &mut Self::UpdateTx<'_>, offset: u64) {
        unsafe { self.esloco.free(tx.tid, offset - ARENA_OFFSET as u64) };
    }

    fn get_object(&self, index: usize) -> Result<Option<u64>, Error> {
        check_index(index)?;
        let raw = unsafe { (*self.header).roots[index].main.load(Ordering::Acquire) };
        Ok(if raw == 0 { None } else { Some(raw) })
    }

    fn put_object(&self, tx: &mut Self::UpdateTx<'_>, index: usize, offset: u64) -> Result<(), Error> {
        check_index(index)?;
        if offset == 0 {
            return Err(Error::ApiMisuse("cannot store a zero root offset".into()));
        }
        unsafe { (*self.header).roots[index].store(tx, offset) };
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::Arc;

    fn open_fresh(name: &str) -> VrTl2Runtime {
        let path = format!("/tmp/trinity-ptm-vrtl2-{name}-{}", std::process::id());
        std::fs::remove_file(&path).ok();
        VrTl2Runtime::open_sized(&path, 4 * 1024 * 1024).expect("open")
    }

    #[test]
    fn single_thread_counter() {
        let rt = open_fresh("counter-single");
        let off = rt.update_tx(|tx| tx.malloc(8).unwrap());
        let cell = unsafe { &*(rt.base_ptr().add(off as usize) as *const Cell<u64>) };
        for _ in 0..100 {
            rt.update_tx(|tx| {
                let v = cell.load(tx);
                cell.store(tx, v + 1);
            });
        }
        let v = rt.read_tx(|tx| cell.read(tx));
        assert_eq!(v, 100);
    }

    #[test]
    fn update_tx_seq_skips_validation() {
        let rt = open_fresh("seq");
        let off = rt.update_tx(|tx| tx.malloc(8).unwrap());
        let cell = unsafe { &*(rt.base_ptr().add(off as usize) as *const Cell<u64>) };
        for _ in 0..50 {
            rt.update_tx_seq(|tx| {
                let v = cell.load_for_write(tx);
                cell.store(tx, v + 1);
            });
        }
        assert_eq!(rt.read_tx(|tx| cell.read(tx)), 50);
    }

    #[test]
    fn reads_observe_volatile_replica() {
        let rt = open_fresh("vr-mirror");
        let off = rt.update_tx(|tx| tx.malloc(8).unwrap());
        let cell = unsafe { &*(rt.base_ptr().add(off as usize) as *const Cell<u64>) };
        rt.update_tx(|tx| cell.store(tx, 42));
        let seen = rt.update_tx(|tx| cell.load(tx));
        assert_eq!(seen, 42);
        assert_eq!(
            rt.vr_slot(cell.addr()).unwrap().load(Ordering::Acquire),
            42
        );
    }

    #[test]
    fn concurrent_increments_on_shared_cell() {
        let rt = Arc::new(open_fresh("shared"));
        let off = rt.update_tx(|tx| tx.malloc(8).unwrap());

        let mut handles = Vec::new();
        for _ in 0..4 {
            let rt = rt.clone();
            handles.push(std::thread::spawn(move || {
                let cell = unsafe { &*(rt.base_ptr().add(off as usize) as *const Cell<u64>) };
                for _ in 0..250 {
                    rt.update_tx(|tx| {
                        let v = cell.load_for_write(tx);
                        cell.store(tx, v + 1);
                    });
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        let cell = unsafe { &*(rt.base_ptr().add(off as usize) as *const Cell<u64>) };
        assert_eq!(rt.read_tx(|tx| cell.read(tx)), 1000);
    }
}
