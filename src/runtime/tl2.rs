//! Trinity-TL2: a lock-based PTM runtime with a global version clock,
//! grounded on the `Trinity` class in `TrinityTL2.hpp`. Unlike Trinity-FC's
//! single combiner, independent cells can be written concurrently: a write
//! takes an eager per-cell lock (encoded in the cell's `lseq` word) the
//! first time the transaction touches it, and the read-set is revalidated
//! against the global clock at commit, the classic TL2 protocol adapted to
//! run the write itself (not just its log entry) directly against
//! persistent memory.

use std::marker::PhantomData;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::alloc::esloco2::EsLoco2;
use crate::cell::{PersistentCell, Word};
use crate::error::Error;
use crate::ll::{pfence, psync, pwb_range};
use crate::region::{map_fixed, Region};
use crate::roots::{check_index, MAX_ROOT_POINTERS};
use crate::runtime::{catch_abort, AbortSignal, Runtime};
use crate::stat::Stats;
use crate::thread_registry::{ThreadRegistry, MAX_THREADS};

pub const REGION_BASE: usize = 0x7feb_0000_0000;
pub const REGION_SIZE: usize = 1 << 30;

const MAGIC: u64 = 0x5472_696e_5f54_4c32; // "Trin_TL2"

const LOCKED_BIT: u64 = 1 << 63;
const TID_BITS: u32 = 7;
const TID_SHIFT: u32 = 64 - 1 - TID_BITS;
const TID_MASK: u64 = ((1u64 << TID_BITS) - 1) << TID_SHIFT;
const SEQ_MASK: u64 = (1u64 << TID_SHIFT) - 1;

#[inline]
fn compose_lseq(locked: bool, tid: usize, seq: u64) -> u64 {
    let mut v = seq & SEQ_MASK;
    v |= ((tid as u64) << TID_SHIFT) & TID_MASK;
    if locked {
        v |= LOCKED_BIT;
    }
    v
}

#[inline]
fn lseq_locked(v: u64) -> bool {
    v & LOCKED_BIT != 0
}

#[inline]
fn lseq_tid(v: u64) -> usize {
    ((v & TID_MASK) >> TID_SHIFT) as usize
}

#[inline]
fn lseq_seq(v: u64) -> u64 {
    v & SEQ_MASK
}

#[repr(C)]
struct Header {
    magic: AtomicU64,
    gclock: AtomicU64,
    /// Per-thread last read-version recorded just before that thread began
    /// locking cells for commit; recovery uses this to know which version
    /// to roll a still-locked cell back to.
    p_seq: [AtomicU64; MAX_THREADS],
    /// Root-pointer slots, stored as ordinary `Cell<u64>`s so a root write
    /// goes through the same lock/validate/commit path as any other write.
    roots: [Cell<u64>; MAX_ROOT_POINTERS],
    esloco_pool_top: AtomicU64,
}

const ARENA_OFFSET: usize = std::mem::size_of::<Header>();
const CELL_STRIDE: usize = std::mem::size_of::<Cell<u64>>();

/// Physical layout shared by every `Cell<T>` regardless of `T`: a
/// durable/volatile pair plus a lock-and-version word. Used as a
/// type-erased handle for write-set/read-set bookkeeping, since bookkeeping
/// never needs to know `T`.
#[repr(C)]
struct CellRepr {
    main: AtomicU64,
    back: AtomicU64,
    lseq: AtomicU64,
}

/// A Trinity-TL2 persistent cell.
#[repr(C)]
pub struct Cell<T> {
    repr: CellRepr,
    _marker: PhantomData<T>,
}

impl<T: Word> Cell<T> {
    pub fn new(init: T) -> Self {
        Cell {
            repr: CellRepr {
                main: AtomicU64::new(init.to_u64()),
                back: AtomicU64::new(0),
                lseq: AtomicU64::new(compose_lseq(false, 0, 0)),
            },
            _marker: PhantomData,
        }
    }

    fn repr_ptr(&self) -> *const CellRepr {
        &self.repr
    }

    /// Restores a cell a crashed commit left locked. The lock word's tag is
    /// the committing thread's read-version at the time it took the lock:
    /// if that still matches `owner_p_seq(tid)` the thread never reached its
    /// durability point, so the write never became durable and `main` is
    /// rolled back to `back`; otherwise the thread's `p_seq` has already
    /// moved past this lock (the commit point was persisted before the
    /// crash) and `back` is brought forward to confirm `main` instead.
    ///
    /// # Safety
    /// Must only run during single-threaded recovery before any
    /// transaction begins.
    pub unsafe fn recover(&self, owner_p_seq: impl Fn(usize) -> u64) {
        let v = self.repr.lseq.load(Ordering::Relaxed);
        if lseq_locked(v) {
            let tid = lseq_tid(v);
            if lseq_seq(v) == owner_p_seq(tid) {
                self.repr.main.store(self.repr.back.load(Ordering::Relaxed), Ordering::Relaxed);
            } else {
                self.repr.back.store(self.repr.main.load(Ordering::Relaxed), Ordering::Relaxed);
            }
            self.repr.lseq.store(0, Ordering::Relaxed);
            pwb_range(&self.repr as *const _ as usize, std::mem::size_of::<CellRepr>());
        }
    }
}

/// Scans the header's root slots plus the whole arena in cell-sized
/// strides, resolving any lock a crash left held. Run once on every
/// reattach, before any transaction is admitted.
fn recover_all(header: *mut Header, arena_base: *mut u8, arena_size: u64) {
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

/// Write-set entry: just the cell's type-erased pointer — the version
/// bookkeeping needed to validate or undo a write lives in the cell's own
/// `lseq`/`back` words, not in the log.
struct WriteEntry {
    cell: *const CellRepr,
}

/// Read-set entry: the cell plus the version it was seen at, so commit can
/// detect whether another transaction has touched it since.
struct ReadEntry {
    cell: *const CellRepr,
    seq_seen: u64,
}

/// Transaction context for a Trinity-TL2 write transaction.
pub struct Tl2Tx<'a> {
    runtime: &'a Tl2Runtime,
    tid: usize,
    rv: u64,
    write_set: Vec<WriteEntry>,
    read_set: Vec<ReadEntry>,
}

impl<'a> Tl2Tx<'a> {
    pub fn malloc(&mut self, bytes: usize) -> Result<u64, Error> {
        self.runtime.tm_malloc(self, bytes)
    }

    fn find_write(&self, cell: *const CellRepr) -> Option<usize> {
        self.write_set.iter().position(|e| e.cell == cell)
    }

    fn abort(&self) -> ! {
        self.rollback();
        std::panic::panic_any(AbortSignal);
    }

    /// Undoes every locked write (`main` reverts to the still-untouched
    /// `back`), then advances the clock and re-stamps each cell with the
    /// new version before unlocking — an aborted transaction never reverts
    /// to its pre-lock version number, it just burns a clock tick.
    fn rollback(&self) {
        for entry in &self.write_set {
            unsafe {
                let repr = &*entry.cell;
                repr.main.store(repr.back.load(Ordering::Relaxed), Ordering::Relaxed);
            }
        }
        let next_clock = unsafe { (*self.runtime.header).gclock.fetch_add(1, Ordering::AcqRel) + 1 };
        unsafe {
            (*self.runtime.header).p_seq[self.tid].store(next_clock, Ordering::Relaxed);
            pwb_range(&(*self.runtime.header).p_seq[self.tid] as *const _ as usize, 8);
        }
        for entry in &self.write_set {
            unsafe {
                let repr = &*entry.cell;
                repr.lseq.store(compose_lseq(false, self.tid, next_clock), Ordering::Release);
                pwb_range(entry.cell as usize, std::mem::size_of::<CellRepr>());
            }
        }
        pfence();
    }

    /// Takes the cell's lock (tagged with this transaction's read-version,
    /// not the cell's prior version) and leaves `back` untouched — `back`
    /// keeps holding the last confirmed value for the whole transaction
    /// body, so a crash before commit can still undo cleanly.
    fn lock_for_write(&mut self, cell: *const CellRepr) -> &CellRepr {
        if let Some(idx) = self.find_write(cell) {
            return unsafe { &*self.write_set[idx].cell };
        }
        let repr = unsafe { &*cell };
        let cur = repr.lseq.load(Ordering::Acquire);
        if lseq_locked(cur) || lseq_seq(cur) > self.rv {
            self.abort();
        }
        if repr
            .lseq
            .compare_exchange(cur, compose_lseq(true, self.tid, self.rv), Ordering::AcqRel, Ordering::Relaxed)
            .is_err()
        {
            self.abort();
        }
        self.write_set.push(WriteEntry { cell });
        repr
    }

    fn read(&mut self, cell: *const CellRepr) -> u64 {
        if let Some(idx) = self.find_write(cell) {
            let repr = unsafe { &*self.write_set[idx].cell };
            return repr.main.load(Ordering::Acquire);
        }
        let repr = unsafe { &*cell };
        let v = repr.lseq.load(Ordering::Acquire);
        if lseq_locked(v) || lseq_seq(v) > self.rv {
            self.abort();
        }
        self.read_set.push(ReadEntry {
            cell,
            seq_seen: lseq_seq(v),
        });
        repr.main.load(Ordering::Acquire)
    }

    /// Validates the read-set, persists the commit point, then catches
    /// `back` up to `main` and re-stamps the final version — in that
    /// order, so durability never depends on the catch-up step having run.
    /// Returns `true` on commit, `false` if validation failed (in which
    /// case the caller must retry with a fresh transaction).
    fn try_commit(&mut self) -> bool {
        if self.write_set.is_empty() {
            return true;
        }

        for entry in &self.read_set {
            if self.find_write(entry.cell).is_some() {
                continue;
            }
            let repr = unsafe { &*entry.cell };
            let v = repr.lseq.load(Ordering::Acquire);
            if lseq_locked(v) || lseq_seq(v) != entry.seq_seen {
                self.rollback();
                return false;
            }
        }

        let next_clock = unsafe { (*self.runtime.header).gclock.fetch_add(1, Ordering::AcqRel) + 1 };
        unsafe {
            (*self.runtime.header).p_seq[self.tid].store(next_clock, Ordering::Relaxed);
            pwb_range(&(*self.runtime.header).p_seq[self.tid] as *const _ as usize, 8);
        }
        psync();

        for entry in &self.write_set {
            let repr = unsafe { &*entry.cell };
            repr.back.store(repr.main.load(Ordering::Relaxed), Ordering::Relaxed);
            pwb_range(entry.cell as usize, std::mem::size_of::<CellRepr>());
        }
        pfence();

        for entry in &self.write_set {
            let repr = unsafe { &*entry.cell };
            repr.lseq.store(compose_lseq(false, self.tid, next_clock), Ordering::Release);
            pwb_range(entry.cell as usize, std::mem::size_of::<CellRepr>());
        }
        psync();
        true
    }
}

impl<T: Word> PersistentCell<T, Tl2Tx<'_>> for Cell<T> {
    fn load(&self, tx: &mut Tl2Tx<'_>) -> T {
        T::from_u64(tx.read(self.repr_ptr()))
    }

    fn store(&self, tx: &mut Tl2Tx<'_>, val: T) {
        let repr = tx.lock_for_write(self.repr_ptr());
        repr.main.store(val.to_u64(), Ordering::Release);
        pwb_range(self.repr_ptr() as usize, std::mem::size_of::<CellRepr>());
    }

    fn load_for_write(&self, tx: &mut Tl2Tx<'_>) -> T {
        let repr = tx.lock_for_write(self.repr_ptr());
        T::from_u64(repr.main.load(Ordering::Acquire))
    }
}

pub struct Tl2ReadTx<'a> {
    runtime: &'a Tl2Runtime,
    rv: u64,
}

impl<T: Word> Cell<T> {
    /// Read-only access outside any write transaction: takes a consistent
    /// snapshot by retrying if the cell is mid-commit, but never joins a
    /// read-set or can itself cause an abort.
    pub fn read(&self, tx: &Tl2ReadTx<'_>) -> T {
        loop {
            let v = self.repr.lseq.load(Ordering::Acquire);
            if lseq_locked(v) {
                std::hint::spin_loop();
                continue;
            }
            let val = self.repr.main.load(Ordering::Acquire);
            let v2 = self.repr.lseq.load(Ordering::Acquire);
            if v == v2 {
                let _ = tx.rv;
                return T::from_u64(val);
            }
        }
    }
}

pub struct Tl2Runtime {
    region: Region,
    header: *mut Header,
    esloco: EsLoco2,
    registry: ThreadRegistry,
    stats: Stats,
}

unsafe impl Send for Tl2Runtime {}
unsafe impl Sync for Tl2Runtime {}

impl Tl2Runtime {
    pub fn open(path: &str) -> Result<Self, Error> {
        Self::open_sized(path, REGION_SIZE)
    }

    pub fn open_sized(path: &str, size: usize) -> Result<Self, Error> {
        let region = map_fixed(path, REGION_BASE, size)?;
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
            recover_all(header, arena_base, arena_size);
            let pool_top = unsafe { (*header).esloco_pool_top.load(Ordering::Relaxed) };
            unsafe { EsLoco2::attach(arena_base, arena_size, pool_top) }
        };

        Ok(Tl2Runtime {
            region,
            header,
            esloco,
            registry: ThreadRegistry::new(),
            stats: Stats::new(),
        })
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }
}

impl Runtime for Tl2Runtime {
    type UpdateTx<'a> = Tl2Tx<'a>;
    type ReadTx<'a> = Tl2ReadTx<'a>;

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
            let mut tx = Tl2Tx {
                runtime: self,
                tid,
                rv,
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
        let mut tx = Tl2Tx {
            runtime: self,
            tid,
            rv,
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
        let rv = unsafe { (*self.header).gclock.load(Ordering::Acquire) };
        let tx = Tl2ReadTx { runtime: self, rv };
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
        let raw = unsafe { (*self.header).roots[index].repr.main.load(Ordering::Acquire) };
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

    fn open_fresh(name: &str) -> Tl2Runtime {
        let path = format!("/tmp/trinity-ptm-tl2-{name}-{}", std::process::id());
        std::fs::remove_file(&path).ok();
        Tl2Runtime::open_sized(&path, 4 * 1024 * 1024).expect("open")
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
    fn concurrent_increments_on_disjoint_cells() {
        let rt = Arc::new(open_fresh("disjoint"));
        let off_a = rt.update_tx(|tx| tx.malloc(8).unwrap());
        let off_b = rt.update_tx(|tx| tx.malloc(8).unwrap());

        let mut handles = Vec::new();
        for off in [off_a, off_b] {
            let rt = rt.clone();
            handles.push(std::thread::spawn(move || {
                let cell = unsafe { &*(rt.base_ptr().add(off as usize) as *const Cell<u64>) };
                for _ in 0..200 {
                    rt.update_tx(|tx| {
                        let v = cell.load(tx);
                        cell.store(tx, v + 1);
                    });
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        let cell_a = unsafe { &*(rt.base_ptr().add(off_a as usize) as *const Cell<u64>) };
        let cell_b = unsafe { &*(rt.base_ptr().add(off_b as usize) as *const Cell<u64>) };
        assert_eq!(rt.read_tx(|tx| cell_a.read(tx)), 200);
        assert_eq!(rt.read_tx(|tx| cell_b.read(tx)), 200);
    }

    #[test]
    fn concurrent_increments_on_shared_cell_validate_correctly() {
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
