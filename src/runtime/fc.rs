//! Trinity-FC: a flat-combining undo-logging PTM runtime, grounded on the
//! `Trinity` class in `TrinityFC.hpp`.
//!
//! At most one thread — the *combiner* — ever writes at a time: other
//! writers publish their transaction closure into a shared queue and block
//! until the combiner runs it on their behalf. This makes write/write
//! conflicts impossible by construction, so Trinity-FC needs no read-set
//! validation; it only needs undo logging so a crash mid-combine can be
//! rolled back. Readers proceed concurrently with everything except the
//! combiner's brief back-propagation window, arbitrated by [`CRwWpLock`].

use std::any::Any;
use std::collections::VecDeque;
use std::marker::PhantomData;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use crate::alloc::esloco::EsLoco;
use crate::cell::{PersistentCell, Word};
use crate::error::Error;
use crate::ll::{pfence, psync, pwb_range};
use crate::region::{map_fixed, Region};
use crate::roots::{check_index, MAX_ROOT_POINTERS};
use crate::rwlock::CRwWpLock;
use crate::runtime::Runtime;
use crate::stat::Stats;
use crate::thread_registry::ThreadRegistry;

/// Fixed virtual address Trinity-FC maps its region at, matching
/// `PM_REGION_BEGIN` in the original.
pub const REGION_BASE: usize = 0x7fea_0000_0000;
/// Default region size, matching `PM_REGION_SIZE` in the original (1 GiB).
pub const REGION_SIZE: usize = 1 << 30;

const MAGIC: u64 = 0x5472_696e_5f46_4321; // "Trin_FC!"

#[repr(C)]
struct Header {
    magic: AtomicU64,
    /// Current combine round; a cell whose `seq` equals this value was
    /// touched by the round in progress and has not yet been committed.
    round: AtomicU64,
    /// Root-pointer slots, stored as ordinary `Cell<u64>`s so a root write
    /// undo-logs through the same combine round as any other write.
    roots: [Cell<u64>; MAX_ROOT_POINTERS],
    esloco_pool_top: AtomicU64,
}

const ARENA_OFFSET: usize = std::mem::size_of::<Header>();
const CELL_STRIDE: usize = std::mem::size_of::<Cell<u64>>();

/// A Trinity-FC persistent cell: `main`/`back` copies plus a round-sequence
/// word, 24 bytes.
#[repr(C)]
pub struct Cell<T> {
    main: AtomicU64,
    back: AtomicU64,
    seq: AtomicU64,
    _marker: PhantomData<T>,
}

impl<T: Word> Cell<T> {
    pub fn new(init: T) -> Self {
        Cell {
            main: AtomicU64::new(init.to_u64()),
            back: AtomicU64::new(0),
            seq: AtomicU64::new(0),
            _marker: PhantomData,
        }
    }

    /// Writes `val`, undo-logging the previous value the first time this
    /// cell is touched within `round`.
    fn store_in_round(&self, round: u64, val: T) {
        if self.seq.load(Ordering::Relaxed) != round {
            self.back.store(self.main.load(Ordering::Relaxed), Ordering::Relaxed);
            self.seq.store(round, Ordering::Relaxed);
            pwb_range(&self.back as *const _ as usize, 8);
            pwb_range(&self.seq as *const _ as usize, 8);
            pfence();
        }
        self.main.store(val.to_u64(), Ordering::Release);
        pwb_range(&self.main as *const _ as usize, 8);
    }

    /// Restores consistency after a crash mid-round: if this cell's `seq`
    /// equals the round the header last recorded as in-progress, the
    /// combine never finished, so roll back to `back` and clear the round
    /// tag. Flushing is left to the caller, which batches one `pfence`
    /// after scanning every cell.
    ///
    /// # Safety
    /// `current_round` must be the value read from this cell's owning
    /// region's header at open time.
    pub unsafe fn recover(&self, current_round: u64) {
        if self.seq.load(Ordering::Relaxed) == current_round {
            self.main.store(self.back.load(Ordering::Relaxed), Ordering::Relaxed);
            self.seq.store(0, Ordering::Relaxed);
            pwb_range(self as *const _ as usize, std::mem::size_of::<Self>());
        }
    }
}

/// Scans the header's root slots plus the whole arena in cell-sized
/// strides, undoing any cell a crash left mid-round. Run once on every
/// reattach, before any transaction is admitted: a stray word that happens
/// to carry the current round's tag is indistinguishable from an actual
/// cell, but since `store_in_round` only ever sets `seq` to the round that
/// touched it, misreading ordinary allocator/user bytes this way can only
/// produce a harmless no-op, the same assumption the original's full-PM
/// scan relies on.
fn recover_all(header: *mut Header, arena_base: *mut u8, arena_size: u64) {
    let round = unsafe { (*header).round.load(Ordering::Relaxed) };
    unsafe {
        for cell in &(*header).roots {
            cell.recover(round);
        }
    }
    let count = (arena_size as usize) / CELL_STRIDE;
    for i in 0..count {
        let cell = unsafe { &*(arena_base.add(i * CELL_STRIDE) as *const Cell<u64>) };
        unsafe { cell.recover(round) };
    }
    pfence();
}

/// Transaction context for a Trinity-FC write transaction: carries the
/// combine round so every cell write in this closure shares one undo
/// epoch.
pub struct FcUpdateTx<'a> {
    runtime: &'a FcRuntime,
    round: u64,
}

impl<'a> FcUpdateTx<'a> {
    pub fn malloc(&mut self, bytes: usize) -> Result<u64, Error> {
        self.runtime.tm_malloc(self, bytes)
    }
}

impl<T: Word> PersistentCell<T, FcUpdateTx<'_>> for Cell<T> {
    fn load(&self, _tx: &mut FcUpdateTx<'_>) -> T {
        T::from_u64(self.main.load(Ordering::Acquire))
    }

    fn store(&self, tx: &mut FcUpdateTx<'_>, val: T) {
        self.store_in_round(tx.round, val);
    }

    fn load_for_write(&self, tx: &mut FcUpdateTx<'_>) -> T {
        self.load(tx)
    }
}

/// Read-only transaction context; cells degrade to a plain acquire load.
pub struct FcReadTx<'a> {
    _runtime: &'a FcRuntime,
}

impl<T: Word> Cell<T> {
    pub fn read(&self, _tx: &FcReadTx<'_>) -> T {
        T::from_u64(self.main.load(Ordering::Acquire))
    }
}

type BoxedOp = Box<dyn FnOnce(&mut FcUpdateTx<'_>) + Send>;

struct Publisher {
    queue: Mutex<VecDeque<BoxedOp>>,
    combining: AtomicBool,
}

/// The Trinity-FC runtime: one mapped region, one allocator, one combiner
/// queue.
pub struct FcRuntime {
    region: Region,
    header: *mut Header,
    esloco: EsLoco,
    rwlock: CRwWpLock,
    registry: ThreadRegistry,
    publisher: Publisher,
    stats: Stats,
}

unsafe impl Send for FcRuntime {}
unsafe impl Sync for FcRuntime {}

impl FcRuntime {
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
                (*header).round.store(1, Ordering::Relaxed);
                (*header).esloco_pool_top.store(0, Ordering::Relaxed);
                for slot in &mut (*header).roots {
                    *slot = Cell::new(0u64);
                }
                pwb_range(header as usize, ARENA_OFFSET);
                pfence();
            }
            unsafe { EsLoco::init(arena_base, arena_size) }
        } else {
            let magic = unsafe { (*header).magic.load(Ordering::Relaxed) };
            if magic != MAGIC {
                return Err(Error::CorruptRegion(format!(
                    "bad magic 0x{magic:x} in {path}"
                )));
            }
            recover_all(header, arena_base, arena_size);
            let pool_top = unsafe { (*header).esloco_pool_top.load(Ordering::Relaxed) };
            unsafe { EsLoco::attach(arena_base, arena_size, pool_top, [u64::MAX; crate::alloc::MAX_BLOCK_SIZE]) }
        };

        Ok(FcRuntime {
            region,
            header,
            esloco,
            rwlock: CRwWpLock::new(),
            registry: ThreadRegistry::new(),
            publisher: Publisher {
                queue: Mutex::new(VecDeque::new()),
                combining: AtomicBool::new(false),
            },
            stats: Stats::new(),
        })
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    /// Drains the publisher queue under the exclusive lock. Every call to
    /// `update_tx` races to become the combiner; whoever wins runs every
    /// op currently queued (including ops published by threads that lost
    /// the race), then releases the lock so a reader can make progress,
    /// matching the original's flat-combining publish/combine/apply cycle.
    fn drive_combiner(&self) {
        if self
            .publisher
            .combining
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
            .is_err()
        {
            return;
        }

        loop {
            self.rwlock.exclusive_lock();
            let round = unsafe { (*self.header).round.fetch_add(1, Ordering::AcqRel) + 1 };
            loop {
                let op = { self.publisher.queue.lock().unwrap().pop_front() };
                let Some(op) = op else { break };
                let mut tx = FcUpdateTx { runtime: self, round };
                op(&mut tx);
                self.stats.record_commit();
            }
            psync();
            self.rwlock.exclusive_unlock();

            // A publisher may have pushed between our last pop and clearing
            // the flag; re-check before stepping down so its op is never
            // stranded in the queue with nobody driving the combiner.
            self.publisher.combining.store(false, Ordering::Release);
            if self.publisher.queue.lock().unwrap().is_empty() {
                break;
            }
            if self
                .publisher
                .combining
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
                .is_err()
            {
                break;
            }
        }
    }
}

impl Runtime for FcRuntime {
    type UpdateTx<'a> = FcUpdateTx<'a>;
    type ReadTx<'a> = FcReadTx<'a>;

    fn base_ptr(&self) -> *mut u8 {
        self.region.as_ptr()
    }

    fn update_tx<F, R>(&self, f: F) -> R
    where
        F: Fn(&mut Self::UpdateTx<'_>) -> R + Send + 'static,
        R: Send + 'static,
    {
        let (result_tx, result_rx) = std::sync::mpsc::channel::<Box<dyn Any + Send>>();
        let op: BoxedOp = Box::new(move |tx: &mut FcUpdateTx<'_>| {
            let r = f(tx);
            let _ = result_tx.send(Box::new(r));
        });
        self.publisher.queue.lock().unwrap().push_back(op);
        self.drive_combiner();
        let boxed = result_rx
            .recv()
            .expect("combiner dropped the result channel without running this op");
        *boxed.downcast::<R>().expect("result type mismatch")
    }

    fn update_tx_seq<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&mut Self::UpdateTx<'_>) -> R,
    {
        self.rwlock.exclusive_lock();
        let round = unsafe { (*self.header).round.fetch_add(1, Ordering::AcqRel) + 1 };
        let mut tx = FcUpdateTx { runtime: self, round };
        let r = f(&mut tx);
        psync();
        self.rwlock.exclusive_unlock();
        self.stats.record_commit();
        r
    }

    fn read_tx<F, R>(&self, f: F) -> R
    where
        F: Fn(&Self::ReadTx<'_>) -> R,
    {
        let slot = self.registry.register().expect("thread registry exhausted");
        self.rwlock.shared_lock(slot.tid());
        let tx = FcReadTx { _runtime: self };
        let r = f(&tx);
        self.rwlock.shared_unlock(slot.tid());
        r
    }

    fn tm_malloc(&self, _tx: &mut Self::UpdateTx<'_>, bytes: usize) -> Result<u64, Error> {
        let off = self.esloco.malloc(bytes)?;
        self.stats.record_alloc(bytes);
        unsafe {
            (*self.header)
                .esloco_pool_top
                .store(self.esloco.pool_top(), Ordering::Relaxed);
        }
        Ok(ARENA_OFFSET as u64 + off)
    }

    fn tm_free(&self, _tx: &mut Self::UpdateTx<'_>, offset: u64) {
        unsafe { self.esloco.free(offset - ARENA_OFFSET as u64) };
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

    fn open_fresh(name: &str) -> FcRuntime {
        let path = format!("/tmp/trinity-ptm-fc-{name}-{}", std::process::id());
        std::fs::remove_file(&path).ok();
        FcRuntime::open_sized(&path, 4 * 1024 * 1024).expect("open")
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
    fn update_tx_seq_skips_the_combiner() {
        let rt = open_fresh("seq");
        let off = rt.update_tx(|tx| tx.malloc(8).unwrap());
        let cell = unsafe { &*(rt.base_ptr().add(off as usize) as *const Cell<u64>) };
        for _ in 0..50 {
            rt.update_tx_seq(|tx| {
                let v = cell.load(tx);
                cell.store(tx, v + 1);
            });
        }
        assert_eq!(rt.read_tx(|tx| cell.read(tx)), 50);
    }

    #[test]
    fn concurrent_increments_are_serialized() {
        let rt = Arc::new(open_fresh("counter-concurrent"));
        let off = rt.update_tx(|tx| tx.malloc(8).unwrap());
        let cell_off = off;

        let mut handles = Vec::new();
        for _ in 0..8 {
            let rt = rt.clone();
            handles.push(std::thread::spawn(move || {
                let cell = unsafe { &*(rt.base_ptr().add(cell_off as usize) as *const Cell<u64>) };
                for _ in 0..500 {
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
        let cell = unsafe { &*(rt.base_ptr().add(cell_off as usize) as *const Cell<u64>) };
        let v = rt.read_tx(|tx| cell.read(tx));
        assert_eq!(v, 4000);
    }
}
