//! The `Runtime` trait shared by the three Trinity engines. Each engine
//! (`fc`, `tl2`, `vr_tl2`) is a concrete type implementing this trait rather
//! than a build-time macro selection, so application code picks a PTM
//! flavor the same way it picks any other type parameter.

pub mod fc;
pub mod tl2;
pub mod vr_tl2;

use crate::error::Error;

/// Internal control-transfer sentinel. A transaction body panics with this
/// to abort and retry; it is caught only by the owning runtime's
/// `update_tx` driver via `std::panic::catch_unwind` and never escapes to
/// caller code. This gives aborts a non-local return without relying on
/// `setjmp`/`longjmp`.
pub(crate) struct AbortSignal;

/// Shared surface implemented by [`fc::FcRuntime`], [`tl2::Tl2Runtime`],
/// and [`vr_tl2::VrTl2Runtime`].
///
/// A transaction is a closure. `update_tx` retries its closure until it
/// commits; closures must therefore be free of observable side effects
/// outside of persistent cells and this runtime's allocator, since they may
/// run more than once.
pub trait Runtime {
    type UpdateTx<'a>
    where
        Self: 'a;
    type ReadTx<'a>
    where
        Self: 'a;

    /// Base address of the mapped region, for translating the offsets
    /// returned by [`Runtime::tm_malloc`] into live pointers.
    fn base_ptr(&self) -> *mut u8;

    fn update_tx<F, R>(&self, f: F) -> R
    where
        F: Fn(&mut Self::UpdateTx<'_>) -> R + Send + 'static,
        R: Send + 'static;

    /// Runs `f` as a single-shot durable transaction, skipping the
    /// concurrency control `update_tx` pays for on every call (no publish/
    /// combine round-trip in Trinity-FC, no read-set revalidation in
    /// Trinity-TL2/VR-TL2). The caller promises no other thread is
    /// transacting against this runtime concurrently; `f` therefore runs
    /// exactly once and takes `FnOnce`, unlike `update_tx`'s `Fn` (which
    /// must tolerate being retried).
    ///
    /// Useful for single-threaded setup code (e.g. seeding initial data
    /// right after `open`) where paying for validation or combining would
    /// be pure overhead.
    fn update_tx_seq<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&mut Self::UpdateTx<'_>) -> R;

    fn read_tx<F, R>(&self, f: F) -> R
    where
        F: Fn(&Self::ReadTx<'_>) -> R;

    fn tm_malloc(&self, tx: &mut Self::UpdateTx<'_>, bytes: usize) -> Result<u64, Error>;
    fn tm_free(&self, tx: &mut Self::UpdateTx<'_>, offset: u64);

    fn get_object(&self, index: usize) -> Result<Option<u64>, Error>;
    fn put_object(&self, tx: &mut Self::UpdateTx<'_>, index: usize, offset: u64) -> Result<(), Error>;

    /// Allocates space for `value`, writes it in place, and returns its
    /// offset. Pair with [`Runtime::tm_delete`], never leave a constructed
    /// value to be freed by `tm_free` alone — that would skip its `Drop`.
    fn tm_new<T>(&self, tx: &mut Self::UpdateTx<'_>, value: T) -> Result<u64, Error> {
        let off = self.tm_malloc(tx, std::mem::size_of::<T>())?;
        unsafe {
            let ptr = self.base_ptr().add(off as usize) as *mut T;
            ptr.write(value);
            crate::ll::pwb_range(ptr as usize, std::mem::size_of::<T>());
            crate::ll::pfence();
        }
        Ok(off)
    }

    /// Drops the value at `offset` in place before freeing it.
    ///
    /// # Safety
    /// `offset` must have come from `tm_new::<T>` on this runtime and not
    /// already be deleted; nothing may still reference it.
    unsafe fn tm_delete<T>(&self, tx: &mut Self::UpdateTx<'_>, offset: u64) {
        let ptr = self.base_ptr().add(offset as usize) as *mut T;
        std::ptr::drop_in_place(ptr);
        self.tm_free(tx, offset);
    }
}

/// Runs `body`, translating an [`AbortSignal`] panic into `None` and
/// re-raising any other panic. Shared by all three runtimes' `update_tx`
/// retry loops.
pub(crate) fn catch_abort<F, R>(body: F) -> Option<R>
where
    F: FnOnce() -> R + std::panic::UnwindSafe,
{
    match std::panic::catch_unwind(body) {
        Ok(r) => Some(r),
        Err(payload) => {
            if payload.downcast_ref::<AbortSignal>().is_some() {
                None
            } else {
                std::panic::resume_unwind(payload)
            }
        }
    }
}
