//! Shared vocabulary for the three runtimes' `persist<T>` cell types. Each
//! runtime defines its own concrete cell (its physical on-PM layout
//! differs: a single sequence word for Trinity-FC, a lock word for
//! Trinity-TL2, a plain version word for Trinity-VR-TL2), but all three
//! read and write through the same small vocabulary defined here.

/// A type that can be losslessly packed into and out of a 64-bit word so it
/// can live inside a runtime's fixed-width cell slot. Implemented for the
/// integer primitives; runtimes needing other POD types can add impls.
pub trait Word: Copy {
    fn to_u64(self) -> u64;
    fn from_u64(v: u64) -> Self;
}

macro_rules! impl_word {
    ($($t:ty),* $(,)?) => {
        $(
            impl Word for $t {
                #[inline(always)]
                fn to_u64(self) -> u64 {
                    self as u64
                }
                #[inline(always)]
                fn from_u64(v: u64) -> Self {
                    v as $t
                }
            }
        )*
    };
}

impl_word!(u8, u16, u32, u64, usize, i8, i16, i32, i64, isize);

impl Word for bool {
    #[inline(always)]
    fn to_u64(self) -> u64 {
        self as u64
    }
    #[inline(always)]
    fn from_u64(v: u64) -> Self {
        v != 0
    }
}

/// Common read/write/arithmetic/comparison surface implemented by every
/// runtime's concrete cell type (`runtime::fc::Cell<T>`,
/// `runtime::tl2::Cell<T>`, `runtime::vr_tl2::Cell<T>`), parameterized by
/// that runtime's transaction-context type `Tx`.
///
/// A cell degrades to a plain load/store when accessed with no active
/// transaction context available (see each runtime's `Cell::read`, used by
/// its read-only transaction type).
pub trait PersistentCell<T: Word, Tx> {
    /// Takes `tx` by `&mut` even though a load never changes a cell's own
    /// state, because some runtimes (Trinity-TL2, Trinity-VR-TL2) must
    /// record every read into the transaction's read-set for commit-time
    /// validation.
    fn load(&self, tx: &mut Tx) -> T;
    fn store(&self, tx: &mut Tx, val: T);

    fn fetch_add(&self, tx: &mut Tx, delta: T) -> T
    where
        T: std::ops::Add<Output = T>,
    {
        let cur = self.load_for_write(tx);
        self.store(tx, cur + delta);
        cur
    }

    fn fetch_sub(&self, tx: &mut Tx, delta: T) -> T
    where
        T: std::ops::Sub<Output = T>,
    {
        let cur = self.load_for_write(tx);
        self.store(tx, cur - delta);
        cur
    }

    /// Loads the current value as part of a read-modify-write; runtimes
    /// whose commit protocol distinguishes reads from read-then-write
    /// (TL2's eager locking) override this instead of routing through
    /// [`PersistentCell::load`].
    fn load_for_write(&self, tx: &mut Tx) -> T;
}
