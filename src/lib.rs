//! Persistent Transactional Memory (PTM) runtimes for byte-addressable
//! non-volatile memory.
//!
//! This crate implements the Trinity family of PTM engines: a
//! flat-combining undo-like runtime ([`runtime::fc`]), a lock-based TL2
//! runtime ([`runtime::tl2`]), and a volatile-replica variant of TL2
//! ([`runtime::vr_tl2`]). All three share the same supporting
//! infrastructure:
//!
//! * [`thread_registry`] — wait-free bounded thread-id assignment.
//! * [`region`] — fixed-address persistent memory mapping.
//! * [`alloc`] — the `EsLoco`/`EsLoco2` persistent allocators.
//! * [`rwlock`] — the writer-preference C-RW-WP lock.
//! * [`cell`] — the `PersistentCell<T>` trait implemented by each runtime's
//!   concrete `persist<T>` cell type.
//! * [`roots`] — the fixed-size root-pointer table.
//!
//! Application code picks one runtime, opens (or creates) its region, and
//! drives it through [`Runtime::update_tx`] / [`Runtime::read_tx`]. A
//! transaction is a closure; aborted transactions are retried transparently,
//! so closures must not perform observable side effects outside of
//! persistent cells and the runtime's allocator.

#![allow(clippy::missing_safety_doc)]

pub mod alloc;
pub mod cell;
pub mod error;
pub mod ll;
pub mod region;
pub mod roots;
pub mod runtime;
pub mod rwlock;
pub mod stat;
pub mod thread_registry;
pub mod utils;

pub use error::Error;
pub use runtime::Runtime;

/// A `Result` type for the public API, using [`Error`] for the taxonomy
/// described in `DESIGN.md`.
pub type Result<T> = std::result::Result<T, Error>;
