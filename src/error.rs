//! Error taxonomy for the public API.
//!
//! Transaction aborts are not part of this enum: they are an internal
//! control-transfer implemented with a panic-based sentinel
//! ([`crate::runtime::AbortSignal`]) caught only by the transaction driver,
//! never observed by callers.

use std::fmt;

/// Errors returned by the public, non-transactional API surface: opening
/// and mapping regions, allocating persistent memory, and the root-pointer
/// table.
#[derive(Debug)]
pub enum Error {
    /// The region could not be mapped at its required fixed address, or at
    /// all, after exhausting the retry budget.
    MappingError(String),
    /// The allocator could not satisfy a request; the pool is exhausted or
    /// too fragmented.
    OutOfMemory,
    /// The region's header failed validation on open (bad magic, truncated
    /// file, or a size mismatch against the compiled-in constant).
    CorruptRegion(String),
    /// The caller used the API in a way its contract forbids (e.g. a root
    /// index out of range, or a persistent-cell access outside any
    /// transaction where one was required).
    ApiMisuse(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::MappingError(msg) => write!(f, "mapping error: {msg}"),
            Error::OutOfMemory => write!(f, "out of memory"),
            Error::CorruptRegion(msg) => write!(f, "corrupt region: {msg}"),
            Error::ApiMisuse(msg) => write!(f, "API misuse: {msg}"),
        }
    }
}

impl std::error::Error for Error {}
