//! Bound shared by every runtime's root-pointer table.
//!
//! Each runtime keeps its own array of `Cell<u64>` — its own concrete
//! persistent-cell type — inside its header, so a root write goes through
//! that runtime's normal `PersistentCell::store` path (undo-logged, locked,
//! or buffered exactly like any other write) instead of bypassing it. This
//! module only holds the index bound every runtime's `get_object`/
//! `put_object` checks against before touching its own table.

use crate::error::Error;

/// Upper bound on named roots a single region can hold, matching
/// `MAX_ROOT_POINTERS` in the original.
pub const MAX_ROOT_POINTERS: usize = 64;

/// Rejects an out-of-range root index with the same error every runtime's
/// `get_object`/`put_object` reports for it.
pub fn check_index(index: usize) -> Result<(), Error> {
    if index >= MAX_ROOT_POINTERS {
        return Err(Error::ApiMisuse(format!(
            "root index {index} out of range (max {MAX_ROOT_POINTERS})"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn in_range_is_ok() {
        assert!(check_index(0).is_ok());
        assert!(check_index(MAX_ROOT_POINTERS - 1).is_ok());
    }

    #[test]
    fn out_of_range_is_api_misuse() {
        assert!(check_index(MAX_ROOT_POINTERS).is_err());
    }
}
