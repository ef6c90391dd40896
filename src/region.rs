//! Fixed-address persistent memory mapping, grounded on
//! `mapPersistentRegion()` in `TrinityFC.hpp`/`TrinityTL2.hpp`.
//!
//! Persistent pointers throughout this crate are raw virtual addresses, so
//! every runtime must map its backing file at the same fixed address every
//! time it is opened. An OS-chosen mapping address with pool-relative
//! offsets would not satisfy this requirement, so this module talks to
//! `mmap(2)` directly through `libc` rather than a higher-level mapping
//! crate.

use std::ffi::CString;
use std::os::unix::io::RawFd;

use crate::error::Error;

/// Number of times [`map_fixed`] retries before giving up, matching the
/// original's retry loop.
const MAP_ATTEMPTS: u32 = 4;

/// A persistent region mapped at a fixed virtual address.
pub struct Region {
    fd: RawFd,
    addr: *mut u8,
    size: usize,
    /// True if this run created the file fresh (size was zero before open);
    /// callers use this to decide whether to format a new header or recover
    /// an existing one.
    pub is_new: bool,
}

unsafe impl Send for Region {}
unsafe impl Sync for Region {}

impl Region {
    pub fn as_ptr(&self) -> *mut u8 {
        self.addr
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Offset of `ptr` (which must lie within this region) from the base of
    /// the mapping.
    ///
    /// # Safety
    /// `ptr` must point within `[self.as_ptr(), self.as_ptr() + self.size())`.
    pub unsafe fn offset_of(&self, ptr: *const u8) -> usize {
        (ptr as usize) - (self.addr as usize)
    }

    /// Recovers the absolute address of a previously recorded offset.
    pub fn at_offset(&self, off: usize) -> *mut u8 {
        unsafe { self.addr.add(off) }
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.addr as *mut libc::c_void, self.size);
            libc::close(self.fd);
        }
    }
}

/// Opens (creating if necessary) `path`, sizes it to `size` bytes, and maps
/// it at the fixed virtual address `base`.
///
/// Tries `MAP_SYNC | MAP_SHARED_VALIDATE` first (direct-access / DAX-backed
/// file systems), falling back to plain `MAP_SHARED` if the kernel or file
/// system rejects `MAP_SYNC`. Retries up to [`MAP_ATTEMPTS`] times if the
/// kernel hands back a different address than requested, unmapping and
/// sleeping briefly between attempts, exactly as `mapPersistentRegion()`
/// does in the original.
pub fn map_fixed(path: &str, base: usize, size: usize) -> Result<Region, Error> {
    let cpath = CString::new(path).map_err(|e| Error::MappingError(e.to_string()))?;

    let fd = unsafe { libc::open(cpath.as_ptr(), libc::O_RDWR | libc::O_CREAT, 0o666) };
    if fd < 0 {
        return Err(Error::MappingError(format!(
            "open({path}) failed: {}",
            std::io::Error::last_os_error()
        )));
    }

    let mut stat: libc::stat = unsafe { std::mem::zeroed() };
    if unsafe { libc::fstat(fd, &mut stat) } != 0 {
        unsafe { libc::close(fd) };
        return Err(Error::MappingError(format!(
            "fstat({path}) failed: {}",
            std::io::Error::last_os_error()
        )));
    }
    let is_new = stat.st_size == 0;

    if is_new && unsafe { libc::ftruncate(fd, size as libc::off_t) } != 0 {
        unsafe { libc::close(fd) };
        return Err(Error::MappingError(format!(
            "ftruncate({path}) failed: {}",
            std::io::Error::last_os_error()
        )));
    }

    let addr = map_with_retries(fd, base, size)?;

    Ok(Region {
        fd,
        addr,
        size,
        is_new,
    })
}

fn map_with_retries(fd: RawFd, base: usize, size: usize) -> Result<*mut u8, Error> {
    let mut last_err = None;
    for attempt in 0..MAP_ATTEMPTS {
        let flags = if attempt == 0 {
            libc::MAP_SHARED_VALIDATE | libc_map_sync()
        } else {
            libc::MAP_SHARED
        };
        let got = unsafe {
            libc::mmap(
                base as *mut libc::c_void,
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                flags | libc::MAP_FIXED,
                fd,
                0,
            )
        };
        if got == libc::MAP_FAILED {
            last_err = Some(std::io::Error::last_os_error());
            continue;
        }
        if got as usize == base {
            return Ok(got as *mut u8);
        }
        unsafe {
            libc::munmap(got, size);
        }
        std::thread::sleep(std::time::Duration::from_millis(10));
    }
    Err(Error::MappingError(format!(
        "could not map region at fixed address 0x{base:x} after {MAP_ATTEMPTS} attempts: {}",
        last_err
            .map(|e| e.to_string())
            .unwrap_or_else(|| "kernel returned a different address each time".into())
    )))
}

/// Maps an anonymous (non-file-backed) region at a fixed address. Used for
/// Trinity-VR-TL2's volatile replica, which mirrors hot persistent data in
/// DRAM for fast reads and carries no durability obligation of its own, so
/// it needs none of [`map_fixed`]'s DAX/retry machinery.
pub fn map_fixed_anon(base: usize, size: usize) -> Result<*mut u8, Error> {
    let got = unsafe {
        libc::mmap(
            base as *mut libc::c_void,
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_FIXED,
            -1,
            0,
        )
    };
    if got == libc::MAP_FAILED || got as usize != base {
        return Err(Error::MappingError(format!(
            "could not map anonymous region at fixed address 0x{base:x}"
        )));
    }
    Ok(got as *mut u8)
}

#[cfg(target_os = "linux")]
fn libc_map_sync() -> libc::c_int {
    // MAP_SYNC, not exposed by the libc crate on all targets.
    0x80000
}

#[cfg(not(target_os = "linux"))]
fn libc_map_sync() -> libc::c_int {
    0
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn map_and_unmap_roundtrip() {
        let path = format!("/tmp/trinity-ptm-test-region-{}", std::process::id());
        let base = 0x7f_0000_000_000usize;
        let size = 4096 * 16;
        {
            let region = map_fixed(&path, base, size).expect("map");
            assert!(region.is_new);
            assert_eq!(region.as_ptr() as usize, base);
            unsafe {
                *region.as_ptr() = 0x42;
            }
        }
        {
            let region = map_fixed(&path, base, size).expect("remap");
            assert!(!region.is_new);
            assert_eq!(unsafe { *region.as_ptr() }, 0x42);
        }
        std::fs::remove_file(&path).ok();
    }
}
