//! Low-level persistence primitives: cache-line write-back and ordering
//! fences, plus the `log!` verbose-tracing macro.

#![allow(unused)]

const CACHE_LINE_SIZE: usize = 64;

/// Writes back every cache line covering `[addr, addr+len)` without an
/// ordering fence. Corresponds to the original's `PWB` macro.
#[inline(always)]
pub fn pwb_range(addr: usize, len: usize) {
    if len == 0 {
        return;
    }
    let start = addr & !(CACHE_LINE_SIZE - 1);
    let end = addr + len;
    let mut line = start;
    while line < end {
        pwb_line(line);
        line += CACHE_LINE_SIZE;
    }
}

/// Write back the single cache line containing `obj`.
#[inline(always)]
pub fn pwb_obj<T: ?Sized>(obj: &T) {
    pwb_range(obj as *const T as *const u8 as usize, std::mem::size_of_val(obj));
}

#[cfg(target_arch = "x86_64")]
#[inline(always)]
fn pwb_line(addr: usize) {
    unsafe {
        let p = addr as *const u8;
        #[cfg(feature = "use_clwb")]
        {
            std::arch::x86_64::_mm_clwb(p as *const _);
            return;
        }
        #[cfg(all(feature = "use_clflushopt", not(feature = "use_clwb")))]
        {
            std::arch::x86_64::_mm_clflushopt(p as *const _);
            return;
        }
        #[cfg(not(any(feature = "use_clwb", feature = "use_clflushopt")))]
        {
            std::arch::x86_64::_mm_clflush(p);
        }
    }
}

#[cfg(not(target_arch = "x86_64"))]
#[inline(always)]
fn pwb_line(_addr: usize) {
    std::sync::atomic::fence(std::sync::atomic::Ordering::SeqCst);
}

/// Orders prior stores (and their write-backs) before later ones, without
/// forcing durability. Corresponds to `PFENCE`.
#[inline(always)]
pub fn pfence() {
    #[cfg(target_arch = "x86_64")]
    unsafe {
        std::arch::x86_64::_mm_sfence();
    }
    #[cfg(not(target_arch = "x86_64"))]
    std::sync::atomic::fence(std::sync::atomic::Ordering::SeqCst);
}

/// Orders and guarantees durability of everything written back before this
/// call returns. Corresponds to `PSYNC`.
#[inline(always)]
pub fn psync() {
    pfence();
}

/// ANSI-colored, feature-gated trace logging used at transaction-retry,
/// recovery, and allocator-exhaustion points. Compiles to nothing unless
/// the `verbose` feature is enabled.
#[macro_export]
macro_rules! log {
    ($tag:expr, $($arg:tt)*) => {{
        #[cfg(feature = "verbose")]
        {
            use term_painter::{Color, ToStyle};
            eprintln!("{} {}", Color::Cyan.bold().paint($tag), format!($($arg)*));
        }
        #[cfg(not(feature = "verbose"))]
        {
            let _ = $tag;
            let _ = format_args!($($arg)*);
        }
    }};
}
