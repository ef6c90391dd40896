//! Lightweight, optional runtime counters, gated behind the `stat_perf`
//! feature the same way TSC-based timers are gated behind
//! `stat_perf`/`stat_print_flushes`. This module only tracks simple running
//! counts — commits, aborts, bytes allocated, flush calls — the
//! granularity useful for a PTM author tuning contention and allocator
//! behavior.

use std::sync::atomic::{AtomicU64, Ordering};

/// Per-runtime-instance counters. A runtime embeds one of these and bumps
/// it at commit/abort/allocate/flush points; reading is always allowed
/// regardless of the `stat_perf` feature; the counters just never move when
/// the feature is off.
#[derive(Default)]
pub struct Stats {
    commits: AtomicU64,
    aborts: AtomicU64,
    bytes_allocated: AtomicU64,
    flushes: AtomicU64,
}

impl Stats {
    pub const fn new() -> Self {
        Stats {
            commits: AtomicU64::new(0),
            aborts: AtomicU64::new(0),
            bytes_allocated: AtomicU64::new(0),
            flushes: AtomicU64::new(0),
        }
    }

    #[inline(always)]
    pub fn record_commit(&self) {
        #[cfg(feature = "stat_perf")]
        self.commits.fetch_add(1, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn record_abort(&self) {
        #[cfg(feature = "stat_perf")]
        self.aborts.fetch_add(1, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn record_alloc(&self, bytes: usize) {
        #[cfg(feature = "stat_perf")]
        self.bytes_allocated.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn record_flush(&self) {
        #[cfg(feature = "stat_perf")]
        self.flushes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn commits(&self) -> u64 {
        self.commits.load(Ordering::Relaxed)
    }

    pub fn aborts(&self) -> u64 {
        self.aborts.load(Ordering::Relaxed)
    }

    pub fn bytes_allocated(&self) -> u64 {
        self.bytes_allocated.load(Ordering::Relaxed)
    }

    pub fn flushes(&self) -> u64 {
        self.flushes.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn counters_start_at_zero() {
        let s = Stats::new();
        assert_eq!(s.commits(), 0);
        assert_eq!(s.aborts(), 0);
    }

    #[cfg(feature = "stat_perf")]
    #[test]
    fn counters_increment_when_enabled() {
        let s = Stats::new();
        s.record_commit();
        s.record_commit();
        s.record_abort();
        assert_eq!(s.commits(), 2);
        assert_eq!(s.aborts(), 1);
    }
}
