//! Platform invalidation hooks.
//!
//! Structural changes to live translation tables follow break-before-make:
//! the stale entry is first marked invalid in place, then the platform is
//! told to purge any cached copies, and only then is the replacement
//! installed. The purge mechanism is platform property, so it is injected as
//! a trait object rather than probed globally.

use core::sync::atomic::{AtomicU64, Ordering};

use alloc::vec::Vec;
use spin::Mutex;

/// Cache-invalidation primitives for guest translation structures.
///
/// `addr` is the guest address the changed entry translates; `entry_now` is
/// the raw value sitting in the slot at invalidation time. Under
/// break-before-make that value always carries the invalid bit.
pub trait InvalidationOps: Send + Sync {
    /// Whether entry-granular invalidation reaches all agents at once.
    ///
    /// When this is false, callers fall back to
    /// [`invalidate_entry_local`](Self::invalidate_entry_local) followed by a
    /// full [`flush_space`](Self::flush_space).
    fn has_broadcast(&self) -> bool;

    /// Purges cached translations derived from one entry, on all agents.
    fn invalidate_entry(&self, addr: u64, entry_now: u64);

    /// Purges cached translations derived from one entry, locally only.
    fn invalidate_entry_local(&self, addr: u64, entry_now: u64);

    /// Purges every cached translation tagged with the given space token.
    fn flush_space(&self, token: u64);
}

/// No-op invalidation, claiming broadcast capability.
///
/// Suitable when nothing caches translations, e.g. most unit tests.
pub struct NoFlush;

impl InvalidationOps for NoFlush {
    fn has_broadcast(&self) -> bool {
        true
    }

    fn invalidate_entry(&self, _addr: u64, _entry_now: u64) {}

    fn invalidate_entry_local(&self, _addr: u64, _entry_now: u64) {}

    fn flush_space(&self, _token: u64) {}
}

/// Invalidation recorder for observing paging behavior.
///
/// Counts every call and keeps the `(addr, entry_now)` pairs handed to the
/// entry-granular hooks, so a test can assert both that a flush happened and
/// that the slot was already invalid when it did.
pub struct CountingFlush {
    broadcast: bool,
    entry_log: Mutex<Vec<(u64, u64)>>,
    local_entries: AtomicU64,
    space_flushes: AtomicU64,
}

impl CountingFlush {
    pub fn new(broadcast: bool) -> Self {
        Self {
            broadcast,
            entry_log: Mutex::new(Vec::new()),
            local_entries: AtomicU64::new(0),
            space_flushes: AtomicU64::new(0),
        }
    }

    /// All `(addr, entry_now)` pairs seen by [`InvalidationOps::invalidate_entry`].
    pub fn entry_invalidations(&self) -> Vec<(u64, u64)> {
        self.entry_log.lock().clone()
    }

    pub fn local_invalidations(&self) -> u64 {
        self.local_entries.load(Ordering::Relaxed)
    }

    pub fn space_flushes(&self) -> u64 {
        self.space_flushes.load(Ordering::Relaxed)
    }
}

impl InvalidationOps for CountingFlush {
    fn has_broadcast(&self) -> bool {
        self.broadcast
    }

    fn invalidate_entry(&self, addr: u64, entry_now: u64) {
        self.entry_log.lock().push((addr, entry_now));
    }

    fn invalidate_entry_local(&self, addr: u64, entry_now: u64) {
        let _ = (addr, entry_now);
        self.local_entries.fetch_add(1, Ordering::Relaxed);
    }

    fn flush_space(&self, _token: u64) {
        self.space_flushes.fetch_add(1, Ordering::Relaxed);
    }
}
