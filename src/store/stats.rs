//! Store-level locking statistics

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters for the locking protocol.
#[derive(Debug, Default)]
pub struct StoreStats {
    retries: AtomicU64,
    two_phase_update_failures: AtomicU64,
    copy_to_tail_failures: AtomicU64,
    unlock_chases: AtomicU64,
    closes_helped: AtomicU64,
    records_evicted: AtomicU64,
}

impl StoreStats {
    /// Create zeroed counters
    pub fn new() -> Self {
        Self::default()
    }

    /// An operation attempt returned `RetryLater`
    pub fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    /// A copy-on-write lost its two-phase race
    pub fn record_two_phase_update_failure(&self) {
        self.two_phase_update_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// A copy-to-tail lost its two-phase race
    pub fn record_copy_to_tail_failure(&self) {
        self.copy_to_tail_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// A shared unlock had to chase its lock into another tier
    pub fn record_unlock_chase(&self) {
        self.unlock_chases.fetch_add(1, Ordering::Relaxed);
    }

    /// A waiter closed an evicted record itself
    pub fn record_close_helped(&self) {
        self.closes_helped.fetch_add(1, Ordering::Relaxed);
    }

    /// Records closed by eviction
    pub fn record_evicted(&self, count: u64) {
        self.records_evicted.fetch_add(count, Ordering::Relaxed);
    }

    /// Point-in-time copy of all counters
    pub fn snapshot(&self) -> StoreStatsSnapshot {
        StoreStatsSnapshot {
            retries: self.retries.load(Ordering::Relaxed),
            two_phase_update_failures: self.two_phase_update_failures.load(Ordering::Relaxed),
            copy_to_tail_failures: self.copy_to_tail_failures.load(Ordering::Relaxed),
            unlock_chases: self.unlock_chases.load(Ordering::Relaxed),
            closes_helped: self.closes_helped.load(Ordering::Relaxed),
            records_evicted: self.records_evicted.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of [`StoreStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStatsSnapshot {
    /// Operation attempts that returned `RetryLater`
    pub retries: u64,
    /// Copy-on-write updates invalidated by two-phase completion
    pub two_phase_update_failures: u64,
    /// Copy-to-tail records invalidated by two-phase completion
    pub copy_to_tail_failures: u64,
    /// Shared unlocks that had to search for a migrated lock
    pub unlock_chases: u64,
    /// Evicted records closed by a waiting lock holder
    pub closes_helped: u64,
    /// Records closed by eviction
    pub records_evicted: u64,
}
