//! Read cache statistics

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters kept by the read cache.
///
/// All counters are relaxed; a snapshot taken under concurrency is not a
/// consistent cut.
#[derive(Debug, Default)]
pub struct ReadCacheStats {
    lookups: AtomicU64,
    read_hits: AtomicU64,
    inserts: AtomicU64,
    inserts_refused: AtomicU64,
    invalidations: AtomicU64,
    two_phase_conflicts: AtomicU64,
    lock_transfers: AtomicU64,
}

impl ReadCacheStats {
    /// Create zeroed statistics
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_lookup(&self, hit: bool) {
        self.lookups.fetch_add(1, Ordering::Relaxed);
        if hit {
            self.read_hits.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_insert(&self, accepted: bool) {
        let counter = if accepted { &self.inserts } else { &self.inserts_refused };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_invalidation(&self) {
        self.invalidations.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_two_phase_conflict(&self) {
        self.two_phase_conflicts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_lock_transfer(&self) {
        self.lock_transfers.fetch_add(1, Ordering::Relaxed);
    }

    /// Lookups that found a valid record for the key
    pub fn read_hits(&self) -> u64 {
        self.read_hits.load(Ordering::Relaxed)
    }

    /// Cached copies retired because a newer version was committed
    pub fn invalidations(&self) -> u64 {
        self.invalidations.load(Ordering::Relaxed)
    }

    /// Read locks moved out of the cache by copy-to-tail
    pub fn lock_transfers(&self) -> u64 {
        self.lock_transfers.load(Ordering::Relaxed)
    }

    /// Fraction of lookups that hit, 0.0 with no lookups
    pub fn hit_rate(&self) -> f64 {
        let lookups = self.lookups.load(Ordering::Relaxed);
        if lookups == 0 {
            return 0.0;
        }
        self.read_hits() as f64 / lookups as f64
    }

    /// Copy out every counter.
    pub fn snapshot(&self) -> ReadCacheStatsSnapshot {
        ReadCacheStatsSnapshot {
            lookups: self.lookups.load(Ordering::Relaxed),
            read_hits: self.read_hits(),
            inserts: self.inserts.load(Ordering::Relaxed),
            inserts_refused: self.inserts_refused.load(Ordering::Relaxed),
            invalidations: self.invalidations(),
            two_phase_conflicts: self.two_phase_conflicts.load(Ordering::Relaxed),
            lock_transfers: self.lock_transfers(),
        }
    }
}

/// Snapshot of [`ReadCacheStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReadCacheStatsSnapshot {
    /// Lookups of a key in the cache prefix of its chain
    pub lookups: u64,
    /// Lookups that found a valid record
    pub read_hits: u64,
    /// Records copied into the cache
    pub inserts: u64,
    /// Copies skipped because the cache was full
    pub inserts_refused: u64,
    /// Cached copies retired by a newer committed version
    pub invalidations: u64,
    /// Two-phase completions refused because a cached copy was locked or
    /// still tentative
    pub two_phase_conflicts: u64,
    /// Read locks moved out of the cache by copy-to-tail
    pub lock_transfers: u64,
}
