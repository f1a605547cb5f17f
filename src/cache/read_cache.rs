//! Read cache tier
//!
//! Read cache records sit at the head of hash chains, ahead of every main-log
//! record of the same bucket. Addresses carry the read cache bit. A committed
//! read cache record is always at least as new as any main-log record of its
//! key, so lookups check it first.

use crate::address::Address;
use crate::allocator::{LogRecord, RecordArena};
use crate::cache::{ReadCacheConfig, ReadCacheStats};
use crate::index::HashEntryInfo;
use crate::record::{Key, RecordInfo};

/// The read cache.
pub struct ReadCache<K> {
    arena: RecordArena<K>,
    config: ReadCacheConfig,
    stats: ReadCacheStats,
    spin_count: u32,
}

impl<K: Key> ReadCache<K> {
    /// Create a new read cache
    pub fn new(config: ReadCacheConfig, spin_count: u32) -> Self {
        Self {
            arena: RecordArena::new(config.capacity),
            config,
            stats: ReadCacheStats::new(),
            spin_count,
        }
    }

    /// Get the configuration
    pub fn config(&self) -> &ReadCacheConfig {
        &self.config
    }

    /// Get the statistics
    pub fn stats(&self) -> &ReadCacheStats {
        &self.stats
    }

    /// Number of records inserted so far
    pub fn len(&self) -> usize {
        self.arena.len()
    }

    /// Whether the cache holds no record
    pub fn is_empty(&self) -> bool {
        self.arena.is_empty()
    }

    /// Record at a read cache address.
    #[inline]
    pub fn get(&self, address: Address) -> Option<&LogRecord<K>> {
        if !address.in_read_cache() {
            return None;
        }
        self.arena.get(address.read_cache_address())
    }

    /// Allocate a tentative record linked in front of `previous_address`.
    ///
    /// Returns `None` when the cache is full; the caller simply skips caching.
    pub fn allocate(&self, key: K, value: u64, previous_address: Address) -> Option<(Address, &LogRecord<K>)> {
        let allocated = self.arena.allocate(key, value, previous_address, false);
        self.stats.record_insert(allocated.is_some());
        allocated.map(|(address, record)| (address.to_read_cache(), record))
    }

    /// Skip the read cache prefix of a chain.
    ///
    /// Returns the lowest read cache address (if the chain starts in the
    /// cache) and the first main-log address below it.
    pub fn skip(&self, head: Address) -> (Option<Address>, Address) {
        let mut lowest = None;
        let mut address = head;
        while address.in_read_cache() {
            let Some(record) = self.get(address) else {
                break;
            };
            lowest = Some(address);
            address = record.info.previous_address();
        }
        (lowest, address)
    }

    /// Find the newest valid record for `key` among read cache addresses
    /// strictly above `until`.
    pub fn find(&self, key: &K, head: Address, until: Address) -> Option<(Address, &LogRecord<K>)> {
        let mut address = head;
        while address.in_read_cache() && address > until {
            let Some(record) = self.get(address) else {
                break;
            };
            if record.info.is_valid() && record.has_key(key) {
                self.stats.record_lookup(true);
                return Some((address, record));
            }
            address = record.info.previous_address();
        }
        self.stats.record_lookup(false);
        None
    }

    /// Read cache records of `key` inserted after the snapshot `since`.
    fn newer_records<'a>(
        &'a self,
        key: &'a K,
        head: Address,
        since: &HashEntryInfo,
    ) -> impl Iterator<Item = &'a LogRecord<K>> + 'a {
        let since = since.address;
        let mut address = head;
        std::iter::from_fn(move || {
            while address.in_read_cache() && address > since {
                let record = self.get(address)?;
                address = record.info.previous_address();
                if record.info.is_valid() && record.has_key(key) {
                    return Some(record);
                }
            }
            None
        })
    }

    /// Whether a copy-on-write for `key` may commit against the read cache.
    ///
    /// A read cache record inserted since the snapshot is a stale copy of the
    /// version being replaced. Unlocked copies are invalidated; a locked or
    /// still-tentative copy means another thread holds state the new record
    /// would not carry, so the update must retry.
    pub fn complete_two_phase_update(&self, key: &K, head: Address, since: &HashEntryInfo) -> bool {
        for record in self.newer_records(key, head, since) {
            if !record.info.try_invalidate_unlocked() {
                self.stats.record_two_phase_conflict();
                return false;
            }
            self.stats.record_invalidation();
        }
        true
    }

    /// Move read locks from a read cache record inserted since the snapshot
    /// onto `target`, invalidating it.
    ///
    /// `target` itself is skipped when it lives in the cache. When the
    /// caller's own shared lock migrated into such a record,
    /// `remove_ephemeral_lock` drops it from the copied count; the flag is
    /// cleared once that has happened.
    pub fn complete_two_phase_copy_to_tail(
        &self,
        key: &K,
        head: Address,
        since: &HashEntryInfo,
        target: &RecordInfo,
        allow_xlock: bool,
        remove_ephemeral_lock: &mut bool,
    ) -> bool {
        let newer = self
            .newer_records(key, head, since)
            .find(|record| !std::ptr::eq(&record.info, target));
        let Some(source) = newer else {
            return true;
        };
        if source.info.is_tentative() {
            self.stats.record_two_phase_conflict();
            return false;
        }
        let moved = target.copy_read_locks_from_and_mark_source_atomic(
            &source.info,
            allow_xlock,
            false,
            *remove_ephemeral_lock,
            self.spin_count,
        );
        if !moved {
            self.stats.record_two_phase_conflict();
            return false;
        }
        *remove_ephemeral_lock = false;
        self.stats.record_lock_transfer();
        if tracing::enabled!(tracing::Level::TRACE) {
            tracing::trace!(?key, "moved read locks out of read cache record");
        }
        true
    }
}

impl<K> std::fmt::Debug for ReadCache<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadCache")
            .field("config", &self.config)
            .field("len", &self.arena.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::KeyHash;

    fn cache() -> ReadCache<u64> {
        ReadCache::new(ReadCacheConfig::new(16), 2)
    }

    fn snapshot(address: Address) -> HashEntryInfo {
        HashEntryInfo {
            hash: KeyHash::new(0),
            address,
        }
    }

    fn insert(cache: &ReadCache<u64>, key: u64, value: u64, previous: Address) -> Address {
        let (address, record) = cache.allocate(key, value, previous).unwrap();
        record.info.clear_tentative();
        address
    }

    #[test]
    fn test_find_and_skip() {
        let cache = cache();
        let log_head = Address::from_control(100);
        let first = insert(&cache, 1, 10, log_head);
        let second = insert(&cache, 2, 20, first);
        assert!(first.in_read_cache());

        let (address, record) = cache.find(&1, second, Address::INVALID).unwrap();
        assert_eq!(address, first);
        assert_eq!(record.value(), 10);
        assert!(cache.find(&1, second, first).is_none());
        assert!(cache.find(&3, second, Address::INVALID).is_none());

        assert_eq!(cache.skip(second), (Some(first), log_head));
        assert_eq!(cache.skip(log_head), (None, log_head));
    }

    #[test]
    fn test_two_phase_update_invalidates_unlocked_copies() {
        let cache = cache();
        let log_head = Address::from_control(100);
        let since = snapshot(log_head);
        let copy = insert(&cache, 1, 10, log_head);

        assert!(cache.complete_two_phase_update(&1, copy, &since));
        assert!(cache.get(copy).unwrap().info.is_invalid());
        assert_eq!(cache.stats().invalidations(), 1);
    }

    #[test]
    fn test_two_phase_update_fails_on_locked_copy() {
        let cache = cache();
        let log_head = Address::from_control(100);
        let copy = insert(&cache, 1, 10, log_head);
        assert!(cache.get(copy).unwrap().info.try_lock_shared(0));

        assert!(!cache.complete_two_phase_update(&1, copy, &snapshot(log_head)));
        // A copy that predates the snapshot is not the update's concern.
        assert!(cache.complete_two_phase_update(&1, copy, &snapshot(copy)));
    }

    #[test]
    fn test_two_phase_copy_to_tail_moves_read_locks() {
        let cache = cache();
        let log_head = Address::from_control(100);
        let copy = insert(&cache, 1, 10, log_head);
        let source = &cache.get(copy).unwrap().info;
        assert!(source.try_lock_shared(0));
        assert!(source.try_lock_shared(0));

        let target = RecordInfo::new(log_head, true, false);
        let mut remove = true;
        assert!(cache.complete_two_phase_copy_to_tail(&1, copy, &snapshot(log_head), &target, false, &mut remove));
        assert!(!remove);
        assert_eq!(target.num_locked_shared(), 1);
        assert!(source.is_invalid());
        assert_eq!(cache.stats().lock_transfers(), 1);
    }
}
