//! Overflow lock table
//!
//! Holds lock state for keys that have no in-memory record: records that were
//! evicted while locked, and keys locked through the manual-locking API before
//! any record exists. Entries are keyed by key hash and key; each lives in one
//! shard guarded by a `parking_lot::Mutex`.
//!
//! Entry lifecycle:
//! - created by eviction (`transfer_from_log_record`) or by a manual lock
//!   (`lock_manual`, tentative until the caller re-validates against the log)
//! - removed when its last lock is released, or when its locks are transferred
//!   onto a new log or read cache record

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::index::KeyHash;
use crate::record::{Key, LockState, LockType, RecordInfo};

/// Default number of shards
pub const DEFAULT_LOCK_TABLE_SHARDS: usize = 64;

/// Snapshot of a lock table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockTableEntry {
    /// Locks held on the key
    pub locks: LockState,
    /// Created by a manual lock that has not been re-validated yet
    pub tentative: bool,
}

/// Result of a manual lock request against the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManualLockResult {
    /// Locked an existing, committed entry
    Locked,
    /// Created a new tentative entry holding the lock
    CreatedTentative,
    /// Incompatible lock or tentative entry present
    Failed,
}

struct Slot<K> {
    key: K,
    entry: LockTableEntry,
}

type Shard<K> = HashMap<KeyHash, Vec<Slot<K>>>;

/// The overflow lock table.
pub struct LockTable<K: Key> {
    shards: Box<[Mutex<Shard<K>>]>,
    count: AtomicUsize,
    enabled: bool,
    spin_count: u32,
    tentative_wait_spins: u32,
}

fn try_add_lock(locks: &mut LockState, lock_type: LockType) -> bool {
    match lock_type {
        LockType::Exclusive => {
            if locks.is_locked() {
                return false;
            }
            locks.exclusive = true;
        }
        LockType::Shared => {
            if locks.exclusive || locks.shared == RecordInfo::MAX_SHARED_LOCKS {
                return false;
            }
            locks.shared += 1;
        }
    }
    true
}

fn try_remove_lock(locks: &mut LockState, lock_type: LockType) -> bool {
    match lock_type {
        LockType::Exclusive => {
            if !locks.exclusive {
                return false;
            }
            locks.exclusive = false;
        }
        LockType::Shared => {
            if locks.shared == 0 {
                return false;
            }
            locks.shared -= 1;
        }
    }
    true
}

impl<K: Key> LockTable<K> {
    /// Create a lock table.
    ///
    /// A disabled table never holds entries: every query reports "absent" and
    /// eviction drops lock bits instead of moving them here. `spin_count`
    /// bounds ephemeral lock attempts; `tentative_wait_spins` bounds how long
    /// two-phase completion waits for a manual locker to settle a tentative
    /// entry.
    pub fn new(enabled: bool, num_shards: usize, spin_count: u32, tentative_wait_spins: u32) -> Self {
        let num_shards = num_shards.max(1).next_power_of_two();
        let shards = (0..num_shards)
            .map(|_| Mutex::new(HashMap::new()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            shards,
            count: AtomicUsize::new(0),
            enabled,
            spin_count,
            tentative_wait_spins,
        }
    }

    /// Whether the table was enabled at construction.
    #[inline]
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Whether the table may hold entries.
    ///
    /// SeqCst pairs with the SeqCst increment on insert: a thread that CASes a
    /// record into the log and then finds the table inactive cannot miss an
    /// entry inserted before its CAS.
    #[inline]
    pub fn is_active(&self) -> bool {
        self.enabled && self.count.load(Ordering::SeqCst) > 0
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    /// Whether the table holds no entry
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    fn shard(&self, hash: KeyHash) -> &Mutex<Shard<K>> {
        &self.shards[(hash.hash() as usize) & (self.shards.len() - 1)]
    }

    fn find_mut<'a>(shard: &'a mut Shard<K>, key: &K, hash: KeyHash) -> Option<&'a mut LockTableEntry> {
        shard
            .get_mut(&hash)?
            .iter_mut()
            .find(|slot| &slot.key == key)
            .map(|slot| &mut slot.entry)
    }

    fn insert(&self, shard: &mut Shard<K>, key: &K, hash: KeyHash, entry: LockTableEntry) {
        shard.entry(hash).or_default().push(Slot {
            key: key.clone(),
            entry,
        });
        self.count.fetch_add(1, Ordering::SeqCst);
    }

    fn remove_from(&self, shard: &mut Shard<K>, key: &K, hash: KeyHash) -> Option<LockTableEntry> {
        let slots = shard.get_mut(&hash)?;
        let position = slots.iter().position(|slot| &slot.key == key)?;
        let slot = slots.swap_remove(position);
        if slots.is_empty() {
            shard.remove(&hash);
        }
        self.count.fetch_sub(1, Ordering::SeqCst);
        Some(slot.entry)
    }

    /// Take an ephemeral lock on an existing entry.
    ///
    /// Returns `Some(true)` if the lock was taken, `Some(false)` if there is
    /// no entry (nothing to lock here), and `None` if the entry is tentative
    /// or holds an incompatible lock after the spin budget.
    pub fn try_lock_ephemeral(&self, key: &K, hash: KeyHash, lock_type: LockType) -> Option<bool> {
        if !self.enabled {
            return Some(false);
        }
        let mut spins = self.spin_count;
        loop {
            {
                let mut shard = self.shard(hash).lock();
                match Self::find_mut(&mut shard, key, hash) {
                    None => return Some(false),
                    Some(entry) if !entry.tentative => {
                        if try_add_lock(&mut entry.locks, lock_type) {
                            return Some(true);
                        }
                    }
                    Some(_) => {}
                }
            }
            if spins == 0 {
                return None;
            }
            spins -= 1;
            std::hint::spin_loop();
        }
    }

    /// Take a manual lock, creating a tentative entry if the key has none.
    ///
    /// The caller must re-validate a tentative entry against the log and then
    /// either `clear_tentative` or `remove_tentative` it.
    pub fn lock_manual(&self, key: &K, hash: KeyHash, lock_type: LockType) -> ManualLockResult {
        if !self.enabled {
            return ManualLockResult::Failed;
        }
        let mut shard = self.shard(hash).lock();
        match Self::find_mut(&mut shard, key, hash) {
            Some(entry) => {
                if !entry.tentative && try_add_lock(&mut entry.locks, lock_type) {
                    ManualLockResult::Locked
                } else {
                    ManualLockResult::Failed
                }
            }
            None => {
                let mut locks = LockState::UNLOCKED;
                try_add_lock(&mut locks, lock_type);
                self.insert(
                    &mut shard,
                    key,
                    hash,
                    LockTableEntry {
                        locks,
                        tentative: true,
                    },
                );
                ManualLockResult::CreatedTentative
            }
        }
    }

    /// Commit a tentative entry.
    pub fn clear_tentative(&self, key: &K, hash: KeyHash) {
        let mut shard = self.shard(hash).lock();
        if let Some(entry) = Self::find_mut(&mut shard, key, hash) {
            debug_assert!(entry.tentative, "entry was not tentative");
            entry.tentative = false;
        }
    }

    /// Back out a tentative entry.
    pub fn remove_tentative(&self, key: &K, hash: KeyHash) {
        let mut shard = self.shard(hash).lock();
        if Self::find_mut(&mut shard, key, hash).is_some_and(|entry| entry.tentative) {
            self.remove_from(&mut shard, key, hash);
        }
    }

    /// Release a lock held in the table; removes the entry once unlocked.
    ///
    /// Returns false if the key has no committed entry holding such a lock.
    pub fn unlock(&self, key: &K, hash: KeyHash, lock_type: LockType) -> bool {
        let mut shard = self.shard(hash).lock();
        let Some(entry) = Self::find_mut(&mut shard, key, hash) else {
            return false;
        };
        if entry.tentative || !try_remove_lock(&mut entry.locks, lock_type) {
            return false;
        }
        if !entry.locks.is_locked() {
            self.remove_from(&mut shard, key, hash);
        }
        true
    }

    /// Remove the key's entry regardless of its state.
    pub fn remove(&self, key: &K, hash: KeyHash) -> bool {
        let mut shard = self.shard(hash).lock();
        self.remove_from(&mut shard, key, hash).is_some()
    }

    /// Snapshot the key's entry.
    pub fn try_get(&self, key: &K, hash: KeyHash) -> Option<LockTableEntry> {
        let mut shard = self.shard(hash).lock();
        Self::find_mut(&mut shard, key, hash).map(|entry| *entry)
    }

    /// Move a committed entry's locks onto `target` and remove the entry.
    pub fn transfer_to_log_record(&self, key: &K, hash: KeyHash, target: &RecordInfo) -> bool {
        let mut shard = self.shard(hash).lock();
        match Self::find_mut(&mut shard, key, hash) {
            Some(entry) if !entry.tentative => {
                target.transfer_locks_from(entry.locks);
                self.remove_from(&mut shard, key, hash);
                true
            }
            _ => false,
        }
    }

    /// Close an evicted record, moving its lock bits into the table.
    ///
    /// The close and the insert happen under the shard lock, so any table
    /// lookup that observes the record as closed also observes its locks
    /// here. Returns true if this call closed the record.
    pub fn transfer_from_log_record(&self, key: &K, hash: KeyHash, source: &RecordInfo) -> bool {
        let mut shard = self.shard(hash).lock();
        let Some(locks) = source.close() else {
            return false;
        };
        if !locks.is_locked() {
            return true;
        }
        if !self.enabled {
            if tracing::enabled!(tracing::Level::WARN) {
                tracing::warn!(?key, ?locks, "lock table disabled; dropping locks of evicted record");
            }
            return true;
        }
        match Self::find_mut(&mut shard, key, hash) {
            Some(entry) => {
                entry.locks = match entry.locks.checked_merge(locks) {
                    Some(merged) => merged,
                    None => {
                        debug_assert!(false, "evicted locks of {key:?} overflow its lock table entry");
                        if tracing::enabled!(tracing::Level::WARN) {
                            tracing::warn!(?key, held = ?entry.locks, ?locks, "lock overflow; shared count saturated");
                        }
                        LockState {
                            exclusive: entry.locks.exclusive || locks.exclusive,
                            shared: RecordInfo::MAX_SHARED_LOCKS,
                        }
                    }
                };
                entry.tentative = false;
            }
            None => self.insert(
                &mut shard,
                key,
                hash,
                LockTableEntry {
                    locks,
                    tentative: false,
                },
            ),
        }
        if tracing::enabled!(tracing::Level::TRACE) {
            tracing::trace!(?key, ?locks, "moved locks of evicted record into lock table");
        }
        true
    }

    /// Whether a copy-on-write for `key` may commit.
    ///
    /// False iff a committed, locked entry exists for the key: some other
    /// thread holds a lock the new record would not carry. A tentative entry
    /// is waited on, since its manual locker either backs off after seeing
    /// the new record or commits a lock the update must respect. Gives up
    /// (false) if the entry stays tentative past the wait budget.
    pub fn complete_two_phase_update(&self, key: &K, hash: KeyHash) -> bool {
        if !self.is_active() {
            return true;
        }
        let mut spins = self.tentative_wait_spins;
        loop {
            {
                let mut shard = self.shard(hash).lock();
                match Self::find_mut(&mut shard, key, hash) {
                    None => return true,
                    Some(entry) if !entry.tentative => return !entry.locks.is_locked(),
                    Some(_) => {}
                }
            }
            if spins == 0 {
                return false;
            }
            spins -= 1;
            std::thread::yield_now();
        }
    }

    /// Move the key's locks onto a new copy-to-tail `target`.
    ///
    /// When `remove_ephemeral_lock` is set and a committed entry exists, the
    /// caller's own shared lock is in that entry: it is dropped before the
    /// transfer and the flag is cleared. An exclusive lock blocks the
    /// transfer unless `allow_xlock` is set. A tentative entry is waited on
    /// as in `complete_two_phase_update`.
    pub fn complete_two_phase_copy_to_tail(
        &self,
        key: &K,
        hash: KeyHash,
        target: &RecordInfo,
        allow_xlock: bool,
        remove_ephemeral_lock: &mut bool,
    ) -> bool {
        if !self.is_active() {
            return true;
        }
        let mut spins = self.tentative_wait_spins;
        loop {
            {
                let mut shard = self.shard(hash).lock();
                let Some(entry) = Self::find_mut(&mut shard, key, hash) else {
                    return true;
                };
                if !entry.tentative {
                    if entry.locks.exclusive && !allow_xlock {
                        return false;
                    }
                    let mut locks = entry.locks;
                    if *remove_ephemeral_lock {
                        debug_assert!(locks.shared > 0, "ephemeral lock missing from lock table entry");
                        locks.shared = locks.shared.saturating_sub(1);
                        *remove_ephemeral_lock = false;
                    }
                    target.transfer_locks_from(locks);
                    self.remove_from(&mut shard, key, hash);
                    return true;
                }
            }
            if spins == 0 {
                return false;
            }
            spins -= 1;
            std::thread::yield_now();
        }
    }
}

impl<K: Key> std::fmt::Debug for LockTable<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockTable")
            .field("enabled", &self.enabled)
            .field("shards", &self.shards.len())
            .field("entries", &self.len())
            .finish()
    }
}
