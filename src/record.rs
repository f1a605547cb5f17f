//! Record header and lock-state word.
//!
//! Every record in every tier (main log, read cache, lock table entry) carries a
//! `RecordInfo`: a single atomic word holding the hash-chain link, the record's
//! lock state and its lifecycle flags. The word is only ever mutated through
//! atomic read-modify-write operations; it is the single source of truth for a
//! record's lock status.

use std::fmt;
use std::hint;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::address::Address;

/// Keys stored in the log.
///
/// The hash must be stable for the lifetime of the store: it selects the hash
/// bucket and the lock table shard.
pub trait Key: Clone + Eq + fmt::Debug + Send + Sync + 'static {
    /// 64-bit hash of the key.
    fn get_hash(&self) -> u64;
}

impl Key for u64 {
    #[inline]
    fn get_hash(&self) -> u64 {
        xxhash_rust::xxh3::xxh3_64(&self.to_le_bytes())
    }
}

impl Key for u32 {
    #[inline]
    fn get_hash(&self) -> u64 {
        xxhash_rust::xxh3::xxh3_64(&self.to_le_bytes())
    }
}

impl Key for String {
    #[inline]
    fn get_hash(&self) -> u64 {
        xxhash_rust::xxh3::xxh3_64(self.as_bytes())
    }
}

impl Key for Vec<u8> {
    #[inline]
    fn get_hash(&self) -> u64 {
        xxhash_rust::xxh3::xxh3_64(self)
    }
}

/// Strength of a lock request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockType {
    /// Shared (read) lock; compatible with other shared locks.
    Shared,
    /// Exclusive (write) lock; incompatible with every other lock.
    Exclusive,
}

/// Lock bits extracted from a `RecordInfo` word.
///
/// This is what moves between tiers when locks are transferred.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LockState {
    /// Exclusive lock held
    pub exclusive: bool,
    /// Number of shared locks held
    pub shared: u8,
}

impl LockState {
    /// No locks.
    pub const UNLOCKED: Self = Self {
        exclusive: false,
        shared: 0,
    };

    /// A single exclusive lock.
    pub const EXCLUSIVE: Self = Self {
        exclusive: true,
        shared: 0,
    };

    /// Whether any lock is held.
    #[inline]
    pub const fn is_locked(&self) -> bool {
        self.exclusive || self.shared > 0
    }

    #[inline]
    const fn from_word(word: u64) -> Self {
        Self {
            exclusive: word & RecordInfo::EXCLUSIVE_BIT != 0,
            shared: ((word & RecordInfo::SHARED_MASK) >> RecordInfo::SHARED_SHIFT) as u8,
        }
    }

    #[inline]
    const fn to_bits(self) -> u64 {
        let mut bits = (self.shared as u64) << RecordInfo::SHARED_SHIFT;
        if self.exclusive {
            bits |= RecordInfo::EXCLUSIVE_BIT;
        }
        bits
    }

    /// Merge another lock state into this one.
    ///
    /// `None` when the result cannot be held by one lock word: two exclusive
    /// locks, or more shared locks than the count field holds.
    pub fn checked_merge(self, other: LockState) -> Option<LockState> {
        if self.exclusive && other.exclusive {
            return None;
        }
        let shared = self
            .shared
            .checked_add(other.shared)
            .filter(|shared| *shared <= RecordInfo::MAX_SHARED_LOCKS)?;
        Some(LockState {
            exclusive: self.exclusive || other.exclusive,
            shared,
        })
    }
}

/// Record header, internal to the store.
///
/// The header is 8 bytes:
/// - Previous address (48 bits): previous record in the hash chain
/// - Shared lock count (7 bits)
/// - Exclusive lock bit
/// - Tentative bit: inserted, not yet confirmed by two-phase completion
/// - Sealed bit: superseded by a newer version, pending unlink
/// - Valid bit: cleared for invalidated (logically dead) records
/// - Tombstone bit: delete marker
/// - Closed bit: evicted; lock bits have moved to the lock table
#[repr(C)]
pub struct RecordInfo {
    word: AtomicU64,
}

impl RecordInfo {
    /// Mask for the previous address (48 bits)
    const PREV_ADDR_MASK: u64 = (1 << 48) - 1;

    const SHARED_SHIFT: u32 = 48;
    const SHARED_BITS: u32 = 7;
    const SHARED_UNIT: u64 = 1 << Self::SHARED_SHIFT;
    const SHARED_MASK: u64 = ((1 << Self::SHARED_BITS) - 1) << Self::SHARED_SHIFT;

    const EXCLUSIVE_BIT: u64 = 1 << 55;
    const TENTATIVE_BIT: u64 = 1 << 56;
    const SEALED_BIT: u64 = 1 << 57;
    const VALID_BIT: u64 = 1 << 58;
    const TOMBSTONE_BIT: u64 = 1 << 59;
    const CLOSED_BIT: u64 = 1 << 60;

    const LOCK_MASK: u64 = Self::SHARED_MASK | Self::EXCLUSIVE_BIT;

    /// Maximum number of concurrent shared locks on one record.
    pub const MAX_SHARED_LOCKS: u8 = (1 << Self::SHARED_BITS) - 1;

    /// Create a valid record header.
    pub fn new(previous_address: Address, tentative: bool, tombstone: bool) -> Self {
        let mut word = (previous_address.control() & Self::PREV_ADDR_MASK) | Self::VALID_BIT;
        if tentative {
            word |= Self::TENTATIVE_BIT;
        }
        if tombstone {
            word |= Self::TOMBSTONE_BIT;
        }
        Self {
            word: AtomicU64::new(word),
        }
    }

    /// Create a record info from a raw control value.
    pub fn from_control(control: u64) -> Self {
        Self {
            word: AtomicU64::new(control),
        }
    }

    /// Get the raw control value.
    #[inline]
    pub fn control(&self) -> u64 {
        self.word.load(Ordering::Acquire)
    }

    /// Reinitialize a header that is not yet reachable by other threads.
    #[inline]
    pub(crate) fn reset(&self, previous_address: Address, tentative: bool, tombstone: bool) {
        let fresh = Self::new(previous_address, tentative, tombstone);
        self.word.store(fresh.control(), Ordering::Release);
    }

    /// Check if the record info is null (all zeros).
    #[inline]
    pub fn is_null(&self) -> bool {
        self.control() == 0
    }

    /// Get the previous address in the hash chain.
    #[inline]
    pub fn previous_address(&self) -> Address {
        Address::from_control(self.control() & Self::PREV_ADDR_MASK)
    }

    /// CAS the previous address; used to splice main-log records below the read cache.
    pub fn try_update_previous_address(&self, expected: Address, new: Address) -> bool {
        let mut current = self.control();
        loop {
            if current & Self::PREV_ADDR_MASK != expected.control() & Self::PREV_ADDR_MASK {
                return false;
            }
            let desired = (current & !Self::PREV_ADDR_MASK) | (new.control() & Self::PREV_ADDR_MASK);
            match self.word.compare_exchange_weak(
                current,
                desired,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    // ============ Flags ============

    /// Whether the record is still valid.
    #[inline]
    pub fn is_valid(&self) -> bool {
        self.control() & Self::VALID_BIT != 0
    }

    /// Whether the record has been invalidated.
    #[inline]
    pub fn is_invalid(&self) -> bool {
        !self.is_valid()
    }

    /// Whether the record is tentative.
    #[inline]
    pub fn is_tentative(&self) -> bool {
        self.control() & Self::TENTATIVE_BIT != 0
    }

    /// Whether the record is sealed.
    #[inline]
    pub fn is_sealed(&self) -> bool {
        self.control() & Self::SEALED_BIT != 0
    }

    /// Whether this is a tombstone (delete marker).
    #[inline]
    pub fn is_tombstone(&self) -> bool {
        self.control() & Self::TOMBSTONE_BIT != 0
    }

    /// Whether the record was closed by eviction.
    #[inline]
    pub fn is_closed(&self) -> bool {
        self.control() & Self::CLOSED_BIT != 0
    }

    /// Tentative or sealed: the record is between two committed states.
    #[inline]
    pub fn is_intermediate(&self) -> bool {
        Self::is_intermediate_word(self.control())
    }

    #[inline]
    const fn is_intermediate_word(word: u64) -> bool {
        word & (Self::TENTATIVE_BIT | Self::SEALED_BIT) != 0
    }

    /// Sealed, invalid or closed: locks on this record have moved elsewhere.
    #[inline]
    const fn is_moved_word(word: u64) -> bool {
        word & (Self::SEALED_BIT | Self::CLOSED_BIT) != 0 || word & Self::VALID_BIT == 0
    }

    /// Clear the tentative flag, making the record visible.
    #[inline]
    pub fn clear_tentative(&self) {
        let prev = self.word.fetch_and(!Self::TENTATIVE_BIT, Ordering::AcqRel);
        debug_assert!(prev & Self::TENTATIVE_BIT != 0, "record was not tentative");
    }

    /// Seal the record.
    #[inline]
    pub fn seal(&self) {
        self.word.fetch_or(Self::SEALED_BIT, Ordering::AcqRel);
    }

    /// Invalidate the record.
    #[inline]
    pub fn set_invalid(&self) {
        self.word.fetch_and(!Self::VALID_BIT, Ordering::AcqRel);
    }

    /// Invalidate a committed record only if nobody holds a lock on it.
    ///
    /// Returns true if the record is invalid afterwards. A locker racing with
    /// this call either gets its lock in first (and the call fails) or finds
    /// the record invalid.
    pub fn try_invalidate_unlocked(&self) -> bool {
        let mut expected = self.control();
        loop {
            if expected & Self::VALID_BIT == 0 {
                return true;
            }
            if expected & (Self::LOCK_MASK | Self::TENTATIVE_BIT) != 0 {
                return false;
            }
            match self.word.compare_exchange_weak(
                expected,
                expected & !Self::VALID_BIT,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => expected = actual,
            }
        }
    }

    // ============ Lock state ============

    /// Current lock bits.
    #[inline]
    pub fn lock_state(&self) -> LockState {
        LockState::from_word(self.control())
    }

    /// Whether an exclusive lock is held.
    #[inline]
    pub fn is_locked_exclusive(&self) -> bool {
        self.control() & Self::EXCLUSIVE_BIT != 0
    }

    /// Number of shared locks held.
    #[inline]
    pub fn num_locked_shared(&self) -> u8 {
        self.lock_state().shared
    }

    /// Whether any lock is held.
    #[inline]
    pub fn is_locked(&self) -> bool {
        self.control() & Self::LOCK_MASK != 0
    }

    /// Try to take the exclusive lock, spinning at most `spin_count` times.
    ///
    /// Fails without side effects if the record is intermediate (tentative or
    /// sealed), invalid, closed, or still locked when the budget runs out. The lock is
    /// only taken when no shared lock is held, so a failed attempt never leaves
    /// a half-acquired exclusive bit behind.
    pub fn try_lock_exclusive(&self, spin_count: u32) -> bool {
        let mut spins = spin_count;
        loop {
            let expected = self.control();
            if Self::is_intermediate_word(expected) || Self::is_moved_word(expected) {
                return false;
            }
            if expected & Self::LOCK_MASK == 0 {
                if self
                    .word
                    .compare_exchange(
                        expected,
                        expected | Self::EXCLUSIVE_BIT,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok()
                {
                    return true;
                }
            }
            if spins == 0 {
                return false;
            }
            spins -= 1;
            hint::spin_loop();
        }
    }

    /// Release the exclusive lock.
    ///
    /// Always succeeds, including on sealed or invalidated records: the holder
    /// must release so that waiters can observe the new state.
    #[inline]
    pub fn unlock_exclusive(&self) {
        let prev = self.word.fetch_and(!Self::EXCLUSIVE_BIT, Ordering::AcqRel);
        debug_assert!(
            prev & Self::EXCLUSIVE_BIT != 0,
            "unlock_exclusive on a record that was not exclusively locked"
        );
    }

    /// Try to take a shared lock, spinning at most `spin_count` times.
    pub fn try_lock_shared(&self, spin_count: u32) -> bool {
        let mut spins = spin_count;
        loop {
            let expected = self.control();
            if Self::is_intermediate_word(expected) || Self::is_moved_word(expected) {
                return false;
            }
            let saturated = expected & Self::SHARED_MASK == Self::SHARED_MASK;
            if expected & Self::EXCLUSIVE_BIT == 0 && !saturated {
                if self
                    .word
                    .compare_exchange(
                        expected,
                        expected + Self::SHARED_UNIT,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok()
                {
                    return true;
                }
            }
            if spins == 0 {
                return false;
            }
            spins -= 1;
            hint::spin_loop();
        }
    }

    /// Try to release a shared lock.
    ///
    /// Fails if the record is sealed, invalid or closed: its locks were moved to
    /// another record (copy-to-tail) or to the lock table (eviction), and the
    /// caller must chase the lock to its new location.
    pub fn try_unlock_shared(&self) -> bool {
        let mut expected = self.control();
        loop {
            if Self::is_moved_word(expected) {
                return false;
            }
            if expected & Self::SHARED_MASK == 0 {
                debug_assert!(false, "try_unlock_shared on a record with no shared locks");
                return false;
            }
            match self.word.compare_exchange_weak(
                expected,
                expected - Self::SHARED_UNIT,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => expected = actual,
            }
        }
    }

    /// Mark a new (tentative, unshared) record as exclusively locked.
    #[inline]
    pub fn initialize_lock_exclusive(&self) {
        debug_assert!(!self.is_locked(), "record is already locked");
        self.word.fetch_or(Self::EXCLUSIVE_BIT, Ordering::AcqRel);
    }

    /// OR transferred lock bits into a new (tentative) record.
    #[inline]
    pub fn transfer_locks_from(&self, locks: LockState) {
        let prev = self.word.fetch_or(locks.to_bits(), Ordering::AcqRel);
        debug_assert!(prev & Self::LOCK_MASK == 0, "transfer target is already locked");
    }

    /// Atomically invalidate a tentative record that lost its two-phase race.
    #[inline]
    pub fn set_invalid_atomic(&self) {
        let prev = self.word.fetch_and(!Self::VALID_BIT, Ordering::AcqRel);
        debug_assert!(
            prev & Self::TENTATIVE_BIT != 0,
            "only tentative records are invalidated by two-phase completion"
        );
    }

    /// Close the record for eviction, taking its lock bits.
    ///
    /// Returns `None` if another thread already closed it. The close is a
    /// single CAS, so a concurrent locker either acquires before the close (and
    /// its lock travels with the returned state) or fails afterwards.
    pub fn close(&self) -> Option<LockState> {
        let mut expected = self.control();
        loop {
            if expected & Self::CLOSED_BIT != 0 {
                return None;
            }
            let desired = (expected & !Self::LOCK_MASK) | Self::CLOSED_BIT;
            match self.word.compare_exchange_weak(
                expected,
                desired,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(LockState::from_word(expected)),
                Err(actual) => expected = actual,
            }
        }
    }

    /// Copy the source's read locks onto this (new, tentative) record and mark
    /// the source in the same atomic step.
    ///
    /// The source is sealed when `seal` is set (main-log source) or invalidated
    /// otherwise (read-cache source). `remove_ephemeral_lock` drops the
    /// caller's own shared lock from the copied count. An exclusive lock on the
    /// source blocks the copy unless `allow_xlock` is set (manual locking);
    /// waiting for it is bounded by `spin_count`.
    pub fn copy_read_locks_from_and_mark_source_atomic(
        &self,
        source: &RecordInfo,
        allow_xlock: bool,
        seal: bool,
        remove_ephemeral_lock: bool,
        spin_count: u32,
    ) -> bool {
        debug_assert!(self.is_tentative(), "must retain tentative until locks are copied");
        debug_assert!(!self.is_locked(), "must not have locks yet");

        let mut spins = spin_count;
        loop {
            let expected = source.control();
            if Self::is_moved_word(expected) {
                return false;
            }
            if expected & Self::EXCLUSIVE_BIT != 0 && !allow_xlock {
                if spins == 0 {
                    return false;
                }
                spins -= 1;
                hint::spin_loop();
                continue;
            }

            let mut locks = expected & Self::LOCK_MASK;
            if remove_ephemeral_lock {
                debug_assert!(locks & Self::SHARED_MASK != 0, "no ephemeral lock to remove");
                locks -= Self::SHARED_UNIT;
            }
            let mut desired = expected & !Self::LOCK_MASK;
            if seal {
                desired |= Self::SEALED_BIT;
            } else {
                desired &= !Self::VALID_BIT;
            }

            if source
                .word
                .compare_exchange_weak(expected, desired, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                // Counts are ORed in, so the target must still hold no locks.
                let prev = self.word.fetch_or(locks, Ordering::AcqRel);
                debug_assert!(prev & Self::LOCK_MASK == 0, "read locks copied onto a locked record");
                return true;
            }
        }
    }
}

impl Clone for RecordInfo {
    fn clone(&self) -> Self {
        Self::from_control(self.control())
    }
}

impl Default for RecordInfo {
    fn default() -> Self {
        Self::from_control(0)
    }
}

impl fmt::Debug for RecordInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let locks = self.lock_state();
        f.debug_struct("RecordInfo")
            .field("previous_address", &self.previous_address())
            .field("exclusive", &locks.exclusive)
            .field("shared", &locks.shared)
            .field("tentative", &self.is_tentative())
            .field("sealed", &self.is_sealed())
            .field("valid", &self.is_valid())
            .field("tombstone", &self.is_tombstone())
            .field("closed", &self.is_closed())
            .finish()
    }
}

// RecordInfo should be exactly 8 bytes.
const _: () = assert!(std::mem::size_of::<RecordInfo>() == 8);
