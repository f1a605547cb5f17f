//! Ephemeral locking across tiers and two-phase completion.
//!
//! An operation locks its key wherever the key's authoritative lock lives:
//! on a read cache record, on an in-memory main-log record, or on a lock
//! table entry when the key has no in-memory record. New records are
//! inserted tentative and only become visible once two-phase completion has
//! checked the other tiers for locks the new record would not carry.

use std::sync::atomic::{fence, Ordering};

use crate::address::Address;
use crate::allocator::LogRecord;
use crate::index::KeyHash;
use crate::record::{Key, LockType};
use crate::status::OperationStatus;
use crate::store::record_source::OperationStackContext;
use crate::store::LockingSession;

use super::resolve::ChainSearch;
use super::{ExecutionContext, FasterKv, LockOperation};

impl<K: Key> FasterKv<K> {
    /// Resolve the key's record source and take an ephemeral lock on it.
    ///
    /// `Success` with no lock held means the key has no in-memory record and
    /// no lock table entry (or locking is disabled for the session).
    pub(super) fn try_find_and_ephemeral_lock_record<L: LockingSession>(
        &self,
        key: &K,
        stack: &mut OperationStackContext,
        ctx: &ExecutionContext<L>,
        lock_type: LockType,
    ) -> OperationStatus {
        if self.find_in_read_cache(key, stack, Address::INVALID) {
            return self.try_lock_in_memory_record(key, stack, ctx, lock_type);
        }

        if !ctx.locking.disable_ephemeral_locking() && self.lock_table.is_active() {
            match self.lock_table.try_lock_ephemeral(key, stack.hei.hash, lock_type) {
                None => return OperationStatus::RetryLater,
                Some(true) => stack.rec_src.set_lock_table_lock(),
                Some(false) => {}
            }
        }

        if !stack.rec_src.has_lock_table_lock {
            match self.find_in_main_log(key, stack) {
                ChainSearch::Found(..) => return self.try_lock_in_memory_record(key, stack, ctx, lock_type),
                ChainSearch::TentativeTimeout => return OperationStatus::RetryLater,
                ChainSearch::Absent => {
                    if self.evicted_record_pending_close(key, stack) {
                        return OperationStatus::RetryLater;
                    }
                }
            }
        }
        OperationStatus::Success
    }

    /// Lock the in-memory record the descriptor points at.
    ///
    /// Fails without side effects; on success only the in-memory lock flag
    /// is set, and only when the session takes ephemeral locks.
    fn try_lock_in_memory_record<L: LockingSession>(
        &self,
        key: &K,
        stack: &mut OperationStackContext,
        ctx: &ExecutionContext<L>,
        lock_type: LockType,
    ) -> OperationStatus {
        let Some(record) = self.src_record(&stack.rec_src) else {
            stack.rec_src.clear_src();
            return OperationStatus::RetryLater;
        };
        if record.info.is_tentative() {
            stack.rec_src.clear_src();
            return OperationStatus::RetryLater;
        }

        let locked = match lock_type {
            LockType::Shared => ctx.locking.try_lock_ephemeral_shared(&record.info),
            LockType::Exclusive => ctx.locking.try_lock_ephemeral_exclusive(&record.info),
        };
        if !locked {
            stack.rec_src.clear_src();
            return OperationStatus::RetryLater;
        }
        stack.rec_src.has_in_memory_lock = !ctx.locking.disable_ephemeral_locking();

        if record.info.is_invalid() {
            match lock_type {
                LockType::Shared => self.ephemeral_sunlock(key, stack, ctx),
                LockType::Exclusive => self.ephemeral_xunlock_and_abandon_update(key, stack, ctx),
            }
            stack.rec_src.clear_src();
            return OperationStatus::RetryLater;
        }
        OperationStatus::Success
    }

    /// Release a shared ephemeral lock wherever it ended up.
    ///
    /// The lock may have moved since it was taken: onto a newer record by
    /// copy-to-tail, or into the lock table by eviction. Both cases are
    /// found by chasing the key through the tiers.
    pub(super) fn ephemeral_sunlock<L: LockingSession>(
        &self,
        key: &K,
        stack: &mut OperationStackContext,
        ctx: &ExecutionContext<L>,
    ) {
        let src = &mut stack.rec_src;
        if !src.has_lock() {
            return;
        }
        let hash = stack.hei.hash;

        let released = if src.has_in_memory_lock {
            self.src_record(src)
                .is_some_and(|record| ctx.locking.try_unlock_ephemeral_shared(&record.info))
        } else {
            self.lock_table.unlock(key, hash, LockType::Shared)
        };
        src.has_in_memory_lock = false;
        src.has_lock_table_lock = false;
        if released {
            return;
        }

        self.stats.record_unlock_chase();
        if tracing::enabled!(tracing::Level::TRACE) {
            tracing::trace!(?key, "chasing migrated shared lock");
        }
        loop {
            match self.internal_lock(key, hash, LockOperation::Unlock, LockType::Shared) {
                Ok(OperationStatus::Success) => return,
                Ok(OperationStatus::RetryLater) => {
                    self.epoch.protect_and_drain(ctx.slot);
                    std::thread::yield_now();
                }
                Err(status) => {
                    debug_assert!(false, "shared lock of {key:?} not found: {status}");
                    return;
                }
            }
        }
    }

    /// Release the exclusive lock held by an operation.
    ///
    /// If the locked record fell below head, its lock bits are (or are about
    /// to be) in the lock table: wait for the close and release it there.
    fn release_exclusive<L: LockingSession>(
        &self,
        key: &K,
        stack: &mut OperationStackContext,
        ctx: &ExecutionContext<L>,
    ) {
        let hash = stack.hei.hash;
        let src = &mut stack.rec_src;
        if src.has_in_memory_lock {
            let address = src.logical_address;
            if let Some(record) = self.src_record(src) {
                if address.in_read_cache() || address >= self.head_address() {
                    ctx.locking.unlock_ephemeral_exclusive(&record.info);
                } else {
                    self.wait_until_record_is_closed(key, hash, record, ctx.slot);
                    self.lock_table.unlock(key, hash, LockType::Exclusive);
                }
            }
        } else if src.has_lock_table_lock {
            let unlocked = self.lock_table.unlock(key, hash, LockType::Exclusive);
            debug_assert!(unlocked, "exclusive lock of {key:?} missing from lock table");
        }
        src.has_in_memory_lock = false;
        src.has_lock_table_lock = false;
    }

    /// Release the exclusive lock after a committed update.
    pub(super) fn ephemeral_xunlock_after_update<L: LockingSession>(
        &self,
        key: &K,
        stack: &mut OperationStackContext,
        ctx: &ExecutionContext<L>,
    ) {
        self.release_exclusive(key, stack, ctx);
        stack.rec_src.clear_src();
    }

    /// Release the exclusive lock of an update that did not happen.
    ///
    /// No lock moves anywhere; the source is forgotten.
    pub(super) fn ephemeral_xunlock_and_abandon_update<L: LockingSession>(
        &self,
        key: &K,
        stack: &mut OperationStackContext,
        ctx: &ExecutionContext<L>,
    ) {
        self.release_exclusive(key, stack, ctx);
        stack.rec_src.clear_src();
    }

    /// Block until eviction has closed `record`.
    ///
    /// The wait refreshes the epoch so the deferred close can run. Once the
    /// budget is spent the record is closed here, which moves its lock bits
    /// into the lock table exactly as the deferred close would.
    pub(super) fn wait_until_record_is_closed(&self, key: &K, hash: KeyHash, record: &LogRecord<K>, slot: usize) {
        let mut spins = self.config.locking.close_wait_spins;
        while !record.info.is_closed() {
            if spins == 0 {
                if tracing::enabled!(tracing::Level::WARN) {
                    tracing::warn!(?key, "close of evicted record did not run in time; closing it here");
                }
                self.stats.record_close_helped();
                self.lock_table.transfer_from_log_record(key, hash, &record.info);
                return;
            }
            spins -= 1;
            self.epoch.protect_and_drain(slot);
            std::thread::yield_now();
        }
    }

    /// Splice a new main-log record into the key's chain.
    ///
    /// Below the read cache prefix when there is one (CAS on the lowest read
    /// cache record's link), otherwise at the bucket head.
    pub(super) fn try_insert_into_chain(&self, stack: &OperationStackContext, new_address: Address) -> bool {
        match stack.rec_src.lowest_read_cache_address {
            Some(lowest) => {
                let Some(rc_record) = self.read_cache.as_ref().and_then(|rc| rc.get(lowest)) else {
                    return false;
                };
                rc_record
                    .info
                    .try_update_previous_address(stack.rec_src.latest_log_address, new_address)
            }
            None => {
                let mut hei = stack.hei;
                self.index.try_update_entry(&mut hei, new_address)
            }
        }
    }

    /// Commit or invalidate a tentative copy-on-write record.
    ///
    /// Returns false when another tier holds a lock the new record would not
    /// carry; the new record is invalidated and the caller must release its
    /// lock and retry.
    pub(super) fn complete_two_phase_update<L: LockingSession>(
        &self,
        key: &K,
        stack: &mut OperationStackContext,
        new_address: Address,
        new_record: &LogRecord<K>,
        ctx: &ExecutionContext<L>,
    ) -> bool {
        fence(Ordering::SeqCst);
        let hash = stack.hei.hash;
        let manual = ctx.locking.is_manual_locking();

        if manual {
            if stack.rec_src.has_src() {
                new_record.info.initialize_lock_exclusive();
            } else if !self.lock_table.transfer_to_log_record(key, hash, &new_record.info) {
                debug_assert!(false, "manual lock of {key:?} missing from lock table");
                new_record.info.set_invalid_atomic();
                return false;
            }
        } else {
            let read_cache_ok = || {
                self.read_cache.as_ref().map_or(true, |rc| {
                    rc.complete_two_phase_update(key, self.index.current_address(hash), &stack.hei)
                })
            };
            let committed = if stack.rec_src.has_lock_table_lock {
                read_cache_ok() && self.lock_table.transfer_to_log_record(key, hash, &new_record.info)
            } else {
                self.lock_table.complete_two_phase_update(key, hash) && read_cache_ok()
            };
            if !committed {
                new_record.info.set_invalid_atomic();
                self.stats.record_two_phase_update_failure();
                if tracing::enabled!(tracing::Level::TRACE) {
                    tracing::trace!(?key, address = %new_address, "two-phase update lost; record invalidated");
                }
                return false;
            }
        }

        if let Some(source) = self.src_record(&stack.rec_src) {
            if stack.rec_src.has_main_log_src {
                source.info.seal();
            } else {
                source.info.set_invalid();
            }
            if manual {
                // The caller's lock now lives on the new record.
                source.info.unlock_exclusive();
            }
        }

        if !manual && stack.rec_src.has_lock_table_lock {
            // The exclusive lock moved with the entry; release it there.
            stack.rec_src.set_main_log_src(new_address);
            stack.rec_src.has_in_memory_lock = true;
            stack.rec_src.has_lock_table_lock = false;
        }
        new_record.info.clear_tentative();
        true
    }

    /// Commit or invalidate a tentative copy-to-tail record, moving read
    /// locks from the tier it replaces.
    pub(super) fn complete_two_phase_copy_to_tail<L: LockingSession>(
        &self,
        key: &K,
        stack: &mut OperationStackContext,
        new_record: &LogRecord<K>,
        ctx: &ExecutionContext<L>,
    ) -> bool {
        fence(Ordering::SeqCst);
        let hash = stack.hei.hash;
        let manual = ctx.locking.is_manual_locking();

        let committed = if stack.rec_src.has_src() {
            match self.src_record(&stack.rec_src) {
                Some(source) => {
                    let moved = new_record.info.copy_read_locks_from_and_mark_source_atomic(
                        &source.info,
                        manual,
                        stack.rec_src.has_main_log_src,
                        stack.rec_src.has_in_memory_lock,
                        self.config.locking.lock_spin_count,
                    );
                    if moved {
                        stack.rec_src.has_in_memory_lock = false;
                    }
                    moved
                }
                None => false,
            }
        } else if manual {
            let moved = self.lock_table.transfer_to_log_record(key, hash, &new_record.info);
            debug_assert!(moved, "manual lock of {key:?} missing from lock table");
            moved
        } else {
            self.complete_two_phase_copy_to_tail_from_lock_table(key, stack, new_record)
        };

        if committed {
            new_record.info.clear_tentative();
        } else {
            new_record.info.set_invalid_atomic();
            self.stats.record_copy_to_tail_failure();
            if tracing::enabled!(tracing::Level::TRACE) {
                tracing::trace!(?key, "copy-to-tail lost; record invalidated");
            }
        }
        committed
    }

    /// Ephemeral copy-to-tail of a key with no in-memory record: take the
    /// lock table's locks, then any read cache record that appeared since the
    /// snapshot. Both must succeed.
    fn complete_two_phase_copy_to_tail_from_lock_table(
        &self,
        key: &K,
        stack: &mut OperationStackContext,
        new_record: &LogRecord<K>,
    ) -> bool {
        let hash = stack.hei.hash;
        let mut remove = stack.rec_src.has_lock_table_lock;
        let lock_table_ok =
            self.lock_table
                .complete_two_phase_copy_to_tail(key, hash, &new_record.info, false, &mut remove);
        let committed = lock_table_ok
            && self.read_cache.as_ref().map_or(true, |rc| {
                rc.complete_two_phase_copy_to_tail(
                    key,
                    self.index.current_address(hash),
                    &stack.hei,
                    &new_record.info,
                    false,
                    &mut remove,
                )
            });

        if !committed && lock_table_ok && new_record.info.is_locked() {
            // Hand the lock table's locks back before the record is invalidated.
            self.lock_table.transfer_from_log_record(key, hash, &new_record.info);
        }
        if stack.rec_src.has_lock_table_lock && !remove {
            // Our own shared lock was dropped during the transfer.
            stack.rec_src.has_lock_table_lock = false;
        }
        committed
    }
}
