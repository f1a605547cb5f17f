//! Manual lock and unlock of a key in whichever tier holds its lock.

use crate::address::Address;
use crate::index::KeyHash;
use crate::lock_table::ManualLockResult;
use crate::record::{Key, LockType, RecordInfo};
use crate::status::{OperationStatus, Status};

use super::resolve::ChainSearch;
use super::FasterKv;

/// Direction of an `internal_lock` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LockOperation {
    Lock,
    Unlock,
}

impl<K: Key> FasterKv<K> {
    /// Lock or unlock `key` in the tier currently holding its lock.
    ///
    /// Used by manual locking and by shared-unlock chasing. A key with no
    /// in-memory record is locked through a tentative lock table entry that
    /// is re-validated against the log before it is committed.
    ///
    /// Manual locks need the lock table to survive eviction, so taking one on
    /// a store without a lock table is `InvalidOperation` in every tier.
    pub(crate) fn internal_lock(
        &self,
        key: &K,
        hash: KeyHash,
        op: LockOperation,
        lock_type: LockType,
    ) -> Result<OperationStatus, Status> {
        if op == LockOperation::Lock && !self.lock_table.is_enabled() {
            return Err(Status::InvalidOperation);
        }
        let mut stack = self.new_stack_context(hash);

        if self.find_in_read_cache(key, &mut stack, Address::INVALID) {
            let Some(record) = self.src_record(&stack.rec_src) else {
                return Ok(OperationStatus::RetryLater);
            };
            if record.info.is_tentative() {
                return Ok(OperationStatus::RetryLater);
            }
            return self.lock_in_memory(key, &record.info, op, lock_type);
        }

        match self.find_in_main_log(key, &mut stack) {
            ChainSearch::Found(_, record) => return self.lock_in_memory(key, &record.info, op, lock_type),
            ChainSearch::TentativeTimeout => return Ok(OperationStatus::RetryLater),
            ChainSearch::Absent => {}
        }
        if self.evicted_record_pending_close(key, &stack) {
            return Ok(OperationStatus::RetryLater);
        }

        if !self.lock_table.is_enabled() {
            return Err(Status::InvalidOperation);
        }
        match op {
            LockOperation::Lock => match self.lock_table.lock_manual(key, hash, lock_type) {
                ManualLockResult::Locked => Ok(OperationStatus::Success),
                ManualLockResult::Failed => Ok(OperationStatus::RetryLater),
                ManualLockResult::CreatedTentative => {
                    if self.key_in_memory(key, hash) {
                        self.lock_table.remove_tentative(key, hash);
                        Ok(OperationStatus::RetryLater)
                    } else {
                        self.lock_table.clear_tentative(key, hash);
                        Ok(OperationStatus::Success)
                    }
                }
            },
            LockOperation::Unlock => {
                if self.lock_table.unlock(key, hash, lock_type) {
                    Ok(OperationStatus::Success)
                } else {
                    Ok(OperationStatus::RetryLater)
                }
            }
        }
    }

    fn lock_in_memory(
        &self,
        key: &K,
        info: &RecordInfo,
        op: LockOperation,
        lock_type: LockType,
    ) -> Result<OperationStatus, Status> {
        let spin_count = self.config.locking.lock_spin_count;
        let done = match (op, lock_type) {
            (LockOperation::Lock, LockType::Exclusive) => info.try_lock_exclusive(spin_count),
            (LockOperation::Lock, LockType::Shared) => info.try_lock_shared(spin_count),
            (LockOperation::Unlock, LockType::Shared) => info.try_unlock_shared(),
            (LockOperation::Unlock, LockType::Exclusive) => {
                if !info.is_locked_exclusive() {
                    debug_assert!(false, "exclusive unlock of {key:?} without an exclusive lock");
                    return Err(Status::InvalidOperation);
                }
                info.unlock_exclusive();
                true
            }
        };
        if done {
            Ok(OperationStatus::Success)
        } else {
            Ok(OperationStatus::RetryLater)
        }
    }
}
