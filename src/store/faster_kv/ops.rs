//! Single-attempt read, upsert, RMW, delete and copy-to-tail.
//!
//! Every function here runs one attempt. `Ok(RetryLater)` leaves no lock
//! held; `Err` is final and is also returned with every lock released.

use std::sync::atomic::{fence, Ordering};

use crate::allocator::LogRecord;
use crate::cache::ReadCache;
use crate::index::KeyHash;
use crate::record::{Key, LockType};
use crate::status::{OperationStatus, Status};
use crate::store::record_source::OperationStackContext;
use crate::store::LockingSession;

use super::resolve::ChainSearch;
use super::{ExecutionContext, FasterKv};

/// Result of reading the value a new version is based on.
enum SourceValue {
    Live(u64),
    Missing,
    Retry,
}

impl<K: Key> FasterKv<K> {
    /// Mutable main-log record that can be updated in place.
    fn in_place_target(&self, stack: &OperationStackContext) -> Option<&LogRecord<K>> {
        if !stack.rec_src.has_main_log_src || stack.rec_src.logical_address < self.read_only_address() {
            return None;
        }
        self.src_record(&stack.rec_src)
            .filter(|record| !record.info.is_tombstone() && !record.info.is_sealed())
    }

    /// Current value of the key: from the locked source, or from the evicted
    /// region when the key has no in-memory record.
    fn source_value(&self, key: &K, stack: &OperationStackContext) -> SourceValue {
        if let Some(record) = self.src_record(&stack.rec_src) {
            if record.info.is_tombstone() {
                return SourceValue::Missing;
            }
            return SourceValue::Live(record.value());
        }
        match self.find_evicted(key, stack) {
            ChainSearch::Found(_, record) if !record.info.is_tombstone() => SourceValue::Live(record.value()),
            ChainSearch::Found(..) | ChainSearch::Absent => SourceValue::Missing,
            ChainSearch::TentativeTimeout => SourceValue::Retry,
        }
    }

    pub(crate) fn internal_read<L: LockingSession>(
        &self,
        key: &K,
        hash: KeyHash,
        ctx: &ExecutionContext<L>,
        output: &mut Option<u64>,
    ) -> Result<OperationStatus, Status> {
        let mut stack = self.new_stack_context(hash);
        if self
            .try_find_and_ephemeral_lock_record(key, &mut stack, ctx, LockType::Shared)
            .needs_retry()
        {
            return Ok(OperationStatus::RetryLater);
        }

        if let Some(record) = self.src_record(&stack.rec_src) {
            *output = (!record.info.is_tombstone()).then(|| record.value());
            self.ephemeral_sunlock(key, &mut stack, ctx);
            return Ok(OperationStatus::Success);
        }

        match self.find_evicted(key, &stack) {
            ChainSearch::Found(address, record) if !record.info.is_tombstone() => {
                let value = record.value();
                *output = Some(value);
                if address < self.head_address() {
                    self.promote_evicted_read(key, &mut stack, value, ctx);
                }
            }
            ChainSearch::Found(..) | ChainSearch::Absent => *output = None,
            ChainSearch::TentativeTimeout => {
                self.ephemeral_sunlock(key, &mut stack, ctx);
                return Ok(OperationStatus::RetryLater);
            }
        }
        self.ephemeral_sunlock(key, &mut stack, ctx);
        Ok(OperationStatus::Success)
    }

    /// Bring a record read from the evicted region back into memory.
    ///
    /// Best effort: a lost race or a full arena leaves the read's result
    /// untouched.
    fn promote_evicted_read<L: LockingSession>(
        &self,
        key: &K,
        stack: &mut OperationStackContext,
        value: u64,
        ctx: &ExecutionContext<L>,
    ) {
        if let Some(rc) = &self.read_cache {
            if rc.config().copy_to_tail {
                self.try_copy_to_read_cache(rc, key, stack, value, ctx);
            }
            return;
        }
        if self.config.copy_reads_to_tail {
            if let Err(status) = self.try_copy_to_log_tail(key, stack, value, ctx) {
                if tracing::enabled!(tracing::Level::TRACE) {
                    tracing::trace!(?key, %status, "copy of evicted read to tail skipped");
                }
            }
        }
    }

    fn try_copy_to_read_cache<L: LockingSession>(
        &self,
        rc: &ReadCache<K>,
        key: &K,
        stack: &mut OperationStackContext,
        value: u64,
        ctx: &ExecutionContext<L>,
    ) -> bool {
        // Another reader may have cached the key since the snapshot.
        let mut current = self.new_stack_context(stack.hei.hash);
        if self.find_in_read_cache(key, &mut current, stack.hei.address) {
            return false;
        }
        let Some((address, record)) = rc.allocate(key.clone(), value, stack.hei.address) else {
            if tracing::enabled!(tracing::Level::TRACE) {
                tracing::trace!(?key, "read cache full; read not cached");
            }
            return false;
        };
        let mut hei = stack.hei;
        if !self.index.try_update_entry(&mut hei, address) {
            record.info.set_invalid_atomic();
            return false;
        }

        fence(Ordering::SeqCst);
        if rc.skip(address).1 != stack.rec_src.latest_log_address {
            // A main-log record was spliced in below the cache prefix.
            record.info.set_invalid_atomic();
            return false;
        }
        self.complete_two_phase_copy_to_tail(key, stack, record, ctx)
    }

    fn try_copy_to_log_tail<L: LockingSession>(
        &self,
        key: &K,
        stack: &mut OperationStackContext,
        value: u64,
        ctx: &ExecutionContext<L>,
    ) -> Result<OperationStatus, Status> {
        let (address, record) = self
            .hlog
            .allocate(key.clone(), value, stack.rec_src.latest_log_address, false)?;
        if !self.try_insert_into_chain(stack, address) {
            record.info.set_invalid_atomic();
            return Ok(OperationStatus::RetryLater);
        }
        if !self.complete_two_phase_copy_to_tail(key, stack, record, ctx) {
            return Ok(OperationStatus::RetryLater);
        }
        Ok(OperationStatus::Success)
    }

    /// Append a new version of the key and complete it with two-phase update.
    ///
    /// Consumes the exclusive lock in every outcome.
    fn create_new_record<L: LockingSession>(
        &self,
        key: &K,
        stack: &mut OperationStackContext,
        value: u64,
        tombstone: bool,
        ctx: &ExecutionContext<L>,
    ) -> Result<OperationStatus, Status> {
        let (address, record) =
            match self
                .hlog
                .allocate(key.clone(), value, stack.rec_src.latest_log_address, tombstone)
            {
                Ok(allocated) => allocated,
                Err(status) => {
                    self.ephemeral_xunlock_and_abandon_update(key, stack, ctx);
                    return Err(status);
                }
            };

        if !self.try_insert_into_chain(stack, address) {
            record.info.set_invalid_atomic();
            self.ephemeral_xunlock_and_abandon_update(key, stack, ctx);
            return Ok(OperationStatus::RetryLater);
        }
        if !self.complete_two_phase_update(key, stack, address, record, ctx) {
            self.ephemeral_xunlock_and_abandon_update(key, stack, ctx);
            return Ok(OperationStatus::RetryLater);
        }
        self.ephemeral_xunlock_after_update(key, stack, ctx);
        Ok(OperationStatus::Success)
    }

    pub(crate) fn internal_upsert<L: LockingSession>(
        &self,
        key: &K,
        hash: KeyHash,
        value: u64,
        ctx: &ExecutionContext<L>,
    ) -> Result<OperationStatus, Status> {
        let mut stack = self.new_stack_context(hash);
        if self
            .try_find_and_ephemeral_lock_record(key, &mut stack, ctx, LockType::Exclusive)
            .needs_retry()
        {
            return Ok(OperationStatus::RetryLater);
        }

        if let Some(record) = self.in_place_target(&stack) {
            record.set_value(value);
            self.ephemeral_xunlock_after_update(key, &mut stack, ctx);
            return Ok(OperationStatus::Success);
        }
        self.create_new_record(key, &mut stack, value, false, ctx)
    }

    pub(crate) fn internal_rmw<L, F>(
        &self,
        key: &K,
        hash: KeyHash,
        modifier: &mut F,
        ctx: &ExecutionContext<L>,
    ) -> Result<OperationStatus, Status>
    where
        L: LockingSession,
        F: FnMut(&mut u64) -> bool,
    {
        let mut stack = self.new_stack_context(hash);
        if self
            .try_find_and_ephemeral_lock_record(key, &mut stack, ctx, LockType::Exclusive)
            .needs_retry()
        {
            return Ok(OperationStatus::RetryLater);
        }

        if let Some(record) = self.in_place_target(&stack) {
            let mut value = record.value();
            if !modifier(&mut value) {
                self.ephemeral_xunlock_and_abandon_update(key, &mut stack, ctx);
                return Err(Status::Aborted);
            }
            record.set_value(value);
            self.ephemeral_xunlock_after_update(key, &mut stack, ctx);
            return Ok(OperationStatus::Success);
        }

        let mut value = match self.source_value(key, &stack) {
            SourceValue::Live(value) => value,
            SourceValue::Missing => {
                self.ephemeral_xunlock_and_abandon_update(key, &mut stack, ctx);
                return Err(Status::NotFound);
            }
            SourceValue::Retry => {
                self.ephemeral_xunlock_and_abandon_update(key, &mut stack, ctx);
                return Ok(OperationStatus::RetryLater);
            }
        };
        if !modifier(&mut value) {
            self.ephemeral_xunlock_and_abandon_update(key, &mut stack, ctx);
            return Err(Status::Aborted);
        }
        self.create_new_record(key, &mut stack, value, false, ctx)
    }

    pub(crate) fn internal_delete<L: LockingSession>(
        &self,
        key: &K,
        hash: KeyHash,
        ctx: &ExecutionContext<L>,
    ) -> Result<OperationStatus, Status> {
        let mut stack = self.new_stack_context(hash);
        if self
            .try_find_and_ephemeral_lock_record(key, &mut stack, ctx, LockType::Exclusive)
            .needs_retry()
        {
            return Ok(OperationStatus::RetryLater);
        }
        self.create_new_record(key, &mut stack, 0, true, ctx)
    }

    /// Copy the key's current record to the tail of the log.
    ///
    /// A record already in the mutable region is left where it is.
    pub(crate) fn internal_copy_to_tail<L: LockingSession>(
        &self,
        key: &K,
        hash: KeyHash,
        ctx: &ExecutionContext<L>,
    ) -> Result<OperationStatus, Status> {
        let mut stack = self.new_stack_context(hash);
        if self
            .try_find_and_ephemeral_lock_record(key, &mut stack, ctx, LockType::Shared)
            .needs_retry()
        {
            return Ok(OperationStatus::RetryLater);
        }

        if stack.rec_src.has_main_log_src && stack.rec_src.logical_address >= self.read_only_address() {
            self.ephemeral_sunlock(key, &mut stack, ctx);
            return Ok(OperationStatus::Success);
        }

        let value = match self.source_value(key, &stack) {
            SourceValue::Live(value) => value,
            SourceValue::Missing => {
                self.ephemeral_sunlock(key, &mut stack, ctx);
                return Err(Status::NotFound);
            }
            SourceValue::Retry => {
                self.ephemeral_sunlock(key, &mut stack, ctx);
                return Ok(OperationStatus::RetryLater);
            }
        };
        let result = self.try_copy_to_log_tail(key, &mut stack, value, ctx);
        self.ephemeral_sunlock(key, &mut stack, ctx);
        result
    }
}
