//! Sessions
//!
//! A session owns one epoch slot and a locking capability. Every operation
//! runs under epoch protection and is retried until it completes; retries
//! refresh the epoch so that deferred record closes can make progress.

use std::sync::Arc;

use uuid::Uuid;

use crate::index::KeyHash;
use crate::record::Key;
use crate::status::Status;
use crate::store::faster_kv::ExecutionContext;
use crate::store::{FasterKv, LockableContext, LockingMode, SessionLocking};

#[inline]
fn status_of(result: Result<(), Status>) -> Status {
    match result {
        Ok(()) => Status::Ok,
        Err(status) => status,
    }
}

/// A client session of a [`FasterKv`] store.
pub struct Session<K: Key> {
    store: Arc<FasterKv<K>>,
    guid: Uuid,
    slot: usize,
    locking: SessionLocking,
}

impl<K: Key> Session<K> {
    pub(crate) fn new(store: Arc<FasterKv<K>>, slot: usize, locking: SessionLocking) -> Self {
        Self {
            store,
            guid: Uuid::new_v4(),
            slot,
            locking,
        }
    }

    /// Get the session GUID
    #[inline]
    pub fn guid(&self) -> Uuid {
        self.guid
    }

    /// Get the epoch slot owned by the session
    #[inline]
    pub fn slot(&self) -> usize {
        self.slot
    }

    /// Locking mode of operations run directly on the session
    #[inline]
    pub fn locking_mode(&self) -> LockingMode {
        self.locking.mode()
    }

    /// The store this session belongs to
    pub fn store(&self) -> &Arc<FasterKv<K>> {
        &self.store
    }

    #[inline]
    pub(crate) fn context_with(&self, locking: SessionLocking) -> ExecutionContext<SessionLocking> {
        ExecutionContext {
            slot: self.slot,
            locking,
        }
    }

    #[inline]
    fn context(&self) -> ExecutionContext<SessionLocking> {
        self.context_with(self.locking)
    }

    /// Refresh the epoch, running deferred actions that became safe.
    pub fn refresh(&mut self) {
        let epoch = self.store.epoch();
        epoch.protect_and_drain(self.slot);
        epoch.unprotect(self.slot);
    }

    /// Read a value from the store
    ///
    /// Values read from the evicted region are brought back into memory when
    /// the read cache or `copy_reads_to_tail` is enabled.
    pub fn read(&mut self, key: &K) -> Result<Option<u64>, Status> {
        let hash = KeyHash::new(key.get_hash());
        let ctx = self.context();
        let mut output = None;
        self.store
            .run_with_retry(&ctx, |store, ctx| store.internal_read(key, hash, ctx, &mut output))?;
        Ok(output)
    }

    /// Upsert a key-value pair
    pub fn upsert(&mut self, key: K, value: u64) -> Status {
        let hash = KeyHash::new(key.get_hash());
        let ctx = self.context();
        status_of(
            self.store
                .run_with_retry(&ctx, |store, ctx| store.internal_upsert(&key, hash, value, ctx)),
        )
    }

    /// Perform a read-modify-write operation
    ///
    /// Returns `NotFound` for an absent or deleted key and `Aborted` when the
    /// modifier returns false. The modifier may run more than once if the
    /// operation has to retry; only the last run takes effect.
    pub fn rmw<F>(&mut self, key: K, mut modifier: F) -> Status
    where
        F: FnMut(&mut u64) -> bool,
    {
        let hash = KeyHash::new(key.get_hash());
        let ctx = self.context();
        status_of(
            self.store
                .run_with_retry(&ctx, |store, ctx| store.internal_rmw(&key, hash, &mut modifier, ctx)),
        )
    }

    /// Delete a key
    pub fn delete(&mut self, key: &K) -> Status {
        let hash = KeyHash::new(key.get_hash());
        let ctx = self.context();
        status_of(
            self.store
                .run_with_retry(&ctx, |store, ctx| store.internal_delete(key, hash, ctx)),
        )
    }

    /// Copy the key's current record to the tail of the log
    ///
    /// Records in the read-only region, in the read cache, or evicted are
    /// copied; a record in the mutable region is left alone.
    pub fn copy_to_tail(&mut self, key: &K) -> Status {
        let hash = KeyHash::new(key.get_hash());
        let ctx = self.context();
        status_of(
            self.store
                .run_with_retry(&ctx, |store, ctx| store.internal_copy_to_tail(key, hash, ctx)),
        )
    }

    /// Open a manual-locking context on this session.
    ///
    /// Locks taken through the context are held until unlocked or until the
    /// context is dropped.
    pub fn lockable(&mut self) -> LockableContext<'_, K> {
        LockableContext::new(self)
    }
}

impl<K: Key> Drop for Session<K> {
    fn drop(&mut self) {
        self.store.epoch().release_slot(self.slot);
    }
}

impl<K: Key> std::fmt::Debug for Session<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("guid", &self.guid)
            .field("slot", &self.slot)
            .field("locking", &self.locking)
            .finish()
    }
}
