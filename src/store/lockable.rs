//! Manual locking
//!
//! A `LockableContext` takes locks that outlive single operations. Keys with
//! an in-memory record are locked on the record; other keys are locked
//! through the lock table. Operations run through the context check that the
//! right lock is held and take no ephemeral locks of their own.

use crate::index::KeyHash;
use crate::record::{Key, LockType};
use crate::status::Status;
use crate::store::faster_kv::{ExecutionContext, LockOperation};
use crate::store::{Session, SessionLocking};

/// Manual-locking view of a session.
///
/// Dropping the context releases every lock it still holds.
pub struct LockableContext<'s, K: Key> {
    session: &'s mut Session<K>,
    held: Vec<(K, LockType)>,
}

impl<'s, K: Key> LockableContext<'s, K> {
    pub(crate) fn new(session: &'s mut Session<K>) -> Self {
        Self {
            session,
            held: Vec::new(),
        }
    }

    #[inline]
    fn context(&self) -> ExecutionContext<SessionLocking> {
        self.session.context_with(SessionLocking::Manual)
    }

    fn run_lock(&self, key: &K, op: LockOperation, lock_type: LockType) -> Result<(), Status> {
        let hash = KeyHash::new(key.get_hash());
        let ctx = self.context();
        self.session
            .store()
            .run_with_retry(&ctx, |store, _| store.internal_lock(key, hash, op, lock_type))
    }

    /// Lock held on `key` by this context.
    pub fn held_lock(&self, key: &K) -> Option<LockType> {
        self.held
            .iter()
            .find(|(held_key, _)| held_key == key)
            .map(|(_, lock_type)| *lock_type)
    }

    /// Number of locks held by this context
    pub fn num_locks(&self) -> usize {
        self.held.len()
    }

    fn require(&self, key: &K, exclusive: bool) -> Result<(), Status> {
        match self.held_lock(key) {
            Some(LockType::Exclusive) => Ok(()),
            Some(LockType::Shared) if !exclusive => Ok(()),
            _ => Err(Status::InvalidOperation),
        }
    }

    /// Lock `key`, waiting (with epoch refresh) until the lock is granted.
    ///
    /// A context holds at most one lock per key.
    pub fn lock(&mut self, key: &K, lock_type: LockType) -> Status {
        if self.held_lock(key).is_some() {
            return Status::InvalidOperation;
        }
        match self.run_lock(key, LockOperation::Lock, lock_type) {
            Ok(()) => {
                self.held.push((key.clone(), lock_type));
                Status::Ok
            }
            Err(status) => status,
        }
    }

    /// Release a lock taken by this context.
    pub fn unlock(&mut self, key: &K, lock_type: LockType) -> Status {
        let Some(position) = self
            .held
            .iter()
            .position(|(held_key, held_type)| held_key == key && *held_type == lock_type)
        else {
            return Status::InvalidOperation;
        };
        match self.run_lock(key, LockOperation::Unlock, lock_type) {
            Ok(()) => {
                self.held.swap_remove(position);
                Status::Ok
            }
            Err(status) => status,
        }
    }

    /// Read a key locked by this context
    pub fn read(&mut self, key: &K) -> Result<Option<u64>, Status> {
        self.require(key, false)?;
        let hash = KeyHash::new(key.get_hash());
        let ctx = self.context();
        let mut output = None;
        self.session
            .store()
            .run_with_retry(&ctx, |store, ctx| store.internal_read(key, hash, ctx, &mut output))?;
        Ok(output)
    }

    /// Upsert a key exclusively locked by this context
    pub fn upsert(&mut self, key: K, value: u64) -> Status {
        if let Err(status) = self.require(&key, true) {
            return status;
        }
        let hash = KeyHash::new(key.get_hash());
        let ctx = self.context();
        match self
            .session
            .store()
            .run_with_retry(&ctx, |store, ctx| store.internal_upsert(&key, hash, value, ctx))
        {
            Ok(()) => Status::Ok,
            Err(status) => status,
        }
    }

    /// Read-modify-write a key exclusively locked by this context
    pub fn rmw<F>(&mut self, key: K, mut modifier: F) -> Status
    where
        F: FnMut(&mut u64) -> bool,
    {
        if let Err(status) = self.require(&key, true) {
            return status;
        }
        let hash = KeyHash::new(key.get_hash());
        let ctx = self.context();
        match self
            .session
            .store()
            .run_with_retry(&ctx, |store, ctx| store.internal_rmw(&key, hash, &mut modifier, ctx))
        {
            Ok(()) => Status::Ok,
            Err(status) => status,
        }
    }

    /// Delete a key exclusively locked by this context
    pub fn delete(&mut self, key: &K) -> Status {
        if let Err(status) = self.require(key, true) {
            return status;
        }
        let hash = KeyHash::new(key.get_hash());
        let ctx = self.context();
        match self
            .session
            .store()
            .run_with_retry(&ctx, |store, ctx| store.internal_delete(key, hash, ctx))
        {
            Ok(()) => Status::Ok,
            Err(status) => status,
        }
    }

    /// Copy a key locked by this context to the tail; its locks move along
    pub fn copy_to_tail(&mut self, key: &K) -> Status {
        if let Err(status) = self.require(key, false) {
            return status;
        }
        let hash = KeyHash::new(key.get_hash());
        let ctx = self.context();
        match self
            .session
            .store()
            .run_with_retry(&ctx, |store, ctx| store.internal_copy_to_tail(key, hash, ctx))
        {
            Ok(()) => Status::Ok,
            Err(status) => status,
        }
    }
}

impl<K: Key> Drop for LockableContext<'_, K> {
    fn drop(&mut self) {
        for (key, lock_type) in std::mem::take(&mut self.held).into_iter().rev() {
            if let Err(status) = self.run_lock(&key, LockOperation::Unlock, lock_type) {
                if tracing::enabled!(tracing::Level::WARN) {
                    tracing::warn!(?key, ?lock_type, %status, "failed to release manual lock");
                }
            }
        }
    }
}
