//! LightEpoch - Lightweight epoch-based memory reclamation
//!
//! Threads publish the epoch they entered at; deferred actions registered at an
//! epoch run once every protected thread has moved past it. The store uses this
//! to close evicted records only after no operation can still be working on
//! them from an older view of the head address.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::thread;
use std::time::Duration;

use crate::constants::{CACHE_LINE_BYTES, MAX_THREADS};

/// Special epoch value indicating the thread is not protected
const UNPROTECTED: u64 = 0;

/// Size of the drain list for deferred actions
const DRAIN_LIST_SIZE: usize = 256;

/// Entry in the epoch table (one per session slot)
#[repr(C, align(64))]
struct Entry {
    /// Local epoch value seen by this slot's owner
    local_current_epoch: AtomicU64,
    /// Whether a session owns this slot
    in_use: AtomicBool,
    /// Padding to fill cache line
    _padding: [u8; CACHE_LINE_BYTES - 9],
}

impl Entry {
    const fn new() -> Self {
        Self {
            local_current_epoch: AtomicU64::new(UNPROTECTED),
            in_use: AtomicBool::new(false),
            _padding: [0; CACHE_LINE_BYTES - 9],
        }
    }
}

/// Action to be performed when an epoch becomes safe to reclaim
struct EpochAction {
    /// The epoch when this action was registered
    epoch: AtomicU64,
    /// The callback to invoke
    callback: UnsafeCell<Option<Box<dyn FnOnce() + Send + 'static>>>,
}

impl EpochAction {
    /// Epoch value indicating this slot is free
    const FREE: u64 = u64::MAX;
    /// Epoch value indicating this slot is locked
    const LOCKED: u64 = u64::MAX - 1;

    const fn new() -> Self {
        Self {
            epoch: AtomicU64::new(Self::FREE),
            callback: UnsafeCell::new(None),
        }
    }

    /// Try to pop the action if the epoch has been reached
    fn try_pop(&self, expected_epoch: u64) -> bool {
        match self.epoch.compare_exchange(
            expected_epoch,
            Self::LOCKED,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {
                // SAFETY: the LOCKED state gives this thread exclusive access to the cell.
                let callback = unsafe { (*self.callback.get()).take() };
                self.epoch.store(Self::FREE, Ordering::Release);
                if let Some(cb) = callback {
                    cb();
                }
                true
            }
            Err(_) => false,
        }
    }

    /// Try to push a new action
    ///
    /// Returns `Err(callback)` if the CAS failed, so the caller can retry with it.
    fn try_push<F>(&self, prior_epoch: u64, callback: F) -> Result<(), F>
    where
        F: FnOnce() + Send + 'static,
    {
        match self.epoch.compare_exchange(
            Self::FREE,
            Self::LOCKED,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {
                // SAFETY: the LOCKED state gives this thread exclusive access to the cell.
                unsafe {
                    *self.callback.get() = Some(Box::new(callback));
                }
                self.epoch.store(prior_epoch, Ordering::Release);
                Ok(())
            }
            Err(_) => Err(callback),
        }
    }
}

// Safety: the callback cell is only touched while the slot is in the LOCKED state
unsafe impl Send for EpochAction {}
unsafe impl Sync for EpochAction {}

/// Lightweight epoch protection framework
///
/// Sessions acquire a slot in the epoch table for their lifetime and publish
/// their epoch into it on every operation.
pub struct LightEpoch {
    /// Per-slot epoch table
    table: Box<[Entry]>,
    /// List of deferred actions
    drain_list: Box<[EpochAction]>,
    /// Number of pending drain actions
    drain_count: AtomicU32,
    /// Current global epoch
    current_epoch: AtomicU64,
}

impl LightEpoch {
    /// Create a new LightEpoch instance
    pub fn new() -> Self {
        let table: Vec<Entry> = (0..MAX_THREADS).map(|_| Entry::new()).collect();
        let drain_list: Vec<EpochAction> =
            (0..DRAIN_LIST_SIZE).map(|_| EpochAction::new()).collect();

        Self {
            table: table.into_boxed_slice(),
            drain_list: drain_list.into_boxed_slice(),
            drain_count: AtomicU32::new(0),
            current_epoch: AtomicU64::new(1),
        }
    }

    /// Claim a free slot in the epoch table.
    ///
    /// Returns `None` when all `MAX_THREADS` slots are owned by live sessions.
    pub fn acquire_slot(&self) -> Option<usize> {
        self.table.iter().position(|entry| {
            entry
                .in_use
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        })
    }

    /// Return a slot to the table.
    pub fn release_slot(&self, slot: usize) {
        debug_assert!(slot < MAX_THREADS);
        self.unprotect(slot);
        let was_in_use = self.table[slot].in_use.swap(false, Ordering::AcqRel);
        debug_assert!(was_in_use, "released an epoch slot that was not acquired");
    }

    /// Enter the protected region
    ///
    /// Returns the current epoch value.
    #[inline]
    pub fn protect(&self, slot: usize) -> u64 {
        debug_assert!(slot < MAX_THREADS);
        let epoch = self.current_epoch.load(Ordering::Acquire);
        self.table[slot]
            .local_current_epoch
            .store(epoch, Ordering::Release);
        epoch
    }

    /// Enter (or refresh) the protected region and drain pending actions
    #[inline]
    pub fn protect_and_drain(&self, slot: usize) -> u64 {
        let epoch = self.protect(slot);
        if self.drain_count.load(Ordering::Acquire) > 0 {
            self.drain(epoch);
        }
        epoch
    }

    /// Check if the slot is currently protected
    #[inline]
    pub fn is_protected(&self, slot: usize) -> bool {
        debug_assert!(slot < MAX_THREADS);
        self.table[slot].local_current_epoch.load(Ordering::Acquire) != UNPROTECTED
    }

    /// Exit the protected region
    #[inline]
    pub fn unprotect(&self, slot: usize) {
        debug_assert!(slot < MAX_THREADS);
        self.table[slot]
            .local_current_epoch
            .store(UNPROTECTED, Ordering::Release);
    }

    /// Drain pending actions that are now safe to execute
    fn drain(&self, next_epoch: u64) {
        let safe_epoch = self.safe_to_reclaim_epoch(next_epoch);

        for action in self.drain_list.iter() {
            let trigger_epoch = action.epoch.load(Ordering::Acquire);
            if trigger_epoch <= safe_epoch
                && trigger_epoch != EpochAction::FREE
                && trigger_epoch != EpochAction::LOCKED
                && action.try_pop(trigger_epoch)
                && self.drain_count.fetch_sub(1, Ordering::AcqRel) == 1
            {
                break;
            }
        }
    }

    /// Increment the epoch and register a callback for when the old epoch is safe
    pub fn bump_current_epoch_with_action<F>(&self, callback: F) -> u64
    where
        F: FnOnce() + Send + 'static,
    {
        let prior_epoch = self.current_epoch.fetch_add(1, Ordering::AcqRel);

        let mut callback = Some(callback);
        let mut i = 0;
        let mut rounds = 0;
        loop {
            if self.drain_list[i].epoch.load(Ordering::Acquire) == EpochAction::FREE {
                if let Some(cb) = callback.take() {
                    // Count first so a concurrent drain never decrements below zero.
                    self.drain_count.fetch_add(1, Ordering::AcqRel);
                    match self.drain_list[i].try_push(prior_epoch, cb) {
                        Ok(()) => break,
                        Err(returned_cb) => {
                            self.drain_count.fetch_sub(1, Ordering::AcqRel);
                            callback = Some(returned_cb);
                        }
                    }
                }
            }

            i = (i + 1) % DRAIN_LIST_SIZE;
            if i == 0 {
                rounds += 1;
                self.drain(prior_epoch + 1);
                if rounds >= 500 {
                    thread::sleep(Duration::from_millis(1));
                    if tracing::enabled!(tracing::Level::WARN) {
                        tracing::warn!(prior_epoch, "epoch drain list full; running action inline");
                    }
                    if let Some(cb) = callback.take() {
                        cb();
                    }
                    break;
                }
            }
        }

        // Run the action right away if nobody is protected at the prior epoch.
        self.drain(prior_epoch + 1);
        prior_epoch + 1
    }

    /// Newest epoch that no protected slot can still observe
    fn safe_to_reclaim_epoch(&self, current_epoch: u64) -> u64 {
        let mut oldest_ongoing = current_epoch;

        for entry in self.table.iter() {
            let entry_epoch = entry.local_current_epoch.load(Ordering::Acquire);
            if entry_epoch != UNPROTECTED && entry_epoch < oldest_ongoing {
                oldest_ongoing = entry_epoch;
            }
        }

        oldest_ongoing.saturating_sub(1)
    }

    /// Number of actions still waiting to run
    pub fn pending_actions(&self) -> u32 {
        self.drain_count.load(Ordering::Acquire)
    }
}

impl Default for LightEpoch {
    fn default() -> Self {
        Self::new()
    }
}

// Safety: LightEpoch uses only atomic operations for thread-safe access
unsafe impl Send for LightEpoch {}
unsafe impl Sync for LightEpoch {}

/// RAII guard for epoch protection
pub struct EpochGuard<'a> {
    epoch: &'a LightEpoch,
    slot: usize,
}

impl<'a> EpochGuard<'a> {
    /// Protect `slot` (draining due actions) until the guard is dropped
    pub fn new(epoch: &'a LightEpoch, slot: usize) -> Self {
        epoch.protect_and_drain(slot);
        Self { epoch, slot }
    }

    /// Refresh the protected epoch, letting deferred actions make progress
    pub fn refresh(&self) {
        self.epoch.protect_and_drain(self.slot);
    }
}

impl<'a> Drop for EpochGuard<'a> {
    fn drop(&mut self) {
        self.epoch.unprotect(self.slot);
    }
}
