//! FasterKV store with ephemeral record locking
//!
//! The store owns the main log, the hash index, the overflow lock table, the
//! optional read cache and the epoch. Every operation resolves its key's
//! record source, locks it, and then either works in place or inserts a
//! tentative record that two-phase completion commits or invalidates.

mod ephemeral;
mod internal_lock;
mod ops;
mod resolve;
#[cfg(test)]
mod tests;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::address::Address;
use crate::allocator::{HybridLog, HybridLogConfig};
use crate::cache::{ReadCache, ReadCacheConfig};
use crate::checkpoint::{
    CheckpointError, CheckpointManager, CheckpointMetadata, CheckpointSettings, CheckpointToken,
    CheckpointType,
};
use crate::epoch::{EpochGuard, LightEpoch};
use crate::index::{HashIndex, KeyHash};
use crate::lock_table::{LockTable, DEFAULT_LOCK_TABLE_SHARDS};
use crate::record::Key;
use crate::status::{OperationStatus, Status};
use crate::store::record_source::{OperationStackContext, RecordSource};
use crate::store::{LockingMode, LockingSession, Session, SessionLocking, StoreStats, StoreStatsSnapshot};

pub(crate) use internal_lock::LockOperation;

/// Locking configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockingConfig {
    /// Locking mode of sessions started with `start_session`
    pub mode: LockingMode,
    /// Whether the overflow lock table is used
    pub lock_table_enabled: bool,
    /// Spin budget of one lock attempt on a lock word
    pub lock_spin_count: u32,
    /// How long a search waits for a tentative record to settle
    pub tentative_wait_spins: u32,
    /// How long an exclusive holder waits for its evicted record to close
    /// before closing it itself
    pub close_wait_spins: u32,
    /// Number of lock table shards
    pub lock_table_shards: usize,
}

impl LockingConfig {
    /// Default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the session locking mode
    pub fn with_mode(mut self, mode: LockingMode) -> Self {
        self.mode = mode;
        self
    }

    /// Enable or disable the lock table
    pub fn with_lock_table(mut self, enabled: bool) -> Self {
        self.lock_table_enabled = enabled;
        self
    }

    /// Set the lock attempt spin budget
    pub fn with_lock_spin_count(mut self, spins: u32) -> Self {
        self.lock_spin_count = spins;
        self
    }

    /// Set the tentative-record wait budget
    pub fn with_tentative_wait_spins(mut self, spins: u32) -> Self {
        self.tentative_wait_spins = spins;
        self
    }

    /// Set the close wait budget
    pub fn with_close_wait_spins(mut self, spins: u32) -> Self {
        self.close_wait_spins = spins;
        self
    }

    /// Set the number of lock table shards
    pub fn with_lock_table_shards(mut self, shards: usize) -> Self {
        self.lock_table_shards = shards;
        self
    }
}

impl Default for LockingConfig {
    fn default() -> Self {
        Self {
            mode: LockingMode::Ephemeral,
            lock_table_enabled: true,
            lock_spin_count: 64,
            tentative_wait_spins: 1 << 12,
            close_wait_spins: 1 << 12,
            lock_table_shards: DEFAULT_LOCK_TABLE_SHARDS,
        }
    }
}

/// Configuration for FasterKV
#[derive(Debug, Clone)]
pub struct FasterKvConfig {
    /// Hash table size (must be a power of 2)
    pub table_size: u64,
    /// Main log configuration
    pub log: HybridLogConfig,
    /// Copy records read from the evicted region to the log tail when the
    /// read cache is off
    pub copy_reads_to_tail: bool,
    /// Read cache; `None` disables it
    pub read_cache: Option<ReadCacheConfig>,
    /// Locking configuration
    pub locking: LockingConfig,
    /// Checkpoint settings
    pub checkpoint: CheckpointSettings,
}

impl FasterKvConfig {
    /// Create a new configuration
    pub fn new(table_size: u64, log_capacity: usize) -> Self {
        Self {
            table_size,
            log: HybridLogConfig {
                capacity: log_capacity,
                ..HybridLogConfig::default()
            },
            ..Self::default()
        }
    }

    /// Set how many of the newest records stay mutable
    pub fn with_mutable_records(mut self, mutable_records: u64) -> Self {
        self.log.mutable_records = mutable_records;
        self
    }

    /// Copy evicted reads to the tail
    pub fn with_copy_reads_to_tail(mut self, copy: bool) -> Self {
        self.copy_reads_to_tail = copy;
        self
    }

    /// Enable the read cache
    pub fn with_read_cache(mut self, config: ReadCacheConfig) -> Self {
        self.read_cache = Some(config);
        self
    }

    /// Set the locking configuration
    pub fn with_locking(mut self, locking: LockingConfig) -> Self {
        self.locking = locking;
        self
    }

    /// Set the checkpoint settings
    pub fn with_checkpoint(mut self, checkpoint: CheckpointSettings) -> Self {
        self.checkpoint = checkpoint;
        self
    }
}

impl Default for FasterKvConfig {
    fn default() -> Self {
        Self {
            table_size: 1 << 16,
            log: HybridLogConfig::default(),
            copy_reads_to_tail: false,
            read_cache: None,
            locking: LockingConfig::default(),
            checkpoint: CheckpointSettings::default(),
        }
    }
}

/// Per-attempt execution context: the session's epoch slot and locking
/// capability.
pub(crate) struct ExecutionContext<L> {
    pub(crate) slot: usize,
    pub(crate) locking: L,
}

/// FasterKV key-value store
///
/// Values are 8-byte words; keys are any [`Key`].
pub struct FasterKv<K: Key> {
    config: FasterKvConfig,
    index: HashIndex,
    hlog: Arc<HybridLog<K>>,
    read_cache: Option<ReadCache<K>>,
    lock_table: Arc<LockTable<K>>,
    epoch: LightEpoch,
    stats: Arc<StoreStats>,
    checkpoint_manager: Option<Arc<dyn CheckpointManager>>,
    checkpoint_version: AtomicU64,
}

impl<K: Key> FasterKv<K> {
    /// Create a new store
    pub fn new(config: FasterKvConfig) -> Result<Self, Status> {
        if config.locking.mode == LockingMode::Manual {
            // Manual locking is per context, not a session default.
            return Err(Status::InvalidArgument);
        }
        let index = HashIndex::new(config.table_size)?;
        let hlog = Arc::new(HybridLog::new(config.log)?);
        let read_cache = match config.read_cache {
            Some(rc_config) if rc_config.capacity > 0 => {
                Some(ReadCache::new(rc_config, config.locking.lock_spin_count))
            }
            Some(_) => return Err(Status::InvalidArgument),
            None => None,
        };
        let lock_table = Arc::new(LockTable::new(
            config.locking.lock_table_enabled,
            config.locking.lock_table_shards,
            config.locking.lock_spin_count,
            config.locking.tentative_wait_spins,
        ));
        let checkpoint_manager = config.checkpoint.resolve_manager().map_err(|error| {
            if tracing::enabled!(tracing::Level::WARN) {
                tracing::warn!(%error, "failed to open checkpoint manager");
            }
            Status::InvalidArgument
        })?;

        Ok(Self {
            config,
            index,
            hlog,
            read_cache,
            lock_table,
            epoch: LightEpoch::new(),
            stats: Arc::new(StoreStats::new()),
            checkpoint_manager,
            checkpoint_version: AtomicU64::new(0),
        })
    }

    /// Start a session with the configured locking mode
    pub fn start_session(self: &Arc<Self>) -> Result<Session<K>, Status> {
        self.start_session_with_mode(self.config.locking.mode)
    }

    /// Start a session with an explicit locking mode.
    ///
    /// `Manual` is not a session mode: manual locks are taken through
    /// [`Session::lockable`].
    pub fn start_session_with_mode(self: &Arc<Self>, mode: LockingMode) -> Result<Session<K>, Status> {
        if mode == LockingMode::Manual {
            return Err(Status::InvalidArgument);
        }
        let slot = self.epoch.acquire_slot().ok_or(Status::InvalidOperation)?;
        let locking = SessionLocking::new(mode, self.config.locking.lock_spin_count);
        Ok(Session::new(Arc::clone(self), slot, locking))
    }

    /// Store configuration
    pub fn config(&self) -> &FasterKvConfig {
        &self.config
    }

    /// The overflow lock table
    pub fn lock_table(&self) -> &LockTable<K> {
        &self.lock_table
    }

    /// The read cache, if enabled
    pub fn read_cache(&self) -> Option<&ReadCache<K>> {
        self.read_cache.as_ref()
    }

    /// The main log
    pub fn hlog(&self) -> &HybridLog<K> {
        &self.hlog
    }

    /// Locking statistics
    pub fn stats(&self) -> StoreStatsSnapshot {
        self.stats.snapshot()
    }

    /// Lowest in-memory address
    #[inline]
    pub fn head_address(&self) -> Address {
        self.hlog.get_head_address()
    }

    /// Lowest mutable address
    #[inline]
    pub fn read_only_address(&self) -> Address {
        self.hlog.get_read_only_address()
    }

    /// Next address to be allocated
    #[inline]
    pub fn tail_address(&self) -> Address {
        self.hlog.get_tail_address()
    }

    pub(crate) fn epoch(&self) -> &LightEpoch {
        &self.epoch
    }

    /// Move the read-only marker up to `new_address`
    pub fn shift_read_only_address(&self, new_address: Address) {
        self.hlog.shift_read_only_address(new_address);
    }

    /// Evict everything below `new_head`.
    ///
    /// Records below the new head are closed once every session has left the
    /// current epoch: their lock bits move into the lock table at that point.
    /// Returns the new head if it moved.
    pub fn shift_head_address(&self, new_head: Address) -> Option<Address> {
        let new_head = self.hlog.shift_head_address(new_head)?;
        let hlog = Arc::clone(&self.hlog);
        let lock_table = Arc::clone(&self.lock_table);
        let stats = Arc::clone(&self.stats);
        self.epoch.bump_current_epoch_with_action(move || {
            let closed = hlog.close_until(new_head, |record| match record.key() {
                Some(key) => {
                    lock_table.transfer_from_log_record(key, KeyHash::new(key.get_hash()), &record.info);
                }
                None => {
                    record.info.close();
                }
            });
            stats.record_evicted(closed);
            if tracing::enabled!(tracing::Level::DEBUG) {
                tracing::debug!(until = %new_head, closed, "closed evicted records");
            }
        });
        Some(new_head)
    }

    /// Evict the whole log
    pub fn evict_all(&self) -> Option<Address> {
        self.shift_head_address(self.tail_address())
    }

    /// Record a checkpoint of the log markers with the configured manager.
    ///
    /// A fold-over checkpoint first moves the read-only marker to the tail, so
    /// every record in the checkpoint is immutable and later updates append.
    pub fn checkpoint(&self) -> Result<CheckpointToken, CheckpointError> {
        let manager = self
            .checkpoint_manager
            .as_ref()
            .ok_or(CheckpointError::NotConfigured)?;
        let settings = &self.config.checkpoint;
        if let Some(delay) = settings.throttle_checkpoint_flush_delay {
            std::thread::sleep(delay);
        }
        if settings.checkpoint_type == CheckpointType::FoldOver {
            self.shift_read_only_address(self.tail_address());
        }

        let created_at_micros = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
            .as_micros() as u64;
        let metadata = CheckpointMetadata {
            token: Uuid::new_v4(),
            checkpoint_type: settings.checkpoint_type,
            version: self.checkpoint_version.fetch_add(1, Ordering::AcqRel) + 1,
            begin_address: self.hlog.get_begin_address().control(),
            head_address: self.head_address().control(),
            read_only_address: self.read_only_address().control(),
            tail_address: self.tail_address().control(),
            lock_table_entries: self.lock_table.len(),
            created_at_micros,
        };
        manager.commit(&metadata)?;

        if settings.remove_outdated {
            if let Err(error) = manager.remove_outdated() {
                if tracing::enabled!(tracing::Level::WARN) {
                    tracing::warn!(%error, token = %metadata.token, "failed to remove outdated checkpoints");
                }
            }
        }
        if tracing::enabled!(tracing::Level::DEBUG) {
            tracing::debug!(token = %metadata.token, version = metadata.version, "checkpoint committed");
        }
        Ok(metadata.token)
    }

    /// Run one operation to completion, retrying on `RetryLater`.
    ///
    /// The epoch is refreshed between attempts so that deferred closes can
    /// make progress.
    pub(crate) fn run_with_retry<L, F>(&self, ctx: &ExecutionContext<L>, mut attempt: F) -> Result<(), Status>
    where
        L: LockingSession,
        F: FnMut(&Self, &ExecutionContext<L>) -> Result<OperationStatus, Status>,
    {
        let guard = EpochGuard::new(&self.epoch, ctx.slot);
        loop {
            match attempt(self, ctx)? {
                OperationStatus::Success => return Ok(()),
                OperationStatus::RetryLater => {
                    self.stats.record_retry();
                    if tracing::enabled!(tracing::Level::TRACE) {
                        tracing::trace!(slot = ctx.slot, "operation retry");
                    }
                    guard.refresh();
                    std::thread::yield_now();
                }
            }
        }
    }

    /// Snapshot the bucket for `hash` and skip its read cache prefix.
    pub(crate) fn new_stack_context(&self, hash: KeyHash) -> OperationStackContext {
        let hei = self.index.find_entry(hash);
        let (lowest, latest) = match &self.read_cache {
            Some(rc) => rc.skip(hei.address),
            None => (None, hei.address),
        };
        OperationStackContext {
            hei,
            rec_src: RecordSource::new(latest, lowest),
        }
    }
}

impl<K: Key> std::fmt::Debug for FasterKv<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FasterKv")
            .field("index", &self.index)
            .field("head", &self.head_address())
            .field("tail", &self.tail_address())
            .field("lock_table", &self.lock_table)
            .field("read_cache", &self.read_cache)
            .finish()
    }
}
