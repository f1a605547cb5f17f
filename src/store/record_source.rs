//! Per-operation record source descriptor.

use crate::address::Address;
use crate::index::HashEntryInfo;

/// Tier holding the authoritative record for an operation's key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Tier {
    /// No tier resolved yet, or the key has no in-memory record
    #[default]
    None,
    /// A read cache record
    ReadCache,
    /// A main-log record at or above the head address
    MainLog,
    /// Only a lock table entry
    LockTable,
}

/// Where an operation's source record lives and which locks the operation
/// holds on it.
///
/// Owned by one operation, stack-local, and cleared before the operation
/// returns. `has_in_memory_lock` means the operation holds a lock on the
/// record at `logical_address`; `has_lock_table_lock` means it holds a lock
/// on the key's lock table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordSource {
    /// Tier of the source
    pub tier: Tier,
    /// Address of the source record (read cache addresses carry the cache bit)
    pub logical_address: Address,
    /// First main-log address of the chain, below any read cache prefix
    pub latest_log_address: Address,
    /// Lowest read cache record of the chain; main-log inserts splice below it
    pub lowest_read_cache_address: Option<Address>,
    /// Holding a lock on the in-memory source record
    pub has_in_memory_lock: bool,
    /// Holding a lock on the key's lock table entry
    pub has_lock_table_lock: bool,
    /// The source is a main-log record
    pub has_main_log_src: bool,
    /// The source is an in-memory record (read cache or main log)
    pub has_in_memory_src: bool,
}

impl RecordSource {
    /// Descriptor for a chain whose main-log part starts at `latest_log_address`.
    pub fn new(latest_log_address: Address, lowest_read_cache_address: Option<Address>) -> Self {
        Self {
            tier: Tier::None,
            logical_address: Address::INVALID,
            latest_log_address,
            lowest_read_cache_address,
            has_in_memory_lock: false,
            has_lock_table_lock: false,
            has_main_log_src: false,
            has_in_memory_src: false,
        }
    }

    /// Whether an in-memory source record was found.
    #[inline]
    pub fn has_src(&self) -> bool {
        self.has_in_memory_src
    }

    /// Whether any lock is held.
    #[inline]
    pub fn has_lock(&self) -> bool {
        self.has_in_memory_lock || self.has_lock_table_lock
    }

    /// Whether the source is a read cache record.
    #[inline]
    pub fn has_read_cache_src(&self) -> bool {
        self.has_in_memory_src && !self.has_main_log_src
    }

    /// Point the descriptor at a read cache record.
    pub fn set_read_cache_src(&mut self, address: Address) {
        debug_assert!(address.in_read_cache());
        self.tier = Tier::ReadCache;
        self.logical_address = address;
        self.has_in_memory_src = true;
        self.has_main_log_src = false;
    }

    /// Point the descriptor at an in-memory main-log record.
    pub fn set_main_log_src(&mut self, address: Address) {
        debug_assert!(!address.in_read_cache());
        self.tier = Tier::MainLog;
        self.logical_address = address;
        self.has_in_memory_src = true;
        self.has_main_log_src = true;
    }

    /// Note that the only lock taken lives in the lock table.
    pub fn set_lock_table_lock(&mut self) {
        self.has_lock_table_lock = true;
        if !self.has_in_memory_src {
            self.tier = Tier::LockTable;
        }
    }

    /// Forget the source record without touching lock flags.
    pub fn clear_src(&mut self) {
        self.tier = if self.has_lock_table_lock {
            Tier::LockTable
        } else {
            Tier::None
        };
        self.logical_address = Address::INVALID;
        self.has_in_memory_src = false;
        self.has_main_log_src = false;
    }
}

/// Everything an operation keeps on its stack: the bucket snapshot and the
/// record source.
#[derive(Debug, Clone, Copy)]
pub(crate) struct OperationStackContext {
    pub(crate) hei: HashEntryInfo,
    pub(crate) rec_src: RecordSource,
}
