//! Hybrid log: the main record arena plus its region markers.

use std::sync::atomic::Ordering;

use crate::address::{Address, AtomicAddress};
use crate::allocator::{LogRecord, RecordArena};
use crate::status::Status;

/// Configuration for the hybrid log
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HybridLogConfig {
    /// Maximum number of records the log can hold
    pub capacity: usize,
    /// Number of most recent records kept in the mutable region.
    ///
    /// The read-only address trails the tail by this many records. Zero makes
    /// every update a copy-on-write.
    pub mutable_records: u64,
}

impl HybridLogConfig {
    /// Create a new configuration
    pub fn new(capacity: usize, mutable_records: u64) -> Self {
        Self {
            capacity,
            mutable_records,
        }
    }
}

impl Default for HybridLogConfig {
    fn default() -> Self {
        Self {
            capacity: 1 << 20,
            mutable_records: 1 << 18,
        }
    }
}

/// The main log.
///
/// Marker invariant: `begin <= closed_until <= head <= read_only <= tail`.
/// Records in `[closed_until, head)` are being evicted: readers treat them as
/// on disk, but their lock bits have not yet moved to the lock table.
pub struct HybridLog<K> {
    arena: RecordArena<K>,
    config: HybridLogConfig,
    read_only_address: AtomicAddress,
    head_address: AtomicAddress,
    closed_until_address: AtomicAddress,
}

impl<K> HybridLog<K> {
    /// Create an empty log.
    pub fn new(config: HybridLogConfig) -> Result<Self, Status> {
        if config.capacity == 0 {
            return Err(Status::InvalidArgument);
        }
        Ok(Self {
            arena: RecordArena::new(config.capacity),
            config,
            read_only_address: AtomicAddress::new(Address::FIRST_VALID),
            head_address: AtomicAddress::new(Address::FIRST_VALID),
            closed_until_address: AtomicAddress::new(Address::FIRST_VALID),
        })
    }

    /// Log configuration
    pub fn config(&self) -> &HybridLogConfig {
        &self.config
    }

    /// Get the begin address
    #[inline]
    pub fn get_begin_address(&self) -> Address {
        Address::FIRST_VALID
    }

    /// Get the current tail address
    #[inline]
    pub fn get_tail_address(&self) -> Address {
        self.arena.tail_address()
    }

    /// Get the read-only address boundary
    #[inline]
    pub fn get_read_only_address(&self) -> Address {
        self.read_only_address.load(Ordering::Acquire)
    }

    /// Get the head address
    #[inline]
    pub fn get_head_address(&self) -> Address {
        self.head_address.load(Ordering::Acquire)
    }

    /// Everything below this address has been closed.
    #[inline]
    pub fn get_closed_until_address(&self) -> Address {
        self.closed_until_address.load(Ordering::Acquire)
    }

    /// Number of records allocated so far
    pub fn len(&self) -> usize {
        self.arena.len()
    }

    /// Whether the log holds no record
    pub fn is_empty(&self) -> bool {
        self.arena.is_empty()
    }

    /// Append a tentative record at the tail.
    ///
    /// Pushes the read-only address along so that it trails the tail by
    /// `mutable_records`.
    pub fn allocate(
        &self,
        key: K,
        value: u64,
        previous_address: Address,
        tombstone: bool,
    ) -> Result<(Address, &LogRecord<K>), Status> {
        let (address, record) = self
            .arena
            .allocate(key, value, previous_address, tombstone)
            .ok_or(Status::OutOfMemory)?;
        let tail = address + 1;
        if tail - Address::FIRST_VALID > self.config.mutable_records {
            self.shift_read_only_address(Address::from_control(
                tail.control() - self.config.mutable_records,
            ));
        }
        Ok((address, record))
    }

    /// In-memory record at `address`; `None` below the head address.
    #[inline]
    pub fn get(&self, address: Address) -> Option<&LogRecord<K>> {
        if address < self.get_head_address() {
            return None;
        }
        self.arena.get(address)
    }

    /// Read a record that lives below the head address.
    ///
    /// Evicted slots are never reused, so this stands in for a device read.
    #[inline]
    pub fn read_evicted(&self, address: Address) -> Option<&LogRecord<K>> {
        self.arena.get(address)
    }

    /// Shift the read-only address
    pub fn shift_read_only_address(&self, new_address: Address) {
        let new_address = new_address.min(self.get_tail_address());
        loop {
            let current = self.read_only_address.load(Ordering::Acquire);
            if new_address <= current {
                return;
            }

            if self
                .read_only_address
                .compare_exchange(current, new_address, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return;
            }
        }
    }

    /// Shift the head address, starting eviction of everything below it.
    ///
    /// Returns the new head if it moved. The caller is responsible for
    /// closing the evicted range once no session can still be reading it.
    pub fn shift_head_address(&self, new_address: Address) -> Option<Address> {
        let new_address = new_address.min(self.get_tail_address());
        self.shift_read_only_address(new_address);
        loop {
            let current = self.head_address.load(Ordering::Acquire);
            if new_address <= current {
                return None;
            }

            if self
                .head_address
                .compare_exchange(current, new_address, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Some(new_address);
            }
        }
    }

    /// Close every record in `[closed_until, until)` with `close`, then raise
    /// the closed-until marker.
    ///
    /// `close` must be idempotent: concurrent callers may visit the same
    /// record.
    pub fn close_until(&self, until: Address, mut close: impl FnMut(&LogRecord<K>)) -> u64 {
        let until = until.min(self.get_head_address());
        let mut address = self.get_closed_until_address();
        let mut visited = 0;
        while address < until {
            if let Some(record) = self.arena.get(address) {
                close(record);
                visited += 1;
            }
            address += 1;
        }
        self.closed_until_address
            .fetch_max(until, Ordering::AcqRel);
        visited
    }

    /// Whether the record at `address` has been closed by eviction.
    pub fn is_closed(&self, address: Address) -> bool {
        if address < self.get_closed_until_address() {
            return true;
        }
        self.arena
            .get(address)
            .is_some_and(|record| record.info.is_closed())
    }
}
