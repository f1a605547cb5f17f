//! Fixed-capacity record arena.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;

use crate::address::Address;
use crate::record::RecordInfo;

/// A record slot: header, key and an 8-byte value.
pub struct LogRecord<K> {
    /// Header word
    pub info: RecordInfo,
    key: OnceLock<K>,
    value: AtomicU64,
}

impl<K> LogRecord<K> {
    fn empty() -> Self {
        Self {
            info: RecordInfo::default(),
            key: OnceLock::new(),
            value: AtomicU64::new(0),
        }
    }

    /// The record's key; `None` only for a slot that was never initialized.
    #[inline]
    pub fn key(&self) -> Option<&K> {
        self.key.get()
    }

    /// Read the value.
    #[inline]
    pub fn value(&self) -> u64 {
        self.value.load(Ordering::Acquire)
    }

    /// Overwrite the value. Callers hold the exclusive lock.
    #[inline]
    pub fn set_value(&self, value: u64) {
        self.value.store(value, Ordering::Release);
    }
}

impl<K: PartialEq> LogRecord<K> {
    /// Whether this record belongs to `key`.
    #[inline]
    pub fn has_key(&self, key: &K) -> bool {
        self.key.get() == Some(key)
    }
}

impl<K: std::fmt::Debug> std::fmt::Debug for LogRecord<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogRecord")
            .field("info", &self.info)
            .field("key", &self.key.get())
            .field("value", &self.value())
            .finish()
    }
}

/// Append-only arena of record slots.
///
/// Addresses start at [`Address::FIRST_VALID`] and advance by one per record.
pub struct RecordArena<K> {
    slots: Box<[LogRecord<K>]>,
    tail: AtomicU64,
}

impl<K> RecordArena<K> {
    /// Create an arena holding at most `capacity` records.
    pub fn new(capacity: usize) -> Self {
        let slots = (0..capacity)
            .map(|_| LogRecord::empty())
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            slots,
            tail: AtomicU64::new(Address::FIRST_VALID.control()),
        }
    }

    /// Maximum number of records
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// First address that has not been handed out.
    #[inline]
    pub fn tail_address(&self) -> Address {
        let end = Address::FIRST_VALID.control() + self.slots.len() as u64;
        Address::from_control(self.tail.load(Ordering::Acquire).min(end))
    }

    /// Number of records allocated so far.
    pub fn len(&self) -> usize {
        (self.tail_address() - Address::FIRST_VALID) as usize
    }

    /// Whether no record was allocated yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    fn slot_index(&self, address: Address) -> Option<usize> {
        let control = address.control();
        if control < Address::FIRST_VALID.control() {
            return None;
        }
        let index = (control - Address::FIRST_VALID.control()) as usize;
        (index < self.slots.len()).then_some(index)
    }

    /// Allocate and initialize a tentative record.
    ///
    /// Returns `None` when the arena is exhausted. The record is not reachable
    /// by other threads until the caller links it into a hash chain.
    pub fn allocate(
        &self,
        key: K,
        value: u64,
        previous_address: Address,
        tombstone: bool,
    ) -> Option<(Address, &LogRecord<K>)> {
        let raw = self.tail.fetch_add(1, Ordering::AcqRel);
        let address = Address::from_control(raw);
        let index = self.slot_index(address)?;
        let record = &self.slots[index];
        if record.key.set(key).is_err() {
            debug_assert!(false, "arena slot {address} allocated twice");
            return None;
        }
        record.value.store(value, Ordering::Relaxed);
        record.info.reset(previous_address, true, tombstone);
        Some((address, record))
    }

    /// Record at `address`, if it was handed out.
    #[inline]
    pub fn get(&self, address: Address) -> Option<&LogRecord<K>> {
        if address >= self.tail_address() {
            return None;
        }
        self.slot_index(address).map(|index| &self.slots[index])
    }
}
