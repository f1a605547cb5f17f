//! Bucket table of atomic chain heads.

use std::sync::atomic::Ordering;

use crate::address::{Address, AtomicAddress};
use crate::index::KeyHash;
use crate::status::Status;

/// Snapshot of a bucket taken when an operation resolves its record source.
///
/// `address` is the chain head at the time of the snapshot. Every CAS an
/// operation performs on the bucket expects this value, so any insert that
/// happened in between makes the operation retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HashEntryInfo {
    /// Hash of the key
    pub hash: KeyHash,
    /// Chain head observed by the snapshot
    pub address: Address,
}

impl HashEntryInfo {
    /// Whether the chain head is a read cache record.
    #[inline]
    pub fn is_read_cache(&self) -> bool {
        self.address.in_read_cache()
    }
}

/// The in-memory hash index.
pub struct HashIndex {
    buckets: Box<[AtomicAddress]>,
    size: u64,
}

impl HashIndex {
    /// Create an index with `table_size` buckets.
    ///
    /// `table_size` must be a non-zero power of two.
    pub fn new(table_size: u64) -> Result<Self, Status> {
        if table_size == 0 || !table_size.is_power_of_two() {
            return Err(Status::InvalidArgument);
        }
        let buckets = (0..table_size)
            .map(|_| AtomicAddress::new(Address::INVALID))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Ok(Self {
            buckets,
            size: table_size,
        })
    }

    /// Number of buckets
    pub fn size(&self) -> u64 {
        self.size
    }

    #[inline]
    fn bucket(&self, hash: KeyHash) -> &AtomicAddress {
        &self.buckets[hash.hash_table_index(self.size)]
    }

    /// Snapshot the bucket for `hash`.
    #[inline]
    pub fn find_entry(&self, hash: KeyHash) -> HashEntryInfo {
        HashEntryInfo {
            hash,
            address: self.bucket(hash).load(Ordering::Acquire),
        }
    }

    /// Re-read the bucket head without changing the snapshot.
    #[inline]
    pub fn current_address(&self, hash: KeyHash) -> Address {
        self.bucket(hash).load(Ordering::Acquire)
    }

    /// CAS the bucket from the snapshot's address to `new_address`.
    ///
    /// On success the snapshot is advanced to `new_address`; on failure it is
    /// refreshed with the current head so the caller can decide whether to retry.
    pub fn try_update_entry(&self, entry: &mut HashEntryInfo, new_address: Address) -> bool {
        match self.bucket(entry.hash).compare_exchange(
            entry.address,
            new_address,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {
                entry.address = new_address;
                true
            }
            Err(current) => {
                entry.address = current;
                false
            }
        }
    }
}

impl std::fmt::Debug for HashIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HashIndex").field("size", &self.size).finish()
    }
}
