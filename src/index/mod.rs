//! Hash index for the store
//!
//! A power-of-two table of bucket heads. Each bucket points at the newest
//! record of its hash chain; older records are reached through
//! `RecordInfo::previous_address`. Read cache records, when present, always
//! form a prefix of the chain.

mod hash_index;

pub use hash_index::{HashEntryInfo, HashIndex};

/// Key hash type for index operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct KeyHash {
    hash: u64,
}

impl KeyHash {
    /// Create a new key hash
    #[inline]
    pub const fn new(hash: u64) -> Self {
        Self { hash }
    }

    /// Get the full hash value
    #[inline]
    pub const fn hash(&self) -> u64 {
        self.hash
    }

    /// Get the hash table index for a given table size
    #[inline]
    pub const fn hash_table_index(&self, size: u64) -> usize {
        (self.hash as usize) & ((size as usize) - 1)
    }
}

impl From<u64> for KeyHash {
    #[inline]
    fn from(hash: u64) -> Self {
        Self::new(hash)
    }
}
