//! oxifaster-locking - ephemeral record locking for a FASTER-style key-value store
//!
//! A key's lock can live in one of three tiers: on a record in the read
//! cache, on a record in the in-memory part of the hybrid log, or in the
//! overflow lock table once the record has been evicted. This crate provides:
//! - **Ephemeral locking**: operations lock their key in whichever tier holds
//!   it, for the duration of the operation
//! - **Two-phase completion**: new records are inserted tentative and only
//!   committed once no other tier holds a conflicting lock
//! - **Manual locking**: long-lived locks taken through a `LockableContext`
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use oxifaster_locking::{FasterKv, FasterKvConfig, Status};
//!
//! let store = Arc::new(FasterKv::<u64>::new(FasterKvConfig::new(1 << 10, 1 << 16))?);
//! let mut session = store.start_session()?;
//!
//! assert_eq!(session.upsert(1, 42), Status::Ok);
//! assert_eq!(session.read(&1)?, Some(42));
//! ```

#![warn(missing_docs)]

pub mod address;
pub mod allocator;
pub mod cache;
pub mod checkpoint;
pub mod config;
pub mod epoch;
pub mod index;
pub mod lock_table;
pub mod record;
pub mod status;
pub mod store;

// Re-exports for convenience
pub use address::{Address, AtomicAddress};
pub use lock_table::LockTable;
pub use record::{Key, LockType, RecordInfo};
pub use status::{OperationStatus, Status};
pub use store::{FasterKv, FasterKvConfig, LockableContext, LockingConfig, LockingMode, Session};

/// Constants used throughout the library
pub mod constants {
    /// Size of a cache line in bytes
    pub const CACHE_LINE_BYTES: usize = 64;

    /// Maximum number of threads supported
    pub const MAX_THREADS: usize = 96;
}

/// Prelude module for common imports
pub mod prelude {
    pub use crate::address::{Address, AtomicAddress};
    pub use crate::cache::ReadCacheConfig;
    pub use crate::record::{Key, LockType, RecordInfo};
    pub use crate::status::{OperationStatus, Status};
    pub use crate::store::{FasterKv, FasterKvConfig, LockingConfig, LockingMode, Session};
}
