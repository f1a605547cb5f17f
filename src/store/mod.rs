//! FasterKV key-value store implementation
//!
//! This module provides the store, its sessions, and the locking core that
//! every session operation runs through.

mod faster_kv;
mod lockable;
mod locking_session;
mod record_source;
mod session;
mod stats;

pub use faster_kv::{FasterKv, FasterKvConfig, LockingConfig};
pub use lockable::LockableContext;
pub use locking_session::{LockingMode, LockingSession, SessionLocking};
pub use record_source::{RecordSource, Tier};
pub use session::Session;
pub use stats::{StoreStats, StoreStatsSnapshot};
