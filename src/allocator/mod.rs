//! Record arenas for the main log and the read cache
//!
//! Both tiers store records in a fixed-capacity arena addressed by logical
//! address. Slots are never reused, so a record reference obtained under
//! epoch protection stays valid for the lifetime of the store.
//!
//! # Memory Regions
//!
//! The hybrid log is divided into three regions:
//!
//! ```text
//! ┌─────────┬──────────────┬────────────────────┐
//! │ On-Disk │  Read-Only   │     Mutable        │
//! │ Region  │    Region    │      Region        │
//! └─────────┴──────────────┴────────────────────┘
//!     ↑            ↑               ↑
//!   begin     head_address    read_only_address    tail_address
//! ```
//!
//! - **Mutable Region**: updated in place under an exclusive lock
//! - **Read-Only Region**: in memory, updated by copy-on-write
//! - **On-Disk Region**: evicted; records are closed and their locks live in
//!   the lock table

mod arena;
mod hybrid_log;

pub use arena::{LogRecord, RecordArena};
pub use hybrid_log::{HybridLog, HybridLogConfig};
