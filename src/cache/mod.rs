//! Read cache
//!
//! Keeps copies of records read from the evicted region of the log. Records
//! here take part in locking like any in-memory record, and their locks move
//! to the main log when a newer version is committed there.

mod config;
mod read_cache;
mod stats;

pub use config::ReadCacheConfig;
pub use read_cache::ReadCache;
pub use stats::{ReadCacheStats, ReadCacheStatsSnapshot};
