//! Read cache configuration

/// Configuration for the read cache
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadCacheConfig {
    /// Maximum number of records the cache can hold
    pub capacity: usize,
    /// Whether reads of evicted records copy them into the cache
    pub copy_to_tail: bool,
}

impl Default for ReadCacheConfig {
    fn default() -> Self {
        Self {
            capacity: 1 << 16,
            copy_to_tail: true,
        }
    }
}

impl ReadCacheConfig {
    /// Create a new read cache configuration
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            ..Default::default()
        }
    }

    /// Set whether reads of evicted records are copied into the cache
    pub fn with_copy_to_tail(mut self, copy_to_tail: bool) -> Self {
        self.copy_to_tail = copy_to_tail;
        self
    }
}
