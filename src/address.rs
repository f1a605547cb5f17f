//! Logical addresses for the hybrid log and the read cache
//!
//! An address is a 48-bit logical offset into a record arena. Bit 47 marks an
//! address that lives in the read cache rather than the main log; the two
//! arenas share the same numbering scheme otherwise.

use std::cmp::Ordering;
use std::fmt;
use std::ops::{Add, AddAssign, Sub};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

/// A logical address into a record arena.
///
/// Uses 48 bits. The remaining 16 bits of a `RecordInfo` word are reserved
/// for lock state and record flags.
#[repr(transparent)]
#[derive(Clone, Copy, Default, Hash)]
pub struct Address(u64);

impl Address {
    /// An invalid address, used when you need to initialize an address but don't have a valid
    /// value for it yet.
    ///
    /// Note: set to 1, not 0, so that an empty hash bucket (all zeros) is distinguishable
    /// from a bucket that points to an invalid address.
    pub const INVALID: Self = Self(1);

    /// Total number of address bits used
    pub const ADDRESS_BITS: u32 = 48;

    /// Maximum valid address value
    pub const MAX_ADDRESS: u64 = (1 << Self::ADDRESS_BITS) - 1;

    /// Read cache bit mask (bit 47)
    pub const READ_CACHE_MASK: u64 = 1 << (Self::ADDRESS_BITS - 1);

    /// First address handed out by an arena. Lower values are reserved for sentinels.
    pub const FIRST_VALID: Self = Self(64);

    /// Create an address from a raw control value
    #[inline]
    pub const fn from_control(control: u64) -> Self {
        Self(control)
    }

    /// Get the raw control value
    #[inline]
    pub const fn control(&self) -> u64 {
        self.0
    }

    /// Check if this address is in the read cache
    #[inline]
    pub const fn in_read_cache(&self) -> bool {
        (self.0 & Self::READ_CACHE_MASK) != 0
    }

    /// Get the address with read cache bit cleared
    #[inline]
    pub const fn read_cache_address(&self) -> Self {
        Self(self.0 & !Self::READ_CACHE_MASK)
    }

    /// Get the address with the read cache bit set
    #[inline]
    pub const fn to_read_cache(&self) -> Self {
        Self(self.0 | Self::READ_CACHE_MASK)
    }

    /// Check if this is an invalid address
    #[inline]
    pub const fn is_invalid(&self) -> bool {
        self.0 == Self::INVALID.0
    }

    /// Check if this is a valid address (not invalid, not an empty slot)
    #[inline]
    pub const fn is_valid(&self) -> bool {
        self.0 >= Self::FIRST_VALID.0
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Address")
            .field("address", &self.read_cache_address().0)
            .field("read_cache", &self.in_read_cache())
            .finish()
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.in_read_cache() {
            write!(f, "rc:{}", self.read_cache_address().0)
        } else {
            write!(f, "{}", self.0)
        }
    }
}

impl PartialEq for Address {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl Eq for Address {}

impl PartialOrd for Address {
    #[inline]
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Address {
    #[inline]
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.cmp(&other.0)
    }
}

impl Add<u64> for Address {
    type Output = Self;

    #[inline]
    fn add(self, delta: u64) -> Self::Output {
        debug_assert!(self.0 + delta <= Self::MAX_ADDRESS);
        Self(self.0 + delta)
    }
}

impl AddAssign<u64> for Address {
    #[inline]
    fn add_assign(&mut self, delta: u64) {
        debug_assert!(self.0 + delta <= Self::MAX_ADDRESS);
        self.0 += delta;
    }
}

impl Sub for Address {
    type Output = u64;

    #[inline]
    fn sub(self, other: Self) -> Self::Output {
        self.0 - other.0
    }
}

impl From<u64> for Address {
    #[inline]
    fn from(control: u64) -> Self {
        Self(control)
    }
}

impl From<Address> for u64 {
    #[inline]
    fn from(addr: Address) -> Self {
        addr.0
    }
}

/// Atomic version of Address for thread-safe operations
#[repr(transparent)]
pub struct AtomicAddress {
    control: AtomicU64,
}

impl AtomicAddress {
    /// Create a new atomic address
    #[inline]
    pub const fn new(address: Address) -> Self {
        Self {
            control: AtomicU64::new(address.0),
        }
    }

    /// Load the address atomically
    #[inline]
    pub fn load(&self, ordering: AtomicOrdering) -> Address {
        Address(self.control.load(ordering))
    }

    /// Compare and exchange the address atomically
    #[inline]
    pub fn compare_exchange(
        &self,
        current: Address,
        new: Address,
        success: AtomicOrdering,
        failure: AtomicOrdering,
    ) -> Result<Address, Address> {
        self.control
            .compare_exchange(current.0, new.0, success, failure)
            .map(Address)
            .map_err(Address)
    }

    /// Raise the address monotonically; returns the previous value.
    #[inline]
    pub fn fetch_max(&self, address: Address, ordering: AtomicOrdering) -> Address {
        Address(self.control.fetch_max(address.0, ordering))
    }
}

impl Default for AtomicAddress {
    fn default() -> Self {
        Self::new(Address::default())
    }
}

impl fmt::Debug for AtomicAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let addr = self.load(AtomicOrdering::Relaxed);
        f.debug_struct("AtomicAddress")
            .field("address", &addr)
            .finish()
    }
}
