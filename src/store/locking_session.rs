//! Locking capability injected into every operation.
//!
//! Ephemeral locks are taken and released by the store within one operation.
//! Manual locks are taken by the caller through a `LockableContext` and live
//! until the caller releases them; operations running under manual locking
//! only check that the right lock is already held. Both share the same lock
//! word, so exactly one of them may act on a given operation.

use std::str::FromStr;

use crate::record::RecordInfo;

/// Locking behavior of the session running an operation.
pub trait LockingSession {
    /// Take a shared ephemeral lock on an in-memory record.
    fn try_lock_ephemeral_shared(&self, info: &RecordInfo) -> bool;

    /// Take an exclusive ephemeral lock on an in-memory record.
    fn try_lock_ephemeral_exclusive(&self, info: &RecordInfo) -> bool;

    /// Release an exclusive ephemeral lock.
    fn unlock_ephemeral_exclusive(&self, info: &RecordInfo);

    /// Release a shared ephemeral lock; false if the lock moved elsewhere.
    fn try_unlock_ephemeral_shared(&self, info: &RecordInfo) -> bool;

    /// Whether the store must not take ephemeral locks for this operation.
    fn disable_ephemeral_locking(&self) -> bool;

    /// Whether the caller holds manual locks for the operation's key.
    fn is_manual_locking(&self) -> bool;
}

/// Which locking regime a session runs under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockingMode {
    /// The store locks records for the duration of each operation
    #[default]
    Ephemeral,
    /// The caller holds explicit locks taken through a lockable context
    Manual,
    /// No locking; the caller guarantees single-writer access
    Disabled,
}

impl FromStr for LockingMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ephemeral" => Ok(LockingMode::Ephemeral),
            "manual" => Ok(LockingMode::Manual),
            "disabled" | "none" => Ok(LockingMode::Disabled),
            other => Err(format!("unknown locking mode: {other}")),
        }
    }
}

/// The locking capability of one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionLocking {
    /// Ephemeral locking with a bounded spin per lock attempt
    Ephemeral {
        /// Spin budget for one lock attempt
        spin_count: u32,
    },
    /// Manual locking
    Manual,
    /// No locking
    Disabled,
}

impl SessionLocking {
    /// Build the capability for `mode`.
    pub fn new(mode: LockingMode, spin_count: u32) -> Self {
        match mode {
            LockingMode::Ephemeral => SessionLocking::Ephemeral { spin_count },
            LockingMode::Manual => SessionLocking::Manual,
            LockingMode::Disabled => SessionLocking::Disabled,
        }
    }

    /// The mode this capability implements.
    pub fn mode(&self) -> LockingMode {
        match self {
            SessionLocking::Ephemeral { .. } => LockingMode::Ephemeral,
            SessionLocking::Manual => LockingMode::Manual,
            SessionLocking::Disabled => LockingMode::Disabled,
        }
    }
}

impl LockingSession for SessionLocking {
    #[inline]
    fn try_lock_ephemeral_shared(&self, info: &RecordInfo) -> bool {
        match self {
            SessionLocking::Ephemeral { spin_count } => info.try_lock_shared(*spin_count),
            SessionLocking::Manual => {
                debug_assert!(
                    info.is_locked(),
                    "manual locking: record used without an S or X lock: {info:?}"
                );
                true
            }
            SessionLocking::Disabled => true,
        }
    }

    #[inline]
    fn try_lock_ephemeral_exclusive(&self, info: &RecordInfo) -> bool {
        match self {
            SessionLocking::Ephemeral { spin_count } => info.try_lock_exclusive(*spin_count),
            SessionLocking::Manual => {
                debug_assert!(
                    info.is_locked_exclusive(),
                    "manual locking: record updated without an X lock: {info:?}"
                );
                true
            }
            SessionLocking::Disabled => true,
        }
    }

    #[inline]
    fn unlock_ephemeral_exclusive(&self, info: &RecordInfo) {
        if let SessionLocking::Ephemeral { .. } = self {
            info.unlock_exclusive();
        }
    }

    #[inline]
    fn try_unlock_ephemeral_shared(&self, info: &RecordInfo) -> bool {
        match self {
            SessionLocking::Ephemeral { .. } => info.try_unlock_shared(),
            _ => true,
        }
    }

    #[inline]
    fn disable_ephemeral_locking(&self) -> bool {
        !matches!(self, SessionLocking::Ephemeral { .. })
    }

    #[inline]
    fn is_manual_locking(&self) -> bool {
        matches!(self, SessionLocking::Manual)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::Address;

    #[test]
    fn test_ephemeral_locks_the_word() {
        let locking = SessionLocking::new(LockingMode::Ephemeral, 4);
        let info = RecordInfo::new(Address::INVALID, false, false);

        assert!(!locking.disable_ephemeral_locking());
        assert!(locking.try_lock_ephemeral_exclusive(&info));
        assert!(info.is_locked_exclusive());
        assert!(!locking.try_lock_ephemeral_shared(&info));
        locking.unlock_ephemeral_exclusive(&info);
        assert!(!info.is_locked());
    }

    #[test]
    fn test_disabled_never_touches_the_word() {
        let locking = SessionLocking::new(LockingMode::Disabled, 4);
        let info = RecordInfo::new(Address::INVALID, false, false);

        assert!(locking.disable_ephemeral_locking());
        assert!(!locking.is_manual_locking());
        assert!(locking.try_lock_ephemeral_exclusive(&info));
        assert!(!info.is_locked());
        assert_eq!(locking.mode(), LockingMode::Disabled);
    }

    #[test]
    fn test_mode_from_str() {
        assert_eq!("Ephemeral".parse::<LockingMode>(), Ok(LockingMode::Ephemeral));
        assert_eq!("none".parse::<LockingMode>(), Ok(LockingMode::Disabled));
        assert!("optimistic".parse::<LockingMode>().is_err());
    }

    #[test]
    fn test_manual_checks_existing_lock() {
        let locking = SessionLocking::new(LockingMode::Manual, 4);
        let info = RecordInfo::new(Address::INVALID, false, false);
        assert!(info.try_lock_exclusive(0));

        assert!(locking.is_manual_locking());
        assert!(locking.try_lock_ephemeral_exclusive(&info));
        locking.unlock_ephemeral_exclusive(&info);
        assert!(info.is_locked_exclusive(), "manual locks are released by the caller");
    }
}
