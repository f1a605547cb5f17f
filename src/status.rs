//! Status codes and operation results
//!
//! `OperationStatus` is what crosses the locking core's boundary; `Status` is
//! what the public session API reports.

use std::fmt;

/// Status code returned by public store operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum Status {
    /// Operation completed successfully
    #[default]
    Ok = 0,
    /// Key was not found
    NotFound = 1,
    /// The log or read cache arena is exhausted
    OutOfMemory = 2,
    /// Invalid argument provided
    InvalidArgument = 3,
    /// Invalid operation in current state
    InvalidOperation = 4,
    /// The caller's modifier declined the update
    Aborted = 5,
}

impl Status {
    /// Check if the status indicates success
    #[inline]
    pub const fn is_ok(&self) -> bool {
        matches!(self, Status::Ok)
    }

    /// Check if the key was not found
    #[inline]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Status::NotFound)
    }

    /// Check if the status indicates an error
    #[inline]
    pub const fn is_error(&self) -> bool {
        matches!(
            self,
            Status::OutOfMemory | Status::InvalidArgument | Status::InvalidOperation
        )
    }

    /// Get the status as a string
    pub const fn as_str(&self) -> &'static str {
        match self {
            Status::Ok => "Ok",
            Status::NotFound => "NotFound",
            Status::OutOfMemory => "OutOfMemory",
            Status::InvalidArgument => "InvalidArgument",
            Status::InvalidOperation => "InvalidOperation",
            Status::Aborted => "Aborted",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::error::Error for Status {}

/// Outcome of a single attempt inside the locking core.
///
/// `RetryLater` always means the attempt left no lock held and no descriptor
/// flag set, so the caller can restart the whole operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum OperationStatus {
    /// Attempt succeeded
    #[default]
    Success,
    /// Contention, an intermediate record, or an exhausted spin budget
    RetryLater,
}

impl OperationStatus {
    /// Check if the attempt succeeded
    #[inline]
    pub const fn is_success(&self) -> bool {
        matches!(self, OperationStatus::Success)
    }

    /// Check if a retry is needed
    #[inline]
    pub const fn needs_retry(&self) -> bool {
        matches!(self, OperationStatus::RetryLater)
    }
}
