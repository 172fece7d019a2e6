//! Recoverable failures of container operations.
//!
//! Only resource problems are reported through [`StorageError`]. Misuse of a container (duplicate
//! keys on a unique insert, typed access with the wrong type, out of range indices) panics
//! instead, as it indicates a bug in the calling code.

use thiserror::Error;

/// Result type alias using [`StorageError`].
pub type Result<T> = std::result::Result<T, StorageError>;

/// Errors that can occur while growing a container.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// The host buffer could not be resized to the requested length.
    #[error("failed to resize host buffer to {requested} bytes")]
    AllocationFailed {
        /// The byte length that was requested from the host buffer.
        requested: usize,
    },

    /// A capacity or byte size does not fit the container's index or size types.
    #[error("capacity overflow: {what} exceeds the supported maximum")]
    CapacityOverflow {
        /// Which quantity overflowed.
        what: &'static str,
    },
}

impl StorageError {
    pub(crate) fn overflow(what: &'static str) -> Self {
        StorageError::CapacityOverflow { what }
    }
}
