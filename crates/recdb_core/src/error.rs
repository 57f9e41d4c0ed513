//! Error types for recdb core.

use crate::types::Recid;
use std::io;
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in recdb core operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Storage backend error.
    #[error("storage error: {0}")]
    Storage(#[from] recdb_storage::StorageError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Operation targeted a recid that is unallocated or already deleted.
    #[error("recid not found: {recid}")]
    RecidNotFound {
        /// The recid that was not found.
        recid: Recid,
    },

    /// An internal structure violated its invariants.
    #[error("data corruption: {message}")]
    DataCorruption {
        /// Description of the violated invariant.
        message: String,
    },

    /// WAL is corrupted or invalid.
    #[error("WAL corruption: {message}")]
    WalCorruption {
        /// Description of the corruption.
        message: String,
    },

    /// Checksum mismatch detected.
    #[error("checksum mismatch: expected {expected:08x}, got {actual:08x}")]
    ChecksumMismatch {
        /// Expected checksum.
        expected: u32,
        /// Actual checksum.
        actual: u32,
    },

    /// Store was constructed with contradictory options.
    #[error("wrong configuration: {message}")]
    WrongConfiguration {
        /// Description of the conflict.
        message: String,
    },

    /// Record payload exceeds the format's size limit.
    #[error("record too large: {size} bytes exceeds maximum of {max}")]
    RecordTooLarge {
        /// Serialized payload size.
        size: usize,
        /// Maximum payload size supported by the store format.
        max: usize,
    },

    /// Serialization or deserialization failed.
    #[error("serializer error: {message}")]
    Serializer {
        /// Description of the failure.
        message: String,
    },

    /// Operation not permitted in current state.
    #[error("invalid operation: {message}")]
    InvalidOperation {
        /// Description of why the operation is invalid.
        message: String,
    },

    /// The store is closed.
    #[error("store is closed")]
    StoreClosed,
}

impl CoreError {
    /// Creates a recid-not-found error.
    pub fn recid_not_found(recid: Recid) -> Self {
        Self::RecidNotFound { recid }
    }

    /// Creates a data corruption error.
    pub fn data_corruption(message: impl Into<String>) -> Self {
        Self::DataCorruption {
            message: message.into(),
        }
    }

    /// Creates a WAL corruption error.
    pub fn wal_corruption(message: impl Into<String>) -> Self {
        Self::WalCorruption {
            message: message.into(),
        }
    }

    /// Creates a wrong-configuration error.
    pub fn wrong_configuration(message: impl Into<String>) -> Self {
        Self::WrongConfiguration {
            message: message.into(),
        }
    }

    /// Creates a serializer error.
    pub fn serializer(message: impl Into<String>) -> Self {
        Self::Serializer {
            message: message.into(),
        }
    }

    /// Creates an invalid operation error.
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }
}
