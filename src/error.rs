//! Error types shared by the flash ring log and the secure record layer

use std::io;
use thiserror::Error;

/// Error types for flash log operations
#[derive(Debug, Error)]
pub enum LogError {
    /// A region or label is unknown, or no valid frame exists at the read position
    #[error("not found: {0}")]
    NotFound(String),
    /// A record does not fit in the region or record buffer
    #[error("record of {size} bytes exceeds capacity of {capacity} bytes")]
    InvalidSize {
        /// Size that was requested
        size: usize,
        /// Largest size accepted
        capacity: usize,
    },
    /// A caller-provided argument cannot be encoded
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    /// A control block or payload checksum did not match
    #[error("checksum mismatch at offset {offset}")]
    InvalidChecksum {
        /// Region offset of the frame, or 0 for the control block
        offset: usize,
    },
    /// The persisted control block uses an unknown format version
    #[error("unsupported control block version {0}")]
    InvalidVersion(u32),
    /// A buffer could not be allocated
    #[error("out of memory")]
    OutOfMemory,
    /// Encryption failed, a tag did not verify, or the nonce chain is broken
    #[error("crypto failure: {0}")]
    Crypto(&'static str),
    /// The underlying block or metadata store failed
    #[error("io failure: {0}")]
    Io(#[from] io::Error),
}

impl LogError {
    /// Whether this error indicates corrupted or tampered data that can only
    /// be recovered from by resetting the log
    pub fn is_integrity_failure(&self) -> bool {
        matches!(
            self,
            LogError::NotFound(_)
                | LogError::InvalidChecksum { .. }
                | LogError::InvalidVersion(_)
                | LogError::InvalidSize { .. }
                | LogError::Crypto(_)
        )
    }
}

impl From<std::collections::TryReserveError> for LogError {
    fn from(_: std::collections::TryReserveError) -> Self {
        LogError::OutOfMemory
    }
}

/// Result type for flash log operations
pub type Result<T> = std::result::Result<T, LogError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integrity_classification() {
        assert!(LogError::InvalidChecksum { offset: 12 }.is_integrity_failure());
        assert!(LogError::Crypto("tag mismatch").is_integrity_failure());
        assert!(LogError::NotFound("magic".into()).is_integrity_failure());
        assert!(!LogError::OutOfMemory.is_integrity_failure());

        let io = LogError::from(io::Error::new(io::ErrorKind::Other, "bus"));
        assert!(!io.is_integrity_failure());
    }
}
