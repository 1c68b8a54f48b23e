//! Error types for the buffer cache
//!
//! I/O failures are recorded as [`std::io::ErrorKind`] rather than
//! [`std::io::Error`] so they can be stored as sticky state on a buffer and
//! on a client and handed out more than once.
//!
//! Caller contract violations (double release, destroying a client that
//! still has held buffers, dirtying a buffer that is being read) are not
//! represented here: they panic.

use crate::types::BlockNumber;
use std::io::ErrorKind;
use thiserror::Error;

/// Common result type for cache operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for cache operations
#[derive(Debug, Error)]
pub enum Error {
    #[error("out of cache memory and no buffer can be reclaimed")]
    NoMemory,

    #[error("read of block {block} failed: {kind}")]
    Read { block: BlockNumber, kind: ErrorKind },

    #[error("write of block {block} failed: {kind}")]
    Write { block: BlockNumber, kind: ErrorKind },

    #[error("device flush failed: {kind}")]
    Flush { kind: ErrorKind },

    #[error("block {block} is not cached")]
    NotFound { block: BlockNumber },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("device I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create an invalid argument error
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Create a configuration error
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Check if this is a cache miss
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Check if this error came from the backing device
    #[must_use]
    pub const fn is_io_failure(&self) -> bool {
        matches!(
            self,
            Self::Read { .. } | Self::Write { .. } | Self::Flush { .. } | Self::Io(_)
        )
    }

    /// The underlying I/O error kind, if any
    #[must_use]
    pub fn io_kind(&self) -> Option<ErrorKind> {
        match self {
            Self::Read { kind, .. } | Self::Write { kind, .. } | Self::Flush { kind } => Some(*kind),
            Self::Io(e) => Some(e.kind()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(Error::NotFound { block: 1 }.is_not_found());
        assert!(!Error::NoMemory.is_not_found());

        let read = Error::Read {
            block: 4,
            kind: ErrorKind::UnexpectedEof,
        };
        assert!(read.is_io_failure());
        assert_eq!(read.io_kind(), Some(ErrorKind::UnexpectedEof));
        assert!(!Error::invalid_argument("x").is_io_failure());
    }

    #[test]
    fn test_error_display() {
        let err = Error::Write {
            block: 12,
            kind: ErrorKind::PermissionDenied,
        };
        assert_eq!(err.to_string(), "write of block 12 failed: permission denied");
        assert_eq!(
            Error::invalid_argument("block size 100").to_string(),
            "invalid argument: block size 100"
        );
    }

    #[test]
    fn test_from_io_error() {
        let err: Error = std::io::Error::new(ErrorKind::Other, "boom").into();
        assert_eq!(err.io_kind(), Some(ErrorKind::Other));
    }
}
