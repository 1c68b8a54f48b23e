//! Core type definitions for the buffer cache
//!
//! Identifiers and size constants shared between the cache engine and the
//! tools built on it.

use derive_more::{Display, From, Into};
use serde::{Deserialize, Serialize};

/// Logical block number on a backing device
pub type BlockNumber = u64;

/// Minimum addressable unit of a block device
pub const SECTOR_SIZE: usize = 512;

/// Page size assumed by the page-run allocation strategy
pub const PAGE_SIZE: usize = 4096;

/// Identifier of a cache client, unique within one runtime
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display, From, Into,
)]
#[display("client-{_0}")]
pub struct ClientId(u64);

impl ClientId {
    /// Create from a raw value
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Get the raw value
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

/// Identifier of a cached buffer, unique within one client
///
/// Unlike the block number it never changes over the buffer's lifetime,
/// so in-flight I/O completions use it to find their buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Display, From, Into)]
#[display("buf-{_0}")]
pub struct BufferId(u64);

impl BufferId {
    /// Create from a raw value
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Get the raw value
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

/// Check that `block_size` is a power of two no smaller than a sector
#[must_use]
pub const fn is_valid_block_size(block_size: usize) -> bool {
    block_size >= SECTOR_SIZE && block_size.is_power_of_two()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_size_validation() {
        assert!(is_valid_block_size(512));
        assert!(is_valid_block_size(4096));
        assert!(is_valid_block_size(1 << 20));
        assert!(!is_valid_block_size(0));
        assert!(!is_valid_block_size(256));
        assert!(!is_valid_block_size(1000));
        assert!(!is_valid_block_size(4097));
    }

    #[test]
    fn test_id_display() {
        assert_eq!(ClientId::new(3).to_string(), "client-3");
        assert_eq!(BufferId::from(7u64).to_string(), "buf-7");
        assert_eq!(u64::from(BufferId::new(9)), 9);
    }
}
