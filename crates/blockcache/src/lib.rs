//! Block buffer cache
//!
//! This crate caches fixed-size device blocks in memory between a storage
//! mapping layer and a raw block device. It provides:
//! - Reference-counted buffers with an explicit I/O state machine
//! - Asynchronous reads and write-back through a pluggable transport
//! - Clean/dirty LRU lists per client with clean-first eviction
//! - A memory budget shared fairly across all clients of one runtime
//! - Age-based sweeping and host memory-pressure reclaim
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────┐
//! │ Client (read/get/new/...)    │──── BufferHooks (caller)
//! │  - BufferIndex (clean/dirty) │
//! │  - WriteBatch                │
//! └──────┬───────────────┬───────┘
//!        │               │
//! ┌──────▼──────┐ ┌──────▼───────────┐
//! │ CacheRuntime│ │ BlockTransport   │
//! │ - Allocator │ │ (Inline/Threaded)│
//! │ - Governor  │ └──────┬───────────┘
//! │ - Registry  │        │
//! └─────────────┘ ┌──────▼──────┐
//!                 │ BlockDevice │
//!                 └─────────────┘
//! ```

pub mod allocator;
mod batch;
pub mod buffer;
pub mod client;
pub mod device;
pub mod governor;
mod index;
pub mod runtime;
pub mod state;
pub mod stats;
pub mod transport;

#[cfg(test)]
mod testutil;

pub use allocator::{AllocStrategy, AllocatorStats, BlockMemory, BufferAllocator};
pub use blockcache_common::{
    BlockNumber, BufferId, CacheConfig, ClientId, Error, Result, SECTOR_SIZE,
};
pub use buffer::BufferHandle;
pub use client::{BufferHooks, Client, ClientOptions, NoHooks};
pub use device::{FileDevice, MemoryDevice};
pub use governor::{CacheLimits, Governor, MemoryPressureListener};
pub use runtime::CacheRuntime;
pub use state::BufferState;
pub use stats::{CacheStats, ClientSnapshot, PrometheusExporter};
pub use transport::{
    BlockDevice, BlockTransport, InlineTransport, IoDirection, IoRequest, ThreadedTransport,
};
