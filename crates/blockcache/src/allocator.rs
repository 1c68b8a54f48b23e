//! Buffer allocator
//!
//! Produces the data region behind every cached buffer. Three strategies
//! are used depending on the block size:
//!
//! - **Pooled**: sub-page blocks come from per-size free lists that keep
//!   released regions around for reuse
//! - **PageRun**: page-sized up to [`PAGE_RUN_MAX`] blocks are allocated
//!   page-aligned, which is what direct I/O devices want
//! - **Virtual**: anything larger is a plain heap allocation
//!
//! Bytes in use are accounted per strategy (current and peak) under one
//! process-wide lock that is independent of every client lock. An optional
//! hard limit turns allocation into `NoMemory` once reached, which sends
//! the caller to reclaim an existing buffer instead.

use blockcache_common::{Error, PAGE_SIZE, Result};
use parking_lot::Mutex;
use serde::Serialize;
use std::alloc::Layout;
use std::collections::HashMap;
use std::ptr::NonNull;
use std::sync::Arc;
use tracing::{debug, trace};

/// Largest block size served by the page-run strategy
pub const PAGE_RUN_MAX: usize = 64 * 1024;

/// Released pooled regions kept per block size
const POOL_DEPTH: usize = 64;

/// How a data region was obtained
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AllocStrategy {
    /// Fixed-size free lists for small blocks
    Pooled,
    /// Page-aligned runs for medium blocks
    PageRun,
    /// Generic heap allocation for large blocks
    Virtual,
}

impl AllocStrategy {
    /// All strategies, in accounting order
    pub const ALL: [Self; 3] = [Self::Pooled, Self::PageRun, Self::Virtual];

    /// Default strategy for a block size
    #[must_use]
    pub const fn for_size(block_size: usize) -> Self {
        if block_size < PAGE_SIZE {
            Self::Pooled
        } else if block_size <= PAGE_RUN_MAX {
            Self::PageRun
        } else {
            Self::Virtual
        }
    }

    /// Stable name used in metrics labels
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pooled => "pooled",
            Self::PageRun => "page_run",
            Self::Virtual => "virtual",
        }
    }

    const fn slot(self) -> usize {
        match self {
            Self::Pooled => 0,
            Self::PageRun => 1,
            Self::Virtual => 2,
        }
    }
}

/// Page-aligned heap region
struct PageRun {
    ptr: NonNull<u8>,
    layout: Layout,
}

#[allow(unsafe_code)]
impl PageRun {
    fn allocate(size: usize) -> Option<Self> {
        let layout = Layout::from_size_align(size, PAGE_SIZE).ok()?;
        // SAFETY: size is a non-zero block size, so the layout is not zero-sized.
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        NonNull::new(ptr).map(|ptr| Self { ptr, layout })
    }

    fn as_slice(&self) -> &[u8] {
        // SAFETY: ptr is valid for layout.size() initialized bytes for the
        // lifetime of self.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.layout.size()) }
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: as above, and &mut self guarantees exclusive access.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.layout.size()) }
    }
}

#[allow(unsafe_code)]
impl Drop for PageRun {
    fn drop(&mut self) {
        // SAFETY: ptr was returned by alloc_zeroed with this exact layout.
        unsafe { std::alloc::dealloc(self.ptr.as_ptr(), self.layout) }
    }
}

// SAFETY: PageRun exclusively owns its allocation, like a Box<[u8]>.
#[allow(unsafe_code)]
unsafe impl Send for PageRun {}
// SAFETY: shared access only hands out &[u8].
#[allow(unsafe_code)]
unsafe impl Sync for PageRun {}

enum Region {
    Heap(Box<[u8]>),
    Pages(PageRun),
}

/// Data region of exactly one block
pub struct BlockMemory {
    region: Region,
    strategy: AllocStrategy,
}

impl BlockMemory {
    /// Strategy the region was allocated with
    #[must_use]
    pub const fn strategy(&self) -> AllocStrategy {
        self.strategy
    }

    /// Region length in bytes
    #[must_use]
    pub fn len(&self) -> usize {
        self.as_slice().len()
    }

    /// Whether the region is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Read-only view
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        match &self.region {
            Region::Heap(data) => data,
            Region::Pages(run) => run.as_slice(),
        }
    }

    /// Mutable view
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        match &mut self.region {
            Region::Heap(data) => data,
            Region::Pages(run) => run.as_mut_slice(),
        }
    }
}

impl std::fmt::Debug for BlockMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockMemory")
            .field("len", &self.len())
            .field("strategy", &self.strategy)
            .finish()
    }
}

/// Snapshot of allocator accounting
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AllocatorStats {
    /// Bytes handed out, per strategy
    pub current_bytes: [u64; 3],
    /// High-water mark of `current_bytes`, per strategy
    pub peak_bytes: [u64; 3],
    /// Bytes parked in the pooled free lists
    pub pooled_idle_bytes: u64,
    /// Allocations refused with `NoMemory`
    pub failures: u64,
}

impl AllocatorStats {
    /// Bytes in use for one strategy
    #[must_use]
    pub const fn current(&self, strategy: AllocStrategy) -> u64 {
        self.current_bytes[strategy.slot()]
    }

    /// Peak bytes for one strategy
    #[must_use]
    pub const fn peak(&self, strategy: AllocStrategy) -> u64 {
        self.peak_bytes[strategy.slot()]
    }

    /// Bytes in use across all strategies
    #[must_use]
    pub fn total_current(&self) -> u64 {
        self.current_bytes.iter().sum()
    }
}

#[derive(Default)]
struct Accounting {
    stats: AllocatorStats,
}

impl Accounting {
    fn charge(&mut self, strategy: AllocStrategy, bytes: u64) {
        let slot = strategy.slot();
        self.stats.current_bytes[slot] += bytes;
        self.stats.peak_bytes[slot] = self.stats.peak_bytes[slot].max(self.stats.current_bytes[slot]);
    }

    fn credit(&mut self, strategy: AllocStrategy, bytes: u64) {
        let slot = strategy.slot();
        self.stats.current_bytes[slot] = self.stats.current_bytes[slot].saturating_sub(bytes);
    }
}

struct AllocatorInner {
    limit: Option<u64>,
    accounting: Mutex<Accounting>,
    pools: Mutex<HashMap<usize, Vec<Box<[u8]>>>>,
}

/// Process-wide allocator for buffer data regions
#[derive(Clone)]
pub struct BufferAllocator {
    inner: Arc<AllocatorInner>,
}

impl BufferAllocator {
    /// Create an allocator with an optional hard limit in bytes
    #[must_use]
    pub fn new(limit: Option<u64>) -> Self {
        Self {
            inner: Arc::new(AllocatorInner {
                limit,
                accounting: Mutex::new(Accounting::default()),
                pools: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Allocate a region of exactly `block_size` bytes
    ///
    /// Fails with [`Error::NoMemory`] when the hard limit would be exceeded
    /// or the system allocator refuses; nothing is charged in that case.
    pub fn allocate(&self, block_size: usize, hint: Option<AllocStrategy>) -> Result<BlockMemory> {
        let strategy = hint.unwrap_or_else(|| AllocStrategy::for_size(block_size));
        let bytes = block_size as u64;

        {
            let mut acct = self.inner.accounting.lock();
            if let Some(limit) = self.inner.limit
                && acct.stats.total_current() + bytes > limit
            {
                acct.stats.failures += 1;
                trace!(block_size, limit, "allocation refused by hard limit");
                return Err(Error::NoMemory);
            }
            acct.charge(strategy, bytes);
        }

        let region = match strategy {
            AllocStrategy::Pooled => self.take_pooled(block_size).map(Region::Heap),
            AllocStrategy::PageRun => PageRun::allocate(block_size).map(Region::Pages),
            AllocStrategy::Virtual => heap_region(block_size).map(Region::Heap),
        };

        match region {
            Some(region) => Ok(BlockMemory { region, strategy }),
            None => {
                let mut acct = self.inner.accounting.lock();
                acct.credit(strategy, bytes);
                acct.stats.failures += 1;
                debug!(block_size, strategy = strategy.as_str(), "system allocation failed");
                Err(Error::NoMemory)
            }
        }
    }

    /// Return a region obtained from [`allocate`](Self::allocate)
    pub fn release(&self, memory: BlockMemory) {
        let bytes = memory.len() as u64;
        let strategy = memory.strategy;
        self.inner.accounting.lock().credit(strategy, bytes);

        if let Region::Heap(data) = memory.region
            && strategy == AllocStrategy::Pooled
        {
            let mut pools = self.inner.pools.lock();
            let pool = pools.entry(data.len()).or_default();
            if pool.len() < POOL_DEPTH {
                pool.push(data);
                drop(pools);
                self.inner.accounting.lock().stats.pooled_idle_bytes += bytes;
            }
        }
    }

    /// Snapshot of the accounting counters
    #[must_use]
    pub fn stats(&self) -> AllocatorStats {
        self.inner.accounting.lock().stats
    }

    /// Configured hard limit, if any
    #[must_use]
    pub fn limit(&self) -> Option<u64> {
        self.inner.limit
    }

    fn take_pooled(&self, block_size: usize) -> Option<Box<[u8]>> {
        let reused = self
            .inner
            .pools
            .lock()
            .get_mut(&block_size)
            .and_then(Vec::pop);
        match reused {
            Some(data) => {
                let mut acct = self.inner.accounting.lock();
                acct.stats.pooled_idle_bytes =
                    acct.stats.pooled_idle_bytes.saturating_sub(block_size as u64);
                Some(data)
            }
            None => heap_region(block_size),
        }
    }
}

impl Default for BufferAllocator {
    fn default() -> Self {
        Self::new(None)
    }
}

fn heap_region(size: usize) -> Option<Box<[u8]>> {
    let mut data = Vec::new();
    data.try_reserve_exact(size).ok()?;
    data.resize(size, 0);
    Some(data.into_boxed_slice())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strategy_by_size() {
        assert_eq!(AllocStrategy::for_size(512), AllocStrategy::Pooled);
        assert_eq!(AllocStrategy::for_size(2048), AllocStrategy::Pooled);
        assert_eq!(AllocStrategy::for_size(4096), AllocStrategy::PageRun);
        assert_eq!(AllocStrategy::for_size(PAGE_RUN_MAX), AllocStrategy::PageRun);
        assert_eq!(AllocStrategy::for_size(PAGE_RUN_MAX * 2), AllocStrategy::Virtual);
    }

    #[test]
    fn test_allocate_and_release_accounting() {
        let allocator = BufferAllocator::default();

        let small = allocator.allocate(1024, None).unwrap();
        let medium = allocator.allocate(8192, None).unwrap();
        let large = allocator.allocate(128 * 1024, None).unwrap();
        assert_eq!(small.len(), 1024);
        assert_eq!(medium.strategy(), AllocStrategy::PageRun);
        assert_eq!(large.strategy(), AllocStrategy::Virtual);

        let stats = allocator.stats();
        assert_eq!(stats.current(AllocStrategy::Pooled), 1024);
        assert_eq!(stats.current(AllocStrategy::PageRun), 8192);
        assert_eq!(stats.total_current(), 1024 + 8192 + 128 * 1024);

        allocator.release(small);
        allocator.release(medium);
        allocator.release(large);

        let stats = allocator.stats();
        assert_eq!(stats.total_current(), 0);
        assert_eq!(stats.peak(AllocStrategy::PageRun), 8192);
        assert_eq!(stats.pooled_idle_bytes, 1024);
    }

    #[test]
    fn test_page_run_is_aligned_and_zeroed() {
        let allocator = BufferAllocator::default();
        let mut memory = allocator.allocate(16 * 1024, None).unwrap();
        assert_eq!(memory.as_slice().as_ptr() as usize % PAGE_SIZE, 0);
        assert!(memory.as_slice().iter().all(|&b| b == 0));

        memory.as_mut_slice()[100] = 0xAB;
        assert_eq!(memory.as_slice()[100], 0xAB);
        allocator.release(memory);
    }

    #[test]
    fn test_pooled_regions_are_reused() {
        let allocator = BufferAllocator::default();
        let mut first = allocator.allocate(512, None).unwrap();
        first.as_mut_slice()[0] = 7;
        let ptr = first.as_slice().as_ptr();
        allocator.release(first);

        let second = allocator.allocate(512, None).unwrap();
        assert_eq!(second.as_slice().as_ptr(), ptr);
        assert_eq!(allocator.stats().pooled_idle_bytes, 0);
        allocator.release(second);
    }

    #[test]
    fn test_hard_limit() {
        let allocator = BufferAllocator::new(Some(8192));
        let a = allocator.allocate(4096, None).unwrap();
        let b = allocator.allocate(4096, None).unwrap();
        assert!(matches!(allocator.allocate(4096, None), Err(Error::NoMemory)));
        assert_eq!(allocator.stats().failures, 1);

        allocator.release(a);
        let c = allocator.allocate(4096, None).unwrap();
        allocator.release(b);
        allocator.release(c);
        assert_eq!(allocator.stats().total_current(), 0);
    }

    #[test]
    fn test_strategy_hint_overrides_default() {
        let allocator = BufferAllocator::default();
        let memory = allocator.allocate(4096, Some(AllocStrategy::Virtual)).unwrap();
        assert_eq!(memory.strategy(), AllocStrategy::Virtual);
        assert_eq!(allocator.stats().current(AllocStrategy::Virtual), 4096);
        allocator.release(memory);
    }
}
