//! Cache governor
//!
//! Splits one shared memory budget across the live clients of a runtime
//! and keeps each client near its share:
//!
//! - `compute_limits`: per-client ceiling and write-back threshold
//! - `enforce_watermark`: evict down to the ceiling before growing
//! - `periodic_sweep`: drop unreferenced clean buffers past a maximum age
//! - `external_reclaim`: free buffers on behalf of a host memory notifier
//!
//! Eviction never touches held buffers. When nothing can be evicted the
//! client simply stays above its ceiling until callers release buffers.

use crate::client::ClientInner;
use blockcache_common::CacheConfig;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Budget used when physical memory cannot be determined
const FALLBACK_BUDGET: u64 = 256 * 1024 * 1024;

/// Per-client limits, in buffers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheLimits {
    /// Dirty buffers above which background write-back starts
    pub threshold: usize,
    /// Soft cap on cached buffers
    pub ceiling: usize,
}

/// Host hook for memory pressure
///
/// The host calls this when it wants memory back. `allow_blocking_io` is
/// false on reclaim paths that must not wait: buffers that are dirty or
/// have I/O in flight are then skipped rather than flushed or waited on.
pub trait MemoryPressureListener: Send + Sync {
    /// Free up to `requested` buffers and return how many were freed
    fn on_memory_pressure(&self, requested: usize, allow_blocking_io: bool) -> usize;
}

/// Shared budget and watermark policy
#[derive(Debug, Clone)]
pub struct Governor {
    budget_bytes: u64,
    min_buffers: usize,
    writeback_percent: usize,
}

impl Governor {
    /// Governor for a configuration; a zero budget is derived from
    /// physical memory
    #[must_use]
    pub fn new(config: &CacheConfig) -> Self {
        let budget_bytes = if config.max_cache_size_bytes == 0 {
            auto_budget()
        } else {
            config.max_cache_size_bytes
        };
        debug!(budget_bytes, "cache budget");
        Self {
            budget_bytes,
            min_buffers: config.min_buffers_per_client.max(1),
            writeback_percent: usize::from(config.writeback_threshold_percent.clamp(1, 100)),
        }
    }

    /// Total bytes shared by all clients
    #[must_use]
    pub const fn budget_bytes(&self) -> u64 {
        self.budget_bytes
    }

    /// Ceiling and threshold of one client among `active_clients`
    #[must_use]
    pub fn compute_limits(&self, block_size: usize, active_clients: usize) -> CacheLimits {
        let share = self.budget_bytes / active_clients.max(1) as u64;
        let buffers = usize::try_from(share / block_size.max(1) as u64).unwrap_or(usize::MAX);
        let ceiling = buffers.max(self.min_buffers);
        let threshold = (ceiling.saturating_mul(self.writeback_percent) / 100).max(1);
        CacheLimits { threshold, ceiling }
    }

    /// Bring `client` down to its ceiling, leaving room for `incoming` more
    /// buffers, and start write-back once dirty buffers pass the threshold
    ///
    /// Returns the number of buffers evicted.
    pub(crate) fn enforce_watermark(
        &self,
        client: &Arc<ClientInner>,
        limits: CacheLimits,
        incoming: usize,
        allow_blocking: bool,
    ) -> usize {
        if client.dirty_count() > limits.threshold {
            let issued = client.write_dirty_buffers_async(false);
            trace!(client = %client.id(), issued, "dirty threshold exceeded");
        }

        let mut evicted = 0;
        while client.cached_count() + incoming > limits.ceiling {
            if !client.evict_one(allow_blocking) {
                break;
            }
            evicted += 1;
        }
        if evicted > 0 {
            debug!(client = %client.id(), evicted, ceiling = limits.ceiling, "watermark eviction");
        }
        evicted
    }

    /// Evict unreferenced clean buffers not touched within `max_age`
    pub(crate) fn periodic_sweep(&self, clients: &[Arc<ClientInner>], max_age: Duration) -> usize {
        let Some(cutoff) = Instant::now().checked_sub(max_age) else {
            return 0;
        };
        let swept: usize = clients.iter().map(|client| client.evict_aged(cutoff)).sum();
        if swept > 0 {
            debug!(swept, max_age_secs = max_age.as_secs(), "periodic sweep");
        }
        swept
    }

    /// Free up to `requested` buffers across `clients`, one per client per
    /// round so no single client absorbs all of the pressure
    pub(crate) fn external_reclaim(
        &self,
        clients: &[Arc<ClientInner>],
        requested: usize,
        allow_blocking: bool,
    ) -> usize {
        let mut freed = 0;
        while freed < requested {
            let mut progress = false;
            for client in clients {
                if freed == requested {
                    break;
                }
                if client.evict_one(allow_blocking) {
                    freed += 1;
                    progress = true;
                }
            }
            if !progress {
                break;
            }
        }
        debug!(requested, freed, allow_blocking, "external reclaim");
        freed
    }
}

/// A quarter of physical memory
fn auto_budget() -> u64 {
    physical_memory().map_or(FALLBACK_BUDGET, |bytes| (bytes / 4).max(FALLBACK_BUDGET / 16))
}

#[cfg(unix)]
fn physical_memory() -> Option<u64> {
    // SAFETY: sysconf has no memory-safety preconditions.
    #[allow(unsafe_code)]
    let (pages, page_size) = unsafe {
        (
            libc::sysconf(libc::_SC_PHYS_PAGES),
            libc::sysconf(libc::_SC_PAGESIZE),
        )
    };
    if pages <= 0 || page_size <= 0 {
        return None;
    }
    u64::try_from(pages)
        .ok()?
        .checked_mul(u64::try_from(page_size).ok()?)
}

#[cfg(not(unix))]
const fn physical_memory() -> Option<u64> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn governor(budget: u64, min_buffers: usize) -> Governor {
        Governor::new(&CacheConfig {
            max_cache_size_bytes: budget,
            min_buffers_per_client: min_buffers,
            ..CacheConfig::default()
        })
    }

    #[test]
    fn test_limits_split_budget() {
        let governor = governor(1024 * 4096, 4);
        let one = governor.compute_limits(4096, 1);
        assert_eq!(one.ceiling, 1024);
        assert_eq!(one.threshold, 768);

        let two = governor.compute_limits(4096, 2);
        assert_eq!(two.ceiling, 512);
        assert_eq!(two.threshold, 384);
    }

    #[test]
    fn test_limits_floor() {
        let governor = governor(64 * 1024, 32);
        let limits = governor.compute_limits(4096, 8);
        assert_eq!(limits.ceiling, 32);
        assert_eq!(limits.threshold, 24);
    }

    #[test]
    fn test_zero_clients_treated_as_one() {
        let governor = governor(8 * 512, 1);
        assert_eq!(governor.compute_limits(512, 0).ceiling, 8);
    }

    #[test]
    fn test_auto_budget() {
        let governor = governor(0, 16);
        assert!(governor.budget_bytes() >= FALLBACK_BUDGET / 16);
    }
}
