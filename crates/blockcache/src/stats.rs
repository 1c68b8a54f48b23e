//! Cache statistics
//!
//! Per-client counters are plain atomics bumped on the hot path. Snapshots
//! combine them with index occupancy and the client's current limits, and
//! [`PrometheusExporter`] renders snapshots plus allocator accounting in
//! Prometheus text exposition format.

use crate::allocator::{AllocStrategy, AllocatorStats};
use crate::governor::CacheLimits;
use blockcache_common::ClientId;
use serde::Serialize;
use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};

/// Per-client counters
#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    reads_issued: AtomicU64,
    writes_issued: AtomicU64,
    read_errors: AtomicU64,
    write_errors: AtomicU64,
    evictions: AtomicU64,
    prefetches: AtomicU64,
}

macro_rules! counter {
    ($record:ident, $get:ident) => {
        pub(crate) fn $record(&self) {
            self.$get.fetch_add(1, Ordering::Relaxed);
        }

        #[must_use]
        pub fn $get(&self) -> u64 {
            self.$get.load(Ordering::Relaxed)
        }
    };
}

impl CacheStats {
    counter!(record_hit, hits);
    counter!(record_miss, misses);
    counter!(record_read, reads_issued);
    counter!(record_write, writes_issued);
    counter!(record_read_error, read_errors);
    counter!(record_write_error, write_errors);
    counter!(record_eviction, evictions);
    counter!(record_prefetch, prefetches);

    pub(crate) fn record_evictions(&self, count: usize) {
        self.evictions.fetch_add(count as u64, Ordering::Relaxed);
    }

    /// Hits over lookups, 0.0 before the first lookup
    #[must_use]
    pub fn hit_ratio(&self) -> f64 {
        let hits = self.hits();
        let total = hits + self.misses();
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }
}

/// Point-in-time view of one client
#[derive(Debug, Clone, Serialize)]
pub struct ClientSnapshot {
    pub client_id: ClientId,
    pub block_size: usize,
    pub cached: usize,
    pub clean: usize,
    pub dirty: usize,
    pub held: usize,
    pub io_pending: usize,
    pub reserve: usize,
    pub ceiling: usize,
    pub threshold: usize,
    pub hits: u64,
    pub misses: u64,
    pub reads_issued: u64,
    pub writes_issued: u64,
    pub read_errors: u64,
    pub write_errors: u64,
    pub evictions: u64,
    pub prefetches: u64,
}

impl ClientSnapshot {
    pub(crate) fn new(
        client_id: ClientId,
        block_size: usize,
        occupancy: Occupancy,
        limits: CacheLimits,
        stats: &CacheStats,
    ) -> Self {
        Self {
            client_id,
            block_size,
            cached: occupancy.cached,
            clean: occupancy.clean,
            dirty: occupancy.dirty,
            held: occupancy.held,
            io_pending: occupancy.io_pending,
            reserve: occupancy.reserve,
            ceiling: limits.ceiling,
            threshold: limits.threshold,
            hits: stats.hits(),
            misses: stats.misses(),
            reads_issued: stats.reads_issued(),
            writes_issued: stats.writes_issued(),
            read_errors: stats.read_errors(),
            write_errors: stats.write_errors(),
            evictions: stats.evictions(),
            prefetches: stats.prefetches(),
        }
    }

    /// Bytes of block data this client has cached
    #[must_use]
    pub const fn cached_bytes(&self) -> u64 {
        (self.cached * self.block_size) as u64
    }
}

/// Index occupancy read under the client lock
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct Occupancy {
    pub cached: usize,
    pub clean: usize,
    pub dirty: usize,
    pub held: usize,
    pub io_pending: usize,
    pub reserve: usize,
}

/// Prometheus text exporter for cache statistics
pub struct PrometheusExporter {
    prefix: String,
}

impl PrometheusExporter {
    /// Create an exporter whose metric names start with `prefix`
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Render client snapshots and allocator accounting
    #[must_use]
    pub fn render(&self, clients: &[ClientSnapshot], allocator: &AllocatorStats) -> String {
        let mut output = String::with_capacity(4 * 1024);
        self.render_clients(&mut output, clients);
        self.render_allocator(&mut output, allocator);
        output
    }

    fn render_clients(&self, output: &mut String, clients: &[ClientSnapshot]) {
        if clients.is_empty() {
            return;
        }

        let gauges: [(&str, &str, fn(&ClientSnapshot) -> f64); 7] = [
            ("buffers_clean", "Cached clean buffers", |c| c.clean as f64),
            ("buffers_dirty", "Cached dirty buffers", |c| c.dirty as f64),
            ("buffers_held", "Buffers with outstanding holds", |c| {
                c.held as f64
            }),
            ("buffers_io_pending", "Buffers with I/O in flight", |c| {
                c.io_pending as f64
            }),
            ("buffers_reserved", "Pre-reserved buffers not in use", |c| {
                c.reserve as f64
            }),
            ("ceiling_buffers", "Current per-client buffer ceiling", |c| {
                c.ceiling as f64
            }),
            (
                "writeback_threshold_buffers",
                "Dirty buffers that trigger background write-back",
                |c| c.threshold as f64,
            ),
        ];
        for (name, help, value) in gauges {
            self.write_help(output, name, help);
            self.write_type(output, name, "gauge");
            for client in clients {
                let id = client.client_id.to_string();
                self.write_metric_with_labels(output, name, value(client), &[("client", &id)]);
            }
        }

        let counters: [(&str, &str, fn(&ClientSnapshot) -> f64); 8] = [
            ("hits_total", "Lookups served from the cache", |c| c.hits as f64),
            ("misses_total", "Lookups that missed the cache", |c| {
                c.misses as f64
            }),
            ("reads_total", "Device reads issued", |c| c.reads_issued as f64),
            ("writes_total", "Device writes issued", |c| {
                c.writes_issued as f64
            }),
            ("read_errors_total", "Device reads that failed", |c| {
                c.read_errors as f64
            }),
            ("write_errors_total", "Device writes that failed", |c| {
                c.write_errors as f64
            }),
            ("evictions_total", "Buffers evicted", |c| c.evictions as f64),
            ("prefetches_total", "Prefetch reads issued", |c| {
                c.prefetches as f64
            }),
        ];
        for (name, help, value) in counters {
            self.write_help(output, name, help);
            self.write_type(output, name, "counter");
            for client in clients {
                let id = client.client_id.to_string();
                self.write_metric_with_labels(output, name, value(client), &[("client", &id)]);
            }
        }
    }

    fn render_allocator(&self, output: &mut String, stats: &AllocatorStats) {
        self.write_help(output, "allocated_bytes", "Buffer memory in use");
        self.write_type(output, "allocated_bytes", "gauge");
        for strategy in AllocStrategy::ALL {
            self.write_metric_with_labels(
                output,
                "allocated_bytes",
                stats.current(strategy) as f64,
                &[("strategy", strategy.as_str())],
            );
        }

        self.write_help(output, "allocated_peak_bytes", "Peak buffer memory in use");
        self.write_type(output, "allocated_peak_bytes", "gauge");
        for strategy in AllocStrategy::ALL {
            self.write_metric_with_labels(
                output,
                "allocated_peak_bytes",
                stats.peak(strategy) as f64,
                &[("strategy", strategy.as_str())],
            );
        }

        self.write_help(output, "pool_idle_bytes", "Pooled regions awaiting reuse");
        self.write_type(output, "pool_idle_bytes", "gauge");
        self.write_metric(output, "pool_idle_bytes", stats.pooled_idle_bytes as f64);

        self.write_help(output, "allocation_failures_total", "Allocations refused");
        self.write_type(output, "allocation_failures_total", "counter");
        self.write_metric(output, "allocation_failures_total", stats.failures as f64);
    }

    fn write_help(&self, output: &mut String, name: &str, help: &str) {
        let _ = writeln!(output, "# HELP {}_{} {}", self.prefix, name, help);
    }

    fn write_type(&self, output: &mut String, name: &str, metric_type: &str) {
        let _ = writeln!(output, "# TYPE {}_{} {}", self.prefix, name, metric_type);
    }

    fn write_metric(&self, output: &mut String, name: &str, value: f64) {
        let _ = writeln!(output, "{}_{} {}", self.prefix, name, value);
    }

    fn write_metric_with_labels(
        &self,
        output: &mut String,
        name: &str,
        value: f64,
        labels: &[(&str, &str)],
    ) {
        let labels_str: Vec<String> = labels
            .iter()
            .map(|(k, v)| format!("{k}=\"{v}\""))
            .collect();
        let _ = writeln!(
            output,
            "{}_{}{{{}}} {}",
            self.prefix,
            name,
            labels_str.join(","),
            value
        );
    }
}

impl Default for PrometheusExporter {
    fn default() -> Self {
        Self::new("blockcache")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(id: u64) -> ClientSnapshot {
        let stats = CacheStats::default();
        stats.record_hit();
        stats.record_hit();
        stats.record_miss();
        ClientSnapshot::new(
            ClientId::new(id),
            4096,
            Occupancy {
                cached: 3,
                clean: 2,
                dirty: 1,
                ..Occupancy::default()
            },
            CacheLimits {
                threshold: 12,
                ceiling: 16,
            },
            &stats,
        )
    }

    #[test]
    fn test_counters() {
        let stats = CacheStats::default();
        assert_eq!(stats.hit_ratio(), 0.0);
        stats.record_hit();
        stats.record_miss();
        stats.record_evictions(3);
        stats.record_eviction();
        assert_eq!(stats.hits(), 1);
        assert_eq!(stats.misses(), 1);
        assert_eq!(stats.evictions(), 4);
        assert!((stats.hit_ratio() - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_snapshot_bytes() {
        let snap = snapshot(1);
        assert_eq!(snap.cached_bytes(), 3 * 4096);
        assert_eq!(snap.hits, 2);
        assert_eq!(snap.ceiling, 16);
    }

    #[test]
    fn test_prometheus_render() {
        let exporter = PrometheusExporter::default();
        let output = exporter.render(&[snapshot(1), snapshot(2)], &AllocatorStats::default());

        assert!(output.contains("# TYPE blockcache_buffers_dirty gauge"));
        assert!(output.contains("blockcache_buffers_clean{client=\"client-1\"} 2"));
        assert!(output.contains("blockcache_hits_total{client=\"client-2\"} 2"));
        assert!(output.contains("blockcache_allocated_bytes{strategy=\"pooled\"} 0"));
        assert!(output.contains("blockcache_allocation_failures_total 0"));
    }

    #[test]
    fn test_prometheus_render_without_clients() {
        let output = PrometheusExporter::new("cache").render(&[], &AllocatorStats::default());
        assert!(!output.contains("buffers_clean"));
        assert!(output.contains("cache_allocated_peak_bytes"));
    }
}
