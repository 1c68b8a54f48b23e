//! Cache runtime context
//!
//! One [`CacheRuntime`] is created per process (or per test) and shared by
//! every client. It owns the buffer allocator, the governor and the client
//! registry, and optionally runs a janitor thread that sweeps aged buffers
//! and starts background write-back on a fixed period.

use crate::allocator::{AllocatorStats, BufferAllocator};
use crate::client::{Client, ClientInner};
use crate::governor::{CacheLimits, Governor, MemoryPressureListener};
use crate::stats::ClientSnapshot;
use blockcache_common::{CacheConfig, ClientId, Result};
use crossbeam_channel::{RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

pub(crate) struct RuntimeInner {
    config: CacheConfig,
    allocator: BufferAllocator,
    governor: Governor,
    clients: Mutex<Vec<(ClientId, Weak<ClientInner>)>>,
    next_client_id: AtomicU64,
}

impl RuntimeInner {
    pub(crate) const fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub(crate) const fn allocator(&self) -> &BufferAllocator {
        &self.allocator
    }

    pub(crate) const fn governor(&self) -> &Governor {
        &self.governor
    }

    pub(crate) fn next_client_id(&self) -> ClientId {
        ClientId::new(self.next_client_id.fetch_add(1, Ordering::Relaxed) + 1)
    }

    pub(crate) fn register(&self, client: &Arc<ClientInner>) {
        self.clients.lock().push((client.id(), Arc::downgrade(client)));
    }

    pub(crate) fn deregister(&self, id: ClientId) {
        self.clients.lock().retain(|(client_id, _)| *client_id != id);
    }

    /// Clients still alive; the registry lock is dropped before returning
    pub(crate) fn live_clients(&self) -> Vec<Arc<ClientInner>> {
        let mut clients = self.clients.lock();
        clients.retain(|(_, weak)| weak.strong_count() > 0);
        clients.iter().filter_map(|(_, weak)| weak.upgrade()).collect()
    }

    pub(crate) fn active_clients(&self) -> usize {
        self.clients
            .lock()
            .iter()
            .filter(|(_, weak)| weak.strong_count() > 0)
            .count()
    }

    pub(crate) fn limits_for(&self, block_size: usize) -> CacheLimits {
        self.governor
            .compute_limits(block_size, self.active_clients())
    }

    /// Evict from other clients that sit above their ceiling
    ///
    /// Used when the allocator is out of memory, so a saturated client
    /// gives memory back to one still below its share.
    pub(crate) fn reclaim_over_ceiling(&self, requester: ClientId) -> usize {
        let mut freed = 0;
        for client in self.live_clients() {
            if client.id() == requester {
                continue;
            }
            let limits = self.limits_for(client.block_size());
            if client.cached_count() > limits.ceiling && client.evict_one(false) {
                freed += 1;
            }
        }
        freed
    }

    fn periodic_sweep(&self, max_age: Duration) -> usize {
        let clients = self.live_clients();
        self.governor.periodic_sweep(&clients, max_age)
    }

    fn external_reclaim(&self, requested: usize, allow_blocking: bool) -> usize {
        let clients = self.live_clients();
        self.governor
            .external_reclaim(&clients, requested, allow_blocking)
    }

    /// One janitor pass: sweep aged buffers, then bring every client back
    /// under its watermark without blocking on I/O
    fn janitor_pass(&self) {
        let swept = self.periodic_sweep(self.config.max_age());
        let mut evicted = 0;
        for client in self.live_clients() {
            let limits = self.limits_for(client.block_size());
            evicted += self.governor.enforce_watermark(&client, limits, 0, false);
        }
        if swept + evicted > 0 {
            debug!(swept, evicted, "janitor pass");
        }
    }
}

struct Janitor {
    stop: Sender<()>,
    handle: JoinHandle<()>,
}

/// Process-wide cache context shared by all clients
pub struct CacheRuntime {
    inner: Arc<RuntimeInner>,
    janitor: Mutex<Option<Janitor>>,
}

impl CacheRuntime {
    /// Build the allocator, governor and registry, and start the janitor
    /// when `sweep_interval_seconds` is non-zero
    pub fn init(config: CacheConfig) -> Result<Self> {
        config.validate()?;
        let allocator = BufferAllocator::new(config.allocator_limit());
        let governor = Governor::new(&config);
        let inner = Arc::new(RuntimeInner {
            allocator,
            governor,
            clients: Mutex::new(Vec::new()),
            next_client_id: AtomicU64::new(0),
            config,
        });

        let janitor = match inner.config.sweep_interval() {
            Some(interval) => Some(spawn_janitor(Arc::clone(&inner), interval)?),
            None => None,
        };

        info!(
            budget_bytes = inner.governor.budget_bytes(),
            max_age_secs = inner.config.max_age_seconds,
            janitor = janitor.is_some(),
            "cache runtime initialized"
        );
        Ok(Self {
            inner,
            janitor: Mutex::new(janitor),
        })
    }

    pub(crate) const fn inner(&self) -> &Arc<RuntimeInner> {
        &self.inner
    }

    /// The configuration the runtime was built from
    #[must_use]
    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    /// The shared governor
    #[must_use]
    pub fn governor(&self) -> &Governor {
        &self.inner.governor
    }

    /// Allocator accounting snapshot
    #[must_use]
    pub fn allocator_stats(&self) -> AllocatorStats {
        self.inner.allocator.stats()
    }

    /// Number of live clients
    #[must_use]
    pub fn active_clients(&self) -> usize {
        self.inner.active_clients()
    }

    /// Handles to every live client
    #[must_use]
    pub fn clients(&self) -> Vec<Client> {
        self.inner
            .live_clients()
            .into_iter()
            .map(Client::from_inner)
            .collect()
    }

    /// Snapshots of every live client, ordered by client id
    #[must_use]
    pub fn snapshots(&self) -> Vec<ClientSnapshot> {
        let mut snapshots: Vec<_> = self
            .inner
            .live_clients()
            .iter()
            .map(|client| client.snapshot())
            .collect();
        snapshots.sort_by_key(|snapshot| snapshot.client_id);
        snapshots
    }

    /// Evict unreferenced clean buffers older than `max_age` from every
    /// client; dirty buffers are never touched
    pub fn periodic_sweep(&self, max_age: Duration) -> usize {
        self.inner.periodic_sweep(max_age)
    }

    /// Free up to `requested` buffers across all clients
    ///
    /// With `allow_blocking_io` false only unreferenced clean buffers are
    /// taken; otherwise dirty buffers are written back and waited on first.
    pub fn external_reclaim(&self, requested: usize, allow_blocking_io: bool) -> usize {
        self.inner.external_reclaim(requested, allow_blocking_io)
    }

    /// Stop and join the janitor; idempotent
    pub fn shutdown(&self) {
        let Some(janitor) = self.janitor.lock().take() else {
            return;
        };
        let _ = janitor.stop.send(());
        if janitor.handle.join().is_err() {
            warn!("cache janitor panicked");
        }
        info!("cache runtime shut down");
    }
}

impl MemoryPressureListener for CacheRuntime {
    fn on_memory_pressure(&self, requested: usize, allow_blocking_io: bool) -> usize {
        self.external_reclaim(requested, allow_blocking_io)
    }
}

impl Drop for CacheRuntime {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for CacheRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheRuntime")
            .field("config", &self.inner.config)
            .field("governor", &self.inner.governor)
            .field("active_clients", &self.active_clients())
            .finish_non_exhaustive()
    }
}

fn spawn_janitor(inner: Arc<RuntimeInner>, interval: Duration) -> Result<Janitor> {
    let (stop, stopped) = crossbeam_channel::bounded::<()>(1);
    let handle = thread::Builder::new()
        .name("blockcache-janitor".to_string())
        .spawn(move || {
            debug!(interval_secs = interval.as_secs(), "cache janitor started");
            loop {
                match stopped.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => inner.janitor_pass(),
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            }
            debug!("cache janitor stopped");
        })?;
    Ok(Janitor { stop, handle })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ClientOptions;
    use crate::device::MemoryDevice;
    use crate::transport::InlineTransport;

    fn quiet_config() -> CacheConfig {
        CacheConfig {
            max_cache_size_bytes: 64 * 512,
            sweep_interval_seconds: 0,
            min_buffers_per_client: 4,
            ..CacheConfig::default()
        }
    }

    fn client(runtime: &CacheRuntime) -> Client {
        let transport = Arc::new(InlineTransport::new(MemoryDevice::new(256 * 512)));
        Client::create(runtime, transport, ClientOptions::new(512)).unwrap()
    }

    #[test]
    fn test_init_rejects_invalid_config() {
        let config = CacheConfig {
            writeback_threshold_percent: 0,
            ..CacheConfig::default()
        };
        assert!(CacheRuntime::init(config).is_err());
    }

    #[test]
    fn test_registry_tracks_clients() {
        let runtime = CacheRuntime::init(quiet_config()).unwrap();
        let a = client(&runtime);
        let b = client(&runtime);
        assert_ne!(a.id(), b.id());
        assert_eq!(runtime.active_clients(), 2);
        assert_eq!(runtime.snapshots().len(), 2);

        drop(a);
        assert_eq!(runtime.active_clients(), 1);
        b.destroy().unwrap();
        assert_eq!(runtime.active_clients(), 0);
        assert!(runtime.clients().is_empty());
    }

    #[test]
    fn test_janitor_sweeps_aged_buffers() {
        let runtime = CacheRuntime::init(CacheConfig {
            sweep_interval_seconds: 1,
            max_age_seconds: 0,
            ..quiet_config()
        })
        .unwrap();
        let client = client(&runtime);
        for block in 0..4 {
            drop(client.new_buffer(block).unwrap());
        }
        assert_eq!(client.snapshot().cached, 4);

        let deadline = std::time::Instant::now() + Duration::from_secs(10);
        while client.snapshot().cached > 0 && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(50));
        }
        assert_eq!(client.snapshot().cached, 0);
        runtime.shutdown();
        runtime.shutdown();
    }

    #[test]
    fn test_memory_pressure_listener() {
        let runtime = CacheRuntime::init(quiet_config()).unwrap();
        let client = client(&runtime);
        for block in 0..6 {
            drop(client.read(block).unwrap());
        }

        let listener: &dyn MemoryPressureListener = &runtime;
        assert_eq!(listener.on_memory_pressure(4, false), 4);
        assert_eq!(client.snapshot().cached, 2);
        assert_eq!(listener.on_memory_pressure(10, false), 2);
        assert_eq!(client.snapshot().cached, 0);
    }
}
