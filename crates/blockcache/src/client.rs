//! Cache clients
//!
//! A [`Client`] caches one block device at one block size. It owns the
//! index and LRU lists for its buffers, a small pool of pre-reserved data
//! regions, the sticky asynchronous write error and an outgoing write
//! batch. All clients of one [`CacheRuntime`] share its memory budget.
//!
//! # Locking
//!
//! One mutex guards the index, the lists and every hold count. It is never
//! held while submitting I/O or running caller hooks, because transports
//! may complete requests on the submitting thread. Threads waiting for a
//! buffer's I/O sleep on the client's condition variable, which completion
//! handlers signal after updating the buffer state under the same mutex.
//! Data written by a read completion is therefore visible to any waiter
//! that observes the buffer as no longer reading.

use crate::allocator::BlockMemory;
use crate::batch::WriteBatch;
use crate::buffer::{Buffer, BufferHandle};
use crate::governor::CacheLimits;
use crate::index::{BufferIndex, Slot};
use crate::runtime::{CacheRuntime, RuntimeInner};
use crate::state::BufferState;
use crate::stats::{CacheStats, ClientSnapshot, Occupancy};
use crate::transport::{BlockTransport, IoDirection, IoRequest};
use blockcache_common::{BlockNumber, BufferId, ClientId, Error, Result, is_valid_block_size};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::collections::HashSet;
use std::io;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, trace, warn};

/// Caller hooks run on buffer creation and before every write
///
/// Hooks run without any cache lock held but must not call back into the
/// client for the buffer they are given.
pub trait BufferHooks: Send + Sync {
    /// Called once for every newly created buffer, before it is visible
    fn init_buffer(&self, _block: BlockNumber, _aux: &mut [u8]) {}

    /// Called right before the buffer's data is handed to the transport
    fn before_write(&self, _block: BlockNumber, _data: &mut [u8], _aux: &mut [u8]) {}

    /// Whether `before_write` must run; when false writes never take the
    /// data lock before submission
    fn has_before_write(&self) -> bool {
        true
    }
}

/// Hooks that do nothing
#[derive(Debug, Clone, Copy, Default)]
pub struct NoHooks;

impl BufferHooks for NoHooks {
    fn has_before_write(&self) -> bool {
        false
    }
}

/// Parameters of a new client
#[derive(Clone)]
pub struct ClientOptions {
    /// Power of two, at least one sector
    pub block_size: usize,
    /// Data regions set aside at creation for when the allocator runs dry
    pub reserved_buffers: usize,
    /// Size of the caller-owned record attached to every buffer
    pub aux_size: usize,
    pub hooks: Arc<dyn BufferHooks>,
}

impl ClientOptions {
    #[must_use]
    pub fn new(block_size: usize) -> Self {
        Self {
            block_size,
            reserved_buffers: 0,
            aux_size: 0,
            hooks: Arc::new(NoHooks),
        }
    }

    #[must_use]
    pub const fn with_reserved_buffers(mut self, count: usize) -> Self {
        self.reserved_buffers = count;
        self
    }

    #[must_use]
    pub const fn with_aux_size(mut self, size: usize) -> Self {
        self.aux_size = size;
        self
    }

    #[must_use]
    pub fn with_hooks(mut self, hooks: impl BufferHooks + 'static) -> Self {
        self.hooks = Arc::new(hooks);
        self
    }
}

impl std::fmt::Debug for ClientOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientOptions")
            .field("block_size", &self.block_size)
            .field("reserved_buffers", &self.reserved_buffers)
            .field("aux_size", &self.aux_size)
            .finish_non_exhaustive()
    }
}

/// How a lookup treats a missing or not yet valid block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Acquire {
    /// Create on miss and read it in
    Read,
    /// Create on miss with zeroed contents, no I/O
    Fresh,
    /// Only return valid cached data
    Cached,
}

pub(crate) struct ClientInner {
    id: ClientId,
    runtime: Arc<RuntimeInner>,
    transport: Arc<dyn BlockTransport>,
    block_size: usize,
    device_size: u64,
    block_count: u64,
    aux_size: usize,
    reserved: usize,
    hooks: Arc<dyn BufferHooks>,
    index: Mutex<BufferIndex>,
    /// Signalled on every I/O completion and whenever a hold count drops
    /// to zero
    io_done: Condvar,
    batch: WriteBatch,
    stats: CacheStats,
}

impl ClientInner {
    pub(crate) const fn id(&self) -> ClientId {
        self.id
    }

    pub(crate) const fn block_size(&self) -> usize {
        self.block_size
    }

    fn lock(&self) -> MutexGuard<'_, BufferIndex> {
        let index = self.index.lock();
        assert!(!index.destroyed, "{} used after destroy", self.id);
        index
    }

    fn check_block(&self, block: BlockNumber) -> Result<()> {
        if block >= self.block_count {
            return Err(Error::invalid_argument(format!(
                "block {block} is beyond the end of the device ({} blocks)",
                self.block_count
            )));
        }
        Ok(())
    }

    fn wait_while(
        &self,
        index: &mut MutexGuard<'_, BufferIndex>,
        id: BufferId,
        busy: impl Fn(BufferState) -> bool,
    ) {
        while index.slot(id).is_some_and(|slot| busy(slot.state)) {
            self.io_done.wait(index);
        }
    }

    pub(crate) fn limits(&self) -> CacheLimits {
        self.runtime.limits_for(self.block_size)
    }

    pub(crate) fn cached_count(&self) -> usize {
        self.index.lock().len()
    }

    pub(crate) fn dirty_count(&self) -> usize {
        self.index.lock().dirty_len()
    }

    fn occupancy(&self) -> Occupancy {
        let index = self.index.lock();
        Occupancy {
            cached: index.len(),
            clean: index.clean_len(),
            dirty: index.dirty_len(),
            held: index.held_len(),
            io_pending: index.io_pending_len(),
            reserve: index.reserve.len(),
        }
    }

    pub(crate) fn snapshot(&self) -> ClientSnapshot {
        ClientSnapshot::new(
            self.id,
            self.block_size,
            self.occupancy(),
            self.limits(),
            &self.stats,
        )
    }

    // ---- Lookup ----

    fn acquire(self: &Arc<Self>, block: BlockNumber, mode: Acquire) -> Result<BufferHandle> {
        self.check_block(block)?;
        let mut index = self.lock();
        if let Some(id) = index.find(block) {
            return self.acquire_cached(index, id, mode);
        }
        if mode == Acquire::Cached {
            self.stats.record_miss();
            return Err(Error::NotFound { block });
        }
        let id = index.allocate_id();
        drop(index);

        let memory = self.obtain_memory(true)?;
        let buffer = Arc::new(Buffer::new(id, block, memory, self.aux_size));
        if mode == Acquire::Fresh {
            buffer.zero_data();
        }
        self.hooks.init_buffer(block, &mut buffer.aux());

        let mut index = self.lock();
        if let Some(existing) = index.find(block) {
            trace!(client = %self.id, block, "lost creation race");
            self.recycle(&mut index, &buffer);
            return self.acquire_cached(index, existing, mode);
        }
        self.stats.record_miss();

        if mode == Acquire::Fresh {
            index.link(Arc::clone(&buffer), BufferState::CLEAN, 1);
            drop(index);
            trace!(client = %self.id, block, "fresh buffer");
            return Ok(BufferHandle::new(buffer, Arc::clone(self)));
        }

        index.link(Arc::clone(&buffer), BufferState::CLEAN.begin_read(), 1);
        drop(index);
        self.submit_read(Arc::clone(&buffer));

        let mut index = self.index.lock();
        self.wait_while(&mut index, id, |state| state == BufferState::Reading);
        self.finish_acquire(index, buffer)
    }

    fn acquire_cached(
        self: &Arc<Self>,
        mut index: MutexGuard<'_, BufferIndex>,
        id: BufferId,
        mode: Acquire,
    ) -> Result<BufferHandle> {
        let slot = indexed(&index, id);
        let buffer = Arc::clone(&slot.buffer);
        if mode == Acquire::Cached
            && (slot.state == BufferState::Reading || slot.read_error.is_some())
        {
            self.stats.record_miss();
            return Err(Error::NotFound {
                block: buffer.block(),
            });
        }
        index.hold(id);
        index.relink(id);
        self.stats.record_hit();
        if mode == Acquire::Cached {
            drop(index);
            return Ok(BufferHandle::new(buffer, Arc::clone(self)));
        }

        self.wait_while(&mut index, id, |state| state == BufferState::Reading);
        if mode == Acquire::Fresh
            && let Some(slot) = index.slot_mut(id)
            && slot.read_error.take().is_some()
        {
            // The caller overwrites the block; drop what the failed read left.
            drop(index);
            buffer.zero_data();
            return Ok(BufferHandle::new(buffer, Arc::clone(self)));
        }
        self.finish_acquire(index, buffer)
    }

    /// Turn a held, no longer reading buffer into a handle or its read error
    fn finish_acquire(
        self: &Arc<Self>,
        index: MutexGuard<'_, BufferIndex>,
        buffer: Arc<Buffer>,
    ) -> Result<BufferHandle> {
        let read_error = index.slot(buffer.id()).and_then(|slot| slot.read_error);
        drop(index);
        let block = buffer.block();
        let handle = BufferHandle::new(buffer, Arc::clone(self));
        match read_error {
            Some(kind) => {
                // Releasing the last hold tears the buffer down.
                drop(handle);
                Err(Error::Read { block, kind })
            }
            None => Ok(handle),
        }
    }

    // ---- Memory ----

    fn try_allocate(&self) -> Result<Option<BlockMemory>> {
        match self.runtime.allocator().allocate(self.block_size, None) {
            Ok(memory) => Ok(Some(memory)),
            Err(Error::NoMemory) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Memory for one more buffer
    ///
    /// Makes room under the ceiling first, then falls back from the
    /// allocator to other clients over their share, to this client's own
    /// least recently used buffer, and finally to the reserve pool.
    fn obtain_memory(self: &Arc<Self>, allow_blocking: bool) -> Result<BlockMemory> {
        let limits = self.limits();
        self.runtime
            .governor()
            .enforce_watermark(self, limits, 1, allow_blocking);

        if let Some(memory) = self.try_allocate()? {
            return Ok(memory);
        }
        if self.runtime.reclaim_over_ceiling(self.id) > 0
            && let Some(memory) = self.try_allocate()?
        {
            return Ok(memory);
        }

        let mut index = self.lock();
        if let Some(id) = self.pick_unclaimed(&mut index, allow_blocking) {
            let victim = index.unlink(id);
            self.stats.record_eviction();
            trace!(client = %self.id, block = victim.block(), "reusing evicted buffer memory");
            if let Some(memory) = victim.take_memory() {
                return Ok(memory);
            }
        }
        index.reserve.pop().ok_or_else(|| {
            debug!(client = %self.id, "no memory for another buffer");
            Error::NoMemory
        })
    }

    /// Hand a discarded buffer's memory to the reserve pool, or back to the
    /// allocator once the pool is full
    fn recycle(&self, index: &mut BufferIndex, buffer: &Buffer) {
        let Some(memory) = buffer.take_memory() else {
            return;
        };
        if index.reserve.len() < self.reserved {
            index.reserve.push(memory);
        } else {
            self.runtime.allocator().release(memory);
        }
    }

    /// The next eviction candidate: the oldest unreferenced clean buffer,
    /// or with `allow_blocking` the oldest unreferenced dirty buffer after
    /// writing it back
    ///
    /// Drops the lock while waiting for write-back.
    fn pick_unclaimed(
        self: &Arc<Self>,
        index: &mut MutexGuard<'_, BufferIndex>,
        allow_blocking: bool,
    ) -> Option<BufferId> {
        let mut tried = HashSet::new();
        loop {
            if let Some(id) = index.oldest_unclaimed_clean() {
                return Some(id);
            }
            if !allow_blocking {
                return None;
            }
            let id = index.oldest_unheld_dirty(&tried)?;
            tried.insert(id);

            let slot = index.slot_mut(id)?;
            if let Some(writing) = slot.state.begin_write() {
                slot.state = writing;
                let buffer = Arc::clone(&slot.buffer);
                MutexGuard::unlocked(index, || self.issue_writes(vec![buffer]));
            }
            self.wait_while(index, id, BufferState::io_pending);
            if index.slot(id).is_some_and(Slot::is_unclaimed) {
                return Some(id);
            }
        }
    }

    /// Evict one buffer, if any is evictable
    pub(crate) fn evict_one(self: &Arc<Self>, allow_blocking: bool) -> bool {
        let mut index = self.index.lock();
        if index.destroyed {
            return false;
        }
        let Some(id) = self.pick_unclaimed(&mut index, allow_blocking) else {
            return false;
        };
        let victim = index.unlink(id);
        self.recycle(&mut index, &victim);
        self.stats.record_eviction();
        trace!(client = %self.id, block = victim.block(), "evicted");
        true
    }

    /// Evict unreferenced clean buffers last touched before `cutoff`
    pub(crate) fn evict_aged(&self, cutoff: Instant) -> usize {
        let mut index = self.index.lock();
        let aged = index.unclaimed_clean_before(cutoff);
        for &id in &aged {
            let victim = index.unlink(id);
            self.recycle(&mut index, &victim);
        }
        self.stats.record_evictions(aged.len());
        aged.len()
    }

    // ---- I/O ----

    fn submit_read(self: &Arc<Self>, buffer: Arc<Buffer>) {
        let client = Arc::clone(self);
        let id = buffer.id();
        trace!(client = %self.id, block = buffer.block(), "read issued");
        self.stats.record_read();
        let request = IoRequest::new(
            IoDirection::Read,
            buffer,
            Box::new(move |result| client.complete_read(id, result)),
        );
        self.transport.submit(request);
    }

    fn complete_read(&self, id: BufferId, result: io::Result<()>) {
        let mut index = self.index.lock();
        if let Some(slot) = index.slot_mut(id) {
            slot.state = slot.state.finish_read();
            match result {
                Ok(()) => slot.read_error = None,
                Err(e) => {
                    slot.read_error = Some(e.kind());
                    self.stats.record_read_error();
                }
            }
        }
        drop(index);
        self.io_done.notify_all();
    }

    /// Run the before-write hook and queue one write per buffer; every
    /// buffer must already be in the writing state
    fn issue_writes(self: &Arc<Self>, buffers: Vec<Arc<Buffer>>) {
        if buffers.is_empty() {
            return;
        }
        let run_hook = self.hooks.has_before_write();
        for buffer in buffers {
            let block = buffer.block();
            if run_hook {
                let mut data = buffer.data_mut();
                let mut aux = buffer.aux();
                self.hooks.before_write(block, &mut data, &mut aux);
            }
            let client = Arc::clone(self);
            let id = buffer.id();
            let request = IoRequest::new(
                IoDirection::Write,
                buffer,
                Box::new(move |result| client.complete_write(id, result)),
            );
            trace!(client = %self.id, block, "write issued");
            self.stats.record_write();
            self.batch.push(request, self.transport.as_ref());
        }
        self.batch.submit(self.transport.as_ref());
    }

    fn complete_write(&self, id: BufferId, result: io::Result<()>) {
        let mut index = self.index.lock();
        if let Some(slot) = index.slot_mut(id) {
            slot.state = slot.state.finish_write(result.is_ok());
            let block = slot.buffer.block();
            if let Err(e) = result {
                self.stats.record_write_error();
                warn!(client = %self.id, block, "write failed: {e}");
                index.async_write_error.get_or_insert((block, e.kind()));
            }
            index.relink(id);
        }
        drop(index);
        self.io_done.notify_all();
    }

    /// Start write-back of every idle dirty buffer, or with `include_held`
    /// false only of those nobody holds; returns how many writes were issued
    pub(crate) fn write_dirty_buffers_async(self: &Arc<Self>, include_held: bool) -> usize {
        let buffers = {
            let mut index = self.index.lock();
            let mut buffers = Vec::new();
            for id in index.dirty_ids() {
                if let Some(slot) = index.slot_mut(id)
                    && (include_held || slot.holds == 0)
                    && let Some(writing) = slot.state.begin_write()
                {
                    slot.state = writing;
                    buffers.push(Arc::clone(&slot.buffer));
                }
            }
            buffers
        };
        let issued = buffers.len();
        self.issue_writes(buffers);
        issued
    }

    fn write_dirty_buffers(self: &Arc<Self>) -> Result<()> {
        let mut index = self.lock();
        let targets = index.dirty_ids();
        let mut issued = HashSet::new();
        let mut buffers = Vec::new();
        for &id in &targets {
            if let Some(slot) = index.slot_mut(id)
                && let Some(writing) = slot.state.begin_write()
            {
                slot.state = writing;
                buffers.push(Arc::clone(&slot.buffer));
                issued.insert(id);
            }
        }
        debug!(client = %self.id, dirty = targets.len(), issued = issued.len(), "writing dirty buffers");
        MutexGuard::unlocked(&mut index, || self.issue_writes(buffers));

        // Buffers already being written at entry may carry changes that the
        // in-flight write predates; write those again once it finishes.
        for id in targets {
            loop {
                self.wait_while(&mut index, id, |state| {
                    matches!(state, BufferState::Writing { .. })
                });
                if issued.contains(&id) {
                    break;
                }
                let Some(slot) = index.slot_mut(id) else {
                    break;
                };
                let Some(writing) = slot.state.begin_write() else {
                    break;
                };
                slot.state = writing;
                let buffer = Arc::clone(&slot.buffer);
                issued.insert(id);
                MutexGuard::unlocked(&mut index, || self.issue_writes(vec![buffer]));
            }
        }

        match index.async_write_error.take() {
            Some((block, kind)) => Err(Error::Write { block, kind }),
            None => Ok(()),
        }
    }

    // ---- Holds ----

    /// Drop one hold; the last release of a buffer whose read failed tears
    /// it down
    pub(crate) fn release_hold(&self, id: BufferId) {
        let mut index = self.index.lock();
        if index.unhold(id) > 0 {
            return;
        }
        let slot = indexed(&index, id);
        if slot.read_error.is_some() && !slot.state.io_pending() {
            let victim = index.unlink(id);
            self.recycle(&mut index, &victim);
            debug!(client = %self.id, block = victim.block(), "dropped buffer after read error");
        }
        drop(index);
        self.io_done.notify_all();
    }

    fn mark_dirty(&self, id: BufferId) {
        let mut index = self.lock();
        let slot = indexed_mut(&mut index, id);
        assert!(slot.holds > 0, "mark_dirty on unheld buffer {id}");
        let before = slot.state;
        slot.state = before.mark_dirty();
        if slot.state.list() != before.list() {
            index.relink(id);
        }
    }

    fn release_move(self: &Arc<Self>, handle: BufferHandle, new_block: BlockNumber) -> Result<()> {
        self.check_block(new_block)?;
        let id = handle.id();
        let old_block = handle.block_number();
        if old_block == new_block {
            return Ok(());
        }

        let mut index = self.lock();
        let mut wrote_old = false;
        loop {
            self.wait_while(&mut index, id, BufferState::io_pending);

            if let Some(occupant) = index.find(new_block) {
                let slot = indexed(&index, occupant);
                if slot.holds == 0 && !slot.state.io_pending() {
                    if slot.state.is_dirty() {
                        debug!(client = %self.id, block = new_block, "discarding dirty buffer replaced by move");
                    }
                    let victim = index.unlink(occupant);
                    self.recycle(&mut index, &victim);
                    self.stats.record_eviction();
                } else {
                    self.io_done.wait(&mut index);
                }
                continue;
            }

            // Other holders still see the old block, so it keeps its data.
            let slot = indexed_mut(&mut index, id);
            if !wrote_old && slot.holds > 1 && slot.state.is_dirty() {
                wrote_old = true;
                if let Some(writing) = slot.state.begin_write() {
                    slot.state = writing;
                    let buffer = Arc::clone(&slot.buffer);
                    MutexGuard::unlocked(&mut index, || self.issue_writes(vec![buffer]));
                }
                continue;
            }
            break;
        }

        index.rekey(id, new_block);
        let slot = indexed_mut(&mut index, id);
        slot.state = slot.state.mark_dirty();
        index.relink(id);
        drop(index);
        trace!(client = %self.id, old_block, new_block, "buffer moved");
        drop(handle);
        Ok(())
    }

    fn destroy(&self) {
        let mut index = self.lock();
        while index.io_pending_len() > 0 {
            self.io_done.wait(&mut index);
        }
        let held = index.held_len();
        assert!(held == 0, "{} destroyed with {held} held buffers", self.id);

        let dirty = index.dirty_len();
        if dirty > 0 {
            error!(client = %self.id, dirty, "discarding dirty buffers on destroy");
        }
        let allocator = self.runtime.allocator();
        for id in index.ids() {
            if let Some(memory) = index.unlink(id).take_memory() {
                allocator.release(memory);
            }
        }
        for memory in index.reserve.drain(..) {
            allocator.release(memory);
        }
        index.destroyed = true;
        drop(index);

        self.runtime.deregister(self.id);
        info!(client = %self.id, "cache client destroyed");
    }
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        let index = self.index.get_mut();
        if index.destroyed {
            return;
        }
        let dirty = index.dirty_len();
        if dirty > 0 {
            warn!(client = %self.id, dirty, "client dropped with unwritten dirty buffers");
        }
        // Handles and in-flight requests own references to us, so nothing is
        // held or pending here.
        let allocator = self.runtime.allocator();
        for id in index.ids() {
            if let Some(memory) = index.unlink(id).take_memory() {
                allocator.release(memory);
            }
        }
        for memory in index.reserve.drain(..) {
            allocator.release(memory);
        }
        self.runtime.deregister(self.id);
        debug!(client = %self.id, "cache client dropped");
    }
}

fn indexed(index: &BufferIndex, id: BufferId) -> &Slot {
    index
        .slot(id)
        .unwrap_or_else(|| panic!("buffer {id} is not indexed"))
}

fn indexed_mut(index: &mut BufferIndex, id: BufferId) -> &mut Slot {
    index
        .slot_mut(id)
        .unwrap_or_else(|| panic!("buffer {id} is not indexed"))
}

/// Handle to one cache client
///
/// Clones share the same cache. All methods may be called from any thread.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    /// Create a client over `transport`
    ///
    /// Fails with [`Error::InvalidArgument`] for a block size that is not a
    /// power of two of at least one sector, and with [`Error::NoMemory`]
    /// if the reserve pool cannot be allocated.
    pub fn create(
        runtime: &CacheRuntime,
        transport: Arc<dyn BlockTransport>,
        options: ClientOptions,
    ) -> Result<Self> {
        if !is_valid_block_size(options.block_size) {
            return Err(Error::invalid_argument(format!(
                "block size {} is not a power of two of at least one sector",
                options.block_size
            )));
        }
        let runtime = Arc::clone(runtime.inner());
        let allocator = runtime.allocator();

        let mut reserve = Vec::with_capacity(options.reserved_buffers);
        for _ in 0..options.reserved_buffers {
            match allocator.allocate(options.block_size, None) {
                Ok(memory) => reserve.push(memory),
                Err(e) => {
                    for memory in reserve {
                        allocator.release(memory);
                    }
                    return Err(e);
                }
            }
        }

        let device_size = transport.device_size();
        let block_count = device_size / options.block_size as u64;
        let mut index = BufferIndex::new();
        index.reserve = reserve;

        let inner = Arc::new(ClientInner {
            id: runtime.next_client_id(),
            batch: WriteBatch::new(runtime.config().write_batch_size),
            runtime,
            transport,
            block_size: options.block_size,
            device_size,
            block_count,
            aux_size: options.aux_size,
            reserved: options.reserved_buffers,
            hooks: options.hooks,
            index: Mutex::new(index),
            io_done: Condvar::new(),
            stats: CacheStats::default(),
        });
        inner.runtime.register(&inner);

        info!(
            client = %inner.id,
            block_size = inner.block_size,
            block_count,
            reserved = inner.reserved,
            "cache client created"
        );
        Ok(Self { inner })
    }

    pub(crate) const fn from_inner(inner: Arc<ClientInner>) -> Self {
        Self { inner }
    }

    #[must_use]
    pub fn id(&self) -> ClientId {
        self.inner.id
    }

    #[must_use]
    pub fn block_size(&self) -> usize {
        self.inner.block_size
    }

    /// Device size in bytes
    #[must_use]
    pub fn device_size(&self) -> u64 {
        self.inner.device_size
    }

    /// Number of whole blocks on the device
    #[must_use]
    pub fn block_count(&self) -> u64 {
        self.inner.block_count
    }

    /// Get `block`, reading it from the device on a miss
    ///
    /// Blocks until the data is valid. A failed read is returned as
    /// [`Error::Read`] and the buffer is not kept.
    pub fn read(&self, block: BlockNumber) -> Result<BufferHandle> {
        self.inner.acquire(block, Acquire::Read)
    }

    /// Get `block` only if it is cached and valid; never blocks or issues
    /// I/O
    pub fn get(&self, block: BlockNumber) -> Result<BufferHandle> {
        self.inner.acquire(block, Acquire::Cached)
    }

    /// Get `block` for overwriting: a miss creates a zeroed buffer without
    /// reading the device
    pub fn new_buffer(&self, block: BlockNumber) -> Result<BufferHandle> {
        self.inner.acquire(block, Acquire::Fresh)
    }

    /// Start reads for up to `count` blocks from `block` and return
    ///
    /// Cached blocks are skipped. Prefetch never evicts dirty buffers and
    /// stops early at the ceiling or when memory runs out. Read failures
    /// stay on the buffer for the next accessor.
    pub fn prefetch(&self, block: BlockNumber, count: usize) {
        let end = block
            .saturating_add(count as u64)
            .min(self.inner.block_count);
        let ceiling = self.inner.limits().ceiling;
        for block in block..end {
            let id = {
                let mut index = self.inner.lock();
                if index.find(block).is_some() {
                    continue;
                }
                index.allocate_id()
            };
            if self.inner.cached_count() >= ceiling && !self.inner.evict_one(false) {
                debug!(client = %self.inner.id, block, ceiling, "prefetch stopped at ceiling");
                break;
            }
            let memory = match self.inner.obtain_memory(false) {
                Ok(memory) => memory,
                Err(e) => {
                    debug!(client = %self.inner.id, block, "prefetch stopped: {e}");
                    break;
                }
            };
            let buffer = Arc::new(Buffer::new(id, block, memory, self.inner.aux_size));
            self.inner.hooks.init_buffer(block, &mut buffer.aux());

            let mut index = self.inner.lock();
            if index.find(block).is_some() {
                self.inner.recycle(&mut index, &buffer);
                continue;
            }
            index.link(Arc::clone(&buffer), BufferState::CLEAN.begin_read(), 0);
            drop(index);
            self.inner.stats.record_prefetch();
            self.inner.submit_read(buffer);
        }
    }

    /// Release a hold; same as dropping the handle
    ///
    /// # Panics
    ///
    /// Panics if the handle belongs to another client.
    pub fn release(&self, handle: BufferHandle) {
        self.check_owner(&handle);
        drop(handle);
    }

    /// Record that the held buffer's data was modified; never blocks on I/O
    ///
    /// # Panics
    ///
    /// Panics if the handle belongs to another client.
    pub fn mark_dirty(&self, handle: &BufferHandle) {
        self.check_owner(handle);
        self.inner.mark_dirty(handle.id());
    }

    /// Start write-back of every dirty buffer without waiting; returns the
    /// number of writes issued
    pub fn write_dirty_buffers_async(&self) -> usize {
        drop(self.inner.lock());
        self.inner.write_dirty_buffers_async(true)
    }

    /// Write back every buffer dirty at the time of the call and wait
    ///
    /// Returns the first write failure since the previous call, and clears
    /// it: each failure is reported exactly once. Buffers dirtied during
    /// the call may or may not be included.
    pub fn write_dirty_buffers(&self) -> Result<()> {
        self.inner.write_dirty_buffers()
    }

    /// Ask the device to persist everything written so far
    ///
    /// A write that failed since the last drain takes precedence over the
    /// flush outcome and is cleared, as in [`Client::write_dirty_buffers`].
    pub fn issue_flush(&self) -> Result<()> {
        drop(self.inner.lock());
        let flushed = self
            .inner
            .transport
            .flush()
            .map_err(|e| Error::Flush { kind: e.kind() });
        let failed_write = self.inner.lock().async_write_error.take();
        match failed_write {
            Some((block, kind)) => Err(Error::Write { block, kind }),
            None => flushed,
        }
    }

    /// Move the held buffer to `new_block` and release the hold
    ///
    /// A buffer cached at `new_block` is discarded first, after waiting for
    /// its holders. The moved buffer is dirty at its new location. If other
    /// handles still hold it, its dirty data is first written to the old
    /// block as well.
    ///
    /// # Panics
    ///
    /// Panics if the handle belongs to another client.
    pub fn release_move(&self, handle: BufferHandle, new_block: BlockNumber) -> Result<()> {
        self.check_owner(&handle);
        self.inner.release_move(handle, new_block)
    }

    /// Write back, free every buffer and the reserve pool, and leave the
    /// runtime
    ///
    /// Returns the final write-back error, if any; dirty buffers that could
    /// not be written are discarded. Other clones of this client must not
    /// be used afterwards.
    ///
    /// # Panics
    ///
    /// Panics if any buffer is still held.
    pub fn destroy(self) -> Result<()> {
        let written = self.inner.write_dirty_buffers();
        self.inner.destroy();
        written
    }

    /// Clear the sticky write error without reporting it; returns whether
    /// one was set
    pub fn reset_write_error(&self) -> bool {
        self.inner.lock().async_write_error.take().is_some()
    }

    /// Current ceiling and write-back threshold
    #[must_use]
    pub fn limits(&self) -> CacheLimits {
        self.inner.limits()
    }

    /// Counters since creation
    #[must_use]
    pub fn stats(&self) -> &CacheStats {
        &self.inner.stats
    }

    /// Occupancy, limits and counters
    #[must_use]
    pub fn snapshot(&self) -> ClientSnapshot {
        self.inner.snapshot()
    }

    fn check_owner(&self, handle: &BufferHandle) {
        assert!(
            Arc::ptr_eq(handle.client_inner(), &self.inner),
            "buffer handle of {} used with {}",
            handle.client_inner().id(),
            self.inner.id
        );
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("id", &self.inner.id)
            .field("block_size", &self.inner.block_size)
            .field("block_count", &self.inner.block_count)
            .finish_non_exhaustive()
    }
}
