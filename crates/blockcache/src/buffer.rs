//! Cached buffers and the handles callers hold on them
//!
//! A [`Buffer`] is the in-memory copy of one device block: its data region,
//! the caller's auxiliary record and its current block number. Everything
//! else about it (state, hold count, list position, sticky errors) lives in
//! the client's index under the client lock.

use crate::allocator::BlockMemory;
use crate::client::{Client, ClientInner};
use blockcache_common::{BlockNumber, BufferId};
use parking_lot::{
    MappedMutexGuard, MappedRwLockReadGuard, MappedRwLockWriteGuard, Mutex, MutexGuard, RwLock,
    RwLockReadGuard, RwLockWriteGuard,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

pub(crate) struct Buffer {
    id: BufferId,
    block: AtomicU64,
    memory: RwLock<Option<BlockMemory>>,
    aux: Mutex<Box<[u8]>>,
}

impl Buffer {
    pub(crate) fn new(id: BufferId, block: BlockNumber, memory: BlockMemory, aux_size: usize) -> Self {
        Self {
            id,
            block: AtomicU64::new(block),
            memory: RwLock::new(Some(memory)),
            aux: Mutex::new(vec![0u8; aux_size].into_boxed_slice()),
        }
    }

    pub(crate) const fn id(&self) -> BufferId {
        self.id
    }

    pub(crate) fn block(&self) -> BlockNumber {
        self.block.load(Ordering::Acquire)
    }

    /// Only called under the client lock while no I/O is pending.
    pub(crate) fn set_block(&self, block: BlockNumber) {
        self.block.store(block, Ordering::Release);
    }

    pub(crate) fn data(&self) -> MappedRwLockReadGuard<'_, [u8]> {
        RwLockReadGuard::map(self.memory.read(), |memory| {
            memory.as_ref().map_or(&[][..], BlockMemory::as_slice)
        })
    }

    pub(crate) fn data_mut(&self) -> MappedRwLockWriteGuard<'_, [u8]> {
        RwLockWriteGuard::map(self.memory.write(), |memory| {
            memory
                .as_mut()
                .map_or_else(<&mut [u8]>::default, BlockMemory::as_mut_slice)
        })
    }

    pub(crate) fn aux(&self) -> MappedMutexGuard<'_, [u8]> {
        MutexGuard::map(self.aux.lock(), |aux| &mut **aux)
    }

    pub(crate) fn zero_data(&self) {
        self.data_mut().fill(0);
    }

    /// Detach the data region for release or reuse.
    pub(crate) fn take_memory(&self) -> Option<BlockMemory> {
        self.memory.write().take()
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("id", &self.id)
            .field("block", &self.block())
            .finish_non_exhaustive()
    }
}

/// A hold on one cached buffer
///
/// While a handle exists its buffer is never evicted, relocated or freed.
/// Dropping the handle releases the hold; [`Client::release`] does the same
/// explicitly.
///
/// Data guards must not be held across an explicit write-back of the
/// client (`write_dirty_buffers`, `write_dirty_buffers_async`,
/// `release_move`): the transport reads the data, and a `before_write`
/// hook takes the write lock. Write-back started by lookups past the dirty
/// threshold skips held buffers.
pub struct BufferHandle {
    buffer: Arc<Buffer>,
    client: Arc<ClientInner>,
}

impl BufferHandle {
    pub(crate) const fn new(buffer: Arc<Buffer>, client: Arc<ClientInner>) -> Self {
        Self { buffer, client }
    }

    pub(crate) fn client_inner(&self) -> &Arc<ClientInner> {
        &self.client
    }

    /// Identifier of the held buffer
    #[must_use]
    pub fn id(&self) -> BufferId {
        self.buffer.id()
    }

    /// Block the buffer currently caches
    #[must_use]
    pub fn block_number(&self) -> BlockNumber {
        self.buffer.block()
    }

    /// Read access to the block data
    #[must_use]
    pub fn data(&self) -> MappedRwLockReadGuard<'_, [u8]> {
        self.buffer.data()
    }

    /// Write access to the block data; follow with [`Client::mark_dirty`]
    #[must_use]
    pub fn data_mut(&self) -> MappedRwLockWriteGuard<'_, [u8]> {
        self.buffer.data_mut()
    }

    /// The caller-owned auxiliary record
    #[must_use]
    pub fn aux(&self) -> MappedMutexGuard<'_, [u8]> {
        self.buffer.aux()
    }

    /// The client the buffer belongs to
    #[must_use]
    pub fn client(&self) -> Client {
        Client::from_inner(Arc::clone(&self.client))
    }
}

impl Drop for BufferHandle {
    fn drop(&mut self) {
        self.client.release_hold(self.buffer.id());
    }
}

impl std::fmt::Debug for BufferHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferHandle")
            .field("id", &self.buffer.id())
            .field("block", &self.buffer.block())
            .field("client", &self.client.id())
            .finish()
    }
}
