//! Block transport seam
//!
//! The cache never touches a device directly. It hands [`IoRequest`]s to a
//! [`BlockTransport`], which performs them at some point and calls each
//! request's completion exactly once, on whatever thread it likes
//! (including the submitting thread). Two transports are provided on top
//! of a synchronous [`BlockDevice`]:
//!
//! - [`InlineTransport`]: performs every request before `submit` returns
//! - [`ThreadedTransport`]: a worker pool fed through a channel

use crate::buffer::Buffer;
use blockcache_common::{BlockNumber, Result};
use crossbeam_channel::{Receiver, Sender};
use parking_lot::{Condvar, Mutex};
use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, info, trace, warn};

/// Synchronous block device
///
/// Block `n` lives at byte offset `n * buf.len()`; the cache always passes
/// buffers of exactly one block.
pub trait BlockDevice: Send + Sync {
    /// Device size in bytes
    fn device_size(&self) -> u64;

    /// Fill `buf` from block `block`
    fn read_block(&self, block: BlockNumber, buf: &mut [u8]) -> io::Result<()>;

    /// Store `buf` at block `block`
    fn write_block(&self, block: BlockNumber, buf: &[u8]) -> io::Result<()>;

    /// Persist everything written so far
    fn flush(&self) -> io::Result<()> {
        Ok(())
    }
}

impl<D: BlockDevice + ?Sized> BlockDevice for Arc<D> {
    fn device_size(&self) -> u64 {
        (**self).device_size()
    }

    fn read_block(&self, block: BlockNumber, buf: &mut [u8]) -> io::Result<()> {
        (**self).read_block(block, buf)
    }

    fn write_block(&self, block: BlockNumber, buf: &[u8]) -> io::Result<()> {
        (**self).write_block(block, buf)
    }

    fn flush(&self) -> io::Result<()> {
        (**self).flush()
    }
}

/// Direction of one device operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoDirection {
    Read,
    Write,
}

/// Completion callback of one request
pub type IoCompletion = Box<dyn FnOnce(io::Result<()>) + Send>;

/// One block-sized device operation on a cached buffer's memory
pub struct IoRequest {
    direction: IoDirection,
    buffer: Arc<Buffer>,
    completion: IoCompletion,
}

impl IoRequest {
    pub(crate) fn new(direction: IoDirection, buffer: Arc<Buffer>, completion: IoCompletion) -> Self {
        Self {
            direction,
            buffer,
            completion,
        }
    }

    /// Read or write
    #[must_use]
    pub const fn direction(&self) -> IoDirection {
        self.direction
    }

    /// Target block
    #[must_use]
    pub fn block(&self) -> BlockNumber {
        self.buffer.block()
    }

    /// Bytes moved by this request
    #[must_use]
    pub fn len(&self) -> usize {
        self.buffer.data().len()
    }

    /// Whether the request moves no bytes
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run `f` over the buffer memory; the source of a write
    pub fn with_data<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        f(&self.buffer.data())
    }

    /// Run `f` over the buffer memory mutably; the target of a read
    pub fn with_data_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        f(&mut self.buffer.data_mut())
    }

    /// Perform the request against `device` and complete it
    pub fn perform<D: BlockDevice + ?Sized>(self, device: &D) {
        let block = self.block();
        let result = match self.direction {
            IoDirection::Read => self.with_data_mut(|data| device.read_block(block, data)),
            IoDirection::Write => self.with_data(|data| device.write_block(block, data)),
        };
        if let Err(e) = &result {
            warn!(block, direction = ?self.direction, "device I/O failed: {e}");
        }
        self.complete(result);
    }

    /// Report the outcome to the cache
    pub fn complete(self, result: io::Result<()>) {
        (self.completion)(result);
    }
}

impl std::fmt::Debug for IoRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoRequest")
            .field("direction", &self.direction)
            .field("block", &self.block())
            .finish_non_exhaustive()
    }
}

/// Asynchronous, completion-driven access to a block device
pub trait BlockTransport: Send + Sync {
    /// Device size in bytes
    fn device_size(&self) -> u64;

    /// Queue one request
    fn submit(&self, request: IoRequest);

    /// Queue several requests at once
    fn submit_batch(&self, requests: Vec<IoRequest>) {
        for request in requests {
            self.submit(request);
        }
    }

    /// Barrier: persist everything completed so far
    fn flush(&self) -> io::Result<()>;
}

/// Transport that performs each request synchronously inside `submit`
pub struct InlineTransport<D> {
    device: D,
}

impl<D: BlockDevice> InlineTransport<D> {
    /// Wrap a device
    pub const fn new(device: D) -> Self {
        Self { device }
    }

    /// The wrapped device
    pub const fn device(&self) -> &D {
        &self.device
    }
}

impl<D: BlockDevice> BlockTransport for InlineTransport<D> {
    fn device_size(&self) -> u64 {
        self.device.device_size()
    }

    fn submit(&self, request: IoRequest) {
        request.perform(&self.device);
    }

    fn flush(&self) -> io::Result<()> {
        self.device.flush()
    }
}

/// Requests submitted but not yet completed
struct InFlight {
    count: Mutex<usize>,
    drained: Condvar,
}

impl InFlight {
    fn add(&self, n: usize) {
        *self.count.lock() += n;
    }

    fn done(&self) {
        let mut count = self.count.lock();
        *count -= 1;
        if *count == 0 {
            self.drained.notify_all();
        }
    }

    fn wait_drained(&self) {
        let mut count = self.count.lock();
        while *count > 0 {
            self.drained.wait(&mut count);
        }
    }
}

/// Transport backed by a pool of worker threads
///
/// `flush` waits for every queued request to complete before flushing the
/// device. Dropping the transport drains the queue and joins the workers.
pub struct ThreadedTransport<D: BlockDevice + 'static> {
    device: Arc<D>,
    sender: Option<Sender<IoRequest>>,
    workers: Vec<JoinHandle<()>>,
    in_flight: Arc<InFlight>,
}

impl<D: BlockDevice + 'static> ThreadedTransport<D> {
    /// Start `workers` threads (at least one) over `device`
    pub fn new(device: D, workers: usize) -> Result<Self> {
        let device = Arc::new(device);
        let (sender, receiver) = crossbeam_channel::unbounded::<IoRequest>();
        let in_flight = Arc::new(InFlight {
            count: Mutex::new(0),
            drained: Condvar::new(),
        });

        let workers = (0..workers.max(1))
            .map(|n| {
                let device = Arc::clone(&device);
                let receiver: Receiver<IoRequest> = receiver.clone();
                let in_flight = Arc::clone(&in_flight);
                thread::Builder::new()
                    .name(format!("blockcache-io-{n}"))
                    .spawn(move || {
                        for request in &receiver {
                            trace!(block = request.block(), direction = ?request.direction(), "performing request");
                            request.perform(&*device);
                            in_flight.done();
                        }
                    })
            })
            .collect::<io::Result<Vec<_>>>()?;

        info!(workers = workers.len(), "threaded transport started");
        Ok(Self {
            device,
            sender: Some(sender),
            workers,
            in_flight,
        })
    }

    /// The wrapped device
    pub fn device(&self) -> &D {
        &self.device
    }
}

impl<D: BlockDevice + 'static> BlockTransport for ThreadedTransport<D> {
    fn device_size(&self) -> u64 {
        self.device.device_size()
    }

    fn submit(&self, request: IoRequest) {
        self.in_flight.add(1);
        let Some(sender) = &self.sender else {
            self.in_flight.done();
            request.complete(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "transport is shut down",
            )));
            return;
        };
        if let Err(send_error) = sender.send(request) {
            self.in_flight.done();
            send_error.into_inner().complete(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "I/O workers are gone",
            )));
        }
    }

    fn submit_batch(&self, requests: Vec<IoRequest>) {
        debug!(count = requests.len(), "submitting request batch");
        for request in requests {
            self.submit(request);
        }
    }

    fn flush(&self) -> io::Result<()> {
        self.in_flight.wait_drained();
        self.device.flush()
    }
}

impl<D: BlockDevice + 'static> Drop for ThreadedTransport<D> {
    fn drop(&mut self) {
        self.sender.take();
        // The last client reference can die inside a completion running on
        // one of our own workers.
        let current = thread::current().id();
        for worker in self.workers.drain(..) {
            if worker.thread().id() != current {
                let _ = worker.join();
            }
        }
        debug!("threaded transport stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::BufferAllocator;
    use crate::device::MemoryDevice;
    use blockcache_common::BufferId;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn buffer(allocator: &BufferAllocator, block: BlockNumber, byte: u8) -> Arc<Buffer> {
        let memory = allocator.allocate(512, None).unwrap();
        let buffer = Arc::new(Buffer::new(BufferId::new(block + 1), block, memory, 0));
        buffer.data_mut().fill(byte);
        buffer
    }

    fn counting(
        direction: IoDirection,
        buffer: Arc<Buffer>,
        ok: &Arc<AtomicUsize>,
        failed: &Arc<AtomicUsize>,
    ) -> IoRequest {
        let (ok, failed) = (Arc::clone(ok), Arc::clone(failed));
        IoRequest::new(
            direction,
            buffer,
            Box::new(move |result| {
                if result.is_ok() {
                    ok.fetch_add(1, Ordering::SeqCst);
                } else {
                    failed.fetch_add(1, Ordering::SeqCst);
                }
            }),
        )
    }

    #[test]
    fn test_inline_transport_round_trip() {
        let allocator = BufferAllocator::default();
        let transport = InlineTransport::new(MemoryDevice::new(8 * 512));
        let (ok, failed) = (Arc::default(), Arc::default());

        let source = buffer(&allocator, 3, 0x33);
        let request = counting(IoDirection::Write, source, &ok, &failed);
        assert_eq!(request.block(), 3);
        assert_eq!(request.len(), 512);
        transport.submit(request);
        assert_eq!(transport.device().contents(3 * 512, 512), vec![0x33; 512]);

        let target = buffer(&allocator, 3, 0);
        transport.submit(counting(IoDirection::Read, Arc::clone(&target), &ok, &failed));
        assert_eq!(&*target.data(), &[0x33; 512][..]);
        assert_eq!(ok.load(Ordering::SeqCst), 2);
        assert_eq!(failed.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_failed_request_completes_with_error() {
        let allocator = BufferAllocator::default();
        let transport = InlineTransport::new(MemoryDevice::new(8 * 512));
        transport.device().fail_reads(1, io::ErrorKind::Other);
        let (ok, failed) = (Arc::default(), Arc::default());

        transport.submit(counting(IoDirection::Read, buffer(&allocator, 1, 0), &ok, &failed));
        // Past the end of the device.
        transport.submit(counting(IoDirection::Write, buffer(&allocator, 8, 0), &ok, &failed));
        assert_eq!(ok.load(Ordering::SeqCst), 0);
        assert_eq!(failed.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_threaded_transport_flush_drains() {
        let allocator = BufferAllocator::default();
        let device = Arc::new(MemoryDevice::new(64 * 512));
        let transport = ThreadedTransport::new(Arc::clone(&device), 4).unwrap();
        let (ok, failed) = (Arc::default(), Arc::default());

        let requests = (0..64)
            .map(|block| counting(IoDirection::Write, buffer(&allocator, block, block as u8), &ok, &failed))
            .collect();
        transport.submit_batch(requests);
        transport.flush().unwrap();

        assert_eq!(ok.load(Ordering::SeqCst), 64);
        assert_eq!(device.flush_count(), 1);
        for block in 0..64usize {
            assert_eq!(device.contents(block * 512, 1), vec![block as u8]);
        }
    }

    #[test]
    fn test_threaded_transport_drop_completes_queue() {
        let allocator = BufferAllocator::default();
        let device = Arc::new(MemoryDevice::new(16 * 512));
        let (ok, failed) = (Arc::default(), Arc::default());
        {
            let transport = ThreadedTransport::new(Arc::clone(&device), 0).unwrap();
            for block in 0..16 {
                transport.submit(counting(IoDirection::Write, buffer(&allocator, block, 1), &ok, &failed));
            }
        }
        assert_eq!(ok.load(Ordering::SeqCst), 16);
        assert_eq!(device.write_count(), 16);
    }
}
