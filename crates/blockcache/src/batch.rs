//! Write request batching
//!
//! Writes issued by one operation are collected here and handed to the
//! transport together. The batch lock protects only the pending list;
//! submission always happens after it is released, since transports may
//! complete requests inline.

use crate::transport::{BlockTransport, IoRequest};
use parking_lot::Mutex;
use std::mem;
use tracing::trace;

pub(crate) struct WriteBatch {
    pending: Mutex<Vec<IoRequest>>,
    capacity: usize,
}

impl WriteBatch {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            pending: Mutex::new(Vec::with_capacity(capacity)),
            capacity,
        }
    }

    /// Queue a request, submitting the batch once it is full
    pub fn push(&self, request: IoRequest, transport: &dyn BlockTransport) {
        let full = {
            let mut pending = self.pending.lock();
            pending.push(request);
            (pending.len() >= self.capacity)
                .then(|| mem::replace(&mut *pending, Vec::with_capacity(self.capacity)))
        };
        if let Some(requests) = full {
            trace!(count = requests.len(), "write batch full");
            transport.submit_batch(requests);
        }
    }

    /// Submit whatever is pending
    pub fn submit(&self, transport: &dyn BlockTransport) {
        let requests = mem::take(&mut *self.pending.lock());
        if !requests.is_empty() {
            transport.submit_batch(requests);
        }
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::BufferAllocator;
    use crate::buffer::Buffer;
    use crate::transport::IoDirection;
    use blockcache_common::BufferId;
    use std::io;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingTransport {
        batches: Mutex<Vec<usize>>,
        completed: Arc<AtomicUsize>,
    }

    impl BlockTransport for CountingTransport {
        fn device_size(&self) -> u64 {
            1 << 20
        }

        fn submit(&self, request: IoRequest) {
            request.complete(Ok(()));
        }

        fn submit_batch(&self, requests: Vec<IoRequest>) {
            self.batches.lock().push(requests.len());
            for request in requests {
                self.submit(request);
            }
        }

        fn flush(&self) -> io::Result<()> {
            Ok(())
        }
    }

    fn request(allocator: &BufferAllocator, block: u64, completed: &Arc<AtomicUsize>) -> IoRequest {
        let memory = allocator.allocate(512, None).unwrap();
        let buffer = Arc::new(Buffer::new(BufferId::new(block + 1), block, memory, 0));
        let completed = Arc::clone(completed);
        IoRequest::new(
            IoDirection::Write,
            buffer,
            Box::new(move |result| {
                assert!(result.is_ok());
                completed.fetch_add(1, Ordering::SeqCst);
            }),
        )
    }

    #[test]
    fn test_batch_submits_when_full() {
        let allocator = BufferAllocator::default();
        let transport = CountingTransport::default();
        let batch = WriteBatch::new(3);

        for block in 0..7 {
            batch.push(request(&allocator, block, &transport.completed), &transport);
        }
        assert_eq!(*transport.batches.lock(), vec![3, 3]);
        assert_eq!(batch.len(), 1);

        batch.submit(&transport);
        assert_eq!(*transport.batches.lock(), vec![3, 3, 1]);
        assert_eq!(transport.completed.load(Ordering::SeqCst), 7);
        assert_eq!(batch.len(), 0);
    }

    #[test]
    fn test_empty_submit_is_noop() {
        let transport = CountingTransport::default();
        let batch = WriteBatch::new(4);
        batch.submit(&transport);
        assert!(transport.batches.lock().is_empty());
    }
}
