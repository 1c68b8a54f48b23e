//! Test transport that parks requests until told to complete them

use crate::device::MemoryDevice;
use crate::transport::{BlockDevice, BlockTransport, IoRequest};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

pub(crate) struct ParkedTransport {
    device: Arc<MemoryDevice>,
    parked: Mutex<VecDeque<IoRequest>>,
    auto: AtomicBool,
}

impl ParkedTransport {
    pub fn new(device: Arc<MemoryDevice>) -> Self {
        Self {
            device,
            parked: Mutex::new(VecDeque::new()),
            auto: AtomicBool::new(false),
        }
    }

    /// Perform later submissions inline instead of parking them
    pub fn set_auto(&self, auto: bool) {
        self.auto.store(auto, Ordering::SeqCst);
    }

    pub fn parked_len(&self) -> usize {
        self.parked.lock().len()
    }

    /// Perform the oldest parked request against the device
    pub fn complete_next(&self) -> bool {
        let Some(request) = self.parked.lock().pop_front() else {
            return false;
        };
        request.perform(&*self.device);
        true
    }

    pub fn complete_all(&self) -> usize {
        let mut completed = 0;
        while self.complete_next() {
            completed += 1;
        }
        completed
    }
}

impl BlockTransport for ParkedTransport {
    fn device_size(&self) -> u64 {
        self.device.device_size()
    }

    fn submit(&self, request: IoRequest) {
        if self.auto.load(Ordering::SeqCst) {
            request.perform(&*self.device);
        } else {
            self.parked.lock().push_back(request);
        }
    }

    fn flush(&self) -> io::Result<()> {
        self.complete_all();
        self.device.flush()
    }
}
