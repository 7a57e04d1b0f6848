use alloc::{collections::VecDeque, vec::Vec};
use nfd_hw::{BufAddr, BufferPool};
use spin::Mutex;

/// A buffer pool that also remembers which buffers came back.
pub struct SimBufferPool {
    free: Mutex<VecDeque<BufAddr>>,
    returned: Mutex<Vec<BufAddr>>,
}

impl SimBufferPool {
    /// A pool holding buffers `first..first + count`.
    pub fn new(first: BufAddr, count: u32) -> SimBufferPool {
        SimBufferPool {
            free: Mutex::new((first..first + count).collect()),
            returned: Mutex::new(Vec::new()),
        }
    }

    pub fn available(&self) -> usize {
        self.free.lock().len()
    }

    /// Buffers handed back through [`BufferPool::free`], oldest first.
    pub fn returned(&self) -> Vec<BufAddr> {
        self.returned.lock().clone()
    }
}

impl BufferPool for SimBufferPool {
    fn alloc(&self) -> Option<BufAddr> {
        self.free.lock().pop_front()
    }

    fn free(&self, buf: BufAddr) {
        self.returned.lock().push(buf);
        self.free.lock().push_back(buf);
    }
}
