use alloc::vec::Vec;
use nfd_hw::{desc::PktDesc, WorkQueue};
use nfd_sync::Signal;
use spin::Mutex;

/// Work queues that record every message added to them.
pub struct SimWorkQueues {
    queues: Mutex<Vec<Vec<PktDesc>>>,
}

impl SimWorkQueues {
    pub fn new(count: usize) -> SimWorkQueues {
        SimWorkQueues {
            queues: Mutex::new((0..count).map(|_| Vec::new()).collect()),
        }
    }

    /// Messages added to `wq`, oldest first.
    pub fn messages(&self, wq: u8) -> Vec<PktDesc> {
        self.queues.lock().get(wq as usize).cloned().unwrap_or_default()
    }

    /// Removes and returns the messages added to `wq`.
    pub fn drain(&self, wq: u8) -> Vec<PktDesc> {
        self.queues
            .lock()
            .get_mut(wq as usize)
            .map(core::mem::take)
            .unwrap_or_default()
    }
}

impl WorkQueue for SimWorkQueues {
    fn add_work(&self, wq: u8, msg: &PktDesc, done: &Signal) {
        match self.queues.lock().get_mut(wq as usize) {
            Some(queue) => queue.push(*msg),
            None => warn!("add_work to missing work queue {}", wq),
        }
        done.raise();
    }
}
