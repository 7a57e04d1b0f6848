use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, Ordering};
use queue_bitmask::MAX_QUEUES;

/// Free-list buffers per queue that packets may still be offered for.
///
/// cache_desc grants credits as free-list fetches complete. Whoever offers
/// packets to PCI.OUT takes one credit per packet first, which keeps a
/// queue's staged packets within the host buffers the NIC knows about.
#[derive(Debug)]
pub struct CreditTable {
    credits: Vec<AtomicU32>,
}

impl Default for CreditTable {
    fn default() -> Self {
        CreditTable::new()
    }
}

impl CreditTable {
    pub fn new() -> CreditTable {
        CreditTable { credits: (0..MAX_QUEUES).map(|_| AtomicU32::new(0)).collect() }
    }

    pub fn get(&self, natq: u8) -> u32 {
        self.credits[natq as usize].load(Ordering::Acquire)
    }

    /// Takes `count` credits of `natq`, or none if fewer are left.
    pub fn try_take(&self, natq: u8, count: u32) -> bool {
        self.credits[natq as usize]
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| c.checked_sub(count))
            .is_ok()
    }

    pub(crate) fn add(&self, natq: u8, count: u32) {
        self.credits[natq as usize].fetch_add(count, Ordering::AcqRel);
    }

    pub(crate) fn zero(&self, natq: u8) {
        self.credits[natq as usize].store(0, Ordering::Release);
    }
}
