//! Per-queue state of the PCI.OUT stages.

use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use nfd_cfg::{PciOutConfig, QueueCfg};
use nfd_hw::desc::FlDesc;
use queue_bitmask::MAX_QUEUES;

/// One free-list/RX ring as the PCI.OUT stages see it.
///
/// The host posts free-list descriptors to the ring and the NIC overwrites
/// each of them, in order, with the RX descriptor of the packet written into
/// its buffer. Each field has one writer: cache_desc owns the fetch side
/// (`fl_w`, `fl_s`, `fl_a`) and the geometry, stage_batch owns `fl_u`, and
/// send_desc owns `rx_w`.
#[derive(Debug, Default)]
pub struct RxQueueInfo {
    /// Free-list descriptors the host has posted, as far as cache_desc knows.
    pub fl_w: AtomicU32,
    /// Free-list descriptors fetched or being fetched.
    pub fl_s: AtomicU32,
    /// Free-list descriptors whose fetch completed.
    pub fl_a: AtomicU32,
    /// Free-list descriptors handed to staged packets.
    pub fl_u: AtomicU32,
    /// RX descriptors written back.
    pub rx_w: AtomicU32,
    pub ring_sz_msk: AtomicU32,
    pub ring_base: AtomicU64,
    pub rid: AtomicU8,
    pub up: AtomicBool,
}

impl RxQueueInfo {
    pub fn is_up(&self) -> bool {
        self.up.load(Ordering::Acquire)
    }

    pub fn rid(&self) -> u8 {
        self.rid.load(Ordering::Relaxed)
    }

    /// Cached free-list descriptors not yet handed to a packet.
    pub fn fl_avail(&self) -> u32 {
        self.fl_a.load(Ordering::Acquire).wrapping_sub(self.fl_u.load(Ordering::Acquire))
    }

    /// Host address of ring entry `index`.
    pub fn ring_addr(&self, index: u32) -> u64 {
        let msk = self.ring_sz_msk.load(Ordering::Relaxed);
        self.ring_base.load(Ordering::Relaxed) + u64::from(index & msk) * FlDesc::SIZE as u64
    }

    pub(crate) fn bring_up(&self, cfg: &QueueCfg) {
        self.zero_pointers();
        self.ring_sz_msk.store(cfg.ring_sz_msk(), Ordering::Relaxed);
        self.ring_base.store(cfg.ring_base, Ordering::Relaxed);
        self.rid.store(cfg.rid, Ordering::Relaxed);
        self.up.store(true, Ordering::Release);
    }

    pub(crate) fn bring_down(&self) {
        self.up.store(false, Ordering::Release);
        self.zero_pointers();
        self.ring_sz_msk.store(0, Ordering::Relaxed);
        self.ring_base.store(0, Ordering::Relaxed);
        self.rid.store(0, Ordering::Relaxed);
    }

    fn zero_pointers(&self) {
        for counter in [&self.fl_w, &self.fl_s, &self.fl_a, &self.fl_u, &self.rx_w] {
            counter.store(0, Ordering::Release);
        }
    }

    pub fn is_idle(&self) -> bool {
        !self.is_up()
            && [&self.fl_w, &self.fl_s, &self.fl_a, &self.fl_u, &self.rx_w, &self.ring_sz_msk]
                .iter()
                .all(|c| c.load(Ordering::Acquire) == 0)
            && self.ring_base.load(Ordering::Acquire) == 0
    }
}

/// The on-chip cache of free-list descriptors: one ring of
/// `bufs_per_queue` entries per queue, indexed by the free-list counters.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FlCache {
    pub base: u64,
    pub bufs_per_queue: u32,
}

impl FlCache {
    pub fn new(cfg: &PciOutConfig, base: u64) -> FlCache {
        FlCache { base, bufs_per_queue: cfg.fl_bufs_per_queue }
    }

    /// Bytes the cache takes for every possible queue.
    pub fn bytes(cfg: &PciOutConfig) -> u64 {
        u64::from(MAX_QUEUES) * cfg.fl_cache_bytes_per_queue()
    }

    /// On-chip address of the cached descriptor for free-list entry `index`
    /// of `natq`.
    pub fn addr(&self, natq: u8, index: u32) -> u64 {
        let entry = u64::from(natq) * u64::from(self.bufs_per_queue)
            + u64::from(index & (self.bufs_per_queue - 1));
        self.base + entry * FlDesc::SIZE as u64
    }
}
