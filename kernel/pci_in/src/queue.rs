//! Per-queue state of the PCI.IN stages.

use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use nfd_cfg::QueueCfg;

/// Gather's view of one host TX ring. Owned by the gather context.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct TxQueueInfo {
    /// Descriptors the host has posted, as far as gather knows.
    pub tx_w: u32,
    /// Descriptors gather has fetched.
    pub tx_s: u32,
    pub ring_sz_msk: u32,
    pub ring_base: u64,
    pub rid: u8,
    pub up: bool,
}

impl TxQueueInfo {
    pub fn up(cfg: &QueueCfg) -> TxQueueInfo {
        TxQueueInfo {
            tx_w: 0,
            tx_s: 0,
            ring_sz_msk: cfg.ring_sz_msk(),
            ring_base: cfg.ring_base,
            rid: cfg.rid,
            up: true,
        }
    }

    /// Known descriptors not yet fetched.
    pub fn backlog(&self) -> u32 {
        self.tx_w.wrapping_sub(self.tx_s)
    }

    /// Host address of the descriptor at `index`.
    pub fn desc_addr(&self, index: u32) -> u64 {
        self.ring_base + u64::from(index & self.ring_sz_msk) * nfd_hw::desc::TxDesc::SIZE as u64
    }

    pub fn is_idle(&self) -> bool {
        *self == TxQueueInfo::default()
    }
}

/// issue_dma's view of one queue: its up state and the packet being
/// assembled across several descriptors.
///
/// The continuation fields are only written by the context holding the
/// DMA-order token, or by teardown once no batch can still touch the queue.
#[derive(Debug, Default)]
pub struct IssueQueueInfo {
    pub rid: AtomicU8,
    pub up: AtomicBool,
    /// A packet is part way through its descriptors.
    pub cont: AtomicBool,
    /// Buffer the continued packet is written into.
    pub curr_buf: AtomicU32,
    /// Write offset within `curr_buf`.
    pub offset: AtomicU32,
    /// Metadata offset of the continued packet's first descriptor.
    pub pkt_offset: AtomicU8,
    /// Batches that must be processed before a downed queue's buffer can be
    /// released.
    pub drain_seq: AtomicU32,
}

impl IssueQueueInfo {
    pub fn is_up(&self) -> bool {
        self.up.load(Ordering::Acquire)
    }

    pub fn in_continuation(&self) -> bool {
        self.cont.load(Ordering::Acquire)
    }

    /// Forgets any continuation and returns the buffer it held.
    pub(crate) fn take_continuation(&self) -> Option<u32> {
        self.cont.store(false, Ordering::Release);
        self.offset.store(0, Ordering::Relaxed);
        self.pkt_offset.store(0, Ordering::Relaxed);
        match self.curr_buf.swap(0, Ordering::AcqRel) {
            0 => None,
            buf => Some(buf),
        }
    }

    pub fn is_idle(&self) -> bool {
        !self.is_up()
            && !self.in_continuation()
            && self.curr_buf.load(Ordering::Acquire) == 0
            && self.offset.load(Ordering::Acquire) == 0
    }
}
