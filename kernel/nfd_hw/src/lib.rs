//! The hardware blocks the data plane is layered on, as traits.
//!
//! The pipelines never touch hardware directly. They enqueue DMAs through a
//! [`DmaEngine`], observe DMA completions through [`CompletionEvents`], move
//! queue pointers through a [`QueueController`], read and write on-chip
//! memories through [`Memory`], take and return packet buffers through a
//! [`BufferPool`], hand packets to downstream processing through a
//! [`WorkQueue`], and check [`ResetState`] before issuing new work.
//!
//! The [`desc`] module holds the bit-exact layouts of the descriptors the
//! host reads and writes.

#![no_std]

extern crate alloc;
extern crate bit_field;
extern crate nfd_sync;

pub mod desc;
mod dma;
mod mem;
mod qc;

pub use dma::*;
pub use mem::*;
pub use qc::*;

use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, Ordering};
use nfd_sync::Signal;

/// The hardware blocks one pipeline is wired to.
#[derive(Clone)]
pub struct Hw {
    pub dma: Arc<dyn DmaEngine>,
    pub events: Arc<dyn CompletionEvents>,
    pub qc: Arc<dyn QueueController>,
    /// On-chip memory holding descriptor storage, caches and buffers.
    pub local: Arc<dyn Memory>,
    pub pool: Arc<dyn BufferPool>,
    pub wq: Arc<dyn WorkQueue>,
    pub reset: Arc<dyn ResetState>,
}

/// A handle to an on-chip packet buffer.
///
/// Buffers are 2 KiB aligned, so the handle is the buffer address shifted
/// right by [`BUF_SHIFT`].
pub type BufAddr = u32;

pub const BUF_SHIFT: u32 = 11;

/// Returns the on-chip address of the start of a packet buffer.
pub const fn buf_cpp_addr(buf: BufAddr) -> u64 {
    (buf as u64) << BUF_SHIFT
}

/// A pool of on-chip packet buffers.
pub trait BufferPool: Send + Sync {
    /// Takes a free buffer, if one is available.
    fn alloc(&self) -> Option<BufAddr>;

    /// Returns a buffer to the pool.
    fn free(&self, buf: BufAddr);
}

/// A hardware work queue feeding downstream packet processing.
pub trait WorkQueue: Send + Sync {
    /// Adds `msg` to work queue `wq` and raises `done` once it is enqueued.
    ///
    /// Messages added to the same work queue are delivered in the order
    /// their adds were issued.
    fn add_work(&self, wq: u8, msg: &desc::PktDesc, done: &Signal);
}

/// The link-level reset state of the PCIe island.
pub trait ResetState: Send + Sync {
    /// Returns `true` while the link is in reset.
    fn in_reset(&self) -> bool;
}

/// A [`ResetState`] driven by whoever watches the link.
#[derive(Debug, Default)]
pub struct PcieReset(AtomicBool);

impl PcieReset {
    pub const fn new() -> PcieReset {
        PcieReset(AtomicBool::new(false))
    }

    pub fn enter(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn clear(&self) {
        self.0.store(false, Ordering::Release);
    }
}

impl ResetState for PcieReset {
    fn in_reset(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}
