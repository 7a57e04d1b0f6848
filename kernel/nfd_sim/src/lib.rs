//! Software stand-ins for the hardware blocks in [`nfd_hw`].
//!
//! They behave like the real blocks as far as the data plane can observe:
//! DMAs complete in order per queue and only when told to (or at once, in
//! auto-complete mode), completion events coalesce per stream, queue events
//! fire once per arming, and work queues keep per-queue order.

#![no_std]

extern crate alloc;
#[macro_use] extern crate log;
extern crate spin;
extern crate nfd_hw;
extern crate nfd_sync;
extern crate dma_seqn;

mod dma;
mod memory;
mod pool;
mod qc;
mod workq;

pub use dma::SimDma;
pub use memory::SparseMemory;
pub use pool::SimBufferPool;
pub use qc::SimQueueController;
pub use workq::SimWorkQueues;
