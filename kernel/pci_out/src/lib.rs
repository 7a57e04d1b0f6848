//! The NIC-to-host (PCI.OUT) data path.
//!
//! Four stages move a received packet from an on-chip buffer into a host
//! free-list buffer and report it with an RX descriptor:
//!
//! 1. [`CacheDesc`] watches the host free-list rings and fetches their
//!    descriptors into an on-chip cache, granting one credit per buffer.
//! 2. [`StageBatch`] takes offered packets in batches of up to four,
//!    assigns each a cached free-list buffer, stages its RX descriptor and
//!    records which descriptors the batch will send.
//! 3. [`RxIssueDma`] DMAs every packet's payload into its host buffer and
//!    releases the NIC buffers once the payload is out.
//! 4. [`SendDesc`] waits until a batch's payload has landed, then writes its
//!    RX descriptors to the host ring.
//!
//! Whoever offers packets takes a credit for the packet's queue from the
//! [`CreditTable`] first and then [`submit`](PciOut::submit)s it.
//!
//! The stages share an [`RxPath`]. A stage only reads a cache entry, a
//! staging slot or a batch message once the sequence counters say the
//! writer is done with it.

#![no_std]

extern crate alloc;
#[macro_use] extern crate log;
extern crate bit_field;
extern crate queue_bitmask;
extern crate dma_seqn;
extern crate hw_ring;
extern crate nfd_sync;
extern crate nfd_hw;
extern crate nfd_cfg;

mod cache_desc;
mod credits;
pub mod desc;
mod distr;
mod issue_dma;
pub mod queue;
mod send_desc;
mod stage_batch;
#[cfg(test)]
mod test_rig;

pub use cache_desc::CacheDesc;
pub use credits::CreditTable;
pub use issue_dma::{RxIssueDma, RxIssueDmaCtx};
pub use send_desc::{SendDesc, SendDescCtx};
pub use stage_batch::{StageBatch, StageBatchCtx};

use alloc::{sync::Arc, vec::Vec};
use core::sync::atomic::AtomicU64;
use desc::{RxDataBatch, RxPkt};
use dma_seqn::SeqCounter;
use hw_ring::HwRing;
use nfd_cfg::{config::MAX_BATCH_SZ, PciOutConfig, QueueCfg};
use nfd_hw::{desc::RxDesc, Hw, Memory};
use queue::{FlCache, RxQueueInfo};
use queue_bitmask::{QueueBitmask, MAX_QUEUES};

/// The state the PCI.OUT stages share.
pub struct RxPath {
    pub queues: Vec<RxQueueInfo>,
    pub fl_cache: FlCache,
    pub credits: CreditTable,
    /// Queues stage_batch found short of cached free-list entries.
    pub urgent: QueueBitmask,
    /// Packets offered to the pipeline.
    pub input: HwRing<RxPkt>,
    /// Staged batches, for the payload DMA stage.
    pub data_ring: HwRing<RxDataBatch>,
    /// Descriptor-batch messages as [`desc::DescBatchMsg`] words, indexed by
    /// batch number.
    pub desc_msgs: Vec<AtomicU64>,
    /// On-chip ring of staged RX descriptors, indexed by packet number.
    pub staging_base: u64,
    pub staging_slots: u32,
    /// Batches send_desc took.
    pub desc_batch_served: SeqCounter,
    /// Batches whose payload DMAs completed.
    pub data_dma_compl: SeqCounter,
    pub local: Arc<dyn Memory>,
}

impl RxPath {
    fn new(cfg: &PciOutConfig, local: Arc<dyn Memory>, local_base: u64) -> Result<RxPath, &'static str> {
        Ok(RxPath {
            queues: (0..MAX_QUEUES).map(|_| RxQueueInfo::default()).collect(),
            fl_cache: FlCache::new(cfg, local_base),
            credits: CreditTable::new(),
            urgent: QueueBitmask::new(),
            input: HwRing::new(cfg.input_ring_size as usize)?,
            data_ring: HwRing::new(cfg.desc_batch_ring as usize * 2)?,
            desc_msgs: (0..cfg.desc_batch_ring).map(|_| AtomicU64::new(0)).collect(),
            staging_base: local_base + FlCache::bytes(cfg),
            staging_slots: PciOut::staging_slots(cfg),
            desc_batch_served: SeqCounter::new(0),
            data_dma_compl: SeqCounter::new(0),
            local,
        })
    }

    pub fn queue(&self, natq: u8) -> &RxQueueInfo {
        &self.queues[natq as usize]
    }

    /// The message slot of batch number `batch`.
    pub fn desc_msg(&self, batch: u32) -> &AtomicU64 {
        &self.desc_msgs[(batch as usize) & (self.desc_msgs.len() - 1)]
    }

    /// On-chip address of the staged RX descriptor of packet number `index`.
    pub fn staging_addr(&self, index: u32) -> u64 {
        self.staging_base + u64::from(index & (self.staging_slots - 1)) * RxDesc::SIZE as u64
    }
}

/// A complete PCI.OUT pipeline.
pub struct PciOut {
    pub cache: CacheDesc,
    pub stage: Arc<StageBatch>,
    pub rx_dma: Arc<RxIssueDma>,
    pub send: Arc<SendDesc>,
    pub path: Arc<RxPath>,
    cfg: PciOutConfig,
}

impl PciOut {
    /// Staged RX descriptor slots: two full batch rings' worth, so a slot is
    /// never restaged while its descriptor DMA may still read it.
    pub fn staging_slots(cfg: &PciOutConfig) -> u32 {
        cfg.desc_batch_ring * MAX_BATCH_SZ * 2
    }

    /// Bytes of on-chip memory the pipeline uses from its base address.
    pub fn local_bytes(cfg: &PciOutConfig) -> u64 {
        FlCache::bytes(cfg) + u64::from(Self::staging_slots(cfg)) * RxDesc::SIZE as u64
    }

    /// Builds the pipeline, placing the free-list cache and the staging ring
    /// at `local_base`.
    pub fn new(cfg: &PciOutConfig, hw: &Hw, local_base: u64) -> Result<PciOut, &'static str> {
        let path = Arc::new(RxPath::new(cfg, hw.local.clone(), local_base)?);
        let cache = CacheDesc::new(cfg, hw, path.clone());
        let stage = Arc::new(StageBatch::new(cfg, path.clone()));
        let rx_dma = Arc::new(RxIssueDma::new(cfg, hw, path.clone())?);
        let send = Arc::new(SendDesc::new(cfg, hw, path.clone()));
        info!("PCI.OUT: {} stage, {} payload and {} send contexts",
            cfg.stage_contexts, cfg.rx_data_contexts, cfg.send_contexts);
        Ok(PciOut { cache, stage, rx_dma, send, path, cfg: cfg.clone() })
    }

    pub fn config(&self) -> &PciOutConfig {
        &self.cfg
    }

    pub fn credits(&self) -> &CreditTable {
        &self.path.credits
    }

    /// Offers a packet. A full input ring hands it back.
    pub fn submit(&self, pkt: RxPkt) -> Result<(), RxPkt> {
        self.path.input.put(pkt)
    }

    /// Brings a free-list/RX queue up or down.
    pub fn vnic_setup(&mut self, cfg: &QueueCfg) {
        self.cache.vnic_setup(cfg);
    }

    /// Returns `true` if every stage holds the idle state for `natq`.
    pub fn queue_is_idle(&self, natq: u8) -> bool {
        self.cache.queue_is_idle(natq)
    }
}
