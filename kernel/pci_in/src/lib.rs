//! The host-to-NIC (PCI.IN) data path.
//!
//! Three stages move a TX packet from a host ring into an on-chip buffer:
//!
//! 1. [`Gather`] watches the host TX rings, forms batches of up to four
//!    descriptors and DMAs each batch into per-lane descriptor storage.
//! 2. [`IssueDma`] takes the batches in order, DMAs every packet's payload
//!    into a packet buffer and records what it issued.
//! 3. [`Notify`] waits for the payload DMAs to finish, hands each packet to
//!    a work queue and returns the descriptors to the host.
//!
//! Payload work is split over one or two *lanes*, each with its own
//! issue_dma and notify thread groups. A queue always maps to the same
//! lane, so per-queue order survives the split.
//!
//! Stages never call each other. Gather hands batches to issue_dma through
//! the lane's batch ring and tells it how far the descriptor DMAs have
//! progressed; issue_dma and notify exchange completed and served counts the
//! same way (see the `distr` functions). Reading a descriptor slot, a ring
//! entry or a packet buffer is safe exactly when the relevant sequence
//! counter says so.

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

pub mod desc;
mod distr;
mod gather;
mod issue_dma;
mod notify;
pub mod queue;
#[cfg(test)]
mod test_rig;

pub use gather::Gather;
pub use issue_dma::{IssueDma, IssueDmaCtx};
pub use notify::{Notify, NotifyCtx};

use alloc::{sync::Arc, vec::Vec};
use desc::IssuedBatch;
use dma_seqn::SeqCounter;
use hw_ring::HwRing;
use nfd_cfg::{PciInConfig, QueueCfg};
use nfd_hw::{desc::PktDesc, Hw};
use nfd_sync::ReflectCell;

/// The state one lane's stages share.
pub struct Lane {
    pub id: u8,
    /// Batches from gather, as [`desc::BatchDesc`] words.
    pub batch_ring: HwRing<u32>,
    /// Descriptor DMAs gather issued for this lane.
    pub gather_issued: SeqCounter,
    /// Descriptor DMAs completed for this lane, reflected by gather.
    pub gather_compl: ReflectCell,
    /// On-chip address of this lane's descriptor storage.
    pub desc_base: u64,
    pub desc_ring_bytes: u64,
    pub issued_ring: HwRing<IssuedBatch>,
    /// Segment descriptors of LSO packets, in packet order.
    pub lso_ring: HwRing<PktDesc>,
    /// Payload batches completed, reflected by issue_dma.
    pub data_compl: ReflectCell,
    /// Payload batches served, reflected by notify.
    pub data_served: ReflectCell,
}

impl Lane {
    fn new(id: u8, cfg: &PciInConfig, desc_base: u64) -> Result<Lane, &'static str> {
        Ok(Lane {
            id,
            batch_ring: HwRing::new(cfg.batch_ring_size as usize)?,
            gather_issued: SeqCounter::new(0),
            gather_compl: ReflectCell::new(0),
            desc_base,
            desc_ring_bytes: cfg.desc_ring_bytes(),
            issued_ring: HwRing::new(cfg.issued_ring_size as usize)?,
            lso_ring: HwRing::new(cfg.lso_ring_size as usize)?,
            data_compl: ReflectCell::new(0),
            data_served: ReflectCell::new(0),
        })
    }
}

/// The stages of one lane.
#[derive(Clone)]
pub struct LaneStages {
    pub lane: Arc<Lane>,
    pub issue: Arc<IssueDma>,
    pub notify: Arc<Notify>,
}

/// A complete PCI.IN pipeline.
pub struct PciIn {
    pub gather: Gather,
    pub lanes: Vec<LaneStages>,
    cfg: PciInConfig,
}

impl PciIn {
    /// Bytes of on-chip memory the pipeline uses from its base address.
    pub fn local_bytes(cfg: &PciInConfig) -> u64 {
        u64::from(cfg.lanes) * cfg.desc_ring_bytes()
    }

    /// Builds the pipeline, placing its descriptor storage at `local_base`.
    pub fn new(cfg: &PciInConfig, hw: &Hw, local_base: u64) -> Result<PciIn, &'static str> {
        let mut lanes = Vec::with_capacity(cfg.lanes as usize);
        for id in 0..cfg.lanes {
            let desc_base = local_base + u64::from(id) * cfg.desc_ring_bytes();
            let lane = Arc::new(Lane::new(id, cfg, desc_base)?);
            let issue = Arc::new(IssueDma::new(cfg, hw, lane.clone())?);
            let notify = Arc::new(Notify::new(cfg, hw, lane.clone()));
            lanes.push(LaneStages { lane, issue, notify });
        }
        let gather = Gather::new(cfg, hw, lanes.iter().map(|l| l.lane.clone()).collect());
        info!("PCI.IN: {} lane(s), {} issue and {} notify contexts each",
            cfg.lanes, cfg.issue_contexts, cfg.notify_contexts);
        Ok(PciIn { gather, lanes, cfg: cfg.clone() })
    }

    pub fn config(&self) -> &PciInConfig {
        &self.cfg
    }

    /// The lane stages serving `natq`.
    pub fn lane_of(&self, natq: u8) -> &LaneStages {
        &self.lanes[self.cfg.lane_of(natq) as usize % self.lanes.len()]
    }

    /// Brings a queue up or down in every stage, gather first so that no
    /// new batch for the queue is formed while the later stages change.
    pub fn vnic_setup(&mut self, cfg: &QueueCfg) {
        self.gather.vnic_setup(cfg);
        let lane = self.cfg.lane_of(cfg.natq) as usize % self.lanes.len();
        self.lanes[lane].issue.vnic_setup(cfg);
    }

    /// Returns `true` if every stage holds the idle state for `natq`.
    pub fn queue_is_idle(&self, natq: u8) -> bool {
        self.gather.queue_is_idle(natq) && self.lane_of(natq).issue.queue(natq).is_idle()
    }
}
