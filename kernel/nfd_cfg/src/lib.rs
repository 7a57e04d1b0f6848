//! Configuration of the NFD data plane.
//!
//! [`NfdConfig`] carries every tunable of both pipelines plus the vNIC
//! layout that maps vNIC-relative queues onto the natural queue numbers the
//! pipelines index their state with. [`CfgMsg`] is the per-queue up/down
//! request the configuration collaborator delivers; [`NfdConfig::resolve`]
//! validates it before any stage state is touched.

#![no_std]

#[macro_use] extern crate log;
#[macro_use] extern crate static_assertions;

pub mod config;
mod error;

pub use error::{ConfigError, Result};

use config::*;

/// Tunables of the host-to-NIC pipeline.
#[derive(Clone, Debug)]
pub struct PciInConfig {
    /// Selection attempts before gather re-polls the last candidate anyway.
    pub max_retries: u32,
    pub backlog_factor: u32,
    pub pending_test: u32,
    pub batch_window: u32,
    pub gather_max_in_flight: u32,
    /// Depth of each lane's gather-to-issue hand-off ring, in batches.
    pub batch_ring_size: u32,
    /// Batches each lane's descriptor storage holds.
    pub desc_batch_slots: u32,
    /// Depth of each lane's issue-to-notify ring, in batches.
    pub issued_ring_size: u32,
    pub lanes: u8,
    pub lane_shift: u8,
    pub lane_xor: u8,
    pub issue_contexts: usize,
    pub notify_contexts: usize,
    pub data_offset: u32,
    pub precache_bufs: u32,
    pub lso_ring_size: u32,
    pub num_wqs: u8,
    /// Stamp notifications with a per-work-queue sequence number.
    pub add_seqn: bool,
    /// Island number reported in notifications.
    pub intf: u8,
}

impl Default for PciInConfig {
    fn default() -> Self {
        PciInConfig {
            max_retries: GATHER_MAX_RETRIES,
            backlog_factor: BACKLOG_FACTOR,
            pending_test: PENDING_TEST,
            batch_window: BATCH_WINDOW,
            gather_max_in_flight: GATHER_MAX_IN_FLIGHT,
            batch_ring_size: BATCH_RING_SIZE,
            desc_batch_slots: DESC_BATCH_SLOTS,
            issued_ring_size: ISSUED_RING_SIZE,
            lanes: ISSUE_LANES,
            lane_shift: 0,
            lane_xor: 0,
            issue_contexts: ISSUE_CONTEXTS,
            notify_contexts: NOTIFY_CONTEXTS,
            data_offset: TX_DATA_OFFSET,
            precache_bufs: PRECACHE_BUFS,
            lso_ring_size: LSO_RING_SIZE,
            num_wqs: NUM_WQS,
            add_seqn: false,
            intf: 0,
        }
    }
}

impl PciInConfig {
    /// The lane that issues payload DMA for `queue`.
    pub fn lane_of(&self, queue: u8) -> u8 {
        if self.lanes < 2 {
            0
        } else {
            ((queue >> self.lane_shift) & 1) ^ (self.lane_xor & 1)
        }
    }

    /// Bytes of descriptor storage per lane.
    pub fn desc_ring_bytes(&self) -> u64 {
        u64::from(self.desc_batch_slots) * u64::from(MAX_BATCH_SZ) * 16
    }

    fn validate(&self) -> Result<()> {
        let pow2 = |v: u32| v.is_power_of_two();
        if !pow2(self.batch_window) || self.batch_window < MAX_BATCH_SZ {
            return Err(ConfigError::Tunable("batch window must be a power of two of at least a batch"));
        }
        if !pow2(self.desc_batch_slots) || self.desc_batch_slots <= self.batch_ring_size {
            return Err(ConfigError::Tunable("descriptor slots must outnumber hand-off ring entries"));
        }
        if !pow2(self.batch_ring_size) || !pow2(self.issued_ring_size) || !pow2(self.lso_ring_size) {
            return Err(ConfigError::Tunable("ring sizes must be powers of two"));
        }
        if self.lso_ring_size < MAX_BATCH_SZ * MAX_LSO_SEGS {
            return Err(ConfigError::Tunable("LSO ring must hold a batch of fully segmented packets"));
        }
        // Packet starts are then within a descriptor offset of the buffer.
        if self.data_offset > TX_DESC_MAX_OFFSET {
            return Err(ConfigError::Tunable("data offset must fit a descriptor offset"));
        }
        if self.gather_max_in_flight == 0 || self.gather_max_in_flight > 32 {
            return Err(ConfigError::Tunable("gather in-flight window must be 1..=32"));
        }
        if !(1..=2).contains(&self.lanes) {
            return Err(ConfigError::Tunable("one or two issue lanes"));
        }
        if self.issue_contexts == 0 || self.notify_contexts == 0 {
            return Err(ConfigError::Tunable("stages need at least one context"));
        }
        if self.precache_bufs < MAX_BATCH_SZ || !pow2(self.precache_bufs) {
            return Err(ConfigError::Tunable("precache must be a power of two holding a batch"));
        }
        if self.num_wqs == 0 || !self.num_wqs.is_power_of_two() {
            return Err(ConfigError::Tunable("work queue count must be a power of two"));
        }
        Ok(())
    }
}

/// Tunables of the NIC-to-host pipeline.
#[derive(Clone, Debug)]
pub struct PciOutConfig {
    pub fl_batch_size: u32,
    pub fl_bufs_per_queue: u32,
    pub fl_max_in_flight: u32,
    pub fl_soft_thresh: u32,
    /// Batches the descriptor-batch message ring holds.
    pub desc_batch_ring: u32,
    pub desc_max_in_flight: u32,
    pub data_max_in_flight: u32,
    pub input_ring_size: u32,
    pub stage_contexts: usize,
    pub rx_data_contexts: usize,
    pub send_contexts: usize,
    /// Bytes left free at the start of each host RX buffer.
    pub rx_offset: u32,
}

impl Default for PciOutConfig {
    fn default() -> Self {
        PciOutConfig {
            fl_batch_size: FL_BATCH_SZ,
            fl_bufs_per_queue: FL_BUFS_PER_QUEUE,
            fl_max_in_flight: FL_MAX_IN_FLIGHT,
            fl_soft_thresh: FL_SOFT_THRESH,
            desc_batch_ring: DESC_BATCH_RING,
            desc_max_in_flight: DESC_MAX_IN_FLIGHT,
            data_max_in_flight: RX_DATA_MAX_IN_FLIGHT,
            input_ring_size: INPUT_RING_SIZE,
            stage_contexts: STAGE_CONTEXTS,
            rx_data_contexts: RX_DATA_CONTEXTS,
            send_contexts: SEND_CONTEXTS,
            rx_offset: RX_OFFSET,
        }
    }
}

impl PciOutConfig {
    /// Bytes of free-list cache per queue.
    pub fn fl_cache_bytes_per_queue(&self) -> u64 {
        u64::from(self.fl_bufs_per_queue) * 8
    }

    fn validate(&self) -> Result<()> {
        let pow2 = |v: u32| v.is_power_of_two();
        if !pow2(self.fl_batch_size) || !pow2(self.fl_bufs_per_queue) || self.fl_bufs_per_queue < 2 * self.fl_batch_size {
            return Err(ConfigError::Tunable("free-list cache must hold two fetch batches"));
        }
        if !pow2(self.fl_max_in_flight) || !pow2(self.desc_batch_ring) || !pow2(self.input_ring_size) {
            return Err(ConfigError::Tunable("ring sizes must be powers of two"));
        }
        if self.desc_max_in_flight <= MAX_BATCH_SZ || self.data_max_in_flight == 0 {
            return Err(ConfigError::Tunable("DMA windows must exceed a batch"));
        }
        if self.desc_max_in_flight > self.desc_batch_ring * MAX_BATCH_SZ {
            return Err(ConfigError::Tunable("descriptor DMA window must fit the batch ring"));
        }
        if self.stage_contexts == 0 || self.rx_data_contexts == 0 || self.send_contexts == 0 {
            return Err(ConfigError::Tunable("stages need at least one context"));
        }
        Ok(())
    }
}

/// How vNICs and their queues map onto natural queue numbers.
///
/// VFs come first, `max_vf_queues` each; the PF follows with vNIC id
/// `max_vfs`.
#[derive(Clone, Debug)]
pub struct VnicLayout {
    pub max_vfs: u8,
    pub max_vf_queues: u8,
    pub max_pf_queues: u8,
    pub pf_rid_offset: u8,
    pub vf_rid_offset: u8,
}

impl Default for VnicLayout {
    fn default() -> Self {
        VnicLayout {
            max_vfs: MAX_VFS,
            max_vf_queues: MAX_VF_QUEUES,
            max_pf_queues: MAX_PF_QUEUES,
            pf_rid_offset: PF_RID_OFFSET,
            vf_rid_offset: VF_RID_OFFSET,
        }
    }
}

impl VnicLayout {
    pub fn pf_vid(&self) -> u8 {
        self.max_vfs
    }

    pub fn is_vf(&self, vid: u8) -> bool {
        vid < self.max_vfs
    }

    pub fn total_queues(&self) -> u32 {
        u32::from(self.max_vfs) * u32::from(self.max_vf_queues) + u32::from(self.max_pf_queues)
    }

    /// The natural queue of `queue` on vNIC `vid`.
    pub fn natq(&self, vid: u8, queue: u8) -> Result<u8> {
        let queues = if self.is_vf(vid) {
            self.max_vf_queues
        } else if vid == self.pf_vid() {
            self.max_pf_queues
        } else {
            return Err(ConfigError::UnknownVnic(vid));
        };
        if queue >= queues {
            return Err(ConfigError::QueueOutOfRange { vid, queue });
        }
        Ok(vid * self.max_vf_queues + queue)
    }

    /// The PCIe requester id DMAs for vNIC `vid` are issued with.
    pub fn rid(&self, vid: u8) -> u8 {
        if self.is_vf(vid) {
            vid + self.vf_rid_offset
        } else {
            self.pf_rid_offset
        }
    }
}

/// All data-plane configuration.
#[derive(Clone, Debug, Default)]
pub struct NfdConfig {
    pub pci_in: PciInConfig,
    pub pci_out: PciOutConfig,
    pub vnics: VnicLayout,
}

impl NfdConfig {
    /// Checks the sizing rules the pipelines rely on.
    pub fn validate(&self) -> Result<()> {
        self.pci_in.validate()?;
        self.pci_out.validate()?;
        if self.vnics.total_queues() > MAX_QUEUES {
            return Err(ConfigError::Tunable("more than 64 queues"));
        }
        Ok(())
    }

    /// Validates a configuration message and resolves it to the rings it
    /// targets.
    pub fn resolve(&self, msg: &CfgMsg) -> Result<VnicQueue> {
        let natq = self.vnics.natq(msg.vid, msg.queue)?;
        let rid = self.vnics.rid(msg.vid);
        let ring = |ring_sz_log2: u8, ring_base: u64| -> Result<QueueCfg> {
            if msg.up {
                if !(MIN_RING_SZ_LOG2..=MAX_RING_SZ_LOG2).contains(&ring_sz_log2) {
                    return Err(ConfigError::RingSize(ring_sz_log2));
                }
                if ring_base % RING_BASE_ALIGN != 0 {
                    return Err(ConfigError::RingAlignment(ring_base));
                }
            }
            Ok(QueueCfg { natq, up: msg.up, ring_sz_log2, ring_base, rid })
        };
        Ok(VnicQueue {
            tx: ring(msg.ring_sz_log2, msg.ring_base)?,
            fl: ring(msg.fl_ring_sz_log2, msg.fl_ring_base)?,
        })
    }
}

/// A per-queue up/down request from the configuration collaborator.
///
/// One request covers both directions of a vNIC queue: the TX ring PCI.IN
/// gathers from and the free-list ring PCI.OUT fetches buffers from and
/// writes RX descriptors back to.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct CfgMsg {
    pub vid: u8,
    /// Queue number within the vNIC.
    pub queue: u8,
    pub up: bool,
    pub ring_sz_log2: u8,
    pub ring_base: u64,
    pub fl_ring_sz_log2: u8,
    pub fl_ring_base: u64,
    /// Set when the request was refused.
    pub error: bool,
    /// Set while the PCIe island is coming out of reset.
    pub pci_reset: bool,
}

impl CfgMsg {
    /// A request bringing up a queue whose TX and free-list rings have the
    /// same size.
    pub fn up(vid: u8, queue: u8, ring_sz_log2: u8, ring_base: u64, fl_ring_base: u64) -> CfgMsg {
        CfgMsg {
            vid,
            queue,
            up: true,
            ring_sz_log2,
            ring_base,
            fl_ring_sz_log2: ring_sz_log2,
            fl_ring_base,
            ..Default::default()
        }
    }

    pub fn down(vid: u8, queue: u8) -> CfgMsg {
        CfgMsg { vid, queue, ..Default::default() }
    }

    /// Marks the request complete, recording the outcome of applying it.
    pub fn complete<T>(&mut self, result: &Result<T>) {
        self.error = result.is_err();
        if let Err(e) = result {
            warn!("vNIC {} queue {}: configuration refused: {}", self.vid, self.queue, e);
        }
    }
}

/// Both rings of a validated request.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct VnicQueue {
    pub tx: QueueCfg,
    pub fl: QueueCfg,
}

/// A validated queue configuration, addressed by natural queue.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct QueueCfg {
    pub natq: u8,
    pub up: bool,
    pub ring_sz_log2: u8,
    pub ring_base: u64,
    pub rid: u8,
}

impl QueueCfg {
    pub fn ring_sz_msk(&self) -> u32 {
        (1u32 << self.ring_sz_log2) - 1
    }
}
