//! A PCI.IN pipeline wired to simulated hardware, for unit tests.

extern crate std;

use alloc::sync::Arc;
use nfd_cfg::{PciInConfig, QueueCfg};
use nfd_hw::{desc::TxDesc, Hw, Memory, PcieReset, QcQueue, QueueKind};
use nfd_sim::{SimBufferPool, SimDma, SimQueueController, SimWorkQueues, SparseMemory};
use nfd_sync::{Halt, Progress};
use std::vec::Vec;

use crate::{IssueDmaCtx, NotifyCtx, PciIn};

pub const LOCAL_BASE: u64 = 0x10_0000;
pub const FIRST_BUF: u32 = 0x400;
pub const RING_SZ_LOG2: u8 = 8;

/// Host ring of natural queue `natq`.
pub fn ring_base(natq: u8) -> u64 {
    0x4_0000 + u64::from(natq) * 0x1000
}

pub struct Rig {
    pub host: Arc<SparseMemory>,
    pub local: Arc<SparseMemory>,
    pub dma: Arc<SimDma>,
    pub qc: Arc<SimQueueController>,
    pub pool: Arc<SimBufferPool>,
    pub wq: Arc<SimWorkQueues>,
    pub reset: Arc<PcieReset>,
    pub pci_in: PciIn,
    pub issue_ctxs: Vec<Vec<IssueDmaCtx>>,
    pub notify_ctxs: Vec<Vec<NotifyCtx>>,
    posted: [u32; 64],
}

impl Rig {
    pub fn new(cfg: PciInConfig) -> Rig {
        let host = Arc::new(SparseMemory::new());
        let local = Arc::new(SparseMemory::new());
        let dma = Arc::new(SimDma::new(host.clone(), local.clone()));
        let qc = Arc::new(SimQueueController::new());
        let pool = Arc::new(SimBufferPool::new(FIRST_BUF, 256));
        let wq = Arc::new(SimWorkQueues::new(cfg.num_wqs as usize));
        let reset = Arc::new(PcieReset::new());
        let hw = Hw {
            dma: dma.clone(),
            events: dma.clone(),
            qc: qc.clone(),
            local: local.clone(),
            pool: pool.clone(),
            wq: wq.clone(),
            reset: reset.clone(),
        };
        let pci_in = PciIn::new(&cfg, &hw, LOCAL_BASE).unwrap();
        let issue_ctxs = pci_in.lanes.iter().map(|l| l.issue.contexts()).collect();
        let notify_ctxs = pci_in.lanes.iter().map(|l| l.notify.contexts()).collect();
        Rig { host, local, dma, qc, pool, wq, reset, pci_in, issue_ctxs, notify_ctxs, posted: [0; 64] }
    }

    pub fn queue_cfg(natq: u8, up: bool) -> QueueCfg {
        QueueCfg { natq, up, ring_sz_log2: RING_SZ_LOG2, ring_base: ring_base(natq), rid: natq + 1 }
    }

    pub fn up(&mut self, natq: u8) {
        self.posted[natq as usize] = 0;
        self.pci_in.vnic_setup(&Self::queue_cfg(natq, true));
    }

    pub fn down(&mut self, natq: u8) {
        self.pci_in.vnic_setup(&Self::queue_cfg(natq, false));
    }

    /// The host driver writing `descs` to the ring and bumping the write
    /// pointer.
    pub fn post(&mut self, natq: u8, descs: &[TxDesc]) {
        let mask = (1u32 << RING_SZ_LOG2) - 1;
        for desc in descs {
            let index = self.posted[natq as usize];
            let addr = ring_base(natq) + u64::from(index & mask) * TxDesc::SIZE as u64;
            self.host.write(addr, &desc.to_bytes());
            self.posted[natq as usize] = index.wrapping_add(1);
        }
        self.qc.host_write(QcQueue::new(natq, QueueKind::Tx), descs.len() as u32);
    }

    /// Runs every context of every stage once, in pipeline order, completing
    /// all DMAs in between.
    pub fn pass(&mut self) -> Result<Progress, Halt> {
        let mut progress = self.pci_in.gather.step();
        self.dma.complete_all();
        for (lane, ctxs) in self.pci_in.lanes.iter().zip(self.issue_ctxs.iter_mut()) {
            for ctx in ctxs.iter_mut() {
                progress = progress.or(lane.issue.step(ctx)?);
            }
        }
        self.dma.complete_all();
        for (lane, ctxs) in self.pci_in.lanes.iter().zip(self.notify_ctxs.iter_mut()) {
            for ctx in ctxs.iter_mut() {
                progress = progress.or(lane.notify.step(ctx)?);
            }
        }
        Ok(progress)
    }

    /// Runs passes until nothing moves for a few passes in a row.
    pub fn run(&mut self) -> Result<(), Halt> {
        let mut quiet = 0;
        while quiet < 4 {
            if self.pass()?.worked() {
                quiet = 0;
            } else {
                quiet += 1;
            }
        }
        Ok(())
    }

    /// Payload bytes in buffer `buf` starting at the packet.
    pub fn packet_bytes(&self, buf: u32, offset: u8, len: usize) -> Vec<u8> {
        let data_offset = self.pci_in.config().data_offset;
        let start = nfd_hw::buf_cpp_addr(buf) + u64::from(data_offset) - u64::from(offset);
        let mut bytes = std::vec![0u8; len];
        self.local.read(start, &mut bytes);
        bytes
    }
}

/// A one-descriptor packet whose payload is written to host memory at
/// `addr`.
pub fn packet(host: &SparseMemory, addr: u64, len: u16, fill: u8) -> TxDesc {
    host.write(addr, &std::vec![fill; len as usize]);
    TxDesc { dma_addr: addr, dma_len: len, eop: true, data_len: len, ..Default::default() }
}
