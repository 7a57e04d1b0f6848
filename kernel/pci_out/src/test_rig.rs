//! A PCI.OUT pipeline wired to simulated hardware, for unit tests.

extern crate std;

use alloc::sync::Arc;
use nfd_cfg::{PciOutConfig, QueueCfg};
use nfd_hw::{
    buf_cpp_addr,
    desc::{FlDesc, RxDesc},
    read_array, Hw, Memory, PcieReset, QcQueue, QueueKind,
};
use nfd_sim::{SimBufferPool, SimDma, SimQueueController, SimWorkQueues, SparseMemory};
use nfd_sync::{Halt, Progress};
use std::vec::Vec;

use crate::{desc::RxPkt, PciOut, RxIssueDmaCtx, SendDescCtx, StageBatchCtx};

pub const LOCAL_BASE: u64 = 0x10_0000;
pub const FIRST_BUF: u32 = 0x400;
pub const RING_SZ_LOG2: u8 = 8;

/// Host free-list/RX ring of natural queue `natq`.
pub fn ring_base(natq: u8) -> u64 {
    0x4_0000 + u64::from(natq) * 0x1000
}

pub struct Rig {
    pub host: Arc<SparseMemory>,
    pub local: Arc<SparseMemory>,
    pub dma: Arc<SimDma>,
    pub qc: Arc<SimQueueController>,
    pub pool: Arc<SimBufferPool>,
    pub reset: Arc<PcieReset>,
    pub pci_out: PciOut,
    pub stage_ctxs: Vec<StageBatchCtx>,
    pub rx_ctxs: Vec<RxIssueDmaCtx>,
    pub send_ctxs: Vec<SendDescCtx>,
    posted: [u32; 64],
}

impl Rig {
    pub fn new(cfg: PciOutConfig) -> Rig {
        let host = Arc::new(SparseMemory::new());
        let local = Arc::new(SparseMemory::new());
        let dma = Arc::new(SimDma::new(host.clone(), local.clone()));
        let qc = Arc::new(SimQueueController::new());
        let pool = Arc::new(SimBufferPool::new(FIRST_BUF, 256));
        let reset = Arc::new(PcieReset::new());
        let hw = Hw {
            dma: dma.clone(),
            events: dma.clone(),
            qc: qc.clone(),
            local: local.clone(),
            pool: pool.clone(),
            wq: Arc::new(SimWorkQueues::new(1)),
            reset: reset.clone(),
        };
        let pci_out = PciOut::new(&cfg, &hw, LOCAL_BASE).unwrap();
        let stage_ctxs = pci_out.stage.contexts();
        let rx_ctxs = pci_out.rx_dma.contexts();
        let send_ctxs = pci_out.send.contexts();
        Rig { host, local, dma, qc, pool, reset, pci_out, stage_ctxs, rx_ctxs, send_ctxs, posted: [0; 64] }
    }

    pub fn queue_cfg(natq: u8, up: bool) -> QueueCfg {
        QueueCfg { natq, up, ring_sz_log2: RING_SZ_LOG2, ring_base: ring_base(natq), rid: natq + 1 }
    }

    pub fn up(&mut self, natq: u8) {
        self.posted[natq as usize] = 0;
        self.pci_out.vnic_setup(&Self::queue_cfg(natq, true));
    }

    pub fn down(&mut self, natq: u8) {
        self.pci_out.vnic_setup(&Self::queue_cfg(natq, false));
    }

    /// Host address of ring entry `index` of `natq`.
    pub fn ring_entry(&self, natq: u8, index: u32) -> u64 {
        ring_base(natq) + u64::from(index & ((1 << RING_SZ_LOG2) - 1)) * FlDesc::SIZE as u64
    }

    /// The host buffer posted at ring entry `index` of `natq`.
    pub fn host_buf(&self, natq: u8, index: u32) -> u64 {
        0x100_0000 + u64::from(natq) * 0x10_0000 + u64::from(index & ((1 << RING_SZ_LOG2) - 1)) * 0x800
    }

    /// The host driver posting `count` more free-list buffers.
    pub fn post_buffers(&mut self, natq: u8, count: u32) {
        for _ in 0..count {
            let index = self.posted[natq as usize];
            let desc = FlDesc { dma_addr: self.host_buf(natq, index) };
            self.host.write(self.ring_entry(natq, index), &desc.to_bytes());
            self.posted[natq as usize] = index.wrapping_add(1);
        }
        self.qc.host_write(QcQueue::new(natq, QueueKind::FreeList), count);
    }

    /// Runs cache_desc alone until every posted buffer is cached.
    pub fn fill_cache(&mut self) {
        loop {
            let progress = self.pci_out.cache.step();
            self.dma.complete_all();
            if !progress.worked() {
                break;
            }
        }
    }

    /// A packet of `len` bytes of `fill`, offered the way downstream
    /// processing does it: take a credit, fill a buffer, submit.
    pub fn produce(&self, natq: u8, len: u16, fill: u8) -> Result<(), &'static str> {
        if !self.pci_out.credits().try_take(natq, 1) {
            return Err("no credit");
        }
        let buf = nfd_hw::BufferPool::alloc(&*self.pool).ok_or("no buffer")?;
        self.local.write(buf_cpp_addr(buf), &std::vec![fill; len as usize]);
        self.pci_out.submit(RxPkt::new(natq, buf, 0, len)).map_err(|_| "input ring full")
    }

    /// Runs every stage once, in pipeline order, completing all DMAs in
    /// between.
    pub fn pass(&mut self) -> Result<Progress, Halt> {
        let mut progress = self.pci_out.cache.step();
        self.dma.complete_all();
        for ctx in self.stage_ctxs.iter_mut() {
            progress = progress.or(self.pci_out.stage.step(ctx));
        }
        for ctx in self.rx_ctxs.iter_mut() {
            progress = progress.or(self.pci_out.rx_dma.step(ctx)?);
        }
        self.dma.complete_all();
        for ctx in self.send_ctxs.iter_mut() {
            progress = progress.or(self.pci_out.send.step(ctx)?);
        }
        self.dma.complete_all();
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

    /// The host ring entry `index` of `natq`, read as an RX descriptor.
    pub fn rx_desc(&self, natq: u8, index: u32) -> RxDesc {
        RxDesc::from_bytes(&read_array::<8>(&*self.host, self.ring_entry(natq, index)))
    }

    /// Packet bytes in the host buffer of ring entry `index`.
    pub fn host_bytes(&self, natq: u8, index: u32, len: usize) -> Vec<u8> {
        let start = self.host_buf(natq, index) + u64::from(self.pci_out.config().rx_offset);
        let mut bytes = std::vec![0u8; len];
        self.host.read(start, &mut bytes);
        bytes
    }
}
