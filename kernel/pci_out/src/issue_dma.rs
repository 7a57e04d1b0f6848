use alloc::{sync::Arc, vec::Vec};
use core::sync::atomic::{AtomicU32, Ordering};
use dma_seqn::{has_room, SeqCounter};
use hw_ring::HwRing;
use nfd_cfg::{config::MAX_BATCH_SZ, PciOutConfig};
use nfd_hw::{
    buf_cpp_addr,
    desc::{FlDesc, DMA_ADDR_MASK},
    read_array, BufAddr, BufferPool, DmaCompletion, DmaDescriptor, DmaDirection, DmaEngine, DmaQueue,
    EventStream, Hw,
};
use nfd_sync::{halted, Halt, Progress, ReorderStage, Stage};
use queue_bitmask::MAX_QUEUES;

use crate::RxPath;

const MAX_BATCH: usize = MAX_BATCH_SZ as usize;

/// NIC buffers one batch releases once its payload DMAs complete.
#[derive(Clone, Copy, Debug, Default)]
struct BufRelease {
    bufs: [BufAddr; MAX_BATCH],
    count: u8,
}

/// The RX payload DMA stage.
///
/// Contexts take staged batches strictly in order under one ordering token
/// and DMA each packet from its NIC buffer into the host buffer named by its
/// cached free-list descriptor. The last DMA of a batch carries the batch
/// number on the `RxData` event stream, which send_desc waits for.
pub struct RxIssueDma {
    path: Arc<RxPath>,
    contexts: usize,
    rx_offset: u32,
    max_in_flight: u32,
    dma: Arc<dyn DmaEngine>,
    pool: Arc<dyn BufferPool>,
    order: ReorderStage,
    /// Write offset within the host buffer of each queue's current packet.
    seg_off: Vec<AtomicU32>,
    releases: HwRing<BufRelease>,
    data_issued: SeqCounter,
    /// Batches whose buffers went back to the pool.
    released: SeqCounter,
}

/// The registers of one payload DMA context.
#[derive(Debug)]
pub struct RxIssueDmaCtx {
    slot: usize,
}

impl RxIssueDmaCtx {
    pub fn slot(&self) -> usize {
        self.slot
    }
}

impl RxIssueDma {
    pub(crate) fn new(cfg: &PciOutConfig, hw: &Hw, path: Arc<RxPath>) -> Result<RxIssueDma, &'static str> {
        let releases = cfg.data_max_in_flight.next_power_of_two().max(hw_ring::MIN_ENTRIES as u32);
        Ok(RxIssueDma {
            path,
            contexts: cfg.rx_data_contexts,
            rx_offset: cfg.rx_offset,
            max_in_flight: cfg.data_max_in_flight,
            dma: hw.dma.clone(),
            pool: hw.pool.clone(),
            order: ReorderStage::new(cfg.rx_data_contexts),
            seg_off: (0..MAX_QUEUES).map(|_| AtomicU32::new(0)).collect(),
            releases: HwRing::new(releases as usize)?,
            data_issued: SeqCounter::new(0),
            released: SeqCounter::new(0),
        })
    }

    pub fn contexts(&self) -> Vec<RxIssueDmaCtx> {
        (0..self.contexts).map(|slot| RxIssueDmaCtx { slot }).collect()
    }

    pub fn data_issued(&self) -> u32 {
        self.data_issued.get()
    }

    pub fn released(&self) -> u32 {
        self.released.get()
    }

    /// One step of context `ctx`: release the buffers of completed batches,
    /// then issue the next staged batch if the window allows.
    pub fn step(&self, ctx: &mut RxIssueDmaCtx) -> Result<Progress, Halt> {
        if !self.order.test(ctx.slot) {
            return Ok(Progress::Blocked);
        }
        let progress = self.release_completed()?;
        if !has_room(self.data_issued.get(), self.path.data_dma_compl.get(), self.max_in_flight) {
            return Ok(progress.or(Progress::Blocked));
        }
        let batch = match self.path.data_ring.get() {
            Some(batch) => batch,
            None => return Ok(progress),
        };
        if batch.num == 0 || u32::from(batch.num) > MAX_BATCH_SZ {
            return Err(halted(Halt::BatchSize { stage: Stage::RxIssueDma, size: batch.num }));
        }

        let seq = self.data_issued.increment();
        let mut dmas = [None; MAX_BATCH];
        let mut ndmas = 0;
        let mut release = BufRelease::default();
        for pkt in batch.pkts() {
            let seg_off = &self.seg_off[pkt.queue as usize];
            if pkt.sop {
                seg_off.store(0, Ordering::Relaxed);
            }
            if !pkt.down && self.path.queue(pkt.queue).is_up() {
                let fl = FlDesc::from_bytes(&read_array::<{ FlDesc::SIZE }>(&*self.path.local, pkt.fl_cache_addr));
                let off = seg_off.load(Ordering::Relaxed);
                dmas[ndmas] = Some(DmaDescriptor {
                    direction: DmaDirection::ToHost,
                    pcie_addr: (fl.dma_addr & DMA_ADDR_MASK) + u64::from(self.rx_offset) + u64::from(off),
                    cpp_addr: buf_cpp_addr(pkt.buf) + u64::from(pkt.offset),
                    length: u32::from(pkt.seg_len),
                    rid: pkt.rid,
                    completion: DmaCompletion::Ignore,
                });
                ndmas += 1;
                seg_off.store(off + u32::from(pkt.seg_len), Ordering::Relaxed);
            }
            if pkt.eop {
                release.bufs[release.count as usize] = pkt.buf;
                release.count += 1;
            }
        }

        let completion = DmaCompletion::Event { stream: EventStream::RxData, seqn: seq };
        match dmas[..ndmas].last_mut() {
            Some(Some(last)) => last.completion = completion,
            _ => {
                dmas[0] = Some(DmaDescriptor::signal_only(completion));
                ndmas = 1;
            }
        }
        // The window keeps the release ring from filling.
        let _ = self.releases.put(release);
        for dma in dmas[..ndmas].iter().flatten() {
            self.dma.enqueue(DmaQueue::RxData, dma);
        }
        trace!("rx_issue_dma: batch {} of {} ({} DMAs)", seq, batch.num, ndmas);

        self.order.done(ctx.slot);
        Ok(Progress::Worked)
    }

    /// Returns the NIC buffers of every batch whose payload DMAs completed.
    fn release_completed(&self) -> Result<Progress, Halt> {
        let compl = self.path.data_dma_compl.get();
        let mut progress = Progress::Idle;
        while self.released.get() != compl {
            let release = self
                .releases
                .get()
                .ok_or_else(|| halted(Halt::HandoffRingEmpty { stage: Stage::RxIssueDma }))?;
            for buf in &release.bufs[..release.count as usize] {
                self.pool.free(*buf);
            }
            self.released.increment();
            progress = Progress::Worked;
        }
        Ok(progress)
    }
}
