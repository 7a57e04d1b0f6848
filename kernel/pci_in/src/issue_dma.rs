use alloc::{sync::Arc, vec::Vec};
use core::sync::atomic::Ordering;
use dma_seqn::SeqCounter;
use hw_ring::HwRing;
use nfd_cfg::{config::{MAX_BATCH_SZ, MAX_LSO_SEGS}, PciInConfig, QueueCfg};
use nfd_hw::{
    buf_cpp_addr,
    desc::{PktDesc, TxDesc, DMA_ADDR_MASK},
    BufAddr, BufferPool, CompletionEvents, DmaCompletion, DmaDescriptor, DmaDirection, DmaEngine, DmaQueue,
    EventStream, Hw, Memory,
};
use nfd_sync::{halted, Halt, Progress, ReorderStage, Stage};
use queue_bitmask::{QueueBitmask, MAX_QUEUES};

use crate::{
    desc::{BatchDesc, IssuedBatch, IssuedDesc},
    queue::IssueQueueInfo,
    Lane,
};

const MAX_BATCH: usize = MAX_BATCH_SZ as usize;

/// The payload DMA stage of one lane.
///
/// A group of contexts takes batches in the order gather issued them. Each
/// batch passes two checkpoints, each guarded by an ordering token: taking
/// the batch off the hand-off ring and copying its descriptors out of the
/// descriptor slot, then issuing its payload DMAs and recording the result
/// for notify.
pub struct IssueDma {
    pub(crate) lane: Arc<Lane>,
    pub(crate) contexts: usize,
    data_offset: u32,
    intf: u8,
    dma: Arc<dyn DmaEngine>,
    pub(crate) events: Arc<dyn CompletionEvents>,
    local: Arc<dyn Memory>,
    pool: Arc<dyn BufferPool>,
    queues: Vec<IssueQueueInfo>,
    /// Queues downed mid-packet whose buffer is not yet released.
    draining: QueueBitmask,
    precache: HwRing<BufAddr>,
    desc_order: ReorderStage,
    dma_order: ReorderStage,
    /// Batches taken off the hand-off ring.
    pub(crate) gather_serv: SeqCounter,
    /// Descriptor DMAs known complete for this lane.
    pub(crate) gather_compl: SeqCounter,
    /// Batches whose payload DMAs were issued.
    pub(crate) data_issued: SeqCounter,
    pub(crate) data_safe: SeqCounter,
    pub(crate) data_compl: SeqCounter,
    /// Batches notify took, as last reflected.
    pub(crate) data_served: SeqCounter,
    /// Batches fully processed, including their hand-off to notify.
    batches_done: SeqCounter,
}

#[derive(Clone, Copy, Debug)]
enum IssuePhase {
    /// Waiting to take the next batch.
    Fetch,
    /// Holding a batch's descriptors, waiting to issue its DMAs.
    Issue { batch: BatchDesc, descs: [TxDesc; MAX_BATCH] },
}

/// The registers of one issue_dma context.
#[derive(Debug)]
pub struct IssueDmaCtx {
    slot: usize,
    phase: IssuePhase,
}

impl IssueDmaCtx {
    pub fn slot(&self) -> usize {
        self.slot
    }

    /// Returns `true` while the context holds a batch it has not finished.
    pub fn is_busy(&self) -> bool {
        !matches!(self.phase, IssuePhase::Fetch)
    }
}

/// The payload DMAs and the issued record one batch turns into, built before
/// anything is published.
struct BatchPlan {
    issued: IssuedBatch,
    dmas: [Option<DmaDescriptor>; MAX_BATCH],
    ndmas: usize,
    lso: Vec<PktDesc>,
}

impl IssueDma {
    pub(crate) fn new(cfg: &PciInConfig, hw: &Hw, lane: Arc<Lane>) -> Result<IssueDma, &'static str> {
        let issue = IssueDma {
            lane,
            contexts: cfg.issue_contexts,
            data_offset: cfg.data_offset,
            intf: cfg.intf,
            dma: hw.dma.clone(),
            events: hw.events.clone(),
            local: hw.local.clone(),
            pool: hw.pool.clone(),
            queues: (0..MAX_QUEUES).map(|_| IssueQueueInfo::default()).collect(),
            draining: QueueBitmask::new(),
            precache: HwRing::new(cfg.precache_bufs as usize)?,
            desc_order: ReorderStage::new(cfg.issue_contexts),
            dma_order: ReorderStage::new(cfg.issue_contexts),
            gather_serv: SeqCounter::new(0),
            gather_compl: SeqCounter::new(0),
            data_issued: SeqCounter::new(0),
            data_safe: SeqCounter::new(0),
            data_compl: SeqCounter::new(0),
            data_served: SeqCounter::new(0),
            batches_done: SeqCounter::new(0),
        };
        issue.refill_precache();
        Ok(issue)
    }

    /// Creates the registers of every context of the group.
    pub fn contexts(&self) -> Vec<IssueDmaCtx> {
        (0..self.contexts)
            .map(|slot| IssueDmaCtx { slot, phase: IssuePhase::Fetch })
            .collect()
    }

    pub fn queue(&self, natq: u8) -> &IssueQueueInfo {
        &self.queues[natq as usize]
    }

    /// Batches taken from gather.
    pub fn gather_served(&self) -> u32 {
        self.gather_serv.get()
    }

    pub fn gather_compl(&self) -> u32 {
        self.gather_compl.get()
    }

    pub fn data_issued(&self) -> u32 {
        self.data_issued.get()
    }

    pub fn data_compl(&self) -> u32 {
        self.data_compl.get()
    }

    pub fn data_safe(&self) -> u32 {
        self.data_safe.get()
    }

    pub fn precached(&self) -> usize {
        self.precache.len()
    }

    pub fn is_draining(&self, natq: u8) -> bool {
        self.draining.contains(natq)
    }

    /// One step of context `ctx`. Context 0 also runs the lane's sequence
    /// distribution.
    pub fn step(&self, ctx: &mut IssueDmaCtx) -> Result<Progress, Halt> {
        let mut progress = self.release_drained();
        if ctx.slot == 0 {
            progress = progress.or(self.distr());
        }
        if let IssuePhase::Fetch = ctx.phase {
            match self.fetch(ctx)? {
                Progress::Worked => progress = Progress::Worked,
                other => return Ok(progress.or(other)),
            }
        }
        Ok(progress.or(self.issue(ctx)))
    }

    /// Takes the next gathered batch and copies its descriptors out of the
    /// descriptor slot.
    fn fetch(&self, ctx: &mut IssueDmaCtx) -> Result<Progress, Halt> {
        if !self.desc_order.test(ctx.slot) {
            return Ok(Progress::Blocked);
        }
        if self.gather_serv.get() == self.gather_compl.get() {
            return Ok(Progress::Idle);
        }
        let word = self
            .lane
            .batch_ring
            .get()
            .ok_or_else(|| halted(Halt::HandoffRingEmpty { stage: Stage::IssueDma }))?;
        let serv = self.gather_serv.increment();
        let batch = BatchDesc::from_word(word);
        if batch.num == 0 || u32::from(batch.num) > MAX_BATCH_SZ {
            return Err(halted(Halt::BatchSize { stage: Stage::IssueDma, size: batch.num }));
        }

        let slot_bytes = MAX_BATCH as u64 * TxDesc::SIZE as u64;
        let addr = self.lane.desc_base + ((u64::from(serv) * slot_bytes) & (self.lane.desc_ring_bytes - 1));
        let mut raw = [0u8; MAX_BATCH * TxDesc::SIZE];
        let len = batch.num as usize * TxDesc::SIZE;
        self.local.read(addr, &mut raw[..len]);
        let mut descs = [TxDesc::default(); MAX_BATCH];
        for (desc, bytes) in descs.iter_mut().zip(raw[..len].chunks_exact(TxDesc::SIZE)) {
            let mut record = [0u8; TxDesc::SIZE];
            record.copy_from_slice(bytes);
            *desc = TxDesc::from_bytes(&record);
        }

        ctx.phase = IssuePhase::Issue { batch, descs };
        self.desc_order.done(ctx.slot);
        Ok(Progress::Worked)
    }

    /// Issues the held batch's payload DMAs and hands it to notify.
    fn issue(&self, ctx: &mut IssueDmaCtx) -> Progress {
        let (batch, descs) = match ctx.phase {
            IssuePhase::Issue { batch, descs } => (batch, descs),
            IssuePhase::Fetch => return Progress::Idle,
        };
        if !self.dma_order.test(ctx.slot) {
            return Progress::Blocked;
        }
        if self.data_issued.get() == self.data_safe.get() {
            self.compute_seq_safe();
            if self.data_issued.get() == self.data_safe.get() {
                return Progress::Blocked;
            }
        }
        if self.lane.issued_ring.is_full() {
            return Progress::Blocked;
        }

        let descs = &descs[..batch.num as usize];
        let info = &self.queues[batch.queue as usize];
        let up = info.is_up();
        // The ring holds the segments of any one batch, so this only waits
        // for notify to drain earlier ones.
        let lso_segs = if up { self.lso_segments(descs) } else { 0 };
        if lso_segs > self.lane.lso_ring.room() {
            return Progress::Blocked;
        }

        let need = if up { Self::buffers_needed(descs, info.in_continuation()) } else { 0 };
        if self.precache.len() < need {
            self.refill_precache();
            if self.precache.len() < need {
                return Progress::Blocked;
            }
        }
        let mut bufs = [0 as BufAddr; MAX_BATCH];
        for buf in bufs.iter_mut().take(need) {
            // Only the token holder takes from the precache.
            *buf = self.precache.get().unwrap_or_default();
        }

        let seq = self.data_issued.increment();
        let mut plan = if up {
            self.plan_up(batch, descs, &bufs[..need])
        } else {
            self.plan_down(batch, descs)
        };
        match plan.dmas[..plan.ndmas].last_mut() {
            Some(Some(last)) => {
                last.completion = DmaCompletion::Event { stream: EventStream::TxData(self.lane.id), seqn: seq };
            }
            _ => {
                plan.dmas[0] = Some(DmaDescriptor::signal_only(DmaCompletion::Event {
                    stream: EventStream::TxData(self.lane.id),
                    seqn: seq,
                }));
                plan.ndmas = 1;
            }
        }

        // Publish before the DMAs can complete.
        for seg in plan.lso.drain(..) {
            let _ = self.lane.lso_ring.put(seg);
        }
        let _ = self.lane.issued_ring.put(plan.issued);
        for dma in plan.dmas[..plan.ndmas].iter().flatten() {
            self.dma.enqueue(DmaQueue::TxData(self.lane.id), dma);
        }
        trace!("issue_dma {}: queue {} batch {} of {} ({} DMAs)",
            self.lane.id, batch.queue, seq, batch.num, plan.ndmas);

        self.batches_done.increment();
        ctx.phase = IssuePhase::Fetch;
        self.dma_order.done(ctx.slot);
        Progress::Worked
    }

    /// Buffers a batch takes from the precache: one per packet that starts
    /// in it.
    fn buffers_needed(descs: &[TxDesc], mut cont: bool) -> usize {
        let mut need = 0;
        for desc in descs {
            if !cont {
                need += 1;
            }
            cont = !desc.eop;
        }
        need
    }

    /// Segments an LSO packet is cut into, or `None` if it is sent whole.
    fn lso_segment_count(desc: &TxDesc, capacity: usize) -> Option<u8> {
        if !desc.eop || !desc.is_lso() || desc.mss == 0 {
            return None;
        }
        let payload = u32::from(desc.data_len.saturating_sub(u16::from(desc.lso_hdrlen)));
        let segs = (payload + u32::from(desc.mss) - 1) / u32::from(desc.mss);
        if segs == 0 || segs > MAX_LSO_SEGS || segs as usize > capacity {
            None
        } else {
            Some(segs as u8)
        }
    }

    fn lso_segments(&self, descs: &[TxDesc]) -> usize {
        let capacity = self.lane.lso_ring.capacity();
        descs
            .iter()
            .filter_map(|d| Self::lso_segment_count(d, capacity))
            .map(usize::from)
            .sum()
    }

    fn plan_up(&self, batch: BatchDesc, descs: &[TxDesc], bufs: &[BufAddr]) -> BatchPlan {
        let info = &self.queues[batch.queue as usize];
        let rid = info.rid.load(Ordering::Relaxed);
        let mut plan = BatchPlan {
            issued: IssuedBatch { queue: batch.queue, num_batch: batch.num, count: batch.num, ..Default::default() },
            dmas: [None; MAX_BATCH],
            ndmas: 0,
            lso: Vec::new(),
        };
        let mut bufs = bufs.iter().copied();

        for (i, desc) in descs.iter().enumerate() {
            let pcie_addr = desc.dma_addr & DMA_ADDR_MASK;
            let (buf, offset, cpp_addr, length) = if desc.eop && !info.in_continuation() {
                let buf = bufs.next().unwrap_or_default();
                let cpp = data_addr(buf, self.packet_start(desc));
                (buf, desc.offset, cpp, u32::from(desc.dma_len))
            } else {
                if !info.in_continuation() {
                    let buf = bufs.next().unwrap_or_default();
                    self.start_continuation(batch.queue, buf, self.packet_start(desc), desc.offset);
                }
                let buf = info.curr_buf.load(Ordering::Relaxed);
                let offset = info.offset.fetch_add(u32::from(desc.dma_len), Ordering::Relaxed);
                let pkt_offset = info.pkt_offset.load(Ordering::Relaxed);
                if desc.eop {
                    info.cont.store(false, Ordering::Release);
                    info.curr_buf.store(0, Ordering::Relaxed);
                    info.offset.store(0, Ordering::Relaxed);
                    info.pkt_offset.store(0, Ordering::Relaxed);
                }
                // Mid-packet writes are rounded up to whole words.
                let length = (u32::from(desc.dma_len) + 3) & !3;
                (buf, pkt_offset, data_addr(buf, offset), length)
            };

            if length != 0 {
                plan.dmas[plan.ndmas] = Some(DmaDescriptor {
                    direction: DmaDirection::FromHost,
                    pcie_addr,
                    cpp_addr,
                    length,
                    rid,
                    completion: DmaCompletion::Ignore,
                });
                plan.ndmas += 1;
            }

            let mut issued = IssuedDesc {
                eop: desc.eop,
                offset,
                buf_addr: buf,
                data_len: desc.data_len,
                flags: desc.flags,
                vlan: desc.vlan,
                mss: desc.mss,
                lso_hdrlen: desc.lso_hdrlen,
                lso_count: 0,
            };
            if let Some(segs) = Self::lso_segment_count(desc, self.lane.lso_ring.capacity()) {
                issued.lso_count = segs;
                plan.lso.extend((1..=segs).map(|seq| PktDesc {
                    intf: self.intf,
                    queue: batch.queue,
                    offset,
                    buf_addr: buf,
                    data_len: desc.data_len,
                    flags: desc.flags,
                    vlan: desc.vlan,
                    mss: desc.mss,
                    lso_hdrlen: desc.lso_hdrlen,
                    lso_seq: seq,
                    lso_end: seq == segs,
                    seqn: 0,
                }));
            }
            plan.issued.descs[i] = issued;
        }
        plan
    }

    /// A batch of a downed queue. The host ring is not advanced and notify
    /// sends nothing, but a packet that was part way into its buffer when the
    /// queue went down is still written out, and its buffer is released at
    /// its last descriptor.
    fn plan_down(&self, batch: BatchDesc, descs: &[TxDesc]) -> BatchPlan {
        let info = &self.queues[batch.queue as usize];
        let rid = info.rid.load(Ordering::Relaxed);
        let mut plan = BatchPlan {
            issued: IssuedBatch { queue: batch.queue, num_batch: 0, count: batch.num, ..Default::default() },
            dmas: [None; MAX_BATCH],
            ndmas: 0,
            lso: Vec::new(),
        };
        for desc in descs {
            if !info.in_continuation() {
                continue;
            }
            let buf = info.curr_buf.load(Ordering::Acquire);
            let offset = info.offset.fetch_add(u32::from(desc.dma_len), Ordering::Relaxed);
            if desc.dma_len != 0 && buf != 0 {
                plan.dmas[plan.ndmas] = Some(DmaDescriptor {
                    direction: DmaDirection::FromHost,
                    pcie_addr: desc.dma_addr & DMA_ADDR_MASK,
                    cpp_addr: data_addr(buf, offset),
                    length: (u32::from(desc.dma_len) + 3) & !3,
                    rid,
                    completion: DmaCompletion::Ignore,
                });
                plan.ndmas += 1;
            }
            if desc.eop {
                if let Some(buf) = info.take_continuation() {
                    debug!("issue_dma {}: queue {} flushed, releasing buffer {:#x}", self.lane.id, batch.queue, buf);
                    self.pool.free(buf);
                }
                self.draining.clear(batch.queue);
            }
        }
        plan
    }

    /// Where a packet starts relative to its buffer. Metadata longer than the
    /// data offset puts the start ahead of the buffer, as a negative offset.
    fn packet_start(&self, desc: &TxDesc) -> u32 {
        self.data_offset.wrapping_sub(u32::from(desc.offset))
    }

    /// Starts a packet that spans several descriptors in `buf`.
    ///
    /// A teardown racing with this may have seen no continuation, so the
    /// queue's up state is re-read once the continuation is visible.
    fn start_continuation(&self, natq: u8, buf: BufAddr, offset: u32, pkt_offset: u8) {
        let info = &self.queues[natq as usize];
        info.curr_buf.store(buf, Ordering::Relaxed);
        info.offset.store(offset, Ordering::Relaxed);
        info.pkt_offset.store(pkt_offset, Ordering::Relaxed);
        info.cont.store(true, Ordering::SeqCst);
        if !info.up.load(Ordering::SeqCst) {
            debug!("issue_dma {}: queue {} went down as its packet started", self.lane.id, natq);
            self.hold_until_drained(natq);
        }
    }

    /// Keeps a downed queue's continuation buffer until every batch gather
    /// has issued for the lane so far is processed.
    fn hold_until_drained(&self, natq: u8) {
        let drain_seq = self.lane.gather_issued.get();
        self.queues[natq as usize].drain_seq.store(drain_seq, Ordering::Release);
        self.draining.set(natq);
    }

    fn refill_precache(&self) {
        while !self.precache.is_full() {
            match self.pool.alloc() {
                Some(buf) => {
                    if let Err(buf) = self.precache.put(buf) {
                        self.pool.free(buf);
                        break;
                    }
                }
                None => break,
            }
        }
    }

    /// Reopens the issue window as far as notify's progress and the buffers
    /// at hand allow.
    pub(crate) fn compute_seq_safe(&self) {
        self.refill_precache();
        let issued = self.data_issued.get();
        let ring_room = self
            .data_served
            .get()
            .wrapping_add(self.lane.issued_ring.capacity() as u32)
            .wrapping_sub(issued) as i32;
        let by_bufs = (self.precache.len() / MAX_BATCH) as i32;
        let window = ring_room.min(by_bufs).max(0) as u32;
        self.data_safe.set(issued.wrapping_add(window));
        trace!("issue_dma {}: safe window {} (issued {})", self.lane.id, window, issued);
    }

    /// Releases the buffers of downed queues whose in-flight batches have all
    /// been processed.
    fn release_drained(&self) -> Progress {
        if self.draining.is_empty() {
            return Progress::Idle;
        }
        let done = self.batches_done.get();
        let mut progress = Progress::Idle;
        for natq in self.draining.iter() {
            let info = &self.queues[natq as usize];
            if dma_seqn::reached(done, info.drain_seq.load(Ordering::Acquire)) {
                self.draining.clear(natq);
                if let Some(buf) = info.take_continuation() {
                    debug!("issue_dma {}: queue {} drained, releasing buffer {:#x}", self.lane.id, natq, buf);
                    self.pool.free(buf);
                }
                progress = Progress::Worked;
            }
        }
        progress
    }

    /// Brings a queue up or down.
    ///
    /// A queue downed part way through a packet keeps its buffer until every
    /// batch gather issued for the lane so far has been processed, so
    /// [`queue`](Self::queue)`.is_idle()` may only become true later.
    pub fn vnic_setup(&self, cfg: &QueueCfg) {
        let info = &self.queues[cfg.natq as usize];
        if cfg.up {
            self.draining.clear(cfg.natq);
            if let Some(buf) = info.take_continuation() {
                self.pool.free(buf);
            }
            info.rid.store(cfg.rid, Ordering::Relaxed);
            info.up.store(true, Ordering::Release);
            return;
        }

        info.up.store(false, Ordering::SeqCst);
        info.rid.store(0, Ordering::Relaxed);
        if !info.cont.load(Ordering::SeqCst) {
            return;
        }
        let drain_seq = self.lane.gather_issued.get();
        if dma_seqn::reached(self.batches_done.get(), drain_seq) {
            if let Some(buf) = info.take_continuation() {
                self.pool.free(buf);
            }
        } else {
            debug!("issue_dma {}: queue {} down mid-packet, draining to batch {}",
                self.lane.id, cfg.natq, drain_seq);
            self.hold_until_drained(cfg.natq);
        }
    }
}

/// The local address `offset` bytes into `buf`, with `offset` read as
/// signed.
fn data_addr(buf: BufAddr, offset: u32) -> u64 {
    buf_cpp_addr(buf).wrapping_add(offset as i32 as i64 as u64)
}

#[cfg(test)]
mod tests {
    extern crate std;

    use super::*;
    use crate::test_rig::{packet, Rig, FIRST_BUF};
    use nfd_hw::{QcQueue, QueueKind};
    use std::vec::Vec;

    fn one_lane() -> PciInConfig {
        PciInConfig { lanes: 1, ..Default::default() }
    }

    /// A descriptor that is not the end of its packet.
    fn fragment(rig: &Rig, addr: u64, len: u16, fill: u8) -> TxDesc {
        TxDesc { eop: false, ..packet(&rig.host, addr, len, fill) }
    }

    /// Runs gather until the posted descriptors are batched and their
    /// descriptor DMAs are complete, without running the later stages.
    fn gather_only(rig: &mut Rig) {
        for _ in 0..4 {
            rig.pci_in.gather.step();
            rig.dma.complete_all();
        }
    }

    #[test]
    fn test_bad_batch_size_halts() {
        let mut rig = Rig::new(one_lane());
        let stages = rig.pci_in.lanes[0].clone();
        stages.lane.batch_ring.put(BatchDesc { queue: 0, num: 7 }.to_word()).unwrap();
        stages.lane.gather_compl.reflect(1);
        let ctx = &mut rig.issue_ctxs[0][0];
        assert_eq!(
            stages.issue.step(ctx),
            Err(Halt::BatchSize { stage: Stage::IssueDma, size: 7 })
        );
    }

    #[test]
    fn test_empty_handoff_ring_halts() {
        let mut rig = Rig::new(one_lane());
        let stages = rig.pci_in.lanes[0].clone();
        stages.lane.gather_compl.reflect(1);
        let ctx = &mut rig.issue_ctxs[0][0];
        assert_eq!(
            stages.issue.step(ctx),
            Err(Halt::HandoffRingEmpty { stage: Stage::IssueDma })
        );
    }

    #[test]
    fn test_idle_without_gathered_batches() {
        let mut rig = Rig::new(one_lane());
        let stages = rig.pci_in.lanes[0].clone();
        for ctx in rig.issue_ctxs[0].iter_mut() {
            assert_ne!(stages.issue.step(ctx), Ok(Progress::Worked));
            assert!(!ctx.is_busy());
        }
    }

    #[test]
    fn test_safe_window() {
        let rig = Rig::new(PciInConfig { lanes: 1, issued_ring_size: 4, ..Default::default() });
        let issue = &rig.pci_in.lanes[0].issue;
        assert_eq!(issue.precached(), 32);
        issue.compute_seq_safe();
        assert_eq!(issue.data_safe(), 4);

        let rig = Rig::new(one_lane());
        let issue = &rig.pci_in.lanes[0].issue;
        issue.compute_seq_safe();
        // Eight batches of four fresh packets fit in the precache.
        assert_eq!(issue.data_safe(), 8);
    }

    #[test]
    fn test_safe_window_holds_issue() {
        let mut rig = Rig::new(PciInConfig { lanes: 1, issued_ring_size: 2, ..Default::default() });
        let descs: Vec<TxDesc> = (0..12u64).map(|i| packet(&rig.host, 0x8000_0000 + i * 0x100, 60, i as u8)).collect();
        rig.up(0);
        rig.post(0, &descs);
        gather_only(&mut rig);

        let stages = rig.pci_in.lanes[0].clone();
        for ctx in rig.issue_ctxs[0].iter_mut() {
            let _ = stages.issue.step(ctx);
        }
        // Notify has served nothing, so only two batches may be issued.
        assert_eq!(stages.issue.data_issued(), 2);
        assert_eq!(stages.lane.issued_ring.len(), 2);

        rig.run().unwrap();
        assert_eq!(rig.wq.messages(0).len(), 12);
    }

    #[test]
    fn test_single_packet_fast_path() {
        let mut rig = Rig::new(one_lane());
        let desc = packet(&rig.host, 0x8000_0000, 60, 0xab);
        rig.up(0);
        rig.post(0, &[desc]);
        rig.run().unwrap();

        let data = rig.dma.completed_on(DmaQueue::TxData(0));
        assert_eq!(data.len(), 1);
        assert_eq!(data[0].length, 60);
        assert_eq!(data[0].rid, 1);
        assert_eq!(
            data[0].completion,
            DmaCompletion::Event { stream: EventStream::TxData(0), seqn: 1 }
        );
        assert_eq!(rig.packet_bytes(FIRST_BUF, 0, 60), std::vec![0xab; 60]);
    }

    #[test]
    fn test_metadata_offset() {
        let mut rig = Rig::new(one_lane());
        let desc = TxDesc { offset: 16, ..packet(&rig.host, 0x8000_0000, 40, 0x11) };
        rig.up(0);
        rig.post(0, &[desc]);
        rig.run().unwrap();

        let data = rig.dma.completed_on(DmaQueue::TxData(0));
        assert_eq!(data[0].cpp_addr, buf_cpp_addr(FIRST_BUF) + 64 - 16);
        assert_eq!(rig.wq.messages(0)[0].offset, 16);
    }

    #[test]
    fn test_one_event_per_batch() {
        let mut rig = Rig::new(one_lane());
        let descs: Vec<TxDesc> = (0..4u64).map(|i| packet(&rig.host, 0x8000_0000 + i * 0x100, 64, 1)).collect();
        rig.up(0);
        rig.post(0, &descs);
        rig.run().unwrap();

        let data = rig.dma.completed_on(DmaQueue::TxData(0));
        assert_eq!(data.len(), 4);
        assert!(data[..3].iter().all(|d| d.completion == DmaCompletion::Ignore));
        assert_ne!(data[3].completion, DmaCompletion::Ignore);
        let bufs: Vec<u32> = rig.wq.messages(0).iter().map(|m| m.buf_addr).collect();
        assert_eq!(bufs, [FIRST_BUF, FIRST_BUF + 1, FIRST_BUF + 2, FIRST_BUF + 3]);
    }

    #[test]
    fn test_multi_descriptor_packet() {
        let mut rig = Rig::new(one_lane());
        let descs = [
            fragment(&rig, 0x8000_0000, 100, 0xa),
            fragment(&rig, 0x8000_1000, 50, 0xb),
            TxDesc { data_len: 180, ..packet(&rig.host, 0x8000_2000, 30, 0xc) },
        ];
        rig.up(0);
        rig.post(0, &descs);
        rig.run().unwrap();

        let msgs = rig.wq.messages(0);
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].buf_addr, FIRST_BUF);
        assert_eq!(msgs[0].data_len, 180);

        let bytes = rig.packet_bytes(FIRST_BUF, 0, 180);
        assert!(bytes[..100].iter().all(|&b| b == 0xa));
        assert!(bytes[100..150].iter().all(|&b| b == 0xb));
        assert!(bytes[150..].iter().all(|&b| b == 0xc));

        // Mid-packet writes are word sized.
        let data = rig.dma.completed_on(DmaQueue::TxData(0));
        assert_eq!(data[1].length, 52);
        assert!(rig.pci_in.lanes[0].issue.queue(0).is_up());
        assert!(!rig.pci_in.lanes[0].issue.queue(0).in_continuation());
        assert_eq!(rig.qc.read_ptr(QcQueue::new(0, QueueKind::Tx)), 3);
    }

    #[test]
    fn test_down_after_packet_start_releases_at_once() {
        let mut rig = Rig::new(one_lane());
        let first = fragment(&rig, 0x8000_0000, 100, 0xa);
        rig.up(0);
        rig.post(0, &[first]);
        rig.run().unwrap();
        let issue = rig.pci_in.lanes[0].issue.clone();
        assert!(issue.queue(0).in_continuation());

        rig.down(0);
        assert!(!issue.is_draining(0));
        assert_eq!(rig.pool.returned(), [FIRST_BUF]);
        assert!(rig.pci_in.queue_is_idle(0));
    }

    #[test]
    fn test_down_mid_continuation_flushes_then_releases() {
        let mut rig = Rig::new(one_lane());
        let first = fragment(&rig, 0x8000_0000, 100, 0xa);
        let last = TxDesc { data_len: 140, ..packet(&rig.host, 0x8000_1000, 40, 0xb) };
        rig.up(0);
        rig.post(0, &[first]);
        rig.run().unwrap();

        // The packet's last descriptor is gathered but not yet issued when
        // the queue goes down.
        rig.post(0, &[last]);
        gather_only(&mut rig);
        let tx = QcQueue::new(0, QueueKind::Tx);
        assert_eq!(rig.qc.read_ptr(tx), 1);
        rig.down(0);
        // Teardown resets the queue controller's pointers.
        assert_eq!(rig.qc.read_ptr(tx), 0);
        let issue = rig.pci_in.lanes[0].issue.clone();
        assert!(issue.is_draining(0));
        assert!(rig.pool.returned().is_empty());
        assert!(!rig.pci_in.queue_is_idle(0));

        rig.run().unwrap();
        let bytes = rig.packet_bytes(FIRST_BUF, 0, 140);
        assert!(bytes[..100].iter().all(|&b| b == 0xa));
        assert!(bytes[100..].iter().all(|&b| b == 0xb));
        assert_eq!(rig.pool.returned(), [FIRST_BUF]);
        assert!(!issue.is_draining(0));
        assert!(rig.pci_in.queue_is_idle(0));

        // Nothing is notified for the downed packet and its descriptor is not
        // returned to the host.
        assert!(rig.wq.messages(0).is_empty());
        assert_eq!(rig.qc.read_ptr(tx), 0);
    }

    #[test]
    fn test_down_as_packet_starts_holds_buffer_until_drained() {
        let mut rig = Rig::new(one_lane());
        rig.up(0);
        rig.down(0);
        let issue = rig.pci_in.lanes[0].issue.clone();

        // The teardown found no continuation, but one starts right after.
        issue.start_continuation(0, FIRST_BUF + 100, 64, 0);
        assert!(issue.is_draining(0));
        assert!(!rig.pci_in.queue_is_idle(0));

        rig.run().unwrap();
        assert!(!issue.is_draining(0));
        assert_eq!(rig.pool.returned(), [FIRST_BUF + 100]);
        assert!(rig.pci_in.queue_is_idle(0));
    }

    #[test]
    fn test_metadata_longer_than_data_offset() {
        let mut rig = Rig::new(one_lane());
        let descs = [
            TxDesc { offset: 100, ..fragment(&rig, 0x8000_0000, 40, 0xa) },
            TxDesc { data_len: 80, ..packet(&rig.host, 0x8000_1000, 40, 0xb) },
        ];
        rig.up(0);
        rig.post(0, &descs);
        rig.run().unwrap();

        // The packet starts 36 bytes ahead of its buffer.
        let data = rig.dma.completed_on(DmaQueue::TxData(0));
        assert_eq!(data.len(), 2);
        assert_eq!(data[0].cpp_addr, buf_cpp_addr(FIRST_BUF) - 36);
        assert_eq!(data[1].cpp_addr, buf_cpp_addr(FIRST_BUF) + 4);

        let msgs = rig.wq.messages(0);
        assert_eq!(msgs.len(), 1);
        assert_eq!((msgs[0].offset, msgs[0].data_len), (100, 80));
        let bytes = rig.packet_bytes(FIRST_BUF, 100, 80);
        assert!(bytes[..40].iter().all(|&b| b == 0xa));
        assert!(bytes[40..].iter().all(|&b| b == 0xb));

        // The same holds for a single-descriptor packet.
        let whole = TxDesc { offset: 127, ..packet(&rig.host, 0x8000_2000, 60, 0xc) };
        rig.post(0, &[whole]);
        rig.run().unwrap();
        let data = rig.dma.completed_on(DmaQueue::TxData(0));
        assert_eq!(data[2].cpp_addr, buf_cpp_addr(FIRST_BUF + 1) - 63);
    }

    #[test]
    fn test_down_queue_batch_is_signal_only() {
        let mut rig = Rig::new(one_lane());
        let desc = packet(&rig.host, 0x8000_0000, 60, 1);
        rig.up(0);
        rig.post(0, &[desc]);
        gather_only(&mut rig);
        rig.down(0);
        rig.run().unwrap();

        let data = rig.dma.completed_on(DmaQueue::TxData(0));
        assert_eq!(data.len(), 1);
        assert_eq!(data[0].direction, DmaDirection::SignalOnly);
        assert!(rig.wq.messages(0).is_empty());
        assert_eq!(rig.pci_in.lanes[0].issue.data_compl(), 1);
        assert_eq!(rig.pci_in.lanes[0].notify.served(), 1);
    }

    #[test]
    fn test_lso_segments() {
        let desc = TxDesc {
            eop: true,
            flags: nfd_hw::desc::TX_FLAG_LSO,
            mss: 100,
            lso_hdrlen: 54,
            data_len: 354,
            ..Default::default()
        };
        assert_eq!(IssueDma::lso_segment_count(&desc, 256), Some(3));
        assert_eq!(IssueDma::lso_segment_count(&desc, 2), None);
        assert_eq!(IssueDma::lso_segment_count(&TxDesc { mss: 0, ..desc }, 256), None);
        assert_eq!(IssueDma::lso_segment_count(&TxDesc { eop: false, ..desc }, 256), None);
        assert_eq!(IssueDma::lso_segment_count(&TxDesc { mss: 1, data_len: 400, ..desc }, 4096), None);
        assert_eq!(IssueDma::buffers_needed(&[desc, desc], false), 2);
        assert_eq!(IssueDma::buffers_needed(&[TxDesc::default(), desc], true), 0);
    }
}
