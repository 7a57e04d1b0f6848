use alloc::{sync::Arc, vec::Vec};
use core::sync::atomic::Ordering;
use dma_seqn::SeqCounter;
use nfd_cfg::{config::MAX_BATCH_SZ, PciOutConfig};
use nfd_sync::{Progress, ReorderStage};

use crate::{
    desc::{DescBatchMsg, RxDataBatch, RxDataDesc, RxPkt},
    RxPath,
};

const MAX_BATCH: usize = MAX_BATCH_SZ as usize;

/// The batch staging stage.
///
/// A group of contexts takes offered packets in batches of up to four. Each
/// batch passes two ordering tokens: one for taking packets off the input
/// ring and one for staging them. Staging assigns every packet the next
/// cached free-list entry of its queue, so it runs in input order, and holds
/// a packet whose queue has no cached entry until cache_desc fetches one.
pub struct StageBatch {
    path: Arc<RxPath>,
    contexts: usize,
    soft_thresh: u32,
    desc_batch_ring: u32,
    get_order: ReorderStage,
    put_order: ReorderStage,
    /// Batches staged.
    batch_issued: SeqCounter,
    /// Batches that may be staged before send_desc serves more.
    batch_safe: SeqCounter,
    /// Packets staged, the index of the next staging slot.
    staged: SeqCounter,
}

#[derive(Clone, Copy, Debug)]
enum StagePhase {
    /// Waiting to take the next packets.
    Get,
    /// Holding `num` packets; the first `next` of them are staged.
    Put { pkts: [RxPkt; MAX_BATCH], num: u8, next: u8, msg: DescBatchMsg, data: RxDataBatch },
}

/// The registers of one stage_batch context.
#[derive(Debug)]
pub struct StageBatchCtx {
    slot: usize,
    phase: StagePhase,
}

impl StageBatchCtx {
    pub fn slot(&self) -> usize {
        self.slot
    }

    /// Returns `true` while the context holds packets it has not staged.
    pub fn is_busy(&self) -> bool {
        matches!(self.phase, StagePhase::Put { num, .. } if num != 0)
    }
}

impl StageBatch {
    pub(crate) fn new(cfg: &PciOutConfig, path: Arc<RxPath>) -> StageBatch {
        StageBatch {
            path,
            contexts: cfg.stage_contexts,
            soft_thresh: cfg.fl_soft_thresh,
            desc_batch_ring: cfg.desc_batch_ring,
            get_order: ReorderStage::new(cfg.stage_contexts),
            put_order: ReorderStage::new(cfg.stage_contexts),
            batch_issued: SeqCounter::new(0),
            batch_safe: SeqCounter::new(cfg.desc_batch_ring),
            staged: SeqCounter::new(0),
        }
    }

    pub fn contexts(&self) -> Vec<StageBatchCtx> {
        (0..self.contexts)
            .map(|slot| StageBatchCtx { slot, phase: StagePhase::Get })
            .collect()
    }

    pub fn batch_issued(&self) -> u32 {
        self.batch_issued.get()
    }

    pub fn staged(&self) -> u32 {
        self.staged.get()
    }

    pub fn step(&self, ctx: &mut StageBatchCtx) -> Progress {
        let mut progress = Progress::Idle;
        if let StagePhase::Get = ctx.phase {
            progress = self.get(ctx);
            if progress == Progress::Blocked {
                return progress;
            }
        }
        progress.or(self.put(ctx))
    }

    /// Takes up to four packets off the input ring. An empty take still
    /// passes both tokens, so the contexts behind this one are not held up.
    fn get(&self, ctx: &mut StageBatchCtx) -> Progress {
        if !self.get_order.test(ctx.slot) {
            return Progress::Blocked;
        }
        let mut taken = [None; MAX_BATCH];
        let num = self.path.input.get_freely(&mut taken);
        let mut pkts = [RxPkt::default(); MAX_BATCH];
        for (pkt, slot) in pkts.iter_mut().zip(taken.iter()) {
            if let Some(taken) = slot {
                *pkt = *taken;
            }
        }
        ctx.phase = StagePhase::Put {
            pkts,
            num: num as u8,
            next: 0,
            msg: DescBatchMsg::default(),
            data: RxDataBatch::default(),
        };
        self.get_order.done(ctx.slot);
        if num == 0 {
            Progress::Idle
        } else {
            Progress::Worked
        }
    }

    fn put(&self, ctx: &mut StageBatchCtx) -> Progress {
        let StagePhase::Put { pkts, num, next, msg, data } = &mut ctx.phase else {
            return Progress::Idle;
        };
        if !self.put_order.test(ctx.slot) {
            return Progress::Blocked;
        }
        if *num == 0 {
            ctx.phase = StagePhase::Get;
            self.put_order.done(ctx.slot);
            return Progress::Idle;
        }
        if self.batch_issued.get() == self.batch_safe.get() {
            let served = self.path.desc_batch_served.get();
            self.batch_safe.set(served.wrapping_add(self.desc_batch_ring));
            if self.batch_issued.get() == self.batch_safe.get() {
                return Progress::Blocked;
            }
        }
        if self.path.data_ring.is_full() {
            return Progress::Blocked;
        }

        let start = *next;
        while *next < *num {
            let i = *next as usize;
            let pkt = &pkts[i];
            let info = self.path.queue(pkt.queue);
            let avail = info.fl_avail();
            if avail < self.soft_thresh {
                self.path.urgent.set(pkt.queue);
            }
            let up = info.is_up();
            if avail == 0 && up {
                // Head of line: nothing behind this packet may pass it.
                return if *next == start { Progress::Blocked } else { Progress::Worked };
            }

            let fl_u = info.fl_u.load(Ordering::Acquire);
            let eop = pkt.eop && up;
            data.pkts[i] = RxDataDesc {
                queue: pkt.queue,
                buf: pkt.buf,
                offset: pkt.offset,
                seg_len: pkt.seg_len,
                fl_cache_addr: self.path.fl_cache.addr(pkt.queue, fl_u),
                rid: info.rid(),
                sop: pkt.sop && up,
                eop: pkt.eop,
                down: !up,
            };
            if eop {
                info.fl_u.store(fl_u.wrapping_add(1), Ordering::Release);
            }
            msg.send[i] = eop;
            msg.queue[i] = pkt.queue;

            let index = self.staged.get();
            self.path.local.write(self.path.staging_addr(index), &pkt.rx_desc().to_bytes());
            self.staged.increment();
            *next += 1;
        }

        msg.num = *num;
        data.num = *num;
        let batch = self.batch_issued.get().wrapping_add(1);
        self.path.desc_msg(batch).store(msg.to_word(), Ordering::Release);
        // Only the token holder puts, and room was checked above.
        let _ = self.path.data_ring.put(*data);
        self.batch_issued.set(batch);
        trace!("stage_batch: batch {} of {} staged", batch, num);

        ctx.phase = StagePhase::Get;
        self.put_order.done(ctx.slot);
        Progress::Worked
    }
}
