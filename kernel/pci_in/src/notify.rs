use alloc::{sync::Arc, vec::Vec};
use core::sync::atomic::{AtomicU32, Ordering};
use dma_seqn::SeqCounter;
use nfd_cfg::PciInConfig;
use nfd_hw::{desc::PktDesc, Hw, QcQueue, QueueController, QueueKind, WorkQueue};
use nfd_sync::{halted, Halt, Progress, ReorderStage, Signal, Stage};

use crate::{
    desc::{IssuedBatch, IssuedDesc},
    Lane,
};

/// The notification stage of one lane.
///
/// Contexts take issued batches in order once their payload DMAs are done
/// (the *get* checkpoint), then, again in order, send one work-queue message
/// per finished packet and return the batch's descriptors to the host (the
/// *msg* checkpoint).
pub struct Notify {
    pub(crate) lane: Arc<Lane>,
    contexts: usize,
    intf: u8,
    wq_mask: u8,
    add_seqn: bool,
    wq: Arc<dyn WorkQueue>,
    qc: Arc<dyn QueueController>,
    get_order: ReorderStage,
    msg_order: ReorderStage,
    /// Payload batches complete, as last reflected by issue_dma.
    pub(crate) compl: SeqCounter,
    /// Batches taken off the issued ring.
    pub(crate) served: SeqCounter,
    /// The served count last reflected to issue_dma.
    pub(crate) sent: AtomicU32,
    seqns: Vec<AtomicU32>,
}

#[derive(Clone, Copy, Debug)]
enum NotifyPhase {
    Get,
    /// Waiting for, or partway through, the msg checkpoint. `batch` is
    /// `None` when the get checkpoint found nothing to take.
    Msg { batch: Option<IssuedBatch>, pkt: usize, lso_sent: u8 },
}

/// The registers of one notify context.
#[derive(Debug)]
pub struct NotifyCtx {
    slot: usize,
    phase: NotifyPhase,
    /// Raised when the context's last work-queue add is enqueued.
    sig: Signal,
    waiting: bool,
}

impl NotifyCtx {
    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn is_busy(&self) -> bool {
        !matches!(self.phase, NotifyPhase::Get)
    }
}

impl Notify {
    pub(crate) fn new(cfg: &PciInConfig, hw: &Hw, lane: Arc<Lane>) -> Notify {
        Notify {
            lane,
            contexts: cfg.notify_contexts,
            intf: cfg.intf,
            wq_mask: cfg.num_wqs.wrapping_sub(1),
            add_seqn: cfg.add_seqn,
            wq: hw.wq.clone(),
            qc: hw.qc.clone(),
            get_order: ReorderStage::new(cfg.notify_contexts),
            msg_order: ReorderStage::new(cfg.notify_contexts),
            compl: SeqCounter::new(0),
            served: SeqCounter::new(0),
            sent: AtomicU32::new(0),
            seqns: (0..cfg.num_wqs).map(|_| AtomicU32::new(0)).collect(),
        }
    }

    pub fn contexts(&self) -> Vec<NotifyCtx> {
        (0..self.contexts)
            .map(|slot| NotifyCtx { slot, phase: NotifyPhase::Get, sig: Signal::new(), waiting: false })
            .collect()
    }

    pub fn served(&self) -> u32 {
        self.served.get()
    }

    pub fn compl(&self) -> u32 {
        self.compl.get()
    }

    /// One step of context `ctx`. Context 0 also runs the lane's sequence
    /// distribution.
    pub fn step(&self, ctx: &mut NotifyCtx) -> Result<Progress, Halt> {
        let mut progress = Progress::Idle;
        if ctx.slot == 0 {
            progress = self.distr();
        }
        if let NotifyPhase::Get = ctx.phase {
            match self.get(ctx)? {
                Progress::Blocked => return Ok(progress.or(Progress::Blocked)),
                other => progress = progress.or(other),
            }
        }
        Ok(progress.or(self.send(ctx)?))
    }

    /// The get checkpoint: takes a completed batch, if there is one.
    fn get(&self, ctx: &mut NotifyCtx) -> Result<Progress, Halt> {
        if self.outstanding(ctx) {
            return Ok(Progress::Blocked);
        }
        if !self.get_order.test(ctx.slot) {
            return Ok(Progress::Blocked);
        }
        let batch = if self.compl.get() != self.served.get() {
            self.served.increment();
            let batch = self
                .lane
                .issued_ring
                .get()
                .ok_or_else(|| halted(Halt::HandoffRingEmpty { stage: Stage::Notify }))?;
            Some(batch)
        } else {
            None
        };
        ctx.phase = NotifyPhase::Msg { batch, pkt: 0, lso_sent: 0 };
        self.get_order.done(ctx.slot);
        Ok(if batch.is_some() { Progress::Worked } else { Progress::Idle })
    }

    /// The msg checkpoint. Resumes at the packet and LSO segment it stopped
    /// at when an earlier work-queue add is still outstanding.
    fn send(&self, ctx: &mut NotifyCtx) -> Result<Progress, Halt> {
        let (batch, mut pkt, mut lso_sent) = match ctx.phase {
            NotifyPhase::Msg { batch, pkt, lso_sent } => (batch, pkt, lso_sent),
            NotifyPhase::Get => return Ok(Progress::Idle),
        };
        if !self.msg_order.test(ctx.slot) {
            return Ok(Progress::Blocked);
        }
        let batch = match batch {
            Some(batch) => batch,
            None => {
                ctx.phase = NotifyPhase::Get;
                self.msg_order.done(ctx.slot);
                return Ok(Progress::Idle);
            }
        };

        while pkt < batch.count as usize {
            let desc = &batch.descs[pkt];
            if desc.lso_count > 0 {
                while lso_sent < desc.lso_count {
                    if self.outstanding(ctx) {
                        ctx.phase = NotifyPhase::Msg { batch: Some(batch), pkt, lso_sent };
                        return Ok(Progress::Blocked);
                    }
                    let seg = self.lane.lso_ring.get().ok_or_else(|| halted(Halt::LsoRingEmpty))?;
                    self.add_work(ctx, seg);
                    lso_sent += 1;
                }
                lso_sent = 0;
            } else if desc.eop {
                if self.outstanding(ctx) {
                    ctx.phase = NotifyPhase::Msg { batch: Some(batch), pkt, lso_sent };
                    return Ok(Progress::Blocked);
                }
                self.add_work(ctx, self.pkt_desc(batch.queue, desc));
            }
            pkt += 1;
        }

        if batch.num_batch > 0 {
            self.qc.add_to_read_ptr(QcQueue::new(batch.queue, QueueKind::Tx), u32::from(batch.num_batch));
        }
        trace!("notify {}: queue {} returned {} descriptors", self.lane.id, batch.queue, batch.num_batch);
        ctx.phase = NotifyPhase::Get;
        self.msg_order.done(ctx.slot);
        Ok(Progress::Worked)
    }

    /// Returns `true` while the context's previous add has not been enqueued.
    fn outstanding(&self, ctx: &mut NotifyCtx) -> bool {
        if ctx.waiting && ctx.sig.test() {
            ctx.waiting = false;
        }
        ctx.waiting
    }

    fn pkt_desc(&self, queue: u8, desc: &IssuedDesc) -> PktDesc {
        PktDesc {
            intf: self.intf,
            queue,
            offset: desc.offset,
            buf_addr: desc.buf_addr,
            data_len: desc.data_len,
            flags: desc.flags,
            vlan: desc.vlan,
            mss: desc.mss,
            lso_hdrlen: desc.lso_hdrlen,
            lso_seq: 0,
            lso_end: false,
            seqn: 0,
        }
    }

    fn add_work(&self, ctx: &mut NotifyCtx, mut msg: PktDesc) {
        let wq = msg.queue & self.wq_mask;
        if self.add_seqn {
            msg.seqn = self.seqns[wq as usize].fetch_add(1, Ordering::Relaxed);
        }
        ctx.sig.clear();
        ctx.waiting = true;
        self.wq.add_work(wq, &msg, &ctx.sig);
    }
}
