use alloc::{sync::Arc, vec::Vec};
use core::sync::atomic::Ordering;
use dma_seqn::{reached, SeqCounter};
use nfd_cfg::{config::MAX_BATCH_SZ, PciOutConfig};
use nfd_hw::{
    desc::RxDesc, CompletionEvents, DmaCompletion, DmaDescriptor, DmaDirection, DmaEngine, DmaQueue,
    EventStream, Hw,
};
use nfd_sync::{halted, Halt, Progress, ReorderStage, Stage};

use crate::{desc::DescBatchMsg, RxPath};

/// The RX descriptor write-back stage.
///
/// Batches are served in staging order once their payload DMAs completed,
/// so the host never sees a descriptor before its data. Every sent
/// descriptor is its own DMA, carrying its sequence number on the `RxDesc`
/// event stream, and the number of those in flight is bounded.
pub struct SendDesc {
    pub(crate) path: Arc<RxPath>,
    contexts: usize,
    pub(crate) max_in_flight: u32,
    dma: Arc<dyn DmaEngine>,
    pub(crate) events: Arc<dyn CompletionEvents>,
    order: ReorderStage,
    /// Packets whose staging slot was consumed.
    sent_pkts: SeqCounter,
    pub(crate) desc_dma_issued: SeqCounter,
    pub(crate) desc_dma_compl: SeqCounter,
    /// Descriptor DMAs that may be issued before more complete.
    pub(crate) desc_dma_safe: SeqCounter,
}

/// The registers of one send_desc context.
#[derive(Debug)]
pub struct SendDescCtx {
    slot: usize,
}

impl SendDescCtx {
    pub fn slot(&self) -> usize {
        self.slot
    }
}

impl SendDesc {
    pub(crate) fn new(cfg: &PciOutConfig, hw: &Hw, path: Arc<RxPath>) -> SendDesc {
        SendDesc {
            path,
            contexts: cfg.send_contexts,
            max_in_flight: cfg.desc_max_in_flight,
            dma: hw.dma.clone(),
            events: hw.events.clone(),
            order: ReorderStage::new(cfg.send_contexts),
            sent_pkts: SeqCounter::new(0),
            desc_dma_issued: SeqCounter::new(0),
            desc_dma_compl: SeqCounter::new(0),
            desc_dma_safe: SeqCounter::new(cfg.desc_max_in_flight - MAX_BATCH_SZ),
        }
    }

    pub fn contexts(&self) -> Vec<SendDescCtx> {
        (0..self.contexts).map(|slot| SendDescCtx { slot }).collect()
    }

    pub fn desc_dma_issued(&self) -> u32 {
        self.desc_dma_issued.get()
    }

    pub fn desc_dma_compl(&self) -> u32 {
        self.desc_dma_compl.get()
    }

    /// One step of context `ctx`. Context 0 also runs the sequence
    /// distribution.
    pub fn step(&self, ctx: &mut SendDescCtx) -> Result<Progress, Halt> {
        let progress = if ctx.slot == 0 { self.distr() } else { Progress::Idle };
        if !self.order.test(ctx.slot) {
            return Ok(progress.or(Progress::Blocked));
        }
        // A batch issues at most four descriptors, which the safe mark leaves
        // room for.
        if reached(self.desc_dma_issued.get(), self.desc_dma_safe.get()) {
            return Ok(progress.or(Progress::Blocked));
        }
        let served = self.path.desc_batch_served.get();
        if served == self.path.data_dma_compl.get() {
            return Ok(progress);
        }

        let batch = served.wrapping_add(1);
        let msg = DescBatchMsg::from_word(self.path.desc_msg(batch).load(Ordering::Acquire));
        if msg.num == 0 || u32::from(msg.num) > MAX_BATCH_SZ {
            return Err(halted(Halt::BatchSize { stage: Stage::SendDesc, size: msg.num }));
        }
        // The message is read: stage_batch may reuse its slot.
        self.path.desc_batch_served.set(batch);

        for i in 0..msg.num as usize {
            let index = self.sent_pkts.get();
            self.sent_pkts.increment();
            if !msg.send[i] {
                continue;
            }
            let info = self.path.queue(msg.queue[i]);
            if !info.is_up() {
                continue;
            }
            let seq = self.desc_dma_issued.increment();
            let rx_w = info.rx_w.load(Ordering::Acquire);
            let descr = DmaDescriptor {
                direction: DmaDirection::ToHost,
                pcie_addr: info.ring_addr(rx_w),
                cpp_addr: self.path.staging_addr(index),
                length: RxDesc::SIZE as u32,
                rid: info.rid(),
                completion: DmaCompletion::Event { stream: EventStream::RxDesc, seqn: seq },
            };
            info.rx_w.store(rx_w.wrapping_add(1), Ordering::Release);
            self.dma.enqueue(DmaQueue::RxDesc, &descr);
        }
        trace!("send_desc: batch {} of {} served", batch, msg.num);

        self.order.done(ctx.slot);
        Ok(Progress::Worked)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        desc::RxPkt,
        test_rig::{Rig, FIRST_BUF},
    };
    use nfd_hw::read_array;

    /// Stages and issues everything submitted so far, without completing
    /// any payload DMA.
    fn stage_and_issue(rig: &Rig) {
        let mut stage_ctxs = rig.pci_out.stage.contexts();
        let mut rx_ctxs = rig.pci_out.rx_dma.contexts();
        for _ in 0..4 {
            for ctx in stage_ctxs.iter_mut() {
                rig.pci_out.stage.step(ctx);
            }
        }
        for _ in 0..4 {
            for ctx in rx_ctxs.iter_mut() {
                let _ = rig.pci_out.rx_dma.step(ctx);
            }
        }
    }

    fn ready_rig(cfg: PciOutConfig, natq: u8) -> Rig {
        let mut rig = Rig::new(cfg);
        rig.up(natq);
        rig.post_buffers(natq, 32);
        rig.fill_cache();
        rig
    }

    #[test]
    fn test_waits_for_payload() {
        let rig = ready_rig(PciOutConfig::default(), 1);
        rig.pci_out.submit(RxPkt::new(1, FIRST_BUF, 0, 64)).unwrap();
        stage_and_issue(&rig);

        let send = &rig.pci_out.send;
        let mut ctxs = send.contexts();
        assert_eq!(send.step(&mut ctxs[0]), Ok(Progress::Idle));
        assert!(rig.dma.completed_on(DmaQueue::RxDesc).is_empty());

        rig.dma.complete_all();
        assert_eq!(send.step(&mut ctxs[0]), Ok(Progress::Worked));
        assert_eq!(send.desc_dma_issued(), 1);
        assert_eq!(rig.pci_out.path.desc_batch_served.get(), 1);

        rig.dma.complete_all();
        let descs = rig.dma.completed_on(DmaQueue::RxDesc);
        assert_eq!(descs.len(), 1);
        assert_eq!(descs[0].pcie_addr, rig.ring_entry(1, 0));
        assert_eq!(descs[0].cpp_addr, rig.pci_out.path.staging_addr(0));
        assert_eq!(descs[0].length, 8);
        assert_eq!(descs[0].completion, DmaCompletion::Event { stream: EventStream::RxDesc, seqn: 1 });

        let written = RxDesc::from_bytes(&read_array::<8>(&*rig.host, rig.ring_entry(1, 0)));
        assert!(written.dd);
        assert_eq!(written.data_len, 64);
    }

    #[test]
    fn test_skipped_packets_keep_staging_order() {
        let rig = ready_rig(PciOutConfig::default(), 1);
        rig.pci_out.submit(RxPkt::new(8, FIRST_BUF, 0, 64)).unwrap();
        rig.pci_out.submit(RxPkt::new(1, FIRST_BUF + 1, 0, 99)).unwrap();
        stage_and_issue(&rig);
        rig.dma.complete_all();

        let send = &rig.pci_out.send;
        let mut ctxs = send.contexts();
        assert_eq!(send.step(&mut ctxs[0]), Ok(Progress::Worked));
        rig.dma.complete_all();
        let descs = rig.dma.completed_on(DmaQueue::RxDesc);
        assert_eq!(descs.len(), 1);
        assert_eq!(descs[0].cpp_addr, rig.pci_out.path.staging_addr(1));
        assert_eq!(descs[0].pcie_addr, rig.ring_entry(1, 0));
    }

    #[test]
    fn test_descriptor_window() {
        let cfg = PciOutConfig { desc_max_in_flight: 5, ..Default::default() };
        let rig = ready_rig(cfg, 1);
        for i in 0..8u32 {
            rig.pci_out.submit(RxPkt::new(1, FIRST_BUF + i, 0, 64)).unwrap();
        }
        stage_and_issue(&rig);
        rig.dma.complete_all();

        let send = &rig.pci_out.send;
        let mut ctxs = send.contexts();
        assert_eq!(send.step(&mut ctxs[0]), Ok(Progress::Worked));
        assert_eq!(send.desc_dma_issued(), 4);
        assert_eq!(send.step(&mut ctxs[1]), Ok(Progress::Blocked));

        rig.dma.complete_all();
        assert_eq!(send.step(&mut ctxs[0]), Ok(Progress::Worked));
        assert_eq!(send.desc_dma_compl(), 4);
        assert_eq!(send.step(&mut ctxs[1]), Ok(Progress::Worked));
        assert_eq!(send.desc_dma_issued(), 8);
    }

    #[test]
    fn test_bad_message_halts() {
        let rig = Rig::new(PciOutConfig::default());
        rig.pci_out.path.data_dma_compl.set(1);
        let send = &rig.pci_out.send;
        let mut ctxs = send.contexts();
        assert_eq!(send.step(&mut ctxs[0]), Err(Halt::BatchSize { stage: Stage::SendDesc, size: 0 }));
    }
}
