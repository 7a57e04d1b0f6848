use alloc::{sync::Arc, vec::Vec};
use nfd_cfg::{config::MAX_BATCH_SZ, PciInConfig, QueueCfg};
use nfd_hw::{
    desc::TxDesc, CompletionEvents, DmaCompletion, DmaDescriptor, DmaDirection, DmaEngine,
    DmaQueue, EventStream, Hw, QcEvent, QcQueue, QcQueueConfig, QueueController, QueueKind,
    ResetState,
};
use nfd_sync::Progress;
use queue_bitmask::{QueueBitmask, MAX_QUEUES};

use crate::{desc::BatchDesc, queue::TxQueueInfo, Lane};

/// The TX descriptor gather stage.
///
/// One context runs gather. It owns the queue table and both bitmasks:
/// *active* queues may have new descriptors and get their write pointer
/// polled, *pending* queues have descriptors known to be waiting.
pub struct Gather {
    pub(crate) cfg: PciInConfig,
    pub(crate) dma: Arc<dyn DmaEngine>,
    pub(crate) events: Arc<dyn CompletionEvents>,
    pub(crate) qc: Arc<dyn QueueController>,
    pub(crate) reset: Arc<dyn ResetState>,
    pub(crate) lanes: Vec<Arc<Lane>>,
    pub(crate) queues: Vec<TxQueueInfo>,
    pub(crate) active: QueueBitmask,
    pub(crate) pending: QueueBitmask,
    /// Descriptor DMAs issued over all lanes.
    pub(crate) dma_seq_issued: u32,
    /// Descriptor DMAs completed over all lanes.
    pub(crate) dma_seq_compl: u32,
    /// Bit `i` set: the `i`th DMA after `dma_seq_compl` belongs to lane 1.
    pub(crate) lane_list: u32,
    /// Completed DMAs per lane.
    pub(crate) lane_compl: [u32; 2],
}

impl Gather {
    pub(crate) fn new(cfg: &PciInConfig, hw: &Hw, lanes: Vec<Arc<Lane>>) -> Gather {
        Gather {
            cfg: cfg.clone(),
            dma: hw.dma.clone(),
            events: hw.events.clone(),
            qc: hw.qc.clone(),
            reset: hw.reset.clone(),
            lanes,
            queues: (0..MAX_QUEUES).map(|_| TxQueueInfo::default()).collect(),
            active: QueueBitmask::new(),
            pending: QueueBitmask::new(),
            dma_seq_issued: 0,
            dma_seq_compl: 0,
            lane_list: 0,
            lane_compl: [0; 2],
        }
    }

    pub fn queue(&self, natq: u8) -> &TxQueueInfo {
        &self.queues[natq as usize]
    }

    pub fn active(&self) -> &QueueBitmask {
        &self.active
    }

    pub fn pending(&self) -> &QueueBitmask {
        &self.pending
    }

    pub fn dma_seq_issued(&self) -> u32 {
        self.dma_seq_issued
    }

    pub fn dma_seq_compl(&self) -> u32 {
        self.dma_seq_compl
    }

    pub fn queue_is_idle(&self, natq: u8) -> bool {
        self.queue(natq).is_idle() && !self.active.contains(natq) && !self.pending.contains(natq)
    }

    /// One pass of the gather context's loop.
    pub fn step(&mut self) -> Progress {
        self.poll_queue_events();
        self.distr()
            .or(self.check_queues())
            .or(self.gather())
    }

    /// Moves queue-controller events into the active bitmask.
    pub fn poll_queue_events(&mut self) {
        let fired = self.qc.take_events(QueueKind::Tx);
        if fired != 0 {
            trace!("gather: queue events {:#x}", fired);
            self.active.set_mask(fired);
        }
    }

    /// Picks an active queue and refreshes its write pointer.
    ///
    /// Queues whose known backlog is already large are skipped, up to
    /// `max_retries` times, in favour of ones that may have run dry. Once the
    /// retries are spent the last candidate is polled anyway.
    pub fn check_queues(&mut self) -> Progress {
        let recheck_below = self.cfg.backlog_factor * MAX_BATCH_SZ;
        let mut candidate = None;
        for _ in 0..self.cfg.max_retries.max(1) {
            match self.active.select() {
                None => return Progress::Idle,
                Some(queue) => {
                    candidate = Some(queue);
                    if self.queues[queue as usize].backlog() < recheck_below {
                        break;
                    }
                }
            }
        }
        let queue = match candidate {
            Some(queue) => queue,
            None => return Progress::Idle,
        };

        let qc_queue = QcQueue::new(queue, QueueKind::Tx);
        let info = &mut self.queues[queue as usize];
        if !info.up {
            self.active.clear(queue);
            return Progress::Idle;
        }

        let status = self.qc.read_status(qc_queue);
        let inc = status.wptr.wrapping_sub(info.tx_w) & info.ring_sz_msk;
        info.tx_w = info.tx_w.wrapping_add(inc);

        if info.backlog() > self.cfg.pending_test {
            self.pending.set(queue);
        } else if !status.empty {
            // Everything posted is fetched but not yet returned to the host.
            return Progress::Idle;
        } else {
            self.active.clear(queue);
            self.qc.ping(qc_queue, QcEvent::NotEmpty);
        }
        if inc != 0 {
            trace!("gather: queue {} +{} (tx_w {}, tx_s {})", queue, inc, info.tx_w, info.tx_s);
            Progress::Worked
        } else {
            Progress::Idle
        }
    }

    /// The size of the next batch for a queue with the given pointers.
    ///
    /// Batches never straddle a `batch_window` boundary, so a batch never
    /// wraps the host ring. Whatever fits is capped at [`MAX_BATCH_SZ`].
    pub fn batch_size(window: u32, tx_w: u32, tx_s: u32) -> u32 {
        let aligned = window.wrapping_add(tx_s) & !(window - 1);
        let corr = tx_w.wrapping_sub(aligned) as i32;
        let mut upd = (window - (tx_s & (window - 1))) as i32;
        if corr < 0 {
            upd += corr;
        }
        (upd.max(0) as u32).min(MAX_BATCH_SZ)
    }

    /// Issues one descriptor batch for a pending queue, if the in-flight
    /// window and both lanes' hand-off rings have room.
    pub fn gather(&mut self) -> Progress {
        if self.reset.in_reset() {
            return Progress::Blocked;
        }
        let in_flight = dma_seqn::distance(self.dma_seq_issued, self.dma_seq_compl);
        if in_flight >= self.cfg.gather_max_in_flight {
            return Progress::Blocked;
        }
        if self.lanes.iter().any(|lane| lane.batch_ring.is_full()) {
            return Progress::Blocked;
        }
        let queue = match self.pending.select() {
            Some(queue) => queue,
            None => return Progress::Idle,
        };

        let info = self.queues[queue as usize];
        let num = Self::batch_size(self.cfg.batch_window, info.tx_w, info.tx_s);
        if num == 0 {
            self.pending.clear(queue);
            return Progress::Idle;
        }

        let lane_id = self.cfg.lane_of(queue) as usize % self.lanes.len();
        let lane = &self.lanes[lane_id];
        let batch = BatchDesc { queue, num: num as u8 };
        if lane.batch_ring.put(batch.to_word()).is_err() {
            return Progress::Blocked;
        }

        self.dma_seq_issued = self.dma_seq_issued.wrapping_add(1);
        if lane_id == 1 {
            self.lane_list |= 1 << in_flight;
        }
        let lane_issued = lane.gather_issued.increment();
        let slot_bytes = u64::from(MAX_BATCH_SZ) * TxDesc::SIZE as u64;
        let slot = (u64::from(lane_issued) * slot_bytes) & (lane.desc_ring_bytes - 1);

        self.dma.enqueue(
            DmaQueue::Gather,
            &DmaDescriptor {
                direction: DmaDirection::FromHost,
                pcie_addr: info.desc_addr(info.tx_s),
                cpp_addr: lane.desc_base + slot,
                length: num * TxDesc::SIZE as u32,
                rid: info.rid,
                completion: DmaCompletion::Event {
                    stream: EventStream::Gather,
                    seqn: self.dma_seq_issued,
                },
            },
        );

        self.queues[queue as usize].tx_s = info.tx_s.wrapping_add(num);
        trace!("gather: queue {} batch of {} to lane {} (seq {})", queue, num, lane_id, self.dma_seq_issued);
        Progress::Worked
    }

    /// Brings a queue up or down. On return a downed queue is idle.
    pub fn vnic_setup(&mut self, cfg: &QueueCfg) {
        let natq = cfg.natq;
        let qc_queue = QcQueue::new(natq, QueueKind::Tx);
        if cfg.up {
            self.queues[natq as usize] = TxQueueInfo::up(cfg);
            self.qc.init_queue(
                qc_queue,
                &QcQueueConfig { event: QcEvent::NotEmpty, size_log2: cfg.ring_sz_log2, watermark: 0 },
            );
            info!("gather: queue {} up, {} descriptors at {:#x}", natq, cfg.ring_sz_msk() + 1, cfg.ring_base);
        } else {
            self.active.clear(natq);
            self.pending.clear(natq);
            self.queues[natq as usize] = TxQueueInfo::default();
            self.qc.init_queue(
                qc_queue,
                &QcQueueConfig { event: QcEvent::Never, size_log2: 0, watermark: 0 },
            );
            info!("gather: queue {} down", natq);
        }
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use super::*;
    use crate::test_rig::{ring_base, Rig, LOCAL_BASE};
    use nfd_hw::Memory;
    use std::vec;

    fn rig(cfg: PciInConfig) -> Rig {
        Rig::new(cfg)
    }

    fn up(gather: &mut Gather, natq: u8) {
        gather.vnic_setup(&Rig::queue_cfg(natq, true));
    }

    fn set_pointers(gather: &mut Gather, natq: u8, tx_w: u32, tx_s: u32) {
        let q = &mut gather.queues[natq as usize];
        q.tx_w = tx_w;
        q.tx_s = tx_s;
        gather.pending.set(natq);
    }

    #[test]
    fn test_batch_size() {
        assert_eq!(Gather::batch_size(4, 64, 0), 4);
        assert_eq!(Gather::batch_size(4, 3, 0), 3);
        assert_eq!(Gather::batch_size(4, 10, 2), 2);
        assert_eq!(Gather::batch_size(4, 4, 4), 0);
        // An 8-descriptor window never yields 5, 6 or 7.
        for tx_s in 0..16 {
            for tx_w in tx_s..tx_s + 20 {
                let n = Gather::batch_size(8, tx_w, tx_s);
                assert!(n <= 4);
                assert_eq!(n == 0, tx_w == tx_s);
                // Batches stay inside one window.
                assert_eq!((tx_s & !7), ((tx_s + n.max(1) - 1) & !7));
            }
        }
        assert_eq!(Gather::batch_size(8, 7, 0), 4);
        assert_eq!(Gather::batch_size(8, 100, 5), 3);
    }

    #[test]
    fn test_batch_size_wraps() {
        let tx_s = u32::MAX - 1;
        assert_eq!(Gather::batch_size(4, tx_s.wrapping_add(10), tx_s), 2);
        assert_eq!(Gather::batch_size(4, tx_s.wrapping_add(1), tx_s), 1);
    }

    #[test]
    fn test_gather_issues_capped_batch() {
        let mut rig = rig(PciInConfig { lanes: 1, ..Default::default() });
        let gather = &mut rig.pci_in.gather;
        up(gather, 0);
        set_pointers(gather, 0, 64, 0);

        assert_eq!(gather.gather(), Progress::Worked);
        assert_eq!(gather.queue(0).tx_s, 4);
        assert_eq!(gather.dma_seq_issued(), 1);

        let lane = &rig.pci_in.lanes[0].lane;
        assert_eq!(lane.batch_ring.get().map(BatchDesc::from_word), Some(BatchDesc { queue: 0, num: 4 }));
        assert_eq!(lane.gather_issued.get(), 1);

        assert_eq!(rig.dma.complete_all(), 1);
        let fetch = rig.dma.completed_on(DmaQueue::Gather)[0];
        assert_eq!(fetch.pcie_addr, ring_base(0));
        assert_eq!(fetch.length, 64);
        assert_eq!(fetch.rid, 1);
        // Slot 1 of the lane's descriptor storage.
        assert_eq!(fetch.cpp_addr, LOCAL_BASE + 64);
    }

    #[test]
    fn test_gather_copies_descriptors() {
        let mut rig = rig(PciInConfig { lanes: 1, ..Default::default() });
        let descs: std::vec::Vec<u8> = (0..3u16)
            .flat_map(|i| TxDesc { dma_len: 100 + i, eop: true, ..Default::default() }.to_bytes())
            .collect();
        rig.host.write(ring_base(0) + 5 * 16, &descs);

        let gather = &mut rig.pci_in.gather;
        up(gather, 0);
        set_pointers(gather, 0, 8, 5);
        assert_eq!(gather.gather(), Progress::Worked);
        // 5..8 is the rest of the window.
        assert_eq!(gather.queue(0).tx_s, 8);
        rig.dma.complete_all();

        let fetch = rig.dma.completed_on(DmaQueue::Gather)[0];
        let copied = nfd_hw::read_array::<16>(&*rig.local, fetch.cpp_addr + 32);
        assert_eq!(TxDesc::from_bytes(&copied).dma_len, 102);
        assert_eq!(fetch.length, 48);
    }

    #[test]
    fn test_full_handoff_ring_defers() {
        let mut rig = rig(PciInConfig { lanes: 1, gather_max_in_flight: 32, ..Default::default() });
        let gather = &mut rig.pci_in.gather;
        up(gather, 0);
        set_pointers(gather, 0, 200, 0);

        for _ in 0..8 {
            assert_eq!(gather.gather(), Progress::Worked);
        }
        let tx_s = gather.queue(0).tx_s;
        assert_eq!(gather.gather(), Progress::Blocked);
        assert_eq!(gather.queue(0).tx_s, tx_s);
        assert_eq!(gather.dma_seq_issued(), 8);
        assert_eq!(rig.dma.pending(), 8);

        rig.pci_in.lanes[0].lane.batch_ring.get();
        assert_eq!(gather.gather(), Progress::Worked);
        assert_eq!(gather.dma_seq_issued(), 9);
    }

    #[test]
    fn test_in_flight_window_defers() {
        let mut rig = rig(PciInConfig { lanes: 1, gather_max_in_flight: 2, ..Default::default() });
        let gather = &mut rig.pci_in.gather;
        up(gather, 0);
        set_pointers(gather, 0, 200, 0);

        assert_eq!(gather.gather(), Progress::Worked);
        assert_eq!(gather.gather(), Progress::Worked);
        assert_eq!(gather.gather(), Progress::Blocked);
        assert_eq!(dma_seqn::distance(gather.dma_seq_issued(), gather.dma_seq_compl()), 2);

        rig.dma.complete(1);
        assert_eq!(gather.distr(), Progress::Worked);
        assert_eq!(gather.dma_seq_compl(), 1);
        assert_eq!(gather.gather(), Progress::Worked);
    }

    #[test]
    fn test_reset_gates_issue() {
        let mut rig = rig(PciInConfig { lanes: 1, ..Default::default() });
        let gather = &mut rig.pci_in.gather;
        up(gather, 0);
        set_pointers(gather, 0, 8, 0);
        rig.reset.enter();
        assert_eq!(gather.gather(), Progress::Blocked);
        assert_eq!(rig.dma.pending(), 0);
        rig.reset.clear();
        assert_eq!(gather.gather(), Progress::Worked);
    }

    #[test]
    fn test_empty_batch_clears_pending() {
        let mut rig = rig(PciInConfig { lanes: 1, ..Default::default() });
        let gather = &mut rig.pci_in.gather;
        up(gather, 3);
        set_pointers(gather, 3, 4, 4);
        assert_eq!(gather.gather(), Progress::Idle);
        assert!(!gather.pending().contains(3));
    }

    #[test]
    fn test_check_queues_tracks_write_pointer() {
        let mut rig = rig(PciInConfig { lanes: 1, ..Default::default() });
        let q = QcQueue::new(2, QueueKind::Tx);
        up(&mut rig.pci_in.gather, 2);
        rig.qc.host_write(q, 10);

        let gather = &mut rig.pci_in.gather;
        gather.poll_queue_events();
        assert!(gather.active().contains(2));
        assert_eq!(gather.check_queues(), Progress::Worked);
        assert_eq!(gather.queue(2).tx_w, 10);
        assert!(gather.pending().contains(2));

        // Pointers catch up and the host has taken everything back.
        gather.queues[2].tx_s = 10;
        gather.pending.clear(2);
        rig.qc.add_to_read_ptr(q, 10);
        assert_eq!(gather.check_queues(), Progress::Idle);
        assert!(!gather.active().contains(2));
        assert!(rig.qc.is_armed(q));

        // The next post re-activates the queue.
        rig.qc.host_write(q, 1);
        gather.poll_queue_events();
        assert!(gather.active().contains(2));
    }

    #[test]
    fn test_check_queues_keeps_unreturned_queue_active() {
        let mut rig = rig(PciInConfig { lanes: 1, ..Default::default() });
        let q = QcQueue::new(1, QueueKind::Tx);
        up(&mut rig.pci_in.gather, 1);
        rig.qc.host_write(q, 4);

        let gather = &mut rig.pci_in.gather;
        gather.active.set(1);
        gather.queues[1].tx_w = 4;
        gather.queues[1].tx_s = 4;
        assert_eq!(gather.check_queues(), Progress::Idle);
        assert!(gather.active().contains(1));
    }

    #[test]
    fn test_check_queues_wraps_write_pointer() {
        let mut rig = rig(PciInConfig { lanes: 1, ..Default::default() });
        let q = QcQueue::new(0, QueueKind::Tx);
        up(&mut rig.pci_in.gather, 0);
        let gather = &mut rig.pci_in.gather;
        gather.queues[0].tx_w = 250;
        gather.queues[0].tx_s = 250;
        rig.qc.host_write(q, 250);
        rig.qc.add_to_read_ptr(q, 250);
        rig.qc.host_write(q, 10);
        gather.active.set(0);
        gather.check_queues();
        assert_eq!(gather.queue(0).tx_w, 260);
        assert_eq!(gather.queue(0).backlog(), 10);
    }

    #[test]
    fn test_lanes_split_completions() {
        let mut rig = rig(PciInConfig::default());
        let gather = &mut rig.pci_in.gather;
        for q in 0..2 {
            up(gather, q);
            set_pointers(gather, q, 4, 0);
        }
        assert_eq!(gather.gather(), Progress::Worked);
        assert_eq!(gather.gather(), Progress::Worked);
        assert_eq!(gather.lane_list, 0b10);

        let lanes: vec::Vec<_> = rig.pci_in.lanes.iter().map(|l| l.lane.clone()).collect();
        assert_eq!(lanes[0].batch_ring.len(), 1);
        assert_eq!(lanes[1].batch_ring.len(), 1);

        rig.dma.complete_all();
        assert_eq!(gather.distr(), Progress::Worked);
        assert_eq!(lanes[0].gather_compl.take(), Some(1));
        assert_eq!(lanes[1].gather_compl.take(), Some(1));
        assert_eq!(gather.lane_list, 0);
    }

    #[test]
    fn test_up_down_round_trip() {
        let mut rig = rig(PciInConfig::default());
        let gather = &mut rig.pci_in.gather;
        up(gather, 9);
        assert!(!gather.queue_is_idle(9));
        gather.vnic_setup(&Rig::queue_cfg(9, false));
        assert!(gather.queue_is_idle(9));
        assert_eq!(*gather.queue(9), TxQueueInfo::default());
    }
}
