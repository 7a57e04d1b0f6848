use alloc::{sync::Arc, vec, vec::Vec};
use core::sync::atomic::Ordering;
use dma_seqn::has_room;
use nfd_cfg::{PciOutConfig, QueueCfg};
use nfd_hw::{
    desc::FlDesc, CompletionEvents, DmaCompletion, DmaDescriptor, DmaDirection, DmaEngine, DmaQueue,
    EventStream, Hw, QcEvent, QcQueue, QcQueueConfig, QueueController, QueueKind, ResetState,
};
use nfd_sync::Progress;
use queue_bitmask::{QueueBitmask, MAX_QUEUES};

use crate::RxPath;

/// The free-list caching stage.
///
/// A single context keeps every up queue's on-chip cache of free-list
/// descriptors topped up. Queues whose ring passed the fetch watermark are
/// *active*; queues stage_batch found short of cached entries are *urgent*
/// and are served from their own round robin, so a busy queue cannot starve
/// a nearly empty one.
pub struct CacheDesc {
    pub(crate) batch: u32,
    bufs_per_queue: u32,
    max_in_flight: u32,
    dma: Arc<dyn DmaEngine>,
    pub(crate) events: Arc<dyn CompletionEvents>,
    qc: Arc<dyn QueueController>,
    reset: Arc<dyn ResetState>,
    pub(crate) path: Arc<RxPath>,
    active: QueueBitmask,
    pub(crate) fl_issued: u32,
    pub(crate) fl_compl: u32,
    pub(crate) fl_served: u32,
    /// The queue and queue generation each in-flight fetch is for, by
    /// sequence number.
    pub(crate) pending: Vec<(u8, u32)>,
    /// Bumped each time a queue goes up or down. A fetch only fills the
    /// cache of the generation that issued it.
    pub(crate) generation: Vec<u32>,
}

impl CacheDesc {
    pub(crate) fn new(cfg: &PciOutConfig, hw: &Hw, path: Arc<RxPath>) -> CacheDesc {
        CacheDesc {
            batch: cfg.fl_batch_size,
            bufs_per_queue: cfg.fl_bufs_per_queue,
            max_in_flight: cfg.fl_max_in_flight,
            dma: hw.dma.clone(),
            events: hw.events.clone(),
            qc: hw.qc.clone(),
            reset: hw.reset.clone(),
            path,
            active: QueueBitmask::new(),
            fl_issued: 0,
            fl_compl: 0,
            fl_served: 0,
            pending: vec![(0, 0); cfg.fl_max_in_flight as usize],
            generation: vec![0; MAX_QUEUES as usize],
        }
    }

    pub fn active(&self) -> &QueueBitmask {
        &self.active
    }

    pub fn fl_issued(&self) -> u32 {
        self.fl_issued
    }

    pub fn fl_served(&self) -> u32 {
        self.fl_served
    }

    /// One step: pick up ring events and completed fetches, then fetch for
    /// one urgent and one active queue.
    pub fn step(&mut self) -> Progress {
        let progress = self.poll_queue_events().or(self.distr());
        if self.reset.in_reset() {
            return progress.or(Progress::Blocked);
        }
        progress.or(self.check_urgent()).or(self.check_active())
    }

    fn poll_queue_events(&mut self) -> Progress {
        let fired = self.qc.take_events(QueueKind::FreeList);
        if fired == 0 {
            return Progress::Idle;
        }
        self.active.set_mask(fired);
        Progress::Worked
    }

    fn check_urgent(&mut self) -> Progress {
        if !has_room(self.fl_issued, self.fl_served, self.max_in_flight) {
            return Progress::Blocked;
        }
        match self.path.urgent.select() {
            Some(natq) => self.fetch_fl(natq),
            None => Progress::Idle,
        }
    }

    fn check_active(&mut self) -> Progress {
        if !has_room(self.fl_issued, self.fl_served, self.max_in_flight) {
            return Progress::Blocked;
        }
        match self.active.select() {
            Some(natq) => self.fetch_fl(natq),
            None => Progress::Idle,
        }
    }

    /// Fetches one batch of free-list descriptors for `natq` if the host
    /// posted enough of them and the queue's cache has room.
    fn fetch_fl(&mut self, natq: u8) -> Progress {
        let info = self.path.queue(natq);
        if !info.is_up() {
            self.active.clear(natq);
            self.path.urgent.clear(natq);
            return Progress::Idle;
        }
        let qc_queue = QcQueue::new(natq, QueueKind::FreeList);
        let fl_s = info.fl_s.load(Ordering::Acquire);
        let mut fl_w = info.fl_w.load(Ordering::Acquire);

        if fl_w.wrapping_sub(fl_s) < self.batch {
            let status = self.qc.read_status(qc_queue);
            let inc = status.wptr.wrapping_sub(fl_w) & info.ring_sz_msk.load(Ordering::Relaxed);
            fl_w = fl_w.wrapping_add(inc);
            info.fl_w.store(fl_w, Ordering::Release);
            if !status.wm_reached {
                // Too few posted: wait for the ring to pass the watermark.
                self.path.urgent.clear(natq);
                self.active.clear(natq);
                self.qc.ping(qc_queue, QcEvent::HiWatermark);
                return Progress::Idle;
            }
        }

        // Cached entries not yet turned into RX descriptors must leave room
        // for a whole batch.
        let room = (self.bufs_per_queue - self.batch)
            .wrapping_add(info.rx_w.load(Ordering::Acquire))
            .wrapping_sub(fl_s);
        if (room as i32) < 0 {
            self.path.urgent.clear(natq);
            return Progress::Blocked;
        }

        self.fl_issued = self.fl_issued.wrapping_add(1);
        let seq = self.fl_issued;
        let descr = DmaDescriptor {
            direction: DmaDirection::FromHost,
            pcie_addr: info.ring_addr(fl_s),
            cpp_addr: self.path.fl_cache.addr(natq, fl_s),
            length: self.batch * FlDesc::SIZE as u32,
            rid: info.rid(),
            completion: DmaCompletion::Event { stream: EventStream::FlFetch, seqn: seq },
        };
        info.fl_s.store(fl_s.wrapping_add(self.batch), Ordering::Release);
        self.qc.add_to_read_ptr(qc_queue, self.batch);
        self.pending[(seq & (self.max_in_flight - 1)) as usize] = (natq, self.generation[natq as usize]);
        self.dma.enqueue(DmaQueue::FlFetch, &descr);
        trace!("cache_desc: queue {} fetch {} from {} (seq {})", natq, self.batch, fl_s, seq);
        Progress::Worked
    }

    /// Brings `cfg.natq` up or down.
    pub fn vnic_setup(&mut self, cfg: &QueueCfg) {
        let natq = cfg.natq;
        let info = self.path.queue(natq);
        let qc_queue = QcQueue::new(natq, QueueKind::FreeList);
        self.path.credits.zero(natq);
        self.generation[natq as usize] = self.generation[natq as usize].wrapping_add(1);
        if cfg.up {
            info.bring_up(cfg);
            self.qc.init_queue(qc_queue, &QcQueueConfig {
                event: QcEvent::HiWatermark,
                size_log2: cfg.ring_sz_log2,
                watermark: self.batch,
            });
            info!("PCI.OUT: queue {} up, {} entries at {:#x}", natq, 1u32 << cfg.ring_sz_log2, cfg.ring_base);
        } else {
            self.active.clear(natq);
            self.path.urgent.clear(natq);
            info.bring_down();
            self.qc.init_queue(qc_queue, &QcQueueConfig { event: QcEvent::Never, size_log2: 0, watermark: 0 });
            info!("PCI.OUT: queue {} down", natq);
        }
    }

    pub fn queue_is_idle(&self, natq: u8) -> bool {
        self.path.queue(natq).is_idle()
            && !self.active.contains(natq)
            && !self.path.urgent.contains(natq)
            && self.path.credits.get(natq) == 0
    }
}
