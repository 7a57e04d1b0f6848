use alloc::collections::BTreeMap;
use core::sync::atomic::{AtomicU64, Ordering};
use nfd_hw::{QcEvent, QcQueue, QcQueueConfig, QcStatus, QueueController, QueueKind};
use spin::Mutex;

#[derive(Clone, Copy, Debug, Default)]
struct QueueRegs {
    size_log2: u8,
    wptr: u32,
    rptr: u32,
    watermark: u32,
    armed: Option<QcEvent>,
}

impl QueueRegs {
    fn mask(&self) -> u32 {
        if self.size_log2 == 0 {
            0
        } else {
            (1u32 << self.size_log2) - 1
        }
    }

    fn occupancy(&self) -> u32 {
        self.wptr.wrapping_sub(self.rptr) & self.mask()
    }

    fn condition(&self, event: QcEvent) -> bool {
        match event {
            QcEvent::Never => false,
            QcEvent::NotEmpty => self.occupancy() != 0,
            QcEvent::HiWatermark => self.occupancy() >= self.watermark,
        }
    }
}

/// A queue controller with per-queue pointers and one-shot events.
#[derive(Default)]
pub struct SimQueueController {
    queues: Mutex<BTreeMap<u16, QueueRegs>>,
    events: [AtomicU64; 2],
}

impl SimQueueController {
    pub fn new() -> SimQueueController {
        SimQueueController::default()
    }

    /// The host driver posting `count` new entries to `queue`.
    pub fn host_write(&self, queue: QcQueue, count: u32) {
        let mut queues = self.queues.lock();
        let regs = queues.entry(queue.0).or_default();
        regs.wptr = regs.wptr.wrapping_add(count) & regs.mask();
        self.evaluate(queue, regs);
    }

    pub fn read_ptr(&self, queue: QcQueue) -> u32 {
        self.queues.lock().get(&queue.0).map_or(0, |r| r.rptr)
    }

    pub fn write_ptr(&self, queue: QcQueue) -> u32 {
        self.queues.lock().get(&queue.0).map_or(0, |r| r.wptr)
    }

    /// Returns `true` if an event is armed on `queue`.
    pub fn is_armed(&self, queue: QcQueue) -> bool {
        self.queues.lock().get(&queue.0).map_or(false, |r| r.armed.is_some())
    }

    fn evaluate(&self, queue: QcQueue, regs: &mut QueueRegs) {
        if let Some(event) = regs.armed {
            if regs.condition(event) {
                regs.armed = None;
                self.events[queue.kind() as usize].fetch_or(1 << queue.natq(), Ordering::AcqRel);
                trace!("qc queue {} raised {:?}", queue.0, event);
            }
        }
    }
}

impl QueueController for SimQueueController {
    fn init_queue(&self, queue: QcQueue, config: &QcQueueConfig) {
        let mut queues = self.queues.lock();
        let regs = QueueRegs {
            size_log2: config.size_log2,
            wptr: 0,
            rptr: 0,
            watermark: config.watermark,
            armed: match config.event {
                QcEvent::Never => None,
                event => Some(event),
            },
        };
        queues.insert(queue.0, regs);
    }

    fn read_status(&self, queue: QcQueue) -> QcStatus {
        let queues = self.queues.lock();
        let regs = queues.get(&queue.0).copied().unwrap_or_default();
        QcStatus {
            wptr: regs.wptr,
            empty: regs.occupancy() == 0,
            wm_reached: regs.watermark != 0 && regs.occupancy() >= regs.watermark,
        }
    }

    fn add_to_read_ptr(&self, queue: QcQueue, delta: u32) {
        let mut queues = self.queues.lock();
        let regs = queues.entry(queue.0).or_default();
        regs.rptr = regs.rptr.wrapping_add(delta) & regs.mask();
    }

    fn ping(&self, queue: QcQueue, event: QcEvent) {
        let mut queues = self.queues.lock();
        let regs = queues.entry(queue.0).or_default();
        regs.armed = match event {
            QcEvent::Never => None,
            event => Some(event),
        };
        self.evaluate(queue, regs);
    }

    fn take_events(&self, kind: QueueKind) -> u64 {
        self.events[kind as usize].swap(0, Ordering::AcqRel)
    }
}
