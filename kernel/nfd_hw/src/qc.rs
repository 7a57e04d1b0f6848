/// Which side of a vNIC queue pair a hardware queue belongs to.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum QueueKind {
    /// A host TX descriptor ring, serviced by PCI.IN.
    Tx = 0,
    /// A host free-list/RX ring, serviced by PCI.OUT.
    FreeList = 1,
}

/// A queue-controller queue number.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct QcQueue(pub u16);

impl QcQueue {
    /// The queue-controller queue of natural queue `natq`.
    pub const fn new(natq: u8, kind: QueueKind) -> QcQueue {
        QcQueue(((natq as u16) << 1) | kind as u16)
    }

    pub const fn natq(self) -> u8 {
        (self.0 >> 1) as u8
    }

    pub const fn kind(self) -> QueueKind {
        if self.0 & 1 == 0 {
            QueueKind::Tx
        } else {
            QueueKind::FreeList
        }
    }
}

/// The condition that makes a queue raise an event once armed.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum QcEvent {
    Never,
    NotEmpty,
    HiWatermark,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct QcQueueConfig {
    pub event: QcEvent,
    /// Log2 of the ring size in entries, 0 for a disabled queue.
    pub size_log2: u8,
    /// Occupancy at which [`QcEvent::HiWatermark`] fires.
    pub watermark: u32,
}

/// A snapshot of a queue's pointers.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct QcStatus {
    /// The write pointer, already reduced modulo the ring size.
    pub wptr: u32,
    pub empty: bool,
    pub wm_reached: bool,
}

/// The queue-controller primitive.
pub trait QueueController: Send + Sync {
    /// Resets `queue` with zeroed pointers.
    fn init_queue(&self, queue: QcQueue, config: &QcQueueConfig);

    /// Reads the queue's pointers.
    fn read_status(&self, queue: QcQueue) -> QcStatus;

    /// Adds `delta` to the read pointer.
    fn add_to_read_ptr(&self, queue: QcQueue, delta: u32);

    /// Arms `event` for `queue`. It fires at once if its condition already
    /// holds, or as soon as it does.
    fn ping(&self, queue: QcQueue, event: QcEvent);

    /// Returns and clears the natural queues of `kind` that fired an event.
    fn take_events(&self, kind: QueueKind) -> u64;
}
