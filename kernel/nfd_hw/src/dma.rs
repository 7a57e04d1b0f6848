/// A DMA engine queue. Each queue completes its DMAs in the order they were
/// enqueued.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum DmaQueue {
    /// TX descriptor fetches.
    Gather,
    /// TX payload reads, one queue per issue lane.
    TxData(u8),
    /// Free-list descriptor fetches.
    FlFetch,
    /// RX payload writes.
    RxData,
    /// RX descriptor writes.
    RxDesc,
}

/// The stream of completion events a sequence-tagged DMA reports to.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum EventStream {
    Gather,
    TxData(u8),
    FlFetch,
    RxData,
    RxDesc,
}

impl EventStream {
    /// The number of distinct streams.
    pub const COUNT: usize = 6;

    /// A dense index, for tables kept per stream.
    pub fn index(self) -> usize {
        match self {
            EventStream::Gather => 0,
            EventStream::TxData(lane) => 1 + (lane as usize & 1),
            EventStream::FlFetch => 3,
            EventStream::RxData => 4,
            EventStream::RxDesc => 5,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DmaDirection {
    /// Host memory to on-chip memory.
    FromHost,
    /// On-chip memory to host memory.
    ToHost,
    /// Moves no data; only completes.
    SignalOnly,
}

/// What a DMA reports when it completes.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DmaCompletion {
    /// Completion is not reported.
    Ignore,
    /// Completion raises an event on `stream` carrying the low bits of `seqn`.
    Event { stream: EventStream, seqn: u32 },
}

/// One DMA transfer.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct DmaDescriptor {
    pub direction: DmaDirection,
    /// Host (PCIe) address, 40 bits wide.
    pub pcie_addr: u64,
    /// On-chip address.
    pub cpp_addr: u64,
    /// Length in bytes.
    pub length: u32,
    /// PCIe requester id the transfer is issued with.
    pub rid: u8,
    pub completion: DmaCompletion,
}

impl DmaDescriptor {
    /// A transfer that moves no data and only reports `completion`.
    pub fn signal_only(completion: DmaCompletion) -> DmaDescriptor {
        DmaDescriptor {
            direction: DmaDirection::SignalOnly,
            pcie_addr: 0,
            cpp_addr: 0,
            length: 0,
            rid: 0,
            completion,
        }
    }
}

/// The DMA enqueue primitive.
pub trait DmaEngine: Send + Sync {
    /// Enqueues `descr` on `queue`. The transfer runs asynchronously; a
    /// sequence-tagged completion is reported through [`CompletionEvents`].
    fn enqueue(&self, queue: DmaQueue, descr: &DmaDescriptor);
}

/// The per-stream completion event filters.
///
/// A filter coalesces events: polling returns the sequence bits of the most
/// recent completion on the stream since the previous poll.
pub trait CompletionEvents: Send + Sync {
    fn poll(&self, stream: EventStream) -> Option<u16>;
}
