use alloc::{collections::VecDeque, sync::Arc, vec, vec::Vec};
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use nfd_hw::{
    CompletionEvents, DmaCompletion, DmaDescriptor, DmaDirection, DmaEngine, DmaQueue,
    EventStream, Memory,
};
use spin::Mutex;

/// Coalescing completion-event filter for one stream.
#[derive(Default)]
struct EventFilter {
    raised: AtomicBool,
    seqn: AtomicU32,
}

/// A DMA engine over two [`Memory`] objects.
///
/// Enqueued transfers sit in one FIFO (which keeps every queue's order) until
/// [`complete`](Self::complete) runs them, unless auto-complete is on.
pub struct SimDma {
    host: Arc<dyn Memory>,
    local: Arc<dyn Memory>,
    pending: Mutex<VecDeque<(DmaQueue, DmaDescriptor)>>,
    completed: Mutex<Vec<(DmaQueue, DmaDescriptor)>>,
    filters: Vec<EventFilter>,
    auto_complete: AtomicBool,
}

impl SimDma {
    pub fn new(host: Arc<dyn Memory>, local: Arc<dyn Memory>) -> SimDma {
        SimDma {
            host,
            local,
            pending: Mutex::new(VecDeque::new()),
            completed: Mutex::new(Vec::new()),
            filters: (0..EventStream::COUNT).map(|_| EventFilter::default()).collect(),
            auto_complete: AtomicBool::new(false),
        }
    }

    /// Makes every enqueue complete before it returns.
    pub fn set_auto_complete(&self, on: bool) {
        self.auto_complete.store(on, Ordering::Release);
        if on {
            self.complete_all();
        }
    }

    /// The number of transfers enqueued and not yet completed.
    pub fn pending(&self) -> usize {
        self.pending.lock().len()
    }

    /// The number of pending transfers on `queue`.
    pub fn pending_on(&self, queue: DmaQueue) -> usize {
        self.pending.lock().iter().filter(|(q, _)| *q == queue).count()
    }

    /// Completes up to `max` of the oldest transfers and returns how many ran.
    pub fn complete(&self, max: usize) -> usize {
        let mut done = 0;
        while done < max {
            let next = self.pending.lock().pop_front();
            match next {
                Some((queue, descr)) => {
                    self.run(queue, &descr);
                    done += 1;
                }
                None => break,
            }
        }
        done
    }

    pub fn complete_all(&self) -> usize {
        self.complete(usize::MAX)
    }

    /// Every completed transfer, oldest first.
    pub fn completed(&self) -> Vec<(DmaQueue, DmaDescriptor)> {
        self.completed.lock().clone()
    }

    /// Completed transfers on `queue`, oldest first.
    pub fn completed_on(&self, queue: DmaQueue) -> Vec<DmaDescriptor> {
        self.completed
            .lock()
            .iter()
            .filter(|(q, _)| *q == queue)
            .map(|(_, d)| *d)
            .collect()
    }

    fn run(&self, queue: DmaQueue, descr: &DmaDescriptor) {
        let mut data = vec![0u8; descr.length as usize];
        match descr.direction {
            DmaDirection::FromHost => {
                self.host.read(descr.pcie_addr, &mut data);
                self.local.write(descr.cpp_addr, &data);
            }
            DmaDirection::ToHost => {
                self.local.read(descr.cpp_addr, &mut data);
                self.host.write(descr.pcie_addr, &data);
            }
            DmaDirection::SignalOnly => {}
        }
        if let DmaCompletion::Event { stream, seqn } = descr.completion {
            let filter = &self.filters[stream.index()];
            filter.seqn.store(u32::from(dma_seqn::event_bits(seqn)), Ordering::Release);
            filter.raised.store(true, Ordering::Release);
        }
        self.completed.lock().push((queue, *descr));
    }
}

impl DmaEngine for SimDma {
    fn enqueue(&self, queue: DmaQueue, descr: &DmaDescriptor) {
        trace!("dma {:?}: {:?}", queue, descr);
        if self.auto_complete.load(Ordering::Acquire) {
            self.run(queue, descr);
        } else {
            self.pending.lock().push_back((queue, *descr));
        }
    }
}

impl CompletionEvents for SimDma {
    fn poll(&self, stream: EventStream) -> Option<u16> {
        let filter = &self.filters[stream.index()];
        if filter.raised.swap(false, Ordering::AcqRel) {
            Some(filter.seqn.load(Ordering::Acquire) as u16)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SparseMemory;

    fn engine() -> (Arc<SparseMemory>, Arc<SparseMemory>, SimDma) {
        let host = Arc::new(SparseMemory::new());
        let local = Arc::new(SparseMemory::new());
        let dma = SimDma::new(host.clone(), local.clone());
        (host, local, dma)
    }

    #[test]
    fn test_copy_and_event() {
        let (host, local, dma) = engine();
        host.write(0x1000, &[1, 2, 3, 4]);
        dma.enqueue(
            DmaQueue::Gather,
            &DmaDescriptor {
                direction: DmaDirection::FromHost,
                pcie_addr: 0x1000,
                cpp_addr: 0x40,
                length: 4,
                rid: 0,
                completion: DmaCompletion::Event { stream: EventStream::Gather, seqn: 0x1005 },
            },
        );
        assert_eq!(dma.poll(EventStream::Gather), None);
        assert_eq!(dma.complete_all(), 1);

        let mut buf = [0u8; 4];
        local.read(0x40, &mut buf);
        assert_eq!(buf, [1, 2, 3, 4]);
        assert_eq!(dma.poll(EventStream::Gather), Some(5));
        assert_eq!(dma.poll(EventStream::Gather), None);
    }

    #[test]
    fn test_events_coalesce() {
        let (_, _, dma) = engine();
        for seqn in 1..=3 {
            dma.enqueue(
                DmaQueue::RxDesc,
                &DmaDescriptor::signal_only(DmaCompletion::Event { stream: EventStream::RxDesc, seqn }),
            );
        }
        dma.enqueue(DmaQueue::RxDesc, &DmaDescriptor::signal_only(DmaCompletion::Ignore));
        assert_eq!(dma.pending_on(DmaQueue::RxDesc), 4);
        dma.complete(2);
        assert_eq!(dma.poll(EventStream::RxDesc), Some(2));
        dma.complete_all();
        assert_eq!(dma.poll(EventStream::RxDesc), Some(3));
        assert_eq!(dma.completed_on(DmaQueue::RxDesc).len(), 4);
    }
}
