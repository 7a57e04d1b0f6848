//! Sequence distribution between the PCI.IN stages.
//!
//! Each stage runs its distributor once per pass (gather on its only
//! context, issue_dma and notify on context 0). A distributor turns DMA
//! completion events into completed counts and reflects counts the next or
//! previous stage waits on:
//!
//! * gather splits descriptor DMA completions between the lanes and
//!   reflects each lane's count to its issue_dma group;
//! * issue_dma picks up that count, turns payload DMA completions into a
//!   completed-batch count for notify and picks up notify's served count;
//! * notify picks up the completed-batch count and reflects what it served
//!   back to issue_dma, which reopens the issue window with it.

use core::sync::atomic::Ordering;
use dma_seqn::{advance, distance};
use nfd_hw::EventStream;
use nfd_sync::Progress;

use crate::{Gather, IssueDma, Notify};

impl Gather {
    /// Folds descriptor DMA completions into the completed counter.
    ///
    /// While the link is in reset the event is acknowledged but not counted.
    pub fn distr(&mut self) -> Progress {
        let event = match self.events.poll(EventStream::Gather) {
            Some(event) => event,
            None => return Progress::Idle,
        };
        if self.reset.in_reset() {
            trace!("gather: completion {:#x} dropped during reset", event);
            return Progress::Idle;
        }
        let (_, amount) = advance(self.dma_seq_compl, event);
        self.distribute(amount)
    }

    /// Counts every outstanding descriptor DMA as complete, after the link
    /// comes out of reset.
    pub fn complete_reset(&mut self) -> Progress {
        let amount = distance(self.dma_seq_issued, self.dma_seq_compl);
        if amount != 0 {
            warn!("gather: {} descriptor DMAs written off by reset", amount);
        }
        self.distribute(amount)
    }

    fn distribute(&mut self, amount: u32) -> Progress {
        if amount == 0 {
            return Progress::Idle;
        }
        let lane1 = if amount >= 32 {
            self.lane_list.count_ones()
        } else {
            (self.lane_list & ((1 << amount) - 1)).count_ones()
        };
        self.lane_list = self.lane_list.checked_shr(amount).unwrap_or(0);
        self.dma_seq_compl = self.dma_seq_compl.wrapping_add(amount);

        for (lane, done) in [amount - lane1, lane1].into_iter().enumerate() {
            if done == 0 {
                continue;
            }
            self.lane_compl[lane] = self.lane_compl[lane].wrapping_add(done);
            if let Some(target) = self.lanes.get(lane) {
                target.gather_compl.reflect(self.lane_compl[lane]);
            }
        }
        trace!("gather: {} descriptor DMAs complete (compl {})", amount, self.dma_seq_compl);
        Progress::Worked
    }
}

impl IssueDma {
    pub(crate) fn distr(&self) -> Progress {
        let mut progress = Progress::Idle;
        if let Some(compl) = self.lane.gather_compl.take() {
            self.gather_compl.set(compl);
            progress = Progress::Worked;
        }
        if let Some(event) = self.events.poll(EventStream::TxData(self.lane.id)) {
            if self.data_compl.advance(event) != 0 {
                self.lane.data_compl.reflect(self.data_compl.get());
                progress = Progress::Worked;
            }
        }
        if let Some(served) = self.lane.data_served.take() {
            self.data_served.set(served);
        }
        progress
    }
}

impl Notify {
    pub(crate) fn distr(&self) -> Progress {
        let mut progress = Progress::Idle;
        if let Some(compl) = self.lane.data_compl.take() {
            self.compl.set(compl);
            progress = Progress::Worked;
        }
        let served = self.served.get();
        if served != self.sent.load(Ordering::Acquire) {
            self.lane.data_served.reflect(served);
            self.sent.store(served, Ordering::Release);
            progress = Progress::Worked;
        }
        progress
    }
}
