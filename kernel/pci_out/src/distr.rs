//! Sequence distribution between the PCI.OUT stages.
//!
//! cache_desc folds free-list fetch completions into per-queue available
//! counts and credits. send_desc, on context 0, folds payload DMA
//! completions into the completed-batch count that both it and the payload
//! DMA stage wait on, and descriptor DMA completions into its own window.

use core::sync::atomic::Ordering;
use dma_seqn::advance;
use nfd_cfg::config::MAX_BATCH_SZ;
use nfd_hw::{CompletionEvents, EventStream};
use nfd_sync::Progress;

use crate::{CacheDesc, SendDesc};

impl CacheDesc {
    /// Credits every free-list fetch that completed since the last call to
    /// the queue it was issued for.
    pub(crate) fn distr(&mut self) -> Progress {
        let event = match self.events.poll(EventStream::FlFetch) {
            Some(event) => event,
            None => return Progress::Idle,
        };
        let (compl, _) = advance(self.fl_compl, event);
        self.fl_compl = compl;

        let mut progress = Progress::Idle;
        while self.fl_served != self.fl_compl {
            self.fl_served = self.fl_served.wrapping_add(1);
            let (natq, generation) = self.pending[(self.fl_served & (self.pending.len() as u32 - 1)) as usize];
            let info = self.path.queue(natq);
            // A queue downed while its fetch was in flight starts from zero,
            // even if it is up again by now.
            if info.is_up() && generation == self.generation[natq as usize] {
                info.fl_a.fetch_add(self.batch, Ordering::AcqRel);
                self.path.credits.add(natq, self.batch);
            }
            progress = Progress::Worked;
        }
        progress
    }
}

impl SendDesc {
    pub(crate) fn distr(&self) -> Progress {
        let mut progress = Progress::Idle;
        if let Some(event) = self.events.poll(EventStream::RxDesc) {
            if self.desc_dma_compl.advance(event) != 0 {
                let safe = self.desc_dma_compl.get().wrapping_add(self.max_in_flight - MAX_BATCH_SZ);
                self.desc_dma_safe.set(safe);
                progress = Progress::Worked;
            }
        }
        if let Some(event) = self.events.poll(EventStream::RxData) {
            if self.path.data_dma_compl.advance(event) != 0 {
                progress = Progress::Worked;
            }
        }
        progress
    }
}
