use hw_ring::HwRing;
use nfd_cfg::CfgMsg;
use spin::Mutex;

/// Configuration messages waiting for the service microengine, and the ones
/// it completed.
pub struct CfgMailbox {
    inbox: HwRing<CfgMsg>,
    done: Mutex<Vec<CfgMsg>>,
}

impl CfgMailbox {
    pub fn new(entries: usize) -> Result<CfgMailbox, &'static str> {
        Ok(CfgMailbox { inbox: HwRing::new(entries)?, done: Mutex::new(Vec::new()) })
    }

    /// Queues `msg` for processing. A full inbox hands it back.
    pub fn post(&self, msg: CfgMsg) -> Result<(), CfgMsg> {
        self.inbox.put(msg)
    }

    pub(crate) fn next(&self) -> Option<CfgMsg> {
        self.inbox.get()
    }

    pub(crate) fn complete(&self, msg: CfgMsg) {
        self.done.lock().push(msg);
    }

    /// Takes every completed message, oldest first.
    pub fn completed(&self) -> Vec<CfgMsg> {
        core::mem::take(&mut *self.done.lock())
    }

    /// Returns `true` if no posted message is waiting.
    pub fn is_drained(&self) -> bool {
        self.inbox.is_empty()
    }
}
