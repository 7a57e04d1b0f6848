use core::sync::atomic::{AtomicU32, Ordering};

use crate::Signal;

/// A one-word register mirrored from one context into another.
///
/// The writer stores the word and then raises the signal, so a reader that
/// observes the signal also observes the word. Writes are not queued: a
/// reader that falls behind sees only the latest value, which is all a
/// monotonically advancing sequence number needs.
#[derive(Debug, Default)]
pub struct ReflectCell {
    value: AtomicU32,
    signal: Signal,
}

impl ReflectCell {
    pub const fn new(value: u32) -> ReflectCell {
        ReflectCell {
            value: AtomicU32::new(value),
            signal: Signal::new(),
        }
    }

    /// Writes `value` and raises the signal.
    pub fn reflect(&self, value: u32) {
        self.value.store(value, Ordering::Release);
        self.signal.raise();
    }

    /// Returns the reflected value if a new one arrived since the last take.
    pub fn take(&self) -> Option<u32> {
        if self.signal.test() {
            Some(self.value.load(Ordering::Acquire))
        } else {
            None
        }
    }

    /// Returns the last reflected value, regardless of the signal.
    pub fn load(&self) -> u32 {
        self.value.load(Ordering::Acquire)
    }

    /// Rewrites the value without raising the signal.
    pub fn reset(&self, value: u32) {
        self.signal.clear();
        self.value.store(value, Ordering::Release);
    }
}
