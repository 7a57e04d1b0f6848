use core::sync::atomic::{AtomicBool, Ordering};

/// A completion flag.
///
/// The side that finishes an operation raises the signal; the waiting
/// context tests it, which also clears it, like a hardware signal.
#[derive(Debug, Default)]
pub struct Signal(AtomicBool);

impl Signal {
    pub const fn new() -> Signal {
        Signal(AtomicBool::new(false))
    }

    /// Raises the signal.
    pub fn raise(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// Returns `true` and clears the signal if it was raised.
    pub fn test(&self) -> bool {
        self.0.swap(false, Ordering::AcqRel)
    }

    /// Returns whether the signal is raised without clearing it.
    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    pub fn clear(&self) {
        self.0.store(false, Ordering::Release);
    }
}
