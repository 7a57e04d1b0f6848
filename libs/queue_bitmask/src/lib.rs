#![no_std]

use core::sync::atomic::{AtomicU64, AtomicU8, Ordering};

/// The number of queues a [`QueueBitmask`] can track.
pub const MAX_QUEUES: u8 = 64;

/// A set of queue numbers backed by an [`AtomicU64`], plus a rotation cursor.
///
/// Bits are set and cleared with single atomic read-modify-write operations,
/// so any number of contexts may share one bitmask without a lock.
/// [`select`](Self::select) hands out set bits in round-robin order, starting
/// just after the queue it returned last.
#[derive(Debug)]
pub struct QueueBitmask {
    inner: AtomicU64,
    cursor: AtomicU8,
}

impl QueueBitmask {
    /// Constructs a new, empty `QueueBitmask`.
    pub const fn new() -> Self {
        Self {
            inner: AtomicU64::new(0),
            // The first selection starts from queue 0.
            cursor: AtomicU8::new(MAX_QUEUES - 1),
        }
    }

    /// Returns the set queues of a snapshot in the order [`select`](Self::select)
    /// would hand them out, without moving the cursor.
    #[must_use]
    pub fn iter(&self) -> Iter {
        let start = (u32::from(self.cursor.load(Ordering::Relaxed)) + 1) % u32::from(MAX_QUEUES);
        Iter { rest: self.bits().rotate_right(start), start }
    }

    /// Returns the raw bits.
    #[must_use]
    pub fn bits(&self) -> u64 {
        self.inner.load(Ordering::Acquire)
    }

    /// Returns `true` if no queue is set.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bits() == 0
    }

    /// Returns `true` if `queue` is set.
    ///
    /// # Panics
    ///
    /// Panics if `queue` is greater than 63.
    #[must_use]
    pub fn contains(&self, queue: u8) -> bool {
        assert!(queue < MAX_QUEUES);
        self.bits() & (1 << queue) != 0
    }

    /// Sets `queue`. Setting a set queue is a no-op.
    ///
    /// # Panics
    ///
    /// Panics if `queue` is greater than 63.
    pub fn set(&self, queue: u8) {
        assert!(queue < MAX_QUEUES);
        self.inner.fetch_or(1 << queue, Ordering::AcqRel);
    }

    /// Sets every queue in `mask`.
    pub fn set_mask(&self, mask: u64) {
        if mask != 0 {
            self.inner.fetch_or(mask, Ordering::AcqRel);
        }
    }

    /// Clears `queue`. Clearing a clear queue is a no-op.
    ///
    /// # Panics
    ///
    /// Panics if `queue` is greater than 63.
    pub fn clear(&self, queue: u8) {
        assert!(queue < MAX_QUEUES);
        self.inner.fetch_and(!(1 << queue), Ordering::AcqRel);
    }

    /// Clears every queue and rewinds the cursor.
    pub fn reset(&self) {
        self.inner.store(0, Ordering::Release);
        self.cursor.store(MAX_QUEUES - 1, Ordering::Relaxed);
    }

    /// Returns the next set queue after the last one selected, wrapping around.
    ///
    /// Returns `None` if no queue is set. The bit itself is left set.
    pub fn select(&self) -> Option<u8> {
        let bits = self.bits();
        if bits == 0 {
            return None;
        }
        let last = u32::from(self.cursor.load(Ordering::Relaxed));
        let after = bits & u64::MAX.checked_shl(last + 1).unwrap_or(0);
        let queue = if after != 0 {
            after.trailing_zeros()
        } else {
            bits.trailing_zeros()
        } as u8;
        self.cursor.store(queue, Ordering::Relaxed);
        Some(queue)
    }

    /// The queue most recently returned by [`select`](Self::select).
    #[must_use]
    pub fn last_selected(&self) -> u8 {
        self.cursor.load(Ordering::Relaxed)
    }
}

impl Default for QueueBitmask {
    fn default() -> Self {
        Self::new()
    }
}

/// The set queues of a [`QueueBitmask`] snapshot in round-robin order.
#[derive(Clone, Debug)]
pub struct Iter {
    /// The snapshot, rotated so the queue after the cursor is bit 0.
    rest: u64,
    start: u32,
}

impl Iterator for Iter {
    type Item = u8;

    fn next(&mut self) -> Option<u8> {
        if self.rest == 0 {
            return None;
        }
        let bit = self.rest.trailing_zeros();
        self.rest &= self.rest - 1;
        Some(((bit + self.start) % u32::from(MAX_QUEUES)) as u8)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let n = self.rest.count_ones() as usize;
        (n, Some(n))
    }
}

impl ExactSizeIterator for Iter {}
