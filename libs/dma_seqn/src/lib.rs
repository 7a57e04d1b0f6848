//! Sequence numbers that track issuance and completion of asynchronous DMAs.
//!
//! Every pipeline stage counts the work it has *issued*, *completed* and
//! *served* with free-running 32-bit counters. The counters only ever move
//! forward and are allowed to wrap, so all comparisons are made on wrapped
//! differences, never on the raw values.
//!
//! DMA completion events only carry the low [`EVENT_BITS`] bits of the
//! sequence number of the last finished DMA. [`advance`] turns such a value
//! into the number of DMAs that finished since the counter was last updated.

#![no_std]

use core::sync::atomic::{AtomicU32, Ordering};

/// The number of sequence bits a DMA completion event carries.
pub const EVENT_BITS: u32 = 12;

/// The mask selecting the bits of a sequence number carried by an event.
pub const EVENT_MASK: u32 = (1 << EVENT_BITS) - 1;

/// Returns the low bits of `seq` as placed in a DMA completion event.
#[inline]
pub const fn event_bits(seq: u32) -> u16 {
    (seq & EVENT_MASK) as u16
}

/// Returns how far `compl` must move forward to catch up with the event
/// value `event`, together with the new counter value.
///
/// The result is only meaningful while fewer than `1 << EVENT_BITS` DMAs are
/// in flight, which the in-flight windows of every stage guarantee.
#[inline]
pub const fn advance(compl: u32, event: u16) -> (u32, u32) {
    let amount = (event as u32).wrapping_sub(compl) & EVENT_MASK;
    (compl.wrapping_add(amount), amount)
}

/// Returns the number of items between `older` and `newer`.
#[inline]
pub const fn distance(newer: u32, older: u32) -> u32 {
    newer.wrapping_sub(older)
}

/// Returns `true` if `seq` is at or past `mark`.
///
/// Both values must be within `2^31` of each other.
#[inline]
pub const fn reached(seq: u32, mark: u32) -> bool {
    (seq.wrapping_sub(mark) as i32) >= 0
}

/// Returns `true` if one more item may be issued without `issued - compl`
/// reaching `max_in_flight`.
#[inline]
pub const fn has_room(issued: u32, compl: u32, max_in_flight: u32) -> bool {
    distance(issued, compl) < max_in_flight
}

/// A sequence counter shared between contexts.
///
/// Each counter has a single writer at any time; the atomic makes the value
/// visible to the contexts that only compare against it.
#[derive(Debug, Default)]
pub struct SeqCounter(AtomicU32);

impl SeqCounter {
    pub const fn new(value: u32) -> Self {
        Self(AtomicU32::new(value))
    }

    #[inline]
    pub fn get(&self) -> u32 {
        self.0.load(Ordering::Acquire)
    }

    #[inline]
    pub fn set(&self, value: u32) {
        self.0.store(value, Ordering::Release)
    }

    /// Increments the counter and returns the new value.
    #[inline]
    pub fn increment(&self) -> u32 {
        self.add(1)
    }

    /// Adds `amount` and returns the new value.
    #[inline]
    pub fn add(&self, amount: u32) -> u32 {
        self.0.fetch_add(amount, Ordering::AcqRel).wrapping_add(amount)
    }

    /// Subtracts `amount` and returns the new value.
    #[inline]
    pub fn sub(&self, amount: u32) -> u32 {
        self.0.fetch_sub(amount, Ordering::AcqRel).wrapping_sub(amount)
    }

    /// Advances the counter with a completion event and returns the amount it
    /// moved.
    pub fn advance(&self, event: u16) -> u32 {
        let (value, amount) = advance(self.get(), event);
        self.set(value);
        amount
    }
}
