//! A fixed-capacity, first-in first-out hand-off ring.
//!
//! Rings connect pipeline stages that run on different contexts. Their
//! capacity is a power of two fixed at setup time, a put onto a full ring and
//! a get from an empty ring fail immediately, and the caller decides whether
//! that means "yield and retry" or something worse.
//!
//! The occupancy is tracked next to the backing queue so that producers can
//! check for room before committing to work whose result must be put.

#![cfg_attr(not(test), no_std)]

extern crate mpmc;

use core::sync::atomic::{AtomicUsize, Ordering};

/// The smallest ring that can be set up.
pub const MIN_ENTRIES: usize = 2;
/// The largest ring that can be set up.
pub const MAX_ENTRIES: usize = 4096;

/// A bounded multi-producer, multi-consumer FIFO.
pub struct HwRing<T> {
    queue: mpmc::Queue<T>,
    /// Number of entries put and not yet taken.
    len: AtomicUsize,
    capacity: usize,
}

impl<T: Send> HwRing<T> {
    /// Sets up a ring holding exactly `entries` items.
    ///
    /// `entries` must be a power of two between [`MIN_ENTRIES`] and
    /// [`MAX_ENTRIES`].
    pub fn new(entries: usize) -> Result<HwRing<T>, &'static str> {
        if !entries.is_power_of_two() {
            return Err("HwRing::new(): ring size must be a power of two");
        }
        if !(MIN_ENTRIES..=MAX_ENTRIES).contains(&entries) {
            return Err("HwRing::new(): ring size out of range");
        }
        Ok(HwRing {
            queue: mpmc::Queue::with_capacity(entries),
            len: AtomicUsize::new(0),
            capacity: entries,
        })
    }

    /// The number of entries the ring holds when full.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Returns the number of entries currently in the ring.
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() >= self.capacity
    }

    /// Returns the number of entries that can still be put.
    pub fn room(&self) -> usize {
        self.capacity.saturating_sub(self.len())
    }

    /// Appends an entry, handing it back if the ring is full.
    pub fn put(&self, item: T) -> Result<(), T> {
        // Reserve a slot first so `len` never exceeds the capacity.
        if self.len.fetch_add(1, Ordering::AcqRel) >= self.capacity {
            self.len.fetch_sub(1, Ordering::AcqRel);
            return Err(item);
        }
        match self.queue.push(item) {
            Ok(()) => Ok(()),
            Err(item) => {
                self.len.fetch_sub(1, Ordering::AcqRel);
                Err(item)
            }
        }
    }

    /// Takes the oldest entry, if any.
    pub fn get(&self) -> Option<T> {
        let item = self.queue.pop()?;
        self.len.fetch_sub(1, Ordering::AcqRel);
        Some(item)
    }

    /// Takes up to `out.len()` entries, filling `out` from the front.
    ///
    /// Slots past the returned count are set to `None`.
    pub fn get_freely(&self, out: &mut [Option<T>]) -> usize {
        let mut count = 0;
        for slot in out.iter_mut() {
            *slot = self.get();
            if slot.is_some() {
                count += 1;
            } else {
                break;
            }
        }
        for slot in out.iter_mut().skip(count) {
            *slot = None;
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::HwRing;
    use std::{
        sync::{
            atomic::{AtomicBool, Ordering},
            Arc,
        },
        thread,
    };

    #[test]
    fn test_setup() {
        assert!(HwRing::<u32>::new(0).is_err());
        assert!(HwRing::<u32>::new(1).is_err());
        assert!(HwRing::<u32>::new(12).is_err());
        assert!(HwRing::<u32>::new(8192).is_err());
        assert_eq!(HwRing::<u32>::new(32).unwrap().capacity(), 32);
    }

    #[test]
    fn test_spsc() {
        let ring = HwRing::new(128).unwrap();
        for i in 0..100 {
            ring.put(i).unwrap();
        }
        assert_eq!(ring.len(), 100);
        for i in 0..100 {
            assert_eq!(ring.get().unwrap(), i);
        }
        assert!(ring.is_empty());
        assert_eq!(ring.get(), None);
    }

    #[test]
    fn test_full() {
        let ring = HwRing::new(8).unwrap();
        for i in 0..8 {
            assert!(!ring.is_full());
            ring.put(i).unwrap();
        }
        assert!(ring.is_full());
        assert_eq!(ring.room(), 0);
        assert_eq!(ring.put(8), Err(8));

        assert_eq!(ring.get(), Some(0));
        assert_eq!(ring.room(), 1);
        ring.put(8).unwrap();
        let drained: Vec<_> = core::iter::from_fn(|| ring.get()).collect();
        assert_eq!(drained, [1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn test_get_freely() {
        let ring = HwRing::new(8).unwrap();
        ring.put(1).unwrap();
        ring.put(2).unwrap();
        let mut out = [Some(9); 4];
        assert_eq!(ring.get_freely(&mut out), 2);
        assert_eq!(out, [Some(1), Some(2), None, None]);
        assert_eq!(ring.get_freely(&mut out), 0);
        assert_eq!(out, [None; 4]);
    }

    /// Adapted from the standard library.
    #[test]
    fn test_mpmc_stress() {
        const AMOUNT: usize = 10_000;
        const NUM_THREADS: usize = 8;

        #[allow(clippy::declare_interior_mutable_const)]
        const FALSE: AtomicBool = AtomicBool::new(false);
        static RECEIVED: [AtomicBool; AMOUNT * NUM_THREADS] = [FALSE; AMOUNT * NUM_THREADS];

        let ring = Arc::new(HwRing::<usize>::new(64).unwrap());

        let mut receivers = Vec::with_capacity(NUM_THREADS);
        for _ in 0..NUM_THREADS {
            let ring = ring.clone();
            receivers.push(thread::spawn(move || {
                let mut counter = 0;
                while counter < AMOUNT {
                    if let Some(i) = ring.get() {
                        RECEIVED[i].store(true, Ordering::Relaxed);
                        counter += 1;
                    }
                }
            }));
        }

        let mut senders = Vec::with_capacity(NUM_THREADS);
        for i in 0..NUM_THREADS {
            let ring = ring.clone();
            senders.push(thread::spawn(move || {
                for mut item in (i * AMOUNT)..((i + 1) * AMOUNT) {
                    while let Err(back) = ring.put(item) {
                        item = back;
                        thread::yield_now();
                    }
                }
            }));
        }

        for thread in receivers.into_iter().chain(senders) {
            thread.join().unwrap();
        }

        for received in RECEIVED.iter() {
            assert!(received.load(Ordering::Relaxed));
        }
        assert!(ring.is_empty());
    }
}
