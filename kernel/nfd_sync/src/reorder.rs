use core::sync::atomic::{AtomicUsize, Ordering};

/// An ordering token relayed through the contexts of one thread group.
///
/// The group's contexts are numbered `0..members`. Exactly one of them holds
/// the token at any time; it may pass the checkpoint the token guards and
/// hands the token to the next slot with [`done`](Self::done) once the
/// checkpoint's side effects are performed. Contexts that take work in slot
/// order therefore apply their side effects in that order too, however many
/// of them run at once.
#[derive(Debug)]
pub struct ReorderStage {
    next: AtomicUsize,
    members: usize,
}

impl ReorderStage {
    /// Creates the relay with the token at slot 0.
    ///
    /// # Panics
    ///
    /// Panics if `members` is zero.
    pub fn new(members: usize) -> ReorderStage {
        assert!(members > 0, "ReorderStage::new(): empty thread group");
        ReorderStage {
            next: AtomicUsize::new(0),
            members,
        }
    }

    pub fn members(&self) -> usize {
        self.members
    }

    /// Returns `true` if `slot` holds the token.
    pub fn test(&self, slot: usize) -> bool {
        self.next.load(Ordering::Acquire) == slot
    }

    /// Passes the token from `slot` to the next slot.
    pub fn done(&self, slot: usize) {
        debug_assert!(self.test(slot), "slot {} released a token it does not hold", slot);
        let next = (slot + 1) % self.members;
        self.next.store(next, Ordering::Release);
        trace!("reorder token {} -> {}", slot, next);
    }

    /// Puts the token back at slot 0.
    pub fn restart(&self) {
        self.next.store(0, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use super::ReorderStage;
    use hw_ring::HwRing;
    use std::{sync::Arc, thread, vec::Vec};

    #[test]
    fn test_relay() {
        let stage = ReorderStage::new(3);
        assert!(stage.test(0));
        assert!(!stage.test(1));
        stage.done(0);
        assert!(stage.test(1));
        stage.done(1);
        stage.done(2);
        assert!(stage.test(0));
        stage.done(0);
        stage.restart();
        assert!(stage.test(0));
    }

    #[test]
    fn test_parallel_consumers_keep_order() {
        const BATCHES: u32 = 18_000;
        const CONSUMERS: usize = 6;

        let input = Arc::new(HwRing::<u32>::new(64).unwrap());
        let output = Arc::new(HwRing::<u32>::new(64).unwrap());
        let get_order = Arc::new(ReorderStage::new(CONSUMERS));
        let put_order = Arc::new(ReorderStage::new(CONSUMERS));

        let consumers: Vec<_> = (0..CONSUMERS)
            .map(|slot| {
                let (input, output) = (input.clone(), output.clone());
                let (get_order, put_order) = (get_order.clone(), put_order.clone());
                thread::spawn(move || {
                    let mut handled = 0;
                    let mut tag = None;
                    while handled < BATCHES as usize / CONSUMERS {
                        if tag.is_none() {
                            if !get_order.test(slot) {
                                thread::yield_now();
                                continue;
                            }
                            match input.get() {
                                Some(t) => tag = Some(t),
                                None => continue,
                            }
                            get_order.done(slot);
                        }
                        if !put_order.test(slot) {
                            thread::yield_now();
                            continue;
                        }
                        let t = tag.take().unwrap();
                        while output.put(t).is_err() {
                            thread::yield_now();
                        }
                        put_order.done(slot);
                        handled += 1;
                    }
                })
            })
            .collect();

        let producer = {
            let input = input.clone();
            thread::spawn(move || {
                for mut tag in 0..BATCHES {
                    while let Err(back) = input.put(tag) {
                        tag = back;
                        thread::yield_now();
                    }
                }
            })
        };

        let mut expected = 0;
        while expected < BATCHES {
            if let Some(tag) = output.get() {
                assert_eq!(tag, expected);
                expected += 1;
            }
        }

        producer.join().unwrap();
        for consumer in consumers {
            consumer.join().unwrap();
        }
    }
}
