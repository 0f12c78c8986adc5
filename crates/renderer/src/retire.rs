//! Deferred destruction tied to fence observation.
//!
//! An object released while an in-flight slot may still reference it is
//! parked on that slot. It is destroyed when the slot's fence is next
//! observed signaled, which is the first point the GPU is known to be done
//! with it.

use tracing::trace;

type Retired = Box<dyn FnOnce() + Send>;

/// Per-slot queues of pending destructions.
#[derive(Default)]
pub struct RetireQueue {
    slots: Vec<Vec<Retired>>,
}

impl RetireQueue {
    /// Creates `slot_count` empty queues. Later slots are added on demand.
    pub fn new(slot_count: usize) -> Self {
        Self {
            slots: (0..slot_count).map(|_| Vec::new()).collect(),
        }
    }

    /// Runs `destroy` after `slot`'s fence is next observed.
    pub fn retire(&mut self, slot: usize, destroy: impl FnOnce() + Send + 'static) {
        if slot >= self.slots.len() {
            self.slots.resize_with(slot + 1, Vec::new);
        }
        self.slots[slot].push(Box::new(destroy));
    }

    /// Runs everything parked on `slot`, oldest first. Returns how many ran.
    pub fn drain(&mut self, slot: usize) -> usize {
        let Some(queue) = self.slots.get_mut(slot) else {
            return 0;
        };
        let retired = std::mem::take(queue);
        let count = retired.len();
        for destroy in retired {
            destroy();
        }
        if count > 0 {
            trace!("Retired {} object(s) from slot {}", count, slot);
        }
        count
    }

    /// Runs everything on every slot. The device must be idle.
    pub fn drain_all(&mut self) -> usize {
        (0..self.slots.len()).map(|slot| self.drain(slot)).sum()
    }

    /// Objects still waiting for a fence, across all slots.
    pub fn pending(&self) -> usize {
        self.slots.iter().map(Vec::len).sum()
    }
}

impl std::fmt::Debug for RetireQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetireQueue")
            .field("slots", &self.slots.len())
            .field("pending", &self.pending())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn test_drain_only_runs_its_slot() {
        let ran = Arc::new(AtomicUsize::new(0));
        let mut queue = RetireQueue::new(2);

        for slot in [0, 1, 1] {
            let ran = Arc::clone(&ran);
            queue.retire(slot, move || {
                ran.fetch_add(1, Ordering::SeqCst);
            });
        }

        assert_eq!(queue.drain(1), 2);
        assert_eq!(ran.load(Ordering::SeqCst), 2);
        assert_eq!(queue.pending(), 1);
        assert_eq!(queue.drain(1), 0);
    }

    #[test]
    fn test_drain_all_empties_every_slot() {
        let mut queue = RetireQueue::new(1);
        queue.retire(0, || {});
        queue.retire(3, || {});

        assert_eq!(queue.drain_all(), 2);
        assert_eq!(queue.pending(), 0);
    }
}
