//! Completion barrier over a fixed set of concurrent tasks.
//!
//! Each dispatched task owns one slot. The barrier counts exactly one
//! contribution per slot, and the arrival that fills the last empty slot
//! receives every result in slot order. That hand-off happens exactly once,
//! however the final arrivals race.

use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

struct Slots<T> {
    results: Vec<Option<T>>,
    fired: bool,
}

/// Fan-in point for one dispatch.
pub struct CompletionBarrier<T> {
    slots: Mutex<Slots<T>>,
    total: usize,
    finished: AtomicUsize,
}

impl<T> CompletionBarrier<T> {
    /// Create a barrier expecting one result for each of `total` slots.
    pub fn new(total: usize) -> Self {
        Self {
            slots: Mutex::new(Slots {
                results: (0..total).map(|_| None).collect(),
                fired: false,
            }),
            total,
            finished: AtomicUsize::new(0),
        }
    }

    /// Record the result for `slot`.
    ///
    /// Returns every result, ordered by slot, to the single caller whose
    /// arrival completes the barrier; `None` to everyone else. Arrivals for
    /// an unknown or already-filled slot are ignored.
    pub fn arrive(&self, slot: usize, value: T) -> Option<Vec<T>> {
        let mut slots = self.slots.lock();
        if slots.fired {
            tracing::warn!(slot, "Result arrived after barrier fired, ignoring");
            return None;
        }

        match slots.results.get_mut(slot) {
            None => {
                tracing::warn!(slot, total = self.total, "Result for unknown slot, ignoring");
                return None;
            }
            Some(Some(_)) => {
                tracing::warn!(slot, "Duplicate result for slot, ignoring");
                return None;
            }
            Some(entry) => *entry = Some(value),
        }

        let finished = self.finished.fetch_add(1, Ordering::SeqCst) + 1;
        if finished < self.total {
            return None;
        }

        slots.fired = true;
        Some(std::mem::take(&mut slots.results).into_iter().flatten().collect())
    }

    /// Number of slots expected.
    pub fn total(&self) -> usize {
        self.total
    }

    /// Number of slots that have a result.
    pub fn finished(&self) -> usize {
        self.finished.load(Ordering::SeqCst)
    }

    pub fn is_complete(&self) -> bool {
        self.finished() >= self.total
    }
}
