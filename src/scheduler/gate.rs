//! Concurrency limit that lets expedited units jump the queue.
//!
//! Waiters are woken one at a time as permits are returned: every queued
//! expedited unit goes before any queued standard unit, and units of the
//! same kind go in arrival order.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::unit::UnitKind;

struct GateState {
    available: usize,
    expedited: VecDeque<oneshot::Sender<()>>,
    standard: VecDeque<oneshot::Sender<()>>,
}

/// A counting gate with two priority classes.
pub struct PriorityGate {
    limit: usize,
    state: Mutex<GateState>,
}

impl PriorityGate {
    pub fn new(limit: usize) -> Arc<Self> {
        let limit = limit.max(1);
        Arc::new(Self {
            limit,
            state: Mutex::new(GateState {
                available: limit,
                expedited: VecDeque::new(),
                standard: VecDeque::new(),
            }),
        })
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Number of callers waiting for a permit.
    pub fn waiting(&self) -> usize {
        let state = self.state.lock();
        state.expedited.len() + state.standard.len()
    }

    /// Wait for a permit, queued according to `kind`.
    pub async fn acquire(self: &Arc<Self>, kind: UnitKind) -> GatePermit {
        let woken = {
            let mut state = self.state.lock();
            if state.available > 0 {
                state.available -= 1;
                return GatePermit { gate: self.clone() };
            }

            let (tx, rx) = oneshot::channel();
            match kind {
                UnitKind::Expedited => state.expedited.push_back(tx),
                UnitKind::Standard => state.standard.push_back(tx),
            }
            rx
        };

        // The releasing permit hands its slot over directly.
        let _ = woken.await;
        GatePermit { gate: self.clone() }
    }

    fn release(&self) {
        let mut state = self.state.lock();
        loop {
            let next = match state.expedited.pop_front() {
                Some(waiter) => Some(waiter),
                None => state.standard.pop_front(),
            };
            match next {
                // A waiter whose future was dropped can't take the slot.
                Some(waiter) => {
                    if waiter.send(()).is_err() {
                        continue;
                    }
                    return;
                }
                None => {
                    state.available += 1;
                    return;
                }
            }
        }
    }
}

/// Held while a unit computes. Dropping it admits the next waiter.
pub struct GatePermit {
    gate: Arc<PriorityGate>,
}

impl Drop for GatePermit {
    fn drop(&mut self) {
        self.gate.release();
    }
}
