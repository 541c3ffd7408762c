//! Computation abstraction for the work a unit performs.
//!
//! The processor never evaluates a unit itself; it asks a [`Computation`].
//! Production code uses [`Addition`]. Tests use [`MockComputation`] to script
//! failures, hold units open until released, and observe concurrency.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::anyhow;
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::error::Result;
use crate::unit::{UnitData, UnitId};

/// The domain step executed for each unit.
#[async_trait]
pub trait Computation: Send + Sync {
    /// Compute the unit's result.
    ///
    /// # Errors
    /// Any error marks the unit as failed with the error's message.
    async fn compute(&self, unit: &UnitData) -> Result<i64>;
}

/// Adds the unit's two terms.
#[derive(Debug, Clone, Copy, Default)]
pub struct Addition;

#[async_trait]
impl Computation for Addition {
    #[tracing::instrument(skip(self, unit), fields(unit_id = %unit.id))]
    async fn compute(&self, unit: &UnitData) -> Result<i64> {
        let terms = unit.terms;
        let result = terms
            .a
            .checked_add(terms.b)
            .ok_or_else(|| anyhow!("Integer overflow adding {} and {}", terms.a, terms.b))?;
        tracing::debug!(a = terms.a, b = terms.b, result, "Computed unit result");
        Ok(result)
    }
}

// ============================================================================
// Test/Mock Implementation
// ============================================================================

/// Scripted behaviour for one call.
enum MockStep {
    Immediate(Result<i64>),
    Triggered {
        result: Result<i64>,
        trigger: oneshot::Receiver<()>,
    },
    Panic(String),
}

/// Record of a call made to the mock computation.
#[derive(Debug, Clone)]
pub struct MockCall {
    pub unit_id: UnitId,
    pub title: String,
}

/// Mock computation for testing.
///
/// Steps are keyed by unit title and consumed in FIFO order. A unit with no
/// scripted step falls back to [`Addition`].
///
/// # Example
/// ```ignore
/// let mock = MockComputation::new();
/// mock.add_failure("bad", "division by zero");
/// let release = mock.add_result_with_trigger("slow", Ok(42));
/// // ... "slow" now blocks until released ...
/// release.send(()).unwrap();
/// ```
#[derive(Clone, Default)]
pub struct MockComputation {
    steps: Arc<Mutex<HashMap<String, Vec<MockStep>>>>,
    calls: Arc<Mutex<Vec<MockCall>>>,
    in_flight: Arc<AtomicUsize>,
    peak_in_flight: Arc<AtomicUsize>,
}

impl MockComputation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return `result` for the next unit with this title.
    pub fn add_result(&self, title: &str, result: Result<i64>) {
        self.push(title, MockStep::Immediate(result));
    }

    /// Fail the next unit with this title.
    pub fn add_failure(&self, title: &str, message: &str) {
        self.add_result(title, Err(anyhow!(message.to_string()).into()));
    }

    /// Panic while computing the next unit with this title.
    pub fn add_panic(&self, title: &str, message: &str) {
        self.push(title, MockStep::Panic(message.to_string()));
    }

    /// Return `result` for the next unit with this title once triggered.
    ///
    /// The computation stays in flight until the returned sender fires or is dropped.
    pub fn add_result_with_trigger(&self, title: &str, result: Result<i64>) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        self.push(
            title,
            MockStep::Triggered {
                result,
                trigger: rx,
            },
        );
        tx
    }

    fn push(&self, title: &str, step: MockStep) {
        self.steps
            .lock()
            .entry(title.to_string())
            .or_default()
            .push(step);
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    /// Number of computations currently executing.
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Highest number of computations that were ever executing at once.
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Computation for MockComputation {
    async fn compute(&self, unit: &UnitData) -> Result<i64> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        let in_flight = self.in_flight.clone();
        let _guard = scopeguard::guard((), move |_| {
            in_flight.fetch_sub(1, Ordering::SeqCst);
        });

        self.calls.lock().push(MockCall {
            unit_id: unit.id,
            title: unit.title.clone(),
        });

        let step = {
            let mut steps = self.steps.lock();
            steps
                .get_mut(&unit.title)
                .filter(|queue| !queue.is_empty())
                .map(|queue| queue.remove(0))
        };

        match step {
            None => Addition.compute(unit).await,
            Some(MockStep::Immediate(result)) => result,
            Some(MockStep::Triggered { result, trigger }) => {
                // A dropped sender releases the computation too.
                let _ = trigger.await;
                result
            }
            Some(MockStep::Panic(message)) => panic!("{}", message),
        }
    }
}
