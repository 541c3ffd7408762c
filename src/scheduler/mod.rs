//! Fan-out scheduling of work units with a fan-in completion barrier.
//!
//! [`Scheduler::dispatch`] spawns one task per unit onto the runtime handle
//! it was built with and returns a [`DispatchHandle`] immediately. When the
//! last unit of a dispatch finishes, the task that completes the
//! [`CompletionBarrier`] runs [`aggregate`] over every outcome and publishes
//! the [`BatchSummary`] to the handle.
//!
//! With `max_in_flight` set, units wait on a [`PriorityGate`] where expedited
//! units are admitted ahead of standard ones.
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use anyhow::anyhow;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;
use tokio_util::task::task_tracker::TaskTrackerToken;
use tracing::Instrument;

use crate::batch::{BatchSummary, DispatchId};
use crate::compute::Computation;
use crate::error::{Result, VolleyError};
use crate::manager::Storage;
use crate::unit::{AnyUnit, UnitId, UnitKind, UnitOutcome};

pub mod aggregator;
pub mod barrier;
pub mod gate;
pub mod processor;

pub use aggregator::aggregate;
pub use barrier::CompletionBarrier;
pub use gate::{GatePermit, PriorityGate};
pub use processor::process_unit;

#[cfg(feature = "metrics")]
use crate::metrics::VolleyMetrics;
#[cfg(feature = "metrics")]
use std::sync::OnceLock;

/// Error recorded on a unit whose task panicked.
pub const TASK_TERMINATED: &str = "Unit task terminated unexpectedly";

const MAX_IN_FLIGHT_ENV: &str = "VOLLEY_MAX_IN_FLIGHT";
const STATUS_LOG_INTERVAL_ENV: &str = "VOLLEY_STATUS_LOG_INTERVAL_MS";

/// Configuration for the scheduler.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Maximum number of units computing at once. `None` means unbounded.
    pub max_in_flight: Option<usize>,

    /// Interval for logging scheduler status (units in flight) in milliseconds
    /// Set to None to disable periodic status logging
    pub status_log_interval_ms: Option<u64>,
}

impl SchedulerConfig {
    /// Defaults overridden by `VOLLEY_MAX_IN_FLIGHT` and
    /// `VOLLEY_STATUS_LOG_INTERVAL_MS` when set.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();
        if let Some(raw) = lookup(MAX_IN_FLIGHT_ENV) {
            let limit: usize = parse_var(MAX_IN_FLIGHT_ENV, &raw)?;
            if limit == 0 {
                return Err(VolleyError::Validation(format!(
                    "{} must be at least 1",
                    MAX_IN_FLIGHT_ENV
                )));
            }
            config.max_in_flight = Some(limit);
        }
        if let Some(raw) = lookup(STATUS_LOG_INTERVAL_ENV) {
            config.status_log_interval_ms = Some(parse_var(STATUS_LOG_INTERVAL_ENV, &raw)?);
        }
        Ok(config)
    }
}

fn parse_var<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse()
        .map_err(|e| VolleyError::Validation(format!("Invalid {} '{}': {}", key, raw, e)))
}

/// Point-in-time scheduler counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SchedulerStats {
    pub units_in_flight: usize,
    /// Units waiting for a `max_in_flight` slot.
    pub units_waiting: usize,
    pub units_completed: u64,
    pub units_failed: u64,
    pub units_not_found: u64,
    pub batches_aggregated: u64,
}

#[derive(Default)]
struct Counters {
    in_flight: AtomicUsize,
    completed: AtomicU64,
    failed: AtomicU64,
    not_found: AtomicU64,
    batches: AtomicU64,
}

/// State shared by every task the scheduler spawns.
struct Shared<S, C> {
    storage: Arc<S>,
    computation: Arc<C>,
    counters: Counters,
    #[cfg(feature = "metrics")]
    metrics: OnceLock<VolleyMetrics>,
}

impl<S, C> Shared<S, C>
where
    S: Storage + 'static,
    C: Computation + 'static,
{
    /// Process one unit, turning a panicked task into a failed outcome.
    async fn run_unit(
        self: Arc<Self>,
        unit_id: UnitId,
        gate: Option<Arc<PriorityGate>>,
        runtime: Handle,
    ) -> UnitOutcome {
        let _permit = match gate {
            Some(gate) => Some(gate.acquire(self.priority_of(unit_id).await).await),
            None => None,
        };

        let in_flight = self.counters.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.observe_in_flight(in_flight);
        let guard_shared = self.clone();
        let _guard = scopeguard::guard((), move |_| {
            let in_flight = guard_shared.counters.in_flight.fetch_sub(1, Ordering::SeqCst) - 1;
            guard_shared.observe_in_flight(in_flight);
        });

        let started = Instant::now();
        let worker = {
            let shared = self.clone();
            runtime.spawn(
                async move {
                    process_unit(shared.storage.as_ref(), shared.computation.as_ref(), unit_id)
                        .await
                }
                .in_current_span(),
            )
        };

        let outcome = match worker.await {
            Ok(outcome) => outcome,
            Err(join_error) => {
                tracing::error!(
                    unit_id = %unit_id,
                    error = %join_error,
                    "Unit task terminated unexpectedly"
                );
                self.fail_abandoned(unit_id).await
            }
        };

        self.record(&outcome, started.elapsed());
        outcome
    }

    /// Queue class for the gate. A unit that can't be loaded queues as
    /// standard and the processor reports the load failure.
    async fn priority_of(&self, unit_id: UnitId) -> UnitKind {
        match self.storage.get_unit(unit_id).await {
            Ok(unit) => unit.data().kind,
            Err(_) => UnitKind::Standard,
        }
    }

    /// Mark a unit whose task died as failed, unless it already finished.
    async fn fail_abandoned(&self, unit_id: UnitId) -> UnitOutcome {
        let error = TASK_TERMINATED.to_string();
        let persisted = match self.storage.get_unit(unit_id).await {
            Ok(AnyUnit::Pending(unit)) => unit.fail(error.clone(), self.storage.as_ref()).await,
            Ok(AnyUnit::InProgress(unit)) => unit.fail(error.clone(), self.storage.as_ref()).await,
            Ok(finished) => {
                tracing::debug!(unit_id = %unit_id, "Abandoned unit already finished");
                return finished
                    .outcome()
                    .unwrap_or(UnitOutcome::Failed { unit_id, error });
            }
            Err(e) => Err(e),
        };

        if let Err(e) = persisted {
            tracing::error!(
                unit_id = %unit_id,
                error = %e,
                "Failed to mark abandoned unit as failed"
            );
        }
        UnitOutcome::Failed { unit_id, error }
    }

    fn record(&self, outcome: &UnitOutcome, elapsed: Duration) {
        let counter = match outcome {
            UnitOutcome::Completed { .. } => &self.counters.completed,
            UnitOutcome::Failed { .. } => &self.counters.failed,
            UnitOutcome::NotFound { .. } => &self.counters.not_found,
        };
        counter.fetch_add(1, Ordering::Relaxed);

        #[cfg(feature = "metrics")]
        if let Some(metrics) = self.metrics.get() {
            metrics.record_unit(outcome.label(), elapsed);
        }
        #[cfg(not(feature = "metrics"))]
        let _ = elapsed;
    }

    fn record_aggregation(&self) {
        #[cfg(feature = "metrics")]
        if let Some(metrics) = self.metrics.get() {
            metrics.record_batch_aggregated();
        }
        self.counters.batches.fetch_add(1, Ordering::Relaxed);
    }

    fn observe_in_flight(&self, count: usize) {
        #[cfg(feature = "metrics")]
        if let Some(metrics) = self.metrics.get() {
            metrics.set_units_in_flight(count);
        }
        #[cfg(not(feature = "metrics"))]
        let _ = count;
    }
}

/// Schedules work units onto a tokio runtime.
///
/// Units run concurrently with no ordering guarantee between them. Dispatched
/// work is never cancelled: dropping a [`DispatchHandle`] only discards the
/// summary, and [`Scheduler::shutdown`] drains rather than aborts.
pub struct Scheduler<S, C> {
    shared: Arc<Shared<S, C>>,
    runtime: Handle,
    config: SchedulerConfig,
    gate: Option<Arc<PriorityGate>>,
    tracker: TaskTracker,
}

impl<S, C> Scheduler<S, C>
where
    S: Storage + 'static,
    C: Computation + 'static,
{
    /// Create a scheduler that spawns its tasks onto `runtime`.
    pub fn new(
        storage: Arc<S>,
        computation: Arc<C>,
        runtime: Handle,
        config: SchedulerConfig,
    ) -> Self {
        let shared = Arc::new(Shared {
            storage,
            computation,
            counters: Counters::default(),
            #[cfg(feature = "metrics")]
            metrics: OnceLock::new(),
        });

        let gate = config.max_in_flight.map(PriorityGate::new);

        if let Some(interval_ms) = config.status_log_interval_ms {
            runtime.spawn(log_status(Arc::downgrade(&shared), interval_ms));
        }

        tracing::info!(
            max_in_flight = ?config.max_in_flight,
            "Scheduler created"
        );

        Self {
            shared,
            runtime,
            config,
            gate,
            tracker: TaskTracker::new(),
        }
    }

    /// Report unit and batch activity to a Prometheus registry.
    ///
    /// Only the first call takes effect.
    #[cfg(feature = "metrics")]
    pub fn with_metrics(self, metrics: VolleyMetrics) -> Self {
        if self.shared.metrics.set(metrics).is_err() {
            tracing::warn!("Scheduler metrics already attached, ignoring");
        }
        self
    }

    pub fn storage(&self) -> &Arc<S> {
        &self.shared.storage
    }

    pub fn computation(&self) -> &Arc<C> {
        &self.shared.computation
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Whether new work is still accepted.
    pub fn is_accepting(&self) -> bool {
        !self.tracker.is_closed()
    }

    /// Reserve the right to spawn work.
    ///
    /// [`Scheduler::shutdown`] waits for every open [`Intake`], so work
    /// persisted while holding one can still be spawned after shutdown
    /// begins.
    ///
    /// # Errors
    /// [`VolleyError::Shutdown`] once [`Scheduler::shutdown`] has been called.
    pub fn open_intake(&self) -> Result<Intake<'_, S, C>> {
        // Take the token first so a concurrent shutdown can't finish between
        // the check and the reservation.
        let token = self.tracker.token();
        if self.tracker.is_closed() {
            return Err(VolleyError::Shutdown);
        }
        Ok(Intake {
            scheduler: self,
            _token: token,
        })
    }

    /// Spawn one task per unit and return a handle to the pending summary.
    ///
    /// Returns `Ok(None)` without spawning anything when `unit_ids` is empty.
    /// Repeated ids are dispatched once, at their first position.
    ///
    /// # Errors
    /// [`VolleyError::Shutdown`] once [`Scheduler::shutdown`] has been called.
    pub fn dispatch(&self, unit_ids: Vec<UnitId>) -> Result<Option<DispatchHandle>> {
        Ok(self.open_intake()?.dispatch(unit_ids))
    }

    /// Process a single unit outside of any dispatch.
    ///
    /// # Errors
    /// [`VolleyError::Shutdown`] once [`Scheduler::shutdown`] has been called.
    pub fn submit(&self, unit_id: UnitId) -> Result<JoinHandle<UnitOutcome>> {
        Ok(self.open_intake()?.submit(unit_id))
    }

    #[tracing::instrument(skip(self, unit_ids), fields(units = unit_ids.len()))]
    fn spawn_dispatch(&self, unit_ids: Vec<UnitId>) -> Option<DispatchHandle> {
        if unit_ids.is_empty() {
            tracing::debug!("Nothing to dispatch");
            return None;
        }

        let requested = unit_ids.len();
        let mut seen = HashSet::with_capacity(requested);
        let unit_ids: Vec<UnitId> = unit_ids.into_iter().filter(|id| seen.insert(*id)).collect();
        if unit_ids.len() < requested {
            tracing::warn!(
                duplicates = requested - unit_ids.len(),
                "Ignoring repeated unit ids in dispatch"
            );
        }

        let id = DispatchId(uuid::Uuid::new_v4());
        let barrier = Arc::new(CompletionBarrier::new(unit_ids.len()));
        let (tx, rx) = oneshot::channel();
        let publish = Arc::new(Mutex::new(Some(tx)));

        for (slot, unit_id) in unit_ids.iter().copied().enumerate() {
            let shared = self.shared.clone();
            let barrier = barrier.clone();
            let publish = publish.clone();
            let gate = self.gate.clone();
            let runtime = self.runtime.clone();

            let task = async move {
                let outcome = shared.clone().run_unit(unit_id, gate, runtime).await;

                let Some(outcomes) = barrier.arrive(slot, outcome) else {
                    return;
                };

                let summary = aggregate(shared.storage.as_ref(), &outcomes).await;
                shared.record_aggregation();
                tracing::info!(
                    completed = summary.results.completed,
                    failed = summary.results.failed,
                    not_found = summary.results.not_found,
                    "Dispatch finished"
                );

                let sender = publish.lock().take();
                if let Some(sender) = sender
                    && sender.send(summary).is_err()
                {
                    tracing::debug!("Dispatch handle dropped before summary was published");
                }
            };

            self.tracker.spawn_on(
                task.instrument(tracing::info_span!(
                    "dispatch_unit",
                    dispatch_id = %id,
                    unit_id = %unit_id,
                    slot
                )),
                &self.runtime,
            );
        }

        tracing::info!(dispatch_id = %id, units = unit_ids.len(), "Dispatched units");

        Some(DispatchHandle {
            id,
            unit_ids,
            barrier,
            rx,
        })
    }

    fn spawn_unit(&self, unit_id: UnitId) -> JoinHandle<UnitOutcome> {
        let task = self
            .shared
            .clone()
            .run_unit(unit_id, self.gate.clone(), self.runtime.clone());
        self.tracker.spawn_on(
            task.instrument(tracing::info_span!("submit_unit", unit_id = %unit_id)),
            &self.runtime,
        )
    }

    pub fn stats(&self) -> SchedulerStats {
        let counters = &self.shared.counters;
        SchedulerStats {
            units_in_flight: counters.in_flight.load(Ordering::SeqCst),
            units_waiting: self.gate.as_ref().map_or(0, |gate| gate.waiting()),
            units_completed: counters.completed.load(Ordering::Relaxed),
            units_failed: counters.failed.load(Ordering::Relaxed),
            units_not_found: counters.not_found.load(Ordering::Relaxed),
            batches_aggregated: counters.batches.load(Ordering::Relaxed),
        }
    }

    /// Stop accepting work and wait for everything already spawned to finish.
    pub async fn shutdown(&self) {
        self.tracker.close();
        tracing::info!(pending_tasks = self.tracker.len(), "Scheduler draining");
        self.tracker.wait().await;
        tracing::info!("Scheduler drained");
    }
}

/// A reservation on a [`Scheduler`], from [`Scheduler::open_intake`].
///
/// Spawning through an intake never fails, even after shutdown has begun.
pub struct Intake<'a, S, C> {
    scheduler: &'a Scheduler<S, C>,
    _token: TaskTrackerToken,
}

impl<S, C> Intake<'_, S, C>
where
    S: Storage + 'static,
    C: Computation + 'static,
{
    /// See [`Scheduler::dispatch`].
    pub fn dispatch(self, unit_ids: Vec<UnitId>) -> Option<DispatchHandle> {
        self.scheduler.spawn_dispatch(unit_ids)
    }

    /// See [`Scheduler::submit`].
    pub fn submit(self, unit_id: UnitId) -> JoinHandle<UnitOutcome> {
        self.scheduler.spawn_unit(unit_id)
    }
}

/// Periodically log the number of units in flight until the scheduler is dropped.
async fn log_status<S, C>(shared: Weak<Shared<S, C>>, interval_ms: u64) {
    let mut interval = tokio::time::interval(Duration::from_millis(interval_ms.max(1)));
    loop {
        interval.tick().await;
        let Some(live) = shared.upgrade() else {
            break;
        };
        tracing::debug!(
            units_in_flight = live.counters.in_flight.load(Ordering::Relaxed),
            units_completed = live.counters.completed.load(Ordering::Relaxed),
            units_failed = live.counters.failed.load(Ordering::Relaxed),
            "Scheduler status"
        );
    }
}

/// Progress of one dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DispatchProgress {
    pub total: usize,
    pub finished: usize,
}

/// Handle to one dispatch's eventual [`BatchSummary`].
pub struct DispatchHandle {
    id: DispatchId,
    unit_ids: Vec<UnitId>,
    barrier: Arc<CompletionBarrier<UnitOutcome>>,
    rx: oneshot::Receiver<BatchSummary>,
}

impl DispatchHandle {
    /// Correlation id, also recorded on every task's tracing span.
    pub fn id(&self) -> DispatchId {
        self.id
    }

    /// Dispatched unit ids, in submission order.
    pub fn unit_ids(&self) -> &[UnitId] {
        &self.unit_ids
    }

    pub fn progress(&self) -> DispatchProgress {
        DispatchProgress {
            total: self.barrier.total(),
            finished: self.barrier.finished(),
        }
    }

    /// Whether every unit has finished. Aggregation may still be running.
    pub fn is_finished(&self) -> bool {
        self.barrier.is_complete()
    }

    /// Wait for the batch summary.
    pub async fn wait(self) -> Result<BatchSummary> {
        let id = self.id;
        self.rx
            .await
            .map_err(|_| VolleyError::Service(anyhow!("Dispatch {} ended without a summary", id)))
    }
}

impl std::fmt::Debug for DispatchHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchHandle")
            .field("id", &self.id)
            .field("units", &self.unit_ids.len())
            .field("progress", &self.progress())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::OutcomeCounts;
    use crate::compute::MockComputation;
    use crate::manager::memory::InMemoryStorage;
    use crate::unit::{BATCH_RESULT_KEY, NewUnit, Terms, UnitKind, UnitStatus};

    async fn insert(storage: &InMemoryStorage, titles: &[&str]) -> Vec<UnitId> {
        insert_kind(storage, titles, UnitKind::Standard).await
    }

    async fn insert_kind(
        storage: &InMemoryStorage,
        titles: &[&str],
        kind: UnitKind,
    ) -> Vec<UnitId> {
        let units = titles
            .iter()
            .map(|title| NewUnit {
                title: title.to_string(),
                description: None,
                kind,
                deadline: (kind == UnitKind::Expedited).then(chrono::Utc::now),
                expedited_reason: None,
                terms: Terms { a: 2, b: 3 },
                batch_id: None,
                metadata: Default::default(),
            })
            .collect();
        storage
            .insert_units(units)
            .await
            .unwrap()
            .into_iter()
            .map(|u| u.data.id)
            .collect()
    }

    async fn wait_for(condition: impl Fn() -> bool) {
        let start = tokio::time::Instant::now();
        while !condition() {
            if start.elapsed() > Duration::from_secs(5) {
                panic!("Timeout waiting for condition");
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    fn scheduler(
        storage: &InMemoryStorage,
        mock: &MockComputation,
        config: SchedulerConfig,
    ) -> Scheduler<InMemoryStorage, MockComputation> {
        Scheduler::new(
            Arc::new(storage.clone()),
            Arc::new(mock.clone()),
            Handle::current(),
            config,
        )
    }

    #[tokio::test]
    async fn test_empty_dispatch_returns_none() {
        let storage = InMemoryStorage::new();
        let scheduler = scheduler(&storage, &MockComputation::new(), SchedulerConfig::default());
        assert!(scheduler.dispatch(vec![]).unwrap().is_none());
        assert_eq!(scheduler.stats(), SchedulerStats::default());
    }

    #[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
    async fn test_dispatch_aggregates_once() {
        let storage = InMemoryStorage::new();
        let mock = MockComputation::new();
        mock.add_failure("bad", "computation refused");
        let scheduler = scheduler(&storage, &mock, SchedulerConfig::default());

        let mut ids = insert(&storage, &["a", "bad", "c"]).await;
        ids.push(UnitId(9999));

        let handle = scheduler.dispatch(ids.clone()).unwrap().unwrap();
        assert_eq!(handle.unit_ids(), ids.as_slice());
        assert_eq!(handle.progress().total, 4);

        let summary = handle.wait().await.unwrap();
        assert_eq!(
            summary.results,
            OutcomeCounts {
                completed: 2,
                failed: 1,
                not_found: 1
            }
        );

        for id in &ids[..3] {
            let unit = storage.get_unit(*id).await.unwrap();
            assert!(unit.is_terminal());
            assert!(unit.metadata().contains_key(BATCH_RESULT_KEY));
        }

        let stats = scheduler.stats();
        assert_eq!(stats.batches_aggregated, 1);
        assert_eq!(stats.units_completed, 2);
        assert_eq!(stats.units_failed, 1);
        assert_eq!(stats.units_not_found, 1);
        assert_eq!(stats.units_in_flight, 0);
    }

    #[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
    async fn test_panicking_unit_still_releases_barrier() {
        let storage = InMemoryStorage::new();
        let mock = MockComputation::new();
        mock.add_panic("explodes", "simulated crash");
        let scheduler = scheduler(&storage, &mock, SchedulerConfig::default());

        let ids = insert(&storage, &["ok", "explodes"]).await;
        let summary = scheduler
            .dispatch(ids.clone())
            .unwrap()
            .unwrap()
            .wait()
            .await
            .unwrap();

        assert_eq!(summary.results.completed, 1);
        assert_eq!(summary.results.failed, 1);

        let crashed = storage.get_unit(ids[1]).await.unwrap();
        assert_eq!(crashed.status(), UnitStatus::Failed);
        assert_eq!(crashed.error(), Some(TASK_TERMINATED));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_max_in_flight_bounds_concurrency() {
        let storage = InMemoryStorage::new();
        let mock = MockComputation::new();
        let titles: Vec<String> = (0..6).map(|i| format!("unit-{i}")).collect();
        let releases: Vec<_> = titles
            .iter()
            .map(|title| mock.add_result_with_trigger(title, Ok(1)))
            .collect();
        let scheduler = scheduler(
            &storage,
            &mock,
            SchedulerConfig {
                max_in_flight: Some(2),
                status_log_interval_ms: Some(5),
            },
        );

        let title_refs: Vec<&str> = titles.iter().map(String::as_str).collect();
        let ids = insert(&storage, &title_refs).await;
        let handle = scheduler.dispatch(ids).unwrap().unwrap();

        wait_for(|| mock.in_flight_count() == 2 && scheduler.stats().units_waiting == 4).await;
        assert_eq!(scheduler.stats().units_in_flight, 2);
        assert!(!handle.is_finished());

        drop(releases);
        let summary = handle.wait().await.unwrap();
        assert_eq!(summary.results.completed, 6);
        assert_eq!(mock.peak_in_flight(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_shutdown_drains_and_rejects_new_work() {
        let storage = InMemoryStorage::new();
        let mock = MockComputation::new();
        let release = mock.add_result_with_trigger("slow", Ok(1));
        let scheduler = Arc::new(scheduler(&storage, &mock, SchedulerConfig::default()));

        let ids = insert(&storage, &["slow"]).await;
        let handle = scheduler.dispatch(ids.clone()).unwrap().unwrap();

        let draining = {
            let scheduler = scheduler.clone();
            tokio::spawn(async move { scheduler.shutdown().await })
        };
        wait_for(|| !scheduler.is_accepting()).await;
        assert!(!draining.is_finished());
        assert!(matches!(
            scheduler.dispatch(ids.clone()),
            Err(VolleyError::Shutdown)
        ));
        assert!(matches!(scheduler.submit(ids[0]), Err(VolleyError::Shutdown)));

        release.send(()).unwrap();
        draining.await.unwrap();
        assert_eq!(handle.wait().await.unwrap().results.completed, 1);
    }

    #[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
    async fn test_repeated_ids_are_dispatched_once() {
        let storage = InMemoryStorage::new();
        let mock = MockComputation::new();
        let scheduler = scheduler(&storage, &mock, SchedulerConfig::default());
        let ids = insert(&storage, &["a", "b"]).await;

        let handle = scheduler
            .dispatch(vec![ids[0], ids[1], ids[0], ids[0]])
            .unwrap()
            .unwrap();
        assert_eq!(handle.unit_ids(), ids.as_slice());
        assert_eq!(handle.progress().total, 2);

        let summary = handle.wait().await.unwrap();
        assert_eq!(
            summary.results,
            OutcomeCounts {
                completed: 2,
                failed: 0,
                not_found: 0
            }
        );
        assert_eq!(mock.call_count(), 2);

        let stored = storage.get_unit(ids[0]).await.unwrap();
        assert_eq!(stored.status(), UnitStatus::Completed);
        assert_eq!(stored.metadata()[BATCH_RESULT_KEY]["status"], "completed");
    }

    #[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
    async fn test_open_intake_holds_shutdown_until_spawned() {
        let storage = InMemoryStorage::new();
        let scheduler = Arc::new(scheduler(
            &storage,
            &MockComputation::new(),
            SchedulerConfig::default(),
        ));

        let intake = scheduler.open_intake().unwrap();
        let draining = {
            let scheduler = scheduler.clone();
            tokio::spawn(async move { scheduler.shutdown().await })
        };
        wait_for(|| !scheduler.is_accepting()).await;
        assert!(matches!(scheduler.open_intake(), Err(VolleyError::Shutdown)));
        assert!(!draining.is_finished());

        // Units stored before shutdown began still get dispatched.
        let ids = insert(&storage, &["late"]).await;
        let handle = intake.dispatch(ids.clone()).unwrap();
        draining.await.unwrap();

        assert_eq!(handle.wait().await.unwrap().results.completed, 1);
        assert_eq!(
            storage.get_unit(ids[0]).await.unwrap().status(),
            UnitStatus::Completed
        );
    }

    #[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
    async fn test_expedited_units_overtake_queued_standard_units() {
        let storage = InMemoryStorage::new();
        let mock = MockComputation::new();
        let release = mock.add_result_with_trigger("blocker", Ok(0));
        let scheduler = scheduler(
            &storage,
            &mock,
            SchedulerConfig {
                max_in_flight: Some(1),
                status_log_interval_ms: None,
            },
        );

        let blocker = insert(&storage, &["blocker"]).await;
        let blocker_handle = scheduler.dispatch(blocker).unwrap().unwrap();
        wait_for(|| mock.in_flight_count() == 1).await;

        let standard = insert(&storage, &["standard-1", "standard-2"]).await;
        let expedited = insert_kind(&storage, &["expedited"], UnitKind::Expedited).await;
        let queued = scheduler
            .dispatch(standard.into_iter().chain(expedited).collect())
            .unwrap()
            .unwrap();
        wait_for(|| scheduler.stats().units_waiting == 3).await;

        release.send(()).unwrap();
        blocker_handle.wait().await.unwrap();
        assert_eq!(queued.wait().await.unwrap().results.completed, 3);

        let titles: Vec<String> = mock.calls().into_iter().map(|call| call.title).collect();
        assert_eq!(titles[0], "blocker");
        assert_eq!(titles[1], "expedited");
        assert_eq!(mock.peak_in_flight(), 1);
    }

    #[tokio::test]
    async fn test_abandoned_unit_that_finished_keeps_its_outcome() {
        let storage = InMemoryStorage::new();
        let scheduler = scheduler(&storage, &MockComputation::new(), SchedulerConfig::default());
        let ids = insert(&storage, &["done"]).await;

        let AnyUnit::Pending(pending) = storage.get_unit(ids[0]).await.unwrap() else {
            panic!("unit should be pending");
        };
        pending
            .start(&storage)
            .await
            .unwrap()
            .complete(5, &storage)
            .await
            .unwrap();

        let outcome = scheduler.shared.fail_abandoned(ids[0]).await;
        assert_eq!(
            outcome,
            UnitOutcome::Completed {
                unit_id: ids[0],
                result: 5
            }
        );
        assert_eq!(storage.get_unit(ids[0]).await.unwrap().error(), None);
    }

    #[tokio::test]
    async fn test_submit_processes_single_unit() {
        let storage = InMemoryStorage::new();
        let scheduler = scheduler(&storage, &MockComputation::new(), SchedulerConfig::default());
        let ids = insert(&storage, &["one"]).await;

        let outcome = scheduler.submit(ids[0]).unwrap().await.unwrap();
        assert_eq!(
            outcome,
            UnitOutcome::Completed {
                unit_id: ids[0],
                result: 5
            }
        );
        assert_eq!(scheduler.stats().batches_aggregated, 0);
    }

    #[test]
    fn test_config_from_lookup() {
        let config = SchedulerConfig::from_lookup(|key| match key {
            MAX_IN_FLIGHT_ENV => Some("8".to_string()),
            STATUS_LOG_INTERVAL_ENV => Some(" 250 ".to_string()),
            _ => None,
        })
        .unwrap();
        assert_eq!(config.max_in_flight, Some(8));
        assert_eq!(config.status_log_interval_ms, Some(250));

        assert_eq!(
            SchedulerConfig::from_lookup(|_| None).unwrap(),
            SchedulerConfig::default()
        );

        let err = SchedulerConfig::from_lookup(|key| {
            (key == MAX_IN_FLIGHT_ENV).then(|| "0".to_string())
        })
        .unwrap_err();
        assert!(matches!(err, VolleyError::Validation(_)));

        let err = SchedulerConfig::from_lookup(|key| {
            (key == STATUS_LOG_INTERVAL_ENV).then(|| "soon".to_string())
        })
        .unwrap_err();
        assert!(err.to_string().contains(STATUS_LOG_INTERVAL_ENV));
    }

    #[test]
    fn test_config_deserializes_with_defaults() {
        let config: SchedulerConfig =
            serde_json::from_value(serde_json::json!({"max_in_flight": 4})).unwrap();
        assert_eq!(config.max_in_flight, Some(4));
        assert_eq!(config.status_log_interval_ms, None);
    }
}
