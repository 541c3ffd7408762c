//! Batch job orchestration for independently processable work units.
//!
//! A [`BatchManager`] admits units one at a time or as a batch, persists
//! them through a [`Storage`] backend and hands them to a [`Scheduler`].
//! The scheduler fans each dispatch out into one task per unit and, once the
//! last unit has finished, aggregates every outcome into a [`BatchSummary`].
//!
//! Batches can be admitted atomically (one invalid unit rejects them all) or
//! non-atomically (invalid units are rejected individually), and their
//! progress can be queried at any time by batch id.

pub mod batch;
pub mod compute;
pub mod domain;
pub mod error;
pub mod manager;
pub mod metrics;
pub mod scheduler;
pub mod unit;

// Re-export commonly used types
pub use batch::*;
pub use compute::{Addition, Computation, MockComputation};
pub use error::{Result, VolleyError};
pub use manager::memory::InMemoryStorage;
pub use manager::{Admitted, BatchManager, Storage};
#[cfg(feature = "metrics")]
pub use metrics::VolleyMetrics;
pub use scheduler::{
    DispatchHandle, DispatchProgress, Intake, Scheduler, SchedulerConfig, SchedulerStats,
};
pub use unit::*;

#[cfg(feature = "postgres")]
pub use manager::postgres::{PoolProvider, PostgresStorage, TestDbPools};

/// Get the volley database migrator
///
/// Returns a migrator that can be run against a connection pool.
#[cfg(feature = "postgres")]
pub fn migrator() -> sqlx::migrate::Migrator {
    sqlx::migrate!("./migrations")
}
