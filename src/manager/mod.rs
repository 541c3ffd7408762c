//! Storage trait and the batch manager built on top of it.
//!
//! [`Storage`] persists work units and answers queries over them.
//! [`BatchManager`] is the entry point callers use: it admits units,
//! hands them to the [`crate::scheduler::Scheduler`], and reads status back.

use async_trait::async_trait;

use crate::batch::BatchId;
use crate::error::{Result, VolleyError};
use crate::unit::{AnyUnit, Metadata, NewUnit, Pending, Unit, UnitFilter, UnitId, UnitState};

pub mod admission;
pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;
mod service;

pub use service::{Admitted, BatchManager};

/// Storage trait for persisting and querying work units.
///
/// Implementations must serialize writes to a single unit so that concurrent
/// status transitions and metadata merges never lose updates. Writes to
/// different units need no coordination.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Insert units atomically: either every unit is stored or none is.
    ///
    /// Returned units are in submission order with store-assigned ids.
    async fn insert_units(&self, units: Vec<NewUnit>) -> Result<Vec<Unit<Pending>>>;

    /// Insert a single unit.
    async fn insert_unit(&self, unit: NewUnit) -> Result<Unit<Pending>> {
        self.insert_units(vec![unit])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| VolleyError::Service(anyhow::anyhow!("Insert returned no unit")))
    }

    /// Get a unit by ID.
    async fn get_unit(&self, id: UnitId) -> Result<AnyUnit>;

    /// List units ordered by ID, with optional filtering and pagination.
    async fn list_units(&self, filter: UnitFilter) -> Result<Vec<AnyUnit>>;

    /// All units of a batch, ordered by ID. Empty if the batch is unknown.
    async fn batch_units(&self, batch_id: &BatchId) -> Result<Vec<AnyUnit>>;

    /// Write a unit's new state.
    ///
    /// Only status-related fields are written; metadata is never replaced
    /// wholesale, though a failed unit's `error` key is merged in. Fails with
    /// [`VolleyError::InvalidState`] if the stored status cannot move to the
    /// new one, and with [`VolleyError::UnitNotFound`] if the unit is gone.
    async fn persist<T: UnitState + Clone>(&self, unit: &Unit<T>) -> Result<()>
    where
        AnyUnit: From<Unit<T>>;

    /// Merge keys into a unit's metadata as one atomic read-modify-write.
    ///
    /// The `error` key is reserved for failure transitions and rejected here.
    async fn merge_metadata(&self, id: UnitId, patch: Metadata) -> Result<()>;

    /// Delete a unit.
    async fn delete_unit(&self, id: UnitId) -> Result<()>;
}

/// Reject metadata patches that would write the reserved `error` key.
pub(crate) fn check_metadata_patch(id: UnitId, patch: &Metadata) -> Result<()> {
    if patch.contains_key(crate::unit::ERROR_KEY) {
        return Err(VolleyError::Validation(format!(
            "metadata key '{}' of unit {} is reserved for failures",
            crate::unit::ERROR_KEY,
            id
        )));
    }
    Ok(())
}
