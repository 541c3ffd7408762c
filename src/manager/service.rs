use chrono::Utc;

use super::Storage;
use super::admission::{self, AdmissionPlan};
use crate::batch::{
    AdmissionStatus, BatchAdmission, BatchId, BatchRequest, BatchStatusReport, StatusCounts,
    UnitStatusEntry,
};
use crate::compute::Computation;
use crate::error::{Result, VolleyError};
use crate::scheduler::{DispatchHandle, Scheduler};
use crate::unit::{AnyUnit, NewUnit, UnitFilter, UnitId, UnitInput};

/// Result of [`BatchManager::admit_batch`].
#[derive(Debug)]
pub struct Admitted {
    pub admission: BatchAdmission,
    /// Handle to the dispatch's summary. `None` when nothing was accepted.
    pub handle: Option<DispatchHandle>,
}

/// Entry point for admitting, querying and deleting work units.
pub struct BatchManager<S, C> {
    scheduler: Scheduler<S, C>,
}

impl<S, C> BatchManager<S, C>
where
    S: Storage + 'static,
    C: Computation + 'static,
{
    /// Create a manager over the scheduler's storage.
    pub fn new(scheduler: Scheduler<S, C>) -> Self {
        Self { scheduler }
    }

    pub fn scheduler(&self) -> &Scheduler<S, C> {
        &self.scheduler
    }

    pub fn storage(&self) -> &S {
        self.scheduler.storage().as_ref()
    }

    /// Admit one unit outside of any batch and start processing it.
    ///
    /// The returned unit is the freshly stored one, still `pending`.
    #[tracing::instrument(skip(self, input), fields(title = %input.title, kind = input.kind.as_str()))]
    pub async fn admit_single(&self, input: UnitInput) -> Result<AnyUnit> {
        let unit = NewUnit::from_input(input)?;
        // Held until the unit is submitted, so shutdown can't strand it.
        let intake = self.scheduler.open_intake()?;

        let created = self
            .storage()
            .insert_unit(unit)
            .await
            .map_err(|e| with_context(e, "Failed to persist unit".to_string()))?;
        let unit_id = created.data.id;

        // Processing continues without the join handle.
        intake.submit(unit_id);
        tracing::info!(unit_id = %unit_id, "Unit admitted");

        Ok(AnyUnit::Pending(created))
    }

    /// Validate, persist and dispatch a batch of units.
    ///
    /// # Errors
    /// - [`VolleyError::Batch`] when an atomic batch contains an invalid unit.
    /// - [`VolleyError::Service`] when the units could not be stored; nothing
    ///   is persisted or dispatched in that case.
    /// - [`VolleyError::Shutdown`] when the scheduler stopped accepting work
    ///   before the call started. Once units are stored they are always
    ///   dispatched.
    #[tracing::instrument(skip(self, request), fields(units = request.units.len(), mode = ?request.mode))]
    pub async fn admit_batch(&self, request: BatchRequest) -> Result<Admitted> {
        let intake = self.scheduler.open_intake()?;

        let AdmissionPlan {
            batch_id,
            requested_count,
            units,
            rejected,
        } = admission::plan(request, Utc::now())?;

        if units.is_empty() {
            tracing::warn!(
                batch_id = %batch_id,
                requested = requested_count,
                rejected = rejected.len(),
                "No units accepted, nothing to dispatch"
            );
            return Ok(Admitted {
                admission: BatchAdmission {
                    batch_id,
                    requested_count,
                    accepted_unit_ids: Vec::new(),
                    rejected,
                    dispatch_id: None,
                    status: AdmissionStatus::Failed,
                },
                handle: None,
            });
        }

        let created = self.storage().insert_units(units).await.map_err(|e| {
            with_context(e, format!("Failed to persist units of batch {}", batch_id))
        })?;
        let accepted_unit_ids: Vec<UnitId> = created.iter().map(|u| u.data.id).collect();

        let handle = intake.dispatch(accepted_unit_ids.clone());

        tracing::info!(
            batch_id = %batch_id,
            accepted = accepted_unit_ids.len(),
            rejected = rejected.len(),
            "Batch admitted"
        );

        Ok(Admitted {
            admission: BatchAdmission {
                batch_id,
                requested_count,
                accepted_unit_ids,
                rejected,
                dispatch_id: handle.as_ref().map(DispatchHandle::id),
                status: AdmissionStatus::Processing,
            },
            handle,
        })
    }

    pub async fn get(&self, id: UnitId) -> Result<AnyUnit> {
        self.storage().get_unit(id).await
    }

    pub async fn list(&self, filter: UnitFilter) -> Result<Vec<AnyUnit>> {
        self.storage().list_units(filter).await
    }

    /// Per-status breakdown of every unit in a batch.
    #[tracing::instrument(skip(self), fields(batch_id = %batch_id))]
    pub async fn get_batch_status(&self, batch_id: &BatchId) -> Result<BatchStatusReport> {
        let units = self.storage().batch_units(batch_id).await?;
        if units.is_empty() {
            return Err(VolleyError::BatchNotFound(batch_id.clone()));
        }

        let mut status_count = StatusCounts::default();
        let entries: Vec<UnitStatusEntry> = units
            .iter()
            .map(|unit| {
                status_count.record(unit.status());
                UnitStatusEntry {
                    id: unit.id(),
                    status: unit.status(),
                    error: unit.error().map(str::to_string),
                }
            })
            .collect();

        Ok(BatchStatusReport {
            batch_id: batch_id.clone(),
            total_units: entries.len(),
            status_count,
            units: entries,
        })
    }

    #[tracing::instrument(skip(self), fields(unit_id = %id))]
    pub async fn delete(&self, id: UnitId) -> Result<()> {
        self.storage().delete_unit(id).await?;
        tracing::info!("Unit deleted");
        Ok(())
    }
}

fn with_context(error: VolleyError, context: String) -> VolleyError {
    match error {
        VolleyError::Service(e) => VolleyError::Service(e.context(context)),
        other => other,
    }
}
