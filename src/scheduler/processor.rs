//! Processing of a single work unit.

use crate::compute::Computation;
use crate::error::{Result, VolleyError};
use crate::manager::Storage;
use crate::unit::{AnyUnit, Failed, Unit, UnitId, UnitOutcome};

/// Drive one unit from `pending` to a terminal state.
///
/// Never returns an error: every failure is recorded on the unit (when the
/// store allows it) and reported as [`UnitOutcome::Failed`]. A unit that does
/// not exist yields [`UnitOutcome::NotFound`]. Units that already finished
/// report their stored outcome without being computed again.
#[tracing::instrument(skip(storage, computation), fields(unit_id = %unit_id))]
pub async fn process_unit<S, C>(storage: &S, computation: &C, unit_id: UnitId) -> UnitOutcome
where
    S: Storage + ?Sized,
    C: Computation + ?Sized,
{
    let pending = match storage.get_unit(unit_id).await {
        Ok(AnyUnit::Pending(unit)) => unit,
        Ok(AnyUnit::InProgress(_)) => {
            tracing::warn!("Unit is already being processed, skipping");
            return UnitOutcome::Failed {
                unit_id,
                error: format!("Unit {} is already in progress", unit_id),
            };
        }
        Ok(AnyUnit::Completed(unit)) => {
            tracing::debug!("Unit already completed");
            return UnitOutcome::Completed {
                unit_id,
                result: unit.state.result,
            };
        }
        Ok(AnyUnit::Failed(unit)) => {
            tracing::debug!("Unit already failed");
            return UnitOutcome::Failed {
                unit_id,
                error: unit.state.error,
            };
        }
        Err(VolleyError::UnitNotFound(_)) => {
            tracing::warn!("Unit not found");
            return UnitOutcome::NotFound { unit_id };
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to load unit");
            return UnitOutcome::Failed {
                unit_id,
                error: e.to_string(),
            };
        }
    };

    // Clone so the pending unit can still be failed if the start can't be persisted
    let running = match pending.clone().start(storage).await {
        Ok(running) => running,
        Err(VolleyError::UnitNotFound(_)) => {
            tracing::warn!("Unit disappeared before it could start");
            return UnitOutcome::NotFound { unit_id };
        }
        Err(e @ VolleyError::InvalidState(..)) => {
            // Another worker moved the unit on; its state is not ours to overwrite.
            tracing::warn!(error = %e, "Unit changed state before it could start");
            return UnitOutcome::Failed {
                unit_id,
                error: e.to_string(),
            };
        }
        Err(e) => {
            let error = e.to_string();
            let persisted = pending.fail(error.clone(), storage).await;
            return failed(unit_id, error, persisted);
        }
    };

    tracing::debug!("Unit started");

    let result = match computation.compute(&running.data).await {
        Ok(result) => result,
        Err(e) => {
            let error = e.to_string();
            tracing::info!(error = %error, "Computation failed");
            let persisted = running.fail(error.clone(), storage).await;
            return failed(unit_id, error, persisted);
        }
    };

    match running.clone().complete(result, storage).await {
        Ok(_) => {
            tracing::debug!(result, "Unit completed");
            UnitOutcome::Completed { unit_id, result }
        }
        Err(e @ VolleyError::InvalidState(..)) => {
            tracing::warn!(error = %e, "Unit changed state before it could complete");
            UnitOutcome::Failed {
                unit_id,
                error: e.to_string(),
            }
        }
        Err(e) => {
            let error = e.to_string();
            tracing::warn!(error = %error, "Failed to persist completion");
            let persisted = running.fail(error.clone(), storage).await;
            failed(unit_id, error, persisted)
        }
    }
}

fn failed(unit_id: UnitId, error: String, persisted: Result<Unit<Failed>>) -> UnitOutcome {
    if let Err(e) = persisted {
        tracing::error!(
            unit_id = %unit_id,
            error = %e,
            original_error = %error,
            "Failed to record unit failure"
        );
    }
    UnitOutcome::Failed { unit_id, error }
}
