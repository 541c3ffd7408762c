//! Batch-level aggregation of unit outcomes.

use chrono::Utc;
use serde_json::Value;

use crate::batch::{BatchSummary, OutcomeCounts};
use crate::manager::Storage;
use crate::unit::{BATCH_COMPLETION_TIME_KEY, BATCH_RESULT_KEY, Metadata, UnitOutcome};

/// Fold every outcome of a finished dispatch into a [`BatchSummary`].
///
/// Each completed or failed unit gets `batch_completion_time` and its own
/// outcome record merged into its metadata. A unit whose merge fails is
/// logged and left out of the counts. Units that were never found are
/// counted without any write.
#[tracing::instrument(skip(storage, outcomes), fields(units = outcomes.len()))]
pub async fn aggregate<S>(storage: &S, outcomes: &[UnitOutcome]) -> BatchSummary
where
    S: Storage + ?Sized,
{
    let batch_completed_at = Utc::now();
    let completion_time = Value::String(batch_completed_at.to_rfc3339());
    let mut results = OutcomeCounts::default();

    for outcome in outcomes {
        if let UnitOutcome::NotFound { .. } = outcome {
            results.not_found += 1;
            continue;
        }

        let unit_id = outcome.unit_id();
        let record = match serde_json::to_value(outcome) {
            Ok(record) => record,
            Err(e) => {
                tracing::warn!(unit_id = %unit_id, error = %e, "Failed to serialize unit outcome");
                continue;
            }
        };

        let mut patch = Metadata::new();
        patch.insert(BATCH_COMPLETION_TIME_KEY.to_string(), completion_time.clone());
        patch.insert(BATCH_RESULT_KEY.to_string(), record);

        if let Err(e) = storage.merge_metadata(unit_id, patch).await {
            tracing::warn!(
                unit_id = %unit_id,
                error = %e,
                "Failed to record batch result on unit, excluding it from counts"
            );
            continue;
        }

        match outcome {
            UnitOutcome::Completed { .. } => results.completed += 1,
            UnitOutcome::Failed { .. } => results.failed += 1,
            UnitOutcome::NotFound { .. } => {}
        }
    }

    tracing::info!(
        completed = results.completed,
        failed = results.failed,
        not_found = results.not_found,
        "Batch aggregated"
    );

    BatchSummary {
        batch_completed_at,
        results,
    }
}
