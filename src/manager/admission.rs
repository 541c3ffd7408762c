//! Batch admission planning.
//!
//! Turns a [`BatchRequest`] into the set of units to insert plus the units
//! that were rejected, without touching storage. In atomic mode the first
//! invalid unit rejects the whole request.

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::batch::{AdmissionMode, BatchId, BatchRequest, Rejection};
use crate::error::{Result, VolleyError};
use crate::unit::{
    BATCH_CREATED_AT_KEY, BATCH_EXTRA_DATA_KEY, BATCH_ID_KEY, NewUnit, UnitInput,
};

/// Units ready to insert for one batch.
#[derive(Debug, Clone)]
pub struct AdmissionPlan {
    pub batch_id: BatchId,
    pub requested_count: usize,
    /// Accepted units in submission order, already stamped with batch metadata.
    pub units: Vec<NewUnit>,
    pub rejected: Vec<Rejection>,
}

/// Validate and prepare every unit of `request`.
///
/// # Errors
/// In [`AdmissionMode::Atomic`], returns [`VolleyError::Batch`] naming the
/// first invalid unit's index. Non-atomic requests never fail here.
pub fn plan(request: BatchRequest, now: DateTime<Utc>) -> Result<AdmissionPlan> {
    let BatchRequest {
        units,
        extra_data,
        mode,
        batch_id,
    } = request;

    let batch_id = batch_id.unwrap_or_else(BatchId::generate);
    let requested_count = units.len();
    let mut accepted = Vec::with_capacity(requested_count);
    let mut rejected = Vec::new();

    for (index, input) in units.into_iter().enumerate() {
        let original = serde_json::to_value(&input)?;
        match prepare(input, &batch_id, extra_data.as_ref(), now) {
            Ok(unit) => accepted.push(unit),
            Err(e) => {
                let reason = reason(&e);
                if mode == AdmissionMode::Atomic {
                    tracing::info!(
                        batch_id = %batch_id,
                        index,
                        reason = %reason,
                        "Rejecting atomic batch"
                    );
                    return Err(VolleyError::Batch {
                        message: format!("Unit at index {}: {}", index, reason),
                        rejections: vec![Rejection {
                            index,
                            reason,
                            original,
                        }],
                    });
                }

                tracing::debug!(batch_id = %batch_id, index, reason = %reason, "Rejected unit");
                rejected.push(Rejection {
                    index,
                    reason,
                    original,
                });
            }
        }
    }

    Ok(AdmissionPlan {
        batch_id,
        requested_count,
        units: accepted,
        rejected,
    })
}

/// Validate one unit and stamp the batch metadata over its own extra data.
fn prepare(
    input: UnitInput,
    batch_id: &BatchId,
    extra_data: Option<&Value>,
    now: DateTime<Utc>,
) -> Result<NewUnit> {
    let mut unit = NewUnit::from_input(input)?;
    unit.metadata.insert(
        BATCH_ID_KEY.to_string(),
        Value::String(batch_id.to_string()),
    );
    unit.metadata.insert(
        BATCH_EXTRA_DATA_KEY.to_string(),
        extra_data.cloned().unwrap_or(Value::Null),
    );
    unit.metadata.insert(
        BATCH_CREATED_AT_KEY.to_string(),
        Value::String(now.to_rfc3339()),
    );
    unit.batch_id = Some(batch_id.clone());
    Ok(unit)
}

/// Rejection reasons carry the bare message, without the error-kind prefix.
fn reason(error: &VolleyError) -> String {
    match error {
        VolleyError::Validation(message) => message.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::unit::{Terms, UnitKind};
    use serde_json::json;

    fn input(title: &str, kind: UnitKind) -> UnitInput {
        UnitInput {
            title: title.to_string(),
            description: None,
            kind,
            deadline: None,
            expedited_reason: None,
            extra_data: None,
            terms: Terms { a: 1, b: 2 },
        }
    }

    fn request(mode: AdmissionMode) -> BatchRequest {
        BatchRequest {
            units: vec![
                input("first", UnitKind::Standard),
                input("second", UnitKind::Expedited),
                input("third", UnitKind::Standard),
            ],
            extra_data: Some(json!({"source": "import"})),
            mode,
            batch_id: Some(BatchId::from("batch-1")),
        }
    }

    #[test]
    fn test_non_atomic_rejects_individually() {
        let plan = plan(request(AdmissionMode::NonAtomic), Utc::now()).unwrap();

        assert_eq!(plan.batch_id, BatchId::from("batch-1"));
        assert_eq!(plan.requested_count, 3);
        assert_eq!(
            plan.units.iter().map(|u| u.title.as_str()).collect::<Vec<_>>(),
            vec!["first", "third"]
        );
        assert_eq!(plan.rejected.len(), 1);
        assert_eq!(plan.rejected[0].index, 1);
        assert_eq!(plan.rejected[0].reason, "Deadline is required for expedited units");
        assert_eq!(plan.rejected[0].original["title"], json!("second"));
    }

    #[test]
    fn test_atomic_fails_on_first_invalid_unit() {
        let err = plan(request(AdmissionMode::Atomic), Utc::now()).unwrap_err();
        match err {
            VolleyError::Batch {
                message,
                rejections,
            } => {
                assert!(message.contains("index 1"), "message: {message}");
                assert_eq!(rejections.len(), 1);
                assert_eq!(rejections[0].index, 1);
            }
            other => panic!("expected batch error, got {other:?}"),
        }
    }

    #[test]
    fn test_batch_metadata_is_stamped_over_extra_data() {
        let now = Utc::now();
        let mut unit = input("a", UnitKind::Standard);
        unit.extra_data = Some(json!({"owner": "ops", "batch_id": "spoofed"}));
        let request = BatchRequest {
            units: vec![unit],
            extra_data: Some(json!({"source": "import"})),
            mode: AdmissionMode::NonAtomic,
            batch_id: Some(BatchId::from("b")),
        };

        let plan = plan(request, now).unwrap();
        let metadata = &plan.units[0].metadata;
        assert_eq!(metadata["owner"], json!("ops"));
        assert_eq!(metadata[BATCH_ID_KEY], json!("b"));
        assert_eq!(metadata[BATCH_EXTRA_DATA_KEY], json!({"source": "import"}));
        assert_eq!(metadata[BATCH_CREATED_AT_KEY], json!(now.to_rfc3339()));
        assert_eq!(plan.units[0].batch_id, Some(BatchId::from("b")));
    }

    #[test]
    fn test_non_object_extra_data_is_a_rejection() {
        let mut unit = input("a", UnitKind::Standard);
        unit.extra_data = Some(json!("not a map"));
        let request = BatchRequest {
            units: vec![unit, input("b", UnitKind::Standard)],
            ..Default::default()
        };

        let plan = plan(request, Utc::now()).unwrap();
        assert_eq!(plan.units.len(), 1);
        assert_eq!(plan.rejected[0].index, 0);
        assert!(plan.rejected[0].reason.contains("JSON object"));
    }

    #[test]
    fn test_reserved_extra_data_key_is_a_rejection() {
        let mut noted = input("noted", UnitKind::Standard);
        noted.extra_data = Some(json!({"error": "client note"}));
        let request = BatchRequest {
            units: vec![input("a", UnitKind::Standard), noted],
            ..Default::default()
        };

        let plan = plan(request, Utc::now()).unwrap();
        assert_eq!(plan.units.len(), 1);
        assert!(!plan.units[0].metadata.contains_key(crate::unit::ERROR_KEY));
        assert_eq!(plan.rejected[0].index, 1);
        assert_eq!(plan.rejected[0].reason, "extra_data key 'error' is reserved");
        assert_eq!(plan.rejected[0].original["extra_data"], json!({"error": "client note"}));
    }

    #[test]
    fn test_batch_id_is_generated_when_absent() {
        let request = BatchRequest {
            units: vec![input("a", UnitKind::Standard)],
            ..Default::default()
        };
        let plan = plan(request, Utc::now()).unwrap();
        assert!(uuid::Uuid::parse_str(plan.batch_id.as_str()).is_ok());
    }
}
