//! State transitions for work units using the typestate pattern.
//!
//! ```text
//! Unit<Pending> ──start()──> Unit<InProgress> ──complete()──> Unit<Completed>
//!       │                          │
//!       └──fail()──> Unit<Failed> <┘──fail()
//! ```
//!
//! Every transition persists the new state before returning it. A transition
//! whose persist fails returns the error and the caller still holds the
//! previous state only if it cloned the unit beforehand.

use ::metrics::counter;

use crate::error::Result;
use crate::manager::Storage;

use super::state::{Completed, ERROR_KEY, Failed, InProgress, Pending, Unit, UnitData};

fn touched(mut data: UnitData) -> UnitData {
    data.updated_at = chrono::Utc::now();
    data
}

fn with_error(mut data: UnitData, error: &str) -> UnitData {
    data.metadata.insert(
        ERROR_KEY.to_string(),
        serde_json::Value::String(error.to_string()),
    );
    touched(data)
}

fn record_transition(kind: &'static str, to: &'static str) {
    counter!("volley_unit_transitions_total", "kind" => kind, "to" => to).increment(1);
}

impl Unit<Pending> {
    /// Mark the unit as picked up by a worker.
    pub async fn start<S: Storage + ?Sized>(self, storage: &S) -> Result<Unit<InProgress>> {
        let unit = Unit {
            data: touched(self.data),
            state: InProgress {
                started_at: chrono::Utc::now(),
            },
        };
        storage.persist(&unit).await?;
        record_transition(unit.data.kind.as_str(), "in_progress");
        Ok(unit)
    }

    /// Fail a unit that never started (e.g. its start could not be persisted).
    pub async fn fail<S: Storage + ?Sized>(
        self,
        error: String,
        storage: &S,
    ) -> Result<Unit<Failed>> {
        fail(self.data, error, storage).await
    }
}

impl Unit<InProgress> {
    /// Record the computed result.
    pub async fn complete<S: Storage + ?Sized>(
        self,
        result: i64,
        storage: &S,
    ) -> Result<Unit<Completed>> {
        let unit = Unit {
            data: touched(self.data),
            state: Completed {
                result,
                started_at: self.state.started_at,
                completed_at: chrono::Utc::now(),
            },
        };
        storage.persist(&unit).await?;
        record_transition(unit.data.kind.as_str(), "completed");
        Ok(unit)
    }

    pub async fn fail<S: Storage + ?Sized>(
        self,
        error: String,
        storage: &S,
    ) -> Result<Unit<Failed>> {
        fail(self.data, error, storage).await
    }
}

async fn fail<S: Storage + ?Sized>(
    data: UnitData,
    error: String,
    storage: &S,
) -> Result<Unit<Failed>> {
    let unit = Unit {
        data: with_error(data, &error),
        state: Failed {
            error,
            failed_at: chrono::Utc::now(),
        },
    };
    storage.persist(&unit).await?;
    record_transition(unit.data.kind.as_str(), "failed");
    Ok(unit)
}
