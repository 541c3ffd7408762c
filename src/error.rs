//! Error types for volley.

use thiserror::Error;

use crate::batch::{BatchId, Rejection};
use crate::unit::UnitId;

/// Result type alias using the volley error type.
pub type Result<T> = std::result::Result<T, VolleyError>;

/// Main error type for volley.
#[derive(Error, Debug)]
pub enum VolleyError {
    /// A domain rule was violated (e.g. an expedited unit without a deadline).
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Work unit not found: {0}")]
    UnitNotFound(UnitId),

    /// No unit carries this batch id.
    #[error("Batch not found: {0}")]
    BatchNotFound(BatchId),

    /// Batch admission was rejected as a whole.
    #[error("Batch rejected: {message}")]
    Batch {
        message: String,
        rejections: Vec<Rejection>,
    },

    /// The stored unit is in a state the requested write cannot move it out of.
    #[error("Invalid state transition: unit {0} is in state '{1}', cannot become '{2}'")]
    InvalidState(UnitId, String, String),

    /// The scheduler no longer accepts work.
    #[error("Scheduler is shutting down")]
    Shutdown,

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Unexpected store or infrastructure failure.
    #[error(transparent)]
    Service(#[from] anyhow::Error),
}

impl VolleyError {
    /// Whether this error means the addressed unit or batch does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            VolleyError::UnitNotFound(_) | VolleyError::BatchNotFound(_)
        )
    }
}
