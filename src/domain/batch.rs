//! Batch types for grouping work units.
//!
//! A batch has no persisted row of its own: it is the set of units sharing a
//! `batch_id`. The types here describe admission requests, admission results,
//! aggregation summaries and status reports.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::unit::{UnitId, UnitInput, UnitStatus};

/// Identifier shared by every unit of a batch.
///
/// Either supplied by the client or generated at admission time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BatchId(pub String);

impl BatchId {
    /// Generate a fresh random batch identifier.
    pub fn generate() -> Self {
        BatchId(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for BatchId {
    fn from(s: String) -> Self {
        BatchId(s)
    }
}

impl From<&str> for BatchId {
    fn from(s: &str) -> Self {
        BatchId(s.to_string())
    }
}

impl std::ops::Deref for BatchId {
    type Target = str;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl std::fmt::Display for BatchId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How a batch treats invalid units.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdmissionMode {
    /// Any invalid unit rejects the whole batch before anything is persisted.
    Atomic,
    /// Invalid units are rejected individually; the rest are admitted.
    #[default]
    NonAtomic,
}

/// Input parameters for admitting a batch of units.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchRequest {
    /// Units to admit, in submission order.
    #[serde(alias = "operations")]
    pub units: Vec<UnitInput>,
    /// Batch-level data stamped into every accepted unit's metadata.
    #[serde(default)]
    pub extra_data: Option<serde_json::Value>,
    #[serde(default)]
    pub mode: AdmissionMode,
    /// Client-supplied batch id. A fresh one is generated when absent.
    #[serde(default)]
    pub batch_id: Option<BatchId>,
}

/// A unit that was not admitted, with its position in the request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rejection {
    /// 0-based index into `BatchRequest::units`.
    pub index: usize,
    /// Human-readable reason.
    pub reason: String,
    /// The unit exactly as submitted.
    pub original: serde_json::Value,
}

/// Batch status at admission time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdmissionStatus {
    /// At least one unit was accepted and dispatched.
    Processing,
    Completed,
    /// Nothing was accepted.
    Failed,
}

/// Correlation id of a scheduled dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DispatchId(pub Uuid);

impl std::fmt::Display for DispatchId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Display only first 8 characters for readability in logs
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

/// Result of admitting a batch.
#[derive(Debug, Clone, Serialize)]
pub struct BatchAdmission {
    pub batch_id: BatchId,
    pub requested_count: usize,
    /// Ids of persisted units, in submission order.
    pub accepted_unit_ids: Vec<UnitId>,
    pub rejected: Vec<Rejection>,
    /// Id of the dispatch handle, if anything was scheduled.
    pub dispatch_id: Option<DispatchId>,
    pub status: AdmissionStatus,
}

/// Per-outcome counts produced by aggregation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutcomeCounts {
    pub completed: usize,
    pub failed: usize,
    pub not_found: usize,
}

impl OutcomeCounts {
    pub fn total(&self) -> usize {
        self.completed + self.failed + self.not_found
    }
}

/// Summary written once every unit of a dispatch has finished.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub batch_completed_at: DateTime<Utc>,
    pub results: OutcomeCounts,
}

/// Count of units per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub pending: usize,
    pub in_progress: usize,
    pub completed: usize,
    pub failed: usize,
}

impl StatusCounts {
    pub fn record(&mut self, status: UnitStatus) {
        match status {
            UnitStatus::Pending => self.pending += 1,
            UnitStatus::InProgress => self.in_progress += 1,
            UnitStatus::Completed => self.completed += 1,
            UnitStatus::Failed => self.failed += 1,
        }
    }

    pub fn get(&self, status: UnitStatus) -> usize {
        match status {
            UnitStatus::Pending => self.pending,
            UnitStatus::InProgress => self.in_progress,
            UnitStatus::Completed => self.completed,
            UnitStatus::Failed => self.failed,
        }
    }

    /// Check if the batch has finished (all units in a terminal state).
    pub fn is_finished(&self) -> bool {
        self.pending == 0 && self.in_progress == 0
    }
}

/// One unit's line in a batch status report.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UnitStatusEntry {
    pub id: UnitId,
    pub status: UnitStatus,
    pub error: Option<String>,
}

/// Status information for a batch, computed from its member units.
#[derive(Debug, Clone, Serialize)]
pub struct BatchStatusReport {
    pub batch_id: BatchId,
    pub total_units: usize,
    pub status_count: StatusCounts,
    pub units: Vec<UnitStatusEntry>,
}

impl BatchStatusReport {
    /// Check if the batch has finished (all units in a terminal state).
    pub fn is_finished(&self) -> bool {
        self.status_count.is_finished()
    }

    /// Check if the batch is still running.
    pub fn is_running(&self) -> bool {
        !self.is_finished()
    }
}
