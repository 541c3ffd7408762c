//! Work unit types using the typestate pattern.
//!
//! Each unit progresses through distinct states, enforced at compile time.
//! Statuses only ever move forward: `pending -> in_progress -> completed | failed`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::batch::BatchId;
use crate::error::{Result, VolleyError};

/// Open key/value map attached to every unit.
pub type Metadata = serde_json::Map<String, serde_json::Value>;

/// Metadata key holding the failure message of a failed unit.
pub const ERROR_KEY: &str = "error";
pub const BATCH_ID_KEY: &str = "batch_id";
pub const BATCH_EXTRA_DATA_KEY: &str = "batch_extra_data";
pub const BATCH_CREATED_AT_KEY: &str = "batch_created_at";
/// Stamped by the aggregator once the unit's whole dispatch has finished.
pub const BATCH_COMPLETION_TIME_KEY: &str = "batch_completion_time";
/// The unit's own outcome record, copied in by the aggregator.
pub const BATCH_RESULT_KEY: &str = "batch_result";

/// Keys only volley itself writes. Caller extra data may not set them.
pub const SYSTEM_METADATA_KEYS: [&str; 3] =
    [ERROR_KEY, BATCH_COMPLETION_TIME_KEY, BATCH_RESULT_KEY];

/// Unique, store-assigned identifier for a unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UnitId(pub i64);

impl std::fmt::Display for UnitId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for UnitId {
    fn from(id: i64) -> Self {
        UnitId(id)
    }
}

/// Kind of unit. Expedited units must carry a deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitKind {
    #[serde(alias = "regular")]
    Standard,
    Expedited,
}

impl UnitKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            UnitKind::Standard => "standard",
            UnitKind::Expedited => "expedited",
        }
    }
}

impl std::str::FromStr for UnitKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "standard" | "regular" => Ok(UnitKind::Standard),
            "expedited" => Ok(UnitKind::Expedited),
            _ => Err(format!("Invalid unit kind: {}", s)),
        }
    }
}

/// Status of a unit, as stored and reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl UnitStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UnitStatus::Pending => "pending",
            UnitStatus::InProgress => "in_progress",
            UnitStatus::Completed => "completed",
            UnitStatus::Failed => "failed",
        }
    }

    /// Position in the forward-only lifecycle. Both terminal statuses share a rank.
    pub fn rank(&self) -> i32 {
        match self {
            UnitStatus::Pending => 0,
            UnitStatus::InProgress => 1,
            UnitStatus::Completed | UnitStatus::Failed => 2,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.rank() == 2
    }

    /// Whether a stored unit in `self` may be overwritten with `next`.
    ///
    /// Re-persisting the same status is allowed; moving between the two
    /// terminal statuses is not.
    pub fn can_become(&self, next: UnitStatus) -> bool {
        *self == next || self.rank() < next.rank()
    }
}

impl std::str::FromStr for UnitStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(UnitStatus::Pending),
            "in_progress" => Ok(UnitStatus::InProgress),
            "completed" => Ok(UnitStatus::Completed),
            "failed" => Ok(UnitStatus::Failed),
            _ => Err(format!("Invalid unit status: {}", s)),
        }
    }
}

/// The two operands a unit combines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Terms {
    pub a: i64,
    pub b: i64,
}

/// Caller-supplied data for a new unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitInput {
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(rename = "type", alias = "kind")]
    pub kind: UnitKind,
    #[serde(default)]
    pub deadline: Option<DateTime<Utc>>,
    #[serde(default)]
    pub expedited_reason: Option<String>,
    /// Free-form data merged into the unit's metadata. Must be a JSON object.
    #[serde(default)]
    pub extra_data: Option<serde_json::Value>,
    pub terms: Terms,
}

impl UnitInput {
    /// Check the domain rules for a unit.
    pub fn validate(&self) -> Result<()> {
        if self.kind == UnitKind::Expedited && self.deadline.is_none() {
            return Err(VolleyError::Validation(
                "Deadline is required for expedited units".to_string(),
            ));
        }
        Ok(())
    }

    /// The unit's own extra data as a metadata map.
    pub fn extra_metadata(&self) -> Result<Metadata> {
        match &self.extra_data {
            None | Some(serde_json::Value::Null) => Ok(Metadata::new()),
            Some(serde_json::Value::Object(map)) => {
                let reserved = SYSTEM_METADATA_KEYS
                    .iter()
                    .find(|key| map.contains_key(**key));
                if let Some(key) = reserved {
                    return Err(VolleyError::Validation(format!(
                        "extra_data key '{}' is reserved",
                        key
                    )));
                }
                Ok(map.clone())
            }
            Some(other) => Err(VolleyError::Validation(format!(
                "extra_data must be a JSON object, got {}",
                json_type_name(other)
            ))),
        }
    }
}

fn json_type_name(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "boolean",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}

/// A validated unit ready to be inserted. The store assigns id and timestamps.
#[derive(Debug, Clone, PartialEq)]
pub struct NewUnit {
    pub title: String,
    pub description: Option<String>,
    pub kind: UnitKind,
    pub deadline: Option<DateTime<Utc>>,
    pub expedited_reason: Option<String>,
    pub terms: Terms,
    pub batch_id: Option<BatchId>,
    pub metadata: Metadata,
}

impl NewUnit {
    /// Build an unbatched unit from validated input.
    pub fn from_input(input: UnitInput) -> Result<Self> {
        input.validate()?;
        let metadata = input.extra_metadata()?;
        Ok(NewUnit {
            title: input.title,
            description: input.description,
            kind: input.kind,
            deadline: input.deadline,
            expedited_reason: input.expedited_reason,
            terms: input.terms,
            batch_id: None,
            metadata,
        })
    }
}

/// Marker trait for valid unit states.
pub trait UnitState: Send + Sync {}

/// A unit of work.
///
/// The generic parameter `T` represents the current state of the unit.
#[derive(Debug, Clone, Serialize)]
pub struct Unit<T: UnitState> {
    pub state: T,
    pub data: UnitData,
}

/// Data common to a unit in every state.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UnitData {
    pub id: UnitId,
    pub title: String,
    pub description: Option<String>,
    pub kind: UnitKind,
    pub deadline: Option<DateTime<Utc>>,
    pub expedited_reason: Option<String>,
    pub terms: Terms,
    /// The batch this unit belongs to, if any. Also stamped in `metadata`.
    pub batch_id: Option<BatchId>,
    pub metadata: Metadata,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl UnitData {
    /// Failure message recorded in metadata, if any.
    pub fn error(&self) -> Option<&str> {
        self.metadata.get(ERROR_KEY).and_then(|v| v.as_str())
    }
}

// ============================================================================
// Unit States
// ============================================================================

/// Unit is waiting to be processed.
#[derive(Debug, Clone, Serialize)]
pub struct Pending {}

impl UnitState for Pending {}

/// Unit has been picked up by a worker.
#[derive(Debug, Clone, Serialize)]
pub struct InProgress {
    pub started_at: DateTime<Utc>,
}

impl UnitState for InProgress {}

/// Unit finished successfully.
#[derive(Debug, Clone, Serialize)]
pub struct Completed {
    pub result: i64,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

impl UnitState for Completed {}

/// Unit failed. The message is mirrored into `metadata.error`.
#[derive(Debug, Clone, Serialize)]
pub struct Failed {
    pub error: String,
    pub failed_at: DateTime<Utc>,
}

impl UnitState for Failed {}

// ============================================================================
// Unified Unit Representation
// ============================================================================

/// Enum that can hold a unit in any state.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", content = "unit", rename_all = "snake_case")]
pub enum AnyUnit {
    Pending(Unit<Pending>),
    InProgress(Unit<InProgress>),
    Completed(Unit<Completed>),
    Failed(Unit<Failed>),
}

impl AnyUnit {
    pub fn id(&self) -> UnitId {
        self.data().id
    }

    pub fn data(&self) -> &UnitData {
        match self {
            AnyUnit::Pending(u) => &u.data,
            AnyUnit::InProgress(u) => &u.data,
            AnyUnit::Completed(u) => &u.data,
            AnyUnit::Failed(u) => &u.data,
        }
    }

    pub fn data_mut(&mut self) -> &mut UnitData {
        match self {
            AnyUnit::Pending(u) => &mut u.data,
            AnyUnit::InProgress(u) => &mut u.data,
            AnyUnit::Completed(u) => &mut u.data,
            AnyUnit::Failed(u) => &mut u.data,
        }
    }

    pub fn status(&self) -> UnitStatus {
        match self {
            AnyUnit::Pending(_) => UnitStatus::Pending,
            AnyUnit::InProgress(_) => UnitStatus::InProgress,
            AnyUnit::Completed(_) => UnitStatus::Completed,
            AnyUnit::Failed(_) => UnitStatus::Failed,
        }
    }

    /// The computed result. Only completed units have one.
    pub fn result(&self) -> Option<i64> {
        match self {
            AnyUnit::Completed(u) => Some(u.state.result),
            _ => None,
        }
    }

    /// Failure message recorded in metadata.
    pub fn error(&self) -> Option<&str> {
        self.data().error()
    }

    pub fn metadata(&self) -> &Metadata {
        &self.data().metadata
    }

    pub fn is_terminal(&self) -> bool {
        self.status().is_terminal()
    }

    /// The outcome record of a finished unit; `None` while it is still running.
    pub fn outcome(&self) -> Option<UnitOutcome> {
        match self {
            AnyUnit::Completed(u) => Some(UnitOutcome::Completed {
                unit_id: u.data.id,
                result: u.state.result,
            }),
            AnyUnit::Failed(u) => Some(UnitOutcome::Failed {
                unit_id: u.data.id,
                error: u.state.error.clone(),
            }),
            AnyUnit::Pending(_) | AnyUnit::InProgress(_) => None,
        }
    }

    pub fn into_pending(self) -> Option<Unit<Pending>> {
        match self {
            AnyUnit::Pending(u) => Some(u),
            _ => None,
        }
    }
}

impl From<Unit<Pending>> for AnyUnit {
    fn from(u: Unit<Pending>) -> Self {
        AnyUnit::Pending(u)
    }
}

impl From<Unit<InProgress>> for AnyUnit {
    fn from(u: Unit<InProgress>) -> Self {
        AnyUnit::InProgress(u)
    }
}

impl From<Unit<Completed>> for AnyUnit {
    fn from(u: Unit<Completed>) -> Self {
        AnyUnit::Completed(u)
    }
}

impl From<Unit<Failed>> for AnyUnit {
    fn from(u: Unit<Failed>) -> Self {
        AnyUnit::Failed(u)
    }
}

/// Result record produced by processing one unit.
///
/// Failures are values here, never errors, so one unit cannot abort its siblings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum UnitOutcome {
    Completed { unit_id: UnitId, result: i64 },
    Failed { unit_id: UnitId, error: String },
    NotFound { unit_id: UnitId },
}

impl UnitOutcome {
    pub fn unit_id(&self) -> UnitId {
        match self {
            UnitOutcome::Completed { unit_id, .. }
            | UnitOutcome::Failed { unit_id, .. }
            | UnitOutcome::NotFound { unit_id } => *unit_id,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            UnitOutcome::Completed { .. } => "completed",
            UnitOutcome::Failed { .. } => "failed",
            UnitOutcome::NotFound { .. } => "not_found",
        }
    }
}

fn default_limit() -> usize {
    100
}

/// Filter for listing units.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitFilter {
    #[serde(default)]
    pub kind: Option<UnitKind>,
    #[serde(default)]
    pub batch_id: Option<BatchId>,
    #[serde(default)]
    pub skip: usize,
    #[serde(default = "default_limit")]
    pub limit: usize,
}

impl Default for UnitFilter {
    fn default() -> Self {
        Self {
            kind: None,
            batch_id: None,
            skip: 0,
            limit: default_limit(),
        }
    }
}

impl UnitFilter {
    pub fn matches(&self, data: &UnitData) -> bool {
        self.kind.is_none_or(|k| k == data.kind)
            && self
                .batch_id
                .as_ref()
                .is_none_or(|b| data.batch_id.as_ref() == Some(b))
    }
}
