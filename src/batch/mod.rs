//! Batch types for grouping units.
//!
//! This module re-exports types from `domain::batch`.
//! See that module for the actual implementations.

pub use crate::domain::batch::{
    AdmissionMode, AdmissionStatus, BatchAdmission, BatchId, BatchRequest, BatchStatusReport,
    BatchSummary, DispatchId, OutcomeCounts, Rejection, StatusCounts, UnitStatusEntry,
};
