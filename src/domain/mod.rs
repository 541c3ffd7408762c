//! Core domain types for volley.
//!
//! This module contains pure domain types with no persistence dependencies:
//! - Work units and their typestate machine
//! - Batches, admission results and summaries

pub mod batch;
pub mod unit;
