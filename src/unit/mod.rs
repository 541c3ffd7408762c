//! Work unit aggregate - domain model and state transitions.
//!
//! This module re-exports types from `domain::unit`.
//! See that module for the actual implementations.

pub use crate::domain::unit::state::*;
