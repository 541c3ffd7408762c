//! Work unit aggregate - domain model and state transitions.
//!
//! - Unit types and states (typestate pattern)
//! - State transition methods that persist through [`crate::manager::Storage`]
//! - Outcome records consumed by the aggregator

pub mod state;
pub mod transitions;

pub use state::*;
