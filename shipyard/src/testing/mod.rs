//! Testing utilities for the orchestration engine.
//!
//! This module provides:
//! - A reference shipyard and event builders for executor responses
//! - Recording leader duties and a conflict-injecting store

pub mod fixtures;
pub mod mocks;

pub use fixtures::{eventually, sequence_triggered, task_finished, task_response};
pub use mocks::{ConflictInjectingStore, RecordingDuties};
