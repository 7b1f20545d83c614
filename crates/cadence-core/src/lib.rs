//! Core error types for the Cadence orchestration engine.
//!
//! This crate provides the error taxonomy shared by every Cadence crate:
//! per-unit execution failures, graph-contract violations, and the
//! workflow-level failures that carry a diagnostic report.
//!
//! # Main types
//!
//! - [`CadenceError`] - Unified error enum for all Cadence subsystems.
//! - [`CadenceResult`] - Convenience alias for `Result<T, CadenceError>`.
//! - [`ExecutionError`] - Failure of a single executable unit.
//! - [`FailureReport`] - Partial results and failures of a workflow run.

mod error;

pub use error::{CadenceError, CadenceResult, ExecutionError, FailureReport, TaskFailure};
