use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// A convenience `Result` alias using [`CadenceError`].
pub type CadenceResult<T> = Result<T, CadenceError>;

/// Failure of a single executable unit.
///
/// This is what a unit returns from `run`, and what the worker pool reports
/// when a unit times out or is cancelled. Per-task failures are absorbed by
/// the retry mechanism and never unwind the scheduling loop on their own.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExecutionError {
    /// The unit ran and reported a failure.
    #[error("execution failed: {message}")]
    Failed {
        /// Human-readable failure description.
        message: String,
        /// Whether a later attempt may succeed.
        retryable: bool,
    },

    /// The unit exceeded its deadline and was cancelled.
    #[error("timed out after {timeout_ms}ms")]
    Timeout {
        /// The deadline that was exceeded.
        timeout_ms: u64,
    },

    /// The unit was cancelled before it finished (workflow cancellation or pool shutdown).
    #[error("cancelled")]
    Cancelled,
}

impl ExecutionError {
    /// A transient failure that the orchestrator may retry.
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
            retryable: true,
        }
    }

    /// A permanent failure; retrying it would not help.
    pub fn permanent(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
            retryable: false,
        }
    }

    /// Whether the retry mechanism should attempt the unit again.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Failed { retryable, .. } => *retryable,
            Self::Timeout { .. } => true,
            Self::Cancelled => false,
        }
    }
}

/// A task that ended `Failed` beyond its retry budget.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskFailure {
    /// Id of the failed task.
    pub task_id: String,
    /// Number of attempts that were made.
    pub attempts: u32,
    /// The error from the last attempt.
    pub error: ExecutionError,
    /// Optional tasks do not fail the workflow.
    pub optional: bool,
}

/// Everything a caller needs to render a diagnostic report for a workflow
/// that did not fully succeed, without re-running anything.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FailureReport {
    /// Results of the tasks that did complete, keyed by task id.
    pub partial_results: BTreeMap<String, serde_json::Value>,
    /// Tasks that failed terminally.
    pub failed_tasks: Vec<TaskFailure>,
    /// Tasks that never ran because an ancestor failed or the workflow was aborted.
    pub skipped_tasks: Vec<String>,
}

impl FailureReport {
    /// Ids of the failed tasks that were not optional.
    pub fn required_failures(&self) -> Vec<&str> {
        self.failed_tasks
            .iter()
            .filter(|f| !f.optional)
            .map(|f| f.task_id.as_str())
            .collect()
    }
}

/// Top-level error type for the Cadence orchestration engine.
///
/// Graph misuse variants (`DuplicateTask`, `UnknownTask`, `Cycle`,
/// `InvalidStateTransition`, `InvalidGraphMutation`) signal a caller bug and
/// are never retried.
#[derive(Debug, Error)]
pub enum CadenceError {
    /// A task with this id already exists in the graph.
    #[error("duplicate task: {0}")]
    DuplicateTask(String),

    /// A referenced task id is not in the graph.
    #[error("unknown task: {0}")]
    UnknownTask(String),

    /// Adding the edge `task_id -> depends_on` would close a cycle.
    #[error("dependency {task_id} -> {depends_on} would create a cycle")]
    Cycle {
        /// The task that would gain the dependency.
        task_id: String,
        /// The dependency that was rejected.
        depends_on: String,
    },

    /// A state transition was requested from a state that does not allow it.
    #[error("task {task_id}: invalid transition {from} -> {to}")]
    InvalidStateTransition {
        /// Task whose state was being changed.
        task_id: String,
        /// State the task was in.
        from: String,
        /// State that was requested.
        to: String,
    },

    /// A runtime graph mutation (spawn or late dependency) was rejected.
    #[error("invalid graph mutation: {0}")]
    InvalidGraphMutation(String),

    /// Non-blocking submission found no free worker slot.
    #[error("worker pool saturated ({capacity} slots busy)")]
    PoolSaturated {
        /// Configured pool capacity.
        capacity: usize,
    },

    /// The worker pool no longer accepts work.
    #[error("worker pool is shut down")]
    PoolShutdown,

    /// A required task failed after its retries were exhausted.
    #[error("task {task_id} failed after {attempts} attempt(s): {source}")]
    TaskExecution {
        /// The first required task that failed terminally.
        task_id: String,
        /// Attempts made for that task.
        attempts: u32,
        /// Error from its last attempt.
        #[source]
        source: ExecutionError,
        /// Partial results and all failures of the run.
        report: Box<FailureReport>,
    },

    /// The scheduler found unfinished tasks but nothing running or runnable.
    #[error("orchestration deadlock: unfinished tasks {pending:?} cannot make progress")]
    OrchestrationDeadlock {
        /// Tasks that were left unfinished.
        pending: Vec<String>,
    },

    /// Both the chosen strategy and the sequential fallback failed.
    #[error("fallback exhausted: {strategy} and sequential fallback both failed")]
    FallbackExhausted {
        /// The strategy that was tried first.
        strategy: String,
        /// Diagnostics from the fallback run.
        report: Box<FailureReport>,
    },

    /// The initial workflow graph is malformed.
    #[error("invalid workflow definition: {0}")]
    InvalidWorkflowDefinition(String),

    /// The workflow was cancelled by an external request.
    #[error("workflow {workflow_id} cancelled")]
    WorkflowCancelled {
        /// The cancelled workflow.
        workflow_id: String,
        /// Results that completed before the cancellation.
        report: Box<FailureReport>,
    },

    /// An error in configuration parsing or validation.
    #[error("Config error: {0}")]
    Config(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CadenceError {
    /// Whether this error comes from misuse of the graph API rather than from task logic.
    pub fn is_contract_violation(&self) -> bool {
        matches!(
            self,
            Self::DuplicateTask(_)
                | Self::UnknownTask(_)
                | Self::Cycle { .. }
                | Self::InvalidStateTransition { .. }
                | Self::InvalidGraphMutation(_)
                | Self::InvalidWorkflowDefinition(_)
        )
    }

    /// The failure report attached to this error, if any.
    pub fn report(&self) -> Option<&FailureReport> {
        match self {
            Self::TaskExecution { report, .. }
            | Self::FallbackExhausted { report, .. }
            | Self::WorkflowCancelled { report, .. } => Some(report),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(ExecutionError::transient("503 from upstream").is_retryable());
        assert!(!ExecutionError::permanent("bad request").is_retryable());
        assert!(ExecutionError::Timeout { timeout_ms: 10 }.is_retryable());
        assert!(!ExecutionError::Cancelled.is_retryable());
    }

    #[test]
    fn test_required_failures_skip_optional() {
        let report = FailureReport {
            failed_tasks: vec![
                TaskFailure {
                    task_id: "translate".into(),
                    attempts: 3,
                    error: ExecutionError::transient("boom"),
                    optional: false,
                },
                TaskFailure {
                    task_id: "lint".into(),
                    attempts: 1,
                    error: ExecutionError::permanent("nope"),
                    optional: true,
                },
            ],
            ..Default::default()
        };
        assert_eq!(report.required_failures(), vec!["translate"]);
    }
}
