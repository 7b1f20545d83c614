use cadence_core::ExecutionError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

/// State of a task in the dependency graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Waiting on dependencies or on a free slot.
    Pending,
    /// Computed, never stored: a `Pending` task whose dependencies are resolved.
    Ready,
    /// Submitted to the pool.
    Running,
    /// Finished with a result.
    Completed,
    /// Last attempt failed. Terminal once retries are exhausted.
    Failed,
    /// Will never run.
    Skipped,
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskState::Pending => write!(f, "pending"),
            TaskState::Ready => write!(f, "ready"),
            TaskState::Running => write!(f, "running"),
            TaskState::Completed => write!(f, "completed"),
            TaskState::Failed => write!(f, "failed"),
            TaskState::Skipped => write!(f, "skipped"),
        }
    }
}

/// A unit of work in the task graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskNode {
    /// Unique within the graph.
    pub id: String,
    /// Name of the executable unit in the orchestrator's registry.
    pub executable: String,
    /// Ids of tasks that must finish first.
    pub dependencies: BTreeSet<String>,
    /// Stored state. `Ready` is never stored.
    pub state: TaskState,
    /// Output of the successful attempt.
    pub result: Option<serde_json::Value>,
    /// Error of the last failed attempt.
    pub error: Option<ExecutionError>,
    /// Attempts started so far.
    pub attempt: u32,
    /// Total attempt budget, including the first run. Never below 1.
    pub max_retries: u32,
    /// A failed optional task does not fail the workflow.
    #[serde(default)]
    pub optional: bool,
    /// Static input handed to the executable alongside dependency results.
    #[serde(default)]
    pub input: serde_json::Value,
    /// Per-attempt deadline, overriding the pool default.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// Task that spawned this one at runtime.
    #[serde(default)]
    pub parent: Option<String>,
    /// Depth in the spawn hierarchy (0 = statically declared).
    #[serde(default)]
    pub depth: u32,
    /// When the node was created.
    pub created_at: DateTime<Utc>,
    /// Start of the current or last attempt.
    pub started_at: Option<DateTime<Utc>>,
    /// End of the last finished attempt.
    pub finished_at: Option<DateTime<Utc>>,
}

impl TaskNode {
    /// Pending task with one attempt and no dependencies.
    pub fn new(id: impl Into<String>, executable: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            executable: executable.into(),
            dependencies: BTreeSet::new(),
            state: TaskState::Pending,
            result: None,
            error: None,
            attempt: 0,
            max_retries: 1,
            optional: false,
            input: serde_json::Value::Null,
            timeout_ms: None,
            parent: None,
            depth: 0,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    /// Replace the dependency set.
    pub fn with_dependencies<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies = deps.into_iter().map(Into::into).collect();
        self
    }

    /// Total attempt budget, raised to at least 1.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries.max(1);
        self
    }

    /// Static input handed to the executable.
    pub fn with_input(mut self, input: serde_json::Value) -> Self {
        self.input = input;
        self
    }

    /// Per-attempt deadline in milliseconds.
    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    /// Mark the task optional.
    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    /// Whether the task has reached a state it will never leave.
    ///
    /// A failed task is terminal once its attempt budget is spent or its
    /// last error is not retryable.
    pub fn is_terminal(&self) -> bool {
        match self.state {
            TaskState::Completed | TaskState::Skipped => true,
            TaskState::Failed => !self.can_retry(),
            _ => false,
        }
    }

    /// Whether a failed task may be put back to `Pending`.
    pub fn can_retry(&self) -> bool {
        self.state == TaskState::Failed
            && self.attempt < self.max_retries
            && self.error.as_ref().map_or(true, ExecutionError::is_retryable)
    }

    /// Wall-clock time of the last attempt, if it has finished.
    pub fn duration_ms(&self) -> Option<u64> {
        let started = self.started_at?;
        let finished = self.finished_at?;
        Some((finished - started).num_milliseconds().max(0) as u64)
    }
}

/// Everything an executable unit receives when it runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskContext {
    /// Workflow the task belongs to.
    pub workflow_id: Uuid,
    /// Id of the task being run.
    pub task_id: String,
    /// 1-based attempt number.
    pub attempt: u32,
    /// Static input from the task definition.
    pub input: serde_json::Value,
    /// Results of the task's completed dependencies, keyed by task id.
    pub dependency_results: BTreeMap<String, serde_json::Value>,
}

/// How a terminal task failure propagates to the rest of the graph.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Skip every task that has not started yet; running tasks drain.
    #[default]
    FailFast,
    /// Skip only the failed task's transitive dependents; siblings continue.
    SkipSubtree,
}
