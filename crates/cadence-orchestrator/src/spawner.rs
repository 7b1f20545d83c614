use crate::graph::TaskGraph;
use crate::types::TaskNode;
use crate::workflow::TaskDefinition;
use cadence_core::{CadenceError, CadenceResult};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// A request to insert a new task into a running workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpawnRequest {
    /// The task to add. `depends_on` lists its predecessors.
    pub task: TaskDefinition,
    /// Pending tasks that must wait for the new task.
    #[serde(default)]
    pub required_by: Vec<String>,
}

/// Maps a completed task's result to zero or more new tasks.
///
/// Rules are registered per workflow type and only run under strategies
/// with spawning enabled.
pub trait SpawnRule: Send + Sync {
    /// Tasks to add after `completed` finished with `result`.
    fn spawn_requests(&self, completed: &TaskNode, result: &serde_json::Value) -> Vec<SpawnRequest>;
}

/// Applies spawn requests to a task graph, enforcing depth and fan-out
/// limits to prevent runaway recursion.
#[derive(Debug, Clone)]
pub struct SubTaskSpawner {
    /// Maximum allowed depth in the task hierarchy (static tasks = 0).
    max_depth: u32,
    /// Maximum number of direct children a single task may have.
    max_children_per_task: u32,
}

impl SubTaskSpawner {
    /// Create a new spawner with default limits (max_depth=3, max_children=25).
    pub fn new() -> Self {
        Self {
            max_depth: 3,
            max_children_per_task: 25,
        }
    }

    /// Set the maximum depth for spawned tasks.
    pub fn with_max_depth(mut self, depth: u32) -> Self {
        self.max_depth = depth;
        self
    }

    /// Set the maximum number of children a single task may spawn.
    pub fn with_max_children(mut self, max: u32) -> Self {
        self.max_children_per_task = max;
        self
    }

    /// Spawn one task under `parent_id`.
    ///
    /// Fails if the parent does not exist, the depth limit would be
    /// exceeded, the parent already has the maximum number of children, or
    /// the graph rejects the insertion.
    pub fn spawn(
        &self,
        graph: &mut TaskGraph,
        parent_id: &str,
        request: SpawnRequest,
        default_max_retries: u32,
    ) -> CadenceResult<String> {
        let parent_depth = graph
            .get(parent_id)
            .ok_or_else(|| CadenceError::UnknownTask(parent_id.to_string()))?
            .depth;

        if parent_depth + 1 > self.max_depth {
            return Err(CadenceError::InvalidGraphMutation(format!(
                "maximum spawn depth {} exceeded (parent depth is {})",
                self.max_depth, parent_depth
            )));
        }

        let children_count = graph.children_of(parent_id).len();
        if children_count >= self.max_children_per_task as usize {
            return Err(CadenceError::InvalidGraphMutation(format!(
                "parent task {} already has {} children (max {})",
                parent_id, children_count, self.max_children_per_task
            )));
        }

        let node = request.task.to_node(default_max_retries);
        let id = node.id.clone();
        graph.spawn_task(parent_id, node, &request.task.depends_on, &request.required_by)?;
        debug!(parent = parent_id, task_id = %id, "Spawned task");
        Ok(id)
    }

    /// Apply every request in order, stopping at the first rejection.
    pub fn spawn_all(
        &self,
        graph: &mut TaskGraph,
        parent_id: &str,
        requests: Vec<SpawnRequest>,
        default_max_retries: u32,
    ) -> CadenceResult<Vec<String>> {
        requests
            .into_iter()
            .map(|request| self.spawn(graph, parent_id, request, default_max_retries))
            .collect()
    }
}

impl Default for SubTaskSpawner {
    fn default() -> Self {
        Self::new()
    }
}

/// Spawns one task per item found in a field of a trigger task's result.
///
/// The field may hold an array (one task per element, the element becomes
/// the task input) or a count (one task per index). Spawned tasks depend
/// only on the trigger and are required by `required_by`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FanOutRule {
    /// Id of the task whose result drives the fan-out.
    pub trigger: String,
    /// Result field holding the discovered items.
    pub field: String,
    /// Executable for each spawned task.
    pub executable: String,
    /// Spawned ids are `{id_prefix}_{index}`.
    pub id_prefix: String,
    /// Existing tasks that must wait for every spawned task.
    #[serde(default)]
    pub required_by: Vec<String>,
}

impl FanOutRule {
    /// Rule spawning one `executable` task per item in `field` of `trigger`'s result.
    pub fn new(
        trigger: impl Into<String>,
        field: impl Into<String>,
        executable: impl Into<String>,
    ) -> Self {
        let executable = executable.into();
        Self {
            trigger: trigger.into(),
            field: field.into(),
            id_prefix: executable.clone(),
            executable,
            required_by: Vec::new(),
        }
    }

    /// Use `prefix` instead of the executable name for spawned ids.
    pub fn with_id_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.id_prefix = prefix.into();
        self
    }

    /// Make each of `ids` depend on the spawned tasks.
    pub fn required_by<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_by = ids.into_iter().map(Into::into).collect();
        self
    }

    /// "analyze found N complex entities": one `convert_entity` task per
    /// entity, all gating `package`.
    pub fn complex_entities() -> Self {
        Self::new("analyze", "complex_entities", "convert_entity").required_by(["package"])
    }
}

impl SpawnRule for FanOutRule {
    fn spawn_requests(&self, completed: &TaskNode, result: &serde_json::Value) -> Vec<SpawnRequest> {
        if completed.id != self.trigger {
            return Vec::new();
        }
        let inputs: Vec<serde_json::Value> = match result.get(&self.field) {
            Some(serde_json::Value::Array(items)) => items.clone(),
            Some(value) => match value.as_u64() {
                Some(count) => (0..count).map(|i| serde_json::json!({ "index": i })).collect(),
                None => Vec::new(),
            },
            None => Vec::new(),
        };

        inputs
            .into_iter()
            .enumerate()
            .map(|(i, input)| SpawnRequest {
                task: TaskDefinition::new(format!("{}_{i}", self.id_prefix), &self.executable)
                    .depends_on([completed.id.clone()])
                    .with_input(input),
                required_by: self.required_by.clone(),
            })
            .collect()
    }
}
