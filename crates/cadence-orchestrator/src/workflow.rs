use crate::graph::TaskGraph;
use crate::strategy::TaskComplexity;
use crate::types::TaskNode;
use cadence_core::{CadenceError, CadenceResult};
use serde::{Deserialize, Serialize};

/// Declarative description of one task in a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDefinition {
    /// Task id, unique within the workflow.
    pub id: String,
    /// Registry name of the executable unit that performs the task.
    pub executable: String,
    /// Ids of tasks this one waits for.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Static input handed to the executable.
    #[serde(default)]
    pub input: serde_json::Value,
    /// Overrides the orchestrator's retry policy for this task.
    #[serde(default)]
    pub max_retries: Option<u32>,
    /// A failure of an optional task does not fail the workflow.
    #[serde(default)]
    pub optional: bool,
    /// Per-attempt deadline in milliseconds.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl TaskDefinition {
    /// Required task with no dependencies.
    pub fn new(id: impl Into<String>, executable: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            executable: executable.into(),
            depends_on: Vec::new(),
            input: serde_json::Value::Null,
            max_retries: None,
            optional: false,
            timeout_ms: None,
        }
    }

    /// Replace the dependency list.
    pub fn depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on = deps.into_iter().map(Into::into).collect();
        self
    }

    /// Static input for the executable.
    pub fn with_input(mut self, input: serde_json::Value) -> Self {
        self.input = input;
        self
    }

    /// Attempt budget for this task only.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Mark the task optional.
    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    /// Build a graph node without dependency edges.
    pub fn to_node(&self, default_max_retries: u32) -> TaskNode {
        let mut node = TaskNode::new(&self.id, &self.executable)
            .with_input(self.input.clone())
            .with_max_retries(self.max_retries.unwrap_or(default_max_retries));
        node.optional = self.optional;
        node.timeout_ms = self.timeout_ms;
        node
    }
}

/// A named list of tasks and their static dependencies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// Name used to look up spawn rules.
    pub name: String,
    /// Tasks in declaration order.
    #[serde(default, rename = "task")]
    pub tasks: Vec<TaskDefinition>,
}

impl WorkflowDefinition {
    /// Empty workflow named `name`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tasks: Vec::new(),
        }
    }

    /// Append a task.
    pub fn task(mut self, task: TaskDefinition) -> Self {
        self.tasks.push(task);
        self
    }

    /// Parse a definition from TOML (`name = ...` plus `[[task]]` tables).
    pub fn from_toml_str(source: &str) -> CadenceResult<Self> {
        toml::from_str(source).map_err(|e| CadenceError::InvalidWorkflowDefinition(e.to_string()))
    }

    /// Build the initial task graph.
    ///
    /// Tasks may be declared in any order. Duplicate ids, unknown
    /// dependencies, empty executable names and cycles are reported as
    /// [`CadenceError::InvalidWorkflowDefinition`].
    pub fn build_graph(&self, default_max_retries: u32) -> CadenceResult<TaskGraph> {
        let mut graph = TaskGraph::new(&self.name);
        for task in &self.tasks {
            if task.executable.trim().is_empty() {
                return Err(CadenceError::InvalidWorkflowDefinition(format!(
                    "task '{}' has no executable",
                    task.id
                )));
            }
            graph.add_task(task.to_node(default_max_retries)).map_err(invalid)?;
        }
        for task in &self.tasks {
            for dep in &task.depends_on {
                graph.add_dependency(&task.id, dep).map_err(invalid)?;
            }
        }
        Ok(graph)
    }

    /// Structural signals used to size concurrency.
    pub fn complexity(&self) -> TaskComplexity {
        TaskComplexity {
            feature_count: self.tasks.len(),
            dependency_count: self.tasks.iter().map(|t| t.depends_on.len()).sum(),
        }
    }

    /// Distinct executable names referenced by the workflow.
    pub fn executables(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tasks.iter().map(|t| t.executable.as_str()).collect();
        names.sort_unstable();
        names.dedup();
        names
    }
}

fn invalid(err: CadenceError) -> CadenceError {
    CadenceError::InvalidWorkflowDefinition(err.to_string())
}

/// The standard conversion pipeline:
/// `analyze -> plan -> {translate, convert_assets} -> package -> validate`.
pub fn standard_conversion_workflow() -> WorkflowDefinition {
    WorkflowDefinition::new("conversion")
        .task(TaskDefinition::new("analyze", "analyze"))
        .task(TaskDefinition::new("plan", "plan").depends_on(["analyze"]))
        .task(TaskDefinition::new("translate", "translate").depends_on(["plan"]))
        .task(TaskDefinition::new("convert_assets", "convert_assets").depends_on(["plan"]))
        .task(TaskDefinition::new("package", "package").depends_on(["translate", "convert_assets"]))
        .task(TaskDefinition::new("validate", "validate").depends_on(["package"]))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_standard_workflow_shape() {
        let definition = standard_conversion_workflow();
        let graph = definition.build_graph(3).unwrap();
        assert_eq!(graph.len(), 6);
        assert_eq!(graph.topological_layers().len(), 5);
        assert_eq!(graph.get("translate").unwrap().max_retries, 3);
        assert_eq!(definition.complexity().dependency_count, 6);
    }

    #[test]
    fn test_out_of_order_declaration() {
        let definition = WorkflowDefinition::new("wf")
            .task(TaskDefinition::new("package", "package").depends_on(["build"]))
            .task(TaskDefinition::new("build", "build"));
        let graph = definition.build_graph(1).unwrap();
        assert_eq!(graph.ready_tasks(), vec!["build"]);
    }

    #[test]
    fn test_invalid_definitions() {
        let cyclic = WorkflowDefinition::new("wf")
            .task(TaskDefinition::new("a", "a").depends_on(["b"]))
            .task(TaskDefinition::new("b", "b").depends_on(["a"]));
        assert!(matches!(
            cyclic.build_graph(1),
            Err(CadenceError::InvalidWorkflowDefinition(_))
        ));

        let duplicate = WorkflowDefinition::new("wf")
            .task(TaskDefinition::new("a", "a"))
            .task(TaskDefinition::new("a", "a"));
        assert!(duplicate.build_graph(1).is_err());

        let dangling = WorkflowDefinition::new("wf").task(TaskDefinition::new("a", "a").depends_on(["ghost"]));
        assert!(dangling.build_graph(1).is_err());

        let nameless = WorkflowDefinition::new("wf").task(TaskDefinition::new("a", " "));
        assert!(nameless.build_graph(1).is_err());
    }

    #[test]
    fn test_task_overrides() {
        let definition = WorkflowDefinition::new("wf")
            .task(TaskDefinition::new("lint", "lint").optional().with_max_retries(5));
        let graph = definition.build_graph(2).unwrap();
        let lint = graph.get("lint").unwrap();
        assert!(lint.optional);
        assert_eq!(lint.max_retries, 5);
    }

    #[test]
    fn test_from_toml() {
        let source = r#"
            name = "docs"

            [[task]]
            id = "extract"
            executable = "extract"

            [[task]]
            id = "render"
            executable = "render"
            depends_on = ["extract"]
            max_retries = 2
            timeout_ms = 1000
            input = { format = "html" }
        "#;
        let definition = WorkflowDefinition::from_toml_str(source).unwrap();
        assert_eq!(definition.name, "docs");
        assert_eq!(definition.tasks[1].input["format"], "html");
        assert_eq!(definition.executables(), vec!["extract", "render"]);
        let graph = definition.build_graph(3).unwrap();
        assert_eq!(graph.get("render").unwrap().timeout_ms, Some(1000));
    }

    #[test]
    fn test_from_toml_rejects_garbage() {
        assert!(matches!(
            WorkflowDefinition::from_toml_str("name = "),
            Err(CadenceError::InvalidWorkflowDefinition(_))
        ));
    }
}
