use crate::types::{FailurePolicy, TaskContext, TaskNode, TaskState};
use cadence_core::{CadenceError, CadenceResult, ExecutionError, FailureReport, TaskFailure};
use chrono::Utc;
use std::collections::{BTreeMap, HashMap, HashSet};
use uuid::Uuid;

/// The dependency DAG of one workflow execution plus the per-task state machine.
///
/// The graph never executes anything. It is owned by exactly one scheduling
/// loop, so it carries no internal locking. Iteration is always in insertion
/// order, which keeps readiness deterministic.
#[derive(Debug, Clone)]
pub struct TaskGraph {
    workflow_id: Uuid,
    name: String,
    tasks: HashMap<String, TaskNode>,
    order: Vec<String>,
    aborted: bool,
}

impl TaskGraph {
    /// Empty graph with a fresh workflow id.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            workflow_id: Uuid::new_v4(),
            name: name.into(),
            tasks: HashMap::new(),
            order: Vec::new(),
            aborted: false,
        }
    }

    /// Id shared by every status and event of this workflow.
    pub fn workflow_id(&self) -> Uuid {
        self.workflow_id
    }

    /// Name of the workflow type this graph was built from.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Insert a new task. Its declared dependencies must already exist.
    pub fn add_task(&mut self, node: TaskNode) -> CadenceResult<()> {
        if self.tasks.contains_key(&node.id) {
            return Err(CadenceError::DuplicateTask(node.id));
        }
        if let Some(missing) = node.dependencies.iter().find(|d| !self.tasks.contains_key(*d)) {
            return Err(CadenceError::UnknownTask(missing.clone()));
        }
        self.order.push(node.id.clone());
        self.tasks.insert(node.id.clone(), node);
        Ok(())
    }

    /// Make `task_id` depend on `depends_on`.
    ///
    /// Rejected with [`CadenceError::Cycle`] if `task_id` is reachable from
    /// `depends_on`, and with [`CadenceError::InvalidGraphMutation`] if
    /// `task_id` has already left `Pending`.
    pub fn add_dependency(&mut self, task_id: &str, depends_on: &str) -> CadenceResult<()> {
        let task = self.node(task_id)?;
        self.node(depends_on)?;
        if task.state != TaskState::Pending {
            return Err(CadenceError::InvalidGraphMutation(format!(
                "cannot add dependency to {task_id}: task is {}",
                task.state
            )));
        }
        if self.reaches(depends_on, task_id) {
            return Err(CadenceError::Cycle {
                task_id: task_id.to_string(),
                depends_on: depends_on.to_string(),
            });
        }
        if let Some(task) = self.tasks.get_mut(task_id) {
            task.dependencies.insert(depends_on.to_string());
        }
        Ok(())
    }

    /// Whether `to` is reachable from `from` by following dependency edges.
    /// A node reaches itself.
    fn reaches(&self, from: &str, to: &str) -> bool {
        let mut stack = vec![from];
        let mut seen = HashSet::new();
        while let Some(id) = stack.pop() {
            if id == to {
                return true;
            }
            if !seen.insert(id) {
                continue;
            }
            if let Some(task) = self.tasks.get(id) {
                stack.extend(task.dependencies.iter().map(String::as_str));
            }
        }
        false
    }

    fn node(&self, id: &str) -> CadenceResult<&TaskNode> {
        self.tasks
            .get(id)
            .ok_or_else(|| CadenceError::UnknownTask(id.to_string()))
    }

    fn node_mut(&mut self, id: &str) -> CadenceResult<&mut TaskNode> {
        self.tasks
            .get_mut(id)
            .ok_or_else(|| CadenceError::UnknownTask(id.to_string()))
    }

    fn dependencies_resolved(&self, task: &TaskNode) -> bool {
        task.dependencies.iter().all(|dep| {
            self.tasks
                .get(dep)
                .is_some_and(|d| matches!(d.state, TaskState::Completed | TaskState::Skipped))
        })
    }

    /// Ids of every `Pending` task whose dependencies are all `Completed` or
    /// `Skipped`, in insertion order.
    pub fn ready_tasks(&self) -> Vec<String> {
        if self.aborted {
            return Vec::new();
        }
        self.order
            .iter()
            .filter_map(|id| self.tasks.get(id))
            .filter(|t| t.state == TaskState::Pending && self.dependencies_resolved(t))
            .map(|t| t.id.clone())
            .collect()
    }

    /// The stored state, with `Pending` reported as `Ready` when runnable.
    pub fn effective_state(&self, id: &str) -> Option<TaskState> {
        let task = self.tasks.get(id)?;
        if task.state == TaskState::Pending && !self.aborted && self.dependencies_resolved(task) {
            Some(TaskState::Ready)
        } else {
            Some(task.state)
        }
    }

    fn invalid(task: &TaskNode, to: TaskState) -> CadenceError {
        CadenceError::InvalidStateTransition {
            task_id: task.id.clone(),
            from: task.state.to_string(),
            to: to.to_string(),
        }
    }

    /// `Pending` (and ready) -> `Running`. Counts one attempt.
    pub fn mark_running(&mut self, id: &str) -> CadenceResult<()> {
        let task = self.node(id)?;
        if task.state != TaskState::Pending || !self.dependencies_resolved(task) {
            return Err(Self::invalid(task, TaskState::Running));
        }
        let task = self.node_mut(id)?;
        task.state = TaskState::Running;
        task.attempt += 1;
        task.started_at = Some(Utc::now());
        task.finished_at = None;
        Ok(())
    }

    /// `Running` -> `Completed`. The result is stored once and never replaced.
    pub fn mark_completed(&mut self, id: &str, result: serde_json::Value) -> CadenceResult<()> {
        let task = self.node_mut(id)?;
        if task.state != TaskState::Running {
            return Err(Self::invalid(task, TaskState::Completed));
        }
        task.state = TaskState::Completed;
        task.result = Some(result);
        task.error = None;
        task.finished_at = Some(Utc::now());
        Ok(())
    }

    /// `Running` -> `Failed`. Whether the failure is terminal depends on the
    /// attempt budget and the error (see [`TaskNode::is_terminal`]).
    pub fn mark_failed(&mut self, id: &str, error: ExecutionError) -> CadenceResult<()> {
        let task = self.node_mut(id)?;
        if task.state != TaskState::Running {
            return Err(Self::invalid(task, TaskState::Failed));
        }
        task.state = TaskState::Failed;
        task.error = Some(error);
        task.finished_at = Some(Utc::now());
        Ok(())
    }

    /// `Pending` -> `Skipped`.
    pub fn mark_skipped(&mut self, id: &str) -> CadenceResult<()> {
        let task = self.node_mut(id)?;
        if task.state != TaskState::Pending {
            return Err(Self::invalid(task, TaskState::Skipped));
        }
        task.state = TaskState::Skipped;
        task.finished_at = Some(Utc::now());
        Ok(())
    }

    /// Non-terminal `Failed` -> `Pending`, for a retry attempt.
    pub fn retry(&mut self, id: &str) -> CadenceResult<()> {
        let task = self.node_mut(id)?;
        if !task.can_retry() {
            return Err(Self::invalid(task, TaskState::Pending));
        }
        task.state = TaskState::Pending;
        Ok(())
    }

    /// Skip the tasks affected by the terminal failure of `id`.
    ///
    /// Under [`FailurePolicy::SkipSubtree`] and for optional tasks only the
    /// transitive dependents are skipped. Under [`FailurePolicy::FailFast`]
    /// every task that has not started is skipped. Returns the skipped ids
    /// in insertion order.
    pub fn skip_dependents(&mut self, id: &str, policy: FailurePolicy) -> CadenceResult<Vec<String>> {
        let failed = self.node(id)?;
        let whole_graph = policy == FailurePolicy::FailFast && !failed.optional;

        let targets: Vec<String> = self
            .order
            .iter()
            .filter(|other| other.as_str() != id)
            .filter(|other| {
                self.tasks
                    .get(other.as_str())
                    .is_some_and(|t| t.state == TaskState::Pending)
            })
            .filter(|other| whole_graph || self.reaches(other, id))
            .cloned()
            .collect();

        for target in &targets {
            self.mark_skipped(target)?;
        }
        Ok(targets)
    }

    /// Insert a task at runtime under `parent_id`.
    ///
    /// The new task depends on `dependency_ids` and becomes a new dependency
    /// of every task in `dependent_ids`. Dependents must still be `Pending`:
    /// spawned work can only be added in front of tasks that have not
    /// started. Everything is validated before the graph is touched.
    pub fn spawn_task(
        &mut self,
        parent_id: &str,
        mut node: TaskNode,
        dependency_ids: &[String],
        dependent_ids: &[String],
    ) -> CadenceResult<()> {
        let parent_depth = self.node(parent_id)?.depth;
        if self.tasks.contains_key(&node.id) {
            return Err(CadenceError::DuplicateTask(node.id));
        }
        node.dependencies.extend(dependency_ids.iter().cloned());
        if let Some(missing) = node.dependencies.iter().find(|d| !self.tasks.contains_key(*d)) {
            return Err(CadenceError::UnknownTask(missing.clone()));
        }
        for dependent in dependent_ids {
            let consumer = self.node(dependent)?;
            if consumer.state != TaskState::Pending {
                return Err(CadenceError::InvalidGraphMutation(format!(
                    "cannot spawn {} in front of {dependent}: task is {}",
                    node.id, consumer.state
                )));
            }
            if let Some(dep) = node.dependencies.iter().find(|d| self.reaches(d, dependent)) {
                return Err(CadenceError::Cycle {
                    task_id: dependent.clone(),
                    depends_on: dep.clone(),
                });
            }
        }

        node.parent = Some(parent_id.to_string());
        node.depth = parent_depth + 1;
        node.state = TaskState::Pending;
        let id = node.id.clone();
        self.order.push(id.clone());
        self.tasks.insert(id.clone(), node);
        for dependent in dependent_ids {
            if let Some(consumer) = self.tasks.get_mut(dependent) {
                consumer.dependencies.insert(id.clone());
            }
        }
        Ok(())
    }

    /// True iff every task is terminal.
    pub fn is_complete(&self) -> bool {
        self.tasks.values().all(TaskNode::is_terminal)
    }

    /// True iff a non-optional task failed beyond its retry budget.
    pub fn is_failed(&self) -> bool {
        self.tasks
            .values()
            .any(|t| !t.optional && t.state == TaskState::Failed && t.is_terminal())
    }

    /// Give up on the graph: every unfinished task is forced to `Skipped`.
    pub fn abort(&mut self) {
        self.aborted = true;
        let now = Utc::now();
        for task in self.tasks.values_mut() {
            if !task.is_terminal() {
                task.state = TaskState::Skipped;
                task.finished_at = Some(now);
            }
        }
    }

    /// Whether [`abort`](Self::abort) was called.
    pub fn is_aborted(&self) -> bool {
        self.aborted
    }

    /// Build the context handed to the executable of `id`.
    pub fn context_for(&self, id: &str) -> CadenceResult<TaskContext> {
        let task = self.node(id)?;
        let dependency_results = task
            .dependencies
            .iter()
            .filter_map(|dep| {
                let result = self.tasks.get(dep)?.result.clone()?;
                Some((dep.clone(), result))
            })
            .collect();
        Ok(TaskContext {
            workflow_id: self.workflow_id,
            task_id: task.id.clone(),
            attempt: task.attempt,
            input: task.input.clone(),
            dependency_results,
        })
    }

    /// Group tasks into layers where every task depends only on earlier layers.
    pub fn topological_layers(&self) -> Vec<Vec<String>> {
        let mut placed: HashSet<&str> = HashSet::new();
        let mut layers = Vec::new();

        while placed.len() < self.tasks.len() {
            let layer: Vec<String> = self
                .tasks()
                .filter(|t| !placed.contains(t.id.as_str()))
                .filter(|t| t.dependencies.iter().all(|d| placed.contains(d.as_str())))
                .map(|t| t.id.clone())
                .collect();
            if layer.is_empty() {
                break;
            }
            for id in &layer {
                if let Some(task) = self.tasks.get(id) {
                    placed.insert(task.id.as_str());
                }
            }
            layers.push(layer);
        }
        layers
    }

    /// Layer index of each task, as produced by [`Self::topological_layers`].
    pub fn layer_index(&self) -> HashMap<String, usize> {
        self.topological_layers()
            .into_iter()
            .enumerate()
            .flat_map(|(i, layer)| layer.into_iter().map(move |id| (id, i)))
            .collect()
    }

    /// Get a task by id.
    pub fn get(&self, id: &str) -> Option<&TaskNode> {
        self.tasks.get(id)
    }

    /// All tasks in insertion order.
    pub fn tasks(&self) -> impl Iterator<Item = &TaskNode> {
        self.order.iter().filter_map(|id| self.tasks.get(id))
    }

    /// Ids of tasks that are not yet terminal.
    pub fn unfinished(&self) -> Vec<String> {
        self.tasks()
            .filter(|t| !t.is_terminal())
            .map(|t| t.id.clone())
            .collect()
    }

    /// Direct children spawned by `parent_id`.
    pub fn children_of(&self, parent_id: &str) -> Vec<String> {
        self.tasks()
            .filter(|t| t.parent.as_deref() == Some(parent_id))
            .map(|t| t.id.clone())
            .collect()
    }

    /// Results of completed tasks keyed by task id.
    pub fn results(&self) -> BTreeMap<String, serde_json::Value> {
        self.tasks()
            .filter(|t| t.state == TaskState::Completed)
            .filter_map(|t| Some((t.id.clone(), t.result.clone()?)))
            .collect()
    }

    /// Tasks that failed terminally, in insertion order.
    pub fn failures(&self) -> Vec<TaskFailure> {
        self.tasks()
            .filter(|t| t.state == TaskState::Failed && t.is_terminal())
            .map(|t| TaskFailure {
                task_id: t.id.clone(),
                attempts: t.attempt,
                error: t.error.clone().unwrap_or(ExecutionError::Cancelled),
                optional: t.optional,
            })
            .collect()
    }

    /// Results, failures and skipped ids, for error reporting.
    pub fn failure_report(&self) -> FailureReport {
        FailureReport {
            partial_results: self.results(),
            failed_tasks: self.failures(),
            skipped_tasks: self
                .tasks()
                .filter(|t| t.state == TaskState::Skipped)
                .map(|t| t.id.clone())
                .collect(),
        }
    }

    /// Tasks whose stored state is `state`.
    pub fn count_in(&self, state: TaskState) -> usize {
        self.tasks.values().filter(|t| t.state == state).count()
    }

    /// Number of tasks, spawned ones included.
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Whether the graph has no tasks.
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}
