use crate::config::OrchestratorConfig;
use crate::executable::{Executable, ExecutableRegistry};
use crate::graph::TaskGraph;
use crate::monitor::{EventKind, MonitoringEvent, OrchestrationMonitor};
use crate::pool::{TaskHandle, TaskOutcome, WorkerPool};
use crate::retry::{compute_backoff, DelayQueue};
use crate::spawner::{SpawnRequest, SpawnRule, SubTaskSpawner};
use crate::strategy::{Strategy, StrategyConfig, StrategySelector, StrategyStats, SystemResources};
use crate::types::{FailurePolicy, TaskState};
use crate::workflow::WorkflowDefinition;
use cadence_core::{CadenceError, CadenceResult, ExecutionError, TaskFailure};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Lifecycle phase of a workflow known to the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowPhase {
    /// Registered, not yet executed.
    Created,
    /// Executing under the selected strategy.
    Running,
    /// The selected strategy failed; the sequential re-run is in progress.
    FallingBack,
    /// All required tasks completed.
    Completed,
    /// Ended with a failure, after the fallback if one ran.
    Failed,
    /// Cancelled through [`ParallelOrchestrator::cancel_workflow`].
    Cancelled,
}

impl WorkflowPhase {
    /// Whether the workflow can no longer change.
    pub fn is_finished(self) -> bool {
        matches!(
            self,
            WorkflowPhase::Completed | WorkflowPhase::Failed | WorkflowPhase::Cancelled
        )
    }
}

/// Point-in-time view of one workflow, as returned by
/// [`ParallelOrchestrator::get_status`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStatus {
    /// Id assigned at creation.
    pub workflow_id: Uuid,
    /// Workflow name from its definition.
    pub name: String,
    /// Current lifecycle phase.
    pub phase: WorkflowPhase,
    /// Strategy in use, once execution started.
    pub strategy: Option<Strategy>,
    /// Whether the sequential fallback ran.
    pub fallback_used: bool,
    /// Effective state of every task (`ready` is reported for runnable tasks).
    pub tasks: BTreeMap<String, TaskState>,
    /// Time of the last phase or task change.
    pub updated_at: DateTime<Utc>,
}

impl WorkflowStatus {
    /// Number of tasks in `state`.
    pub fn count(&self, state: TaskState) -> usize {
        self.tasks.values().filter(|s| **s == state).count()
    }
}

/// Aggregate result of a successful workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowResult {
    /// Id of the finished workflow.
    pub workflow_id: Uuid,
    /// Strategy chosen for the run.
    pub requested_strategy: Strategy,
    /// Strategy that produced these results (`Sequential` after a fallback).
    pub strategy: Strategy,
    /// Whether the sequential fallback produced these results.
    pub fallback_used: bool,
    /// Result of every completed task, keyed by task id.
    pub results: BTreeMap<String, serde_json::Value>,
    /// Optional tasks that failed without failing the workflow.
    pub failures: Vec<TaskFailure>,
    /// Tasks skipped because an optional dependency failed.
    pub skipped: Vec<String>,
    /// Wall-clock time of the whole run, fallback included.
    pub duration_ms: u64,
}

struct WorkflowEntry {
    status: WorkflowStatus,
    cancel: CancellationToken,
}

enum RunEnd {
    Finished,
    Cancelled,
}

enum LoopEvent {
    Cancelled,
    Finished(Option<(TaskHandle, TaskOutcome)>),
    RetryDue,
}

/// Drives workflow task graphs to completion on a shared [`WorkerPool`].
///
/// Each call to [`Self::execute_workflow`] owns its graph and runs a single
/// scheduling loop: submit every task the strategy allows, wait for one
/// completion or retry deadline, apply spawn requests, repeat. Several
/// workflows may run concurrently against the same orchestrator.
pub struct ParallelOrchestrator {
    config: OrchestratorConfig,
    pool: Arc<WorkerPool>,
    registry: RwLock<ExecutableRegistry>,
    selector: Arc<StrategySelector>,
    monitor: Arc<OrchestrationMonitor>,
    spawner: SubTaskSpawner,
    spawn_rules: RwLock<HashMap<String, Vec<Arc<dyn SpawnRule>>>>,
    workflows: RwLock<HashMap<Uuid, WorkflowEntry>>,
    resources: SystemResources,
}

impl ParallelOrchestrator {
    /// Create an orchestrator with its own worker pool.
    pub fn new(config: OrchestratorConfig) -> Self {
        let pool = Arc::new(WorkerPool::new(&config.pool));
        Self::with_pool(config, pool)
    }

    /// Create an orchestrator on a pool shared with other orchestrators.
    pub fn with_pool(config: OrchestratorConfig, pool: Arc<WorkerPool>) -> Self {
        let mut thresholds = config.alerts.clone();
        thresholds.max_concurrency = pool.capacity();
        let monitor = Arc::new(OrchestrationMonitor::new(
            config.monitor.event_capacity,
            thresholds,
        ));
        let selector = Arc::new(StrategySelector::new(config.selector_config()));
        Self {
            spawner: config.spawner(),
            config,
            pool,
            registry: RwLock::new(ExecutableRegistry::new()),
            selector,
            monitor,
            spawn_rules: RwLock::new(HashMap::new()),
            workflows: RwLock::new(HashMap::new()),
            resources: SystemResources::detect(),
        }
    }

    /// Use a selector shared with other orchestrators.
    pub fn with_selector(mut self, selector: Arc<StrategySelector>) -> Self {
        self.selector = selector;
        self
    }

    /// Use a monitor shared with other orchestrators.
    pub fn with_monitor(mut self, monitor: Arc<OrchestrationMonitor>) -> Self {
        self.monitor = monitor;
        self
    }

    /// Override the detected host resources used for strategy sizing.
    pub fn with_resources(mut self, resources: SystemResources) -> Self {
        self.resources = resources;
        self
    }

    /// Configuration the orchestrator was built with.
    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// The worker pool shared by all workflows.
    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    /// Event monitor fed by every workflow.
    pub fn monitor(&self) -> &Arc<OrchestrationMonitor> {
        &self.monitor
    }

    /// Strategy selector and its performance history.
    pub fn selector(&self) -> &Arc<StrategySelector> {
        &self.selector
    }

    /// Make `unit` available to tasks whose executable is `name`.
    pub fn register_executable(&self, name: impl Into<String>, unit: Arc<dyn Executable>) {
        let name = name.into();
        debug!(executable = %name, "Executable registered");
        self.registry.write().register(name, unit);
    }

    /// Attach a spawning rule to every workflow named `workflow_name`.
    pub fn register_spawn_rule(&self, workflow_name: impl Into<String>, rule: Arc<dyn SpawnRule>) {
        self.spawn_rules
            .write()
            .entry(workflow_name.into())
            .or_default()
            .push(rule);
    }

    fn rules_for(&self, workflow_name: &str) -> Vec<Arc<dyn SpawnRule>> {
        self.spawn_rules
            .read()
            .get(workflow_name)
            .cloned()
            .unwrap_or_default()
    }

    /// Build the initial task graph for `definition`.
    ///
    /// Fails with [`CadenceError::InvalidWorkflowDefinition`] if the graph is
    /// malformed or a task names an unregistered executable.
    pub fn create_workflow(&self, definition: &WorkflowDefinition) -> CadenceResult<TaskGraph> {
        let graph = definition.build_graph(self.config.retry.max_retries)?;
        {
            let registry = self.registry.read();
            if let Some(task) = definition
                .tasks
                .iter()
                .find(|t| !registry.contains(&t.executable))
            {
                return Err(CadenceError::InvalidWorkflowDefinition(format!(
                    "task '{}' uses unregistered executable '{}'",
                    task.id, task.executable
                )));
            }
        }
        self.track(&graph, WorkflowPhase::Created, None);
        info!(
            workflow_id = %graph.workflow_id(),
            workflow = %graph.name(),
            tasks = graph.len(),
            "Workflow created"
        );
        Ok(graph)
    }

    /// Execute `graph` under `strategy`, sized to the pool.
    pub async fn execute_workflow(
        &self,
        graph: TaskGraph,
        strategy: Strategy,
    ) -> CadenceResult<WorkflowResult> {
        let max_concurrency = self.pool.capacity().min(self.config.concurrency_ceiling);
        let config = StrategyConfig::for_strategy(strategy, max_concurrency, self.config.retry.clone());
        self.execute_with_config(graph, strategy, config).await
    }

    /// Select a strategy for `variant_id`, build the graph and execute it.
    pub async fn run_workflow(
        &self,
        definition: &WorkflowDefinition,
        variant_id: &str,
    ) -> CadenceResult<WorkflowResult> {
        let (strategy, config) =
            self.selector
                .select_strategy(variant_id, &definition.complexity(), &self.resources);
        let graph = self.create_workflow(definition)?;
        self.execute_with_config(graph, strategy, config).await
    }

    /// Execute `graph` with an explicit strategy configuration.
    ///
    /// If the run ends with a required task failed, the strategy is not
    /// `Sequential` and fallback is enabled, the workflow is re-run once from
    /// its initial state with the sequential strategy.
    pub async fn execute_with_config(
        &self,
        mut graph: TaskGraph,
        strategy: Strategy,
        config: StrategyConfig,
    ) -> CadenceResult<WorkflowResult> {
        let workflow_id = graph.workflow_id();
        let cancel = self.track(&graph, WorkflowPhase::Running, Some(strategy));
        let pristine = graph.clone();
        let started = Instant::now();

        info!(
            workflow_id = %workflow_id,
            workflow = %graph.name(),
            strategy = %strategy,
            max_concurrency = config.max_concurrency,
            spawning = config.spawning_enabled,
            "Workflow started"
        );

        let first = self.drive(&mut graph, strategy, &config, &cancel).await;
        match first {
            Err(e) => {
                self.record_run(&graph, strategy, false, started);
                self.finish(&graph, WorkflowPhase::Failed);
                error!(workflow_id = %workflow_id, error = %e, "Workflow aborted");
                Err(e)
            }
            Ok(RunEnd::Cancelled) => Err(self.cancelled(&mut graph)),
            Ok(RunEnd::Finished) if !graph.is_failed() => {
                self.record_run(&graph, strategy, true, started);
                self.finish(&graph, WorkflowPhase::Completed);
                let result = workflow_result(&graph, strategy, strategy, false, started);
                info!(
                    workflow_id = %workflow_id,
                    tasks = result.results.len(),
                    duration_ms = result.duration_ms,
                    "Workflow completed"
                );
                Ok(result)
            }
            Ok(RunEnd::Finished) => {
                self.record_run(&graph, strategy, false, started);
                if strategy == Strategy::Sequential || !self.config.fallback_enabled {
                    self.finish(&graph, WorkflowPhase::Failed);
                    let err = task_execution_error(&graph);
                    error!(workflow_id = %workflow_id, error = %err, "Workflow failed");
                    return Err(err);
                }
                self.fallback(pristine, strategy, &config, &cancel, started).await
            }
        }
    }

    /// The one-shot sequential re-run after a failed strategy.
    async fn fallback(
        &self,
        mut graph: TaskGraph,
        failed_strategy: Strategy,
        config: &StrategyConfig,
        cancel: &CancellationToken,
        started: Instant,
    ) -> CadenceResult<WorkflowResult> {
        let workflow_id = graph.workflow_id();
        warn!(
            workflow_id = %workflow_id,
            strategy = %failed_strategy,
            "Strategy failed, falling back to sequential execution"
        );
        self.set_phase(workflow_id, WorkflowPhase::FallingBack, Some(Strategy::Sequential));

        let sequential = StrategyConfig::for_strategy(Strategy::Sequential, 1, config.retry.clone());
        let fallback_started = Instant::now();
        match self.drive(&mut graph, Strategy::Sequential, &sequential, cancel).await {
            Err(e) => {
                self.record_run(&graph, Strategy::Sequential, false, fallback_started);
                self.finish(&graph, WorkflowPhase::Failed);
                Err(e)
            }
            Ok(RunEnd::Cancelled) => Err(self.cancelled(&mut graph)),
            Ok(RunEnd::Finished) if !graph.is_failed() => {
                self.record_run(&graph, Strategy::Sequential, true, fallback_started);
                self.finish(&graph, WorkflowPhase::Completed);
                info!(workflow_id = %workflow_id, "Sequential fallback completed");
                Ok(workflow_result(&graph, failed_strategy, Strategy::Sequential, true, started))
            }
            Ok(RunEnd::Finished) => {
                self.record_run(&graph, Strategy::Sequential, false, fallback_started);
                self.finish(&graph, WorkflowPhase::Failed);
                let report = graph.failure_report();
                error!(
                    workflow_id = %workflow_id,
                    failed = ?report.required_failures(),
                    "Sequential fallback failed"
                );
                Err(CadenceError::FallbackExhausted {
                    strategy: failed_strategy.to_string(),
                    report: Box::new(report),
                })
            }
        }
    }

    fn cancelled(&self, graph: &mut TaskGraph) -> CadenceError {
        graph.abort();
        self.finish(graph, WorkflowPhase::Cancelled);
        info!(workflow_id = %graph.workflow_id(), "Workflow cancelled");
        CadenceError::WorkflowCancelled {
            workflow_id: graph.workflow_id().to_string(),
            report: Box::new(graph.failure_report()),
        }
    }

    /// Run the scheduling loop, then cancel and reap whatever is still
    /// outstanding so no pool slot outlives the run.
    async fn drive(
        &self,
        graph: &mut TaskGraph,
        strategy: Strategy,
        config: &StrategyConfig,
        cancel: &CancellationToken,
    ) -> CadenceResult<RunEnd> {
        let mut outstanding = Vec::new();
        let result = self
            .schedule(graph, strategy, config, cancel, &mut outstanding)
            .await;
        for handle in &outstanding {
            handle.cancel();
        }
        while let Some((handle, _)) = self.pool.await_any(&mut outstanding).await {
            self.record_abandoned(graph, handle.task_id());
        }
        result
    }

    async fn schedule(
        &self,
        graph: &mut TaskGraph,
        strategy: Strategy,
        config: &StrategyConfig,
        cancel: &CancellationToken,
        outstanding: &mut Vec<TaskHandle>,
    ) -> CadenceResult<RunEnd> {
        let workflow_id = graph.workflow_id();
        let rules = if config.spawning_enabled {
            self.rules_for(graph.name())
        } else {
            Vec::new()
        };
        let layers = (strategy == Strategy::Hybrid).then(|| graph.layer_index());
        let mut retries = DelayQueue::new();
        let mut spawns: Vec<(String, Vec<SpawnRequest>)> = Vec::new();

        loop {
            if cancel.is_cancelled() {
                return Ok(RunEnd::Cancelled);
            }
            if graph.is_complete() {
                return Ok(RunEnd::Finished);
            }

            // Phase 1: submit everything the strategy and the pool allow.
            for task_id in submittable(graph, layers.as_ref()) {
                if outstanding.len() >= config.max_concurrency {
                    break;
                }
                if !outstanding.is_empty() && self.pool.available_slots() == 0 {
                    break;
                }
                let handle = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => None,
                    handle = self.dispatch(graph, &task_id) => Some(handle?),
                };
                match handle {
                    Some(handle) => outstanding.push(handle),
                    None => return Ok(RunEnd::Cancelled),
                }
            }

            if outstanding.is_empty() && retries.is_empty() {
                let pending = graph.unfinished();
                error!(workflow_id = %workflow_id, pending = ?pending, "Orchestration deadlock");
                return Err(CadenceError::OrchestrationDeadlock { pending });
            }

            // Phase 2: wait for one completion or the next retry deadline.
            let deadline = retries.next_deadline();
            let event = tokio::select! {
                biased;
                _ = cancel.cancelled() => LoopEvent::Cancelled,
                finished = self.pool.await_any(outstanding), if !outstanding.is_empty() => {
                    LoopEvent::Finished(finished)
                }
                _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    LoopEvent::RetryDue
                }
            };

            match event {
                LoopEvent::Cancelled => return Ok(RunEnd::Cancelled),
                LoopEvent::Finished(Some((handle, outcome))) => {
                    if let Some(requests) =
                        self.apply_outcome(graph, handle.task_id(), outcome, config, &rules, &mut retries)?
                    {
                        spawns.push((handle.task_id().to_string(), requests));
                    }
                }
                LoopEvent::Finished(None) | LoopEvent::RetryDue => {}
            }

            if self.config.failure_policy == FailurePolicy::FailFast
                && graph.is_failed()
                && !retries.is_empty()
            {
                for task_id in retries.clear() {
                    graph.retry(&task_id)?;
                    graph.mark_skipped(&task_id)?;
                    debug!(workflow_id = %workflow_id, task_id = %task_id, "Pending retry dropped");
                }
            }

            for task_id in retries.pop_due(Instant::now()) {
                graph.retry(&task_id)?;
                debug!(workflow_id = %workflow_id, task_id = %task_id, "Retry due");
            }

            // Phase 3: apply spawn requests produced by this iteration.
            for (parent, requests) in spawns.drain(..) {
                let requests = self.admissible_spawns(graph, &parent, requests);
                if requests.is_empty() {
                    continue;
                }
                let spawned =
                    self.spawner
                        .spawn_all(graph, &parent, requests, config.retry.max_retries)?;
                info!(
                    workflow_id = %workflow_id,
                    parent = %parent,
                    spawned = spawned.len(),
                    "Spawned tasks from result"
                );
            }

            self.refresh_status(graph);
        }
    }

    /// Spawn requests that can still take effect. Requests are dropped when
    /// a fail-fast workflow has already failed or when a consumer they
    /// would gate is no longer `Pending`. Unknown ids are kept so
    /// [`SubTaskSpawner`] rejects them.
    fn admissible_spawns(
        &self,
        graph: &TaskGraph,
        parent: &str,
        requests: Vec<SpawnRequest>,
    ) -> Vec<SpawnRequest> {
        let workflow_id = graph.workflow_id();
        if self.config.failure_policy == FailurePolicy::FailFast && graph.is_failed() {
            warn!(
                workflow_id = %workflow_id,
                parent,
                dropped = requests.len(),
                "Workflow already failed, spawn requests dropped"
            );
            return Vec::new();
        }
        requests
            .into_iter()
            .filter(|request| {
                let settled = request
                    .required_by
                    .iter()
                    .find(|id| graph.get(id).is_some_and(|n| n.state != TaskState::Pending));
                match settled {
                    Some(consumer) => {
                        warn!(
                            workflow_id = %workflow_id,
                            parent,
                            task_id = %request.task.id,
                            consumer = %consumer,
                            "Consumer no longer pending, spawn request dropped"
                        );
                        false
                    }
                    None => true,
                }
            })
            .collect()
    }

    /// Record that an outstanding attempt was abandoned, so the monitor
    /// stops counting it as running.
    fn record_abandoned(&self, graph: &TaskGraph, task_id: &str) {
        let Some(node) = graph.get(task_id) else {
            return;
        };
        let mut event =
            MonitoringEvent::new(graph.workflow_id(), task_id, &node.executable, EventKind::Cancelled);
        event.duration_ms = node
            .started_at
            .map(|started| (Utc::now() - started).num_milliseconds().max(0) as u64);
        self.monitor.record_event(event);
    }

    /// Mark `task_id` running and hand it to the pool.
    async fn dispatch(&self, graph: &mut TaskGraph, task_id: &str) -> CadenceResult<TaskHandle> {
        let node = graph
            .get(task_id)
            .ok_or_else(|| CadenceError::UnknownTask(task_id.to_string()))?;
        let executable = node.executable.clone();
        let timeout = node.timeout_ms.map(Duration::from_millis);

        let unit = {
            let registry = self.registry.read();
            registry.get(&executable)
        };
        let unit = unit.ok_or_else(|| {
            CadenceError::InvalidWorkflowDefinition(format!(
                "task '{task_id}' uses unregistered executable '{executable}'"
            ))
        })?;

        graph.mark_running(task_id)?;
        let ctx = graph.context_for(task_id)?;
        let attempt = ctx.attempt;
        let handle = self.pool.submit(unit, ctx, timeout).await?;

        self.monitor.record_event(MonitoringEvent::new(
            graph.workflow_id(),
            task_id,
            &executable,
            EventKind::Started,
        ));
        debug!(workflow_id = %graph.workflow_id(), task_id, attempt, "Task started");
        Ok(handle)
    }

    /// Apply one unit outcome to the graph. Returns the spawn requests a
    /// successful task produced, if any.
    fn apply_outcome(
        &self,
        graph: &mut TaskGraph,
        task_id: &str,
        outcome: TaskOutcome,
        config: &StrategyConfig,
        rules: &[Arc<dyn SpawnRule>],
        retries: &mut DelayQueue,
    ) -> CadenceResult<Option<Vec<SpawnRequest>>> {
        let workflow_id = graph.workflow_id();
        match outcome {
            TaskOutcome::Success(value) => {
                graph.mark_completed(task_id, value)?;
                let node = graph
                    .get(task_id)
                    .ok_or_else(|| CadenceError::UnknownTask(task_id.to_string()))?;

                let mut event =
                    MonitoringEvent::new(workflow_id, task_id, &node.executable, EventKind::Completed);
                event.duration_ms = node.duration_ms();
                self.monitor.record_event(event);
                info!(workflow_id = %workflow_id, task_id, attempt = node.attempt, "Task completed");

                let requests: Vec<SpawnRequest> = match &node.result {
                    Some(result) => rules
                        .iter()
                        .flat_map(|rule| rule.spawn_requests(node, result))
                        .collect(),
                    None => Vec::new(),
                };
                Ok((!requests.is_empty()).then_some(requests))
            }
            TaskOutcome::Failure(err) => {
                graph.mark_failed(task_id, err.clone())?;
                let node = graph
                    .get(task_id)
                    .ok_or_else(|| CadenceError::UnknownTask(task_id.to_string()))?;
                let attempt = node.attempt;
                let retry = node.can_retry();
                let mut event = MonitoringEvent::new(
                    workflow_id,
                    task_id,
                    &node.executable,
                    if retry { EventKind::Retried } else { EventKind::Failed },
                );
                event.duration_ms = node.duration_ms();
                self.monitor.record_event(event);

                if retry {
                    let delay = compute_backoff(&config.retry, attempt);
                    retries.push(task_id, delay);
                    warn!(
                        workflow_id = %workflow_id,
                        task_id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Task failed, retry scheduled"
                    );
                } else {
                    let skipped = graph.skip_dependents(task_id, self.config.failure_policy)?;
                    error!(
                        workflow_id = %workflow_id,
                        task_id,
                        attempts = attempt,
                        skipped = skipped.len(),
                        error = %err,
                        "Task failed"
                    );
                }
                Ok(None)
            }
        }
    }

    /// Current status of a workflow created or executed by this orchestrator.
    pub fn get_status(&self, workflow_id: Uuid) -> Option<WorkflowStatus> {
        self.workflows
            .read()
            .get(&workflow_id)
            .map(|entry| entry.status.clone())
    }

    /// Per-strategy success rate and mean duration over the retention window.
    pub fn get_strategy_performance_summary(&self) -> BTreeMap<Strategy, StrategyStats> {
        let hours = i64::try_from(self.config.performance.retention_hours).unwrap_or(i64::MAX / 3_600_000);
        self.selector.performance_summary(ChronoDuration::hours(hours))
    }

    /// Cancel a workflow. Outstanding submissions are cancelled and the graph
    /// is marked aborted. Returns false if the workflow is unknown or
    /// already finished.
    pub fn cancel_workflow(&self, workflow_id: Uuid) -> bool {
        let workflows = self.workflows.read();
        match workflows.get(&workflow_id) {
            Some(entry) if !entry.status.phase.is_finished() => {
                entry.cancel.cancel();
                info!(workflow_id = %workflow_id, "Workflow cancellation requested");
                true
            }
            _ => false,
        }
    }

    /// Stop the worker pool. See [`WorkerPool::shutdown`].
    pub async fn shutdown(&self, drain: bool) {
        self.pool.shutdown(drain).await;
    }

    fn track(&self, graph: &TaskGraph, phase: WorkflowPhase, strategy: Option<Strategy>) -> CancellationToken {
        let mut workflows = self.workflows.write();
        let entry = workflows
            .entry(graph.workflow_id())
            .or_insert_with(|| WorkflowEntry {
                status: WorkflowStatus {
                    workflow_id: graph.workflow_id(),
                    name: graph.name().to_string(),
                    phase,
                    strategy,
                    fallback_used: false,
                    tasks: BTreeMap::new(),
                    updated_at: Utc::now(),
                },
                cancel: CancellationToken::new(),
            });
        entry.status.phase = phase;
        if strategy.is_some() {
            entry.status.strategy = strategy;
        }
        entry.status.tasks = task_states(graph);
        entry.status.updated_at = Utc::now();
        entry.cancel.clone()
    }

    fn set_phase(&self, workflow_id: Uuid, phase: WorkflowPhase, strategy: Option<Strategy>) {
        if let Some(entry) = self.workflows.write().get_mut(&workflow_id) {
            entry.status.phase = phase;
            if phase == WorkflowPhase::FallingBack {
                entry.status.fallback_used = true;
            }
            if strategy.is_some() {
                entry.status.strategy = strategy;
            }
            entry.status.updated_at = Utc::now();
        }
    }

    fn refresh_status(&self, graph: &TaskGraph) {
        let tasks = task_states(graph);
        if let Some(entry) = self.workflows.write().get_mut(&graph.workflow_id()) {
            entry.status.tasks = tasks;
            entry.status.updated_at = Utc::now();
        }
    }

    fn finish(&self, graph: &TaskGraph, phase: WorkflowPhase) {
        self.refresh_status(graph);
        self.set_phase(graph.workflow_id(), phase, None);
        self.evict_finished();
    }

    /// Drop the oldest finished workflows once more than
    /// `max_tracked_workflows` are tracked. Unfinished ones are never evicted.
    fn evict_finished(&self) {
        let limit = self.config.max_tracked_workflows;
        let mut workflows = self.workflows.write();
        if workflows.len() <= limit {
            return;
        }
        let mut finished: Vec<(DateTime<Utc>, Uuid)> = workflows
            .iter()
            .filter(|(_, entry)| entry.status.phase.is_finished())
            .map(|(id, entry)| (entry.status.updated_at, *id))
            .collect();
        finished.sort_unstable();
        let excess = workflows.len() - limit;
        for (_, id) in finished.into_iter().take(excess) {
            workflows.remove(&id);
            debug!(workflow_id = %id, "Finished workflow evicted from status tracking");
        }
    }

    fn record_run(&self, graph: &TaskGraph, strategy: Strategy, success: bool, started: Instant) {
        self.selector.record_performance(
            strategy,
            success,
            elapsed_ms(started),
            serde_json::json!({
                "workflow_id": graph.workflow_id(),
                "workflow": graph.name(),
                "tasks": graph.len(),
            }),
        );
    }
}

/// Ready tasks the strategy allows right now. Hybrid only releases tasks in
/// the lowest topological layer that still has unfinished work.
fn submittable(graph: &TaskGraph, layers: Option<&HashMap<String, usize>>) -> Vec<String> {
    let ready = graph.ready_tasks();
    let Some(layers) = layers else {
        return ready;
    };
    let current = graph
        .unfinished()
        .iter()
        .filter_map(|id| layers.get(id))
        .min()
        .copied();
    ready
        .into_iter()
        .filter(|id| layers.get(id).copied() == current)
        .collect()
}

fn task_states(graph: &TaskGraph) -> BTreeMap<String, TaskState> {
    graph
        .tasks()
        .filter_map(|t| Some((t.id.clone(), graph.effective_state(&t.id)?)))
        .collect()
}

fn task_execution_error(graph: &TaskGraph) -> CadenceError {
    let report = graph.failure_report();
    let failure = report
        .failed_tasks
        .iter()
        .find(|f| !f.optional)
        .cloned()
        .unwrap_or_else(|| TaskFailure {
            task_id: String::new(),
            attempts: 0,
            error: ExecutionError::permanent("no failed task recorded"),
            optional: false,
        });
    CadenceError::TaskExecution {
        task_id: failure.task_id,
        attempts: failure.attempts,
        source: failure.error,
        report: Box::new(report),
    }
}

fn workflow_result(
    graph: &TaskGraph,
    requested: Strategy,
    executed: Strategy,
    fallback_used: bool,
    started: Instant,
) -> WorkflowResult {
    let report = graph.failure_report();
    WorkflowResult {
        workflow_id: graph.workflow_id(),
        requested_strategy: requested,
        strategy: executed,
        fallback_used,
        results: report.partial_results,
        failures: report.failed_tasks,
        skipped: report.skipped_tasks,
        duration_ms: elapsed_ms(started),
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::executable::executable_fn;
    use crate::types::TaskContext;
    use crate::workflow::TaskDefinition;
    use serde_json::json;

    fn orchestrator() -> ParallelOrchestrator {
        let orchestrator = ParallelOrchestrator::new(OrchestratorConfig::default());
        orchestrator.register_executable(
            "echo",
            executable_fn(|ctx: TaskContext| async move { Ok(json!({ "task": ctx.task_id })) }),
        );
        orchestrator
    }

    fn two_step() -> WorkflowDefinition {
        WorkflowDefinition::new("two_step")
            .task(TaskDefinition::new("first", "echo"))
            .task(TaskDefinition::new("second", "echo").depends_on(["first"]))
    }

    #[test]
    fn test_create_workflow_tracks_status() {
        let orchestrator = orchestrator();
        let graph = orchestrator.create_workflow(&two_step()).unwrap();
        let status = orchestrator.get_status(graph.workflow_id()).unwrap();
        assert_eq!(status.phase, WorkflowPhase::Created);
        assert_eq!(status.tasks["first"], TaskState::Ready);
        assert_eq!(status.tasks["second"], TaskState::Pending);
        assert!(status.strategy.is_none());
    }

    #[test]
    fn test_create_workflow_rejects_unregistered_executable() {
        let orchestrator = orchestrator();
        let definition = two_step().task(TaskDefinition::new("third", "missing"));
        let err = orchestrator.create_workflow(&definition).unwrap_err();
        assert!(matches!(err, CadenceError::InvalidWorkflowDefinition(msg) if msg.contains("missing")));
    }

    #[tokio::test]
    async fn test_execute_updates_status_and_performance() {
        let orchestrator = orchestrator();
        let graph = orchestrator.create_workflow(&two_step()).unwrap();
        let id = graph.workflow_id();

        let result = orchestrator
            .execute_workflow(graph, Strategy::ParallelBasic)
            .await
            .unwrap();
        assert_eq!(result.results["second"], json!({ "task": "second" }));
        assert!(!result.fallback_used);

        let status = orchestrator.get_status(id).unwrap();
        assert_eq!(status.phase, WorkflowPhase::Completed);
        assert_eq!(status.strategy, Some(Strategy::ParallelBasic));
        assert_eq!(status.count(TaskState::Completed), 2);

        let summary = orchestrator.get_strategy_performance_summary();
        assert_eq!(summary[&Strategy::ParallelBasic].runs, 1);
        assert_eq!(summary[&Strategy::ParallelBasic].successes, 1);
    }

    #[tokio::test]
    async fn test_cancel_finished_or_unknown_workflow() {
        let orchestrator = orchestrator();
        assert!(!orchestrator.cancel_workflow(Uuid::new_v4()));

        let graph = orchestrator.create_workflow(&two_step()).unwrap();
        let id = graph.workflow_id();
        orchestrator
            .execute_workflow(graph, Strategy::Sequential)
            .await
            .unwrap();
        assert!(!orchestrator.cancel_workflow(id));
    }

    #[tokio::test]
    async fn test_cancel_before_execution() {
        let orchestrator = orchestrator();
        let graph = orchestrator.create_workflow(&two_step()).unwrap();
        assert!(orchestrator.cancel_workflow(graph.workflow_id()));

        let err = orchestrator
            .execute_workflow(graph, Strategy::ParallelBasic)
            .await
            .unwrap_err();
        match err {
            CadenceError::WorkflowCancelled { report, .. } => {
                assert!(report.partial_results.is_empty());
                assert_eq!(report.skipped_tasks.len(), 2);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_empty_workflow_completes() {
        let orchestrator = orchestrator();
        let graph = orchestrator
            .create_workflow(&WorkflowDefinition::new("empty"))
            .unwrap();
        let result = orchestrator
            .execute_workflow(graph, Strategy::Hybrid)
            .await
            .unwrap();
        assert!(result.results.is_empty());
    }

    #[tokio::test]
    async fn test_finished_workflows_evicted_past_limit() {
        let mut config = OrchestratorConfig::default();
        config.max_tracked_workflows = 2;
        let orchestrator = ParallelOrchestrator::new(config);
        orchestrator.register_executable(
            "echo",
            executable_fn(|ctx: TaskContext| async move { Ok(json!({ "task": ctx.task_id })) }),
        );

        let mut ids = Vec::new();
        for _ in 0..3 {
            let graph = orchestrator.create_workflow(&two_step()).unwrap();
            ids.push(graph.workflow_id());
            orchestrator
                .execute_workflow(graph, Strategy::Sequential)
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        assert!(orchestrator.get_status(ids[0]).is_none());
        assert!(orchestrator.get_status(ids[1]).is_some());
        assert!(orchestrator.get_status(ids[2]).is_some());
    }

    #[test]
    fn test_hybrid_gates_to_lowest_layer() {
        let mut graph = TaskGraph::new("g");
        graph.add_task(crate::types::TaskNode::new("a", "echo")).unwrap();
        graph.add_task(crate::types::TaskNode::new("b", "echo")).unwrap();
        graph
            .add_task(crate::types::TaskNode::new("c", "echo").with_dependencies(["a"]))
            .unwrap();
        let layers = graph.layer_index();

        graph.mark_running("a").unwrap();
        graph.mark_completed("a", json!(null)).unwrap();
        // "c" is ready but layer 0 still has "b" unfinished.
        assert_eq!(submittable(&graph, None), vec!["b", "c"]);
        assert_eq!(submittable(&graph, Some(&layers)), vec!["b"]);
    }
}
