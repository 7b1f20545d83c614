//! Parallel orchestration engine: dependency-graph scheduling over a bounded
//! worker pool, with runtime spawning, retries, strategy selection and
//! monitoring.
//!
//! A workflow is a DAG of tasks, each backed by an [`Executable`] unit
//! (typically a call to an external reasoning agent). The
//! [`ParallelOrchestrator`] picks a [`Strategy`] for the run, drives the
//! [`TaskGraph`] against a shared [`WorkerPool`], retries transient
//! failures with exponential backoff, lets completed tasks spawn new work,
//! and falls back once to sequential execution if the chosen strategy
//! fails.
//!
//! # Main types
//!
//! - [`ParallelOrchestrator`] - Runs workflows and exposes status and performance summaries.
//! - [`TaskGraph`] - Dependency DAG plus per-task state machine.
//! - [`WorkerPool`] - Bounded concurrent executor shared across workflows.
//! - [`StrategySelector`] - Maps A/B variants to strategies and keeps performance history.
//! - [`OrchestrationMonitor`] - Event ring buffer, rolling aggregates and alerts.
//! - [`SubTaskSpawner`] - Applies spawn requests under depth and fan-out limits.

/// Orchestrator configuration.
pub mod config;
/// Scheduling loop, fallback and workflow status.
pub mod engine;
/// Executable unit contract and registry.
pub mod executable;
/// Task dependency graph.
pub mod graph;
/// Task event monitoring and alerting.
pub mod monitor;
/// Bounded worker pool.
pub mod pool;
/// Retry policy and delay queue.
pub mod retry;
/// Runtime task spawning.
pub mod spawner;
/// Strategy selection and performance history.
pub mod strategy;
/// Shared orchestration types (TaskNode, TaskState, TaskContext, etc.).
pub mod types;
/// Declarative workflow definitions.
pub mod workflow;

pub use config::OrchestratorConfig;
pub use engine::{ParallelOrchestrator, WorkflowPhase, WorkflowResult, WorkflowStatus};
pub use executable::{executable_fn, Executable, ExecutableRegistry, FnExecutable};
pub use graph::TaskGraph;
pub use monitor::{
    AlertThresholds, AlertType, EventKind, KindStats, MonitorSummary, MonitoringEvent,
    OrchestrationMonitor,
};
pub use pool::{PoolConfig, PoolStats, SubmitMode, TaskHandle, TaskOutcome, WorkerPool};
pub use retry::{compute_backoff, DelayQueue, RetryPolicy};
pub use spawner::{FanOutRule, SpawnRequest, SpawnRule, SubTaskSpawner};
pub use strategy::{
    AdaptiveMode, PerformanceRecord, SelectorConfig, Strategy, StrategyCache, StrategyConfig,
    StrategySelector, StrategyStats, SystemResources, TaskComplexity,
};
pub use types::{FailurePolicy, TaskContext, TaskNode, TaskState};
pub use workflow::{standard_conversion_workflow, TaskDefinition, WorkflowDefinition};
