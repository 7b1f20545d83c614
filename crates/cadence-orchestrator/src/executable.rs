use crate::types::TaskContext;
use async_trait::async_trait;
use cadence_core::ExecutionError;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

/// The executable unit contract: an external collaborator (an agent call,
/// an asset converter, a validator) that the orchestrator runs as a task.
///
/// Units must be safe to invoke concurrently with other units; the
/// orchestrator never shares mutable state with them beyond the context.
#[async_trait]
pub trait Executable: Send + Sync {
    /// Run the unit once. Return [`ExecutionError::transient`] for failures
    /// worth retrying.
    async fn run(&self, ctx: TaskContext) -> Result<serde_json::Value, ExecutionError>;
}

/// Adapter that turns an async closure into an [`Executable`].
pub struct FnExecutable<F> {
    f: F,
}

impl<F, Fut> FnExecutable<F>
where
    F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<serde_json::Value, ExecutionError>> + Send + 'static,
{
    /// Wrap `f`.
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F, Fut> Executable for FnExecutable<F>
where
    F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<serde_json::Value, ExecutionError>> + Send + 'static,
{
    async fn run(&self, ctx: TaskContext) -> Result<serde_json::Value, ExecutionError> {
        (self.f)(ctx).await
    }
}

/// Wrap an async closure as a shareable executable unit.
pub fn executable_fn<F, Fut>(f: F) -> Arc<dyn Executable>
where
    F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<serde_json::Value, ExecutionError>> + Send + 'static,
{
    Arc::new(FnExecutable::new(f))
}

/// Named executable units available to workflows.
#[derive(Default, Clone)]
pub struct ExecutableRegistry {
    units: HashMap<String, Arc<dyn Executable>>,
}

impl ExecutableRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a unit under `name`, replacing any previous registration.
    pub fn register(&mut self, name: impl Into<String>, unit: Arc<dyn Executable>) {
        self.units.insert(name.into(), unit);
    }

    /// Unit registered under `name`.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Executable>> {
        self.units.get(name).cloned()
    }

    /// Whether `name` is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.units.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.units.keys().cloned().collect();
        names.sort();
        names
    }

    /// Number of registered units.
    pub fn len(&self) -> usize {
        self.units.len()
    }

    /// Whether nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }
}
