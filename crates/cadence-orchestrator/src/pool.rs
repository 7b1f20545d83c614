use crate::executable::Executable;
use crate::types::TaskContext;
use cadence_core::{CadenceError, CadenceResult, ExecutionError};
use futures_util::future::select_all;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// What `submit` does when every slot is busy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmitMode {
    /// Wait for a slot; waiters are served in submission order.
    #[default]
    Blocking,
    /// Fail immediately with [`CadenceError::PoolSaturated`].
    NonBlocking,
}

/// Worker pool settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Maximum number of units running at once, across all workflows.
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    /// Per-submission deadline used when a task sets none.
    #[serde(default = "default_task_timeout_ms")]
    pub task_timeout_ms: u64,
    /// Behaviour of [`WorkerPool::submit`] when every slot is taken.
    #[serde(default)]
    pub submit_mode: SubmitMode,
}

fn default_max_workers() -> usize {
    4
}

fn default_task_timeout_ms() -> u64 {
    300_000
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            task_timeout_ms: default_task_timeout_ms(),
            submit_mode: SubmitMode::default(),
        }
    }
}

/// How a submitted unit ended.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    /// The unit returned a value.
    Success(serde_json::Value),
    /// The unit returned an error or was stopped.
    Failure(ExecutionError),
}

impl TaskOutcome {
    /// Whether the unit returned a value.
    pub fn is_success(&self) -> bool {
        matches!(self, TaskOutcome::Success(_))
    }
}

/// Handle to one submitted unit.
pub struct TaskHandle {
    id: u64,
    workflow_id: Uuid,
    task_id: String,
    cancel: CancellationToken,
    join: JoinHandle<TaskOutcome>,
}

impl TaskHandle {
    /// Pool-wide submission sequence number.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Workflow the unit belongs to.
    pub fn workflow_id(&self) -> Uuid {
        self.workflow_id
    }

    /// Task the unit runs.
    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// Ask the unit to stop. It reports [`ExecutionError::Cancelled`] and frees its slot.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Whether the unit has ended, without awaiting it.
    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }
}

impl std::fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskHandle")
            .field("id", &self.id)
            .field("workflow_id", &self.workflow_id)
            .field("task_id", &self.task_id)
            .finish()
    }
}

/// Snapshot of pool activity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
    /// Total slots.
    pub capacity: usize,
    /// Units holding a slot.
    pub active: usize,
    /// Free slots; zero while shutting down.
    pub available: usize,
    /// Submissions waiting for a slot.
    pub queued: usize,
    /// Units ever submitted.
    pub submitted: u64,
    /// Units that returned a value.
    pub succeeded: u64,
    /// Units that returned an error.
    pub failed: u64,
    /// Units stopped by their deadline.
    pub timed_out: u64,
    /// Units stopped by cancellation or shutdown.
    pub cancelled: u64,
}

#[derive(Default)]
struct Counters {
    in_flight: AtomicUsize,
    queued: AtomicUsize,
    submitted: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    timed_out: AtomicU64,
    cancelled: AtomicU64,
    idle: Notify,
}

impl Counters {
    fn record(&self, outcome: &TaskOutcome) {
        let counter = match outcome {
            TaskOutcome::Success(_) => &self.succeeded,
            TaskOutcome::Failure(ExecutionError::Timeout { .. }) => &self.timed_out,
            TaskOutcome::Failure(ExecutionError::Cancelled) => &self.cancelled,
            TaskOutcome::Failure(_) => &self.failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Holds a worker slot for the lifetime of one unit. Dropping it (normal
/// completion, timeout, cancellation or abort) returns the slot.
struct SlotGuard {
    _permit: OwnedSemaphorePermit,
    counters: Arc<Counters>,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        if self.counters.in_flight.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.counters.idle.notify_waiters();
        }
    }
}

struct QueuedGuard<'a>(&'a AtomicUsize);

impl Drop for QueuedGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Bounded concurrent executor shared by every running workflow.
///
/// Slot accounting is a fair semaphore, so blocked submitters are served
/// first-submitted-first-scheduled. The pool knows nothing about task
/// dependencies.
pub struct WorkerPool {
    capacity: usize,
    default_timeout: Duration,
    mode: SubmitMode,
    slots: Arc<Semaphore>,
    shutdown: CancellationToken,
    accepting: AtomicBool,
    next_id: AtomicU64,
    counters: Arc<Counters>,
}

impl WorkerPool {
    /// Pool sized from `config`. A zero worker count is raised to one.
    pub fn new(config: &PoolConfig) -> Self {
        let capacity = config.max_workers.max(1);
        info!(capacity, "Worker pool started");
        Self {
            capacity,
            default_timeout: Duration::from_millis(config.task_timeout_ms),
            mode: config.submit_mode,
            slots: Arc::new(Semaphore::new(capacity)),
            shutdown: CancellationToken::new(),
            accepting: AtomicBool::new(true),
            next_id: AtomicU64::new(0),
            counters: Arc::new(Counters::default()),
        }
    }

    /// Pool with `capacity` slots and default settings otherwise.
    pub fn with_capacity(capacity: usize) -> Self {
        Self::new(&PoolConfig {
            max_workers: capacity,
            ..PoolConfig::default()
        })
    }

    /// Total slots.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Slots free for new work.
    pub fn available_slots(&self) -> usize {
        if self.accepting.load(Ordering::Acquire) {
            self.slots.available_permits()
        } else {
            0
        }
    }

    /// Units currently holding a slot.
    pub fn active(&self) -> usize {
        self.counters.in_flight.load(Ordering::Acquire)
    }

    /// Whether new submissions are accepted.
    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::Acquire)
    }

    /// Submit a unit using the pool's configured [`SubmitMode`].
    pub async fn submit(
        &self,
        unit: Arc<dyn Executable>,
        ctx: TaskContext,
        timeout: Option<Duration>,
    ) -> CadenceResult<TaskHandle> {
        self.submit_with_mode(unit, ctx, timeout, self.mode).await
    }

    /// Submit a unit. The returned handle resolves through [`Self::await_any`].
    pub async fn submit_with_mode(
        &self,
        unit: Arc<dyn Executable>,
        ctx: TaskContext,
        timeout: Option<Duration>,
        mode: SubmitMode,
    ) -> CadenceResult<TaskHandle> {
        if !self.is_accepting() {
            return Err(CadenceError::PoolShutdown);
        }

        let permit = match mode {
            SubmitMode::Blocking => {
                self.counters.queued.fetch_add(1, Ordering::Relaxed);
                let _queued = QueuedGuard(&self.counters.queued);
                Arc::clone(&self.slots)
                    .acquire_owned()
                    .await
                    .map_err(|_| CadenceError::PoolShutdown)?
            }
            SubmitMode::NonBlocking => match Arc::clone(&self.slots).try_acquire_owned() {
                Ok(permit) => permit,
                Err(TryAcquireError::NoPermits) => {
                    return Err(CadenceError::PoolSaturated {
                        capacity: self.capacity,
                    })
                }
                Err(TryAcquireError::Closed) => return Err(CadenceError::PoolShutdown),
            },
        };

        self.counters.in_flight.fetch_add(1, Ordering::AcqRel);
        self.counters.submitted.fetch_add(1, Ordering::Relaxed);
        let guard = SlotGuard {
            _permit: permit,
            counters: Arc::clone(&self.counters),
        };

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let timeout = timeout.unwrap_or(self.default_timeout);
        let timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        let cancel = self.shutdown.child_token();
        let token = cancel.clone();
        let workflow_id = ctx.workflow_id;
        let task_id = ctx.task_id.clone();

        debug!(handle = id, task_id = %task_id, timeout_ms, "Unit submitted");

        let join = tokio::spawn(async move {
            let outcome = tokio::select! {
                _ = token.cancelled() => TaskOutcome::Failure(ExecutionError::Cancelled),
                res = tokio::time::timeout(timeout, unit.run(ctx)) => match res {
                    Ok(Ok(value)) => TaskOutcome::Success(value),
                    Ok(Err(e)) => TaskOutcome::Failure(e),
                    Err(_) => TaskOutcome::Failure(ExecutionError::Timeout { timeout_ms }),
                },
            };
            guard.counters.record(&outcome);
            outcome
        });

        Ok(TaskHandle {
            id,
            workflow_id,
            task_id,
            cancel,
            join,
        })
    }

    /// Wait until one of `handles` finishes, remove it from the list and
    /// return it with its outcome. Returns `None` for an empty list.
    pub async fn await_any(&self, handles: &mut Vec<TaskHandle>) -> Option<(TaskHandle, TaskOutcome)> {
        if handles.is_empty() {
            return None;
        }
        let (joined, index, _) = select_all(handles.iter_mut().map(|h| &mut h.join)).await;
        let handle = handles.remove(index);
        let outcome = match joined {
            Ok(outcome) => outcome,
            Err(e) if e.is_cancelled() => TaskOutcome::Failure(ExecutionError::Cancelled),
            Err(e) => {
                warn!(task_id = %handle.task_id, error = %e, "Worker panicked");
                TaskOutcome::Failure(ExecutionError::permanent(format!("worker panicked: {e}")))
            }
        };
        Some((handle, outcome))
    }

    /// Stop accepting work. With `drain`, wait for running units to finish;
    /// otherwise cancel them and return immediately.
    pub async fn shutdown(&self, drain: bool) {
        self.accepting.store(false, Ordering::Release);
        self.slots.close();
        if !drain {
            info!(active = self.active(), "Worker pool shutting down, cancelling outstanding units");
            self.shutdown.cancel();
            return;
        }
        info!(active = self.active(), "Worker pool draining");
        loop {
            let idle = self.counters.idle.notified();
            if self.active() == 0 {
                break;
            }
            idle.await;
        }
        info!("Worker pool drained");
    }

    /// Snapshot of counters and slot usage.
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            capacity: self.capacity,
            active: self.active(),
            available: self.available_slots(),
            queued: self.counters.queued.load(Ordering::Relaxed),
            submitted: self.counters.submitted.load(Ordering::Relaxed),
            succeeded: self.counters.succeeded.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            timed_out: self.counters.timed_out.load(Ordering::Relaxed),
            cancelled: self.counters.cancelled.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::executable::executable_fn;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn ctx(task_id: &str) -> TaskContext {
        TaskContext {
            workflow_id: Uuid::new_v4(),
            task_id: task_id.to_string(),
            attempt: 1,
            input: json!(null),
            dependency_results: BTreeMap::new(),
        }
    }

    fn sleeper(ms: u64) -> Arc<dyn Executable> {
        executable_fn(move |ctx: TaskContext| async move {
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok(json!({ "done": ctx.task_id }))
        })
    }

    #[tokio::test]
    async fn test_submit_and_await_any() {
        let pool = WorkerPool::with_capacity(2);
        let mut handles = vec![
            pool.submit(sleeper(200), ctx("slow"), None).await.unwrap(),
            pool.submit(sleeper(5), ctx("fast"), None).await.unwrap(),
        ];
        let (handle, outcome) = pool.await_any(&mut handles).await.unwrap();
        assert_eq!(handle.task_id(), "fast");
        assert_eq!(outcome, TaskOutcome::Success(json!({ "done": "fast" })));
        assert_eq!(handles.len(), 1);

        let (handle, outcome) = pool.await_any(&mut handles).await.unwrap();
        assert_eq!(handle.task_id(), "slow");
        assert!(outcome.is_success());
        assert!(pool.await_any(&mut handles).await.is_none());
    }

    #[tokio::test]
    async fn test_timeout_reports_failure_and_frees_slot() {
        let pool = WorkerPool::with_capacity(1);
        let mut handles = vec![pool
            .submit(sleeper(5_000), ctx("stuck"), Some(Duration::from_millis(20)))
            .await
            .unwrap()];
        let (_, outcome) = pool.await_any(&mut handles).await.unwrap();
        assert_eq!(
            outcome,
            TaskOutcome::Failure(ExecutionError::Timeout { timeout_ms: 20 })
        );
        assert_eq!(pool.active(), 0);
        assert_eq!(pool.available_slots(), 1);
        assert_eq!(pool.stats().timed_out, 1);
    }

    #[tokio::test]
    async fn test_non_blocking_submit_saturates() {
        let pool = WorkerPool::with_capacity(1);
        let mut handles = vec![pool.submit(sleeper(100), ctx("a"), None).await.unwrap()];
        let err = pool
            .submit_with_mode(sleeper(1), ctx("b"), None, SubmitMode::NonBlocking)
            .await
            .unwrap_err();
        assert!(matches!(err, CadenceError::PoolSaturated { capacity: 1 }));

        pool.await_any(&mut handles).await.unwrap();
        let handle = pool
            .submit_with_mode(sleeper(1), ctx("b"), None, SubmitMode::NonBlocking)
            .await
            .unwrap();
        assert_eq!(handle.task_id(), "b");
    }

    #[tokio::test]
    async fn test_blocking_submit_waits_for_slot() {
        let pool = WorkerPool::with_capacity(1);
        let mut handles = vec![pool.submit(sleeper(30), ctx("first"), None).await.unwrap()];
        // Blocks until "first" releases its slot.
        handles.push(pool.submit(sleeper(1), ctx("second"), None).await.unwrap());
        while pool.await_any(&mut handles).await.is_some() {}
        assert_eq!(pool.stats().succeeded, 2);
    }

    #[tokio::test]
    async fn test_cancel_frees_slot() {
        let pool = WorkerPool::with_capacity(1);
        let mut handles = vec![pool.submit(sleeper(10_000), ctx("long"), None).await.unwrap()];
        handles[0].cancel();
        let (_, outcome) = pool.await_any(&mut handles).await.unwrap();
        assert_eq!(outcome, TaskOutcome::Failure(ExecutionError::Cancelled));
        assert_eq!(pool.available_slots(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_drain_waits_then_rejects() {
        let pool = WorkerPool::with_capacity(2);
        let handle = pool.submit(sleeper(20), ctx("a"), None).await.unwrap();
        pool.shutdown(true).await;
        assert_eq!(pool.active(), 0);
        assert_eq!(pool.stats().succeeded, 1);
        drop(handle);
        let err = pool.submit(sleeper(1), ctx("late"), None).await.unwrap_err();
        assert!(matches!(err, CadenceError::PoolShutdown));
    }

    #[tokio::test]
    async fn test_shutdown_without_drain_cancels() {
        let pool = WorkerPool::with_capacity(1);
        let mut handles = vec![pool.submit(sleeper(10_000), ctx("a"), None).await.unwrap()];
        pool.shutdown(false).await;
        let (_, outcome) = pool.await_any(&mut handles).await.unwrap();
        assert_eq!(outcome, TaskOutcome::Failure(ExecutionError::Cancelled));
        assert_eq!(pool.active(), 0);
    }

    #[tokio::test]
    async fn test_unit_error_is_reported() {
        let pool = WorkerPool::with_capacity(1);
        let failing = executable_fn(|_ctx: TaskContext| async move {
            Err(ExecutionError::transient("429 rate limited"))
        });
        let mut handles = vec![pool.submit(failing, ctx("a"), None).await.unwrap()];
        let (_, outcome) = pool.await_any(&mut handles).await.unwrap();
        assert_eq!(
            outcome,
            TaskOutcome::Failure(ExecutionError::transient("429 rate limited"))
        );
        assert_eq!(pool.stats().failed, 1);
    }
}
