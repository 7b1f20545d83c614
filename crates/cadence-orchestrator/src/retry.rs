use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::time::Duration;
use tokio::time::Instant;

/// Configures retry behaviour for failed tasks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts per task, including the first one.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Base delay in milliseconds for exponential backoff.
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    /// Maximum delay in milliseconds (cap for exponential backoff).
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
}

fn default_max_retries() -> u32 {
    3
}

fn default_backoff_base_ms() -> u64 {
    500
}

fn default_backoff_max_ms() -> u64 {
    30_000
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
        }
    }
}

/// Computes the backoff delay after `attempt` attempts: `base * 2^attempt`,
/// capped at `backoff_max_ms`.
pub fn compute_backoff(policy: &RetryPolicy, attempt: u32) -> Duration {
    let delay = policy
        .backoff_base_ms
        .saturating_mul(2u64.saturating_pow(attempt));
    Duration::from_millis(delay.min(policy.backoff_max_ms))
}

/// Time-ordered queue of deferred retries.
///
/// The scheduling loop owns the queue and drains due entries itself, so a
/// retry never mutates the task graph from a detached timer.
#[derive(Debug, Default)]
pub struct DelayQueue {
    heap: BinaryHeap<Reverse<(Instant, u64, String)>>,
    seq: u64,
}

impl DelayQueue {
    /// Empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule `task_id` to become due after `delay`.
    pub fn push(&mut self, task_id: impl Into<String>, delay: Duration) {
        self.seq += 1;
        self.heap
            .push(Reverse((Instant::now() + delay, self.seq, task_id.into())));
    }

    /// The earliest deadline, if anything is queued.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.heap.peek().map(|Reverse((at, _, _))| *at)
    }

    /// Remove and return every entry due at or before `now`, earliest first.
    pub fn pop_due(&mut self, now: Instant) -> Vec<String> {
        let mut due = Vec::new();
        while let Some(Reverse((at, _, _))) = self.heap.peek() {
            if *at > now {
                break;
            }
            if let Some(Reverse((_, _, id))) = self.heap.pop() {
                due.push(id);
            }
        }
        due
    }

    /// Entries still waiting.
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    /// Whether nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Drop every queued retry, returning the task ids.
    pub fn clear(&mut self) -> Vec<String> {
        self.heap.drain().map(|Reverse((_, _, id))| id).collect()
    }
}
