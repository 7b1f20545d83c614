use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{error, warn};
use uuid::Uuid;

/// Kind of a task lifecycle event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// An attempt was handed to the worker pool.
    Started,
    /// The task finished successfully.
    Completed,
    /// The task failed terminally.
    Failed,
    /// An attempt failed and another one is scheduled.
    Retried,
    /// An outstanding attempt was abandoned when its workflow was cancelled
    /// or aborted.
    Cancelled,
}

/// One task lifecycle event emitted by the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitoringEvent {
    /// Workflow the task belongs to.
    pub workflow_id: Uuid,
    /// Task id within the workflow.
    pub task_id: String,
    /// Executable name of the task, used to group aggregates.
    pub task_kind: String,
    /// What happened.
    pub kind: EventKind,
    /// When the event was recorded.
    pub timestamp: DateTime<Utc>,
    /// Duration of the attempt, for events that end one.
    pub duration_ms: Option<u64>,
}

impl MonitoringEvent {
    /// Event stamped with the current time and no duration.
    pub fn new(
        workflow_id: Uuid,
        task_id: impl Into<String>,
        task_kind: impl Into<String>,
        kind: EventKind,
    ) -> Self {
        Self {
            workflow_id,
            task_id: task_id.into(),
            task_kind: task_kind.into(),
            kind,
            timestamp: Utc::now(),
            duration_ms: None,
        }
    }

    /// Attach the attempt duration.
    pub fn with_duration_ms(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }
}

/// Lifetime counters for one task kind.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KindStats {
    /// Attempts started.
    pub started: u64,
    /// Tasks completed.
    pub completed: u64,
    /// Tasks failed terminally.
    pub failed: u64,
    /// Attempts that failed and were rescheduled.
    pub retried: u64,
    /// Attempts abandoned by cancellation.
    #[serde(default)]
    pub cancelled: u64,
    /// Sum of completed task durations.
    pub total_duration_ms: u64,
    /// Longest completed task.
    pub max_duration_ms: u64,
}

impl KindStats {
    fn apply(&mut self, event: &MonitoringEvent) {
        match event.kind {
            EventKind::Started => self.started += 1,
            EventKind::Completed => self.completed += 1,
            EventKind::Failed => self.failed += 1,
            EventKind::Retried => self.retried += 1,
            EventKind::Cancelled => self.cancelled += 1,
        }
        if matches!(event.kind, EventKind::Completed) {
            if let Some(ms) = event.duration_ms {
                self.total_duration_ms += ms;
                self.max_duration_ms = self.max_duration_ms.max(ms);
            }
        }
    }

    /// Mean duration of completed tasks.
    pub fn mean_duration_ms(&self) -> f64 {
        if self.completed == 0 {
            0.0
        } else {
            self.total_duration_ms as f64 / self.completed as f64
        }
    }
}

/// Thresholds that raise alerts when crossed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertThresholds {
    /// Terminal failures over finished tasks, in `[0, 1]`.
    #[serde(default = "default_max_failure_rate")]
    pub max_failure_rate: f64,
    /// Mean duration of completed tasks.
    #[serde(default = "default_max_mean_duration_ms")]
    pub max_mean_duration_ms: u64,
    /// Running tasks allowed before the pool is considered over capacity.
    /// The orchestrator sets this to the worker pool capacity.
    #[serde(skip, default = "default_max_concurrency")]
    pub max_concurrency: usize,
    /// How long concurrency may stay above `max_concurrency` before alerting.
    #[serde(default = "default_concurrency_grace_ms")]
    pub concurrency_grace_ms: u64,
    /// Finished tasks required before rate and duration alerts are evaluated.
    #[serde(default = "default_min_samples")]
    pub min_samples: u64,
}

fn default_max_failure_rate() -> f64 {
    0.25
}

fn default_max_mean_duration_ms() -> u64 {
    120_000
}

fn default_max_concurrency() -> usize {
    4
}

fn default_concurrency_grace_ms() -> u64 {
    5_000
}

fn default_min_samples() -> u64 {
    5
}

impl Default for AlertThresholds {
    fn default() -> Self {
        Self {
            max_failure_rate: default_max_failure_rate(),
            max_mean_duration_ms: default_max_mean_duration_ms(),
            max_concurrency: default_max_concurrency(),
            concurrency_grace_ms: default_concurrency_grace_ms(),
            min_samples: default_min_samples(),
        }
    }
}

/// Conditions the monitor alerts on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertType {
    /// Failure rate over the buffered events is above `max_failure_rate`.
    HighFailureRate,
    /// Mean completed duration over the buffered events is above
    /// `max_mean_duration_ms`.
    SlowTasks,
    /// More tasks running than the pool holds, for longer than the grace period.
    ConcurrencyOverCapacity,
}

impl std::fmt::Display for AlertType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AlertType::HighFailureRate => write!(f, "high_failure_rate"),
            AlertType::SlowTasks => write!(f, "slow_tasks"),
            AlertType::ConcurrencyOverCapacity => write!(f, "concurrency_over_capacity"),
        }
    }
}

/// Alert sink. Invoked synchronously on the thread that recorded the event.
pub type AlertCallback = Arc<dyn Fn(AlertType, &serde_json::Value) + Send + Sync>;

/// Aggregates over a time window.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MonitorSummary {
    /// Width of the window the summary covers.
    pub window_hours: f64,
    /// Attempts started.
    pub started: u64,
    /// Tasks completed.
    pub completed: u64,
    /// Tasks failed terminally.
    pub failed: u64,
    /// Attempts rescheduled after a failure.
    pub retried: u64,
    /// Attempts abandoned by cancellation.
    #[serde(default)]
    pub cancelled: u64,
    /// `failed / (completed + failed)`.
    pub failure_rate: f64,
    /// Median attempt duration.
    pub p50_duration_ms: u64,
    /// 95th percentile attempt duration.
    pub p95_duration_ms: u64,
    /// Completed tasks per hour over the window.
    pub throughput_per_hour: f64,
}

/// Totals over the events currently in the ring buffer. Updated as events
/// enter and leave the buffer.
#[derive(Default)]
struct WindowTotals {
    completed: u64,
    failed: u64,
    completed_duration_ms: u64,
}

impl WindowTotals {
    fn add(&mut self, event: &MonitoringEvent) {
        match event.kind {
            EventKind::Completed => {
                self.completed += 1;
                self.completed_duration_ms += event.duration_ms.unwrap_or(0);
            }
            EventKind::Failed => self.failed += 1,
            _ => {}
        }
    }

    fn remove(&mut self, event: &MonitoringEvent) {
        match event.kind {
            EventKind::Completed => {
                self.completed = self.completed.saturating_sub(1);
                self.completed_duration_ms = self
                    .completed_duration_ms
                    .saturating_sub(event.duration_ms.unwrap_or(0));
            }
            EventKind::Failed => self.failed = self.failed.saturating_sub(1),
            _ => {}
        }
    }
}

struct MonitorState {
    events: VecDeque<MonitoringEvent>,
    window: WindowTotals,
    kinds: BTreeMap<String, KindStats>,
    running: HashSet<(Uuid, String)>,
    over_capacity_since: Option<DateTime<Utc>>,
    active_alerts: HashSet<AlertType>,
}

/// Passive observer of task events. Keeps a bounded ring buffer plus
/// per-kind aggregates and raises edge-triggered alerts.
///
/// Failure-rate and duration alerts are judged over the events still in
/// the buffer, so recent behavior is not diluted by old history.
///
/// One writer lock covers the whole state, so readers from several
/// workflows can query it concurrently.
pub struct OrchestrationMonitor {
    capacity: usize,
    thresholds: AlertThresholds,
    state: RwLock<MonitorState>,
    callbacks: RwLock<Vec<AlertCallback>>,
}

impl OrchestrationMonitor {
    /// Monitor keeping at most `capacity` events.
    pub fn new(capacity: usize, thresholds: AlertThresholds) -> Self {
        Self {
            capacity: capacity.max(1),
            thresholds,
            state: RwLock::new(MonitorState {
                events: VecDeque::new(),
                window: WindowTotals::default(),
                kinds: BTreeMap::new(),
                running: HashSet::new(),
                over_capacity_since: None,
                active_alerts: HashSet::new(),
            }),
            callbacks: RwLock::new(Vec::new()),
        }
    }

    /// Thresholds alerts are evaluated against.
    pub fn thresholds(&self) -> &AlertThresholds {
        &self.thresholds
    }

    /// Register an alert sink.
    pub fn add_alert_callback<F>(&self, callback: F)
    where
        F: Fn(AlertType, &serde_json::Value) + Send + Sync + 'static,
    {
        self.callbacks.write().push(Arc::new(callback));
    }

    /// Record an event, update aggregates and fire any alert whose
    /// threshold was just crossed.
    pub fn record_event(&self, event: MonitoringEvent) {
        let fired = {
            let mut state = self.state.write();
            state
                .kinds
                .entry(event.task_kind.clone())
                .or_default()
                .apply(&event);

            let key = (event.workflow_id, event.task_id.clone());
            match event.kind {
                EventKind::Started => {
                    state.running.insert(key);
                }
                EventKind::Completed
                | EventKind::Failed
                | EventKind::Retried
                | EventKind::Cancelled => {
                    state.running.remove(&key);
                }
            }

            let now = event.timestamp;
            state.window.add(&event);
            state.events.push_back(event);
            while state.events.len() > self.capacity {
                if let Some(evicted) = state.events.pop_front() {
                    state.window.remove(&evicted);
                }
            }
            self.evaluate_alerts(&mut state, now)
        };

        if fired.is_empty() {
            return;
        }
        let callbacks: Vec<AlertCallback> = self.callbacks.read().clone();
        for (alert, data) in fired {
            warn!(alert = %alert, data = %data, "Orchestration alert raised");
            for callback in &callbacks {
                let outcome = catch_unwind(AssertUnwindSafe(|| callback(alert, &data)));
                if outcome.is_err() {
                    error!(alert = %alert, "Alert callback panicked");
                }
            }
        }
    }

    fn evaluate_alerts(
        &self,
        state: &mut MonitorState,
        now: DateTime<Utc>,
    ) -> Vec<(AlertType, serde_json::Value)> {
        let mut fired = Vec::new();

        let completed = state.window.completed;
        let failed = state.window.failed;
        let duration = state.window.completed_duration_ms;
        let finished = completed + failed;
        let sampled = finished >= self.thresholds.min_samples;

        let failure_rate = if finished == 0 {
            0.0
        } else {
            failed as f64 / finished as f64
        };
        let high_failure = sampled && failure_rate > self.thresholds.max_failure_rate;
        if Self::edge(state, AlertType::HighFailureRate, high_failure) {
            fired.push((
                AlertType::HighFailureRate,
                serde_json::json!({
                    "failure_rate": failure_rate,
                    "threshold": self.thresholds.max_failure_rate,
                    "finished": finished,
                }),
            ));
        }

        let mean = if completed == 0 {
            0.0
        } else {
            duration as f64 / completed as f64
        };
        let slow = sampled && completed > 0 && mean > self.thresholds.max_mean_duration_ms as f64;
        if Self::edge(state, AlertType::SlowTasks, slow) {
            fired.push((
                AlertType::SlowTasks,
                serde_json::json!({
                    "mean_duration_ms": mean,
                    "threshold_ms": self.thresholds.max_mean_duration_ms,
                }),
            ));
        }

        let running = state.running.len();
        let over = running > self.thresholds.max_concurrency;
        let sustained = if over {
            let since = *state.over_capacity_since.get_or_insert(now);
            now - since >= ChronoDuration::milliseconds(self.thresholds.concurrency_grace_ms as i64)
        } else {
            state.over_capacity_since = None;
            false
        };
        if Self::edge(state, AlertType::ConcurrencyOverCapacity, sustained) {
            fired.push((
                AlertType::ConcurrencyOverCapacity,
                serde_json::json!({
                    "running": running,
                    "capacity": self.thresholds.max_concurrency,
                }),
            ));
        }
        fired
    }

    /// Returns true when `alert` transitions from clear to raised.
    /// A raised alert re-arms once its condition clears.
    fn edge(state: &mut MonitorState, alert: AlertType, condition: bool) -> bool {
        if condition {
            state.active_alerts.insert(alert)
        } else {
            state.active_alerts.remove(&alert);
            false
        }
    }

    /// Failure rate, duration percentiles and throughput over the last
    /// `window_hours`, computed from the events still in the buffer.
    pub fn performance_summary(&self, window_hours: f64) -> MonitorSummary {
        let window_ms = (window_hours.max(0.0) * 3_600_000.0) as i64;
        let cutoff = Utc::now() - ChronoDuration::milliseconds(window_ms);
        let state = self.state.read();

        let mut summary = MonitorSummary {
            window_hours,
            ..MonitorSummary::default()
        };
        let mut durations = Vec::new();
        for event in state.events.iter().filter(|e| e.timestamp >= cutoff) {
            match event.kind {
                EventKind::Started => summary.started += 1,
                EventKind::Completed => summary.completed += 1,
                EventKind::Failed => summary.failed += 1,
                EventKind::Retried => summary.retried += 1,
                EventKind::Cancelled => summary.cancelled += 1,
            }
            if !matches!(event.kind, EventKind::Started | EventKind::Cancelled) {
                durations.extend(event.duration_ms);
            }
        }

        let finished = summary.completed + summary.failed;
        if finished > 0 {
            summary.failure_rate = summary.failed as f64 / finished as f64;
        }
        durations.sort_unstable();
        summary.p50_duration_ms = percentile(&durations, 50);
        summary.p95_duration_ms = percentile(&durations, 95);
        if window_hours > 0.0 {
            summary.throughput_per_hour = summary.completed as f64 / window_hours;
        }
        summary
    }

    /// Lifetime aggregates per task kind.
    pub fn kind_stats(&self) -> BTreeMap<String, KindStats> {
        self.state.read().kinds.clone()
    }

    /// The `n` most recent events, oldest first.
    pub fn recent_events(&self, n: usize) -> Vec<MonitoringEvent> {
        let state = self.state.read();
        let skip = state.events.len().saturating_sub(n);
        state.events.iter().skip(skip).cloned().collect()
    }

    /// Events currently in the buffer for one task.
    pub fn events_for(&self, task_id: &str) -> Vec<MonitoringEvent> {
        self.state
            .read()
            .events
            .iter()
            .filter(|e| e.task_id == task_id)
            .cloned()
            .collect()
    }

    /// Tasks currently observed as running.
    pub fn running(&self) -> usize {
        self.state.read().running.len()
    }

    /// Alerts currently raised, sorted by name.
    pub fn active_alerts(&self) -> Vec<AlertType> {
        let mut alerts: Vec<AlertType> = self.state.read().active_alerts.iter().copied().collect();
        alerts.sort_by_key(|a| a.to_string());
        alerts
    }

    /// Serialize the current state as JSON (for a dashboard).
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "kinds": self.kind_stats(),
            "running": self.running(),
            "active_alerts": self.active_alerts(),
            "summary_24h": self.performance_summary(24.0),
        })
    }
}

impl Default for OrchestrationMonitor {
    fn default() -> Self {
        Self::new(10_000, AlertThresholds::default())
    }
}

/// Nearest-rank percentile of sorted values.
fn percentile(sorted: &[u64], pct: usize) -> u64 {
    if sorted.is_empty() {
        return 0;
    }
    let rank = (pct * sorted.len()).div_ceil(100).max(1);
    sorted[rank.min(sorted.len()) - 1]
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn event(wf: Uuid, task: &str, kind: EventKind, duration_ms: Option<u64>) -> MonitoringEvent {
        let mut event = MonitoringEvent::new(wf, task, "translate", kind);
        event.duration_ms = duration_ms;
        event
    }

    fn thresholds() -> AlertThresholds {
        AlertThresholds {
            max_failure_rate: 0.5,
            max_mean_duration_ms: 1_000,
            max_concurrency: 2,
            concurrency_grace_ms: 0,
            min_samples: 2,
        }
    }

    #[test]
    fn test_ring_buffer_drops_oldest() {
        let monitor = OrchestrationMonitor::new(3, AlertThresholds::default());
        let wf = Uuid::new_v4();
        for i in 0..5 {
            monitor.record_event(event(wf, &format!("t{i}"), EventKind::Started, None));
        }
        let recent = monitor.recent_events(10);
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].task_id, "t2");
        assert_eq!(monitor.recent_events(1)[0].task_id, "t4");
        // Aggregates keep counting past the buffer.
        assert_eq!(monitor.kind_stats()["translate"].started, 5);
    }

    #[test]
    fn test_kind_stats() {
        let monitor = OrchestrationMonitor::default();
        let wf = Uuid::new_v4();
        monitor.record_event(event(wf, "a", EventKind::Started, None));
        monitor.record_event(event(wf, "a", EventKind::Completed, Some(100)));
        monitor.record_event(event(wf, "b", EventKind::Started, None));
        monitor.record_event(event(wf, "b", EventKind::Completed, Some(300)));
        let stats = &monitor.kind_stats()["translate"];
        assert_eq!(stats.completed, 2);
        assert_eq!(stats.max_duration_ms, 300);
        assert!((stats.mean_duration_ms() - 200.0).abs() < f64::EPSILON);
        assert_eq!(monitor.running(), 0);
    }

    #[test]
    fn test_performance_summary() {
        let monitor = OrchestrationMonitor::default();
        let wf = Uuid::new_v4();
        for (i, ms) in [10, 20, 30, 40].into_iter().enumerate() {
            let id = format!("t{i}");
            monitor.record_event(event(wf, &id, EventKind::Started, None));
            monitor.record_event(event(wf, &id, EventKind::Completed, Some(ms)));
        }
        monitor.record_event(event(wf, "bad", EventKind::Started, None));
        monitor.record_event(event(wf, "bad", EventKind::Failed, Some(1_000)));

        let summary = monitor.performance_summary(1.0);
        assert_eq!(summary.started, 5);
        assert_eq!(summary.completed, 4);
        assert_eq!(summary.failed, 1);
        assert!((summary.failure_rate - 0.2).abs() < 1e-9);
        assert_eq!(summary.p50_duration_ms, 30);
        assert_eq!(summary.p95_duration_ms, 1_000);
        assert!((summary.throughput_per_hour - 4.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_empty_summary() {
        let summary = OrchestrationMonitor::default().performance_summary(24.0);
        assert_eq!(summary.p95_duration_ms, 0);
        assert_eq!(summary.failure_rate, 0.0);
    }

    #[test]
    fn test_failure_rate_alert_is_edge_triggered() {
        let monitor = OrchestrationMonitor::new(100, thresholds());
        let count = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&count);
        monitor.add_alert_callback(move |alert, data| {
            assert_eq!(alert, AlertType::HighFailureRate);
            assert!(data["failure_rate"].as_f64().unwrap() > 0.5);
            seen.fetch_add(1, Ordering::SeqCst);
        });

        let wf = Uuid::new_v4();
        monitor.record_event(event(wf, "a", EventKind::Failed, None));
        monitor.record_event(event(wf, "b", EventKind::Failed, None));
        monitor.record_event(event(wf, "c", EventKind::Failed, None));
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(monitor.active_alerts(), vec![AlertType::HighFailureRate]);

        // Recover, then cross again.
        for id in ["d", "e", "f", "g"] {
            monitor.record_event(event(wf, id, EventKind::Completed, Some(1)));
        }
        assert!(monitor.active_alerts().is_empty());
        for id in ["h", "i", "j", "k", "l"] {
            monitor.record_event(event(wf, id, EventKind::Failed, None));
        }
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_slow_tasks_alert() {
        let monitor = OrchestrationMonitor::new(100, thresholds());
        let alerts = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = Arc::clone(&alerts);
        monitor.add_alert_callback(move |alert, _| sink.lock().push(alert));

        let wf = Uuid::new_v4();
        monitor.record_event(event(wf, "a", EventKind::Completed, Some(5_000)));
        assert!(alerts.lock().is_empty(), "below min_samples");
        monitor.record_event(event(wf, "b", EventKind::Completed, Some(5_000)));
        assert_eq!(*alerts.lock(), vec![AlertType::SlowTasks]);
    }

    #[test]
    fn test_concurrency_alert() {
        let monitor = OrchestrationMonitor::new(100, thresholds());
        let count = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&count);
        monitor.add_alert_callback(move |alert, data| {
            assert_eq!(alert, AlertType::ConcurrencyOverCapacity);
            assert_eq!(data["running"], 3);
            seen.fetch_add(1, Ordering::SeqCst);
        });

        let wf = Uuid::new_v4();
        for id in ["a", "b", "c"] {
            monitor.record_event(event(wf, id, EventKind::Started, None));
        }
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(monitor.running(), 3);
    }

    #[test]
    fn test_failure_rate_judged_over_buffer() {
        let monitor = OrchestrationMonitor::new(
            20,
            AlertThresholds {
                max_failure_rate: 0.25,
                min_samples: 5,
                ..thresholds()
            },
        );
        let count = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&count);
        monitor.add_alert_callback(move |alert, _| {
            if alert == AlertType::HighFailureRate {
                seen.fetch_add(1, Ordering::SeqCst);
            }
        });

        let wf = Uuid::new_v4();
        for i in 0..100 {
            monitor.record_event(event(wf, &format!("ok{i}"), EventKind::Completed, Some(1)));
        }
        assert_eq!(count.load(Ordering::SeqCst), 0);
        // 5 failures in 20 buffered events is not above 0.25.
        for i in 0..5 {
            monitor.record_event(event(wf, &format!("bad{i}"), EventKind::Failed, None));
        }
        assert_eq!(count.load(Ordering::SeqCst), 0);
        for i in 5..20 {
            monitor.record_event(event(wf, &format!("bad{i}"), EventKind::Failed, None));
        }
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(monitor.active_alerts(), vec![AlertType::HighFailureRate]);
        // Lifetime counters still see the whole history.
        assert_eq!(monitor.kind_stats()["translate"].completed, 100);
    }

    #[test]
    fn test_cancelled_event_clears_running() {
        let monitor = OrchestrationMonitor::default();
        let wf = Uuid::new_v4();
        monitor.record_event(event(wf, "a", EventKind::Started, None));
        monitor.record_event(event(wf, "b", EventKind::Started, None));
        monitor.record_event(event(wf, "a", EventKind::Cancelled, Some(40)));
        assert_eq!(monitor.running(), 1);

        let summary = monitor.performance_summary(1.0);
        assert_eq!(summary.cancelled, 1);
        assert_eq!(summary.failed, 0);
        assert_eq!(summary.p95_duration_ms, 0);
        assert_eq!(monitor.kind_stats()["translate"].cancelled, 1);
    }

    #[test]
    fn test_concurrency_grace_period() {
        let monitor = OrchestrationMonitor::new(
            100,
            AlertThresholds {
                concurrency_grace_ms: 60_000,
                ..thresholds()
            },
        );
        let wf = Uuid::new_v4();
        for id in ["a", "b", "c", "d"] {
            monitor.record_event(event(wf, id, EventKind::Started, None));
        }
        assert!(monitor.active_alerts().is_empty());
    }

    #[test]
    fn test_panicking_callback_is_contained() {
        let monitor = OrchestrationMonitor::new(100, thresholds());
        let count = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&count);
        monitor.add_alert_callback(|_, _| panic!("sink down"));
        monitor.add_alert_callback(move |_, _| {
            seen.fetch_add(1, Ordering::SeqCst);
        });

        let wf = Uuid::new_v4();
        monitor.record_event(event(wf, "a", EventKind::Failed, None));
        monitor.record_event(event(wf, "b", EventKind::Failed, None));
        assert_eq!(count.load(Ordering::SeqCst), 1);
        // Monitor still usable after the panic.
        monitor.record_event(event(wf, "c", EventKind::Started, None));
        assert_eq!(monitor.running(), 1);
    }

    #[test]
    fn test_to_json() {
        let monitor = OrchestrationMonitor::default();
        let wf = Uuid::new_v4();
        monitor.record_event(event(wf, "a", EventKind::Started, None));
        let json = monitor.to_json();
        assert_eq!(json["running"], 1);
        assert_eq!(json["kinds"]["translate"]["started"], 1);
    }

    #[test]
    fn test_percentile_nearest_rank() {
        assert_eq!(percentile(&[], 50), 0);
        assert_eq!(percentile(&[7], 95), 7);
        assert_eq!(percentile(&[1, 2, 3, 4], 50), 2);
        assert_eq!(percentile(&[1, 2, 3, 4], 95), 4);
    }
}
