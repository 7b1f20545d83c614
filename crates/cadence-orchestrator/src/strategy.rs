use crate::retry::RetryPolicy;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use tracing::{debug, info};

/// Execution strategy for one workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// One task at a time, no spawning. The control baseline and the fallback.
    Sequential,
    /// Every independently ready task runs concurrently, no spawning.
    ParallelBasic,
    /// Like `ParallelBasic`, with the dynamic spawning hook enabled.
    ParallelAdaptive,
    /// Topological layers run one after another, tasks inside a layer in parallel.
    Hybrid,
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Strategy::Sequential => write!(f, "sequential"),
            Strategy::ParallelBasic => write!(f, "parallel_basic"),
            Strategy::ParallelAdaptive => write!(f, "parallel_adaptive"),
            Strategy::Hybrid => write!(f, "hybrid"),
        }
    }
}

impl Strategy {
    /// Resolve an A/B variant id against the fixed vocabulary (exact or
    /// prefix match, case-insensitive). Unknown ids fail closed to `Sequential`.
    pub fn from_variant(variant_id: &str) -> Strategy {
        const VOCABULARY: &[(&str, Strategy)] = &[
            ("control", Strategy::Sequential),
            ("sequential", Strategy::Sequential),
            ("baseline", Strategy::Sequential),
            ("parallel_basic", Strategy::ParallelBasic),
            ("parallel_adaptive", Strategy::ParallelAdaptive),
            ("enhanced_logic", Strategy::ParallelAdaptive),
            ("hybrid", Strategy::Hybrid),
        ];
        let normalized = variant_id.trim().to_ascii_lowercase();
        VOCABULARY
            .iter()
            .find(|(key, _)| normalized.starts_with(key))
            .map_or(Strategy::Sequential, |(_, strategy)| *strategy)
    }
}

/// Per-run configuration that accompanies a [`Strategy`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StrategyConfig {
    /// Upper bound on units of one workflow running at once.
    pub max_concurrency: usize,
    /// Whether spawn rules are applied.
    pub spawning_enabled: bool,
    /// Retry policy for tasks without their own.
    pub retry: RetryPolicy,
}

impl StrategyConfig {
    /// The configuration a strategy implies, before sizing.
    pub fn for_strategy(strategy: Strategy, max_concurrency: usize, retry: RetryPolicy) -> Self {
        match strategy {
            Strategy::Sequential => Self {
                max_concurrency: 1,
                spawning_enabled: false,
                retry,
            },
            Strategy::ParallelBasic | Strategy::Hybrid => Self {
                max_concurrency: max_concurrency.max(1),
                spawning_enabled: false,
                retry,
            },
            Strategy::ParallelAdaptive => Self {
                max_concurrency: max_concurrency.max(1),
                spawning_enabled: true,
                retry,
            },
        }
    }
}

/// Shape of the work, used to size concurrency.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskComplexity {
    /// Number of features or entities the job touches.
    pub feature_count: usize,
    /// Number of dependency edges in the workflow.
    pub dependency_count: usize,
}

/// Host resources available to the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemResources {
    /// Logical CPUs.
    pub cpu_count: usize,
    /// Memory available, when known.
    pub memory_mb: Option<u64>,
}

impl SystemResources {
    /// Read the host CPU count. Memory is not measured.
    pub fn detect() -> Self {
        Self {
            cpu_count: std::thread::available_parallelism().map_or(1, usize::from),
            memory_mb: None,
        }
    }
}

impl Default for SystemResources {
    fn default() -> Self {
        Self::detect()
    }
}

/// Environment-level switch over adaptive orchestration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdaptiveMode {
    /// Follow the variant id.
    #[default]
    Auto,
    /// Every variant runs `ParallelAdaptive`.
    ForceEnabled,
    /// Every variant runs `Sequential`.
    ForceDisabled,
}

impl std::str::FromStr for AdaptiveMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" | "" => Ok(AdaptiveMode::Auto),
            "on" | "true" | "1" | "force_enabled" | "enabled" => Ok(AdaptiveMode::ForceEnabled),
            "off" | "false" | "0" | "force_disabled" | "disabled" => {
                Ok(AdaptiveMode::ForceDisabled)
            }
            other => Err(format!("unknown adaptive mode '{other}'")),
        }
    }
}

/// One finished strategy run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceRecord {
    /// Strategy that ran.
    pub strategy: Strategy,
    /// Whether the run completed without error.
    pub success: bool,
    /// Wall-clock duration in milliseconds.
    pub duration_ms: u64,
    /// When the run finished.
    pub timestamp: DateTime<Utc>,
    /// Resources observed at selection time.
    pub resources: SystemResources,
    /// Free-form details supplied by the caller.
    #[serde(default)]
    pub metadata: serde_json::Value,
}

/// Aggregate over the performance history of one strategy.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StrategyStats {
    /// Runs recorded.
    pub runs: usize,
    /// Runs that succeeded.
    pub successes: usize,
    /// `successes / runs`, or 0 without runs.
    pub success_rate: f64,
    /// Mean duration over all runs, in milliseconds.
    pub mean_duration_ms: f64,
}

/// Explicit cache of resolved variant ids. Injected into the selector;
/// never a process-wide singleton.
#[derive(Debug, Default)]
pub struct StrategyCache {
    resolved: RwLock<HashMap<String, Strategy>>,
}

impl StrategyCache {
    /// Empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    fn resolve(&self, variant_id: &str) -> Strategy {
        if let Some(strategy) = self.resolved.read().get(variant_id) {
            return *strategy;
        }
        let strategy = Strategy::from_variant(variant_id);
        self.resolved.write().insert(variant_id.to_string(), strategy);
        strategy
    }

    /// Number of variant ids resolved so far.
    pub fn len(&self) -> usize {
        self.resolved.read().len()
    }

    /// Whether no variant id was resolved yet.
    pub fn is_empty(&self) -> bool {
        self.resolved.read().is_empty()
    }
}

/// Limits applied when sizing a strategy and storing its history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectorConfig {
    /// Concurrency is never sized above this, whatever the CPU count.
    #[serde(default = "default_concurrency_ceiling")]
    pub concurrency_ceiling: usize,
    /// Maximum number of performance records kept.
    #[serde(default = "default_max_records")]
    pub max_records: usize,
    /// Records older than this are evicted.
    #[serde(default = "default_retention_hours")]
    pub retention_hours: u64,
    /// Override applied before variant resolution.
    #[serde(default)]
    pub adaptive: AdaptiveMode,
    /// Policy copied into every [`StrategyConfig`].
    #[serde(default)]
    pub retry: RetryPolicy,
}

fn default_concurrency_ceiling() -> usize {
    16
}

fn default_max_records() -> usize {
    1_000
}

fn default_retention_hours() -> u64 {
    24 * 7
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            concurrency_ceiling: default_concurrency_ceiling(),
            max_records: default_max_records(),
            retention_hours: default_retention_hours(),
            adaptive: AdaptiveMode::default(),
            retry: RetryPolicy::default(),
        }
    }
}

/// Chooses an execution strategy per run and keeps a bounded performance history.
pub struct StrategySelector {
    config: SelectorConfig,
    cache: Option<Arc<StrategyCache>>,
    history: RwLock<VecDeque<PerformanceRecord>>,
}

impl StrategySelector {
    /// Selector without a variant cache.
    pub fn new(config: SelectorConfig) -> Self {
        Self {
            config,
            cache: None,
            history: RwLock::new(VecDeque::new()),
        }
    }

    /// Use `cache` to memoize variant id resolution.
    pub fn with_cache(mut self, cache: Arc<StrategyCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Limits in use.
    pub fn config(&self) -> &SelectorConfig {
        &self.config
    }

    fn resolve(&self, variant_id: &str) -> Strategy {
        match self.config.adaptive {
            AdaptiveMode::ForceDisabled => Strategy::Sequential,
            AdaptiveMode::ForceEnabled => Strategy::ParallelAdaptive,
            AdaptiveMode::Auto => match &self.cache {
                Some(cache) => cache.resolve(variant_id),
                None => Strategy::from_variant(variant_id),
            },
        }
    }

    /// Pick the strategy for `variant_id` and size its concurrency.
    ///
    /// Concurrency is at least 1 and never exceeds the CPU count or the
    /// configured ceiling.
    pub fn select_strategy(
        &self,
        variant_id: &str,
        complexity: &TaskComplexity,
        resources: &SystemResources,
    ) -> (Strategy, StrategyConfig) {
        let strategy = self.resolve(variant_id);

        let mut desired = match strategy {
            Strategy::Sequential => 1,
            Strategy::ParallelBasic => 4,
            Strategy::Hybrid => 3,
            Strategy::ParallelAdaptive => 4 + complexity.feature_count / 10,
        };
        // Densely connected work leaves little to parallelize.
        if complexity.feature_count > 0 && complexity.dependency_count > complexity.feature_count * 2 {
            desired = desired.saturating_sub(1);
        }
        if resources.memory_mb.is_some_and(|mb| mb < 2_048) {
            desired /= 2;
        }
        let upper = resources.cpu_count.min(self.config.concurrency_ceiling).max(1);
        let max_concurrency = desired.clamp(1, upper);

        let config = StrategyConfig::for_strategy(strategy, max_concurrency, self.config.retry.clone());
        debug!(
            variant = variant_id,
            strategy = %strategy,
            max_concurrency = config.max_concurrency,
            "Strategy selected"
        );
        (strategy, config)
    }

    /// Append a performance record. Never fails; the history is trimmed to
    /// the retention window and record limit.
    pub fn record_performance(
        &self,
        strategy: Strategy,
        success: bool,
        duration_ms: u64,
        metadata: serde_json::Value,
    ) {
        let now = Utc::now();
        let record = PerformanceRecord {
            strategy,
            success,
            duration_ms,
            timestamp: now,
            resources: SystemResources::detect(),
            metadata,
        };
        let cutoff = now - self.retention();
        let mut history = self.history.write();
        history.push_back(record);
        while history.front().is_some_and(|r| r.timestamp < cutoff) {
            history.pop_front();
        }
        while history.len() > self.config.max_records {
            history.pop_front();
        }
        info!(strategy = %strategy, success, duration_ms, "Strategy performance recorded");
    }

    fn retention(&self) -> ChronoDuration {
        ChronoDuration::hours(i64::try_from(self.config.retention_hours).unwrap_or(i64::MAX / 3_600_000))
    }

    /// Per-strategy success rate and mean duration over the last `window`.
    pub fn performance_summary(&self, window: ChronoDuration) -> BTreeMap<Strategy, StrategyStats> {
        let cutoff = Utc::now() - window;
        let history = self.history.read();
        let mut summary: BTreeMap<Strategy, StrategyStats> = BTreeMap::new();
        let mut totals: BTreeMap<Strategy, u64> = BTreeMap::new();

        for record in history.iter().filter(|r| r.timestamp >= cutoff) {
            let stats = summary.entry(record.strategy).or_default();
            stats.runs += 1;
            if record.success {
                stats.successes += 1;
            }
            *totals.entry(record.strategy).or_default() += record.duration_ms;
        }
        for (strategy, stats) in &mut summary {
            stats.success_rate = stats.successes as f64 / stats.runs as f64;
            stats.mean_duration_ms = totals.get(strategy).copied().unwrap_or(0) as f64 / stats.runs as f64;
        }
        summary
    }

    /// Records currently held.
    pub fn history_len(&self) -> usize {
        self.history.read().len()
    }
}

impl Default for StrategySelector {
    fn default() -> Self {
        Self::new(SelectorConfig::default())
    }
}
