use crate::monitor::AlertThresholds;
use crate::pool::PoolConfig;
use crate::retry::RetryPolicy;
use crate::spawner::SubTaskSpawner;
use crate::strategy::{AdaptiveMode, SelectorConfig};
use crate::types::FailurePolicy;
use cadence_core::{CadenceError, CadenceResult};
use serde::{Deserialize, Serialize};

/// Environment variable that forces adaptive orchestration on or off.
pub const ENV_ADAPTIVE: &str = "CADENCE_ADAPTIVE_ORCHESTRATION";
/// Environment variable that overrides the worker pool size.
pub const ENV_MAX_WORKERS: &str = "CADENCE_MAX_WORKERS";

/// Top-level orchestrator configuration (the `[orchestrator]` table).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Shared worker pool.
    #[serde(default)]
    pub pool: PoolConfig,
    /// Default retry policy for every task.
    #[serde(default)]
    pub retry: RetryPolicy,
    /// What a terminal required failure does to the rest of the graph.
    #[serde(default)]
    pub failure_policy: FailurePolicy,
    /// Re-run a failed workflow once with the sequential strategy.
    #[serde(default = "default_fallback_enabled")]
    pub fallback_enabled: bool,
    /// Override applied before variant resolution.
    #[serde(default)]
    pub adaptive: AdaptiveMode,
    /// Upper bound on sized concurrency.
    #[serde(default = "default_concurrency_ceiling")]
    pub concurrency_ceiling: usize,
    /// Alert thresholds for the monitor.
    #[serde(default)]
    pub alerts: AlertThresholds,
    /// Event buffer settings.
    #[serde(default)]
    pub monitor: MonitorConfig,
    /// Strategy history retention.
    #[serde(default)]
    pub performance: PerformanceConfig,
    /// Limits on runtime task spawning.
    #[serde(default)]
    pub spawn: SpawnLimits,
    /// Workflows kept for [`get_status`](crate::ParallelOrchestrator::get_status).
    /// The oldest finished ones are evicted past this count.
    #[serde(default = "default_max_tracked_workflows")]
    pub max_tracked_workflows: usize,
}

fn default_fallback_enabled() -> bool {
    true
}

fn default_concurrency_ceiling() -> usize {
    16
}

fn default_max_tracked_workflows() -> usize {
    1_000
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            pool: PoolConfig::default(),
            retry: RetryPolicy::default(),
            failure_policy: FailurePolicy::default(),
            fallback_enabled: default_fallback_enabled(),
            adaptive: AdaptiveMode::default(),
            concurrency_ceiling: default_concurrency_ceiling(),
            alerts: AlertThresholds::default(),
            monitor: MonitorConfig::default(),
            performance: PerformanceConfig::default(),
            spawn: SpawnLimits::default(),
            max_tracked_workflows: default_max_tracked_workflows(),
        }
    }
}

/// Monitor sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Events kept in the ring buffer.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
    /// Window used by status summaries.
    #[serde(default = "default_summary_window_hours")]
    pub summary_window_hours: f64,
}

fn default_event_capacity() -> usize {
    10_000
}

fn default_summary_window_hours() -> f64 {
    24.0
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            event_capacity: default_event_capacity(),
            summary_window_hours: default_summary_window_hours(),
        }
    }
}

/// Retention of the strategy performance history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceConfig {
    /// Records kept in the history.
    #[serde(default = "default_max_records")]
    pub max_records: usize,
    /// Age past which records are dropped.
    #[serde(default = "default_retention_hours")]
    pub retention_hours: u64,
}

fn default_max_records() -> usize {
    1_000
}

fn default_retention_hours() -> u64 {
    24 * 7
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            max_records: default_max_records(),
            retention_hours: default_retention_hours(),
        }
    }
}

/// Depth and fan-out limits for the spawner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpawnLimits {
    /// Deepest spawn level allowed below a static task.
    #[serde(default = "default_max_depth")]
    pub max_depth: u32,
    /// Children one task may spawn.
    #[serde(default = "default_max_children")]
    pub max_children: u32,
}

fn default_max_depth() -> u32 {
    3
}

fn default_max_children() -> u32 {
    25
}

impl Default for SpawnLimits {
    fn default() -> Self {
        Self {
            max_depth: default_max_depth(),
            max_children: default_max_children(),
        }
    }
}

impl OrchestratorConfig {
    /// Parse the contents of an `[orchestrator]` table.
    pub fn from_toml_str(source: &str) -> CadenceResult<Self> {
        toml::from_str(source).map_err(|e| CadenceError::Config(e.to_string()))
    }

    /// Apply `CADENCE_ADAPTIVE_ORCHESTRATION` and `CADENCE_MAX_WORKERS`.
    pub fn apply_env_overrides(&mut self) -> CadenceResult<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary key lookup.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> CadenceResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup(ENV_ADAPTIVE) {
            self.adaptive = value
                .parse()
                .map_err(|e: String| CadenceError::Config(format!("{ENV_ADAPTIVE}: {e}")))?;
        }
        if let Some(value) = lookup(ENV_MAX_WORKERS) {
            let workers: usize = value
                .trim()
                .parse()
                .map_err(|e| CadenceError::Config(format!("{ENV_MAX_WORKERS}: {e}")))?;
            if workers == 0 {
                return Err(CadenceError::Config(format!("{ENV_MAX_WORKERS} must be at least 1")));
            }
            self.pool.max_workers = workers;
        }
        Ok(())
    }

    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> CadenceResult<()> {
        if self.pool.max_workers == 0 {
            return Err(CadenceError::Config("pool.max_workers must be at least 1".into()));
        }
        if self.max_tracked_workflows == 0 {
            return Err(CadenceError::Config("max_tracked_workflows must be at least 1".into()));
        }
        if self.concurrency_ceiling == 0 {
            return Err(CadenceError::Config("concurrency_ceiling must be at least 1".into()));
        }
        if !(0.0..=1.0).contains(&self.alerts.max_failure_rate) {
            return Err(CadenceError::Config(
                "alerts.max_failure_rate must be between 0 and 1".into(),
            ));
        }
        if self.retry.backoff_base_ms > self.retry.backoff_max_ms {
            return Err(CadenceError::Config(
                "retry.backoff_base_ms must not exceed retry.backoff_max_ms".into(),
            ));
        }
        Ok(())
    }

    /// Selector settings derived from this config.
    pub fn selector_config(&self) -> SelectorConfig {
        SelectorConfig {
            concurrency_ceiling: self.concurrency_ceiling,
            max_records: self.performance.max_records,
            retention_hours: self.performance.retention_hours,
            adaptive: self.adaptive,
            retry: self.retry.clone(),
        }
    }

    /// Spawner with the configured limits.
    pub fn spawner(&self) -> SubTaskSpawner {
        SubTaskSpawner::new()
            .with_max_depth(self.spawn.max_depth)
            .with_max_children(self.spawn.max_children)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.pool.max_workers, 4);
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.failure_policy, FailurePolicy::FailFast);
        assert!(config.fallback_enabled);
        assert_eq!(config.adaptive, AdaptiveMode::Auto);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_toml_uses_defaults() {
        let config = OrchestratorConfig::from_toml_str("").unwrap();
        assert_eq!(config.concurrency_ceiling, 16);
        assert_eq!(config.monitor.event_capacity, 10_000);
        assert_eq!(config.max_tracked_workflows, 1_000);
    }

    #[test]
    fn test_toml_overrides() {
        let config = OrchestratorConfig::from_toml_str(
            r#"
            failure_policy = "skip_subtree"
            fallback_enabled = false
            adaptive = "force_disabled"

            [pool]
            max_workers = 8
            submit_mode = "non_blocking"

            [retry]
            max_retries = 5
            backoff_base_ms = 100

            [alerts]
            max_failure_rate = 0.1

            [spawn]
            max_children = 10
            "#,
        )
        .unwrap();
        assert_eq!(config.failure_policy, FailurePolicy::SkipSubtree);
        assert!(!config.fallback_enabled);
        assert_eq!(config.adaptive, AdaptiveMode::ForceDisabled);
        assert_eq!(config.pool.max_workers, 8);
        assert_eq!(config.retry.max_retries, 5);
        assert_eq!(config.retry.backoff_max_ms, 30_000);
        assert_eq!(config.spawn.max_children, 10);
        assert_eq!(config.spawn.max_depth, 3);
        assert_eq!(config.selector_config().retry.max_retries, 5);
    }

    #[test]
    fn test_bad_toml() {
        let err = OrchestratorConfig::from_toml_str("failure_policy = \"sometimes\"").unwrap_err();
        assert!(matches!(err, CadenceError::Config(_)));
    }

    #[test]
    fn test_overrides() {
        let env: HashMap<&str, &str> =
            HashMap::from([(ENV_ADAPTIVE, "off"), (ENV_MAX_WORKERS, " 12 ")]);
        let mut config = OrchestratorConfig::default();
        config
            .apply_overrides(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.adaptive, AdaptiveMode::ForceDisabled);
        assert_eq!(config.pool.max_workers, 12);
    }

    #[test]
    fn test_invalid_overrides() {
        let mut config = OrchestratorConfig::default();
        assert!(config
            .apply_overrides(|key| (key == ENV_MAX_WORKERS).then(|| "0".to_string()))
            .is_err());
        assert!(config
            .apply_overrides(|key| (key == ENV_ADAPTIVE).then(|| "maybe".to_string()))
            .is_err());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = OrchestratorConfig::default();
        config.alerts.max_failure_rate = 1.5;
        assert!(config.validate().is_err());

        let mut config = OrchestratorConfig::default();
        config.retry.backoff_base_ms = 60_000;
        assert!(config.validate().is_err());

        let mut config = OrchestratorConfig::default();
        config.max_tracked_workflows = 0;
        assert!(config.validate().is_err());
    }
}
