//! Deterministic stand-ins for the external reasoning agents.
//!
//! Each simulated agent sleeps for a fixed latency and returns a small JSON
//! payload. `analyze` reports a list of complex entities so the spawning
//! rule has something to fan out over; the `--flaky` option makes chosen
//! executables fail transiently a fixed number of times.

use async_trait::async_trait;
use cadence_core::ExecutionError;
use cadence_orchestrator::{Executable, FanOutRule, ParallelOrchestrator, TaskContext, WorkflowDefinition};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Tuning for the simulated agents.
#[derive(Debug, Clone)]
pub struct SimulationOptions {
    /// Sleep before every response.
    pub latency_ms: u64,
    /// Entities reported by `analyze`.
    pub entities: usize,
    /// Executable name -> number of transient failures before succeeding.
    pub flaky: HashMap<String, u32>,
}

/// A simulated agent backing one executable name.
pub struct SimulatedAgent {
    name: String,
    latency: Duration,
    entities: usize,
    failures_left: AtomicU32,
}

impl SimulatedAgent {
    /// Agent for `name`, with its failure budget taken from `options.flaky`.
    pub fn new(name: impl Into<String>, options: &SimulationOptions) -> Self {
        let name = name.into();
        let failures = options.flaky.get(&name).copied().unwrap_or(0);
        Self {
            name,
            latency: Duration::from_millis(options.latency_ms),
            entities: options.entities,
            failures_left: AtomicU32::new(failures),
        }
    }

    fn output(&self, ctx: &TaskContext) -> Value {
        match self.name.as_str() {
            "analyze" => {
                let entities: Vec<String> = (0..self.entities).map(|i| format!("Entity{i}")).collect();
                json!({ "complex_entities": entities, "files": 12 + self.entities })
            }
            "package" | "validate" => json!({
                "task": ctx.task_id,
                "inputs": ctx.dependency_results.len(),
            }),
            _ => json!({
                "task": ctx.task_id,
                "executable": self.name,
                "attempt": ctx.attempt,
            }),
        }
    }
}

#[async_trait]
impl Executable for SimulatedAgent {
    async fn run(&self, ctx: TaskContext) -> Result<Value, ExecutionError> {
        tokio::time::sleep(self.latency).await;
        let remaining = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if remaining.is_ok() {
            return Err(ExecutionError::transient(format!(
                "{} agent temporarily unavailable",
                self.name
            )));
        }
        Ok(self.output(&ctx))
    }
}

/// Register a simulated agent for every executable `definition` uses, plus
/// the entity converter. The fan-out rule is attached when the workflow
/// has both `analyze` and `package`.
pub fn register_simulated(
    orchestrator: &ParallelOrchestrator,
    definition: &WorkflowDefinition,
    options: &SimulationOptions,
) {
    let mut names: Vec<&str> = definition.executables();
    names.push("convert_entity");
    for name in names {
        orchestrator.register_executable(name, Arc::new(SimulatedAgent::new(name, options)));
    }
    let has = |id: &str| definition.tasks.iter().any(|t| t.id == id);
    if has("analyze") && has("package") {
        orchestrator.register_spawn_rule(definition.name.clone(), Arc::new(FanOutRule::complex_entities()));
    }
}

/// Parse `name=count` pairs given to `--flaky`.
pub fn parse_flaky(specs: &[String]) -> anyhow::Result<HashMap<String, u32>> {
    specs
        .iter()
        .map(|spec| {
            let (name, count) = spec
                .split_once('=')
                .map_or((spec.as_str(), "1"), |(n, c)| (n, c));
            let count: u32 = count
                .trim()
                .parse()
                .map_err(|e| anyhow::anyhow!("invalid --flaky value '{spec}': {e}"))?;
            Ok((name.trim().to_string(), count))
        })
        .collect()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use cadence_orchestrator::{TaskGraph, TaskNode};

    fn ctx(id: &str) -> TaskContext {
        let mut graph = TaskGraph::new("t");
        graph.add_task(TaskNode::new(id, id)).unwrap();
        graph.context_for(id).unwrap()
    }

    fn options() -> SimulationOptions {
        SimulationOptions {
            latency_ms: 0,
            entities: 2,
            flaky: HashMap::from([("translate".to_string(), 2)]),
        }
    }

    #[tokio::test]
    async fn test_analyze_reports_entities() {
        let agent = SimulatedAgent::new("analyze", &options());
        let value = agent.run(ctx("analyze")).await.unwrap();
        assert_eq!(value["complex_entities"], json!(["Entity0", "Entity1"]));
    }

    #[tokio::test]
    async fn test_flaky_agent_recovers() {
        let agent = SimulatedAgent::new("translate", &options());
        for _ in 0..2 {
            let err = agent.run(ctx("translate")).await.unwrap_err();
            assert!(err.is_retryable());
        }
        let value = agent.run(ctx("translate")).await.unwrap();
        assert_eq!(value["executable"], "translate");
    }

    #[test]
    fn test_parse_flaky() {
        let parsed = parse_flaky(&["translate=2".into(), "plan".into()]).unwrap();
        assert_eq!(parsed["translate"], 2);
        assert_eq!(parsed["plan"], 1);
        assert!(parse_flaky(&["plan=x".into()]).is_err());
    }
}
