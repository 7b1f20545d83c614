//! `cadence`: run workflows against simulated agents, inspect strategy
//! selection and validate workflow definitions.

mod agents;

use agents::{parse_flaky, register_simulated, SimulationOptions};
use cadence_core::CadenceError;
use cadence_orchestrator::{
    standard_conversion_workflow, OrchestratorConfig, ParallelOrchestrator, StrategySelector,
    SystemResources, WorkflowDefinition,
};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "cadence", about = "Cadence: parallel workflow orchestration engine")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "cadence.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a workflow against simulated agents
    Run {
        /// A/B variant id used for strategy selection
        #[arg(short, long, default_value = "parallel_adaptive")]
        variant: String,
        /// Workflow definition file (defaults to the conversion pipeline)
        #[arg(short, long)]
        workflow: Option<PathBuf>,
        /// Entities reported by the analyze step
        #[arg(long, default_value_t = 3)]
        entities: usize,
        /// Simulated agent latency in milliseconds
        #[arg(long, default_value_t = 50)]
        latency_ms: u64,
        /// Make an executable fail transiently, as `name` or `name=count`
        #[arg(long)]
        flaky: Vec<String>,
    },
    /// Show which strategy and concurrency a variant resolves to
    Strategy {
        #[arg(short, long)]
        variant: String,
        #[arg(short, long)]
        workflow: Option<PathBuf>,
    },
    /// Check a workflow definition and print its execution layers
    Validate {
        /// Workflow definition file
        file: PathBuf,
    },
}

#[derive(Deserialize, Default)]
struct CadenceConfig {
    #[serde(default)]
    orchestrator: OrchestratorConfig,
}

/// Load `path` if it exists, otherwise fall back to defaults. Environment
/// overrides are applied either way.
fn load_config(path: &Path) -> anyhow::Result<OrchestratorConfig> {
    let mut config = if path.exists() {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file '{}': {}", path.display(), e))?;
        toml::from_str::<CadenceConfig>(&raw)
            .map_err(|e| anyhow::anyhow!("Invalid config file '{}': {}", path.display(), e))?
            .orchestrator
    } else {
        OrchestratorConfig::default()
    };
    config.apply_env_overrides()?;
    config.validate()?;
    Ok(config)
}

fn load_workflow(path: Option<&Path>) -> anyhow::Result<WorkflowDefinition> {
    match path {
        Some(path) => {
            let raw = std::fs::read_to_string(path).map_err(|e| {
                anyhow::anyhow!("Failed to read workflow file '{}': {}", path.display(), e)
            })?;
            Ok(WorkflowDefinition::from_toml_str(&raw)?)
        }
        None => Ok(standard_conversion_workflow()),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli.config)?;

    match cli.command {
        Commands::Run {
            variant,
            workflow,
            entities,
            latency_ms,
            flaky,
        } => {
            let definition = load_workflow(workflow.as_deref())?;
            let options = SimulationOptions {
                latency_ms,
                entities,
                flaky: parse_flaky(&flaky)?,
            };

            let orchestrator = ParallelOrchestrator::new(config.clone());
            register_simulated(&orchestrator, &definition, &options);
            orchestrator.monitor().add_alert_callback(|alert, details| {
                warn!(alert = %alert, details = %details, "Orchestration alert");
            });

            info!(
                workflow = %definition.name,
                variant = %variant,
                workers = config.pool.max_workers,
                "Running workflow"
            );
            let outcome = orchestrator.run_workflow(&definition, &variant).await;
            orchestrator.shutdown(true).await;

            let summary = orchestrator
                .monitor()
                .performance_summary(config.monitor.summary_window_hours);
            match outcome {
                Ok(result) => {
                    println!("{}", serde_json::to_string_pretty(&result)?);
                    println!("{}", serde_json::to_string_pretty(&summary)?);
                }
                Err(e) => {
                    if let Some(report) = e.report() {
                        println!("{}", serde_json::to_string_pretty(report)?);
                    }
                    println!("{}", serde_json::to_string_pretty(&summary)?);
                    return Err(e.into());
                }
            }
        }
        Commands::Strategy { variant, workflow } => {
            let definition = load_workflow(workflow.as_deref())?;
            let selector = StrategySelector::new(config.selector_config());
            let resources = SystemResources::detect();
            let (strategy, strategy_config) =
                selector.select_strategy(&variant, &definition.complexity(), &resources);

            println!("Variant:          {variant}");
            println!("Strategy:         {strategy}");
            println!("Max concurrency:  {}", strategy_config.max_concurrency);
            println!("Spawning:         {}", strategy_config.spawning_enabled);
            println!(
                "Retry:            {} attempts, backoff {}ms..{}ms",
                strategy_config.retry.max_retries,
                strategy_config.retry.backoff_base_ms,
                strategy_config.retry.backoff_max_ms
            );
            println!("CPUs detected:    {}", resources.cpu_count);
        }
        Commands::Validate { file } => {
            let definition = load_workflow(Some(&file))?;
            let graph = definition.build_graph(config.retry.max_retries)?;
            if graph.is_empty() {
                return Err(CadenceError::InvalidWorkflowDefinition("workflow has no tasks".into()).into());
            }

            println!("Workflow '{}' is valid ({} tasks)", definition.name, graph.len());
            for (i, layer) in graph.topological_layers().iter().enumerate() {
                println!("  layer {i}: {}", layer.join(", "));
            }
            println!("Executables: {}", definition.executables().join(", "));
        }
    }

    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use cadence_orchestrator::FailurePolicy;
    use std::io::Write;

    #[test]
    fn test_missing_config_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.retry.max_retries, 3);
    }

    #[test]
    fn test_config_file_orchestrator_table() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[orchestrator]\nfailure_policy = \"skip_subtree\"\n\n[orchestrator.retry]\nmax_retries = 5"
        )
        .unwrap();
        let config = load_config(file.path()).unwrap();
        assert_eq!(config.failure_policy, FailurePolicy::SkipSubtree);
        assert_eq!(config.retry.max_retries, 5);
        assert_eq!(config.retry.backoff_base_ms, 500);
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[orchestrator.pool]\nmax_workers = \"many\"").unwrap();
        assert!(load_config(file.path()).is_err());
    }

    #[test]
    fn test_load_workflow_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "name = \"mini\"\n\n[[task]]\nid = \"a\"\nexecutable = \"analyze\"\n\n[[task]]\nid = \"b\"\nexecutable = \"package\"\ndepends_on = [\"a\"]"
        )
        .unwrap();
        let definition = load_workflow(Some(file.path())).unwrap();
        assert_eq!(definition.name, "mini");
        assert_eq!(definition.tasks.len(), 2);
        assert_eq!(load_workflow(None).unwrap().name, "conversion");
    }

    #[tokio::test]
    async fn test_simulated_run_spawns_entities() {
        let mut config = OrchestratorConfig::default();
        config.pool.max_workers = 4;
        let orchestrator = ParallelOrchestrator::new(config);
        let definition = standard_conversion_workflow();
        let options = SimulationOptions {
            latency_ms: 1,
            entities: 2,
            flaky: Default::default(),
        };
        register_simulated(&orchestrator, &definition, &options);

        let result = orchestrator
            .run_workflow(&definition, "parallel_adaptive")
            .await
            .unwrap();
        assert!(result.results.contains_key("convert_entity_0"));
        assert!(result.results.contains_key("convert_entity_1"));
        assert_eq!(result.results["package"]["inputs"], 4);
    }
}
