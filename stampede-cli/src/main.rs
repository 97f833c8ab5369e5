//! Stampede binary entry point
//!
//! One executable serves every node role: `coordinator` drives a run over
//! the agents of an inventory, `agent` supervises worker processes on one
//! machine, the hidden `worker` subcommand is what agents spawn, and
//! `local` collapses the whole tree into a single process.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use stampede_agent::{AgentRuntime, AgentRuntimeSettings, ProcessLauncher};
use stampede_config::{ConfigLoader, LogFormat, LoggingConfig, StampedeConfig};
use stampede_coordinator::{
    Coordinator, CoordinatorSettings, LocalCluster, TcpConnector, WorkerLayout,
};
use stampede_core::{Address, RunBudget, TestPlan};
use stampede_dispatch::ConnectionSettings;
use stampede_ipc::stdio_transport;
use stampede_registry::Inventory;
use stampede_report::{ResultAggregator, RunSummary};
use stampede_resilience::ShutdownCoordinator;
use stampede_worker::{WorkerRuntime, WorkerRuntimeSettings};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

mod cli;
mod suites;

use cli::{Cli, Commands, ConfigCommands};

/// RUN budget applied when neither `--duration` nor `--iterations` is given.
const DEFAULT_RUN_SECS: u64 = 30;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_ref())?;

    match cli.command {
        // Worker mode logs to stderr only: stdout carries the IPC frames.
        Commands::Worker { address } => {
            init_worker_tracing(cli.log_level.as_deref())?;
            worker_command(&address, &config).await
        }
        Commands::Coordinator {
            inventory,
            suite,
            members,
            clients,
            duration,
            iterations,
            run_threads,
            params,
        } => {
            init_tracing(&config.logging, cli.log_level.as_deref())?;
            let plan = build_plan(&suite, duration, iterations, run_threads, &params);
            let layout = build_layout(members, clients, &params);
            coordinator_command(&config, &inventory, plan, layout).await
        }
        Commands::Agent { port } => {
            init_tracing(&config.logging, cli.log_level.as_deref())?;
            agent_command(&config, port).await
        }
        Commands::Local {
            suite,
            agents,
            members,
            clients,
            duration,
            iterations,
            run_threads,
            params,
        } => {
            init_tracing(&config.logging, cli.log_level.as_deref())?;
            let plan = build_plan(&suite, duration, iterations, run_threads, &params);
            let layout = build_layout(members, clients, &params);
            local_command(&config, agents, plan, layout).await
        }
        // Config commands print to stdout; no subscriber so output stays clean.
        Commands::Config { config_cmd } => match config_cmd {
            ConfigCommands::Generate { output } => config_generate(output.as_deref()),
            ConfigCommands::Validate { config_file } => config_validate(&config_file),
        },
    }
}

/// Load configuration from file, environment or defaults.
fn load_config(path: Option<&PathBuf>) -> Result<StampedeConfig> {
    let loader = ConfigLoader::new();
    match path {
        Some(path) if path.exists() => loader
            .from_file(path)
            .with_context(|| format!("failed to load configuration from {}", path.display())),
        Some(path) => {
            eprintln!(
                "configuration file {} not found, using defaults",
                path.display()
            );
            loader
                .from_env()
                .context("failed to load configuration from environment")
        }
        None => loader
            .from_env()
            .context("failed to load configuration from environment"),
    }
}

fn env_filter(logging: &LoggingConfig, override_level: Option<&str>) -> EnvFilter {
    match override_level {
        Some(level) => EnvFilter::try_new(level).unwrap_or_else(|_| {
            eprintln!(
                "invalid log level '{level}', falling back to '{}'",
                logging.level.as_filter_directive()
            );
            EnvFilter::new(logging.level.as_filter_directive())
        }),
        None => EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(logging.level.as_filter_directive())),
    }
}

fn init_tracing(logging: &LoggingConfig, override_level: Option<&str>) -> Result<()> {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter(logging, override_level))
        .with_file(logging.include_location)
        .with_line_number(logging.include_location);
    match logging.format {
        LogFormat::Text => builder.init(),
        LogFormat::Compact => builder.compact().init(),
        LogFormat::Pretty => builder.pretty().init(),
    }
    Ok(())
}

fn init_worker_tracing(override_level: Option<&str>) -> Result<()> {
    let filter = match override_level {
        Some(level) => EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info")),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
    Ok(())
}

fn connection_settings(config: &StampedeConfig) -> ConnectionSettings {
    ConnectionSettings {
        ack_deadline: config.dispatch.ack_deadline,
        retry: config.dispatch.retry.clone(),
    }
}

fn build_plan(
    suite: &str,
    duration: Option<u64>,
    iterations: Option<u64>,
    run_threads: usize,
    params: &[(String, String)],
) -> TestPlan {
    let budget = match (duration, iterations) {
        (Some(secs), _) => RunBudget::Duration { secs },
        (None, Some(count)) => RunBudget::Iterations { count },
        (None, None) => {
            info!(secs = DEFAULT_RUN_SECS, "no run budget given, using the default duration");
            RunBudget::Duration {
                secs: DEFAULT_RUN_SECS,
            }
        }
    };
    let threads = if run_threads == 0 {
        num_cpus::get()
    } else {
        run_threads
    };
    let mut plan = TestPlan::new(suite, budget).with_run_threads(threads);
    for (key, value) in params {
        plan = plan.with_param(key, value);
    }
    plan
}

fn build_layout(members: u32, clients: u32, params: &[(String, String)]) -> WorkerLayout {
    WorkerLayout {
        members,
        clients,
        parameters: params.iter().cloned().collect::<BTreeMap<_, _>>(),
    }
}

fn build_aggregator(config: &StampedeConfig) -> Arc<ResultAggregator> {
    Arc::new(ResultAggregator::new(
        config.report.artifacts_dir.clone(),
        config.report.exception_cap,
        Arc::new(AtomicU64::new(1)),
    ))
}

async fn coordinator_command(
    config: &StampedeConfig,
    inventory_path: &Path,
    plan: TestPlan,
    layout: WorkerLayout,
) -> Result<()> {
    let inventory = Inventory::load(inventory_path).with_context(|| {
        format!("failed to load inventory from {}", inventory_path.display())
    })?;
    info!(
        hosts = inventory.hosts.len(),
        suite = %plan.suite,
        workers = layout.total(),
        "starting coordinated run"
    );

    let shutdown = Arc::new(ShutdownCoordinator::new());
    let coordinator = Coordinator::new(
        CoordinatorSettings::from_config(config),
        build_aggregator(config),
        Arc::new(TcpConnector),
        Arc::clone(&shutdown),
    );

    coordinator.bootstrap(&inventory).await?;
    let workers = coordinator.provision(&layout).await?;
    info!(workers = workers.len(), "cluster provisioned");

    let outcome = tokio::select! {
        result = coordinator.run_suite(plan) => Some(result),
        _ = tokio::signal::ctrl_c() => None,
    };
    if outcome.is_none() {
        warn!("interrupted, tearing the cluster down");
        if let Err(error) = shutdown.initiate() {
            debug!(%error, "shutdown signal had no listeners");
        }
    }
    coordinator.shutdown().await;

    match outcome {
        Some(result) => report_outcome(&result?, &config.report.artifacts_dir),
        None => Err(anyhow::anyhow!("run interrupted before completion")),
    }
}

async fn agent_command(config: &StampedeConfig, port: Option<u16>) -> Result<()> {
    let launcher = ProcessLauncher::new(
        config.agent.worker_binary.clone(),
        config.agent.output_capture_lines,
    );
    let shutdown = Arc::new(ShutdownCoordinator::new());
    let runtime = AgentRuntime::new(
        Arc::new(launcher),
        AgentRuntimeSettings {
            worker_startup_timeout: config.agent.worker_startup_timeout,
            worker_grace_timeout: config.agent.worker_grace_timeout,
            connection: connection_settings(config),
        },
        Arc::clone(&shutdown),
    );

    let signal_shutdown = Arc::clone(&shutdown);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, shutting the agent down");
            if let Err(error) = signal_shutdown.initiate() {
                debug!(%error, "shutdown signal had no listeners");
            }
        }
    });

    let port = port.unwrap_or(config.agent.port);
    runtime.serve(&config.agent.bind_address, port).await?;
    Ok(())
}

async fn worker_command(address: &str, config: &StampedeConfig) -> Result<()> {
    let address: Address = address
        .parse()
        .with_context(|| format!("invalid worker address '{address}'"))?;
    let runtime = WorkerRuntime::new(
        address,
        Arc::new(suites::built_in_catalog()),
        WorkerRuntimeSettings {
            probe_flush_interval: config.worker.probe_flush_interval,
            connection: connection_settings(config),
        },
    )?;
    runtime.run(stdio_transport()).await?;
    Ok(())
}

async fn local_command(
    config: &StampedeConfig,
    agents: u32,
    plan: TestPlan,
    layout: WorkerLayout,
) -> Result<()> {
    info!(
        agents,
        workers = layout.total(),
        suite = %plan.suite,
        "starting in-process run"
    );
    let cluster = LocalCluster::start(
        Arc::new(suites::built_in_catalog()),
        agents,
        &layout,
        CoordinatorSettings::from_config(config),
        build_aggregator(config),
    )
    .await?;

    let outcome = tokio::select! {
        result = cluster.run_suite(plan) => Some(result),
        _ = tokio::signal::ctrl_c() => None,
    };
    if outcome.is_none() {
        warn!("interrupted, tearing the cluster down");
    }
    cluster.stop().await;

    match outcome {
        Some(result) => report_outcome(&result?, &config.report.artifacts_dir),
        None => Err(anyhow::anyhow!("run interrupted before completion")),
    }
}

/// Print the run outcome; a failed run becomes a nonzero exit code.
fn report_outcome(summary: &RunSummary, artifacts_dir: &Path) -> Result<()> {
    println!(
        "run {} ({}) finished: {:?}",
        summary.test_id, summary.suite, summary.status
    );
    for (phase, workers) in &summary.phases {
        let failures: Vec<String> = workers
            .iter()
            .filter(|(_, outcome)| !outcome.is_success())
            .map(|(address, outcome)| format!("{address}: {outcome:?}"))
            .collect();
        if failures.is_empty() {
            println!("  {phase}: {} ok", workers.len());
        } else {
            println!(
                "  {phase}: {} of {} failed ({})",
                failures.len(),
                workers.len(),
                failures.join("; ")
            );
        }
    }
    for (name, probe) in &summary.probes {
        println!(
            "  probe {name}: {} ops at {:.1}/s (p50 {} us, p99 {} us, max {} us)",
            probe.operations,
            probe.throughput_per_sec,
            fmt_micros(probe.p50_micros),
            fmt_micros(probe.p99_micros),
            fmt_micros(probe.max_micros),
        );
    }
    if !summary.exceptions.is_empty() || summary.exceptions_overflow > 0 {
        println!(
            "  exceptions: {} stored, {} dropped",
            summary.exceptions.len(),
            summary.exceptions_overflow
        );
    }
    println!(
        "summary written to {}",
        artifacts_dir
            .join(format!("summary-{}.json", summary.test_id))
            .display()
    );
    if summary.succeeded() {
        Ok(())
    } else {
        Err(anyhow::anyhow!(
            "run {} finished {:?} with failures",
            summary.test_id,
            summary.status
        ))
    }
}

fn fmt_micros(value: Option<u64>) -> String {
    value.map_or_else(|| "-".to_string(), |v| v.to_string())
}

fn config_generate(output: Option<&Path>) -> Result<()> {
    let sample = StampedeConfig::generate_sample();
    match output {
        Some(path) => {
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)
                        .context("failed to create output directory")?;
                }
            }
            std::fs::write(path, sample)
                .with_context(|| format!("failed to write {}", path.display()))?;
            println!("sample configuration written to {}", path.display());
        }
        None => print!("{sample}"),
    }
    Ok(())
}

fn config_validate(path: &Path) -> Result<()> {
    if !path.exists() {
        return Err(anyhow::anyhow!(
            "configuration file not found: {}",
            path.display()
        ));
    }
    match ConfigLoader::new().from_file(path) {
        Ok(_) => {
            println!("{} is valid", path.display());
            Ok(())
        }
        Err(error) => Err(anyhow::anyhow!("{} is invalid: {error}", path.display())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_prefers_explicit_budgets() {
        let plan = build_plan("demo", Some(60), None, 1, &[]);
        assert_eq!(plan.budget, RunBudget::Duration { secs: 60 });

        let plan = build_plan("demo", None, Some(500), 1, &[]);
        assert_eq!(plan.budget, RunBudget::Iterations { count: 500 });

        let plan = build_plan("demo", None, None, 1, &[]);
        assert_eq!(
            plan.budget,
            RunBudget::Duration {
                secs: DEFAULT_RUN_SECS
            }
        );
    }

    #[test]
    fn test_plan_zero_threads_means_one_per_core() {
        let plan = build_plan("demo", None, Some(1), 0, &[]);
        assert_eq!(plan.run_threads, num_cpus::get());
    }

    #[test]
    fn test_layout_collects_params() {
        let params = vec![("rate".to_string(), "100".to_string())];
        let layout = build_layout(2, 1, &params);
        assert_eq!(layout.total(), 3);
        assert_eq!(layout.parameters["rate"], "100");
    }

    #[test]
    fn test_fmt_micros_placeholder() {
        assert_eq!(fmt_micros(Some(42)), "42");
        assert_eq!(fmt_micros(None), "-");
    }
}
