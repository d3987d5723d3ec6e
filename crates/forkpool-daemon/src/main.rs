//! `forkpool` command line
//!
//! Dispatches a batch of jobs to pooled worker processes and prints one JSON
//! line per result.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde_json::json;
use tracing::{info, warn};

use forkpool_core::ProcessConfiguration;
use forkpool_core::config::{Config, load_config, validate};
use forkpool_daemon::dispatch::WorkerDaemonFactory;
use forkpool_daemon::jobs::{parse_jobs, run_jobs};
use forkpool_daemon::memory::MemoryMonitor;

#[derive(Parser, Debug)]
#[command(name = "forkpool")]
#[command(version, about = "forkpool - leased dispatch of work to pooled worker processes")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Project directory whose `.forkpool/settings.json` is loaded.
    #[arg(long, global = true)]
    project_dir: Option<PathBuf>,

    /// Maximum number of work items running in parallel.
    #[arg(long, global = true)]
    max_workers: Option<usize>,

    /// Worker executable for jobs without their own configuration.
    #[arg(long, global = true)]
    worker_bin: Option<PathBuf>,

    /// Base directory for worker working directories.
    #[arg(long, global = true)]
    worker_dir: Option<PathBuf>,

    /// Log level filter (e.g. "info", "debug", "warn").
    #[arg(long, global = true, env = "FORKPOOL_LOG_LEVEL")]
    log_level: Option<String>,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long, global = true, env = "FORKPOOL_LOG_JSON")]
    log_json: bool,

    /// OpenTelemetry OTLP endpoint for traces and metrics export
    /// (e.g. `http://localhost:4317`). Requires the `metrics` feature.
    #[cfg(feature = "metrics")]
    #[arg(long, global = true, env = "FORKPOOL_METRICS_ENDPOINT")]
    metrics_endpoint: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run every job in a JSON jobs file.
    Run {
        /// Path to a JSON array of jobs.
        jobs: PathBuf,
    },
    /// Print detected memory figures and the effective pool settings.
    Probe,
}

impl Cli {
    fn apply(&self, config: &mut Config) {
        if let Some(n) = self.max_workers {
            config.pool.max_workers = n;
        }
        if let Some(bin) = &self.worker_bin {
            config.pool.worker_executable.clone_from(bin);
        }
        if let Some(dir) = &self.worker_dir {
            config.pool.worker_directory = Some(dir.clone());
        }
        if let Some(level) = &self.log_level {
            config.logging.level.clone_from(level);
        }
        if self.log_json {
            config.logging.json = true;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let project_dir = match &cli.project_dir {
        Some(dir) => dir.clone(),
        None => std::env::current_dir().context("Cannot determine current directory")?,
    };
    let mut config = load_config(Some(&project_dir))?;
    cli.apply(&mut config);
    validate(&config)?;

    #[cfg(feature = "metrics")]
    let metrics_endpoint = cli.metrics_endpoint.as_deref();
    #[cfg(not(feature = "metrics"))]
    let metrics_endpoint: Option<&str> = None;

    // Hold the guard so the OTel pipeline stays alive for the process lifetime.
    let log_filter = format!(
        "forkpool={level},forkpool_daemon={level},forkpool_core={level}",
        level = config.logging.level
    );
    let _metrics_guard = forkpool_core::tracing_init::init_tracing_with_metrics(
        &log_filter,
        config.logging.json,
        metrics_endpoint,
    );

    match cli.command {
        Command::Run { jobs } => run(&config, &jobs).await,
        Command::Probe => {
            probe(&config);
            Ok(())
        }
    }
}

async fn run(config: &Config, jobs_path: &Path) -> anyhow::Result<()> {
    let content = tokio::fs::read_to_string(jobs_path)
        .await
        .with_context(|| format!("Failed to read jobs file {}", jobs_path.display()))?;
    let jobs = parse_jobs(&content)
        .with_context(|| format!("Failed to parse jobs file {}", jobs_path.display()))?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        jobs = jobs.len(),
        max_workers = config.pool.max_workers,
        worker = %config.pool.worker_executable.display(),
        "Starting forkpool run"
    );

    let memory = Arc::new(MemoryMonitor::system());
    let factory = WorkerDaemonFactory::from_config(config, Arc::clone(&memory));

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let monitor_handle = config
        .memory
        .monitor_enabled
        .then(|| memory.spawn_monitor(config.memory.clone(), shutdown_rx));

    let default_config = ProcessConfiguration::new(config.pool.worker_executable.clone());
    let outputs = tokio::select! {
        outputs = run_jobs(&factory, jobs, &default_config) => Some(outputs),
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C shutdown signal");
            None
        }
    };

    factory.stop().await;
    let _ = shutdown_tx.send(true);
    if let Some(handle) = monitor_handle {
        let _ = handle.await;
    }

    let Some(outputs) = outputs else {
        warn!("Run interrupted before all jobs finished");
        return Ok(());
    };
    let failed = outputs
        .iter()
        .filter(|o| o.result.as_ref().is_none_or(|r| !r.is_success()))
        .count();
    for output in &outputs {
        print_line(&serde_json::to_string(output)?);
    }
    info!(total = outputs.len(), failed, "forkpool run finished");
    Ok(())
}

fn probe(config: &Config) {
    let memory = MemoryMonitor::system();
    let line = json!({
        "total_memory": memory.total_physical_memory(),
        "available_memory": memory.available_physical_memory(),
        "shortfall": memory.shortfall(&config.memory),
        "max_workers": config.pool.max_workers,
        "worker_executable": config.pool.worker_executable,
    });
    print_line(&line.to_string());
}

#[allow(clippy::print_stdout)]
fn print_line(line: &str) {
    println!("{line}");
}
