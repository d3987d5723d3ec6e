//! Batch job files for the `forkpool run` command.

use forkpool_core::{ProcessConfiguration, WorkItem, WorkResult, WorkerKind};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::dispatch::WorkerDaemonFactory;

fn default_kind() -> WorkerKind {
    WorkerKind::new("default")
}

/// One entry of a jobs file.
#[derive(Debug, Clone, Deserialize)]
pub struct Job {
    pub display_name: String,
    pub action: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default = "default_kind")]
    pub kind: WorkerKind,
    /// Process configuration; the configured worker executable when absent.
    #[serde(default)]
    pub configuration: Option<ProcessConfiguration>,
}

/// One line of `forkpool run` output.
#[derive(Debug, Clone, Serialize)]
pub struct JobOutput {
    pub index: usize,
    pub display_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<WorkResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Parse a JSON array of jobs.
pub fn parse_jobs(content: &str) -> forkpool_core::Result<Vec<Job>> {
    Ok(serde_json::from_str(content)?)
}

/// Dispatch every job concurrently, returning outputs in job order.
///
/// Jobs without a configuration run in `default_config`.
pub async fn run_jobs(
    factory: &WorkerDaemonFactory,
    jobs: Vec<Job>,
    default_config: &ProcessConfiguration,
) -> Vec<JobOutput> {
    let dispatches = jobs.into_iter().enumerate().map(|(index, job)| {
        let Job {
            display_name,
            action,
            payload,
            kind,
            configuration,
        } = job;
        let config = configuration.unwrap_or_else(|| default_config.clone());
        let worker = factory.get_worker(kind, config);
        let item = WorkItem::new(display_name.clone(), action, payload);
        async move {
            let (result, error) = match worker.execute(item).await {
                Ok(result) => (Some(result), None),
                Err(e) => (None, Some(e.to_string())),
            };
            JobOutput {
                index,
                display_name,
                result,
                error,
            }
        }
    });
    join_all(dispatches).await
}
