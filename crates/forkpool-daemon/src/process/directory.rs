//! Working directories handed to newly spawned workers.

use std::path::PathBuf;

use tracing::warn;

/// Supplies an on-disk working directory for a new worker process.
pub trait WorkerDirectoryProvider: Send + Sync {
    fn idle_working_directory(&self) -> std::io::Result<PathBuf>;
}

/// Shares one `workers` directory under a base directory, created on demand.
#[derive(Debug, Clone)]
pub struct DefaultWorkerDirectoryProvider {
    directory: PathBuf,
}

impl DefaultWorkerDirectoryProvider {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self {
            directory: base.into().join("workers"),
        }
    }

    /// Use `configured` when set, otherwise `~/.forkpool`.
    pub fn from_config(configured: Option<PathBuf>) -> Self {
        let base = configured.unwrap_or_else(|| {
            dirs::home_dir().map_or_else(
                || {
                    warn!("dirs::home_dir() returned None; falling back to temp_dir for workers");
                    std::env::temp_dir().join("forkpool")
                },
                |home| home.join(".forkpool"),
            )
        });
        Self::new(base)
    }
}

impl WorkerDirectoryProvider for DefaultWorkerDirectoryProvider {
    fn idle_working_directory(&self) -> std::io::Result<PathBuf> {
        std::fs::create_dir_all(&self.directory)?;
        Ok(self.directory.clone())
    }
}
