//! Configuration resolution for forkpool.
//!
//! Implements hierarchical config resolution:
//! 1. Built-in defaults
//! 2. Global config (~/.config/forkpool/settings.json)
//! 3. Project config (.forkpool/settings.json)
//! 4. Environment variables
//! 5. CLI arguments (highest priority, applied by the binaries)

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Fallback when the host parallelism cannot be determined.
const FALLBACK_MAX_WORKERS: usize = 4;

/// Complete forkpool configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub memory: MemoryConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Worker pool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Number of lease permits, i.e. work items that may run in parallel.
    pub max_workers: usize,
    /// Worker executable used when a job does not name its own.
    pub worker_executable: PathBuf,
    /// Base directory handed out as worker working directories.
    pub worker_directory: Option<PathBuf>,
    /// Seconds to wait for a new worker's ready message.
    pub startup_timeout_secs: u64,
    /// Seconds to wait for a single execution; 0 disables the timeout.
    pub execute_timeout_secs: u64,
    /// Seconds to wait for graceful worker shutdown before SIGKILL.
    pub terminate_timeout_secs: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            worker_executable: PathBuf::from("forkpool-worker"),
            worker_directory: None,
            startup_timeout_secs: 30,
            execute_timeout_secs: 0,
            terminate_timeout_secs: 5,
        }
    }
}

/// Memory pressure monitoring configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Whether the periodic memory monitor runs at all.
    pub monitor_enabled: bool,
    /// Probe interval in milliseconds.
    pub poll_interval_ms: u64,
    /// Absolute free-memory floor in bytes.
    pub min_free_bytes: u64,
    /// Free-memory floor as a fraction of total physical memory.
    pub min_free_ratio: f64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            monitor_enabled: true,
            poll_interval_ms: 5_000,
            min_free_bytes: 384 * 1024 * 1024, // 384 MiB
            min_free_ratio: 0.1,
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

/// Host parallelism, used as the default permit count.
pub fn default_max_workers() -> usize {
    std::thread::available_parallelism().map_or(FALLBACK_MAX_WORKERS, std::num::NonZeroUsize::get)
}

/// Load configuration with hierarchical resolution.
pub fn load_config(project_dir: Option<&Path>) -> Result<Config> {
    let global = global_config_path();
    let project = project_dir.map(|dir| dir.join(".forkpool").join("settings.json"));
    let mut config = load_layers(global.iter().chain(project.iter()).map(PathBuf::as_path))?;

    // Apply environment overrides
    apply_overrides(&mut config, |key| std::env::var(key).ok());

    validate(&config)?;
    Ok(config)
}

/// Layer the existing files among `paths` over the defaults, later files
/// winning. Only the keys a file sets replace earlier values.
fn load_layers<'a>(paths: impl IntoIterator<Item = &'a Path>) -> Result<Config> {
    let mut merged = serde_json::to_value(Config::default())
        .map_err(|e| Error::Config(format!("Failed to encode default config: {e}")))?;
    for path in paths {
        if path.exists() {
            merge_values(&mut merged, load_config_file(path)?);
        }
    }
    serde_json::from_value(merged)
        .map_err(|e| Error::Config(format!("Failed to resolve config: {e}")))
}

/// Get the global config file path.
pub fn global_config_path() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .ok()
            .map(|h| PathBuf::from(h).join(".forkpool").join("settings.json"))
    }
    #[cfg(target_os = "macos")]
    {
        std::env::var("HOME")
            .ok()
            .map(|h| PathBuf::from(h).join("Library/Application Support/forkpool/settings.json"))
    }
    #[cfg(target_os = "linux")]
    {
        std::env::var("XDG_CONFIG_HOME")
            .ok()
            .map(PathBuf::from)
            .or_else(|| std::env::var("HOME").ok().map(|h| PathBuf::from(h).join(".config")))
            .map(|p| p.join("forkpool").join("settings.json"))
    }
    #[cfg(not(any(target_os = "windows", target_os = "macos", target_os = "linux")))]
    {
        None
    }
}

/// Read one settings file as raw JSON, checking it against [`Config`].
fn load_config_file(path: &Path) -> Result<Value> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    let value: Value = serde_json::from_str(&content).map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })?;
    serde_json::from_value::<Config>(value.clone()).map_err(|e| {
        Error::Config(format!("Invalid config file {}: {}", path.display(), e))
    })?;
    Ok(value)
}

fn merge_values(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(existing) => merge_values(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

/// Apply `FORKPOOL_*` overrides read through `lookup`.
///
/// Unparseable numeric values are ignored.
pub fn apply_overrides<F>(config: &mut Config, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(n) = lookup("FORKPOOL_MAX_WORKERS").and_then(|v| v.parse().ok()) {
        config.pool.max_workers = n;
    }
    if let Some(val) = lookup("FORKPOOL_WORKER_BIN") {
        config.pool.worker_executable = PathBuf::from(val);
    }
    if let Some(val) = lookup("FORKPOOL_WORKER_DIR") {
        config.pool.worker_directory = Some(PathBuf::from(val));
    }
    if let Some(n) = lookup("FORKPOOL_EXECUTE_TIMEOUT").and_then(|v| v.parse().ok()) {
        config.pool.execute_timeout_secs = n;
    }
    if let Some(val) = lookup("FORKPOOL_MEMORY_MONITOR") {
        config.memory.monitor_enabled = matches!(val.as_str(), "1" | "true" | "on");
    }
    if let Some(val) = lookup("FORKPOOL_LOG_LEVEL") {
        config.logging.level = val;
    }
}

/// Reject configurations the pool cannot run with.
pub fn validate(config: &Config) -> Result<()> {
    if config.pool.max_workers == 0 {
        return Err(Error::Config("pool.max_workers must be at least 1".into()));
    }
    if !(0.0..=1.0).contains(&config.memory.min_free_ratio) {
        return Err(Error::Config(format!(
            "memory.min_free_ratio must be within 0..=1, got {}",
            config.memory.min_free_ratio
        )));
    }
    Ok(())
}
