//! Worker process configuration and the reuse-compatibility predicate.
//!
//! A pooled worker is reused for a request when its *running* configuration
//! already provides everything the *requested* configuration asks for. See
//! [`ProcessConfiguration::is_compatible_with`] for the exact rule.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// How long a worker process is expected to live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeepAliveMode {
    /// Lives until the pool is stopped or the worker is evicted.
    #[default]
    Session,
    /// Survives pool shutdown (never reused across incompatible modes).
    Daemon,
}

/// Immutable description of the environment a worker process runs in.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProcessConfiguration {
    /// Executable started for the worker.
    pub executable: PathBuf,
    /// Module set loaded into the worker (classpath entries, plugins, ...).
    #[serde(default)]
    pub modules: BTreeSet<String>,
    /// Extra command-line arguments.
    #[serde(default)]
    pub arguments: BTreeSet<String>,
    /// Packages shared with the host.
    #[serde(default)]
    pub shared_packages: BTreeSet<String>,
    /// Environment variables set for the process.
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    /// Minimum heap in MiB.
    #[serde(default)]
    pub min_heap_mb: Option<u64>,
    /// Maximum heap in MiB.
    #[serde(default)]
    pub max_heap_mb: Option<u64>,
    #[serde(default)]
    pub keep_alive: KeepAliveMode,
}

impl ProcessConfiguration {
    /// Configuration running `executable` with no further requirements.
    pub fn new(executable: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
            modules: BTreeSet::new(),
            arguments: BTreeSet::new(),
            shared_packages: BTreeSet::new(),
            environment: BTreeMap::new(),
            min_heap_mb: None,
            max_heap_mb: None,
            keep_alive: KeepAliveMode::Session,
        }
    }

    #[must_use]
    pub fn with_module(mut self, module: impl Into<String>) -> Self {
        self.modules.insert(module.into());
        self
    }

    #[must_use]
    pub fn with_argument(mut self, arg: impl Into<String>) -> Self {
        self.arguments.insert(arg.into());
        self
    }

    #[must_use]
    pub fn with_shared_package(mut self, package: impl Into<String>) -> Self {
        self.shared_packages.insert(package.into());
        self
    }

    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub const fn with_heap_mb(mut self, min: Option<u64>, max: Option<u64>) -> Self {
        self.min_heap_mb = min;
        self.max_heap_mb = max;
        self
    }

    #[must_use]
    pub const fn with_keep_alive(mut self, mode: KeepAliveMode) -> Self {
        self.keep_alive = mode;
        self
    }

    /// Whether a process started with `self` can serve `requested`.
    ///
    /// Holds iff executable, environment and keep-alive mode are equal, the
    /// requested module, argument and shared-package sets are subsets of
    /// ours, and our heap bounds are at least the requested ones. An unset
    /// requested bound is always satisfied; an unset running bound only
    /// satisfies an unset request.
    pub fn is_compatible_with(&self, requested: &Self) -> bool {
        self.executable == requested.executable
            && self.environment == requested.environment
            && self.keep_alive == requested.keep_alive
            && requested.modules.is_subset(&self.modules)
            && requested.arguments.is_subset(&self.arguments)
            && requested.shared_packages.is_subset(&self.shared_packages)
            && heap_satisfies(self.min_heap_mb, requested.min_heap_mb)
            && heap_satisfies(self.max_heap_mb, requested.max_heap_mb)
    }

    /// Configured maximum heap in bytes, if any.
    pub const fn max_heap_bytes(&self) -> Option<u64> {
        match self.max_heap_mb {
            Some(mb) => Some(mb.saturating_mul(1024 * 1024)),
            None => None,
        }
    }
}

const fn heap_satisfies(running: Option<u64>, requested: Option<u64>) -> bool {
    match (running, requested) {
        (_, None) => true,
        (None, Some(_)) => false,
        (Some(have), Some(want)) => have >= want,
    }
}
