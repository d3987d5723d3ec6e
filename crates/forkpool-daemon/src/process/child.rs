//! Worker processes spawned as OS child processes.
//!
//! Manages spawning, the ready handshake, line-protocol calls, and graceful
//! shutdown of worker executables.

use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use forkpool_core::config::PoolConfig;
use forkpool_core::protocol::{self, HostMessage, WorkerMessage};
use forkpool_core::{ProcessConfiguration, WorkItem, WorkResult, WorkerKind};

use super::launcher::{LaunchError, ProtocolError, WorkerLauncher, WorkerProcess};

/// Launches workers with `tokio::process`.
#[derive(Debug, Clone)]
pub struct ChildProcessLauncher {
    startup_timeout: Duration,
    execute_timeout: Option<Duration>,
    terminate_timeout: Duration,
}

impl ChildProcessLauncher {
    pub const fn new(
        startup_timeout: Duration,
        execute_timeout: Option<Duration>,
        terminate_timeout: Duration,
    ) -> Self {
        Self {
            startup_timeout,
            execute_timeout,
            terminate_timeout,
        }
    }

    pub const fn from_config(config: &PoolConfig) -> Self {
        let execute_timeout = if config.execute_timeout_secs == 0 {
            None
        } else {
            Some(Duration::from_secs(config.execute_timeout_secs))
        };
        Self::new(
            Duration::from_secs(config.startup_timeout_secs),
            execute_timeout,
            Duration::from_secs(config.terminate_timeout_secs),
        )
    }
}

/// Command-line arguments describing `config` to the worker.
pub fn worker_arguments(kind: &WorkerKind, config: &ProcessConfiguration) -> Vec<String> {
    let mut args = vec!["--kind".to_string(), kind.to_string()];
    for module in &config.modules {
        args.push("--module".to_string());
        args.push(module.clone());
    }
    for package in &config.shared_packages {
        args.push("--shared".to_string());
        args.push(package.clone());
    }
    if let Some(mb) = config.min_heap_mb {
        args.push("--min-heap-mb".to_string());
        args.push(mb.to_string());
    }
    if let Some(mb) = config.max_heap_mb {
        args.push("--max-heap-mb".to_string());
        args.push(mb.to_string());
    }
    args.extend(config.arguments.iter().cloned());
    args
}

#[async_trait]
impl WorkerLauncher for ChildProcessLauncher {
    async fn launch(
        &self,
        kind: &WorkerKind,
        working_directory: &Path,
        config: &ProcessConfiguration,
    ) -> Result<Box<dyn WorkerProcess>, LaunchError> {
        let mut cmd = Command::new(&config.executable);
        cmd.current_dir(working_directory)
            .args(worker_arguments(kind, config))
            .envs(&config.environment)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        info!(
            executable = %config.executable.display(),
            working_dir = %working_directory.display(),
            %kind,
            "Spawning worker process"
        );
        let mut child = cmd.spawn().map_err(|e| LaunchError::SpawnFailed {
            executable: config.executable.clone(),
            reason: e.to_string(),
        })?;
        let pid = child.id();

        let stdin = child.stdin.take().ok_or_else(|| LaunchError::SpawnFailed {
            executable: config.executable.clone(),
            reason: "Failed to capture stdin".to_string(),
        })?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| LaunchError::SpawnFailed {
                executable: config.executable.clone(),
                reason: "Failed to capture stdout".to_string(),
            })?;

        // Set up stderr reader for diagnostics
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let reader = BufReader::new(stderr);
                let mut lines = reader.lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    warn!(pid, "worker stderr: {}", line);
                }
                debug!(pid, "stderr reader finished");
            });
        }

        let mut lines = BufReader::new(stdout).lines();
        match tokio::time::timeout(self.startup_timeout, await_ready(&mut lines)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                child.kill().await.ok();
                return Err(e);
            }
            Err(_) => {
                child.kill().await.ok();
                return Err(LaunchError::StartupTimeout {
                    secs: self.startup_timeout.as_secs(),
                });
            }
        }

        info!(pid, %kind, "Worker process ready");
        Ok(Box::new(ChildWorkerProcess {
            pid,
            io: Mutex::new(ChildIo {
                stdin,
                stdout: lines,
            }),
            child: Mutex::new(child),
            next_request: AtomicU64::new(1),
            execute_timeout: self.execute_timeout,
            terminate_timeout: self.terminate_timeout,
        }))
    }
}

async fn await_ready(lines: &mut Lines<BufReader<ChildStdout>>) -> Result<(), LaunchError> {
    loop {
        let line = lines
            .next_line()
            .await
            .map_err(|e| LaunchError::Handshake {
                reason: e.to_string(),
            })?
            .ok_or_else(|| LaunchError::Handshake {
                reason: "worker exited before signalling ready".to_string(),
            })?;
        if line.trim().is_empty() {
            continue;
        }
        match protocol::parse_worker_line(&line) {
            Ok(WorkerMessage::Ready(_)) => return Ok(()),
            Ok(other) => debug!(?other, "Ignoring message before ready"),
            Err(e) => {
                return Err(LaunchError::Handshake {
                    reason: e.to_string(),
                });
            }
        }
    }
}

struct ChildIo {
    stdin: ChildStdin,
    stdout: Lines<BufReader<ChildStdout>>,
}

/// A worker child process speaking the line protocol.
struct ChildWorkerProcess {
    pid: Option<u32>,
    io: Mutex<ChildIo>,
    child: Mutex<Child>,
    next_request: AtomicU64,
    execute_timeout: Option<Duration>,
    terminate_timeout: Duration,
}

impl ChildWorkerProcess {
    async fn call(
        io: &mut ChildIo,
        request_id: &str,
        line: &str,
    ) -> Result<WorkResult, ProtocolError> {
        let io_err = |e: std::io::Error| ProtocolError::Io {
            reason: e.to_string(),
        };
        io.stdin.write_all(line.as_bytes()).await.map_err(io_err)?;
        io.stdin.write_all(b"\n").await.map_err(io_err)?;
        io.stdin.flush().await.map_err(io_err)?;

        loop {
            let Some(line) = io.stdout.next_line().await.map_err(io_err)? else {
                return Err(ProtocolError::Exited);
            };
            if line.trim().is_empty() {
                continue;
            }
            match protocol::parse_worker_line(&line) {
                Ok(WorkerMessage::Result(result)) if result.id == request_id => {
                    return Ok(result.outcome);
                }
                Ok(WorkerMessage::Result(result)) => {
                    return Err(ProtocolError::Mismatch {
                        expected: request_id.to_string(),
                        got: result.id,
                    });
                }
                Ok(other) => debug!(?other, "Ignoring unsolicited worker message"),
                Err(e) => {
                    return Err(ProtocolError::Malformed {
                        reason: e.to_string(),
                    });
                }
            }
        }
    }
}

#[async_trait]
impl WorkerProcess for ChildWorkerProcess {
    async fn execute(
        &self,
        kind: &WorkerKind,
        item: &WorkItem,
    ) -> Result<WorkResult, ProtocolError> {
        let request_id = self.next_request.fetch_add(1, Ordering::Relaxed).to_string();
        let request = HostMessage::Execute {
            id: request_id.clone(),
            kind: kind.clone(),
            item: item.clone(),
        };
        let line = serde_json::to_string(&request).map_err(|e| ProtocolError::Malformed {
            reason: e.to_string(),
        })?;

        let mut io = self.io.lock().await;
        debug!(pid = self.pid, request = %request_id, action = %item.action, "Sending work");
        match self.execute_timeout {
            Some(limit) => tokio::time::timeout(limit, Self::call(&mut io, &request_id, &line))
                .await
                .map_err(|_| ProtocolError::Timeout {
                    secs: limit.as_secs(),
                })?,
            None => Self::call(&mut io, &request_id, &line).await,
        }
    }

    #[allow(clippy::significant_drop_tightening)]
    async fn stop(&self) {
        // Ask politely when no call is in flight.
        if let Ok(mut io) = self.io.try_lock() {
            if let Ok(line) = serde_json::to_string(&HostMessage::Stop) {
                let _ = io.stdin.write_all(format!("{line}\n").as_bytes()).await;
                let _ = io.stdin.flush().await;
            }
        }

        let mut child = self.child.lock().await;
        if let Ok(Some(status)) = child.try_wait() {
            debug!(pid = self.pid, ?status, "Worker already exited");
            return;
        }

        #[cfg(unix)]
        {
            if let Some(pid) = child.id() {
                // SAFETY: pid is a valid process ID obtained from our own Child handle.
                // kill(2) with SIGINT is safe to call on any owned subprocess.
                #[allow(unsafe_code)]
                #[allow(clippy::cast_possible_wrap)]
                let ret = unsafe { libc::kill(pid as i32, libc::SIGINT) };
                if ret != 0 {
                    let err = std::io::Error::last_os_error();
                    warn!(pid, error = %err, "Failed to send SIGINT");
                }
            }
        }

        // Wait with timeout
        match tokio::time::timeout(self.terminate_timeout, child.wait()).await {
            Ok(Ok(status)) => {
                info!(pid = self.pid, ?status, "Worker exited gracefully");
            }
            Ok(Err(e)) => {
                warn!(pid = self.pid, error = %e, "Error waiting for worker");
                child.kill().await.ok();
            }
            Err(_) => {
                warn!(pid = self.pid, "Timeout waiting for graceful shutdown, killing");
                child.kill().await.ok();
            }
        }
    }

    fn pid(&self) -> Option<u32> {
        self.pid
    }
}
