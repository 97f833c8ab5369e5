//! Worker launching
//!
//! A launcher produces a running worker together with the handles the
//! supervisor needs to manage it: the IPC transport, an exit notification
//! carrying the tail of the worker's output, and a hard-kill switch.
//!
//! [`ProcessLauncher`] is the production implementation: each worker is a
//! child process speaking newline-delimited JSON on stdin/stdout, with
//! stderr reserved for its logs.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::{oneshot, Mutex, Notify};
use tracing::{debug, warn};

use stampede_core::Address;
use stampede_ipc::{child_transport, TransportPair, WorkerPlan};

use crate::error::{AgentError, AgentResult};

/// Environment variable prefix for worker parameters.
const PARAMETER_ENV_PREFIX: &str = "STAMPEDE_";

/// How a worker ended: the process exit code (absent when the process was
/// killed by a signal) and the tail of its captured output.
#[derive(Debug, Clone)]
pub struct WorkerExit {
    pub exit_code: Option<i32>,
    pub last_output: Vec<String>,
}

/// Hard-stop switch for one running worker. Idempotent.
pub trait WorkerControl: Send + Sync {
    fn kill(&self);
}

/// A running worker as handed to the supervisor.
pub struct LaunchedWorker {
    /// Frames to and from the worker.
    pub transport: TransportPair,
    /// OS process id, when the worker is a process.
    pub pid: Option<u32>,
    /// Resolves once the worker is gone.
    pub exited: oneshot::Receiver<WorkerExit>,
    pub control: Arc<dyn WorkerControl>,
}

/// Producer of running workers. [`ProcessLauncher`] is used on real agents;
/// in-process launchers back single-machine runs and tests.
#[async_trait]
pub trait WorkerLauncher: Send + Sync {
    async fn launch(&self, plan: &WorkerPlan) -> AgentResult<LaunchedWorker>;
}

/// Launches workers as child processes of the agent.
///
/// The worker binary defaults to the agent's own executable, re-invoked in
/// worker mode. Worker parameters are exported as `STAMPEDE_*` environment
/// variables; stdin/stdout carry the IPC frames and stderr is tailed into a
/// ring buffer for exit reports.
pub struct ProcessLauncher {
    binary: Option<PathBuf>,
    capture_lines: usize,
}

impl ProcessLauncher {
    pub fn new(binary: Option<PathBuf>, capture_lines: usize) -> Self {
        Self {
            binary,
            capture_lines: capture_lines.max(1),
        }
    }

    fn worker_binary(&self) -> AgentResult<PathBuf> {
        match &self.binary {
            Some(path) => Ok(path.clone()),
            None => Ok(std::env::current_exe()?),
        }
    }
}

#[async_trait]
impl WorkerLauncher for ProcessLauncher {
    async fn launch(&self, plan: &WorkerPlan) -> AgentResult<LaunchedWorker> {
        let worker = plan.address;
        let binary = self.worker_binary()?;

        let mut command = Command::new(&binary);
        command
            .arg("worker")
            .arg("--address")
            .arg(worker.to_string())
            .env("STAMPEDE_WORKER_KIND", plan.settings.kind.as_str())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in &plan.settings.parameters {
            command.env(
                format!("{PARAMETER_ENV_PREFIX}{}", key.to_uppercase()),
                value,
            );
        }

        let mut child = command.spawn().map_err(|error| AgentError::LaunchFailed {
            worker,
            reason: format!("could not spawn {}: {error}", binary.display()),
        })?;
        let pid = child.id();
        debug!(%worker, ?pid, binary = %binary.display(), "worker process spawned");

        let stdin = child.stdin.take().ok_or_else(|| AgentError::LaunchFailed {
            worker,
            reason: "child has no stdin pipe".to_string(),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| AgentError::LaunchFailed {
            worker,
            reason: "child has no stdout pipe".to_string(),
        })?;
        let stderr = child.stderr.take().ok_or_else(|| AgentError::LaunchFailed {
            worker,
            reason: "child has no stderr pipe".to_string(),
        })?;
        let transport = child_transport(stdin, stdout);

        // Worker logs arrive on stderr; keep the last N lines so an
        // unexpected exit can be reported with some context.
        let tail = Arc::new(Mutex::new(VecDeque::with_capacity(self.capture_lines)));
        let capture_lines = self.capture_lines;
        let tail_writer = Arc::clone(&tail);
        let reader = tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(%worker, "{line}");
                let mut tail = tail_writer.lock().await;
                if tail.len() == capture_lines {
                    tail.pop_front();
                }
                tail.push_back(line);
            }
        });

        let kill = Arc::new(Notify::new());
        let control = Arc::new(ProcessControl {
            signal: Arc::clone(&kill),
        });
        let (exit_tx, exit_rx) = oneshot::channel();
        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                _ = kill.notified() => {
                    if let Err(error) = child.kill().await {
                        warn!(%worker, %error, "force kill failed");
                    }
                    child.wait().await
                }
            };
            let exit_code = match status {
                Ok(status) => status.code(),
                Err(error) => {
                    warn!(%worker, %error, "could not collect exit status");
                    None
                }
            };
            // Give the stderr reader a moment to drain the pipe before the
            // tail is snapshotted.
            let _ = tokio::time::timeout(Duration::from_millis(200), reader).await;
            let last_output = tail.lock().await.iter().cloned().collect();
            let _ = exit_tx.send(WorkerExit {
                exit_code,
                last_output,
            });
        });

        Ok(LaunchedWorker {
            transport,
            pid,
            exited: exit_rx,
            control,
        })
    }
}

struct ProcessControl {
    signal: Arc<Notify>,
}

impl WorkerControl for ProcessControl {
    fn kill(&self) {
        self.signal.notify_one();
    }
}

/// Format a worker exit the way failure reports expect it.
pub fn describe_exit(worker: &Address, exit: &WorkerExit) -> String {
    let code = exit
        .exit_code
        .map(|code| code.to_string())
        .unwrap_or_else(|| "signal".to_string());
    if exit.last_output.is_empty() {
        format!("worker {worker} exited (code {code})")
    } else {
        format!(
            "worker {worker} exited (code {code}), last output:\n{}",
            exit.last_output.join("\n")
        )
    }
}
