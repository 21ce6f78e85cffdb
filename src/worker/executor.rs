use std::process::Stdio;
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{PyplnError, Result};
use crate::store::Document;
use crate::worker::WorkerSpec;

/// Spawns worker programs as isolated subprocesses.
///
/// Every worker leads its own process group, so terminating it also reaches
/// anything it forked.
#[derive(Debug, Clone)]
pub struct WorkerExecutor {
    kill_grace: Duration,
}

impl WorkerExecutor {
    pub fn new(kill_grace: Duration) -> Self {
        Self { kill_grace }
    }

    /// Start `spec` with `input` written to its stdin.
    pub fn spawn(&self, spec: &WorkerSpec, input: &Value) -> Result<RunningWorker> {
        let mut child = Command::new(&spec.program)
            .args(&spec.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                PyplnError::Worker(format!(
                    "failed to spawn {} ({}): {}",
                    spec.name,
                    spec.program.display(),
                    e
                ))
            })?;

        let pid = child
            .id()
            .ok_or_else(|| PyplnError::Worker(format!("{} exited before start", spec.name)))?;

        let mut payload = serde_json::to_vec(input)?;
        payload.push(b'\n');
        let stdin_task = child.stdin.take().map(|mut stdin| {
            tokio::spawn(async move {
                // A worker that ignores its input may exit before reading it.
                let _ = stdin.write_all(&payload).await;
                let _ = stdin.shutdown().await;
            })
        });
        let stdout_task = child.stdout.take().map(read_to_end);
        let stderr_task = child.stderr.take().map(read_to_end);

        tracing::debug!(worker = %spec.name, pid, "Spawned worker");

        Ok(RunningWorker {
            name: spec.name.clone(),
            child,
            pid,
            started: Instant::now(),
            timeout: spec.timeout(),
            kill_grace: self.kill_grace,
            stdin_task,
            stdout_task,
            stderr_task,
        })
    }
}

fn read_to_end<R>(mut reader: R) -> JoinHandle<Vec<u8>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = Vec::new();
        let _ = reader.read_to_end(&mut buf).await;
        buf
    })
}

/// A spawned worker that has not been reaped yet.
pub struct RunningWorker {
    name: String,
    child: Child,
    pid: u32,
    started: Instant,
    timeout: Option<Duration>,
    kill_grace: Duration,
    stdin_task: Option<JoinHandle<()>>,
    stdout_task: Option<JoinHandle<Vec<u8>>>,
    stderr_task: Option<JoinHandle<Vec<u8>>>,
}

impl std::fmt::Debug for RunningWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunningWorker")
            .field("name", &self.name)
            .field("pid", &self.pid)
            .finish()
    }
}

impl RunningWorker {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Wait for the worker and parse its output into field updates.
    ///
    /// Cancelling `cancel` terminates the worker and returns
    /// [`PyplnError::Interrupted`]; a worker that cannot be killed yields
    /// [`PyplnError::Supervision`].
    pub async fn wait(mut self, cancel: &CancellationToken) -> Result<Document> {
        let deadline = self.timeout.map(|t| self.started + t);

        let status = tokio::select! {
            status = self.child.wait() => status?,
            _ = cancel.cancelled() => {
                tracing::info!(worker = %self.name, pid = self.pid, "Terminating worker");
                self.terminate().await?;
                return Err(PyplnError::Interrupted);
            }
            _ = sleep_until(deadline) => {
                tracing::warn!(worker = %self.name, pid = self.pid, "Worker timed out");
                self.terminate().await?;
                return Err(PyplnError::Worker(format!(
                    "{} timed out after {:.3}s",
                    self.name,
                    self.elapsed().as_secs_f64()
                )));
            }
        };

        // Nothing the worker forked may outlive it or hold its pipes open.
        signal_group(self.pid, Signal::SIGKILL);

        if let Some(task) = self.stdin_task.take() {
            let _ = task.await;
        }
        let stdout = join_output(self.stdout_task.take()).await;
        let stderr = join_output(self.stderr_task.take()).await;

        if !status.success() {
            let stderr = String::from_utf8_lossy(&stderr).trim().to_string();
            return Err(PyplnError::Worker(if stderr.is_empty() {
                format!("{} exited with {}", self.name, status)
            } else {
                stderr
            }));
        }

        parse_output(&self.name, &stdout)
    }

    /// SIGTERM the worker's group, then SIGKILL it once `kill_grace` passes.
    async fn terminate(&mut self) -> Result<()> {
        signal_group(self.pid, Signal::SIGTERM);
        if tokio::time::timeout(self.kill_grace, self.child.wait())
            .await
            .is_err()
        {
            tracing::warn!(worker = %self.name, pid = self.pid, "Worker ignored SIGTERM, killing");
        }
        signal_group(self.pid, Signal::SIGKILL);

        match tokio::time::timeout(self.kill_grace, self.child.wait()).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(PyplnError::Supervision(format!(
                "failed to reap {} (pid {}): {}",
                self.name, self.pid, e
            ))),
            Err(_) => Err(PyplnError::Supervision(format!(
                "{} (pid {}) survived SIGKILL",
                self.name, self.pid
            ))),
        }
    }
}

fn signal_group(pid: u32, signal: Signal) {
    let Ok(raw) = i32::try_from(pid) else {
        return;
    };
    match killpg(Pid::from_raw(raw), signal) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => tracing::warn!(pid, signal = ?signal, error = %e, "Failed to signal worker group"),
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn join_output(task: Option<JoinHandle<Vec<u8>>>) -> Vec<u8> {
    match task {
        Some(task) => task.await.unwrap_or_default(),
        None => Vec::new(),
    }
}

/// Empty output is a no-op; anything else must be a JSON object.
pub fn parse_output(worker: &str, stdout: &[u8]) -> Result<Document> {
    let text = String::from_utf8_lossy(stdout);
    let text = text.trim();
    if text.is_empty() {
        return Ok(Document::new());
    }
    match serde_json::from_str::<Value>(text) {
        Ok(Value::Object(fields)) => Ok(fields),
        Ok(other) => Err(PyplnError::Worker(format!(
            "{} returned {} instead of an object",
            worker,
            json_kind(&other)
        ))),
        Err(e) => Err(PyplnError::Worker(format!(
            "{} returned unparsable output: {}",
            worker, e
        ))),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
