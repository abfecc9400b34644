//! Container runtime abstraction.
//!
//! A container backs exactly one session. The lifecycle manager drives
//! backends only through [`ContainerRuntime`], so the Docker CLI backend and
//! the local-process backend are interchangeable.

use crate::config::ResourceLimits;
use crate::errors::{Result, SandboxError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::process::ExitStatus;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::process::Child;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::warn;

pub mod docker;
pub mod local;
#[cfg(test)]
pub mod scripted;

pub use docker::DockerRuntime;
pub use local::LocalProcessRuntime;

/// What to provision
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    /// Host directory mounted as the guest workspace
    pub workspace: PathBuf,
    pub limits: ResourceLimits,
    pub user: Option<String>,
    pub env: Vec<(String, String)>,
}

/// Handle to a provisioned container
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ContainerRef {
    pub id: String,
    pub name: String,
    /// Workspace path on the host
    pub workspace: PathBuf,
    /// The same directory as seen by processes inside the container
    pub guest_workspace: String,
    pub created_at: DateTime<Utc>,
}

/// One process to run inside a container
#[derive(Debug, Clone)]
pub struct ExecInvocation {
    /// Unique per call; used to find the process again when it must be killed
    pub id: String,
    pub argv: Vec<String>,
    pub env: Vec<(String, String)>,
    /// Guest working directory
    pub workdir: String,
}

/// Bounds and side channels for one exec
#[derive(Debug, Clone)]
pub struct ExecControl {
    pub timeout: Duration,
    pub cancel: CancellationToken,
    /// Receives each stdout line as it is produced
    pub stdout_lines: Option<mpsc::Sender<String>>,
    /// Collected stdout/stderr beyond this are dropped
    pub max_output_bytes: usize,
    /// A single line longer than this is discarded without being buffered
    pub max_line_bytes: usize,
}

impl ExecControl {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout,
            cancel: CancellationToken::new(),
            stdout_lines: None,
            max_output_bytes: 16 * 1024 * 1024,
            max_line_bytes: 16 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub truncated: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExecOutcome {
    Completed(ExecOutput),
    /// Wall-clock limit hit; the process has been killed
    TimedOut,
    /// Cancellation requested; the process has been killed
    Cancelled,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct IoCounters {
    pub rx: u64,
    pub tx: u64,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct BlockIoCounters {
    pub read: u64,
    pub write: u64,
}

/// Point-in-time usage snapshot of one container
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ContainerMetrics {
    /// Bytes
    pub memory_usage: u64,
    /// Bytes
    pub memory_limit: u64,
    /// Percent of one core
    pub cpu_usage: f64,
    #[serde(rename = "networkIO")]
    pub network_io: IoCounters,
    #[serde(rename = "blockIO")]
    pub block_io: BlockIoCounters,
    pub pids: u64,
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Human-readable backend name ("docker", "local")
    fn backend_name(&self) -> &'static str;

    /// Interpreter to invoke inside the container
    fn interpreter(&self) -> String;

    async fn is_available(&self) -> bool;

    async fn create(&self, spec: &ContainerSpec) -> Result<ContainerRef>;

    async fn is_running(&self, container: &ContainerRef) -> Result<bool>;

    async fn exec(
        &self,
        container: &ContainerRef,
        invocation: ExecInvocation,
        control: ExecControl,
    ) -> Result<ExecOutcome>;

    async fn remove(&self, container: &ContainerRef) -> Result<()>;

    /// Names of containers managed by this backend that start with `prefix`
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;

    async fn remove_by_name(&self, name: &str) -> Result<()>;

    /// `None` when the backend cannot report usage for this container
    async fn stats(&self, container: &ContainerRef) -> Result<Option<ContainerMetrics>>;
}

pub(crate) enum ChildEnd {
    Exited(ExitStatus),
    TimedOut,
    Cancelled,
}

/// Collects a child's output while enforcing the timeout and cancellation.
/// On `TimedOut`/`Cancelled` the caller is responsible for killing the process.
pub(crate) struct ChildDriver {
    stdout: JoinHandle<(String, bool)>,
    stderr: JoinHandle<(String, bool)>,
}

impl ChildDriver {
    pub(crate) fn attach(child: &mut Child, control: &ExecControl) -> Result<Self> {
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SandboxError::RuntimeError("stdout was not captured".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| SandboxError::RuntimeError("stderr was not captured".to_string()))?;
        let limits = (control.max_output_bytes, control.max_line_bytes);
        Ok(Self {
            stdout: tokio::spawn(collect_lines(stdout, limits, control.stdout_lines.clone())),
            stderr: tokio::spawn(collect_lines(stderr, limits, None)),
        })
    }

    pub(crate) async fn wait(child: &mut Child, control: &ExecControl) -> Result<ChildEnd> {
        tokio::select! {
            status = child.wait() => Ok(ChildEnd::Exited(status?)),
            _ = tokio::time::sleep(control.timeout) => Ok(ChildEnd::TimedOut),
            _ = control.cancel.cancelled() => Ok(ChildEnd::Cancelled),
        }
    }

    /// Gather output after the process exited normally.
    pub(crate) async fn finish(self, status: ExitStatus) -> ExecOutput {
        // Pipes inherited by stray grandchildren can stay open; don't wait on them forever.
        let grace = Duration::from_secs(2);
        let (stdout, out_truncated) = join_collector(self.stdout, grace).await;
        let (stderr, err_truncated) = join_collector(self.stderr, grace).await;
        ExecOutput {
            stdout,
            stderr,
            exit_code: status.code().unwrap_or(-1),
            truncated: out_truncated || err_truncated,
        }
    }

    pub(crate) fn abort(self) {
        self.stdout.abort();
        self.stderr.abort();
    }
}

async fn join_collector(handle: JoinHandle<(String, bool)>, grace: Duration) -> (String, bool) {
    let abort = handle.abort_handle();
    match tokio::time::timeout(grace, handle).await {
        Ok(Ok(collected)) => collected,
        Ok(Err(e)) => {
            warn!("[RUNTIME] Output collector failed: {}", e);
            (String::new(), false)
        }
        Err(_) => {
            abort.abort();
            warn!("[RUNTIME] Output pipe still open after exit; dropping remainder");
            (String::new(), true)
        }
    }
}

/// Consume input up to and including the next newline.
async fn discard_line<R>(reader: &mut R) -> std::io::Result<()>
where
    R: AsyncBufRead + Unpin,
{
    loop {
        let chunk = reader.fill_buf().await?;
        if chunk.is_empty() {
            return Ok(());
        }
        match chunk.iter().position(|b| *b == b'\n') {
            Some(end) => {
                reader.consume(end + 1);
                return Ok(());
            }
            None => {
                let len = chunk.len();
                reader.consume(len);
            }
        }
    }
}

async fn collect_lines<R>(
    reader: R,
    (limit, line_limit): (usize, usize),
    lines: Option<mpsc::Sender<String>>,
) -> (String, bool)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut collected = String::new();
    let mut truncated = false;
    let mut buf = Vec::new();
    let cap = line_limit as u64 + 1;

    loop {
        buf.clear();
        match (&mut reader).take(cap).read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(read) => {
                if read as u64 == cap && buf.last() != Some(&b'\n') {
                    warn!("[RUNTIME] Dropping output line longer than {} bytes", line_limit);
                    truncated = true;
                    if let Err(e) = discard_line(&mut reader).await {
                        warn!("[RUNTIME] Failed reading process output: {}", e);
                        break;
                    }
                    continue;
                }
                let line = String::from_utf8_lossy(&buf);
                if collected.len() + line.len() <= limit {
                    collected.push_str(&line);
                } else {
                    truncated = true;
                }
                if let Some(tx) = &lines {
                    let trimmed = line.trim_end_matches(['\n', '\r']).to_string();
                    // Receiver gone means nobody is streaming anymore; keep collecting.
                    let _ = tx.send(trimmed).await;
                }
            }
            Err(e) => {
                warn!("[RUNTIME] Failed reading process output: {}", e);
                break;
            }
        }
    }
    (collected, truncated)
}
