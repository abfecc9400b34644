use super::{
    BlockIoCounters, ChildDriver, ChildEnd, ContainerMetrics, ContainerRef, ContainerRuntime,
    ContainerSpec, ExecControl, ExecInvocation, ExecOutcome, IoCounters,
};
use crate::errors::{Result, SandboxError};
use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Mount point of the session workspace inside every container
pub const GUEST_WORKSPACE: &str = "/workspace";

/// Docker-based runtime driven through the docker CLI.
pub struct DockerRuntime {
    cli: String,
}

impl Default for DockerRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl DockerRuntime {
    pub fn new() -> Self {
        Self {
            cli: "docker".to_string(),
        }
    }

    /// Use a docker-compatible CLI (e.g. podman)
    pub fn with_cli(cli: impl Into<String>) -> Self {
        Self { cli: cli.into() }
    }

    async fn run_cli(&self, args: &[String]) -> Result<std::process::Output> {
        Command::new(&self.cli)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| SandboxError::RuntimeError(format!("{} {}: {}", self.cli, args.join(" "), e)))
    }

    fn resource_args(spec: &ContainerSpec) -> Vec<String> {
        let limits = &spec.limits;
        vec![
            "--memory".to_string(),
            format!("{}m", limits.memory_mb),
            "--memory-swap".to_string(),
            format!("{}m", limits.memory_mb),
            "--cpus".to_string(),
            limits.cpus.to_string(),
            "--pids-limit".to_string(),
            limits.pids.to_string(),
        ]
    }

    fn hardening_args(spec: &ContainerSpec) -> Vec<String> {
        let mut args = vec![
            "--cap-drop=ALL".to_string(),
            "--security-opt=no-new-privileges".to_string(),
            "--read-only".to_string(),
            "--tmpfs".to_string(),
            format!("/tmp:rw,nosuid,nodev,size={}m", spec.limits.tmpfs_mb),
        ];
        if !spec.limits.allow_networking {
            args.push("--network=none".to_string());
        }
        args
    }

    fn user_arg(spec: &ContainerSpec) -> Option<String> {
        if let Some(user) = &spec.user {
            return Some(user.clone());
        }
        // Match the host owner of the bind-mounted workspace so the container
        // can write to it without any capabilities.
        #[cfg(unix)]
        {
            let (uid, gid) = unsafe { (libc::getuid(), libc::getgid()) };
            Some(format!("{uid}:{gid}"))
        }
        #[cfg(not(unix))]
        {
            None
        }
    }

    /// Full `docker run` argument list for a session container.
    pub fn run_args(spec: &ContainerSpec) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "-d".to_string(),
            "--name".to_string(),
            spec.name.clone(),
            "--label".to_string(),
            "pysandbox.managed=true".to_string(),
        ];
        args.extend(Self::hardening_args(spec));
        args.extend(Self::resource_args(spec));
        if let Some(user) = Self::user_arg(spec) {
            args.extend(["--user".to_string(), user]);
        }
        args.extend([
            "-v".to_string(),
            format!("{}:{}:rw", spec.workspace.display(), GUEST_WORKSPACE),
            "-w".to_string(),
            GUEST_WORKSPACE.to_string(),
            "-e".to_string(),
            "HOME=/tmp".to_string(),
            "-e".to_string(),
            "MPLCONFIGDIR=/tmp/matplotlib".to_string(),
            "-e".to_string(),
            "PYTHONDONTWRITEBYTECODE=1".to_string(),
            "-e".to_string(),
            format!("OMP_NUM_THREADS={}", spec.limits.max_threads),
            "-e".to_string(),
            format!("OPENBLAS_NUM_THREADS={}", spec.limits.max_threads),
        ]);
        for (k, v) in &spec.env {
            args.extend(["-e".to_string(), format!("{k}={v}")]);
        }
        args.push(spec.image.clone());
        args.extend(["sleep".to_string(), "infinity".to_string()]);
        args
    }

    fn pid_file(invocation_id: &str) -> String {
        let safe: String = invocation_id
            .chars()
            .filter(|c| c.is_ascii_alphanumeric() || *c == '-')
            .collect();
        format!("/tmp/.exec-{safe}.pid")
    }

    /// `docker exec` arguments. The shell records its pid before exec'ing the
    /// real command so the process can be killed from outside on timeout.
    pub fn exec_args(container: &ContainerRef, invocation: &ExecInvocation) -> Vec<String> {
        let mut args = vec![
            "exec".to_string(),
            "-w".to_string(),
            invocation.workdir.clone(),
        ];
        for (k, v) in &invocation.env {
            args.extend(["-e".to_string(), format!("{k}={v}")]);
        }
        args.push(container.name.clone());
        args.extend([
            "sh".to_string(),
            "-c".to_string(),
            format!("echo $$ > {} && exec \"$@\"", Self::pid_file(&invocation.id)),
            "sh".to_string(),
        ]);
        args.extend(invocation.argv.iter().cloned());
        args
    }

    async fn kill_exec(&self, container: &ContainerRef, invocation_id: &str) {
        let pid_file = Self::pid_file(invocation_id);
        let args = vec![
            "exec".to_string(),
            container.name.clone(),
            "sh".to_string(),
            "-c".to_string(),
            format!("kill -9 $(cat {pid_file}) 2>/dev/null; rm -f {pid_file}"),
        ];
        match self.run_cli(&args).await {
            Ok(output) if output.status.success() => {
                debug!("[DOCKER] Killed exec {} in {}", invocation_id, container.name)
            }
            Ok(output) => warn!(
                "[DOCKER] Kill of exec {} reported: {}",
                invocation_id,
                String::from_utf8_lossy(&output.stderr).trim()
            ),
            Err(e) => warn!("[DOCKER] Kill of exec {} failed: {}", invocation_id, e),
        }
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    fn backend_name(&self) -> &'static str {
        "docker"
    }

    fn interpreter(&self) -> String {
        "python3".to_string()
    }

    async fn is_available(&self) -> bool {
        let args = vec![
            "version".to_string(),
            "--format".to_string(),
            "{{.Server.Version}}".to_string(),
        ];
        matches!(self.run_cli(&args).await, Ok(output) if output.status.success())
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<ContainerRef> {
        let output = self
            .run_cli(&Self::run_args(spec))
            .await
            .map_err(|e| SandboxError::ProvisioningError(e.to_string()))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(SandboxError::ProvisioningError(format!(
                "docker run failed: {}",
                stderr.trim()
            )));
        }
        let id = String::from_utf8_lossy(&output.stdout).trim().to_string();
        info!("[DOCKER] Started {} ({})", spec.name, &id[..id.len().min(12)]);

        Ok(ContainerRef {
            id,
            name: spec.name.clone(),
            workspace: spec.workspace.clone(),
            guest_workspace: GUEST_WORKSPACE.to_string(),
            created_at: Utc::now(),
        })
    }

    async fn is_running(&self, container: &ContainerRef) -> Result<bool> {
        let args = vec![
            "inspect".to_string(),
            "--format".to_string(),
            "{{.State.Running}}".to_string(),
            container.name.clone(),
        ];
        let output = self.run_cli(&args).await?;
        Ok(output.status.success() && String::from_utf8_lossy(&output.stdout).trim() == "true")
    }

    async fn exec(
        &self,
        container: &ContainerRef,
        invocation: ExecInvocation,
        control: ExecControl,
    ) -> Result<ExecOutcome> {
        let mut child = Command::new(&self.cli)
            .args(Self::exec_args(container, &invocation))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SandboxError::RuntimeError(format!("docker exec failed: {e}")))?;
        let driver = ChildDriver::attach(&mut child, &control)?;

        match ChildDriver::wait(&mut child, &control).await? {
            ChildEnd::Exited(status) => Ok(ExecOutcome::Completed(driver.finish(status).await)),
            end => {
                // Killing the docker client alone leaves the process running in the container.
                self.kill_exec(container, &invocation.id).await;
                if let Err(e) = child.kill().await {
                    warn!("[DOCKER] Failed to reap exec client: {}", e);
                }
                driver.abort();
                Ok(match end {
                    ChildEnd::Cancelled => ExecOutcome::Cancelled,
                    _ => ExecOutcome::TimedOut,
                })
            }
        }
    }

    async fn remove(&self, container: &ContainerRef) -> Result<()> {
        self.remove_by_name(&container.name).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let args = vec![
            "ps".to_string(),
            "-a".to_string(),
            "--filter".to_string(),
            "label=pysandbox.managed=true".to_string(),
            "--format".to_string(),
            "{{.Names}}".to_string(),
        ];
        let output = self.run_cli(&args).await?;
        if !output.status.success() {
            return Err(SandboxError::RuntimeError(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(str::trim)
            .filter(|name| name.starts_with(prefix))
            .map(str::to_string)
            .collect())
    }

    async fn remove_by_name(&self, name: &str) -> Result<()> {
        let args = vec!["rm".to_string(), "-f".to_string(), name.to_string()];
        let output = self.run_cli(&args).await?;
        if output.status.success() {
            info!("[DOCKER] Removed {}", name);
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.contains("No such container") {
            Ok(())
        } else {
            Err(SandboxError::RuntimeError(format!(
                "docker rm {} failed: {}",
                name,
                stderr.trim()
            )))
        }
    }

    async fn stats(&self, container: &ContainerRef) -> Result<Option<ContainerMetrics>> {
        let args = vec![
            "stats".to_string(),
            "--no-stream".to_string(),
            "--format".to_string(),
            "{{json .}}".to_string(),
            container.name.clone(),
        ];
        let output = self.run_cli(&args).await?;
        if !output.status.success() {
            return Err(SandboxError::ResourceQueryError(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        let Some(line) = stdout.lines().find(|l| !l.trim().is_empty()) else {
            return Ok(None);
        };
        parse_stats_line(line).map(Some)
    }
}

#[derive(Debug, Deserialize)]
struct DockerStatsLine {
    #[serde(rename = "CPUPerc", default)]
    cpu_perc: String,
    #[serde(rename = "MemUsage", default)]
    mem_usage: String,
    #[serde(rename = "NetIO", default)]
    net_io: String,
    #[serde(rename = "BlockIO", default)]
    block_io: String,
    #[serde(rename = "PIDs", default)]
    pids: String,
}

/// Parse one `docker stats --format '{{json .}}'` line.
pub fn parse_stats_line(line: &str) -> Result<ContainerMetrics> {
    let raw: DockerStatsLine = serde_json::from_str(line)
        .map_err(|e| SandboxError::ResourceQueryError(format!("unreadable stats: {e}")))?;

    let pair = |s: &str| -> (u64, u64) {
        let mut parts = s.split('/').map(|p| parse_size(p).unwrap_or(0));
        (parts.next().unwrap_or(0), parts.next().unwrap_or(0))
    };
    let (memory_usage, memory_limit) = pair(&raw.mem_usage);
    let (rx, tx) = pair(&raw.net_io);
    let (read, write) = pair(&raw.block_io);

    Ok(ContainerMetrics {
        memory_usage,
        memory_limit,
        cpu_usage: raw.cpu_perc.trim().trim_end_matches('%').parse().unwrap_or(0.0),
        network_io: IoCounters { rx, tx },
        block_io: BlockIoCounters { read, write },
        pids: raw.pids.trim().parse().unwrap_or(0),
    })
}

/// Parse docker's human-readable sizes ("12.5MiB", "1.2kB", "0B").
pub fn parse_size(text: &str) -> Option<u64> {
    let text = text.trim();
    let split = text
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(text.len());
    let (number, unit) = text.split_at(split);
    let value: f64 = number.parse().ok()?;
    let multiplier: f64 = match unit.trim() {
        "" | "B" => 1.0,
        "kB" | "KB" => 1e3,
        "KiB" => 1024.0,
        "MB" => 1e6,
        "MiB" => 1024.0 * 1024.0,
        "GB" => 1e9,
        "GiB" => 1024.0 * 1024.0 * 1024.0,
        "TB" => 1e12,
        "TiB" => 1024.0 * 1024.0 * 1024.0 * 1024.0,
        _ => return None,
    };
    Some((value * multiplier).round() as u64)
}
