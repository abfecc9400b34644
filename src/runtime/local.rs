use super::{
    ChildDriver, ChildEnd, ContainerMetrics, ContainerRef, ContainerRuntime, ContainerSpec,
    ExecControl, ExecInvocation, ExecOutcome,
};
use crate::config::ResourceLimits;
use crate::errors::{Result, SandboxError};
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::Command;
use tracing::{info, warn};

/// Runs each session as rlimit-capped host processes inside its workspace
/// directory. There is no kernel namespace isolation here; the import guard,
/// static screening and rlimits are the only barriers.
pub struct LocalProcessRuntime {
    python_path: PathBuf,
    containers: DashMap<String, ResourceLimits>,
}

impl LocalProcessRuntime {
    /// Create a runtime using python3 from PATH
    pub fn new() -> Result<Self> {
        let python_path = which::which("python3")
            .or_else(|_| which::which("python"))
            .map_err(|_| {
                SandboxError::ProvisioningError("Python not installed or not found in PATH".into())
            })?;
        Ok(Self::with_python_path(python_path))
    }

    /// Create with an explicit interpreter (for bundled Python)
    pub fn with_python_path(python_path: PathBuf) -> Self {
        Self {
            python_path,
            containers: DashMap::new(),
        }
    }

    pub fn python_path(&self) -> &PathBuf {
        &self.python_path
    }

    /// Apply resource limits to the command
    #[cfg(unix)]
    fn apply_resource_limits(cmd: &mut Command, limits: &ResourceLimits) {
        let cpu_seconds = limits.cpu_seconds;
        #[cfg(not(target_os = "macos"))]
        let memory_bytes = limits.memory_mb * 1024 * 1024;
        #[cfg(not(target_os = "macos"))]
        let max_processes = limits.pids;

        unsafe {
            cmd.pre_exec(move || {
                // Own process group so a timeout can take down every descendant
                libc::setpgid(0, 0);

                // macOS does not honour RLIMIT_AS
                #[cfg(not(target_os = "macos"))]
                {
                    let rlimit = libc::rlimit {
                        rlim_cur: memory_bytes as libc::rlim_t,
                        rlim_max: memory_bytes as libc::rlim_t,
                    };
                    if libc::setrlimit(libc::RLIMIT_AS, &rlimit) != 0 {
                        return Err(std::io::Error::last_os_error());
                    }
                }

                let rlimit = libc::rlimit {
                    rlim_cur: cpu_seconds as libc::rlim_t,
                    rlim_max: cpu_seconds as libc::rlim_t,
                };
                if libc::setrlimit(libc::RLIMIT_CPU, &rlimit) != 0 {
                    return Err(std::io::Error::last_os_error());
                }

                #[cfg(not(target_os = "macos"))]
                {
                    let rlimit = libc::rlimit {
                        rlim_cur: max_processes as libc::rlim_t,
                        rlim_max: max_processes as libc::rlim_t,
                    };
                    if libc::setrlimit(libc::RLIMIT_NPROC, &rlimit) != 0 {
                        return Err(std::io::Error::last_os_error());
                    }
                }

                Ok(())
            });
        }
    }

    #[cfg(not(unix))]
    fn apply_resource_limits(_cmd: &mut Command, _limits: &ResourceLimits) {}

    #[cfg(unix)]
    fn kill_group(pid: Option<u32>) {
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;

        if let Some(pid) = pid {
            if let Err(e) = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
                warn!("[LOCAL] Failed to kill process group {}: {}", pid, e);
            }
        }
    }

    #[cfg(not(unix))]
    fn kill_group(_pid: Option<u32>) {}
}

#[async_trait]
impl ContainerRuntime for LocalProcessRuntime {
    fn backend_name(&self) -> &'static str {
        "local"
    }

    fn interpreter(&self) -> String {
        self.python_path.display().to_string()
    }

    async fn is_available(&self) -> bool {
        self.python_path.exists()
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<ContainerRef> {
        if !self.python_path.exists() {
            return Err(SandboxError::ProvisioningError(format!(
                "interpreter not found: {}",
                self.python_path.display()
            )));
        }
        std::fs::create_dir_all(&spec.workspace)
            .map_err(|e| SandboxError::ProvisioningError(e.to_string()))?;
        if spec.limits.allow_networking {
            info!("[LOCAL] {} requested networking; local sessions are never network-isolated", spec.name);
        }

        self.containers
            .insert(spec.name.clone(), spec.limits.clone());
        info!("[LOCAL] Provisioned {} at {:?}", spec.name, spec.workspace);

        Ok(ContainerRef {
            id: spec.name.clone(),
            name: spec.name.clone(),
            workspace: spec.workspace.clone(),
            guest_workspace: spec.workspace.display().to_string(),
            created_at: Utc::now(),
        })
    }

    async fn is_running(&self, container: &ContainerRef) -> Result<bool> {
        Ok(self.containers.contains_key(&container.name) && container.workspace.is_dir())
    }

    async fn exec(
        &self,
        container: &ContainerRef,
        invocation: ExecInvocation,
        control: ExecControl,
    ) -> Result<ExecOutcome> {
        let limits = self
            .containers
            .get(&container.name)
            .map(|l| l.clone())
            .ok_or_else(|| SandboxError::RuntimeError(format!("{} is not running", container.name)))?;

        let Some((program, args)) = invocation.argv.split_first() else {
            return Err(SandboxError::InvalidRequest("empty command".to_string()));
        };

        let mut cmd = Command::new(program);
        cmd.args(args)
            .current_dir(&invocation.workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .env("PYTHONIOENCODING", "utf-8")
            .env("HOME", &container.workspace)
            .env("MPLCONFIGDIR", container.workspace.join(".sandbox").join("mpl"))
            .env("OMP_NUM_THREADS", limits.max_threads.to_string())
            .env("OPENBLAS_NUM_THREADS", limits.max_threads.to_string())
            .env("MKL_NUM_THREADS", limits.max_threads.to_string());
        for (key, value) in &invocation.env {
            cmd.env(key, value);
        }

        Self::apply_resource_limits(&mut cmd, &limits);

        let mut child = cmd.spawn()?;
        let pid = child.id();
        let driver = ChildDriver::attach(&mut child, &control)?;

        match ChildDriver::wait(&mut child, &control).await? {
            ChildEnd::Exited(status) => Ok(ExecOutcome::Completed(driver.finish(status).await)),
            end => {
                Self::kill_group(pid);
                if let Err(e) = child.kill().await {
                    warn!("[LOCAL] Failed to reap {}: {}", invocation.id, e);
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
        self.containers.remove(&container.name);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .containers
            .iter()
            .filter(|entry| entry.key().starts_with(prefix))
            .map(|entry| entry.key().clone())
            .collect())
    }

    async fn remove_by_name(&self, name: &str) -> Result<()> {
        self.containers.remove(name);
        Ok(())
    }

    async fn stats(&self, _container: &ContainerRef) -> Result<Option<ContainerMetrics>> {
        // Nothing runs between executions, so there is nothing to sample.
        Ok(None)
    }
}
