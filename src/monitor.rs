use crate::config::{MonitorConfig, SecurityProfile};
use crate::events::{AlertSeverity, ResourceAlert, ResourceKind, SandboxEvent};
use crate::runtime::{ContainerMetrics, ContainerRef, ContainerRuntime};
use crate::session::SessionManager;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use sysinfo::{Disks, System};
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Aggregate jiffies from the first line of `/proc/stat`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuTicks {
    pub busy: u64,
    pub idle: u64,
}

/// Parse the `cpu` summary line of `/proc/stat`.
pub fn parse_proc_stat(text: &str) -> Option<CpuTicks> {
    let line = text.lines().find(|l| l.starts_with("cpu "))?;
    let fields: Vec<u64> = line
        .split_whitespace()
        .skip(1)
        .map(|f| f.parse().ok())
        .collect::<Option<_>>()?;
    if fields.len() < 4 {
        return None;
    }
    // user nice system idle iowait irq softirq steal; guest time is already in user.
    let idle = fields[3] + fields.get(4).copied().unwrap_or(0);
    let busy = fields
        .iter()
        .take(8)
        .enumerate()
        .filter(|(i, _)| *i != 3 && *i != 4)
        .map(|(_, v)| *v)
        .sum();
    Some(CpuTicks { busy, idle })
}

/// Busy share between two samples in percent; 0 without a previous sample.
pub fn cpu_percent(previous: Option<CpuTicks>, current: CpuTicks) -> f64 {
    let Some(previous) = previous else {
        return 0.0;
    };
    let busy = current.busy.saturating_sub(previous.busy) as f64;
    let idle = current.idle.saturating_sub(previous.idle) as f64;
    let total = busy + idle;
    if total <= 0.0 {
        0.0
    } else {
        (busy / total * 100.0).clamp(0.0, 100.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryHealth {
    pub total: u64,
    pub used: u64,
    pub available: u64,
    pub usage_percent: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CpuHealth {
    pub usage_percent: f64,
    pub cores: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiskHealth {
    pub mount_point: String,
    pub total: u64,
    pub available: u64,
    pub usage_percent: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerHealth {
    pub backend: String,
    pub runtime_available: bool,
    pub active_sessions: usize,
    pub running_containers: usize,
}

/// The active security profile as reported by `/health`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SecuritySummary {
    pub profile: SecurityProfile,
    pub description: String,
}

impl From<SecurityProfile> for SecuritySummary {
    fn from(profile: SecurityProfile) -> Self {
        Self {
            profile,
            description: profile.description().to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemHealth {
    pub status: HealthStatus,
    pub memory: MemoryHealth,
    pub cpu: CpuHealth,
    pub disk: DiskHealth,
    pub containers: ContainerHealth,
    /// Filled in by the sandbox; the monitor does not know the policy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub security: Option<SecuritySummary>,
    pub uptime_secs: u64,
    pub timestamp: DateTime<Utc>,
}

fn percent(used: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        used as f64 / total as f64 * 100.0
    }
}

/// Samples host and container usage and raises throttled threshold alerts.
pub struct ResourceMonitor {
    config: MonitorConfig,
    runtime: Arc<dyn ContainerRuntime>,
    sessions: Arc<SessionManager>,
    disk_path: PathBuf,
    system: Mutex<System>,
    last_cpu: Mutex<Option<CpuTicks>>,
    last_alerts: Mutex<HashMap<(ResourceKind, AlertSeverity), Instant>>,
    events: broadcast::Sender<SandboxEvent>,
    started: Instant,
}

impl ResourceMonitor {
    pub fn new(
        config: MonitorConfig,
        runtime: Arc<dyn ContainerRuntime>,
        sessions: Arc<SessionManager>,
        disk_path: PathBuf,
        events: broadcast::Sender<SandboxEvent>,
    ) -> Self {
        Self {
            config,
            runtime,
            sessions,
            disk_path,
            system: Mutex::new(System::new()),
            last_cpu: Mutex::new(None),
            last_alerts: Mutex::new(HashMap::new()),
            events,
            started: Instant::now(),
        }
    }

    async fn sample_cpu(&self) -> f64 {
        match tokio::fs::read_to_string("/proc/stat").await {
            Ok(text) => match parse_proc_stat(&text) {
                Some(current) => {
                    let mut last = self.last_cpu.lock().await;
                    let usage = cpu_percent(*last, current);
                    *last = Some(current);
                    usage
                }
                None => {
                    debug!("[MONITOR] Unrecognised /proc/stat layout");
                    0.0
                }
            },
            Err(e) => {
                debug!("[MONITOR] /proc/stat unavailable: {}", e);
                0.0
            }
        }
    }

    async fn sample_memory(&self) -> (MemoryHealth, usize) {
        let mut system = self.system.lock().await;
        system.refresh_memory();
        let total = system.total_memory();
        let available = system.available_memory();
        let used = total.saturating_sub(available);
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        (
            MemoryHealth {
                total,
                used,
                available,
                usage_percent: percent(used, total),
            },
            cores,
        )
    }

    fn sample_disk(path: &Path) -> DiskHealth {
        let disks = Disks::new_with_refreshed_list();
        // The disk holding the workspaces is the one with the longest matching mount point.
        let best = disks
            .list()
            .iter()
            .filter(|d| path.starts_with(d.mount_point()))
            .max_by_key(|d| d.mount_point().as_os_str().len());
        match best {
            Some(disk) => {
                let total = disk.total_space();
                let available = disk.available_space();
                DiskHealth {
                    mount_point: disk.mount_point().display().to_string(),
                    total,
                    available,
                    usage_percent: percent(total.saturating_sub(available), total),
                }
            }
            None => DiskHealth {
                mount_point: path.display().to_string(),
                total: 0,
                available: 0,
                usage_percent: 0.0,
            },
        }
    }

    /// Sample everything, raise alerts for threshold crossings and classify.
    pub async fn get_system_health(&self) -> SystemHealth {
        let cpu_usage = self.sample_cpu().await;
        let (memory, cores) = self.sample_memory().await;
        let disk = Self::sample_disk(&self.disk_path);
        let runtime_available = self.runtime.is_available().await;
        let containers = ContainerHealth {
            backend: self.runtime.backend_name().to_string(),
            runtime_available,
            active_sessions: self.sessions.session_count(),
            running_containers: self.sessions.live_containers().await.len(),
        };

        let alerts = self
            .raise_alerts(memory.usage_percent, cpu_usage, disk.usage_percent)
            .await;
        let status = if alerts.iter().any(|a| a.severity == AlertSeverity::Critical) {
            HealthStatus::Unhealthy
        } else if !alerts.is_empty() || !runtime_available {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };

        SystemHealth {
            status,
            memory,
            cpu: CpuHealth {
                usage_percent: cpu_usage,
                cores,
            },
            disk,
            containers,
            security: None,
            uptime_secs: self.started.elapsed().as_secs(),
            timestamp: Utc::now(),
        }
    }

    /// Point-in-time usage of one container; `None` when unavailable.
    pub async fn get_container_metrics(&self, container: &ContainerRef) -> Option<ContainerMetrics> {
        match self.runtime.stats(container).await {
            Ok(metrics) => metrics,
            Err(e) => {
                warn!(
                    "[MONITOR] ResourceQueryError for {}: {}",
                    container.name, e
                );
                None
            }
        }
    }

    fn crossing(value: f64, warning: f64, critical: f64) -> Option<(AlertSeverity, f64)> {
        if value >= critical {
            Some((AlertSeverity::Critical, critical))
        } else if value >= warning {
            Some((AlertSeverity::Warning, warning))
        } else {
            None
        }
    }

    /// Every threshold currently crossed. Only those outside their cool-down
    /// are broadcast.
    pub async fn raise_alerts(&self, memory: f64, cpu: f64, disk: f64) -> Vec<ResourceAlert> {
        let checks = [
            (
                ResourceKind::Memory,
                memory,
                self.config.memory_warning,
                self.config.memory_critical,
            ),
            (
                ResourceKind::Cpu,
                cpu,
                self.config.cpu_warning,
                self.config.cpu_critical,
            ),
            (
                ResourceKind::Disk,
                disk,
                self.config.disk_warning,
                self.config.disk_critical,
            ),
        ];
        let cooldown = Duration::from_secs(self.config.alert_cooldown_secs);

        let mut crossed = Vec::new();
        let mut last_alerts = self.last_alerts.lock().await;
        for (resource, value, warning, critical) in checks {
            let Some((severity, threshold)) = Self::crossing(value, warning, critical) else {
                continue;
            };
            let alert = ResourceAlert {
                resource,
                severity,
                value,
                threshold,
                timestamp: Utc::now(),
            };
            let key = (resource, severity);
            let throttled = last_alerts
                .get(&key)
                .map(|at| at.elapsed() < cooldown)
                .unwrap_or(false);
            if !throttled {
                last_alerts.insert(key, Instant::now());
                warn!(
                    "[MONITOR] {:?} {:?}: {:.1}% >= {:.1}%",
                    resource, severity, value, threshold
                );
                let _ = self.events.send(SandboxEvent::ResourceAlert(alert.clone()));
            }
            crossed.push(alert);
        }
        crossed
    }

    /// Sample every `interval_secs` until `cancel` fires.
    pub fn spawn(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let monitor = self.clone();
        let every = Duration::from_secs(self.config.interval_secs.max(1));
        tokio::spawn(async move {
            info!("[MONITOR] Sampling every {:?}", every);
            let mut ticker = tokio::time::interval(every);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let health = monitor.get_system_health().await;
                        debug!(
                            "[MONITOR] {:?} mem={:.1}% cpu={:.1}% disk={:.1}%",
                            health.status,
                            health.memory.usage_percent,
                            health.cpu.usage_percent,
                            health.disk.usage_percent
                        );
                    }
                }
            }
            debug!("[MONITOR] Sampling stopped");
        })
    }
}
