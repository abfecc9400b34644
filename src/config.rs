use crate::errors::{Result, SandboxError};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Which container backend backs sessions
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeBackend {
    /// One Docker container per session, driven through the docker CLI
    #[default]
    Docker,
    /// Resource-limited host processes in a per-session directory.
    /// No kernel isolation; meant for development and tests.
    Local,
}

impl RuntimeBackend {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "docker" => Some(Self::Docker),
            "local" => Some(Self::Local),
            _ => None,
        }
    }
}

/// Security profile for Python sandbox execution
/// Determines the level of restrictions applied to code execution
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum SecurityProfile {
    /// Blacklist mode - blocks known dangerous modules (os, subprocess, socket, etc.)
    /// Allows most imports, good balance of functionality and safety
    #[default]
    Blacklist,

    /// Whitelist mode - only allows specific data science modules
    DataScience,

    /// Strict mode - whitelist + tight resource limits
    Strict,
}

impl SecurityProfile {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "blacklist" | "balanced" => Some(Self::Blacklist),
            "data_science" => Some(Self::DataScience),
            "strict" => Some(Self::Strict),
            _ => None,
        }
    }

    /// Convert profile to import policy
    pub fn to_import_policy(&self) -> ImportPolicy {
        match self {
            SecurityProfile::Blacklist => ImportPolicy::default(),
            SecurityProfile::DataScience | SecurityProfile::Strict => {
                ImportPolicy::data_science_whitelist()
            }
        }
    }

    /// Get resource limits for this profile
    pub fn resource_limits(&self) -> ResourceLimits {
        match self {
            SecurityProfile::Blacklist | SecurityProfile::DataScience => ResourceLimits::default(),
            SecurityProfile::Strict => ResourceLimits {
                memory_mb: 256,
                cpus: 0.5,
                pids: 16,
                cpu_seconds: 10,
                max_threads: 1,
                ..ResourceLimits::default()
            },
        }
    }

    /// One-line summary shown in `/health` and the startup log
    pub fn description(&self) -> &'static str {
        match self {
            SecurityProfile::Blacklist => {
                "Refuses high-risk modules (os, subprocess, socket) and warns on medium-risk ones"
            }
            SecurityProfile::DataScience => {
                "Only data-science modules (numpy, pandas, matplotlib) may be imported"
            }
            SecurityProfile::Strict => {
                "Data-science whitelist with a reduced ceiling of 256 MB and 16 processes"
            }
        }
    }
}

/// Resource ceiling applied to every session container
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ResourceLimits {
    /// Maximum memory in MB
    pub memory_mb: u64,
    /// CPU share in cores (docker `--cpus`)
    pub cpus: f64,
    /// Maximum number of processes inside the container
    pub pids: u64,
    /// Maximum CPU time in seconds per execution (RLIMIT_CPU on the local backend)
    pub cpu_seconds: u64,
    /// Maximum number of threads for scientific libraries
    pub max_threads: u32,
    /// Size of the writable /tmp tmpfs in MB
    pub tmpfs_mb: u64,
    /// Whether the container gets a network interface
    pub allow_networking: bool,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            memory_mb: 512,
            cpus: 1.0,
            pids: 64,
            cpu_seconds: 30,
            max_threads: 4,
            tmpfs_mb: 64,
            allow_networking: false,
        }
    }
}

impl ResourceLimits {
    /// Apply per-session overrides, never exceeding this ceiling for memory and CPU.
    pub fn with_overrides(
        &self,
        max_memory_mb: Option<u64>,
        max_cpu: Option<f64>,
        allow_networking: Option<bool>,
    ) -> Self {
        let mut limits = self.clone();
        if let Some(memory) = max_memory_mb {
            limits.memory_mb = memory.clamp(32, self.memory_mb);
        }
        if let Some(cpu) = max_cpu {
            if cpu.is_finite() && cpu > 0.0 {
                limits.cpus = cpu.min(self.cpus);
            }
        }
        if let Some(network) = allow_networking {
            limits.allow_networking = network;
        }
        limits
    }
}

/// Import control policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ImportPolicy {
    /// Block specific modules
    Blacklist(HashSet<String>),
    /// Only allow specific modules
    Whitelist(HashSet<String>),
    /// Both whitelist and blacklist
    Both {
        whitelist: HashSet<String>,
        blacklist: HashSet<String>,
    },
}

impl Default for ImportPolicy {
    fn default() -> Self {
        let blacklist = [
            "subprocess",
            "multiprocessing",
            "os",
            "socket",
            "urllib",
            "requests",
            "ctypes",
            "pty",
            "fcntl",
            "resource",
            "shutil",
            "tempfile",
            "commands",
            "popen2",
            "cgi",
            "cgitb",
            "webbrowser",
            "antigravity",
            "importlib",
            "pickle",
            "marshal",
            "shelve",
            "http",
            "ftplib",
            "smtplib",
            "telnetlib",
            "mmap",
            "signal",
            "sys",
        ];
        ImportPolicy::Blacklist(blacklist.iter().map(|s| s.to_string()).collect())
    }
}

impl ImportPolicy {
    /// Check if an import is allowed
    pub fn is_allowed(&self, module: &str) -> bool {
        let root_module = module.split('.').next().unwrap_or(module);

        match self {
            ImportPolicy::Blacklist(blacklist) => !blacklist.contains(root_module),
            ImportPolicy::Whitelist(whitelist) => whitelist.contains(root_module),
            ImportPolicy::Both {
                whitelist,
                blacklist,
            } => whitelist.contains(root_module) && !blacklist.contains(root_module),
        }
    }

    /// Add modules that must be refused regardless of the base policy.
    pub fn with_blocked<I, S>(self, modules: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let extra: HashSet<String> = modules.into_iter().map(Into::into).collect();
        if extra.is_empty() {
            return self;
        }
        match self {
            ImportPolicy::Blacklist(mut blacklist) => {
                blacklist.extend(extra);
                ImportPolicy::Blacklist(blacklist)
            }
            ImportPolicy::Whitelist(whitelist) => ImportPolicy::Both {
                whitelist,
                blacklist: extra,
            },
            ImportPolicy::Both {
                whitelist,
                mut blacklist,
            } => {
                blacklist.extend(extra);
                ImportPolicy::Both {
                    whitelist,
                    blacklist,
                }
            }
        }
    }

    /// Whitelist of analysis modules user code may import directly
    pub fn data_science_whitelist() -> Self {
        let whitelist = [
            // Core data science libraries
            "numpy",
            "pandas",
            "matplotlib",
            "scipy",
            "sklearn",
            "seaborn",
            "statsmodels",
            "plotly",
            "sympy",
            "networkx",
            // Document processing
            "PIL",
            "openpyxl",
            "xml",
            "csv",
            // Standard library
            "json",
            "math",
            "cmath",
            "statistics",
            "random",
            "datetime",
            "calendar",
            "collections",
            "itertools",
            "functools",
            "operator",
            "io",
            "base64",
            "time",
            "re",
            "string",
            "textwrap",
            "unicodedata",
            "copy",
            "dataclasses",
            "decimal",
            "fractions",
            "enum",
            "typing",
            "uuid",
            "hashlib",
            "heapq",
            "bisect",
            "array",
            "zlib",
            "warnings",
            "contextlib",
            "abc",
            "numbers",
            "pprint",
            "traceback",
        ];
        ImportPolicy::Whitelist(whitelist.iter().map(|s| s.to_string()).collect())
    }

    /// Modules named by this policy, sorted for stable script generation.
    pub fn listed_modules(&self) -> (Vec<String>, Vec<String>) {
        let sorted = |set: &HashSet<String>| {
            let mut v: Vec<String> = set.iter().cloned().collect();
            v.sort();
            v
        };
        match self {
            ImportPolicy::Blacklist(blacklist) => (Vec::new(), sorted(blacklist)),
            ImportPolicy::Whitelist(whitelist) => (sorted(whitelist), Vec::new()),
            ImportPolicy::Both {
                whitelist,
                blacklist,
            } => (sorted(whitelist), sorted(blacklist)),
        }
    }
}

/// Execution admission and output settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Global cap on in-flight executions
    pub max_concurrent: usize,
    pub default_timeout_secs: u64,
    /// Requests asking for more are clamped to this
    pub max_timeout_secs: u64,
    /// stdout/stderr beyond this are truncated by the runner
    pub max_output_bytes: usize,
    /// When set, only these packages may be installed
    pub allowed_packages: Option<Vec<String>>,
    /// Capacity of the streaming event channel
    pub stream_buffer: usize,
    /// Plots saved per execution
    pub max_plots: usize,
    /// PNG bytes above which a plot is saved but not returned inline
    pub max_plot_bytes: usize,
    /// Encoded size above which one variable is not carried over
    pub max_variable_bytes: usize,
    /// Encoded size of all carried variables and data objects together
    pub max_variables_total_bytes: usize,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 10,
            default_timeout_secs: 30,
            max_timeout_secs: 300,
            max_output_bytes: 10 * 1024 * 1024,
            allowed_packages: None,
            stream_buffer: 64,
            max_plots: 20,
            max_plot_bytes: 2 * 1024 * 1024,
            max_variable_bytes: 1024 * 1024,
            max_variables_total_bytes: 8 * 1024 * 1024,
        }
    }
}

impl ExecutionConfig {
    /// Resolve the wall-clock timeout for a request.
    pub fn timeout_for(&self, requested_secs: Option<u64>) -> Duration {
        let secs = requested_secs
            .filter(|s| *s > 0)
            .unwrap_or(self.default_timeout_secs)
            .min(self.max_timeout_secs);
        Duration::from_secs(secs)
    }

    /// Longest runner output line the engine accepts. A result frame built
    /// within the limits above always fits: captured streams may grow up to
    /// 6x when JSON-escaped and inline plots by 4/3 when base64-encoded.
    pub fn frame_limit(&self) -> usize {
        let streams = self.max_output_bytes.saturating_mul(12);
        let plots = self.max_plots.saturating_mul(self.max_plot_bytes).saturating_mul(4) / 3;
        streams
            .saturating_add(plots)
            .saturating_add(self.max_variables_total_bytes.saturating_mul(2))
            .saturating_add(1024 * 1024)
    }
}

/// Session and container lifecycle settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    pub backend: RuntimeBackend,
    /// Container image; must provide python3 and pip
    pub image: String,
    /// Every managed container and workspace name starts with this
    pub container_prefix: String,
    /// Host directory holding per-session workspaces
    pub workspace_base: PathBuf,
    /// Interpreter used by the local backend (PATH lookup when unset)
    pub python_path: Option<PathBuf>,
    /// `--user` for docker containers
    pub container_user: Option<String>,
    pub idle_timeout_secs: u64,
    pub sweep_interval_secs: u64,
    pub orphan_sweep_interval_secs: u64,
    /// Attempts after the first failed provisioning
    pub provision_retries: u32,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            backend: RuntimeBackend::Docker,
            image: "python:3.11-slim".to_string(),
            container_prefix: "pysandbox-session".to_string(),
            workspace_base: std::env::temp_dir().join("pysandbox-workspaces"),
            python_path: None,
            container_user: None,
            idle_timeout_secs: 30 * 60,
            sweep_interval_secs: 5 * 60,
            orphan_sweep_interval_secs: 10 * 60,
            provision_retries: 1,
        }
    }
}

impl LifecycleConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

/// Quotas for the per-session virtual file system
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct VfsLimits {
    pub max_file_size: u64,
    pub max_total_size: u64,
    pub max_files: usize,
}

impl Default for VfsLimits {
    fn default() -> Self {
        Self {
            max_file_size: 10 * 1024 * 1024,
            max_total_size: 100 * 1024 * 1024,
            max_files: 1000,
        }
    }
}

/// Host health sampling and alert thresholds (percentages)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub interval_secs: u64,
    pub alert_cooldown_secs: u64,
    pub memory_warning: f64,
    pub memory_critical: f64,
    pub cpu_warning: f64,
    pub cpu_critical: f64,
    pub disk_warning: f64,
    pub disk_critical: f64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            alert_cooldown_secs: 5 * 60,
            memory_warning: 80.0,
            memory_critical: 95.0,
            cpu_warning: 80.0,
            cpu_critical: 95.0,
            disk_warning: 85.0,
            disk_critical: 95.0,
        }
    }
}

/// Top-level service configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    pub security_profile: SecurityProfile,
    /// Merged into the high-risk module tier
    pub always_blocked_modules: Vec<String>,
    pub execution: ExecutionConfig,
    pub lifecycle: LifecycleConfig,
    pub limits: ResourceLimits,
    pub vfs: VfsLimits,
    pub monitor: MonitorConfig,
}

impl SandboxConfig {
    /// Load a JSON config file; missing fields take their defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        serde_json::from_str(&raw).map_err(|e| {
            SandboxError::InvalidRequest(format!("invalid config {}: {}", path.display(), e))
        })
    }

    /// Import policy of the selected profile with operator additions.
    pub fn import_policy(&self) -> ImportPolicy {
        self.security_profile
            .to_import_policy()
            .with_blocked(self.always_blocked_modules.iter().cloned())
    }
}
