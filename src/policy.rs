//! Sandbox Policy Tables
//!
//! Rule tables consulted by the security validator and the package manager:
//!
//! 1. **Module tiers** - modules whose import is refused (HIGH) or flagged (MEDIUM)
//! 2. **Call patterns** - dangerous call shapes matched against literal-masked source
//! 3. **Package tier** - distributions that may never be installed into a session
//!
//! A policy starts from a template (`balanced`, `data_science`, `strict`) and is
//! then adjusted with the builder-style methods, e.g. operator-supplied modules
//! that must always be blocked.

use crate::config::{ImportPolicy, SandboxConfig, SecurityProfile};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::collections::HashSet;
use tracing::warn;

/// Severity of a single finding
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
}

/// Aggregate risk of a submission
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Default)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    #[default]
    None,
    Low,
    Medium,
    High,
}

impl From<Severity> for RiskLevel {
    fn from(severity: Severity) -> Self {
        match severity {
            Severity::Low => RiskLevel::Low,
            Severity::Medium => RiskLevel::Medium,
            Severity::High => RiskLevel::High,
        }
    }
}

/// A dangerous call shape
#[derive(Debug, Clone)]
pub struct CallPattern {
    pub name: &'static str,
    pub description: &'static str,
    pub severity: Severity,
    pub regex: Regex,
}

// Callables matched only when not reached through an attribute, so that
// `re.compile(` or `Image.open(` do not trip the builtin rules.
const BARE: &str = r"(?:^|[^.\w])";

fn call_pattern_sources() -> Vec<(&'static str, &'static str, Severity, String)> {
    vec![
        (
            "eval",
            "dynamic evaluation via eval()",
            Severity::High,
            format!(r"{BARE}eval\s*\("),
        ),
        (
            "exec",
            "dynamic execution via exec()",
            Severity::High,
            format!(r"{BARE}exec\s*\("),
        ),
        (
            "compile",
            "runtime code compilation via compile()",
            Severity::High,
            format!(r"{BARE}compile\s*\("),
        ),
        (
            "__import__",
            "dynamic import via __import__()",
            Severity::High,
            r"__import__\s*\(".to_string(),
        ),
        (
            "os_process",
            "process spawning through os",
            Severity::High,
            r"\bos\s*\.\s*(?:system|popen|exec\w*|spawn\w*|fork\w*|kill\w*)\b".to_string(),
        ),
        (
            "subprocess",
            "process spawning through subprocess",
            Severity::High,
            r"\bsubprocess\s*\.".to_string(),
        ),
        (
            "socket",
            "raw socket access",
            Severity::High,
            r"\bsocket\s*\.\s*(?:socket|create_connection|create_server|fromfd)\b".to_string(),
        ),
        (
            "ctypes",
            "low-level memory access through ctypes",
            Severity::High,
            r"\bctypes\s*\.".to_string(),
        ),
        (
            "dunder_escape",
            "interpreter internals reachable through dunder attributes",
            Severity::High,
            r"__(?:subclasses|globals|builtins|code|bases|mro|getattribute|closure|loader)__"
                .to_string(),
        ),
        (
            "file_removal",
            "host file system mutation",
            Severity::High,
            r"\b(?:os|shutil)\s*\.\s*(?:remove|unlink|rmdir|removedirs|rmtree|chmod|chown)\b"
                .to_string(),
        ),
        (
            "open",
            "direct file access via open()",
            Severity::Medium,
            format!(r"{BARE}open\s*\("),
        ),
        (
            "namespace_introspection",
            "namespace introspection via globals()/locals()/vars()",
            Severity::Medium,
            format!(r"{BARE}(?:globals|locals|vars)\s*\("),
        ),
        (
            "dynamic_attribute",
            "dynamic attribute access",
            Severity::Medium,
            format!(r"{BARE}(?:getattr|setattr|delattr)\s*\("),
        ),
        (
            "input",
            "blocking read from stdin",
            Severity::Medium,
            format!(r"{BARE}input\s*\("),
        ),
        (
            "breakpoint",
            "debugger entry",
            Severity::Medium,
            format!(r"{BARE}breakpoint\s*\("),
        ),
        (
            "sleep",
            "blocking sleep",
            Severity::Low,
            r"\btime\s*\.\s*sleep\s*\(".to_string(),
        ),
    ]
}

fn compile_call_patterns() -> Vec<CallPattern> {
    call_pattern_sources()
        .into_iter()
        .filter_map(|(name, description, severity, source)| match Regex::new(&source) {
            Ok(regex) => Some(CallPattern {
                name,
                description,
                severity,
                regex,
            }),
            Err(e) => {
                warn!("[POLICY] Skipping call pattern {}: {}", name, e);
                None
            }
        })
        .collect()
}

const HIGH_RISK_MODULES: &[(&str, &str)] = &[
    ("os", "operating system access"),
    ("posix", "operating system access"),
    ("nt", "operating system access"),
    ("sys", "interpreter internals"),
    ("builtins", "builtin namespace override"),
    ("subprocess", "process spawning"),
    ("multiprocessing", "process spawning"),
    ("pty", "pseudo-terminal spawning"),
    ("signal", "signal handling"),
    ("socket", "raw network access"),
    ("ssl", "raw network access"),
    ("urllib", "network access"),
    ("http", "network access"),
    ("ftplib", "network access"),
    ("smtplib", "network access"),
    ("telnetlib", "network access"),
    ("poplib", "network access"),
    ("imaplib", "network access"),
    ("requests", "network access"),
    ("httpx", "network access"),
    ("aiohttp", "network access"),
    ("paramiko", "remote shell access"),
    ("webbrowser", "host browser control"),
    ("ctypes", "low-level memory access"),
    ("cffi", "low-level memory access"),
    ("mmap", "low-level memory access"),
    ("fcntl", "file descriptor control"),
    ("resource", "resource limit manipulation"),
    ("shutil", "file system manipulation"),
    ("importlib", "dynamic imports"),
    ("pickle", "arbitrary code execution during deserialization"),
    ("marshal", "arbitrary code execution during deserialization"),
    ("shelve", "arbitrary code execution during deserialization"),
    ("dill", "arbitrary code execution during deserialization"),
    ("code", "embedded interactive interpreter"),
    ("codeop", "embedded interactive interpreter"),
];

const MEDIUM_RISK_MODULES: &[(&str, &str)] = &[
    ("pathlib", "file system access"),
    ("glob", "file system enumeration"),
    ("tempfile", "file system access"),
    ("io", "raw stream access"),
    ("threading", "thread spawning"),
    ("asyncio", "event loop control"),
    ("gc", "garbage collector introspection"),
    ("inspect", "frame introspection"),
    ("ast", "code manipulation"),
    ("dis", "bytecode introspection"),
];

const BLOCKED_PACKAGES: &[&str] = &[
    "requests",
    "httpx",
    "aiohttp",
    "urllib3",
    "paramiko",
    "pexpect",
    "ptyprocess",
    "psutil",
    "pwntools",
    "scapy",
    "docker",
    "fabric",
    "sh",
    "plumbum",
    "pyautogui",
    "pynput",
    "keyboard",
    "dill",
    "cffi",
    "pycryptodome",
];

/// Validator and package rule set
#[derive(Debug, Clone)]
pub struct SecurityPolicy {
    pub name: String,
    pub import_policy: ImportPolicy,
    high_modules: HashMap<String, String>,
    medium_modules: HashMap<String, String>,
    blocked_packages: HashSet<String>,
    call_patterns: Vec<CallPattern>,
}

impl SecurityPolicy {
    fn template(name: &str, import_policy: ImportPolicy) -> Self {
        let to_map = |rules: &[(&str, &str)]| {
            rules
                .iter()
                .map(|(m, r)| (m.to_string(), r.to_string()))
                .collect::<HashMap<_, _>>()
        };
        Self {
            name: name.to_string(),
            import_policy,
            high_modules: to_map(HIGH_RISK_MODULES),
            medium_modules: to_map(MEDIUM_RISK_MODULES),
            blocked_packages: BLOCKED_PACKAGES.iter().map(|p| p.to_string()).collect(),
            call_patterns: compile_call_patterns(),
        }
    }

    /// Blacklist profile: the module tiers plus the default import blacklist
    pub fn balanced() -> Self {
        Self::template("balanced", SecurityProfile::Blacklist.to_import_policy())
    }

    /// Imports restricted to the data-science whitelist
    pub fn data_science() -> Self {
        Self::template("data_science", SecurityProfile::DataScience.to_import_policy())
    }

    /// Whitelist imports; medium-risk modules are refused outright
    pub fn strict() -> Self {
        let mut policy = Self::template("strict", SecurityProfile::Strict.to_import_policy());
        let medium = std::mem::take(&mut policy.medium_modules);
        policy.high_modules.extend(medium);
        policy
    }

    pub fn for_profile(profile: SecurityProfile) -> Self {
        match profile {
            SecurityProfile::Blacklist => Self::balanced(),
            SecurityProfile::DataScience => Self::data_science(),
            SecurityProfile::Strict => Self::strict(),
        }
    }

    /// Policy described by a service configuration
    pub fn from_config(config: &SandboxConfig) -> Self {
        let mut policy = Self::for_profile(config.security_profile);
        for module in &config.always_blocked_modules {
            policy = policy.block_module(module, "blocked by operator policy");
        }
        policy
    }

    /// Refuse a module outright.
    pub fn block_module(mut self, module: &str, reason: &str) -> Self {
        self.medium_modules.remove(module);
        self.high_modules
            .insert(module.to_string(), reason.to_string());
        self.import_policy = self.import_policy.with_blocked([module]);
        self
    }

    /// Flag a module as a warning without refusing it.
    pub fn warn_module(mut self, module: &str, reason: &str) -> Self {
        if !self.high_modules.contains_key(module) {
            self.medium_modules
                .insert(module.to_string(), reason.to_string());
        }
        self
    }

    pub fn block_package(mut self, package: &str) -> Self {
        self.blocked_packages.insert(normalize_package(package));
        self
    }

    /// Classify an imported module by its root name.
    pub fn classify_module(&self, module: &str) -> Option<(Severity, String)> {
        let root = module.split('.').next().unwrap_or(module);
        if let Some(reason) = self.high_modules.get(root) {
            return Some((Severity::High, reason.clone()));
        }
        if !self.import_policy.is_allowed(module) {
            return Some((
                Severity::High,
                format!("not permitted by the {} import policy", self.name),
            ));
        }
        self.medium_modules
            .get(root)
            .map(|reason| (Severity::Medium, reason.clone()))
    }

    pub fn call_patterns(&self) -> &[CallPattern] {
        &self.call_patterns
    }

    /// Whether a distribution name may never be installed.
    pub fn is_package_blocked(&self, package: &str) -> bool {
        let normalized = normalize_package(package);
        if self.blocked_packages.contains(&normalized) {
            return true;
        }
        let as_module = normalized.replace('-', "_");
        self.high_modules.contains_key(&as_module)
    }

    /// Root modules the runner's import guard must refuse at runtime.
    pub fn runtime_blocked_modules(&self) -> Vec<String> {
        let mut modules: Vec<String> = self.high_modules.keys().cloned().collect();
        modules.sort();
        modules
    }
}

impl Default for SecurityPolicy {
    fn default() -> Self {
        Self::balanced()
    }
}

/// Lowercase a distribution name and strip any version specifier.
pub fn normalize_package(package: &str) -> String {
    let end = package
        .find(|c: char| matches!(c, '=' | '<' | '>' | '!' | '~' | '[' | ';' | ' '))
        .unwrap_or(package.len());
    package[..end].trim().to_ascii_lowercase().replace('_', "-")
}
