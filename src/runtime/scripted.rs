//! In-process `ContainerRuntime` double for tests. Exec calls are answered
//! by a handler closure instead of a real interpreter; the default handler
//! understands just enough of the runner protocol to drive the engine.

use super::{
    ContainerMetrics, ContainerRef, ContainerRuntime, ContainerSpec, ExecControl, ExecInvocation,
    ExecOutcome, ExecOutput,
};
use crate::errors::{Result, SandboxError};
use crate::runner::{self, RunnerError, RunnerOutput};
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use serde_json::{Map, Value};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub enum ScriptedReply {
    Output(ExecOutput),
    /// Never finishes on its own
    Hang,
    Fail(String),
}

type Handler = dyn Fn(&ExecInvocation, &Path) -> ScriptedReply + Send + Sync;

pub struct ScriptedRuntime {
    handler: Arc<Handler>,
    delay: Option<Duration>,
    management_delay: Option<Duration>,
    failing_creates: AtomicUsize,
    running: DashMap<String, ContainerRef>,
    stats: Option<ContainerMetrics>,
    pub created: Mutex<Vec<String>>,
    pub removed: Mutex<Vec<String>>,
    pub execs: AtomicUsize,
}

impl ScriptedRuntime {
    pub fn new() -> Self {
        Self::with_handler(mini_python)
    }

    pub fn with_handler<F>(handler: F) -> Self
    where
        F: Fn(&ExecInvocation, &Path) -> ScriptedReply + Send + Sync + 'static,
    {
        Self {
            handler: Arc::new(handler),
            delay: None,
            management_delay: None,
            failing_creates: AtomicUsize::new(0),
            running: DashMap::new(),
            stats: None,
            created: Mutex::new(Vec::new()),
            removed: Mutex::new(Vec::new()),
            execs: AtomicUsize::new(0),
        }
    }

    /// Every exec takes at least this long
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// `list` and `remove` calls take at least this long
    pub fn with_management_delay(mut self, delay: Duration) -> Self {
        self.management_delay = Some(delay);
        self
    }

    async fn management_pause(&self) {
        if let Some(delay) = self.management_delay {
            tokio::time::sleep(delay).await;
        }
    }

    /// The next `count` creates fail
    pub fn failing_creates(self, count: usize) -> Self {
        self.failing_creates.store(count, Ordering::SeqCst);
        self
    }

    pub fn with_stats(mut self, stats: ContainerMetrics) -> Self {
        self.stats = Some(stats);
        self
    }

    /// Pretend the container died behind our back
    pub fn kill(&self, name: &str) {
        self.running.remove(name);
    }

    /// Register a container the manager does not know about
    pub fn adopt(&self, name: &str, workspace: &Path) {
        self.running.insert(
            name.to_string(),
            ContainerRef {
                id: name.to_string(),
                name: name.to_string(),
                workspace: workspace.to_path_buf(),
                guest_workspace: workspace.display().to_string(),
                created_at: Utc::now(),
            },
        );
    }

    pub fn created_count(&self) -> usize {
        self.created.lock().map(|c| c.len()).unwrap_or(0)
    }

    pub fn removed_names(&self) -> Vec<String> {
        self.removed.lock().map(|r| r.clone()).unwrap_or_default()
    }

    pub fn running_count(&self) -> usize {
        self.running.len()
    }
}

#[async_trait]
impl ContainerRuntime for ScriptedRuntime {
    fn backend_name(&self) -> &'static str {
        "scripted"
    }

    fn interpreter(&self) -> String {
        "python3".to_string()
    }

    async fn is_available(&self) -> bool {
        true
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<ContainerRef> {
        let remaining = self.failing_creates.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failing_creates.store(remaining - 1, Ordering::SeqCst);
            return Err(SandboxError::ProvisioningError("scripted create failure".into()));
        }
        std::fs::create_dir_all(&spec.workspace)?;
        self.adopt(&spec.name, &spec.workspace);
        if let Ok(mut created) = self.created.lock() {
            created.push(spec.name.clone());
        }
        self.running
            .get(&spec.name)
            .map(|c| c.clone())
            .ok_or_else(|| SandboxError::InternalError("container vanished".into()))
    }

    async fn is_running(&self, container: &ContainerRef) -> Result<bool> {
        Ok(self.running.contains_key(&container.name))
    }

    async fn exec(
        &self,
        container: &ContainerRef,
        invocation: ExecInvocation,
        control: ExecControl,
    ) -> Result<ExecOutcome> {
        if !self.running.contains_key(&container.name) {
            return Err(SandboxError::RuntimeError(format!(
                "{} is not running",
                container.name
            )));
        }
        self.execs.fetch_add(1, Ordering::SeqCst);

        let reply = (self.handler)(&invocation, &container.workspace);
        let wait = match &reply {
            ScriptedReply::Hang => Duration::from_secs(3600),
            _ => self.delay.unwrap_or_default(),
        };
        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            _ = tokio::time::sleep(control.timeout) => return Ok(ExecOutcome::TimedOut),
            _ = control.cancel.cancelled() => return Ok(ExecOutcome::Cancelled),
        }

        match reply {
            ScriptedReply::Output(output) => {
                if let Some(lines) = &control.stdout_lines {
                    for line in output.stdout.lines() {
                        let _ = lines.send(line.to_string()).await;
                    }
                }
                Ok(ExecOutcome::Completed(output))
            }
            ScriptedReply::Hang => Ok(ExecOutcome::TimedOut),
            ScriptedReply::Fail(reason) => Err(SandboxError::RuntimeError(reason)),
        }
    }

    async fn remove(&self, container: &ContainerRef) -> Result<()> {
        self.remove_by_name(&container.name).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        self.management_pause().await;
        Ok(self
            .running
            .iter()
            .filter(|e| e.key().starts_with(prefix))
            .map(|e| e.key().clone())
            .collect())
    }

    async fn remove_by_name(&self, name: &str) -> Result<()> {
        self.management_pause().await;
        if self.running.remove(name).is_some() {
            if let Ok(mut removed) = self.removed.lock() {
                removed.push(name.to_string());
            }
        }
        Ok(())
    }

    async fn stats(&self, container: &ContainerRef) -> Result<Option<ContainerMetrics>> {
        if !self.running.contains_key(&container.name) {
            return Err(SandboxError::ResourceQueryError("no such container".into()));
        }
        Ok(self.stats.clone())
    }
}

fn completed(stdout: String, exit_code: i32) -> ScriptedReply {
    ScriptedReply::Output(ExecOutput {
        stdout,
        stderr: String::new(),
        exit_code,
        truncated: false,
    })
}

/// Answers pip invocations and runner invocations.
///
/// Runner support covers a toy subset of Python, one statement per line:
/// `name = a + b + ...` over int literals, string literals and names,
/// `print(expr)`, `raise Name`, `while True:` (hangs) and
/// `# write <path> <text>` which creates a workspace file.
pub fn mini_python(invocation: &ExecInvocation, workspace: &Path) -> ScriptedReply {
    if invocation.argv.iter().any(|a| a == "pip") {
        return fake_pip(&invocation.argv);
    }

    let reserved = workspace.join(crate::vfs::RESERVED_DIR);
    let code = std::fs::read_to_string(reserved.join(runner::USER_CODE_FILE)).unwrap_or_default();
    let script = std::fs::read_to_string(reserved.join(runner::RUNNER_FILE)).unwrap_or_default();
    let streaming = script.contains(r#"\"stream\":true"#);
    let mut namespace: Map<String, Value> =
        std::fs::read_to_string(reserved.join(runner::VARIABLES_FILE))
            .ok()
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or_default();

    let mut output = RunnerOutput {
        success: true,
        ..Default::default()
    };
    let mut frames = Vec::new();

    for line in code.lines().map(str::trim) {
        if line.is_empty() || line.starts_with("import ") {
            continue;
        }
        if line.starts_with("while True") {
            return ScriptedReply::Hang;
        }
        if let Some(rest) = line.strip_prefix("# write ") {
            if let Some((path, text)) = rest.split_once(' ') {
                let target = workspace.join(path.trim_start_matches('/'));
                if let Some(parent) = target.parent() {
                    let _ = std::fs::create_dir_all(parent);
                }
                let _ = std::fs::write(target, text);
            }
            continue;
        }
        if line.starts_with('#') {
            continue;
        }
        if let Some(name) = line.strip_prefix("raise ") {
            output.success = false;
            output.error = Some(RunnerError {
                error_type: name.trim_end_matches("()").to_string(),
                message: "raised by user code".to_string(),
                traceback: format!("Traceback (most recent call last):\n{name}\n"),
            });
            break;
        }
        let evaluated = if let Some(inner) = line
            .strip_prefix("print(")
            .and_then(|r| r.strip_suffix(')'))
        {
            eval(inner, &namespace).map(|value| {
                let text = match value {
                    Value::String(s) => s,
                    other => other.to_string(),
                };
                output.stdout.push_str(&text);
                output.stdout.push('\n');
                if streaming {
                    frames.push(format!(
                        "{}{}",
                        runner::EVENT_MARKER,
                        serde_json::json!({"type": "stdout", "data": format!("{text}\n")})
                    ));
                }
            })
        } else if let Some((name, expr)) = line.split_once('=') {
            eval(expr.trim(), &namespace).map(|value| {
                namespace.insert(name.trim().to_string(), value);
            })
        } else {
            eval(line, &namespace).map(|_| ())
        };
        if let Err(missing) = evaluated {
            output.success = false;
            output.error = Some(RunnerError {
                error_type: "NameError".to_string(),
                message: format!("name '{missing}' is not defined"),
                traceback: String::new(),
            });
            break;
        }
    }

    output.variables = namespace
        .into_iter()
        .filter(|(k, _)| !k.starts_with('_'))
        .collect();
    output.execution_time = 0.01;
    match output.to_result_line() {
        Ok(line) => {
            frames.push(line);
            completed(frames.join("\n") + "\n", 0)
        }
        Err(e) => ScriptedReply::Fail(e.to_string()),
    }
}

fn eval(expr: &str, namespace: &Map<String, Value>) -> std::result::Result<Value, String> {
    let mut int_total: i64 = 0;
    let mut text: Option<String> = None;
    for term in expr.split('+').map(str::trim) {
        let value = if let Ok(n) = term.parse::<i64>() {
            Value::from(n)
        } else if term.len() >= 2 && (term.starts_with('\'') || term.starts_with('"')) {
            Value::from(&term[1..term.len() - 1])
        } else {
            namespace.get(term).cloned().ok_or_else(|| term.to_string())?
        };
        match value {
            Value::String(s) => text.get_or_insert_with(String::new).push_str(&s),
            Value::Number(n) => int_total += n.as_i64().unwrap_or(0),
            other => return Ok(other),
        }
    }
    Ok(match text {
        Some(s) => Value::from(s),
        None => Value::from(int_total),
    })
}

fn fake_pip(argv: &[String]) -> ScriptedReply {
    let Some(target_at) = argv.iter().position(|a| a == "--target") else {
        return completed(String::new(), 0);
    };
    let Some(target) = argv.get(target_at + 1) else {
        return completed(String::new(), 2);
    };
    let packages: Vec<&String> = argv[target_at + 2..]
        .iter()
        .filter(|a| !a.starts_with('-'))
        .collect();
    if packages.iter().any(|p| p.starts_with("nonexistent")) {
        return ScriptedReply::Output(ExecOutput {
            stdout: String::new(),
            stderr: "ERROR: No matching distribution found".to_string(),
            exit_code: 1,
            truncated: false,
        });
    }
    for package in packages {
        let name = crate::policy::normalize_package(package).replace('-', "_");
        let dir = Path::new(target).join(&name);
        let _ = std::fs::create_dir_all(&dir);
        let _ = std::fs::write(dir.join("__init__.py"), b"");
    }
    completed("Successfully installed".to_string(), 0)
}
