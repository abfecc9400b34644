//! Execution engine: screen, place, run and harvest one submission.

use crate::analyzer::StaticAnalyzer;
use crate::config::{ExecutionConfig, ImportPolicy};
use crate::errors::{Result, SandboxError};
use crate::events::{SandboxEvent, StreamEvent, StreamEventType};
use crate::monitor::ResourceMonitor;
use crate::packages::PackageManager;
use crate::policy::SecurityPolicy;
use crate::runner::{self, PlotImage, RunnerConfig, RunnerOutput};
use crate::runtime::{ContainerMetrics, ContainerRef, ExecControl, ExecInvocation, ExecOutcome};
use crate::security::SecurityValidator;
use crate::session::{Session, SessionManager, SessionOptions};
use crate::vfs::RESERVED_DIR;
use crate::workspace::write_reserved;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRequest {
    pub code: String,
    pub session_id: Option<String>,
    /// Seconds
    pub timeout: Option<u64>,
    #[serde(default)]
    pub packages: Vec<String>,
    /// Merged into the session before the run; request values win
    #[serde(default)]
    pub variables: Map<String, Value>,
    pub allow_networking: Option<bool>,
    /// MB
    pub max_memory: Option<u64>,
    /// CPU cores
    pub max_cpu: Option<f64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionOutput {
    pub stdout: String,
    pub stderr: String,
    /// VFS paths of saved figures
    pub plots: Vec<String>,
    /// Saved figures small enough to return as base64
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub plot_data: Vec<PlotImage>,
    pub variables: Map<String, Value>,
    /// numpy arrays and pandas frames/series described for display
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub data_objects: Map<String, Value>,
    /// Globals that could not be kept: name -> {type, repr}
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub unserializable: Map<String, Value>,
    #[serde(default)]
    pub truncated: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionMetrics {
    /// Seconds spent in user code
    pub execution_time: f64,
    /// Peak RSS of the interpreter in bytes
    pub memory_usage: u64,
    /// Bytes held by user globals when the run ended
    #[serde(default)]
    pub variable_memory: u64,
    /// CPU time over wall time, percent
    pub cpu_usage: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container: Option<ContainerMetrics>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionErrorInfo {
    #[serde(rename = "type")]
    pub error_type: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub success: bool,
    pub session_id: Option<String>,
    pub execution_id: String,
    pub output: ExecutionOutput,
    pub metrics: ExecutionMetrics,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ExecutionErrorInfo>,
}

impl ExecutionResult {
    /// Error body for a request the engine refused or could not finish.
    pub fn from_error(err: &SandboxError, session_id: Option<String>, execution_id: String) -> Self {
        Self {
            success: false,
            session_id,
            execution_id,
            output: ExecutionOutput::default(),
            metrics: ExecutionMetrics::default(),
            error: Some(ExecutionErrorInfo {
                error_type: err.kind().to_string(),
                message: err.to_string(),
                details: err.details(),
            }),
        }
    }
}

/// What the runner's import guard enforces for a policy
fn runner_modules(policy: &SecurityPolicy) -> (Vec<String>, Option<Vec<String>>) {
    let (whitelist, blacklist) = policy.import_policy.listed_modules();
    let mut blocked = policy.runtime_blocked_modules();
    blocked.extend(blacklist);
    blocked.sort();
    blocked.dedup();
    let allowed = match policy.import_policy {
        ImportPolicy::Blacklist(_) => None,
        _ => Some(whitelist),
    };
    (blocked, allowed)
}

pub struct ExecutionEngine {
    validator: Arc<SecurityValidator>,
    analyzer: Arc<StaticAnalyzer>,
    sessions: Arc<SessionManager>,
    packages: Arc<PackageManager>,
    monitor: Option<Arc<ResourceMonitor>>,
    config: ExecutionConfig,
    events: broadcast::Sender<SandboxEvent>,
}

/// Files and settings prepared for one run
struct PreparedRun {
    container: ContainerRef,
    workspace: std::path::PathBuf,
    invocation: ExecInvocation,
}

impl ExecutionEngine {
    pub fn new(
        validator: Arc<SecurityValidator>,
        analyzer: Arc<StaticAnalyzer>,
        sessions: Arc<SessionManager>,
        packages: Arc<PackageManager>,
        monitor: Option<Arc<ResourceMonitor>>,
        config: ExecutionConfig,
        events: broadcast::Sender<SandboxEvent>,
    ) -> Self {
        Self {
            validator,
            analyzer,
            sessions,
            packages,
            monitor,
            config,
            events,
        }
    }

    pub fn config(&self) -> &ExecutionConfig {
        &self.config
    }

    /// Run one request to completion.
    pub async fn execute(
        &self,
        request: ExecutionRequest,
        execution_id: String,
    ) -> Result<ExecutionResult> {
        let requested_session = request.session_id.clone();
        let outcome = self
            .run(request, &execution_id, None, CancellationToken::new())
            .await;
        if let Err(e) = &outcome {
            self.report_failure(requested_session, &execution_id, e);
        }
        outcome
    }

    /// Like [`execute`](Self::execute), emitting events into `sink` as
    /// output arrives and finishing with `complete` or `error`. Closing the
    /// receiver cancels the run.
    pub async fn execute_stream(
        &self,
        request: ExecutionRequest,
        execution_id: String,
        sink: mpsc::Sender<StreamEvent>,
    ) -> Result<ExecutionResult> {
        let requested_session = request.session_id.clone();
        let cancel = CancellationToken::new();
        let watcher = {
            let sink = sink.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = sink.closed() => {
                        debug!("[ENGINE] Stream receiver closed; cancelling");
                        cancel.cancel();
                    }
                    _ = cancel.cancelled() => {}
                }
            })
        };

        let outcome = self
            .run(request, &execution_id, Some(sink.clone()), cancel.clone())
            .await;
        watcher.abort();

        match &outcome {
            Ok(result) => {
                for (name, value) in &result.output.variables {
                    let event = StreamEvent::new(
                        StreamEventType::Variable,
                        json!({ "name": name, "value": value }),
                    );
                    if sink.send(event).await.is_err() {
                        break;
                    }
                }
                let data = serde_json::to_value(result)?;
                let _ = sink
                    .send(StreamEvent::new(StreamEventType::Complete, data))
                    .await;
            }
            Err(e) => {
                self.report_failure(requested_session, &execution_id, e);
                let data = json!({
                    "type": e.kind(),
                    "message": e.to_string(),
                    "details": e.details(),
                });
                let _ = sink.send(StreamEvent::new(StreamEventType::Error, data)).await;
            }
        }
        outcome
    }

    fn report_failure(&self, session_id: Option<String>, execution_id: &str, err: &SandboxError) {
        info!(
            "[ENGINE] Execution {} failed: {} ({})",
            execution_id,
            err,
            err.kind()
        );
        let _ = self.events.send(SandboxEvent::ExecutionFailed {
            session_id,
            execution_id: execution_id.to_string(),
            error_type: err.kind().to_string(),
        });
    }

    /// Refuse code the validator or analyzer considers dangerous.
    pub fn screen(&self, code: &str) -> Result<()> {
        if code.trim().is_empty() {
            return Err(SandboxError::InvalidRequest("code must not be empty".into()));
        }
        let report = self.validator.validate_code(code);
        if !report.allowed {
            return Err(SandboxError::SecurityViolation {
                violations: report.violations,
            });
        }
        let analysis = self.analyzer.analyze(code);
        if analysis.has_high_risk_patterns {
            return Err(SandboxError::AnalysisViolation {
                risks: analysis.high_risks(),
            });
        }
        Ok(())
    }

    async fn run(
        &self,
        request: ExecutionRequest,
        execution_id: &str,
        sink: Option<mpsc::Sender<StreamEvent>>,
        cancel: CancellationToken,
    ) -> Result<ExecutionResult> {
        self.screen(&request.code)?;
        if !request.packages.is_empty() {
            self.packages.check(&request.packages)?;
        }

        let session = match &request.session_id {
            Some(id) => self.sessions.get_session(id)?,
            None => {
                self.sessions
                    .get_or_create_session(SessionOptions {
                        session_id: None,
                        allow_networking: request.allow_networking,
                        max_memory: request.max_memory,
                        max_cpu: request.max_cpu,
                        metadata: Default::default(),
                    })
                    .await?
            }
        };
        let _permit = session.try_begin_execution()?;
        let container = self.sessions.ensure_ready(&session).await?;

        info!(
            "[ENGINE] Execution {} started in session {}",
            execution_id,
            session.id()
        );
        let _ = self.events.send(SandboxEvent::ExecutionStarted {
            session_id: session.id().to_string(),
            execution_id: execution_id.to_string(),
        });

        let prepared = self
            .prepare(&session, container, &request, execution_id, sink.is_some())
            .await?;
        let started = Instant::now();
        let raw = self.invoke(&session, &prepared, &request, sink, cancel).await?;

        let parsed = match runner::parse_output(&raw.stdout) {
            Ok(parsed) => parsed,
            Err(reason) => {
                warn!(
                    "[ENGINE] Execution {} produced no usable result: {}",
                    execution_id, reason
                );
                if !self.container_alive(&prepared.container).await {
                    self.sessions.release_container(&session).await;
                }
                return Err(SandboxError::ResultParseError {
                    reason,
                    stdout: raw.stdout,
                    stderr: raw.stderr,
                });
            }
        };

        self.harvest(&session, &prepared, &parsed).await;
        let container_metrics = match &self.monitor {
            Some(monitor) => monitor.get_container_metrics(&prepared.container).await,
            None => None,
        };

        let result = Self::build_result(
            parsed,
            raw.truncated,
            session.id(),
            execution_id,
            container_metrics,
        );
        info!(
            "[ENGINE] Execution {} finished in {:?} (success={})",
            execution_id,
            started.elapsed(),
            result.success
        );
        let _ = self.events.send(SandboxEvent::ExecutionCompleted {
            session_id: session.id().to_string(),
            execution_id: execution_id.to_string(),
            success: result.success,
            execution_time_ms: started.elapsed().as_millis() as u64,
        });
        Ok(result)
    }

    /// Install packages, materialize the VFS and write the runner files.
    async fn prepare(
        &self,
        session: &Session,
        container: ContainerRef,
        request: &ExecutionRequest,
        execution_id: &str,
        stream: bool,
    ) -> Result<PreparedRun> {
        let mut state = session.state().write().await;

        if !request.packages.is_empty() {
            self.packages
                .install(&mut state, &container, &request.packages)
                .await?;
        }

        // Request variables only reach the session through a successful run.
        let mut variables = state.variables().clone();
        for (name, value) in &request.variables {
            variables.insert(name.clone(), value.clone());
        }

        let workspace = state.workspace_path()?;
        state.vfs().sync_to_host(&workspace)?;
        drop(state);

        let (blocked_modules, allowed_modules) = runner_modules(self.validator.policy());
        let script = runner::render(&RunnerConfig {
            execution_id: execution_id.to_string(),
            blocked_modules,
            allowed_modules,
            max_output_bytes: self.config.max_output_bytes,
            max_plots: self.config.max_plots,
            max_plot_bytes: self.config.max_plot_bytes,
            max_variable_bytes: self.config.max_variable_bytes,
            max_variables_total_bytes: self.config.max_variables_total_bytes,
            stream,
        })?;

        write_reserved(&workspace, runner::USER_CODE_FILE, request.code.as_bytes())?;
        write_reserved(
            &workspace,
            runner::VARIABLES_FILE,
            &serde_json::to_vec(&variables)?,
        )?;
        write_reserved(&workspace, runner::RUNNER_FILE, script.as_bytes())?;

        let guest_runner = format!(
            "{}/{}/{}",
            container.guest_workspace.trim_end_matches('/'),
            RESERVED_DIR,
            runner::RUNNER_FILE
        );
        let invocation = ExecInvocation {
            id: execution_id.to_string(),
            argv: vec![self.sessions.runtime().interpreter(), guest_runner],
            env: vec![
                ("PYTHONDONTWRITEBYTECODE".to_string(), "1".to_string()),
                ("PYTHONIOENCODING".to_string(), "utf-8".to_string()),
                ("MPLBACKEND".to_string(), "Agg".to_string()),
            ],
            workdir: container.guest_workspace.clone(),
        };

        Ok(PreparedRun {
            container,
            workspace,
            invocation,
        })
    }

    /// Run the runner and return its raw output.
    async fn invoke(
        &self,
        session: &Session,
        prepared: &PreparedRun,
        request: &ExecutionRequest,
        sink: Option<mpsc::Sender<StreamEvent>>,
        cancel: CancellationToken,
    ) -> Result<crate::runtime::ExecOutput> {
        let timeout = self.config.timeout_for(request.timeout);
        let mut control = ExecControl::with_timeout(timeout);
        control.cancel = cancel.clone();
        // Streaming repeats captured output in event frames ahead of the result frame.
        control.max_line_bytes = self.config.frame_limit();
        control.max_output_bytes = self
            .config
            .frame_limit()
            .saturating_add(self.config.max_output_bytes.saturating_mul(12));

        let forwarder = sink.map(|sink| {
            let (lines_tx, mut lines_rx) = mpsc::channel::<String>(self.config.stream_buffer.max(1));
            control.stdout_lines = Some(lines_tx);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                while let Some(line) = lines_rx.recv().await {
                    let Some(frame) = runner::parse_event_line(&line) else {
                        continue;
                    };
                    let Some(kind) = StreamEventType::parse(&frame.kind) else {
                        continue;
                    };
                    if sink.send(StreamEvent::new(kind, frame.data)).await.is_err() {
                        cancel.cancel();
                        break;
                    }
                }
            })
        });

        let outcome = self
            .sessions
            .runtime()
            .exec(&prepared.container, prepared.invocation.clone(), control)
            .await;
        if let Some(forwarder) = forwarder {
            if let Err(e) = forwarder.await {
                warn!("[ENGINE] Stream forwarder failed: {}", e);
            }
        }

        match outcome {
            Ok(ExecOutcome::Completed(output)) => Ok(output),
            Ok(ExecOutcome::TimedOut) => {
                warn!(
                    "[ENGINE] Execution {} timed out after {:?}",
                    prepared.invocation.id, timeout
                );
                if !self.container_alive(&prepared.container).await {
                    self.sessions.release_container(session).await;
                }
                Err(SandboxError::Timeout {
                    seconds: timeout.as_secs(),
                })
            }
            Ok(ExecOutcome::Cancelled) => Err(SandboxError::RuntimeError(
                "execution cancelled: stream receiver went away".into(),
            )),
            Err(e) => {
                if !self.container_alive(&prepared.container).await {
                    self.sessions.release_container(session).await;
                }
                Err(e)
            }
        }
    }

    async fn container_alive(&self, container: &ContainerRef) -> bool {
        matches!(self.sessions.runtime().is_running(container).await, Ok(true))
    }

    /// Fold a parsed run back into the session.
    async fn harvest(&self, session: &Session, prepared: &PreparedRun, parsed: &RunnerOutput) {
        let mut state = session.state().write().await;
        state.variables = parsed.variables.clone();
        match state.vfs.sync_from_host(&prepared.workspace) {
            Ok(report) => {
                if !report.skipped.is_empty() {
                    warn!(
                        "[ENGINE] Session {}: {} file(s) not kept: {:?}",
                        session.id(),
                        report.skipped.len(),
                        report.skipped
                    );
                }
            }
            Err(e) => warn!("[ENGINE] Session {}: workspace sync failed: {}", session.id(), e),
        }
        state.execution_count += 1;
        state.touch();
    }

    fn build_result(
        parsed: RunnerOutput,
        truncated: bool,
        session_id: &str,
        execution_id: &str,
        container: Option<ContainerMetrics>,
    ) -> ExecutionResult {
        let cpu_usage = if parsed.execution_time > 0.0 {
            (parsed.cpu_time / parsed.execution_time * 100.0).max(0.0)
        } else {
            0.0
        };
        let error = parsed.error.as_ref().map(|e| ExecutionErrorInfo {
            error_type: "ExecutionError".to_string(),
            message: format!("{}: {}", e.error_type, e.message),
            details: Some(json!({
                "exceptionType": e.error_type,
                "traceback": e.traceback,
            })),
        });
        ExecutionResult {
            success: parsed.success,
            session_id: Some(session_id.to_string()),
            execution_id: execution_id.to_string(),
            output: ExecutionOutput {
                stdout: parsed.stdout,
                stderr: parsed.stderr,
                plots: parsed.plots,
                plot_data: parsed.plot_data,
                variables: parsed.variables,
                data_objects: parsed.data_objects,
                unserializable: parsed.unserializable,
                truncated: parsed.truncated || truncated,
            },
            metrics: ExecutionMetrics {
                execution_time: parsed.execution_time,
                memory_usage: parsed.memory_usage,
                variable_memory: parsed.variable_memory,
                cpu_usage,
                container,
            },
            error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LifecycleConfig, ResourceLimits, VfsLimits};
    use crate::runtime::scripted::{mini_python, ScriptedReply, ScriptedRuntime};
    use crate::runtime::{ContainerRuntime, ExecOutput};
    use std::time::Duration;

    struct Fixture {
        engine: Arc<ExecutionEngine>,
        runtime: Arc<ScriptedRuntime>,
        sessions: Arc<SessionManager>,
        _base: tempfile::TempDir,
    }

    fn fixture(runtime: ScriptedRuntime) -> Fixture {
        let base = tempfile::tempdir().unwrap();
        let runtime = Arc::new(runtime);
        let (events, _) = broadcast::channel(64);
        let sessions = Arc::new(SessionManager::new(
            runtime.clone(),
            LifecycleConfig {
                workspace_base: base.path().to_path_buf(),
                ..LifecycleConfig::default()
            },
            ResourceLimits::default(),
            VfsLimits::default(),
            events.clone(),
        ));
        let validator = Arc::new(SecurityValidator::new(Arc::new(SecurityPolicy::balanced())));
        let packages = Arc::new(PackageManager::new(
            runtime.clone(),
            validator.clone(),
            None,
            Duration::from_secs(5),
        ));
        let engine = Arc::new(ExecutionEngine::new(
            validator,
            Arc::new(StaticAnalyzer::new()),
            sessions.clone(),
            packages,
            None,
            ExecutionConfig::default(),
            events,
        ));
        Fixture {
            engine,
            runtime,
            sessions,
            _base: base,
        }
    }

    fn request(code: &str, session_id: Option<&str>) -> ExecutionRequest {
        ExecutionRequest {
            code: code.to_string(),
            session_id: session_id.map(str::to_string),
            ..Default::default()
        }
    }

    fn hangs_on_sleep(invocation: &ExecInvocation, workspace: &std::path::Path) -> ScriptedReply {
        let code = std::fs::read_to_string(workspace.join(".sandbox/user_code.py")).unwrap_or_default();
        if code.contains("time.sleep(") {
            ScriptedReply::Hang
        } else {
            mini_python(invocation, workspace)
        }
    }

    #[tokio::test]
    async fn simple_assignment_creates_session() {
        let fx = fixture(ScriptedRuntime::new());
        let result = fx
            .engine
            .execute(request("x = 1 + 1", None), "exec-1".into())
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(result.output.variables["x"], json!(2));
        let session_id = result.session_id.unwrap();
        assert!(!session_id.is_empty());
        assert!(fx.sessions.get_session(&session_id).is_ok());
    }

    #[tokio::test]
    async fn state_carries_across_executions() {
        let fx = fixture(ScriptedRuntime::new());
        let first = fx
            .engine
            .execute(request("a = 5", None), "exec-1".into())
            .await
            .unwrap();
        let sid = first.session_id.unwrap();
        let second = fx
            .engine
            .execute(request("b = a + 1", Some(&sid)), "exec-2".into())
            .await
            .unwrap();
        assert_eq!(second.output.variables["b"], json!(6));
        assert_eq!(second.output.variables["a"], json!(5));
        let session = fx.sessions.get_session(&sid).unwrap();
        assert_eq!(session.info().await.execution_count, 2);
    }

    #[tokio::test]
    async fn sessions_do_not_share_variables() {
        let fx = fixture(ScriptedRuntime::new());
        fx.engine
            .execute(request("secret = 42", None), "exec-1".into())
            .await
            .unwrap();
        let other = fx
            .engine
            .execute(request("y = secret + 1", None), "exec-2".into())
            .await
            .unwrap();
        assert!(!other.success);
        assert!(!other.output.variables.contains_key("secret"));
    }

    #[tokio::test]
    async fn denylisted_code_never_reaches_a_container() {
        let fx = fixture(ScriptedRuntime::new());
        let err = fx
            .engine
            .execute(request("import os\nos.system('ls')", None), "exec-1".into())
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::SecurityViolation { .. }));
        assert_eq!(fx.runtime.created_count(), 0);
        assert_eq!(fx.sessions.session_count(), 0);
    }

    #[tokio::test]
    async fn analysis_rejects_unbounded_loops() {
        let fx = fixture(ScriptedRuntime::new());
        let err = fx
            .engine
            .execute(request("while True:\n    x = 1\n", None), "exec-1".into())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "AnalysisViolation");
        assert_eq!(fx.runtime.created_count(), 0);
    }

    #[tokio::test]
    async fn unknown_session_is_not_found() {
        let fx = fixture(ScriptedRuntime::new());
        let err = fx
            .engine
            .execute(request("x = 1", Some("nope")), "exec-1".into())
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::SessionNotFound(_)));
    }

    #[tokio::test]
    async fn user_exception_keeps_partial_namespace() {
        let fx = fixture(ScriptedRuntime::new());
        let result = fx
            .engine
            .execute(request("a = 1\nraise ValueError", None), "exec-1".into())
            .await
            .unwrap();
        assert!(!result.success);
        let error = result.error.unwrap();
        assert_eq!(error.error_type, "ExecutionError");
        assert_eq!(error.details.unwrap()["exceptionType"], "ValueError");

        let session = fx.sessions.get_session(&result.session_id.unwrap()).unwrap();
        assert_eq!(session.state().read().await.variables()["a"], json!(1));
    }

    #[tokio::test]
    async fn timeout_kills_run_and_session_survives() {
        let fx = fixture(ScriptedRuntime::with_handler(hangs_on_sleep));
        let first = fx
            .engine
            .execute(request("n = 1", None), "exec-1".into())
            .await
            .unwrap();
        let sid = first.session_id.unwrap();

        let mut slow = request("import time\ntime.sleep(60)", Some(&sid));
        slow.timeout = Some(1);
        let started = Instant::now();
        let err = fx.engine.execute(slow, "exec-2".into()).await.unwrap_err();
        assert!(matches!(err, SandboxError::Timeout { seconds: 1 }));
        assert!(started.elapsed() < Duration::from_secs(5));

        let session = fx.sessions.get_session(&sid).unwrap();
        assert_eq!(
            session.status().await,
            crate::session::SessionStatus::Ready
        );
        let next = fx
            .engine
            .execute(request("m = n + 1", Some(&sid)), "exec-3".into())
            .await
            .unwrap();
        assert_eq!(next.output.variables["m"], json!(2));
    }

    #[tokio::test]
    async fn garbled_output_is_a_parse_error_without_state_change() {
        let fx = fixture(ScriptedRuntime::with_handler(|invocation, workspace| {
            let code = std::fs::read_to_string(workspace.join(".sandbox/user_code.py"))
                .unwrap_or_default();
            if code.contains("garble") {
                ScriptedReply::Output(ExecOutput {
                    stdout: "Segmentation fault\n".into(),
                    stderr: "core dumped".into(),
                    exit_code: 139,
                    truncated: false,
                })
            } else {
                mini_python(invocation, workspace)
            }
        }));
        let first = fx
            .engine
            .execute(request("keep = 7", None), "exec-1".into())
            .await
            .unwrap();
        let sid = first.session_id.unwrap();

        let err = fx
            .engine
            .execute(request("garble = 1", Some(&sid)), "exec-2".into())
            .await
            .unwrap_err();
        match err {
            SandboxError::ResultParseError { stdout, stderr, .. } => {
                assert!(stdout.contains("Segmentation fault"));
                assert_eq!(stderr, "core dumped");
            }
            other => panic!("unexpected error: {other}"),
        }
        let session = fx.sessions.get_session(&sid).unwrap();
        let state = session.state().read().await;
        assert_eq!(state.variables()["keep"], json!(7));
        assert!(!state.variables().contains_key("garble"));
    }

    #[tokio::test]
    async fn data_objects_and_inline_plots_are_reported_but_not_kept() {
        let fx = fixture(ScriptedRuntime::with_handler(|_, _| {
            let mut output = RunnerOutput {
                success: true,
                plots: vec!["/output/plots/plot_exec1_1.png".into()],
                plot_data: vec![PlotImage {
                    path: "/output/plots/plot_exec1_1.png".into(),
                    format: "png".into(),
                    data: "iVBORw0KGgo=".into(),
                    title: "ramp".into(),
                    ..Default::default()
                }],
                memory_usage: 40 * 1024 * 1024,
                variable_memory: 52,
                ..Default::default()
            };
            output.variables.insert("n".into(), json!(3));
            output.data_objects.insert(
                "arr".into(),
                json!({"type": "numpy.ndarray", "dtype": "int64", "shape": [3], "data": [0, 1, 2]}),
            );
            ScriptedReply::Output(ExecOutput {
                stdout: format!("{}\n", output.to_result_line().unwrap()),
                stderr: String::new(),
                exit_code: 0,
                truncated: false,
            })
        }));
        let code = "import numpy as np\narr = np.arange(3)\nn = len(arr)";
        let result = fx.engine.execute(request(code, None), "exec-1".into()).await.unwrap();

        assert_eq!(result.output.data_objects["arr"]["shape"], json!([3]));
        assert_eq!(result.output.plot_data[0].title, "ramp");
        assert_eq!(result.metrics.variable_memory, 52);
        let body = serde_json::to_value(&result).unwrap();
        assert_eq!(body["output"]["plotData"][0]["data"], json!("iVBORw0KGgo="));
        assert_eq!(body["metrics"]["variableMemory"], json!(52));

        let session = fx.sessions.get_session(&result.session_id.unwrap()).unwrap();
        let state = session.state().read().await;
        assert_eq!(state.variables()["n"], json!(3));
        assert!(!state.variables().contains_key("arr"));
    }

    #[tokio::test]
    async fn request_variables_are_merged() {
        let fx = fixture(ScriptedRuntime::new());
        let mut req = request("z = y + 1", None);
        req.variables.insert("y".into(), json!(3));
        let result = fx.engine.execute(req, "exec-1".into()).await.unwrap();
        assert_eq!(result.output.variables["z"], json!(4));
        assert_eq!(result.output.variables["y"], json!(3));
    }

    #[tokio::test]
    async fn concurrent_run_in_same_session_is_busy() {
        let fx = fixture(ScriptedRuntime::new().with_delay(Duration::from_millis(400)));
        let first = fx
            .engine
            .execute(request("a = 1", None), "exec-1".into())
            .await
            .unwrap();
        let sid = first.session_id.unwrap();

        let engine = fx.engine.clone();
        let slow_sid = sid.clone();
        let slow = tokio::spawn(async move {
            engine
                .execute(request("b = 2", Some(&slow_sid)), "exec-2".into())
                .await
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        let err = fx
            .engine
            .execute(request("c = 3", Some(&sid)), "exec-3".into())
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::SessionBusy(_)));
        assert!(slow.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn files_written_by_code_land_in_the_vfs() {
        let fx = fixture(ScriptedRuntime::new());
        let result = fx
            .engine
            .execute(
                request("# write /data/out.txt hello\nx = 1", None),
                "exec-1".into(),
            )
            .await
            .unwrap();
        let session = fx.sessions.get_session(&result.session_id.unwrap()).unwrap();
        let state = session.state().read().await;
        assert_eq!(state.vfs().read_file("/data/out.txt").unwrap().content, b"hello");
        assert!(!state.vfs().exists("/.sandbox/runner.py"));
    }

    #[tokio::test]
    async fn streaming_emits_output_variables_then_complete() {
        let fx = fixture(ScriptedRuntime::new());
        let (tx, mut rx) = mpsc::channel(32);
        let result = fx
            .engine
            .execute_stream(request("x = 2\nprint(x)", None), "exec-1".into(), tx)
            .await
            .unwrap();
        assert!(result.success);

        let mut kinds = Vec::new();
        while let Some(event) = rx.recv().await {
            kinds.push(event.event_type);
            if event.event_type == StreamEventType::Stdout {
                assert_eq!(event.data, json!("2\n"));
            }
        }
        assert_eq!(
            kinds,
            vec![
                StreamEventType::Stdout,
                StreamEventType::Variable,
                StreamEventType::Complete
            ]
        );
    }

    #[tokio::test]
    async fn streaming_failure_ends_with_error_event() {
        let fx = fixture(ScriptedRuntime::new());
        let (tx, mut rx) = mpsc::channel(8);
        let err = fx
            .engine
            .execute_stream(request("import subprocess", None), "exec-1".into(), tx)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "SecurityViolation");
        let event = rx.recv().await.unwrap();
        assert_eq!(event.event_type, StreamEventType::Error);
        assert_eq!(event.data["type"], "SecurityViolation");
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn dropped_stream_cancels_the_run() {
        let fx = fixture(ScriptedRuntime::with_handler(hangs_on_sleep));
        let (tx, rx) = mpsc::channel(8);
        let engine = fx.engine.clone();
        let run = tokio::spawn(async move {
            engine
                .execute_stream(request("import time\ntime.sleep(60)", None), "exec-1".into(), tx)
                .await
        });
        tokio::time::sleep(Duration::from_millis(200)).await;
        drop(rx);
        let outcome = tokio::time::timeout(Duration::from_secs(5), run)
            .await
            .expect("run should stop once the receiver is gone")
            .unwrap();
        assert_eq!(outcome.unwrap_err().kind(), "RuntimeError");
    }

    #[tokio::test]
    async fn packages_are_installed_before_the_run() {
        let fx = fixture(ScriptedRuntime::new());
        let mut req = request("x = 1", None);
        req.packages = vec!["tabulate".into()];
        let result = fx.engine.execute(req, "exec-1".into()).await.unwrap();
        let session = fx.sessions.get_session(&result.session_id.unwrap()).unwrap();
        assert_eq!(session.info().await.installed_packages, vec!["tabulate".to_string()]);
    }

    #[tokio::test]
    async fn runtime_failure_keeps_a_live_container() {
        let fx = fixture(ScriptedRuntime::with_handler(|invocation, workspace| {
            let code = std::fs::read_to_string(workspace.join(".sandbox/user_code.py"))
                .unwrap_or_default();
            if code.contains("crash") {
                ScriptedReply::Fail("connection reset".into())
            } else {
                mini_python(invocation, workspace)
            }
        }));
        let first = fx
            .engine
            .execute(request("a = 1", None), "exec-1".into())
            .await
            .unwrap();
        let sid = first.session_id.unwrap();
        let name = format!("pysandbox-session-{sid}");

        // Container alive: the error surfaces and the container is kept.
        let err = fx
            .engine
            .execute(request("crash = 1", Some(&sid)), "exec-2".into())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "RuntimeError");
        assert!(fx.runtime.list(&name).await.unwrap().contains(&name));
    }
}
