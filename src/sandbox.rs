//! The sandbox facade: admission control in front of the engine plus the
//! session, variable, file and package operations the HTTP layer exposes.

use crate::config::SandboxConfig;
use crate::engine::{ExecutionEngine, ExecutionRequest, ExecutionResult};
use crate::errors::{Result, SandboxError};
use crate::events::{DestroyReason, SandboxEvent, StreamEvent};
use crate::monitor::{ResourceMonitor, SystemHealth};
use crate::packages::{PackageManager, PackageReport};
use crate::runtime::{ContainerMetrics, ContainerRuntime};
use crate::session::{SessionInfo, SessionManager, SessionOptions};
use crate::validation::{CodeValidator, ValidationReport, ValidationRequest};
use crate::vfs::{VfsEntry, VirtualFile};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, mpsc, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// A slot under the global execution limit
pub struct Admission {
    _permit: OwnedSemaphorePermit,
}

pub struct Sandbox {
    pub(crate) config: SandboxConfig,
    pub(crate) runtime: Arc<dyn ContainerRuntime>,
    pub(crate) sessions: Arc<SessionManager>,
    pub(crate) engine: Arc<ExecutionEngine>,
    pub(crate) packages: Arc<PackageManager>,
    pub(crate) validator: Arc<CodeValidator>,
    pub(crate) monitor: Arc<ResourceMonitor>,
    pub(crate) limiter: Arc<Semaphore>,
    pub(crate) events: broadcast::Sender<SandboxEvent>,
    pub(crate) cancel: CancellationToken,
    pub(crate) tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Sandbox {
    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    pub fn backend_name(&self) -> &'static str {
        self.runtime.backend_name()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SandboxEvent> {
        self.events.subscribe()
    }

    pub fn new_execution_id() -> String {
        uuid::Uuid::new_v4().to_string()
    }

    /// Remove leftovers of a previous run, then start the idle sweep,
    /// orphan sweep and host monitor.
    pub async fn start(&self) {
        match self.sessions.sweep_orphans().await {
            Ok(removed) if !removed.is_empty() => {
                info!("[SANDBOX] Removed {} orphan(s) at startup", removed.len())
            }
            Ok(_) => {}
            Err(e) => warn!("[SANDBOX] Startup orphan sweep failed: {}", e),
        }

        let mut handles = self.sessions.spawn_sweepers(self.cancel.clone());
        handles.push(self.monitor.spawn(self.cancel.clone()));
        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.extend(handles);
        }
        info!(
            "[SANDBOX] Started with {} backend, {} concurrent executions",
            self.runtime.backend_name(),
            self.config.execution.max_concurrent
        );
    }

    /// Stop background tasks and destroy every session.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let handles: Vec<JoinHandle<()>> = match self.tasks.lock() {
            Ok(mut tasks) => tasks.drain(..).collect(),
            Err(_) => Vec::new(),
        };
        for outcome in futures::future::join_all(handles).await {
            if let Err(e) = outcome {
                debug!("[SANDBOX] Background task ended abnormally: {}", e);
            }
        }
        self.sessions.shutdown().await;
        info!("[SANDBOX] Shut down");
    }

    /// Claim an execution slot or fail immediately.
    pub fn admit(&self) -> Result<Admission> {
        self.limiter
            .clone()
            .try_acquire_owned()
            .map(|permit| Admission { _permit: permit })
            .map_err(|_| {
                SandboxError::CapacityExceeded(format!(
                    "{} executions already in flight",
                    self.config.execution.max_concurrent
                ))
            })
    }

    pub async fn execute(&self, request: ExecutionRequest) -> Result<ExecutionResult> {
        self.execute_as(request, Self::new_execution_id()).await
    }

    /// Execute under a caller-chosen execution id.
    pub async fn execute_as(
        &self,
        request: ExecutionRequest,
        execution_id: String,
    ) -> Result<ExecutionResult> {
        let _admission = self.admit()?;
        self.engine.execute(request, execution_id).await
    }

    /// Streaming execution under an admission obtained from [`admit`](Self::admit),
    /// so callers can refuse before opening a stream.
    pub async fn execute_stream(
        &self,
        admission: Admission,
        request: ExecutionRequest,
        execution_id: String,
        sink: mpsc::Sender<StreamEvent>,
    ) -> Result<ExecutionResult> {
        let _admission = admission;
        self.engine.execute_stream(request, execution_id, sink).await
    }

    /// Security and analysis screen the engine applies before running code.
    pub fn screen(&self, code: &str) -> Result<()> {
        self.engine.screen(code)
    }

    pub fn validate(&self, request: &ValidationRequest) -> ValidationReport {
        self.validator.validate(request)
    }

    pub async fn create_session(&self, options: SessionOptions) -> Result<SessionInfo> {
        let session = self.sessions.get_or_create_session(options).await?;
        Ok(session.info().await)
    }

    pub async fn get_session(&self, id: &str) -> Result<SessionInfo> {
        Ok(self.sessions.get_session(id)?.info().await)
    }

    pub async fn list_sessions(&self) -> Vec<SessionInfo> {
        self.sessions.list_sessions().await
    }

    pub async fn update_session(
        &self,
        id: &str,
        metadata: BTreeMap<String, Option<String>>,
    ) -> Result<SessionInfo> {
        self.sessions.update_metadata(id, metadata).await
    }

    pub async fn destroy_session(&self, id: &str) -> Result<()> {
        self.sessions.destroy_session(id, DestroyReason::Requested).await
    }

    pub async fn get_variables(&self, id: &str) -> Result<Map<String, Value>> {
        let session = self.sessions.get_session(id)?;
        let state = session.state().read().await;
        Ok(state.variables().clone())
    }

    /// Merge variables into the session store; supplied values win.
    pub async fn set_variables(
        &self,
        id: &str,
        variables: Map<String, Value>,
    ) -> Result<Map<String, Value>> {
        if let Some(name) = variables
            .keys()
            .find(|name| name.is_empty() || name.starts_with('_'))
        {
            return Err(SandboxError::InvalidRequest(format!(
                "invalid variable name '{name}'"
            )));
        }
        let session = self.sessions.get_session(id)?;
        let _permit = session.try_begin_execution()?;
        let mut state = session.state().write().await;
        state.variables.extend(variables);
        state.touch();
        Ok(state.variables().clone())
    }

    /// Delete the named variables, or all of them when `names` is `None`.
    pub async fn delete_variables(
        &self,
        id: &str,
        names: Option<Vec<String>>,
    ) -> Result<Map<String, Value>> {
        let session = self.sessions.get_session(id)?;
        let _permit = session.try_begin_execution()?;
        let mut state = session.state().write().await;
        match names {
            Some(names) => {
                for name in names {
                    state.variables.remove(&name);
                }
            }
            None => state.variables.clear(),
        }
        state.touch();
        Ok(state.variables().clone())
    }

    pub async fn list_files(&self, id: &str, path: &str) -> Result<Vec<VfsEntry>> {
        let session = self.sessions.get_session(id)?;
        let state = session.state().read().await;
        Ok(state.vfs().list_directory(path)?)
    }

    pub async fn read_file(&self, id: &str, path: &str) -> Result<VirtualFile> {
        let session = self.sessions.get_session(id)?;
        let state = session.state().read().await;
        Ok(state.vfs().read_file(path)?.clone())
    }

    pub async fn write_file(&self, id: &str, path: &str, content: Vec<u8>) -> Result<VfsEntry> {
        let session = self.sessions.get_session(id)?;
        let _permit = session.try_begin_execution()?;
        let mut state = session.state().write().await;
        let written = state.vfs_mut().write_file(path, content)?.path.clone();
        state.touch();
        Ok(state.vfs().stat(&written)?)
    }

    pub async fn delete_file(&self, id: &str, path: &str) -> Result<()> {
        let session = self.sessions.get_session(id)?;
        let _permit = session.try_begin_execution()?;
        let mut state = session.state().write().await;
        state.vfs_mut().remove(path)?;
        state.touch();
        Ok(())
    }

    pub async fn install_packages(&self, id: &str, packages: &[String]) -> Result<PackageReport> {
        self.packages.check(packages)?;
        let session = self.sessions.get_session(id)?;
        let _permit = session.try_begin_execution()?;
        let container = self.sessions.ensure_ready(&session).await?;
        let mut state = session.state().write().await;
        let report = self.packages.install(&mut state, &container, packages).await?;
        state.touch();
        Ok(report)
    }

    pub async fn uninstall_packages(&self, id: &str, packages: &[String]) -> Result<PackageReport> {
        let session = self.sessions.get_session(id)?;
        let _permit = session.try_begin_execution()?;
        let mut state = session.state().write().await;
        let report = self.packages.uninstall(&mut state, packages)?;
        state.touch();
        Ok(report)
    }

    /// Point-in-time usage of the session's container, if it has one.
    pub async fn session_metrics(&self, id: &str) -> Result<Option<ContainerMetrics>> {
        let session = self.sessions.get_session(id)?;
        let container = session.state().read().await.container().cloned();
        Ok(match container {
            Some(container) => self.monitor.get_container_metrics(&container).await,
            None => None,
        })
    }

    pub async fn health(&self) -> SystemHealth {
        let mut health = self.monitor.get_system_health().await;
        health.security = Some(self.config.security_profile.into());
        health
    }
}
