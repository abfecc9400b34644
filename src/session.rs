//! Session registry and container lifecycle.
//!
//! ```text
//! UNINITIALIZED -> PROVISIONING -> READY <-> EXECUTING
//!                                    |
//!                              TERMINATING -> DESTROYED
//! ```
//!
//! EXECUTING is not stored: a READY session whose execution lock is held
//! reports EXECUTING, so an abandoned execution can never leave a session
//! stuck in that state.

use crate::config::{LifecycleConfig, ResourceLimits, VfsLimits};
use crate::errors::{Result, SandboxError};
use crate::events::{DestroyReason, SandboxEvent};
use crate::runtime::{ContainerRef, ContainerRuntime, ContainerSpec};
use crate::vfs::{VfsUsage, VirtualFileSystem};
use crate::workspace::{self, SessionWorkspace};
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex, OwnedMutexGuard, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
    Uninitialized,
    Provisioning,
    Ready,
    Executing,
    Terminating,
    Destroyed,
}

impl SessionStatus {
    pub fn is_live(&self) -> bool {
        !matches!(self, SessionStatus::Terminating | SessionStatus::Destroyed)
    }
}

/// Per-session resource overrides and metadata supplied at creation
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionOptions {
    pub session_id: Option<String>,
    pub allow_networking: Option<bool>,
    /// MB
    pub max_memory: Option<u64>,
    /// CPU cores
    pub max_cpu: Option<f64>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

/// Mutable part of a session, guarded by one lock.
pub struct SessionState {
    pub(crate) status: SessionStatus,
    pub(crate) last_activity: DateTime<Utc>,
    pub(crate) variables: Map<String, Value>,
    pub(crate) installed_packages: Vec<String>,
    pub(crate) container: Option<ContainerRef>,
    pub(crate) vfs: VirtualFileSystem,
    pub(crate) execution_count: u64,
    pub(crate) metadata: BTreeMap<String, String>,
    pub(crate) workspace: Option<SessionWorkspace>,
}

impl SessionState {
    pub(crate) fn touch(&mut self) {
        self.last_activity = Utc::now();
    }

    pub fn variables(&self) -> &Map<String, Value> {
        &self.variables
    }

    pub fn vfs(&self) -> &VirtualFileSystem {
        &self.vfs
    }

    pub fn vfs_mut(&mut self) -> &mut VirtualFileSystem {
        &mut self.vfs
    }

    pub fn container(&self) -> Option<&ContainerRef> {
        self.container.as_ref()
    }

    pub(crate) fn workspace_path(&self) -> Result<PathBuf> {
        self.workspace
            .as_ref()
            .map(|w| w.path().to_path_buf())
            .ok_or_else(|| SandboxError::InternalError("session workspace is gone".into()))
    }
}

pub struct Session {
    id: String,
    container_name: String,
    created_at: DateTime<Utc>,
    limits: ResourceLimits,
    state: RwLock<SessionState>,
    exec_lock: Arc<Mutex<()>>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("container_name", &self.container_name)
            .field("created_at", &self.created_at)
            .field("limits", &self.limits)
            .finish_non_exhaustive()
    }
}

/// Held for the duration of one execution in a session
pub struct ExecutionPermit {
    _guard: OwnedMutexGuard<()>,
}

impl Session {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn container_name(&self) -> &str {
        &self.container_name
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn limits(&self) -> &ResourceLimits {
        &self.limits
    }

    pub fn state(&self) -> &RwLock<SessionState> {
        &self.state
    }

    pub fn is_executing(&self) -> bool {
        self.exec_lock.try_lock().is_err()
    }

    /// Admit one execution; a second concurrent one is rejected.
    pub fn try_begin_execution(&self) -> Result<ExecutionPermit> {
        self.exec_lock
            .clone()
            .try_lock_owned()
            .map(|guard| ExecutionPermit { _guard: guard })
            .map_err(|_| SandboxError::SessionBusy(self.id.clone()))
    }

    pub async fn status(&self) -> SessionStatus {
        let status = self.state.read().await.status;
        if status == SessionStatus::Ready && self.is_executing() {
            SessionStatus::Executing
        } else {
            status
        }
    }

    pub async fn info(&self) -> SessionInfo {
        let status = self.status().await;
        let state = self.state.read().await;
        let mut variable_names: Vec<String> = state.variables.keys().cloned().collect();
        variable_names.sort();
        SessionInfo {
            id: self.id.clone(),
            status,
            created_at: self.created_at,
            last_activity: state.last_activity,
            execution_count: state.execution_count,
            installed_packages: state.installed_packages.clone(),
            variables: variable_names,
            container: state.container.clone(),
            metadata: state.metadata.clone(),
            limits: self.limits.clone(),
            files: state.vfs.usage(),
        }
    }
}

/// Serializable snapshot of a session
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub id: String,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub execution_count: u64,
    pub installed_packages: Vec<String>,
    /// Variable names; values are served separately
    pub variables: Vec<String>,
    pub container: Option<ContainerRef>,
    pub metadata: BTreeMap<String, String>,
    pub limits: ResourceLimits,
    pub files: VfsUsage,
}

/// Session ids end up in container and directory names.
fn validate_session_id(id: &str) -> Result<()> {
    let valid = !id.is_empty()
        && id.len() <= 64
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(SandboxError::InvalidRequest(format!(
            "invalid session id '{id}': use 1-64 characters from [A-Za-z0-9_-]"
        )))
    }
}

pub struct SessionManager {
    runtime: Arc<dyn ContainerRuntime>,
    config: LifecycleConfig,
    ceiling: ResourceLimits,
    vfs_limits: VfsLimits,
    sessions: DashMap<String, Arc<Session>>,
    events: broadcast::Sender<SandboxEvent>,
}

impl SessionManager {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        config: LifecycleConfig,
        ceiling: ResourceLimits,
        vfs_limits: VfsLimits,
        events: broadcast::Sender<SandboxEvent>,
    ) -> Self {
        Self {
            runtime,
            config,
            ceiling,
            vfs_limits,
            sessions: DashMap::new(),
            events,
        }
    }

    pub fn runtime(&self) -> &Arc<dyn ContainerRuntime> {
        &self.runtime
    }

    pub fn config(&self) -> &LifecycleConfig {
        &self.config
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    fn emit(&self, event: SandboxEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn new_session(&self, id: &str, options: &SessionOptions) -> Result<Session> {
        let container_name = format!("{}-{}", self.config.container_prefix, id);
        let workspace = SessionWorkspace::create(&self.config.workspace_base, &container_name)?;
        let limits =
            self.ceiling
                .with_overrides(options.max_memory, options.max_cpu, options.allow_networking);
        let now = Utc::now();
        Ok(Session {
            id: id.to_string(),
            container_name,
            created_at: now,
            limits,
            state: RwLock::new(SessionState {
                status: SessionStatus::Uninitialized,
                last_activity: now,
                variables: Map::new(),
                installed_packages: Vec::new(),
                container: None,
                vfs: VirtualFileSystem::new(self.vfs_limits),
                execution_count: 0,
                metadata: options.metadata.clone(),
                workspace: Some(workspace),
            }),
            exec_lock: Arc::new(Mutex::new(())),
        })
    }

    /// Return the session with the requested id (or a fresh one) with a
    /// running container. Idempotent for an existing id; a newly created
    /// session whose provisioning fails is discarded.
    pub async fn get_or_create_session(&self, options: SessionOptions) -> Result<Arc<Session>> {
        let id = match &options.session_id {
            Some(id) => {
                validate_session_id(id)?;
                id.clone()
            }
            None => uuid::Uuid::new_v4().to_string(),
        };

        let (session, created) = match self.sessions.entry(id.clone()) {
            Entry::Occupied(entry) => (entry.get().clone(), false),
            Entry::Vacant(entry) => {
                let session = Arc::new(self.new_session(&id, &options)?);
                entry.insert(session.clone());
                (session, true)
            }
        };

        match self.ensure_ready(&session).await {
            Ok(_) => Ok(session),
            Err(e) => {
                if created {
                    self.sessions.remove(&id);
                    let mut state = session.state.write().await;
                    state.status = SessionStatus::Destroyed;
                    if let Some(ws) = state.workspace.take() {
                        if let Err(err) = ws.remove() {
                            warn!("[SESSION] Failed to remove workspace of {}: {}", id, err);
                        }
                    }
                }
                Err(e)
            }
        }
    }

    pub fn get_session(&self, id: &str) -> Result<Arc<Session>> {
        self.sessions
            .get(id)
            .map(|s| s.clone())
            .ok_or_else(|| SandboxError::SessionNotFound(id.to_string()))
    }

    pub async fn list_sessions(&self) -> Vec<SessionInfo> {
        let sessions: Vec<Arc<Session>> = self.sessions.iter().map(|e| e.value().clone()).collect();
        let mut infos = Vec::with_capacity(sessions.len());
        for session in sessions {
            infos.push(session.info().await);
        }
        infos.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        infos
    }

    /// Containers currently provisioned, keyed by session id
    pub async fn live_containers(&self) -> Vec<(String, ContainerRef)> {
        let sessions: Vec<Arc<Session>> = self.sessions.iter().map(|e| e.value().clone()).collect();
        let mut live = Vec::new();
        for session in sessions {
            if let Some(container) = session.state.read().await.container.clone() {
                live.push((session.id.clone(), container));
            }
        }
        live
    }

    async fn check_alive(&self, container: &ContainerRef) -> Result<bool> {
        match self.runtime.is_running(container).await {
            Ok(running) => Ok(running),
            Err(e) => {
                debug!("[SESSION] Liveness check for {} failed, retrying: {}", container.name, e);
                self.runtime.is_running(container).await
            }
        }
    }

    /// Make sure the session has a running container, provisioning one if needed.
    pub async fn ensure_ready(&self, session: &Session) -> Result<ContainerRef> {
        let mut state = session.state.write().await;
        if !state.status.is_live() {
            return Err(SandboxError::SessionNotFound(session.id.clone()));
        }

        if let Some(container) = state.container.clone() {
            match self.check_alive(&container).await {
                Ok(true) => return Ok(container),
                Ok(false) => warn!("[SESSION] Container {} is gone; reprovisioning", container.name),
                Err(e) => warn!(
                    "[SESSION] Container {} unreachable ({}); reprovisioning",
                    container.name, e
                ),
            }
            state.container = None;
            state.status = SessionStatus::Uninitialized;
            if let Err(e) = self.runtime.remove(&container).await {
                warn!("[SESSION] Failed to remove {}: {}", container.name, e);
            }
        }

        state.status = SessionStatus::Provisioning;
        let spec = ContainerSpec {
            name: session.container_name.clone(),
            image: self.config.image.clone(),
            workspace: state.workspace_path()?,
            limits: session.limits.clone(),
            user: self.config.container_user.clone(),
            env: Vec::new(),
        };

        let attempts = 1 + self.config.provision_retries;
        let mut last_error = String::new();
        for attempt in 1..=attempts {
            match self.runtime.create(&spec).await {
                Ok(container) => {
                    info!(
                        "[SESSION] Session {} ready in {} ({})",
                        session.id,
                        container.name,
                        self.runtime.backend_name()
                    );
                    state.container = Some(container.clone());
                    state.status = SessionStatus::Ready;
                    state.touch();
                    self.emit(SandboxEvent::SessionCreated {
                        session_id: session.id.clone(),
                        container: container.name.clone(),
                    });
                    return Ok(container);
                }
                Err(e) => {
                    warn!(
                        "[SESSION] Provisioning {} failed (attempt {}/{}): {}",
                        spec.name, attempt, attempts, e
                    );
                    // Clear any half-created container so the name is free for the retry.
                    let _ = self.runtime.remove_by_name(&spec.name).await;
                    last_error = match e {
                        SandboxError::ProvisioningError(reason) => reason,
                        other => other.to_string(),
                    };
                }
            }
        }

        state.status = SessionStatus::Uninitialized;
        Err(SandboxError::ProvisioningError(last_error))
    }

    /// Drop a container that cannot be trusted anymore. Variables and files
    /// stay; the next execution provisions a new one.
    pub async fn release_container(&self, session: &Session) {
        let mut state = session.state.write().await;
        if let Some(container) = state.container.take() {
            warn!("[SESSION] Releasing container {} of {}", container.name, session.id);
            if let Err(e) = self.runtime.remove(&container).await {
                warn!("[SESSION] Failed to remove {}: {}", container.name, e);
            }
        }
        if state.status.is_live() {
            state.status = SessionStatus::Uninitialized;
        }
    }

    pub async fn destroy_session(&self, id: &str, reason: DestroyReason) -> Result<()> {
        let (_, session) = self
            .sessions
            .remove(id)
            .ok_or_else(|| SandboxError::SessionNotFound(id.to_string()))?;
        self.finish_destroy(&session, reason).await;
        Ok(())
    }

    async fn finish_destroy(&self, session: &Session, reason: DestroyReason) {
        self.teardown(session).await;
        info!("[SESSION] Destroyed session {} ({:?})", session.id, reason);
        self.emit(SandboxEvent::SessionDestroyed {
            session_id: session.id.clone(),
            reason,
        });
    }

    async fn teardown(&self, session: &Session) {
        let mut state = session.state.write().await;
        state.status = SessionStatus::Terminating;
        if let Some(container) = state.container.take() {
            if let Err(e) = self.runtime.remove(&container).await {
                warn!("[SESSION] Failed to remove {}: {}", container.name, e);
            }
        }
        if let Some(ws) = state.workspace.take() {
            if let Err(e) = ws.remove() {
                warn!("[SESSION] Failed to remove workspace of {}: {}", session.id, e);
            }
        }
        state.status = SessionStatus::Destroyed;
    }

    /// Merge metadata; `None` values delete keys.
    pub async fn update_metadata(
        &self,
        id: &str,
        patch: BTreeMap<String, Option<String>>,
    ) -> Result<SessionInfo> {
        let session = self.get_session(id)?;
        {
            let mut state = session.state.write().await;
            for (key, value) in patch {
                match value {
                    Some(value) => {
                        state.metadata.insert(key, value);
                    }
                    None => {
                        state.metadata.remove(&key);
                    }
                }
            }
            state.touch();
        }
        Ok(session.info().await)
    }

    /// Destroy sessions idle for longer than the configured timeout.
    ///
    /// Each candidate is torn down while holding its execution permit, so an
    /// execution is either already running (and the session is skipped) or
    /// gets `SessionBusy` and then finds the session gone.
    pub async fn sweep_idle(&self) -> Vec<String> {
        let idle_timeout = self.config.idle_timeout();
        let sessions: Vec<Arc<Session>> = self.sessions.iter().map(|e| e.value().clone()).collect();

        let mut destroyed = Vec::new();
        for session in sessions {
            let Ok(_permit) = session.try_begin_execution() else {
                continue;
            };
            let last_activity = session.state.read().await.last_activity;
            let idle = (Utc::now() - last_activity)
                .to_std()
                .map(|elapsed| elapsed >= idle_timeout)
                .unwrap_or(false);
            if !idle {
                continue;
            }
            // The id may have been destroyed and reused since the snapshot.
            let removed = self
                .sessions
                .remove_if(&session.id, |_, current| Arc::ptr_eq(current, &session));
            if removed.is_none() {
                debug!("[SESSION] Idle sweep skipped {}: no longer registered", session.id);
                continue;
            }
            self.finish_destroy(&session, DestroyReason::Idle).await;
            destroyed.push(session.id.clone());
        }
        if !destroyed.is_empty() {
            info!("[SESSION] Idle sweep destroyed {} session(s)", destroyed.len());
        }
        destroyed
    }

    fn owns(&self, name: &str) -> bool {
        self.sessions.iter().any(|e| e.value().container_name == name)
    }

    /// Remove managed containers and workspace directories that no live
    /// session owns.
    ///
    /// Ownership is checked after listing. A session registers before its
    /// workspace or container exists, so anything listed that belongs to a
    /// session created meanwhile is already visible in the registry.
    pub async fn sweep_orphans(&self) -> Result<Vec<String>> {
        let prefix = format!("{}-", self.config.container_prefix);

        let mut removed = Vec::new();
        for name in self.runtime.list(&prefix).await? {
            if self.owns(&name) {
                continue;
            }
            match self.runtime.remove_by_name(&name).await {
                Ok(()) => {
                    info!("[SESSION] Removed orphan container {}", name);
                    self.emit(SandboxEvent::OrphanRemoved { name: name.clone() });
                    removed.push(name);
                }
                Err(e) => warn!("[SESSION] Failed to remove orphan {}: {}", name, e),
            }
        }

        for name in workspace::list_workspaces(&self.config.workspace_base, &prefix)? {
            if self.owns(&name) {
                continue;
            }
            let path = self.config.workspace_base.join(&name);
            match std::fs::remove_dir_all(&path) {
                Ok(()) => {
                    info!("[SESSION] Removed orphan workspace {:?}", path);
                    if !removed.contains(&name) {
                        self.emit(SandboxEvent::OrphanRemoved { name: name.clone() });
                        removed.push(name);
                    }
                }
                Err(e) => warn!("[SESSION] Failed to remove orphan workspace {:?}: {}", path, e),
            }
        }
        Ok(removed)
    }

    /// Destroy every session.
    pub async fn shutdown(&self) {
        let ids: Vec<String> = self.sessions.iter().map(|e| e.key().clone()).collect();
        info!("[SESSION] Shutting down {} session(s)", ids.len());
        for id in ids {
            if let Err(e) = self.destroy_session(&id, DestroyReason::Shutdown).await {
                debug!("[SESSION] Shutdown skipped {}: {}", id, e);
            }
        }
    }

    /// Run the idle and orphan sweeps until `cancel` fires.
    pub fn spawn_sweepers(self: &Arc<Self>, cancel: CancellationToken) -> Vec<JoinHandle<()>> {
        let idle = {
            let manager = self.clone();
            let cancel = cancel.clone();
            let every = Duration::from_secs(self.config.sweep_interval_secs.max(1));
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(every);
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = ticker.tick() => {
                            manager.sweep_idle().await;
                        }
                    }
                }
                debug!("[SESSION] Idle sweeper stopped");
            })
        };

        let orphans = {
            let manager = self.clone();
            let every = Duration::from_secs(self.config.orphan_sweep_interval_secs.max(1));
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(every);
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = ticker.tick() => {
                            if let Err(e) = manager.sweep_orphans().await {
                                warn!("[SESSION] Orphan sweep failed: {}", e);
                            }
                        }
                    }
                }
                debug!("[SESSION] Orphan sweeper stopped");
            })
        };

        vec![idle, orphans]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::scripted::ScriptedRuntime;

    fn manager_with(runtime: Arc<ScriptedRuntime>, base: &std::path::Path) -> SessionManager {
        let config = LifecycleConfig {
            workspace_base: base.to_path_buf(),
            ..LifecycleConfig::default()
        };
        let (events, _) = broadcast::channel(16);
        SessionManager::new(
            runtime,
            config,
            ResourceLimits::default(),
            VfsLimits::default(),
            events,
        )
    }

    fn named(id: &str) -> SessionOptions {
        SessionOptions {
            session_id: Some(id.to_string()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn get_or_create_is_idempotent() {
        let base = tempfile::tempdir().unwrap();
        let runtime = Arc::new(ScriptedRuntime::new());
        let manager = manager_with(runtime.clone(), base.path());

        let first = manager.get_or_create_session(named("s1")).await.unwrap();
        let second = manager.get_or_create_session(named("s1")).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(runtime.created_count(), 1);
        assert_eq!(first.status().await, SessionStatus::Ready);
        assert_eq!(manager.session_count(), 1);
    }

    #[tokio::test]
    async fn provisioning_is_retried_once() {
        let base = tempfile::tempdir().unwrap();
        let runtime = Arc::new(ScriptedRuntime::new().failing_creates(1));
        let manager = manager_with(runtime.clone(), base.path());

        let session = manager.get_or_create_session(named("retry")).await.unwrap();
        assert_eq!(session.status().await, SessionStatus::Ready);
    }

    #[tokio::test]
    async fn failed_provisioning_leaves_no_session() {
        let base = tempfile::tempdir().unwrap();
        let runtime = Arc::new(ScriptedRuntime::new().failing_creates(2));
        let manager = manager_with(runtime, base.path());

        let err = manager.get_or_create_session(named("doomed")).await.unwrap_err();
        assert_eq!(err.kind(), "ProvisioningError");
        assert_eq!(manager.session_count(), 0);
        assert!(matches!(
            manager.get_session("doomed"),
            Err(SandboxError::SessionNotFound(_))
        ));
        assert!(!base.path().join("pysandbox-session-doomed").exists());
    }

    #[tokio::test]
    async fn rejects_unsafe_ids() {
        let base = tempfile::tempdir().unwrap();
        let manager = manager_with(Arc::new(ScriptedRuntime::new()), base.path());
        let err = manager.get_or_create_session(named("../etc")).await.unwrap_err();
        assert_eq!(err.kind(), "InvalidRequest");
    }

    #[tokio::test]
    async fn executing_is_exclusive() {
        let base = tempfile::tempdir().unwrap();
        let manager = manager_with(Arc::new(ScriptedRuntime::new()), base.path());
        let session = manager.get_or_create_session(named("busy")).await.unwrap();

        let permit = session.try_begin_execution().unwrap();
        assert_eq!(session.status().await, SessionStatus::Executing);
        assert!(matches!(
            session.try_begin_execution(),
            Err(SandboxError::SessionBusy(_))
        ));
        drop(permit);
        assert_eq!(session.status().await, SessionStatus::Ready);
    }

    #[tokio::test]
    async fn dead_container_is_reprovisioned() {
        let base = tempfile::tempdir().unwrap();
        let runtime = Arc::new(ScriptedRuntime::new());
        let manager = manager_with(runtime.clone(), base.path());
        let session = manager.get_or_create_session(named("phoenix")).await.unwrap();

        runtime.kill("pysandbox-session-phoenix");
        manager.ensure_ready(&session).await.unwrap();
        assert_eq!(runtime.created_count(), 2);
        assert_eq!(session.status().await, SessionStatus::Ready);
    }

    #[tokio::test]
    async fn release_keeps_state() {
        let base = tempfile::tempdir().unwrap();
        let runtime = Arc::new(ScriptedRuntime::new());
        let manager = manager_with(runtime.clone(), base.path());
        let session = manager.get_or_create_session(named("rel")).await.unwrap();
        session
            .state()
            .write()
            .await
            .variables
            .insert("a".into(), Value::from(5));

        manager.release_container(&session).await;
        assert_eq!(session.status().await, SessionStatus::Uninitialized);
        assert!(session.state().read().await.container().is_none());
        assert_eq!(session.state().read().await.variables()["a"], Value::from(5));
        assert_eq!(runtime.running_count(), 0);
    }

    #[tokio::test]
    async fn destroy_removes_container_and_workspace() {
        let base = tempfile::tempdir().unwrap();
        let runtime = Arc::new(ScriptedRuntime::new());
        let (events, mut rx) = broadcast::channel(16);
        let manager = SessionManager::new(
            runtime.clone(),
            LifecycleConfig {
                workspace_base: base.path().to_path_buf(),
                ..LifecycleConfig::default()
            },
            ResourceLimits::default(),
            VfsLimits::default(),
            events,
        );
        let session = manager.get_or_create_session(named("gone")).await.unwrap();
        manager.destroy_session("gone", DestroyReason::Requested).await.unwrap();

        assert_eq!(session.status().await, SessionStatus::Destroyed);
        assert_eq!(runtime.removed_names(), vec!["pysandbox-session-gone".to_string()]);
        assert!(!base.path().join("pysandbox-session-gone").exists());
        assert!(matches!(rx.recv().await.unwrap(), SandboxEvent::SessionCreated { .. }));
        assert!(matches!(
            rx.recv().await.unwrap(),
            SandboxEvent::SessionDestroyed {
                reason: DestroyReason::Requested,
                ..
            }
        ));
        assert!(manager.destroy_session("gone", DestroyReason::Requested).await.is_err());
    }

    #[tokio::test]
    async fn idle_sweep_skips_executing_sessions() {
        let base = tempfile::tempdir().unwrap();
        let runtime = Arc::new(ScriptedRuntime::new());
        let config = LifecycleConfig {
            workspace_base: base.path().to_path_buf(),
            idle_timeout_secs: 0,
            ..LifecycleConfig::default()
        };
        let (events, _) = broadcast::channel(16);
        let manager = SessionManager::new(
            runtime,
            config,
            ResourceLimits::default(),
            VfsLimits::default(),
            events,
        );
        let idle = manager.get_or_create_session(named("idle")).await.unwrap();
        let busy = manager.get_or_create_session(named("busy")).await.unwrap();
        let _permit = busy.try_begin_execution().unwrap();

        let destroyed = manager.sweep_idle().await;
        assert_eq!(destroyed, vec!["idle".to_string()]);
        assert_eq!(idle.status().await, SessionStatus::Destroyed);
        assert!(manager.get_session("busy").is_ok());
    }

    #[tokio::test]
    async fn orphan_sweep_spares_live_sessions() {
        let base = tempfile::tempdir().unwrap();
        let runtime = Arc::new(ScriptedRuntime::new());
        let manager = manager_with(runtime.clone(), base.path());
        manager.get_or_create_session(named("live")).await.unwrap();

        let stray_ws = base.path().join("pysandbox-session-stray");
        std::fs::create_dir_all(&stray_ws).unwrap();
        runtime.adopt("pysandbox-session-stray", &stray_ws);
        runtime.adopt("unrelated-container", base.path());

        let removed = manager.sweep_orphans().await.unwrap();
        assert_eq!(removed, vec!["pysandbox-session-stray".to_string()]);
        assert!(!stray_ws.exists());
        assert!(base.path().join("pysandbox-session-live").exists());
        let mut running = runtime.list("").await.unwrap();
        running.sort();
        assert_eq!(
            running,
            vec!["pysandbox-session-live".to_string(), "unrelated-container".to_string()]
        );
    }

    #[tokio::test]
    async fn orphan_sweep_spares_sessions_created_while_listing() {
        let base = tempfile::tempdir().unwrap();
        let runtime = Arc::new(
            ScriptedRuntime::new().with_management_delay(Duration::from_millis(200)),
        );
        let manager = Arc::new(manager_with(runtime.clone(), base.path()));

        let sweep = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.sweep_orphans().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        manager.get_or_create_session(named("fresh")).await.unwrap();

        let removed = sweep.await.unwrap().unwrap();
        assert!(removed.is_empty());
        assert!(base.path().join("pysandbox-session-fresh").exists());
        let session = manager.get_session("fresh").unwrap();
        manager.ensure_ready(&session).await.unwrap();
        assert_eq!(runtime.created_count(), 1);
        assert!(runtime.removed_names().is_empty());
    }

    #[tokio::test]
    async fn idle_sweep_holds_the_execution_permit_while_destroying() {
        let base = tempfile::tempdir().unwrap();
        let runtime = Arc::new(
            ScriptedRuntime::new().with_management_delay(Duration::from_millis(200)),
        );
        let (events, _) = broadcast::channel(16);
        let manager = Arc::new(SessionManager::new(
            runtime,
            LifecycleConfig {
                workspace_base: base.path().to_path_buf(),
                idle_timeout_secs: 0,
                ..LifecycleConfig::default()
            },
            ResourceLimits::default(),
            VfsLimits::default(),
            events,
        ));
        let session = manager.get_or_create_session(named("late")).await.unwrap();

        let sweep = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.sweep_idle().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(matches!(
            session.try_begin_execution(),
            Err(SandboxError::SessionBusy(_))
        ));

        assert_eq!(sweep.await.unwrap(), vec!["late".to_string()]);
        let _permit = session.try_begin_execution().unwrap();
        assert!(matches!(
            manager.ensure_ready(&session).await,
            Err(SandboxError::SessionNotFound(_))
        ));
        assert_eq!(session.status().await, SessionStatus::Destroyed);
    }

    #[tokio::test]
    async fn overrides_are_clamped_to_ceiling() {
        let base = tempfile::tempdir().unwrap();
        let manager = manager_with(Arc::new(ScriptedRuntime::new()), base.path());
        let session = manager
            .get_or_create_session(SessionOptions {
                session_id: Some("big".into()),
                max_memory: Some(64 * 1024),
                max_cpu: Some(0.5),
                allow_networking: Some(true),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(session.limits().memory_mb, 512);
        assert_eq!(session.limits().cpus, 0.5);
        assert!(session.limits().allow_networking);
    }

    #[tokio::test]
    async fn metadata_patch_merges_and_deletes() {
        let base = tempfile::tempdir().unwrap();
        let manager = manager_with(Arc::new(ScriptedRuntime::new()), base.path());
        let mut options = named("meta");
        options.metadata.insert("owner".into(), "alice".into());
        options.metadata.insert("stale".into(), "x".into());
        manager.get_or_create_session(options).await.unwrap();

        let mut patch = BTreeMap::new();
        patch.insert("project".to_string(), Some("demo".to_string()));
        patch.insert("stale".to_string(), None);
        let info = manager.update_metadata("meta", patch).await.unwrap();
        assert_eq!(info.metadata.get("owner").map(String::as_str), Some("alice"));
        assert_eq!(info.metadata.get("project").map(String::as_str), Some("demo"));
        assert!(!info.metadata.contains_key("stale"));
    }
}
