use crate::analyzer::StaticAnalyzer;
use crate::config::{RuntimeBackend, SandboxConfig, SecurityProfile};
use crate::engine::ExecutionEngine;
use crate::errors::{Result, SandboxError};
use crate::monitor::ResourceMonitor;
use crate::packages::PackageManager;
use crate::policy::SecurityPolicy;
use crate::runtime::docker::DockerRuntime;
use crate::runtime::local::LocalProcessRuntime;
use crate::runtime::ContainerRuntime;
use crate::sandbox::Sandbox;
use crate::security::SecurityValidator;
use crate::session::SessionManager;
use crate::validation::CodeValidator;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::info;

/// pip gets this long per install call
const PACKAGE_INSTALL_TIMEOUT: Duration = Duration::from_secs(300);
const EVENT_CAPACITY: usize = 256;

/// Assembles a [`Sandbox`] from configuration.
pub struct SandboxBuilder {
    config: SandboxConfig,
    runtime: Option<Arc<dyn ContainerRuntime>>,
    policy: Option<SecurityPolicy>,
}

impl SandboxBuilder {
    pub fn new(config: SandboxConfig) -> Self {
        Self {
            config,
            runtime: None,
            policy: None,
        }
    }

    /// Use this runtime instead of the configured backend
    pub fn with_runtime(mut self, runtime: Arc<dyn ContainerRuntime>) -> Self {
        self.runtime = Some(runtime);
        self
    }

    /// Replace the policy derived from the security profile
    pub fn with_policy(mut self, policy: SecurityPolicy) -> Self {
        self.policy = Some(policy);
        self
    }

    fn default_runtime(config: &SandboxConfig) -> Result<Arc<dyn ContainerRuntime>> {
        Ok(match config.lifecycle.backend {
            RuntimeBackend::Docker => Arc::new(DockerRuntime::new()),
            RuntimeBackend::Local => match &config.lifecycle.python_path {
                Some(path) => Arc::new(LocalProcessRuntime::with_python_path(path.clone())),
                None => Arc::new(LocalProcessRuntime::new()?),
            },
        })
    }

    /// Build the sandbox. Fails when the selected backend is not usable.
    pub async fn build(self) -> Result<Sandbox> {
        let config = self.config;
        let runtime = match self.runtime {
            Some(runtime) => runtime,
            None => Self::default_runtime(&config)?,
        };
        if !runtime.is_available().await {
            return Err(SandboxError::ProvisioningError(format!(
                "{} runtime is not available",
                runtime.backend_name()
            )));
        }

        std::fs::create_dir_all(&config.lifecycle.workspace_base)?;

        let policy = Arc::new(
            self.policy
                .unwrap_or_else(|| SecurityPolicy::from_config(&config)),
        );
        let ceiling = match config.security_profile {
            SecurityProfile::Strict => config.security_profile.resource_limits(),
            _ => config.limits.clone(),
        };

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let security = Arc::new(SecurityValidator::new(policy.clone()));
        let analyzer = Arc::new(StaticAnalyzer::new());
        let sessions = Arc::new(SessionManager::new(
            runtime.clone(),
            config.lifecycle.clone(),
            ceiling,
            config.vfs,
            events.clone(),
        ));
        let packages = Arc::new(PackageManager::new(
            runtime.clone(),
            security.clone(),
            config.execution.allowed_packages.clone(),
            PACKAGE_INSTALL_TIMEOUT,
        ));
        let monitor = Arc::new(ResourceMonitor::new(
            config.monitor.clone(),
            runtime.clone(),
            sessions.clone(),
            config.lifecycle.workspace_base.clone(),
            events.clone(),
        ));
        let engine = Arc::new(ExecutionEngine::new(
            security.clone(),
            analyzer.clone(),
            sessions.clone(),
            packages.clone(),
            Some(monitor.clone()),
            config.execution.clone(),
            events.clone(),
        ));
        let validator = Arc::new(CodeValidator::new(security, analyzer));

        info!(
            "[SANDBOX] Built with policy '{}' on {} backend",
            policy.name,
            runtime.backend_name()
        );

        Ok(Sandbox {
            limiter: Arc::new(Semaphore::new(config.execution.max_concurrent.max(1))),
            config,
            runtime,
            sessions,
            engine,
            packages,
            validator,
            monitor,
            events,
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        })
    }
}
