use clap::Parser;
use pysandbox::{
    router, RuntimeBackend, SandboxBuilder, SandboxConfig, SecurityProfile,
};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

/// HTTP service that runs untrusted Python in per-session containers
#[derive(Debug, Parser)]
#[command(name = "pysandbox-server", version)]
struct Args {
    /// Address to listen on
    #[arg(long, env = "PYSANDBOX_BIND", default_value = "127.0.0.1:8080")]
    bind: SocketAddr,

    /// JSON config file; flags below override its values
    #[arg(long, env = "PYSANDBOX_CONFIG")]
    config: Option<PathBuf>,

    /// Container backend: docker or local
    #[arg(long, env = "PYSANDBOX_BACKEND", value_parser = parse_backend)]
    backend: Option<RuntimeBackend>,

    /// Security profile: blacklist, data_science or strict
    #[arg(long, env = "PYSANDBOX_PROFILE", value_parser = parse_profile)]
    profile: Option<SecurityProfile>,

    /// Container image for the docker backend
    #[arg(long, env = "PYSANDBOX_IMAGE")]
    image: Option<String>,

    /// Host directory for session workspaces
    #[arg(long, env = "PYSANDBOX_WORKSPACE_BASE")]
    workspace_base: Option<PathBuf>,

    /// Interpreter for the local backend
    #[arg(long, env = "PYSANDBOX_PYTHON")]
    python: Option<PathBuf>,

    #[arg(long, env = "PYSANDBOX_MAX_CONCURRENT")]
    max_concurrent: Option<usize>,

    /// Default execution timeout in seconds
    #[arg(long, env = "PYSANDBOX_TIMEOUT")]
    timeout: Option<u64>,

    /// Idle session lifetime in seconds
    #[arg(long, env = "PYSANDBOX_IDLE_TIMEOUT")]
    idle_timeout: Option<u64>,

    /// Comma separated packages that may be installed; anything when unset
    #[arg(long, env = "PYSANDBOX_ALLOWED_PACKAGES", value_delimiter = ',')]
    allowed_packages: Option<Vec<String>>,

    /// Comma separated modules refused on top of the profile
    #[arg(long, env = "PYSANDBOX_BLOCKED_MODULES", value_delimiter = ',')]
    blocked_modules: Option<Vec<String>>,
}

fn parse_backend(s: &str) -> Result<RuntimeBackend, String> {
    RuntimeBackend::parse(s).ok_or_else(|| format!("unknown backend '{s}'"))
}

fn parse_profile(s: &str) -> Result<SecurityProfile, String> {
    SecurityProfile::parse(s).ok_or_else(|| format!("unknown security profile '{s}'"))
}

impl Args {
    fn into_config(self) -> anyhow::Result<(SocketAddr, SandboxConfig)> {
        let mut config = match &self.config {
            Some(path) => SandboxConfig::from_file(path)?,
            None => SandboxConfig::default(),
        };
        if let Some(backend) = self.backend {
            config.lifecycle.backend = backend;
        }
        if let Some(profile) = self.profile {
            config.security_profile = profile;
        }
        if let Some(image) = self.image {
            config.lifecycle.image = image;
        }
        if let Some(base) = self.workspace_base {
            config.lifecycle.workspace_base = base;
        }
        if let Some(python) = self.python {
            config.lifecycle.python_path = Some(python);
        }
        if let Some(max) = self.max_concurrent {
            config.execution.max_concurrent = max;
        }
        if let Some(timeout) = self.timeout {
            config.execution.default_timeout_secs = timeout;
        }
        if let Some(idle) = self.idle_timeout {
            config.lifecycle.idle_timeout_secs = idle;
        }
        if let Some(packages) = self.allowed_packages {
            config.execution.allowed_packages = Some(packages);
        }
        if let Some(modules) = self.blocked_modules {
            config.always_blocked_modules.extend(modules);
        }
        Ok((self.bind, config))
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!("[SERVER] Failed to listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!("[SERVER] Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "pysandbox_server=info,pysandbox=info,tower_http=info".to_string()),
        )
        .with_target(false)
        .init();

    let (bind, config) = Args::parse().into_config()?;
    tracing::info!(
        "pysandbox-server starting (backend={:?}, profile={:?}: {}, workspaces={:?})",
        config.lifecycle.backend,
        config.security_profile,
        config.security_profile.description(),
        config.lifecycle.workspace_base
    );

    let sandbox = Arc::new(SandboxBuilder::new(config).build().await?);
    sandbox.start().await;

    let app = router(sandbox.clone());
    let listener = tokio::net::TcpListener::bind(bind).await?;
    tracing::info!("[SERVER] Listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("[SERVER] Shutting down");
    sandbox.shutdown().await;
    Ok(())
}
