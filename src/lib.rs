//! Python code-execution sandbox.
//!
//! Submitted code is screened by the [`SecurityValidator`] and
//! [`StaticAnalyzer`], then run by a generated runner script inside a
//! per-session container. Sessions keep variables, installed packages and a
//! quota-limited virtual file system across executions. [`Sandbox`] is the
//! entry point; [`server::router`] exposes it over HTTP.

pub mod analyzer;
pub mod config;
pub mod engine;
pub mod errors;
pub mod events;
pub mod hostfs;
pub mod monitor;
pub mod packages;
pub mod policy;
pub mod runner;
pub mod runtime;
pub mod sandbox;
pub mod sandbox_builder;
pub mod security;
pub mod server;
pub mod session;
pub mod validation;
pub mod vfs;
pub mod workspace;

pub use analyzer::{AnalysisResult, StaticAnalyzer};
pub use config::{
    ExecutionConfig, ImportPolicy, LifecycleConfig, MonitorConfig, ResourceLimits,
    RuntimeBackend, SandboxConfig, SecurityProfile, VfsLimits,
};
pub use engine::{ExecutionRequest, ExecutionResult};
pub use errors::{Result, SandboxError};
pub use events::{SandboxEvent, StreamEvent, StreamEventType};
pub use policy::SecurityPolicy;
pub use runtime::ContainerRuntime;
pub use sandbox::Sandbox;
pub use sandbox_builder::SandboxBuilder;
pub use security::{SecurityReport, SecurityValidator};
pub use server::router;
pub use session::{SessionInfo, SessionOptions, SessionStatus};
pub use vfs::VirtualFileSystem;
