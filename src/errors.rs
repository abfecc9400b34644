use thiserror::Error;

pub type Result<T> = std::result::Result<T, SandboxError>;

#[derive(Error, Debug)]
pub enum SandboxError {
    /// Code rejected by the security validator before any container was touched.
    #[error("Security violation: {}", .violations.join("; "))]
    SecurityViolation { violations: Vec<String> },

    /// Code rejected by the static analyzer for a high-risk pattern.
    #[error("Analysis violation: {}", .risks.join("; "))]
    AnalysisViolation { risks: Vec<String> },

    #[error("Execution timeout exceeded ({seconds}s)")]
    Timeout { seconds: u64 },

    #[error("Capacity exceeded: {0}")]
    CapacityExceeded(String),

    /// The runner finished but its structured result line was missing or malformed.
    #[error("Failed to parse execution result: {reason}")]
    ResultParseError {
        reason: String,
        stdout: String,
        stderr: String,
    },

    #[error("Container provisioning failed: {0}")]
    ProvisioningError(String),

    #[error("Resource query failed: {0}")]
    ResourceQueryError(String),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Session {0} is already executing")]
    SessionBusy(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Package not allowed: {}", .0.join(", "))]
    PackageBlocked(Vec<String>),

    #[error("Package installation failed: {0}")]
    PackageInstallError(String),

    #[error("File system error: {0}")]
    FileSystem(#[from] crate::vfs::VfsError),

    #[error("Container runtime error: {0}")]
    RuntimeError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    InternalError(String),
}

impl SandboxError {
    /// Stable name reported as `error.type` on the wire.
    pub fn kind(&self) -> &'static str {
        match self {
            SandboxError::SecurityViolation { .. } => "SecurityViolation",
            SandboxError::AnalysisViolation { .. } => "AnalysisViolation",
            SandboxError::Timeout { .. } => "Timeout",
            SandboxError::CapacityExceeded(_) => "CapacityExceeded",
            SandboxError::ResultParseError { .. } => "ResultParseError",
            SandboxError::ProvisioningError(_) => "ProvisioningError",
            SandboxError::ResourceQueryError(_) => "ResourceQueryError",
            SandboxError::SessionNotFound(_) => "SessionNotFound",
            SandboxError::SessionBusy(_) => "SessionBusy",
            SandboxError::InvalidRequest(_) => "InvalidRequest",
            SandboxError::PackageBlocked(_) => "PackageBlocked",
            SandboxError::PackageInstallError(_) => "PackageInstallError",
            SandboxError::FileSystem(err) if err.is_quota() => "QuotaExceeded",
            SandboxError::FileSystem(_) => "FileSystemError",
            SandboxError::RuntimeError(_) => "RuntimeError",
            SandboxError::IoError(_) | SandboxError::JsonError(_) | SandboxError::InternalError(_) => {
                "InternalError"
            }
        }
    }

    /// Structured detail attached to the error body, when the variant carries any.
    pub fn details(&self) -> Option<serde_json::Value> {
        match self {
            SandboxError::SecurityViolation { violations } => {
                Some(serde_json::json!({ "violations": violations }))
            }
            SandboxError::AnalysisViolation { risks } => Some(serde_json::json!({ "risks": risks })),
            SandboxError::Timeout { seconds } => Some(serde_json::json!({ "timeout": seconds })),
            SandboxError::ResultParseError { stdout, stderr, .. } => {
                Some(serde_json::json!({ "stdout": stdout, "stderr": stderr }))
            }
            SandboxError::PackageBlocked(packages) => {
                Some(serde_json::json!({ "blocked": packages }))
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_match_wire_names() {
        let err = SandboxError::SecurityViolation {
            violations: vec!["import os".into()],
        };
        assert_eq!(err.kind(), "SecurityViolation");
        assert_eq!(SandboxError::Timeout { seconds: 3 }.kind(), "Timeout");
        assert_eq!(
            SandboxError::CapacityExceeded("full".into()).kind(),
            "CapacityExceeded"
        );
    }

    #[test]
    fn vfs_quota_errors_are_distinct_from_admission() {
        let err: SandboxError = crate::vfs::VfsError::FileCountExceeded { limit: 1 }.into();
        assert_eq!(err.kind(), "QuotaExceeded");
        assert_ne!(err.kind(), SandboxError::CapacityExceeded("full".into()).kind());

        let err: SandboxError = crate::vfs::VfsError::NotFound("/a".into()).into();
        assert_eq!(err.kind(), "FileSystemError");
    }

    #[test]
    fn parse_errors_carry_raw_output() {
        let err = SandboxError::ResultParseError {
            reason: "missing marker".into(),
            stdout: "hello".into(),
            stderr: "boom".into(),
        };
        let details = err.details().unwrap();
        assert_eq!(details["stdout"], "hello");
        assert_eq!(details["stderr"], "boom");
    }
}
