use crate::engine::ExecutionResult;
use crate::errors::SandboxError;
use crate::vfs::VfsError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

/// A [`SandboxError`] on its way to the client, rendered as a failed
/// `ExecutionResult` body.
#[derive(Debug)]
pub struct ApiError {
    pub error: SandboxError,
    pub session_id: Option<String>,
    pub execution_id: Option<String>,
}

impl ApiError {
    pub fn for_execution(
        error: SandboxError,
        session_id: Option<String>,
        execution_id: String,
    ) -> Self {
        Self {
            error,
            session_id,
            execution_id: Some(execution_id),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        SandboxError::InvalidRequest(message.into()).into()
    }
}

impl From<SandboxError> for ApiError {
    fn from(error: SandboxError) -> Self {
        Self {
            error,
            session_id: None,
            execution_id: None,
        }
    }
}

pub fn status_for(error: &SandboxError) -> StatusCode {
    match error {
        SandboxError::SecurityViolation { .. }
        | SandboxError::AnalysisViolation { .. }
        | SandboxError::InvalidRequest(_)
        | SandboxError::PackageBlocked(_) => StatusCode::BAD_REQUEST,
        SandboxError::SessionNotFound(_) => StatusCode::NOT_FOUND,
        SandboxError::SessionBusy(_) => StatusCode::CONFLICT,
        SandboxError::CapacityExceeded(_) => StatusCode::TOO_MANY_REQUESTS,
        SandboxError::FileSystem(VfsError::NotFound(_)) => StatusCode::NOT_FOUND,
        SandboxError::FileSystem(e) if e.is_quota() => StatusCode::PAYLOAD_TOO_LARGE,
        SandboxError::FileSystem(VfsError::Io(_)) => StatusCode::INTERNAL_SERVER_ERROR,
        SandboxError::FileSystem(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.error);
        if status.is_server_error() {
            tracing::warn!("[HTTP] {} ({})", self.error, self.error.kind());
        }
        let body = ExecutionResult::from_error(
            &self.error,
            self.session_id,
            self.execution_id.unwrap_or_default(),
        );
        (status, Json(body)).into_response()
    }
}
