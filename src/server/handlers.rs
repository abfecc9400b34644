use super::{ApiError, AppState};
use crate::engine::{ExecutionRequest, ExecutionResult};
use crate::monitor::SystemHealth;
use crate::packages::PackageReport;
use crate::runtime::ContainerMetrics;
use crate::sandbox::Sandbox;
use crate::session::{SessionInfo, SessionOptions};
use crate::validation::{ValidationReport, ValidationRequest};
use crate::vfs::VfsEntry;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use base64::engine::general_purpose::STANDARD as b64;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::convert::Infallible;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tracing::debug;

type ApiResult<T> = Result<T, ApiError>;

pub async fn health(State(state): State<AppState>) -> Json<SystemHealth> {
    Json(state.sandbox.health().await)
}

pub async fn execute(
    State(state): State<AppState>,
    Json(request): Json<ExecutionRequest>,
) -> ApiResult<Json<ExecutionResult>> {
    let execution_id = Sandbox::new_execution_id();
    let session_id = request.session_id.clone();
    state
        .sandbox
        .execute_as(request, execution_id.clone())
        .await
        .map(Json)
        .map_err(|e| ApiError::for_execution(e, session_id, execution_id))
}

pub async fn execute_stream(
    State(state): State<AppState>,
    Json(request): Json<ExecutionRequest>,
) -> ApiResult<Response> {
    let execution_id = Sandbox::new_execution_id();
    let session_id = request.session_id.clone();
    // Refusals before any output get a proper status code instead of a stream.
    let admission = state
        .sandbox
        .admit()
        .and_then(|admission| {
            state.sandbox.screen(&request.code)?;
            Ok(admission)
        })
        .map_err(|e| ApiError::for_execution(e, session_id, execution_id.clone()))?;

    let buffer = state.sandbox.config().execution.stream_buffer.max(1);
    let (tx, rx) = mpsc::channel(buffer);
    let sandbox = state.sandbox.clone();
    tokio::spawn(async move {
        if let Err(e) = sandbox
            .execute_stream(admission, request, execution_id, tx)
            .await
        {
            debug!("[HTTP] Streamed execution ended with {}", e.kind());
        }
    });

    let stream = ReceiverStream::new(rx).map(|event| {
        let data = serde_json::to_string(&event).unwrap_or_default();
        Ok::<Event, Infallible>(Event::default().event(event.event_type.as_str()).data(data))
    });
    Ok(Sse::new(stream)
        .keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
        .into_response())
}

pub async fn validate(
    State(state): State<AppState>,
    Json(request): Json<ValidationRequest>,
) -> Json<ValidationReport> {
    Json(state.sandbox.validate(&request))
}

pub async fn create_session(
    State(state): State<AppState>,
    Json(options): Json<SessionOptions>,
) -> ApiResult<(StatusCode, Json<SessionInfo>)> {
    let info = state.sandbox.create_session(options).await?;
    Ok((StatusCode::CREATED, Json(info)))
}

pub async fn list_sessions(State(state): State<AppState>) -> Json<Vec<SessionInfo>> {
    Json(state.sandbox.list_sessions().await)
}

pub async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<SessionInfo>> {
    Ok(Json(state.sandbox.get_session(&id).await?))
}

#[derive(Debug, Deserialize)]
pub struct SessionPatch {
    /// `null` values remove keys
    #[serde(default)]
    pub metadata: BTreeMap<String, Option<String>>,
}

pub async fn update_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(patch): Json<SessionPatch>,
) -> ApiResult<Json<SessionInfo>> {
    Ok(Json(state.sandbox.update_session(&id, patch.metadata).await?))
}

pub async fn delete_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    state.sandbox.destroy_session(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VariablesBody {
    pub session_id: String,
    pub variables: Map<String, Value>,
}

#[derive(Debug, Deserialize)]
pub struct VariablesUpdate {
    pub variables: Map<String, Value>,
}

#[derive(Debug, Deserialize)]
pub struct VariableNames {
    /// Comma separated; all variables when absent
    pub names: Option<String>,
}

pub async fn get_variables(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<VariablesBody>> {
    let variables = state.sandbox.get_variables(&id).await?;
    Ok(Json(VariablesBody {
        session_id: id,
        variables,
    }))
}

pub async fn put_variables(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(update): Json<VariablesUpdate>,
) -> ApiResult<Json<VariablesBody>> {
    let variables = state.sandbox.set_variables(&id, update.variables).await?;
    Ok(Json(VariablesBody {
        session_id: id,
        variables,
    }))
}

pub async fn delete_variables(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<VariableNames>,
) -> ApiResult<Json<VariablesBody>> {
    let names = query.names.map(|names| {
        names
            .split(',')
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .map(str::to_string)
            .collect()
    });
    let variables = state.sandbox.delete_variables(&id, names).await?;
    Ok(Json(VariablesBody {
        session_id: id,
        variables,
    }))
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ContentEncoding {
    Utf8,
    Base64,
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub path: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ReadQuery {
    pub encoding: Option<ContentEncoding>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileContent {
    pub path: String,
    pub content: String,
    pub encoding: ContentEncoding,
    pub size: u64,
    pub mime_type: String,
    pub checksum: String,
    pub modified: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct FileUpload {
    pub content: String,
    #[serde(default = "default_encoding")]
    pub encoding: ContentEncoding,
}

fn default_encoding() -> ContentEncoding {
    ContentEncoding::Utf8
}

pub async fn list_files(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<Vec<VfsEntry>>> {
    let path = query.path.unwrap_or_else(|| "/".to_string());
    Ok(Json(state.sandbox.list_files(&id, &path).await?))
}

pub async fn read_file(
    State(state): State<AppState>,
    Path((id, path)): Path<(String, String)>,
    Query(query): Query<ReadQuery>,
) -> ApiResult<Json<FileContent>> {
    let file = state.sandbox.read_file(&id, &format!("/{path}")).await?;
    let (content, encoding) = match query.encoding {
        Some(ContentEncoding::Base64) => (b64.encode(&file.content), ContentEncoding::Base64),
        Some(ContentEncoding::Utf8) => match String::from_utf8(file.content.clone()) {
            Ok(text) => (text, ContentEncoding::Utf8),
            Err(_) => {
                return Err(ApiError::bad_request(format!(
                    "{} is not valid UTF-8; request encoding=base64",
                    file.path
                )))
            }
        },
        None => match std::str::from_utf8(&file.content) {
            Ok(text) => (text.to_string(), ContentEncoding::Utf8),
            Err(_) => (b64.encode(&file.content), ContentEncoding::Base64),
        },
    };
    Ok(Json(FileContent {
        path: file.path,
        content,
        encoding,
        size: file.size,
        mime_type: file.mime_type,
        checksum: file.checksum,
        modified: file.modified,
    }))
}

pub async fn write_file(
    State(state): State<AppState>,
    Path((id, path)): Path<(String, String)>,
    Json(upload): Json<FileUpload>,
) -> ApiResult<(StatusCode, Json<VfsEntry>)> {
    let content = match upload.encoding {
        ContentEncoding::Utf8 => upload.content.into_bytes(),
        ContentEncoding::Base64 => b64
            .decode(upload.content.as_bytes())
            .map_err(|e| ApiError::bad_request(format!("invalid base64 content: {e}")))?,
    };
    let entry = state
        .sandbox
        .write_file(&id, &format!("/{path}"), content)
        .await?;
    Ok((StatusCode::CREATED, Json(entry)))
}

pub async fn delete_file(
    State(state): State<AppState>,
    Path((id, path)): Path<(String, String)>,
) -> ApiResult<StatusCode> {
    state.sandbox.delete_file(&id, &format!("/{path}")).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn session_metrics(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Option<ContainerMetrics>>> {
    Ok(Json(state.sandbox.session_metrics(&id).await?))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackagesRequest {
    pub session_id: String,
    pub packages: Vec<String>,
}

pub async fn install_packages(
    State(state): State<AppState>,
    Json(request): Json<PackagesRequest>,
) -> ApiResult<Json<PackageReport>> {
    Ok(Json(
        state
            .sandbox
            .install_packages(&request.session_id, &request.packages)
            .await?,
    ))
}

pub async fn uninstall_packages(
    State(state): State<AppState>,
    Json(request): Json<PackagesRequest>,
) -> ApiResult<Json<PackageReport>> {
    Ok(Json(
        state
            .sandbox
            .uninstall_packages(&request.session_id, &request.packages)
            .await?,
    ))
}
