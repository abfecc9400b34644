use super::router;
use crate::config::SandboxConfig;
use crate::runtime::scripted::ScriptedRuntime;
use crate::sandbox_builder::SandboxBuilder;
use anyhow::{anyhow, Result};
use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;

async fn test_router() -> Result<(Router, tempfile::TempDir)> {
    let base = tempfile::tempdir()?;
    let mut config = SandboxConfig::default();
    config.lifecycle.workspace_base = base.path().to_path_buf();
    let sandbox = SandboxBuilder::new(config)
        .with_runtime(Arc::new(ScriptedRuntime::new()))
        .build()
        .await?;
    Ok((router(Arc::new(sandbox)), base))
}

fn json_request(method: Method, uri: &str, body: Value) -> Result<Request<Body>> {
    Ok(Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_vec(&body)?))?)
}

fn empty_request(method: Method, uri: &str) -> Result<Request<Body>> {
    Ok(Request::builder()
        .method(method)
        .uri(uri)
        .body(Body::empty())?)
}

async fn response_json(response: axum::response::Response) -> Result<Value> {
    let bytes = response.into_body().collect().await?.to_bytes();
    Ok(serde_json::from_slice(&bytes)?)
}

async fn response_text(response: axum::response::Response) -> Result<String> {
    let bytes = response.into_body().collect().await?.to_bytes();
    Ok(String::from_utf8(bytes.to_vec())?)
}

#[tokio::test]
async fn execute_returns_variables_and_fresh_session() -> Result<()> {
    let (app, _base) = test_router().await?;
    let response = app
        .oneshot(json_request(
            Method::POST,
            "/execute",
            json!({"code": "x = 1 + 1"}),
        )?)
        .await?;
    assert_eq!(response.status(), StatusCode::OK);

    let body = response_json(response).await?;
    assert_eq!(body["success"], true);
    assert_eq!(body["output"]["variables"]["x"], 2);
    assert!(body["sessionId"].as_str().is_some_and(|s| !s.is_empty()));
    assert!(body["executionId"].as_str().is_some_and(|s| !s.is_empty()));
    Ok(())
}

#[tokio::test]
async fn security_violation_is_a_bad_request() -> Result<()> {
    let (app, _base) = test_router().await?;
    let response = app
        .oneshot(json_request(
            Method::POST,
            "/execute",
            json!({"code": "import os\nos.system('ls')"}),
        )?)
        .await?;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let body = response_json(response).await?;
    assert_eq!(body["success"], false);
    assert_eq!(body["error"]["type"], "SecurityViolation");
    assert!(body["error"]["details"]["violations"].is_array());
    assert!(body["executionId"].as_str().is_some_and(|s| !s.is_empty()));
    Ok(())
}

#[tokio::test]
async fn unknown_session_is_not_found() -> Result<()> {
    let (app, _base) = test_router().await?;
    let response = app
        .clone()
        .oneshot(json_request(
            Method::POST,
            "/execute",
            json!({"code": "x = 1", "sessionId": "missing"}),
        )?)
        .await?;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = app
        .oneshot(empty_request(Method::GET, "/sessions/missing")?)
        .await?;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    Ok(())
}

#[tokio::test]
async fn session_lifecycle_over_http() -> Result<()> {
    let (app, _base) = test_router().await?;

    let created = app
        .clone()
        .oneshot(json_request(
            Method::POST,
            "/sessions",
            json!({"sessionId": "notebook-1", "metadata": {"owner": "ana"}}),
        )?)
        .await?;
    assert_eq!(created.status(), StatusCode::CREATED);
    let info = response_json(created).await?;
    assert_eq!(info["id"], "notebook-1");
    assert_eq!(info["status"], "READY");

    let patched = app
        .clone()
        .oneshot(json_request(
            Method::PATCH,
            "/sessions/notebook-1",
            json!({"metadata": {"owner": null, "team": "research"}}),
        )?)
        .await?;
    assert_eq!(patched.status(), StatusCode::OK);
    let info = response_json(patched).await?;
    assert_eq!(info["metadata"], json!({"team": "research"}));

    let put = app
        .clone()
        .oneshot(json_request(
            Method::PUT,
            "/sessions/notebook-1/variables",
            json!({"variables": {"n": 41}}),
        )?)
        .await?;
    assert_eq!(put.status(), StatusCode::OK);

    let executed = app
        .clone()
        .oneshot(json_request(
            Method::POST,
            "/execute",
            json!({"code": "m = n + 1", "sessionId": "notebook-1"}),
        )?)
        .await?;
    let body = response_json(executed).await?;
    assert_eq!(body["output"]["variables"]["m"], 42);

    let variables = app
        .clone()
        .oneshot(empty_request(Method::GET, "/sessions/notebook-1/variables")?)
        .await?;
    let body = response_json(variables).await?;
    assert_eq!(body["variables"], json!({"n": 41, "m": 42}));

    let listed = app
        .clone()
        .oneshot(empty_request(Method::GET, "/sessions")?)
        .await?;
    let sessions = response_json(listed).await?;
    assert_eq!(sessions.as_array().map(Vec::len), Some(1));

    let deleted = app
        .clone()
        .oneshot(empty_request(Method::DELETE, "/sessions/notebook-1")?)
        .await?;
    assert_eq!(deleted.status(), StatusCode::NO_CONTENT);

    let gone = app
        .oneshot(empty_request(Method::GET, "/sessions/notebook-1")?)
        .await?;
    assert_eq!(gone.status(), StatusCode::NOT_FOUND);
    Ok(())
}

#[tokio::test]
async fn files_round_trip_through_the_vfs() -> Result<()> {
    let (app, _base) = test_router().await?;
    app.clone()
        .oneshot(json_request(Method::POST, "/sessions", json!({"sessionId": "f1"}))?)
        .await?;

    let uploaded = app
        .clone()
        .oneshot(json_request(
            Method::PUT,
            "/sessions/f1/files/data/blob.bin",
            json!({"content": "AAEC", "encoding": "base64"}),
        )?)
        .await?;
    assert_eq!(uploaded.status(), StatusCode::CREATED);
    let entry = response_json(uploaded).await?;
    assert_eq!(entry["path"], "/data/blob.bin");
    assert_eq!(entry["size"], 3);

    let read = app
        .clone()
        .oneshot(empty_request(Method::GET, "/sessions/f1/files/data/blob.bin")?)
        .await?;
    let file = response_json(read).await?;
    assert_eq!(file["encoding"], "base64");
    assert_eq!(file["content"], "AAEC");

    let listing = app
        .clone()
        .oneshot(empty_request(Method::GET, "/sessions/f1/files?path=/data")?)
        .await?;
    let entries = response_json(listing).await?;
    let names: Vec<&str> = entries
        .as_array()
        .ok_or_else(|| anyhow!("listing is not an array"))?
        .iter()
        .filter_map(|e| e["name"].as_str())
        .collect();
    assert_eq!(names, vec!["blob.bin"]);

    let missing = app
        .oneshot(empty_request(Method::GET, "/sessions/f1/files/nope.txt")?)
        .await?;
    assert_eq!(missing.status(), StatusCode::NOT_FOUND);
    Ok(())
}

#[tokio::test]
async fn vfs_quota_is_payload_too_large() -> Result<()> {
    let base = tempfile::tempdir()?;
    let mut config = SandboxConfig::default();
    config.lifecycle.workspace_base = base.path().to_path_buf();
    config.vfs.max_file_size = 4;
    let sandbox = SandboxBuilder::new(config)
        .with_runtime(Arc::new(ScriptedRuntime::new()))
        .build()
        .await?;
    let app = router(Arc::new(sandbox));
    app.clone()
        .oneshot(json_request(Method::POST, "/sessions", json!({"sessionId": "q1"}))?)
        .await?;

    let response = app
        .oneshot(json_request(
            Method::PUT,
            "/sessions/q1/files/big.txt",
            json!({"content": "too large"}),
        )?)
        .await?;
    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    let body = response_json(response).await?;
    assert_eq!(body["error"]["type"], "QuotaExceeded");
    Ok(())
}

#[tokio::test]
async fn validate_reports_without_executing() -> Result<()> {
    let (app, _base) = test_router().await?;
    let response = app
        .oneshot(json_request(
            Method::POST,
            "/validate",
            json!({"code": "import subprocess\n", "includeWarnings": true}),
        )?)
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    let body = response_json(response).await?;
    assert_eq!(body["valid"], false);
    assert_eq!(body["security"]["allowed"], false);
    assert!(body["analysis"]["imports"].is_array());
    assert!(body["style"]["issues"].is_array());
    assert!(body["warnings"].is_array());
    Ok(())
}

#[tokio::test]
async fn stream_emits_server_sent_events() -> Result<()> {
    let (app, _base) = test_router().await?;
    let response = app
        .oneshot(json_request(
            Method::POST,
            "/execute/stream",
            json!({"code": "x = 3\nprint(x)"}),
        )?)
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    let content_type = response
        .headers()
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    assert!(content_type.starts_with("text/event-stream"));

    let text = response_text(response).await?;
    let stdout_at = text.find("event: stdout").ok_or_else(|| anyhow!("no stdout event"))?;
    let complete_at = text
        .find("event: complete")
        .ok_or_else(|| anyhow!("no complete event"))?;
    assert!(stdout_at < complete_at);
    assert!(text.contains("event: variable"));
    Ok(())
}

#[tokio::test]
async fn stream_refuses_rejected_code_up_front() -> Result<()> {
    let (app, _base) = test_router().await?;
    let response = app
        .oneshot(json_request(
            Method::POST,
            "/execute/stream",
            json!({"code": "import socket"}),
        )?)
        .await?;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = response_json(response).await?;
    assert_eq!(body["error"]["type"], "SecurityViolation");
    Ok(())
}

#[tokio::test]
async fn blocked_package_is_a_bad_request() -> Result<()> {
    let (app, _base) = test_router().await?;
    app.clone()
        .oneshot(json_request(Method::POST, "/sessions", json!({"sessionId": "p1"}))?)
        .await?;
    let response = app
        .oneshot(json_request(
            Method::POST,
            "/packages/install",
            json!({"sessionId": "p1", "packages": ["paramiko"]}),
        )?)
        .await?;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = response_json(response).await?;
    assert_eq!(body["error"]["type"], "PackageBlocked");
    Ok(())
}

#[tokio::test]
async fn health_and_metrics_respond() -> Result<()> {
    let (app, _base) = test_router().await?;
    let health = app
        .clone()
        .oneshot(empty_request(Method::GET, "/health")?)
        .await?;
    assert_eq!(health.status(), StatusCode::OK);
    let body = response_json(health).await?;
    assert_eq!(body["containers"]["backend"], "scripted");
    assert_eq!(body["security"]["profile"], "blacklist");
    assert!(body["security"]["description"]
        .as_str()
        .is_some_and(|d| d.contains("high-risk modules")));

    app.clone()
        .oneshot(json_request(Method::POST, "/sessions", json!({"sessionId": "m1"}))?)
        .await?;
    let metrics = app
        .oneshot(empty_request(Method::GET, "/sessions/m1/metrics")?)
        .await?;
    assert_eq!(metrics.status(), StatusCode::OK);
    assert_eq!(response_json(metrics).await?, Value::Null);
    Ok(())
}
