//! HTTP control surface for the job manager.
//!
//! - `GET /jobs` lists job snapshots
//! - `POST /jobs` submits `{ "input", "target", "output"? }`
//! - `GET /jobs/:id` returns one snapshot
//! - `DELETE /jobs/:id` cancels
//! - `GET /stats` returns counts

use crate::error::ErrorKind;
use crate::job::{Job, JobId};
use crate::manager::{CancelOutcome, JobManager, JobStats, ManagerError};
use crate::plan::CompressionTarget;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Errors that can occur when running the control server
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Failed to bind to address: {0}")]
    BindError(#[from] std::io::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitRequest {
    pub input: PathBuf,
    pub target: CompressionTarget,
    #[serde(default)]
    pub output: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelResponse {
    pub id: JobId,
    pub outcome: CancelOutcome,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<ErrorKind>,
    pub message: String,
}

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Manager(ManagerError),
}

impl From<ManagerError> for ApiError {
    fn from(e: ManagerError) -> Self {
        ApiError::Manager(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, kind, message) = match self {
            ApiError::BadRequest(message) => (StatusCode::BAD_REQUEST, None, message),
            ApiError::Manager(e) => match &e {
                ManagerError::JobNotFound(_) => (StatusCode::NOT_FOUND, None, e.to_string()),
                ManagerError::Rejected(inner) => (
                    StatusCode::UNPROCESSABLE_ENTITY,
                    Some(inner.kind()),
                    inner.to_string(),
                ),
                ManagerError::ShuttingDown | ManagerError::Engine(_) => {
                    (StatusCode::SERVICE_UNAVAILABLE, None, e.to_string())
                }
            },
        };
        (status, Json(ErrorBody { kind, message })).into_response()
    }
}

fn parse_id(raw: &str) -> Result<JobId, ApiError> {
    raw.parse()
        .map_err(|_| ApiError::BadRequest(format!("invalid job id '{}'", raw)))
}

async fn list_jobs(State(manager): State<Arc<JobManager>>) -> Json<Vec<Job>> {
    Json(manager.list().await)
}

async fn submit_job(
    State(manager): State<Arc<JobManager>>,
    Json(request): Json<SubmitRequest>,
) -> Result<(StatusCode, Json<Job>), ApiError> {
    let id = manager
        .submit_with_output(request.input, request.target, request.output)
        .await?;
    let job = manager.query(id).await?;
    Ok((StatusCode::CREATED, Json(job)))
}

async fn get_job(
    State(manager): State<Arc<JobManager>>,
    Path(id): Path<String>,
) -> Result<Json<Job>, ApiError> {
    let id = parse_id(&id)?;
    Ok(Json(manager.query(id).await?))
}

async fn cancel_job(
    State(manager): State<Arc<JobManager>>,
    Path(id): Path<String>,
) -> Result<Json<CancelResponse>, ApiError> {
    let id = parse_id(&id)?;
    let outcome = manager.cancel(id).await?;
    Ok(Json(CancelResponse { id, outcome }))
}

async fn get_stats(State(manager): State<Arc<JobManager>>) -> Json<JobStats> {
    Json(manager.stats().await)
}

pub fn create_router(manager: Arc<JobManager>) -> Router {
    Router::new()
        .route("/jobs", get(list_jobs).post(submit_job))
        .route("/jobs/:id", get(get_job).delete(cancel_job))
        .route("/stats", get(get_stats))
        .with_state(manager)
}

/// Serve the control API on `addr` until `shutdown` fires
pub async fn run_server(
    manager: Arc<JobManager>,
    addr: SocketAddr,
    shutdown: CancellationToken,
) -> Result<(), ServerError> {
    let app = create_router(manager);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Control server listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::engine::EngineRuntime;
    use crate::job::JobState;
    use crate::testing::{EngineMode, FakeEngine, FakeProber};
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tempfile::TempDir;
    use tower::ServiceExt;

    async fn manager(dir: &TempDir) -> Arc<JobManager> {
        let mut config = Config::default();
        config.jobs.max_concurrent_jobs = 1;
        config.jobs.temp_dir = dir.path().join("tmp");
        config.jobs.output_dir = Some(dir.path().join("out"));
        config.engine.progress_interval_ms = 0;

        let runtime = EngineRuntime::new(Arc::new(FakeEngine::new(EngineMode::Succeed)));
        Arc::new(
            JobManager::start(&config, runtime, Arc::new(FakeProber::new()))
                .await
                .unwrap(),
        )
    }

    async fn send(app: Router, request: Request<Body>) -> (StatusCode, serde_json::Value) {
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let value = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, value)
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_submit_then_query() {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("clip.mov");
        std::fs::write(&input, b"source").unwrap();
        let manager = manager(&dir).await;
        let app = create_router(manager.clone());

        let (status, body) = send(
            app.clone(),
            post_json(
                "/jobs",
                serde_json::json!({
                    "input": input,
                    "target": { "kind": "target_size", "bytes": 10485760 }
                }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let id: JobId = body["id"].as_str().unwrap().parse().unwrap();

        manager.wait(id).await.unwrap();

        let (status, body) = send(app.clone(), get(&format!("/jobs/{}", id))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["state"], "completed");
        assert_eq!(body["progress"], 1.0);

        let (status, body) = send(app.clone(), get("/jobs")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().map(|a| a.len()), Some(1));

        let (status, body) = send(app, get("/stats")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["completed"], 1);
        assert_eq!(body["max_concurrent_jobs"], 1);
    }

    #[tokio::test]
    async fn test_rejected_submission_is_unprocessable() {
        let dir = TempDir::new().unwrap();
        let app = create_router(manager(&dir).await);

        let (status, body) = send(
            app,
            post_json(
                "/jobs",
                serde_json::json!({
                    "input": dir.path().join("missing.mov"),
                    "target": { "kind": "quality", "level": "high" }
                }),
            ),
        )
        .await;

        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["kind"], "unreadable_media");
    }

    #[tokio::test]
    async fn test_unknown_and_malformed_ids() {
        let dir = TempDir::new().unwrap();
        let app = create_router(manager(&dir).await);

        let (status, _) = send(app.clone(), get(&format!("/jobs/{}", JobId::new()))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, body) = send(app, get("/jobs/not-a-uuid")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["message"].as_str().unwrap().contains("not-a-uuid"));
    }

    #[tokio::test]
    async fn test_delete_finished_job() {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("clip.mov");
        std::fs::write(&input, b"source").unwrap();
        let manager = manager(&dir).await;
        let app = create_router(manager.clone());

        let id = manager
            .submit(input, CompressionTarget::target_size(10 * 1024 * 1024))
            .await
            .unwrap();
        assert_eq!(manager.wait(id).await.unwrap().state, JobState::Completed);

        let request = Request::builder()
            .method("DELETE")
            .uri(format!("/jobs/{}", id))
            .body(Body::empty())
            .unwrap();
        let (status, body) = send(app, request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["outcome"], "already_finished");
    }

    #[tokio::test]
    async fn test_shut_down_manager_is_unavailable() {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("clip.mov");
        std::fs::write(&input, b"source").unwrap();
        let manager = manager(&dir).await;
        manager.shutdown().await.unwrap();

        let (status, _) = send(
            create_router(manager),
            post_json(
                "/jobs",
                serde_json::json!({
                    "input": input,
                    "target": { "kind": "quality", "level": "low" }
                }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }
}
