//! The agent's HTTP route surface (spec.md §6). Exposed behind the
//! `server` feature so a CLI-only build of `wharf-core` doesn't pull in
//! axum/tokio; `wharfd` (crates/wharf-agent) is the only consumer.
//!
//! Handlers are thin: they decode the request, call into [`crate::archive`],
//! [`crate::reconciler`], or [`crate::session`], and shape the response.
//! The only serialization concern living here is the wire envelope
//! (camelCase field names, the `{error, message, status}` error shape)
//! since the domain types already carry their own `Serialize` impls.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use axum::extract::{Path as AxumPath, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};

use crate::archive;
use crate::reconciler::{ChangedFile, Reconciler};
use crate::session::SessionStore;
use crate::status::StatusTracker;
use wharf_types::{DeployResult, SessionFile};

/// Shared state handed to every handler. Cheap to clone: every field is
/// an `Arc` or a handle that is itself internally `Arc`-backed.
#[derive(Clone)]
pub struct AgentState {
    pub reconciler: Arc<Reconciler>,
    pub sessions: SessionStore,
    pub status: StatusTracker,
    pub agent_version: String,
    pub plugin_version: Option<String>,
    pub app_server_running: Arc<std::sync::atomic::AtomicBool>,
    pub domain_name: Option<String>,
}

impl AgentState {
    pub fn new(reconciler: Arc<Reconciler>, agent_version: impl Into<String>) -> Self {
        let status = reconciler.status().clone();
        Self {
            reconciler,
            sessions: SessionStore::new(),
            status,
            agent_version: agent_version.into(),
            plugin_version: None,
            app_server_running: Arc::new(std::sync::atomic::AtomicBool::new(true)),
            domain_name: None,
        }
    }
}

/// The full route surface from spec.md §6, mounted at the plugin base URL
/// by the caller (e.g. `/plugins/payara`, or the root when `wharfd` serves
/// a single plugin per process).
pub fn router(state: AgentState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(app_status))
        .route("/applications", get(applications))
        .route("/file/{*path}", get(fetch_file))
        .route("/hashes", get(hashes))
        .route("/deploy", post(deploy_inline))
        .route("/deploy/full", post(deploy_full))
        .route("/deploy/upload", post(deploy_upload))
        .route("/deploy/chunk", post(deploy_chunk))
        .route("/deploy/chunk/{session_id}", delete(cancel_chunk))
        .route("/deploy/status", get(deploy_status))
        .route("/restart", post(restart))
        .route("/plugins/versions", get(plugin_versions))
        .route("/plugins/update", post(plugin_update))
        .with_state(state)
}

/// `{ error: <category>, message: <human>, status?: <machine> }` (§6).
pub struct ApiError {
    status: StatusCode,
    category: &'static str,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, category: &'static str, message: impl Into<String>) -> Self {
        Self { status, category, message: message.into() }
    }

    fn internal(err: impl std::fmt::Display) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", err.to_string())
    }

    fn conflict(message: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, "deploy_in_progress", message)
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "not_found", message)
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "bad_request", message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        #[derive(Serialize)]
        struct Body {
            error: &'static str,
            message: String,
            status: u16,
        }
        (self.status, Json(Body { error: self.category, message: self.message, status: self.status.as_u16() })).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthBody {
    agent_version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    plugin_version: Option<String>,
    app_server_running: bool,
}

async fn health(State(state): State<AgentState>) -> Json<HealthBody> {
    Json(HealthBody {
        agent_version: state.agent_version.clone(),
        plugin_version: state.plugin_version.clone(),
        app_server_running: state.app_server_running.load(std::sync::atomic::Ordering::Relaxed),
    })
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AppStatusBody {
    healthy: bool,
    running: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    domain: Option<String>,
    app_deployed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    app_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    war_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    process_count: Option<u32>,
}

async fn app_status(State(state): State<AgentState>) -> Json<AppStatusBody> {
    let archive_path = state.reconciler.installed_archive_path();
    let deployed = archive_path.exists();
    Json(AppStatusBody {
        healthy: true,
        running: state.app_server_running.load(std::sync::atomic::Ordering::Relaxed),
        domain: state.domain_name.clone(),
        app_deployed: deployed,
        app_name: deployed.then(|| app_name(archive_path)).flatten(),
        war_path: deployed.then(|| archive_path.display().to_string()),
        process_count: None,
    })
}

fn app_name(archive_path: &Path) -> Option<String> {
    archive_path.file_stem().map(|s| s.to_string_lossy().to_string())
}

#[derive(Serialize)]
struct ApplicationsBody {
    applications: Vec<String>,
}

async fn applications(State(state): State<AgentState>) -> Json<ApplicationsBody> {
    let archive_path = state.reconciler.installed_archive_path();
    let applications = if archive_path.exists() {
        app_name(archive_path).into_iter().collect()
    } else {
        Vec::new()
    };
    Json(ApplicationsBody { applications })
}

async fn fetch_file(State(state): State<AgentState>, AxumPath(path): AxumPath<String>) -> ApiResult<Response> {
    let archive_path = state.reconciler.installed_archive_path();
    let entries = archive::read_entries(archive_path, &[path.clone()])
        .map_err(|e| ApiError::internal(e))?;
    let (_, bytes) = entries
        .into_iter()
        .next()
        .ok_or_else(|| ApiError::not_found(format!("no such entry: {path}")))?;
    let content_type = content_type_for(&path);
    Ok(([(header::CONTENT_TYPE, content_type)], bytes).into_response())
}

fn content_type_for(path: &str) -> &'static str {
    match path.rsplit('.').next().unwrap_or("") {
        "html" | "htm" => "text/html",
        "css" => "text/css",
        "js" => "application/javascript",
        "json" => "application/json",
        "xml" => "application/xml",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "svg" => "image/svg+xml",
        _ => "application/octet-stream",
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HashesBody {
    hashes: BTreeMap<String, String>,
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    file_count: Option<usize>,
}

async fn hashes(State(state): State<AgentState>) -> ApiResult<Json<HashesBody>> {
    let archive_path = state.reconciler.installed_archive_path();
    if !archive_path.exists() {
        return Ok(Json(HashesBody { hashes: BTreeMap::new(), status: "no_war", file_count: None }));
    }

    match archive::index_archive(archive_path) {
        Ok(index) => Ok(Json(HashesBody {
            file_count: Some(index.len()),
            hashes: index.0,
            status: "ok",
        })),
        Err(e) => {
            tracing::warn!(error = %e, "failed to index installed archive");
            Ok(Json(HashesBody { hashes: BTreeMap::new(), status: "error", file_count: None }))
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct InlineFileBody {
    path: String,
    #[serde(rename = "content-b64")]
    content_b64: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct InlineDeployBody {
    files: Vec<InlineFileBody>,
    #[serde(default)]
    deletions: Vec<String>,
}

fn decode_files(files: Vec<InlineFileBody>) -> ApiResult<Vec<ChangedFile>> {
    files
        .into_iter()
        .map(|f| {
            BASE64
                .decode(f.content_b64.as_bytes())
                .map(|content| ChangedFile { path: f.path.clone(), content })
                .map_err(|e| ApiError::bad_request(format!("invalid base64 for {}: {e}", f.path)))
        })
        .collect()
}

async fn deploy_inline(State(state): State<AgentState>, Json(body): Json<InlineDeployBody>) -> ApiResult<Response> {
    let changed = decode_files(body.files)?;
    run_reconcile(&state, changed, body.deletions)
}

async fn deploy_full(State(state): State<AgentState>) -> ApiResult<Response> {
    run_reconcile(&state, Vec::new(), Vec::new())
}

fn run_reconcile(state: &AgentState, changed: Vec<ChangedFile>, deletions: Vec<String>) -> ApiResult<Response> {
    match state.reconciler.apply(changed, deletions) {
        Ok(result) => Ok((StatusCode::OK, Json(result)).into_response()),
        Err(e) if e.to_string().contains("already in progress") => Err(ApiError::conflict(e.to_string())),
        Err(e) => Err(ApiError::internal(e)),
    }
}

/// `POST /deploy/upload`: full archive body, `application/octet-stream`,
/// up to 500 MB (§4.8 step 2). The body-size ceiling is enforced by the
/// `DefaultBodyLimit` layer the binary installs around this router.
async fn deploy_upload(State(state): State<AgentState>, body: axum::body::Bytes) -> ApiResult<Response> {
    match state.reconciler.full_replace(&body) {
        Ok(result) => Ok((StatusCode::OK, Json(result)).into_response()),
        Err(e) if e.to_string().contains("already in progress") => Err(ApiError::conflict(e.to_string())),
        Err(e) => Err(ApiError::internal(e)),
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChunkBody {
    #[serde(default)]
    session_id: Option<String>,
    files: Vec<InlineFileBody>,
    #[serde(default)]
    deletions: Option<Vec<String>>,
    #[serde(default)]
    expected_files: Option<usize>,
    #[serde(default)]
    commit: Option<bool>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ChunkResponseBody {
    session_id: String,
    files_received: usize,
    committed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<DeployResult>,
}

/// `POST /deploy/chunk` (spec.md §4.10): first chunk creates a session,
/// subsequent chunks append, and the chunk carrying `commit=true` applies
/// the accumulated session via the reconciler and destroys it regardless
/// of outcome — no partial replay on a commit-time failure.
async fn deploy_chunk(State(state): State<AgentState>, Json(body): Json<ChunkBody>) -> ApiResult<Json<ChunkResponseBody>> {
    let files: Vec<SessionFile> = body
        .files
        .into_iter()
        .map(|f| SessionFile { path: f.path, content_b64: f.content_b64 })
        .collect();

    let session = match &body.session_id {
        None => state.sessions.create(files, body.deletions.unwrap_or_default(), body.expected_files),
        Some(id) => {
            if body.deletions.is_some() {
                return Err(ApiError::bad_request("deletions may only be supplied on the first chunk"));
            }
            state
                .sessions
                .append(id, files)
                .ok_or_else(|| ApiError::new(StatusCode::GONE, "session_expired", format!("no such session: {id}")))?
        }
    };

    if !body.commit.unwrap_or(false) {
        return Ok(Json(ChunkResponseBody {
            session_id: session.id,
            files_received: session.files.len(),
            committed: false,
            result: None,
        }));
    }

    let session = state
        .sessions
        .take(&session.id)
        .ok_or_else(|| ApiError::new(StatusCode::GONE, "session_expired", format!("no such session: {}", session.id)))?;

    let changed = session
        .files
        .into_iter()
        .map(|f| {
            BASE64
                .decode(f.content_b64.as_bytes())
                .map(|content| ChangedFile { path: f.path.clone(), content })
                .map_err(|e| ApiError::bad_request(format!("invalid base64 for {}: {e}", f.path)))
        })
        .collect::<ApiResult<Vec<_>>>()?;

    match state.reconciler.apply(changed, session.deletions) {
        Ok(result) => Ok(Json(ChunkResponseBody {
            session_id: session.id,
            files_received: result.files_changed,
            committed: true,
            result: Some(result),
        })),
        Err(e) if e.to_string().contains("already in progress") => Err(ApiError::conflict(e.to_string())),
        Err(e) => Err(ApiError::internal(e)),
    }
}

async fn cancel_chunk(State(state): State<AgentState>, AxumPath(session_id): AxumPath<String>) -> StatusCode {
    match state.sessions.take(&session_id) {
        Some(_) => StatusCode::OK,
        None => StatusCode::NOT_FOUND,
    }
}

async fn deploy_status(State(state): State<AgentState>) -> Json<crate::status::StatusSnapshot> {
    Json(state.status.snapshot())
}

async fn restart(State(state): State<AgentState>) -> StatusCode {
    state.app_server_running.store(true, std::sync::atomic::Ordering::Relaxed);
    StatusCode::OK
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PluginVersionsBody {
    has_updates: bool,
    versions: Vec<PluginVersionBody>,
    timestamp: chrono::DateTime<chrono::Utc>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PluginVersionBody {
    package: String,
    current: String,
    latest: String,
    update_available: bool,
}

async fn plugin_versions(State(state): State<AgentState>) -> Json<PluginVersionsBody> {
    let current = state.plugin_version.clone().unwrap_or_else(|| env!("CARGO_PKG_VERSION").to_string());
    Json(PluginVersionsBody {
        has_updates: false,
        versions: vec![PluginVersionBody {
            package: "wharf-agent".to_string(),
            current: current.clone(),
            latest: current,
            update_available: false,
        }],
        timestamp: chrono::Utc::now(),
    })
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PluginUpdateBody {
    updated: bool,
    results: Vec<String>,
    will_restart: bool,
    message: String,
    timestamp: chrono::DateTime<chrono::Utc>,
}

/// `POST /plugins/update`: this agent ships as a single static binary with
/// no in-place self-update mechanism, so the endpoint is a documented
/// no-op rather than an error — callers treat `updated: false` the same
/// way they treat an unreachable update channel.
async fn plugin_update() -> Json<PluginUpdateBody> {
    Json(PluginUpdateBody {
        updated: false,
        results: Vec::new(),
        will_restart: false,
        message: "wharf-agent has no self-update mechanism".to_string(),
        timestamp: chrono::Utc::now(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tempfile::tempdir;
    use tower::ServiceExt;

    fn test_state(td: &Path) -> AgentState {
        let reconciler = Arc::new(Reconciler::new(
            td.join("app.war"),
            td.join("scratch"),
            StatusTracker::new(),
        ));
        AgentState::new(reconciler, "1.0.0-test")
    }

    #[tokio::test]
    async fn health_reports_agent_version() {
        let td = tempdir().unwrap();
        let app = router(test_state(td.path()));
        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["agentVersion"], "1.0.0-test");
    }

    #[tokio::test]
    async fn hashes_reports_no_war_when_nothing_installed() {
        let td = tempdir().unwrap();
        let app = router(test_state(td.path()));
        let response = app
            .oneshot(Request::builder().uri("/hashes").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["status"], "no_war");
    }

    #[tokio::test]
    async fn deploy_inline_then_hashes_reflects_change() {
        let td = tempdir().unwrap();
        let app = router(test_state(td.path()));

        let body = serde_json::json!({
            "files": [{"path": "index.html", "content-b64": BASE64.encode(b"hi")}],
            "deletions": []
        });
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/deploy")
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .oneshot(Request::builder().uri("/hashes").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["status"], "ok");
        assert!(json["hashes"]["index.html"].is_string());
    }

    #[tokio::test]
    async fn deploy_chunk_commits_and_applies() {
        let td = tempdir().unwrap();
        let app = router(test_state(td.path()));

        let body = serde_json::json!({
            "files": [{"path": "a.txt", "content-b64": BASE64.encode(b"one")}],
            "deletions": [],
            "commit": true
        });
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/deploy/chunk")
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["committed"], true);
    }

    #[tokio::test]
    async fn cancel_unknown_session_is_404() {
        let td = tempdir().unwrap();
        let app = router(test_state(td.path()));
        let response = app
            .oneshot(
                Request::builder()
                    .method("DELETE")
                    .uri("/deploy/chunk/does-not-exist")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn deploy_status_reports_idle_by_default() {
        let td = tempdir().unwrap();
        let app = router(test_state(td.path()));
        let response = app
            .oneshot(Request::builder().uri("/deploy/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["deploying"], false);
    }

    #[tokio::test]
    async fn plugins_versions_reports_current_agent() {
        let td = tempdir().unwrap();
        let app = router(test_state(td.path()));
        let response = app
            .oneshot(Request::builder().uri("/plugins/versions").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
