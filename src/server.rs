//! MCP-compatible HTTP tool server.
//!
//! Exposes the two engine operations via a JSON HTTP API suitable for
//! integration with Cursor, Claude, and other MCP-compatible AI tools.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/tools/list` | List the tools with their parameter schemas |
//! | `POST` | `/tools/refresh` | Sync embeddings for a repository's open issues |
//! | `POST` | `/tools/duplicates` | Rank near-duplicates of one issue |
//! | `GET`  | `/health` | Health check (returns version) |
//!
//! # Error Contract
//!
//! All error responses use one envelope:
//!
//! ```json
//! { "error": { "code": "not_found", "message": "issue #42 not found ..." } }
//! ```
//!
//! Error codes: `bad_request` (400), `not_found` (404), `embedding_failed`
//! (500), `tool_error` (500). Collaborator failures never escape as panics;
//! they are classified into the envelope.
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted to support browser-based
//! clients and cross-origin MCP tool calls.

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use crate::config::Config;
use crate::db;
use crate::dedup;
use crate::embedding::{self, EmbeddingService};
use crate::store::{IssueStore, PgIssueStore};
use crate::sync;
use crate::tracker::{GitHubClient, TrackerClient};

/// Shared application state passed to all route handlers.
///
/// Every collaborator is constructed once at startup and injected here;
/// the store owns the only connection pool in the process.
#[derive(Clone)]
struct AppState {
    config: Arc<Config>,
    tracker: Arc<dyn TrackerClient>,
    embedder: Arc<dyn EmbeddingService>,
    store: Arc<dyn IssueStore>,
}

/// Starts the tool server.
///
/// Binds to the address configured in `[server].bind` and runs until the
/// process is terminated.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let pool = db::connect(config).await?;
    let store = Arc::new(PgIssueStore::new(pool, config.embedding.dims));

    let state = AppState {
        tracker: Arc::new(GitHubClient::new(&config.tracker)?),
        embedder: embedding::create_service(&config.embedding)?.into(),
        store,
        config: Arc::new(config.clone()),
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/tools/list", get(handle_list_tools))
        .route("/tools/refresh", post(handle_refresh))
        .route("/tools/duplicates", post(handle_duplicates))
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(state);

    let bind_addr = &config.server.bind;
    println!("Tool server listening on http://{}", bind_addr);

    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

// ============ Error response ============

/// JSON error response body.
#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

/// Internal error type that converts into an Axum HTTP response.
struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

/// Inspects operation errors and maps them to the most appropriate HTTP
/// status. This lets the core modules signal client errors (issue not found
/// → 404, bad threshold → 400) without a custom error type per operation.
fn classify_tool_error(tool_name: &str, err: anyhow::Error) -> AppError {
    let msg = err.to_string();

    let (status, code) = if msg.contains("not found") {
        (StatusCode::NOT_FOUND, "not_found")
    } else if msg.contains("must be") || msg.contains("invalid") {
        (StatusCode::BAD_REQUEST, "bad_request")
    } else if msg.contains("embedding") || msg.contains("disabled") {
        (StatusCode::INTERNAL_SERVER_ERROR, "embedding_failed")
    } else {
        (StatusCode::INTERNAL_SERVER_ERROR, "tool_error")
    };

    AppError {
        status,
        code: code.to_string(),
        message: format!("{}: {}", tool_name, msg),
    }
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ GET /tools/list ============

#[derive(Serialize)]
struct ToolInfo {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

#[derive(Serialize)]
struct ToolListResponse {
    tools: Vec<ToolInfo>,
}

async fn handle_list_tools() -> Json<ToolListResponse> {
    let tools = vec![
        ToolInfo {
            name: "refresh".to_string(),
            description: "Update the embeddings for all open issues in a repository".to_string(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {
                    "repo_owner": { "type": "string", "description": "Repository owner, e.g. google-gemini" },
                    "repo_name": { "type": "string", "description": "Repository name, e.g. gemini-cli" },
                    "force": { "type": "boolean", "description": "Re-embed all issues regardless of staleness", "default": false }
                },
                "required": ["repo_owner", "repo_name"]
            }),
        },
        ToolInfo {
            name: "duplicates".to_string(),
            description: "Find duplicate issues for a given issue".to_string(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {
                    "repo_owner": { "type": "string", "description": "Repository owner" },
                    "repo_name": { "type": "string", "description": "Repository name" },
                    "issue_number": { "type": "integer", "description": "Issue to find duplicates for" },
                    "threshold": { "type": "number", "description": "Similarity threshold in [0, 1]", "default": 0.9 }
                },
                "required": ["repo_owner", "repo_name", "issue_number"]
            }),
        },
    ];

    Json(ToolListResponse { tools })
}

// ============ POST /tools/refresh ============

#[derive(Deserialize)]
struct RefreshParams {
    repo_owner: String,
    repo_name: String,
    #[serde(default)]
    force: bool,
}

async fn handle_refresh(
    State(state): State<AppState>,
    Json(params): Json<RefreshParams>,
) -> Result<Json<serde_json::Value>, AppError> {
    let repo = format!("{}/{}", params.repo_owner, params.repo_name);

    let report = sync::run_refresh(
        state.tracker.as_ref(),
        state.embedder.as_ref(),
        state.store.as_ref(),
        &state.config,
        &repo,
        params.force,
    )
    .await
    .map_err(|e| classify_tool_error("refresh", e))?;

    Ok(Json(serde_json::json!({ "result": report })))
}

// ============ POST /tools/duplicates ============

fn default_threshold() -> f64 {
    0.9
}

#[derive(Deserialize)]
struct DuplicatesParams {
    repo_owner: String,
    repo_name: String,
    issue_number: i64,
    #[serde(default = "default_threshold")]
    threshold: f64,
}

async fn handle_duplicates(
    State(state): State<AppState>,
    Json(params): Json<DuplicatesParams>,
) -> Result<Json<serde_json::Value>, AppError> {
    let repo = format!("{}/{}", params.repo_owner, params.repo_name);

    let report = dedup::find_duplicates(
        state.tracker.as_ref(),
        state.embedder.as_ref(),
        state.store.as_ref(),
        &state.config,
        &repo,
        params.issue_number,
        params.threshold,
    )
    .await
    .map_err(|e| classify_tool_error("duplicates", e))?;

    Ok(Json(serde_json::json!({ "result": report })))
}
