//! HTTP API.
//!
//! # Endpoints
//!
//! | Method   | Path                           | Description                          |
//! |----------|--------------------------------|--------------------------------------|
//! | `POST`   | `/api/text2sql/simple`         | Schema-only generation               |
//! | `POST`   | `/api/text2sql/advanced`       | Retrieval-augmented generation       |
//! | `POST`   | `/api/text2sql/chat`           | Generation with session history      |
//! | `POST`   | `/api/text2sql/agentic`        | Tool-using agent with reflection     |
//! | `POST`   | `/api/text2sql/search`         | Hybrid retrieval only                |
//! | `POST`   | `/api/text2sql/execute`        | Run caller-supplied SQL              |
//! | `GET`    | `/api/text2sql/tools`          | Agent tool catalogue                 |
//! | `DELETE` | `/api/text2sql/chat/{id}`      | Forget a session                     |
//! | `GET`    | `/health`                      | Readiness and corpus facts           |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "query must not be empty" } }
//! ```
//!
//! Error codes: `bad_request` (400), `not_found` (404), `timeout` (408),
//! `retrieval_error` (500), `internal` (500).
//!
//! Generation failures are not HTTP errors: they come back as `200` with the
//! response's `error` field set.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};

use crate::config::Config;
use crate::error::Text2SqlError;
use crate::models::{ExecutionResult, Method};
use crate::service::{
    CorpusInfo, SearchResponse, Text2SqlRequest, Text2SqlResponse, Text2SqlService, ToolInfo,
};

type AppState = Arc<Text2SqlService>;

/// Build the service from `config` and serve until the process exits.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let service = Arc::new(Text2SqlService::from_config(config).await?);
    let listener = tokio::net::TcpListener::bind(&config.server.bind).await?;
    tracing::info!(bind = %config.server.bind, "text2sql server listening");
    axum::serve(listener, router(service)).await?;
    Ok(())
}

/// All routes over a shared service.
pub fn router(service: Arc<Text2SqlService>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/text2sql/simple", post(handle_simple))
        .route("/api/text2sql/advanced", post(handle_advanced))
        .route("/api/text2sql/chat", post(handle_chat))
        .route("/api/text2sql/chat/{id}", delete(handle_clear_session))
        .route("/api/text2sql/agentic", post(handle_agentic))
        .route("/api/text2sql/search", post(handle_search))
        .route("/api/text2sql/execute", post(handle_execute))
        .route("/api/text2sql/tools", get(handle_tools))
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(service)
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code.to_string(),
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request",
        message: message.into(),
    }
}

fn not_found(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::NOT_FOUND,
        code: "not_found",
        message: message.into(),
    }
}

impl From<Text2SqlError> for AppError {
    fn from(err: Text2SqlError) -> Self {
        let (status, code) = match &err {
            Text2SqlError::Timeout { .. } => (StatusCode::REQUEST_TIMEOUT, "timeout"),
            Text2SqlError::Retrieval(_) => (StatusCode::INTERNAL_SERVER_ERROR, "retrieval_error"),
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
        };
        AppError {
            status,
            code,
            message: err.to_string(),
        }
    }
}

// ============ Generation ============

async fn generate(
    service: AppState,
    method: Method,
    request: Text2SqlRequest,
) -> Result<Json<Text2SqlResponse>, AppError> {
    request.validate().map_err(bad_request)?;
    tracing::debug!(method = %method, query = %request.query, "text2sql request");
    Ok(Json(service.run(method, request).await))
}

async fn handle_simple(
    State(service): State<AppState>,
    Json(request): Json<Text2SqlRequest>,
) -> Result<Json<Text2SqlResponse>, AppError> {
    generate(service, Method::Simple, request).await
}

async fn handle_advanced(
    State(service): State<AppState>,
    Json(request): Json<Text2SqlRequest>,
) -> Result<Json<Text2SqlResponse>, AppError> {
    generate(service, Method::Advanced, request).await
}

async fn handle_chat(
    State(service): State<AppState>,
    Json(request): Json<Text2SqlRequest>,
) -> Result<Json<Text2SqlResponse>, AppError> {
    generate(service, Method::Chat, request).await
}

async fn handle_agentic(
    State(service): State<AppState>,
    Json(request): Json<Text2SqlRequest>,
) -> Result<Json<Text2SqlResponse>, AppError> {
    generate(service, Method::Agentic, request).await
}

// ============ DELETE /api/text2sql/chat/{id} ============

#[derive(Serialize)]
struct ClearResponse {
    session_id: String,
    cleared: bool,
}

async fn handle_clear_session(
    State(service): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ClearResponse>, AppError> {
    if !service.clear_session(&id).await? {
        return Err(not_found(format!("no session with id: {}", id)));
    }
    Ok(Json(ClearResponse {
        session_id: id,
        cleared: true,
    }))
}

// ============ POST /api/text2sql/search ============

#[derive(Deserialize)]
struct SearchRequest {
    query: String,
    #[serde(default)]
    top_k: Option<usize>,
}

async fn handle_search(
    State(service): State<AppState>,
    Json(request): Json<SearchRequest>,
) -> Result<Json<SearchResponse>, AppError> {
    if request.query.trim().is_empty() {
        return Err(bad_request("query must not be empty"));
    }
    if request.top_k == Some(0) {
        return Err(bad_request("top_k must be at least 1"));
    }
    Ok(Json(service.search(&request.query, request.top_k).await?))
}

// ============ POST /api/text2sql/execute ============

#[derive(Deserialize)]
struct ExecuteRequest {
    sql: String,
}

async fn handle_execute(
    State(service): State<AppState>,
    Json(request): Json<ExecuteRequest>,
) -> Result<Json<ExecutionResult>, AppError> {
    if request.sql.trim().is_empty() {
        return Err(bad_request("sql must not be empty"));
    }
    Ok(Json(service.execute_raw(&request.sql).await))
}

// ============ GET /api/text2sql/tools ============

#[derive(Serialize)]
struct ToolListResponse {
    tools: Vec<ToolInfo>,
}

async fn handle_tools(State(service): State<AppState>) -> Json<ToolListResponse> {
    Json(ToolListResponse {
        tools: service.tools(),
    })
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    corpus: CorpusInfo,
}

async fn handle_health(State(service): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        corpus: service.corpus_info(),
    })
}
