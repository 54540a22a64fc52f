//! HTTP API.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/health` | Health check (returns version) |
//! | `GET`  | `/api/status` | Indexed repositories, active runs, cache stats |
//! | `POST` | `/api/analyze` | Run the workflow; `stream: true` returns `202` and a run id |
//! | `GET`  | `/api/analyze/{id}/events` | Run events as Server-Sent Events |
//! | `POST` | `/api/analyze/{id}/cancel` | Cancel an active run |
//! | `POST` | `/api/search` | Hybrid / vector / full-text search |
//! | `POST` | `/api/ask` | Answer a question about an indexed repository |
//! | `GET`  | `/api/llm-status` | Model backends and fallback plan |
//! | `POST` | `/api/llm-test` | Run one prompt through the fallback plan |
//! | `GET`  | `/api/repositories` | Indexed repositories |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "not_indexed", "message": "repository acme/shop has not been indexed; analyze it first" } }
//! ```
//!
//! Codes: `bad_request` (400), `not_found` (404), `not_indexed` (404),
//! `analysis_failed` (422), `cancelled` (409), `fetch_failed` (502),
//! `store_unavailable` (503), `query_failed` / `aborted` (500).
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted so a browser UI can be
//! served from anywhere.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use futures::stream::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use codequest_core::embedding::CacheStats;
use codequest_core::models::RepositoryRecord;
use codequest_core::search::{SearchError, SearchMode, SearchResponse};
use codequest_core::store::StoreError;

use crate::app::AppContext;
use crate::ask::{Answer, AskRequest};
use crate::error::{QueryError, WorkflowError};
use crate::llm::{GenerationError, GenerationRequest, SelectorStatus, Tier, TierAttempt};
use crate::walkthrough::UserLevel;
use crate::workflow::{AnalyzeRequest, Submission, WorkflowOutput};

type AppState = Arc<AppContext>;

/// Build the router. Split from [`run_server`] so tests can drive it
/// without a socket.
pub fn router(ctx: Arc<AppContext>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/api/status", get(handle_status))
        .route("/api/analyze", post(handle_analyze))
        .route("/api/analyze/{id}/events", get(handle_events))
        .route("/api/analyze/{id}/cancel", post(handle_cancel))
        .route("/api/search", post(handle_search))
        .route("/api/ask", post(handle_ask))
        .route("/api/llm-status", get(handle_llm_status))
        .route("/api/llm-test", post(handle_llm_test))
        .route("/api/repositories", get(handle_repositories))
        .layer(cors)
        .with_state(ctx)
}

/// Serve on `[server].bind` until Ctrl-C.
pub async fn run_server(ctx: Arc<AppContext>) -> anyhow::Result<()> {
    let bind_addr = ctx.config.server.bind.clone();
    let app = router(ctx.clone());

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!("listening on http://{}", bind_addr);
    println!("CodeQuest server listening on http://{}", bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if tokio::signal::ctrl_c().await.is_err() {
                std::future::pending::<()>().await;
            }
            tracing::info!("shutting down");
        })
        .await?;
    Ok(())
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
    code: String,
    message: String,
}

impl AppError {
    fn new(status: StatusCode, code: &str, message: impl Into<String>) -> Self {
        Self {
            status,
            code: code.to_string(),
            message: message.into(),
        }
    }
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

fn bad_request(message: impl Into<String>) -> AppError {
    AppError::new(StatusCode::BAD_REQUEST, "bad_request", message)
}

fn not_found(message: impl Into<String>) -> AppError {
    AppError::new(StatusCode::NOT_FOUND, "not_found", message)
}

impl From<QueryError> for AppError {
    fn from(e: QueryError) -> Self {
        let status = match &e {
            QueryError::NotIndexed(_) => StatusCode::NOT_FOUND,
            QueryError::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            QueryError::QueryFailed(_) => StatusCode::INTERNAL_SERVER_ERROR,
            QueryError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        };
        AppError::new(status, e.code(), e.to_string())
    }
}

impl From<WorkflowError> for AppError {
    fn from(e: WorkflowError) -> Self {
        let status = match &e {
            WorkflowError::FetchFailed(_) => StatusCode::BAD_GATEWAY,
            WorkflowError::AnalysisFailed(_) => StatusCode::UNPROCESSABLE_ENTITY,
            WorkflowError::Cancelled(_) => StatusCode::CONFLICT,
            WorkflowError::Aborted(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        AppError::new(status, e.code(), e.to_string())
    }
}

fn store_error(e: StoreError) -> AppError {
    QueryError::from(SearchError::Store(e)).into()
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

// ============ GET /api/status ============

#[derive(Serialize)]
struct StatusResponse {
    version: String,
    repositories: usize,
    active_runs: Vec<String>,
    embedding_model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    cache: Option<CacheStats>,
}

async fn handle_status(State(ctx): State<AppState>) -> Result<Json<StatusResponse>, AppError> {
    let repositories = ctx.store.list_repositories().await.map_err(store_error)?;
    Ok(Json(StatusResponse {
        version: env!("CARGO_PKG_VERSION").to_string(),
        repositories: repositories.len(),
        active_runs: ctx.orchestrator.active_runs(),
        embedding_model: ctx.embedder.as_ref().map(|e| e.model_name().to_string()),
        cache: ctx.embedder.as_ref().map(|e| e.stats()),
    }))
}

// ============ POST /api/analyze ============

#[derive(Deserialize)]
struct AnalyzeBody {
    url: String,
    #[serde(default)]
    request_id: Option<String>,
    #[serde(default)]
    user_level: UserLevel,
    /// Return `202` immediately and stream events instead of waiting.
    #[serde(default)]
    stream: bool,
}

#[derive(Serialize)]
struct AnalyzeAccepted {
    run_id: String,
    attached: bool,
    events: String,
}

async fn handle_analyze(
    State(ctx): State<AppState>,
    Json(body): Json<AnalyzeBody>,
) -> Result<Response, AppError> {
    if body.url.trim().is_empty() {
        return Err(bad_request("url must not be empty"));
    }
    let request = AnalyzeRequest {
        url: body.url,
        request_id: body.request_id,
        user_level: body.user_level,
    };
    let submission = ctx.orchestrator.submit(request);
    let handle = submission.handle().clone();

    if body.stream {
        let accepted = AnalyzeAccepted {
            run_id: handle.id().to_string(),
            attached: submission.is_attached(),
            events: format!("/api/analyze/{}/events", handle.id()),
        };
        return Ok((StatusCode::ACCEPTED, Json(accepted)).into_response());
    }

    // The caller that started the run owns it: if this request is dropped
    // mid-wait, the run is cancelled. Attached callers only observe.
    let guard = match &submission {
        Submission::Started(h) => Some(h.cancel_token().clone().drop_guard()),
        Submission::Attached(_) => None,
    };
    let outcome = handle.wait().await;
    if let Some(guard) = guard {
        guard.disarm();
    }
    let output: WorkflowOutput = outcome?;
    Ok(Json(output).into_response())
}

// ============ GET /api/analyze/{id}/events ============

async fn handle_events(
    State(ctx): State<AppState>,
    Path(id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, axum::Error>>>, AppError> {
    let handle = ctx
        .orchestrator
        .get(&id)
        .ok_or_else(|| not_found(format!("no active run with id: {}", id)))?;
    let events = handle
        .event_stream()
        .map(|event| Event::default().event(event.name()).json_data(&event));
    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

// ============ POST /api/analyze/{id}/cancel ============

async fn handle_cancel(
    State(ctx): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    if !ctx.orchestrator.cancel(&id) {
        return Err(not_found(format!("no active run with id: {}", id)));
    }
    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "run_id": id, "cancelled": true })),
    ))
}

// ============ POST /api/search ============

#[derive(Deserialize)]
struct SearchBody {
    repo_id: String,
    query: String,
    #[serde(default = "default_mode")]
    mode: String,
    #[serde(default)]
    limit: Option<usize>,
}

fn default_mode() -> String {
    "hybrid".to_string()
}

async fn handle_search(
    State(ctx): State<AppState>,
    Json(body): Json<SearchBody>,
) -> Result<Json<SearchResponse>, AppError> {
    if body.query.trim().is_empty() {
        return Err(bad_request("query must not be empty"));
    }
    let mode: SearchMode = body.mode.parse().map_err(bad_request)?;
    let response = ctx
        .retriever
        .search(&body.repo_id, &body.query, mode, body.limit)
        .await?;
    Ok(Json(response))
}

// ============ POST /api/ask ============

async fn handle_ask(
    State(ctx): State<AppState>,
    Json(body): Json<AskRequest>,
) -> Result<Json<Answer>, AppError> {
    if body.question.trim().is_empty() {
        return Err(bad_request("question must not be empty"));
    }
    Ok(Json(ctx.ask(&body).await?))
}

// ============ GET /api/llm-status ============

async fn handle_llm_status(State(ctx): State<AppState>) -> Json<SelectorStatus> {
    Json(ctx.selector.status().await)
}

// ============ POST /api/llm-test ============

const DEFAULT_TEST_PROMPT: &str = "Hello, can you help with code analysis?";
const TEST_RESPONSE_CHARS: usize = 200;

#[derive(Deserialize)]
struct LlmTestRequest {
    #[serde(default)]
    prompt: Option<String>,
    #[serde(default)]
    prefer_local: Option<bool>,
}

/// `success` is true only when a model tier answered; the static tier
/// answering means every backend was skipped or failed.
#[derive(Serialize)]
struct LlmTestResponse {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    tier: Option<Tier>,
    #[serde(skip_serializing_if = "Option::is_none")]
    backend: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    attempts: Vec<TierAttempt>,
}

async fn handle_llm_test(
    State(ctx): State<AppState>,
    Json(body): Json<LlmTestRequest>,
) -> Json<LlmTestResponse> {
    let prompt = body
        .prompt
        .filter(|p| !p.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_TEST_PROMPT.to_string());
    let mut request = GenerationRequest::new(
        "You are a helpful assistant for code analysis. Answer briefly.",
        prompt,
        "No language model answered.",
    );
    request.max_tokens = 100;
    request.prefer_local = body.prefer_local;

    let response = match ctx.selector.generate(&request).await {
        Ok(generation) => LlmTestResponse {
            success: !generation.is_static(),
            tier: Some(generation.tier),
            backend: Some(generation.backend),
            response: Some(generation.text.chars().take(TEST_RESPONSE_CHARS).collect()),
            error: None,
            attempts: generation.attempts,
        },
        Err(e) => {
            let error = e.to_string();
            let attempts = match e {
                GenerationError::GenerationUnavailable { attempts } => attempts,
                _ => Vec::new(),
            };
            LlmTestResponse {
                success: false,
                tier: None,
                backend: None,
                response: None,
                error: Some(error),
                attempts,
            }
        }
    };
    Json(response)
}

// ============ GET /api/repositories ============

async fn handle_repositories(
    State(ctx): State<AppState>,
) -> Result<Json<Vec<RepositoryRecord>>, AppError> {
    let repos = ctx.store.list_repositories().await.map_err(store_error)?;
    Ok(Json(repos))
}
