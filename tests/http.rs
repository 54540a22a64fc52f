//! HTTP API tests. Requests go straight through the router with
//! `tower::ServiceExt::oneshot`; no socket is bound.

use anyhow::Result;
use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tower::ServiceExt;

use codequest::app::AppContext;
use codequest::config::Config;
use codequest::error::WorkflowError;
use codequest::fetch::{FetchOutcome, LocalFetcher, RepoFetcher};
use codequest::progress::NoProgress;
use codequest::server::router;
use codequest::sqlite_store::SqliteStore;
use codequest::workflow::AnalyzeRequest;

/// Local fetcher that takes its time, so a request can be dropped mid-run.
struct SlowFetcher {
    inner: LocalFetcher,
    delay: Duration,
}

#[async_trait]
impl RepoFetcher for SlowFetcher {
    async fn fetch(&self, url: &str) -> Result<FetchOutcome> {
        tokio::time::sleep(self.delay).await;
        self.inner.fetch(url).await
    }
}

async fn setup() -> (TempDir, PathBuf, Arc<AppContext>) {
    setup_with_delay(Duration::ZERO).await
}

async fn setup_with_delay(delay: Duration) -> (TempDir, PathBuf, Arc<AppContext>) {
    let tmp = TempDir::new().unwrap();
    let repo = tmp.path().join("kiosk");
    std::fs::create_dir_all(repo.join("src")).unwrap();
    std::fs::write(
        repo.join("src/lib.rs"),
        "// brindlewort inventory\npub fn restock(n: u32) -> u32 {\n    n + 1\n}\n",
    )
    .unwrap();
    std::fs::write(repo.join("README.md"), "# Kiosk\n\nA vending kiosk.\n").unwrap();

    let config = Config::default_for(tmp.path().join("data/cq.sqlite"));
    let store = Arc::new(SqliteStore::open(&config).await.unwrap());
    let fetcher = Arc::new(SlowFetcher {
        inner: LocalFetcher::new(config.fetch.clone()),
        delay,
    });
    let ctx = AppContext::assemble(config, store, fetcher, Arc::new(NoProgress)).unwrap();
    (tmp, repo, Arc::new(ctx))
}

fn build_request(method: &str, uri: &str, body: Option<Value>) -> Request<Body> {
    let builder = Request::builder().method(method).uri(uri);
    match body {
        Some(b) => builder
            .header("content-type", "application/json")
            .body(Body::from(b.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

/// Start a synchronous analyze request in the background and wait until
/// its run is registered.
async fn start_analyze(ctx: &Arc<AppContext>, repo: &PathBuf, run_id: &str) -> tokio::task::JoinHandle<()> {
    let app = router(ctx.clone());
    let request = build_request(
        "POST",
        "/api/analyze",
        Some(json!({ "url": repo.to_str().unwrap(), "request_id": run_id })),
    );
    let task = tokio::spawn(async move {
        let _ = app.oneshot(request).await;
    });
    for _ in 0..200 {
        if ctx.orchestrator.get(run_id).is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    task
}

async fn send(ctx: &Arc<AppContext>, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let request = build_request(method, uri, body);
    let response = router(ctx.clone()).oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

#[tokio::test]
async fn test_health() {
    let (_tmp, _repo, ctx) = setup().await;
    let (status, body) = send(&ctx, "GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
}

#[tokio::test]
async fn test_analyze_then_search_and_ask() {
    let (_tmp, repo, ctx) = setup().await;

    let (status, body) = send(
        &ctx,
        "POST",
        "/api/analyze",
        Some(json!({ "url": repo.to_str().unwrap(), "user_level": "intermediate" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{}", body);
    assert_eq!(body["repo"]["id"], "local/kiosk");
    assert_eq!(body["index"]["status"], "ready");

    let (status, body) = send(
        &ctx,
        "POST",
        "/api/search",
        Some(json!({ "repo_id": "local/kiosk", "query": "brindlewort", "mode": "fulltext" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{}", body);
    assert_eq!(body["mode"], "fulltext");
    assert_eq!(body["hits"][0]["chunk"]["file_path"], "src/lib.rs");

    let (status, body) = send(
        &ctx,
        "POST",
        "/api/ask",
        Some(json!({ "repo_id": "local/kiosk", "question": "brindlewort inventory" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{}", body);
    assert_eq!(body["tier"], "static");
    assert_eq!(body["sources"][0]["file_path"], "src/lib.rs");

    let (status, body) = send(&ctx, "GET", "/api/repositories", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().unwrap().len(), 1);
    assert_eq!(body[0]["repo_id"], "local/kiosk");
}

#[tokio::test]
async fn test_search_unindexed_repository_is_404() {
    let (_tmp, _repo, ctx) = setup().await;
    let (status, body) = send(
        &ctx,
        "POST",
        "/api/search",
        Some(json!({ "repo_id": "acme/nothing", "query": "anything" })),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "not_indexed");
    assert!(body["error"]["message"].as_str().unwrap().contains("acme/nothing"));
}

#[tokio::test]
async fn test_empty_inputs_are_bad_requests() {
    let (_tmp, _repo, ctx) = setup().await;

    let (status, body) = send(
        &ctx,
        "POST",
        "/api/search",
        Some(json!({ "repo_id": "local/kiosk", "query": "   " })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "bad_request");

    let (status, _) = send(
        &ctx,
        "POST",
        "/api/search",
        Some(json!({ "repo_id": "local/kiosk", "query": "x", "mode": "fuzzy" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(
        &ctx,
        "POST",
        "/api/ask",
        Some(json!({ "repo_id": "local/kiosk", "question": "" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(&ctx, "POST", "/api/analyze", Some(json!({ "url": "" }))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_search_limit_above_maximum_is_bad_request() {
    let (_tmp, _repo, ctx) = setup().await;
    let (status, body) = send(
        &ctx,
        "POST",
        "/api/search",
        Some(json!({ "repo_id": "local/kiosk", "query": "restock", "limit": 1_000_000 })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "bad_request");
    assert!(body["error"]["message"].as_str().unwrap().contains("exceeds"));
}

#[tokio::test]
async fn test_dropped_analyze_request_cancels_its_run() {
    let (_tmp, repo, ctx) = setup_with_delay(Duration::from_millis(300)).await;

    let request = start_analyze(&ctx, &repo, "run-dropped").await;
    let handle = ctx.orchestrator.get("run-dropped").expect("run registered");
    request.abort();

    let err = handle.wait().await.unwrap_err();
    assert_eq!(err, WorkflowError::Cancelled("run-dropped".to_string()));
    assert!(ctx.store.list_repositories().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_dropped_attached_request_leaves_run_alone() {
    let (_tmp, repo, ctx) = setup_with_delay(Duration::from_millis(300)).await;

    let mut owner = AnalyzeRequest::new(repo.to_str().unwrap());
    owner.request_id = Some("run-shared".to_string());
    let submission = ctx.orchestrator.submit(owner);

    let request = start_analyze(&ctx, &repo, "run-shared").await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    request.abort();

    let output = submission.handle().wait().await.unwrap();
    assert_eq!(output.run_id, "run-shared");
}

#[tokio::test]
async fn test_analyze_missing_path_is_bad_gateway() {
    let (tmp, _repo, ctx) = setup().await;
    let missing = tmp.path().join("gone");
    let (status, body) = send(
        &ctx,
        "POST",
        "/api/analyze",
        Some(json!({ "url": missing.to_str().unwrap() })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(body["error"]["code"], "fetch_failed");
}

#[tokio::test]
async fn test_streamed_analyze_returns_run_id() {
    let (_tmp, repo, ctx) = setup().await;
    let (status, body) = send(
        &ctx,
        "POST",
        "/api/analyze",
        Some(json!({ "url": repo.to_str().unwrap(), "request_id": "run-42", "stream": true })),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["run_id"], "run-42");
    assert_eq!(body["attached"], false);
    assert_eq!(body["events"], "/api/analyze/run-42/events");

    if let Some(handle) = ctx.orchestrator.get("run-42") {
        handle.wait().await.unwrap();
    }
}

#[tokio::test]
async fn test_unknown_run_is_404() {
    let (_tmp, _repo, ctx) = setup().await;

    let (status, body) = send(&ctx, "POST", "/api/analyze/missing/cancel", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "not_found");

    let (status, _) = send(&ctx, "GET", "/api/analyze/missing/events", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_llm_status_reports_static_plan() {
    let (_tmp, _repo, ctx) = setup().await;
    let (status, body) = send(&ctx, "GET", "/api/llm-status", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["backends"].as_array().unwrap().len(), 0);
    assert_eq!(body["has_fallback"], false);
}

#[tokio::test]
async fn test_llm_test_falls_through_to_static_tier() {
    let (_tmp, _repo, ctx) = setup().await;
    let (status, body) = send(
        &ctx,
        "POST",
        "/api/llm-test",
        Some(json!({ "prompt": "What does restock do?", "prefer_local": false })),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{}", body);
    assert_eq!(body["success"], false);
    assert_eq!(body["tier"], "static");

    let attempts = body["attempts"].as_array().unwrap();
    assert_eq!(attempts.len(), 3);
    assert_eq!(attempts[0]["tier"], "hosted");
    assert_eq!(attempts[0]["outcome"], "skipped");
    assert_eq!(attempts[2]["outcome"], "served");
}

#[tokio::test]
async fn test_analyze_walkthrough_has_quizzes() {
    let (_tmp, repo, ctx) = setup().await;
    let (status, body) = send(
        &ctx,
        "POST",
        "/api/analyze",
        Some(json!({ "url": repo.to_str().unwrap() })),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{}", body);
    for module in body["walkthrough"]["modules"].as_array().unwrap() {
        let quiz = module["quiz"].as_array().unwrap();
        assert!(!quiz.is_empty());
        let answer = quiz[0]["answer_index"].as_u64().unwrap() as usize;
        assert!(answer < quiz[0]["options"].as_array().unwrap().len());
    }
}

#[tokio::test]
async fn test_status_counts_repositories() {
    let (_tmp, _repo, ctx) = setup().await;
    let (status, body) = send(&ctx, "GET", "/api/status", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["repositories"], 0);
    assert_eq!(body["embedding_model"], "feature-hash");
    assert!(body["active_runs"].as_array().unwrap().is_empty());
}
