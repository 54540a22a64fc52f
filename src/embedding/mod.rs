//! Embedding providers and the retrying embed entry point.
//!
//! Concrete [`Embedder`] implementations:
//! - **`hash`**: [`HashEmbedder`] from the core crate; deterministic, offline.
//! - **[`OpenAiEmbedder`]**: calls an OpenAI-compatible `/embeddings` endpoint.
//! - **[`OllamaEmbedder`]**: calls a local Ollama instance's `/api/embed` endpoint.
//! - **`LocalEmbedder`**: runs all-MiniLM-L6-v2 and friends in-process via
//!   fastembed (feature `local-embeddings`).
//!
//! `disabled` yields no embedder at all: chunks are indexed for full-text
//! search only and hybrid queries run on the full-text side.
//!
//! # Retry Strategy
//!
//! Providers make a single attempt per call. [`embed_with_retry`] wraps the
//! cached embedder with a per-attempt timeout and exponential backoff:
//! - `ModelUnavailable` (network errors, HTTP 429, 5xx) and `Timeout` → retry
//! - `InvalidResponse` (4xx, malformed payload) → fail immediately
//! - Backoff: 200ms, 400ms, 800ms, ... capped at 3.2s

#[cfg(feature = "local-embeddings")]
mod local;

#[cfg(feature = "local-embeddings")]
pub use local::LocalEmbedder;

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use codequest_core::embedding::{CachedEmbedder, EmbedError, Embedder, HashEmbedder};

use crate::config::EmbeddingConfig;

/// Retry budget for one embed call.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub timeout: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &EmbeddingConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            timeout: Duration::from_secs(config.timeout_secs),
        }
    }
}

/// Embed `texts` through the cache, retrying transient failures.
pub async fn embed_with_retry(
    embedder: &CachedEmbedder,
    texts: &[String],
    policy: RetryPolicy,
) -> Result<Vec<Vec<f32>>, EmbedError> {
    let mut last_err = EmbedError::ModelUnavailable("no attempt made".to_string());

    for attempt in 0..=policy.max_retries {
        if attempt > 0 {
            let delay = Duration::from_millis(200 << (attempt - 1).min(4));
            tokio::time::sleep(delay).await;
        }

        let outcome = tokio::time::timeout(policy.timeout, embedder.embed_batch(texts)).await;
        match outcome {
            Ok(Ok(vectors)) => return Ok(vectors),
            Ok(Err(e @ EmbedError::InvalidResponse(_))) => return Err(e),
            Ok(Err(e)) => {
                tracing::debug!(attempt, error = %e, "embedding attempt failed");
                last_err = e;
            }
            Err(_) => {
                tracing::debug!(attempt, "embedding attempt timed out");
                last_err = EmbedError::Timeout(policy.timeout.as_secs());
            }
        }
    }

    Err(last_err)
}

/// Create the configured embedder, or `None` when embeddings are disabled.
///
/// | Config Value | Embedder |
/// |-------------|----------|
/// | `"disabled"` | none |
/// | `"hash"` | [`HashEmbedder`] |
/// | `"openai"` | [`OpenAiEmbedder`] |
/// | `"ollama"` | [`OllamaEmbedder`] |
/// | `"local"` | `LocalEmbedder` (feature `local-embeddings`) |
pub fn create_embedder(config: &EmbeddingConfig) -> Result<Option<Arc<dyn Embedder>>> {
    let embedder: Arc<dyn Embedder> = match config.provider.as_str() {
        "disabled" => return Ok(None),
        "hash" => Arc::new(HashEmbedder::new(config.dims.unwrap_or(384))),
        "openai" => Arc::new(OpenAiEmbedder::new(config)?),
        "ollama" => Arc::new(OllamaEmbedder::new(config)?),
        #[cfg(feature = "local-embeddings")]
        "local" => Arc::new(LocalEmbedder::new(config)?),
        #[cfg(not(feature = "local-embeddings"))]
        "local" => bail!(
            "embedding provider 'local' requires building with the `local-embeddings` feature"
        ),
        other => bail!("Unknown embedding provider: '{}'", other),
    };
    Ok(Some(embedder))
}

fn http_client(config: &EmbeddingConfig) -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .timeout(Duration::from_secs(config.timeout_secs))
        .build()?)
}

fn required_model(config: &EmbeddingConfig) -> Result<String> {
    config
        .model
        .clone()
        .ok_or_else(|| anyhow::anyhow!("embedding.model required"))
}

/// Network failures, including request timeouts, are transient.
fn transport_error(service: &str, e: reqwest::Error) -> EmbedError {
    EmbedError::ModelUnavailable(format!("{service} request failed: {e}"))
}

/// Map a non-success HTTP status: 429 and 5xx are transient.
async fn status_error(service: &str, response: reqwest::Response) -> EmbedError {
    let status = response.status();
    let body_text = response.text().await.unwrap_or_default();
    let message = format!("{service} API error {status}: {body_text}");
    if status.as_u16() == 429 || status.is_server_error() {
        EmbedError::ModelUnavailable(message)
    } else {
        EmbedError::InvalidResponse(message)
    }
}

// ============ OpenAI-compatible Embedder ============

/// Embedder using an OpenAI-compatible embeddings API.
///
/// Reads the API key from `OPENAI_API_KEY` at call time, so a missing key
/// surfaces as `ModelUnavailable` and ingestion degrades instead of failing.
pub struct OpenAiEmbedder {
    client: reqwest::Client,
    url: String,
    model: String,
    dims: usize,
}

impl OpenAiEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        Ok(Self {
            client: http_client(config)?,
            url: config
                .url
                .clone()
                .unwrap_or_else(crate::config::default_openai_url),
            model: required_model(config)?,
            dims: config.dims.unwrap_or(1536),
        })
    }
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| EmbedError::ModelUnavailable("OPENAI_API_KEY not set".to_string()))?;

        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });

        let response = self
            .client
            .post(format!("{}/embeddings", self.url.trim_end_matches('/')))
            .header("Authorization", format!("Bearer {}", api_key))
            .json(&body)
            .send()
            .await
            .map_err(|e| transport_error("OpenAI", e))?;

        if !response.status().is_success() {
            return Err(status_error("OpenAI", response).await);
        }

        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| EmbedError::InvalidResponse(e.to_string()))?;
        parse_openai_response(&json)
    }
}

fn parse_openai_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>, EmbedError> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| EmbedError::InvalidResponse("missing data array".to_string()))?;

    let mut indexed: Vec<(usize, Vec<f32>)> = Vec::with_capacity(data.len());
    for (position, item) in data.iter().enumerate() {
        let embedding = item
            .get("embedding")
            .and_then(|e| e.as_array())
            .ok_or_else(|| EmbedError::InvalidResponse("missing embedding".to_string()))?;
        let index = item
            .get("index")
            .and_then(|i| i.as_u64())
            .map(|i| i as usize)
            .unwrap_or(position);
        let vec: Vec<f32> = embedding
            .iter()
            .map(|v| v.as_f64().unwrap_or(0.0) as f32)
            .collect();
        indexed.push((index, vec));
    }

    // Sort by index to ensure order matches input
    indexed.sort_by_key(|(i, _)| *i);
    Ok(indexed.into_iter().map(|(_, v)| v).collect())
}

// ============ Ollama Embedder ============

/// Embedder using a local Ollama instance.
///
/// Calls `POST /api/embed` on the configured URL (default
/// `http://localhost:11434`). Requires an embedding model to be pulled,
/// e.g. `ollama pull nomic-embed-text`.
pub struct OllamaEmbedder {
    client: reqwest::Client,
    url: String,
    model: String,
    dims: usize,
}

impl OllamaEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        Ok(Self {
            client: http_client(config)?,
            url: config
                .url
                .clone()
                .unwrap_or_else(crate::config::default_ollama_url),
            model: required_model(config)?,
            dims: config.dims.unwrap_or(768),
        })
    }
}

#[async_trait]
impl Embedder for OllamaEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });

        let response = self
            .client
            .post(format!("{}/api/embed", self.url.trim_end_matches('/')))
            .json(&body)
            .send()
            .await
            .map_err(|e| transport_error(&format!("Ollama at {}", self.url), e))?;

        if !response.status().is_success() {
            return Err(status_error("Ollama", response).await);
        }

        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| EmbedError::InvalidResponse(e.to_string()))?;
        parse_ollama_response(&json)
    }
}

fn parse_ollama_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>, EmbedError> {
    let embeddings = json
        .get("embeddings")
        .and_then(|e| e.as_array())
        .ok_or_else(|| EmbedError::InvalidResponse("missing embeddings array".to_string()))?;

    let mut result = Vec::with_capacity(embeddings.len());
    for embedding in embeddings {
        let vec: Vec<f32> = embedding
            .as_array()
            .ok_or_else(|| EmbedError::InvalidResponse("embedding is not an array".to_string()))?
            .iter()
            .map(|v| v.as_f64().unwrap_or(0.0) as f32)
            .collect();
        result.push(vec);
    }

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Fails the first `failures` calls with `error`, then delegates to a
    /// hash embedder.
    struct Flaky {
        failures: u32,
        error: EmbedError,
        calls: AtomicU32,
    }

    #[async_trait]
    impl Embedder for Flaky {
        fn model_name(&self) -> &str {
            "flaky"
        }
        fn dims(&self) -> usize {
            16
        }
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                return Err(self.error.clone());
            }
            HashEmbedder::new(16).embed(texts).await
        }
    }

    fn flaky(failures: u32, error: EmbedError) -> (Arc<Flaky>, CachedEmbedder) {
        let inner = Arc::new(Flaky {
            failures,
            error,
            calls: AtomicU32::new(0),
        });
        let cached = CachedEmbedder::new(inner.clone(), 8);
        (inner, cached)
    }

    fn policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            timeout: Duration::from_secs(5),
        }
    }

    #[tokio::test]
    async fn test_retry_recovers_from_transient_failure() {
        let (inner, cached) = flaky(1, EmbedError::ModelUnavailable("503".into()));
        let out = embed_with_retry(&cached, &["fn main()".to_string()], policy(2))
            .await
            .unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(inner.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_retry_is_bounded() {
        let (inner, cached) = flaky(u32::MAX, EmbedError::ModelUnavailable("down".into()));
        let err = embed_with_retry(&cached, &["x".to_string()], policy(2))
            .await
            .unwrap_err();
        assert!(matches!(err, EmbedError::ModelUnavailable(_)));
        assert_eq!(inner.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_invalid_response_not_retried() {
        let (inner, cached) = flaky(u32::MAX, EmbedError::InvalidResponse("400".into()));
        assert!(embed_with_retry(&cached, &["x".to_string()], policy(3))
            .await
            .is_err());
        assert_eq!(inner.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_create_embedder_dispatch() {
        let mut config = EmbeddingConfig::default();
        let hash = create_embedder(&config).unwrap().unwrap();
        assert_eq!(hash.model_name(), "feature-hash");
        assert_eq!(hash.dims(), 384);

        config.provider = "disabled".into();
        assert!(create_embedder(&config).unwrap().is_none());

        config.provider = "ollama".into();
        config.model = Some("nomic-embed-text".into());
        config.dims = Some(768);
        assert_eq!(create_embedder(&config).unwrap().unwrap().dims(), 768);

        config.provider = "bogus".into();
        assert!(create_embedder(&config).is_err());
    }

    #[test]
    fn test_parse_openai_response_orders_by_index() {
        let json = serde_json::json!({
            "data": [
                {"index": 1, "embedding": [0.5, 0.5]},
                {"index": 0, "embedding": [1.0, 0.0]}
            ]
        });
        let out = parse_openai_response(&json).unwrap();
        assert_eq!(out, vec![vec![1.0, 0.0], vec![0.5, 0.5]]);
        assert!(parse_openai_response(&serde_json::json!({"oops": 1})).is_err());
    }

    #[test]
    fn test_parse_ollama_response() {
        let json = serde_json::json!({"embeddings": [[0.1, 0.2], [0.3, 0.4]]});
        let out = parse_ollama_response(&json).unwrap();
        assert_eq!(out.len(), 2);
        assert!(matches!(
            parse_ollama_response(&serde_json::json!({"embeddings": [1]})),
            Err(EmbedError::InvalidResponse(_))
        ));
    }
}
