//! Embedding trait, content-addressed cache, and vector utilities.
//!
//! Defines the [`Embedder`] trait every embedding backend implements, the
//! [`CachedEmbedder`] wrapper that memoises vectors by the SHA-256 of the
//! input text, a deterministic [`HashEmbedder`] usable offline, and pure
//! helpers for vector serialization and similarity.
//!
//! Network-backed providers (OpenAI, Ollama, fastembed) live in the
//! `codequest` app crate.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use lru::LruCache;
use serde::Serialize;
use sha2::{Digest, Sha256};

/// Errors produced by embedding backends.
#[derive(Debug, Clone, thiserror::Error)]
pub enum EmbedError {
    /// The model could not be reached or refused the request.
    #[error("embedding model unavailable: {0}")]
    ModelUnavailable(String),
    /// The call exceeded its deadline.
    #[error("embedding timed out after {0}s")]
    Timeout(u64),
    /// The backend answered with something that is not a usable vector.
    #[error("invalid embedding response: {0}")]
    InvalidResponse(String),
}

/// An embedding backend. `embed` is a pure function of its input:
/// the same text always maps to the same vector.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Model identifier (e.g. `"all-MiniLM-L6-v2"`).
    fn model_name(&self) -> &str;
    /// Vector dimensionality.
    fn dims(&self) -> usize;
    /// Embed a batch of texts, returning one vector per input in order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError>;
}

/// Cache counters, monotonically increasing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub model_calls: u64,
    pub entries: usize,
}

/// Write-through LRU cache in front of an [`Embedder`].
///
/// Keys are the SHA-256 of the text, so the cache is content-addressed and
/// identical chunks from different files share one entry. The lock guards
/// only map access and is never held across the model call; two tasks
/// missing on the same text may both call the model, and the later insert
/// simply overwrites an identical vector.
pub struct CachedEmbedder {
    inner: Arc<dyn Embedder>,
    cache: Mutex<LruCache<String, Arc<Vec<f32>>>>,
    hits: AtomicU64,
    misses: AtomicU64,
    model_calls: AtomicU64,
}

impl CachedEmbedder {
    /// Wrap `inner` with a cache bounded to `capacity` entries (min 1).
    pub fn new(inner: Arc<dyn Embedder>, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner,
            cache: Mutex::new(LruCache::new(capacity)),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            model_calls: AtomicU64::new(0),
        }
    }

    pub fn model_name(&self) -> &str {
        self.inner.model_name()
    }

    pub fn dims(&self) -> usize {
        self.inner.dims()
    }

    pub fn stats(&self) -> CacheStats {
        let entries = self.cache.lock().map(|c| c.len()).unwrap_or(0);
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            model_calls: self.model_calls.load(Ordering::Relaxed),
            entries,
        }
    }

    /// Embed one text.
    pub async fn embed_one(&self, text: &str) -> Result<Vec<f32>, EmbedError> {
        let mut out = self.embed_batch(&[text.to_string()]).await?;
        out.pop()
            .ok_or_else(|| EmbedError::InvalidResponse("empty batch result".to_string()))
    }

    /// Embed a batch. Cached texts are served from memory; only the misses
    /// are sent to the model, in a single call.
    pub async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
        let keys: Vec<String> = texts.iter().map(|t| cache_key(t)).collect();
        let mut results: Vec<Option<Vec<f32>>> = vec![None; texts.len()];
        let mut missing: Vec<usize> = Vec::new();

        {
            let mut cache = self
                .cache
                .lock()
                .map_err(|_| EmbedError::ModelUnavailable("embedding cache poisoned".into()))?;
            for (i, key) in keys.iter().enumerate() {
                match cache.get(key) {
                    Some(v) => results[i] = Some(v.as_ref().clone()),
                    None => missing.push(i),
                }
            }
        }

        self.hits
            .fetch_add((texts.len() - missing.len()) as u64, Ordering::Relaxed);
        self.misses
            .fetch_add(missing.len() as u64, Ordering::Relaxed);

        if !missing.is_empty() {
            let batch: Vec<String> = missing.iter().map(|&i| texts[i].clone()).collect();
            self.model_calls.fetch_add(1, Ordering::Relaxed);
            let vectors = self.inner.embed(&batch).await?;
            if vectors.len() != batch.len() {
                return Err(EmbedError::InvalidResponse(format!(
                    "expected {} vectors, got {}",
                    batch.len(),
                    vectors.len()
                )));
            }

            let mut cache = self
                .cache
                .lock()
                .map_err(|_| EmbedError::ModelUnavailable("embedding cache poisoned".into()))?;
            for (&i, vector) in missing.iter().zip(vectors) {
                cache.put(keys[i].clone(), Arc::new(vector.clone()));
                results[i] = Some(vector);
            }
        }

        Ok(results.into_iter().flatten().collect())
    }
}

/// Cache key for a text: SHA-256, hex encoded.
pub fn cache_key(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Deterministic feature-hashing embedder.
///
/// Tokens (identifier-like runs, lowercased) are hashed into `dims`
/// buckets with a sign bit, then the vector is L2-normalised. Texts that
/// share identifiers land close together, which is enough for offline use
/// and tests.
#[derive(Debug, Clone)]
pub struct HashEmbedder {
    dims: usize,
}

impl HashEmbedder {
    pub fn new(dims: usize) -> Self {
        Self { dims: dims.max(1) }
    }

    pub fn embed_text(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; self.dims];
        for token in tokenize(text) {
            let digest = Sha256::digest(token.as_bytes());
            let bucket = u64::from_le_bytes([
                digest[0], digest[1], digest[2], digest[3], digest[4], digest[5], digest[6],
                digest[7],
            ]) as usize
                % self.dims;
            let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
            v[bucket] += sign;
        }
        normalize(&mut v);
        v
    }
}

impl Default for HashEmbedder {
    fn default() -> Self {
        Self::new(384)
    }
}

#[async_trait]
impl Embedder for HashEmbedder {
    fn model_name(&self) -> &str {
        "feature-hash"
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
        Ok(texts.iter().map(|t| self.embed_text(t)).collect())
    }
}

/// Split text into lowercase identifier-like tokens.
pub fn tokenize(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
}

/// Scale `v` to unit length in place. Zero vectors are left untouched.
pub fn normalize(v: &mut [f32]) {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
}

/// Encode a float vector as a BLOB (little-endian f32 bytes).
///
/// ```rust
/// use codequest_core::embedding::{vec_to_blob, blob_to_vec};
///
/// let v = vec![1.0f32, -2.5, 3.125];
/// let blob = vec_to_blob(&v);
/// assert_eq!(blob.len(), 12);
/// assert_eq!(blob_to_vec(&blob), v);
/// ```
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB produced by [`vec_to_blob`].
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Cosine similarity in `[-1.0, 1.0]`; `0.0` for empty or mismatched
/// vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    dot / denom
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct CountingEmbedder {
        calls: AtomicUsize,
        texts: AtomicUsize,
        fail: bool,
    }

    impl CountingEmbedder {
        fn new(fail: bool) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                texts: AtomicUsize::new(0),
                fail,
            }
        }
    }

    #[async_trait]
    impl Embedder for CountingEmbedder {
        fn model_name(&self) -> &str {
            "counting"
        }
        fn dims(&self) -> usize {
            8
        }
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.texts.fetch_add(texts.len(), Ordering::SeqCst);
            if self.fail {
                return Err(EmbedError::ModelUnavailable("offline".into()));
            }
            Ok(texts.iter().map(|t| HashEmbedder::new(8).embed_text(t)).collect())
        }
    }

    #[tokio::test]
    async fn test_second_embed_is_cache_hit() {
        let inner = Arc::new(CountingEmbedder::new(false));
        let cached = CachedEmbedder::new(inner.clone(), 16);

        let a = cached.embed_one("fn parse_config()").await.unwrap();
        let b = cached.embed_one("fn parse_config()").await.unwrap();

        assert_eq!(a, b);
        assert_eq!(inner.calls.load(Ordering::SeqCst), 1);
        let stats = cached.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.model_calls, 1);
        assert_eq!(stats.entries, 1);
    }

    #[tokio::test]
    async fn test_batch_only_sends_misses() {
        let inner = Arc::new(CountingEmbedder::new(false));
        let cached = CachedEmbedder::new(inner.clone(), 16);
        cached.embed_one("alpha").await.unwrap();

        let texts = vec!["alpha".to_string(), "beta".to_string(), "gamma".to_string()];
        let out = cached.embed_batch(&texts).await.unwrap();

        assert_eq!(out.len(), 3);
        assert_eq!(inner.texts.load(Ordering::SeqCst), 3);
        assert_eq!(out[1], HashEmbedder::new(8).embed_text("beta"));
    }

    #[tokio::test]
    async fn test_lru_eviction() {
        let inner = Arc::new(CountingEmbedder::new(false));
        let cached = CachedEmbedder::new(inner.clone(), 2);
        for t in ["a", "b", "c"] {
            cached.embed_one(t).await.unwrap();
        }
        assert_eq!(cached.stats().entries, 2);
        cached.embed_one("a").await.unwrap();
        assert_eq!(inner.calls.load(Ordering::SeqCst), 4);
        cached.embed_one("c").await.unwrap();
        assert_eq!(inner.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_failures_are_not_cached() {
        let inner = Arc::new(CountingEmbedder::new(true));
        let cached = CachedEmbedder::new(inner.clone(), 4);
        let err = cached.embed_one("x").await.unwrap_err();
        assert!(matches!(err, EmbedError::ModelUnavailable(_)));
        assert!(cached.embed_one("x").await.is_err());
        assert_eq!(inner.calls.load(Ordering::SeqCst), 2);
        assert_eq!(cached.stats().entries, 0);
    }

    #[test]
    fn test_hash_embedder_deterministic_and_normalized() {
        let e = HashEmbedder::default();
        let a = e.embed_text("struct HttpClient { retries: u32 }");
        let b = e.embed_text("struct HttpClient { retries: u32 }");
        assert_eq!(a, b);
        assert_eq!(a.len(), 384);
        let norm: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_hash_embedder_similarity_tracks_overlap() {
        let e = HashEmbedder::default();
        let q = e.embed_text("database connection pool");
        let near = e.embed_text("open a database connection from the pool");
        let far = e.embed_text("render the svg icon button");
        assert!(cosine_similarity(&q, &near) > cosine_similarity(&q, &far));
    }

    #[test]
    fn test_cache_key_is_sha256_hex() {
        assert_eq!(
            cache_key("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_cosine_edge_cases() {
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 0.0]), 0.0);
        assert!((cosine_similarity(&[1.0, 0.0], &[-1.0, 0.0]) + 1.0).abs() < 1e-6);
    }
}
