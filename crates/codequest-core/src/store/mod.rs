//! Storage abstraction for the chunk index.
//!
//! The [`IndexStore`] trait defines every operation ingestion and search
//! need, so backends are pluggable: [`memory::InMemoryStore`] here and the
//! SQLite store in the `codequest` app crate.
//!
//! Implementations must be `Send + Sync` to work with async runtimes.

pub mod memory;

use async_trait::async_trait;

use crate::embedding::tokenize;
use crate::models::{
    IndexedChunk, IngestCounts, RepoStatus, RepositoryRecord, RepositoryRef, ScoredChunk,
};

/// Errors surfaced by index stores.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// The backend could not be reached, timed out, or failed mid-operation.
    #[error("index store unavailable: {0}")]
    Unavailable(String),
    /// Search was attempted before the repository finished an ingest.
    #[error("repository {0} has not been indexed")]
    NotIndexed(String),
    /// The request itself is malformed (e.g. chunks for another file).
    #[error("rejected by index store: {0}")]
    Rejected(String),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Abstract chunk index.
///
/// # Operations
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`begin_repository`](IndexStore::begin_repository) | Register or refresh a repository, mark it `indexing` |
/// | [`upsert_chunks`](IndexStore::upsert_chunks) | Atomically replace one file's chunks |
/// | [`retain_files`](IndexStore::retain_files) | Drop files that disappeared since the last ingest |
/// | [`finish_repository`](IndexStore::finish_repository) | Record the ingest outcome |
/// | [`vector_search`](IndexStore::vector_search) | Cosine similarity search |
/// | [`fulltext_search`](IndexStore::fulltext_search) | BM25 keyword search |
#[async_trait]
pub trait IndexStore: Send + Sync {
    /// Create the repository record on first ingest or mark an existing one
    /// `indexing`. A previously completed index stays searchable.
    async fn begin_repository(&self, repo: &RepositoryRef) -> StoreResult<RepositoryRecord>;

    /// Replace every chunk of `file_path` with `chunks` in one atomic step.
    /// Re-running with identical input leaves the index unchanged.
    async fn upsert_chunks(
        &self,
        repo_id: &str,
        file_path: &str,
        chunks: &[IndexedChunk],
    ) -> StoreResult<()>;

    /// Remove chunks of files not listed in `keep`. Returns the number of
    /// files removed.
    async fn retain_files(&self, repo_id: &str, keep: &[String]) -> StoreResult<usize>;

    /// Record the ingest outcome. `Ready` and `Degraded` stamp `indexed_at`;
    /// `Failed` leaves it unchanged.
    async fn finish_repository(
        &self,
        repo_id: &str,
        status: RepoStatus,
        counts: IngestCounts,
    ) -> StoreResult<RepositoryRecord>;

    async fn repository(&self, repo_id: &str) -> StoreResult<Option<RepositoryRecord>>;

    async fn list_repositories(&self) -> StoreResult<Vec<RepositoryRecord>>;

    /// Chunk ids currently stored for one file, in chunk order.
    async fn file_chunk_ids(&self, repo_id: &str, file_path: &str) -> StoreResult<Vec<String>>;

    async fn delete_repository(&self, repo_id: &str) -> StoreResult<()>;

    /// Up to `k` chunks with the highest cosine similarity to `query_vec`.
    /// Equal scores rank the most recently indexed chunk first.
    async fn vector_search(
        &self,
        repo_id: &str,
        query_vec: &[f32],
        k: usize,
    ) -> StoreResult<Vec<ScoredChunk>>;

    /// Up to `k` chunks with the highest BM25 relevance to `query`. Chunks
    /// containing none of the query terms are never returned.
    async fn fulltext_search(
        &self,
        repo_id: &str,
        query: &str,
        k: usize,
    ) -> StoreResult<Vec<ScoredChunk>>;
}

/// Fail with [`StoreError::NotIndexed`] unless `record` completed an ingest.
pub fn ensure_searchable(repo_id: &str, record: Option<&RepositoryRecord>) -> StoreResult<()> {
    match record {
        Some(r) if r.is_searchable() => Ok(()),
        _ => Err(StoreError::NotIndexed(repo_id.to_string())),
    }
}

/// Distinct lowercase terms of a full-text query, in first-seen order.
pub fn query_terms(query: &str) -> Vec<String> {
    let mut terms: Vec<String> = Vec::new();
    for t in tokenize(query) {
        if !terms.contains(&t) {
            terms.push(t);
        }
    }
    terms
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_query_terms_dedup_and_lowercase() {
        assert_eq!(
            query_terms("Parse the CONFIG, parse_config; config?"),
            vec!["parse", "the", "config", "parse_config"]
        );
        assert!(query_terms("  ,;  ").is_empty());
    }

    #[test]
    fn test_ensure_searchable() {
        let mut record = RepositoryRecord {
            repo_id: "a/b".into(),
            url: "https://github.com/a/b".into(),
            status: RepoStatus::Indexing,
            file_count: 0,
            chunk_count: 0,
            indexed_at: None,
            updated_at: Utc::now(),
        };
        assert_eq!(
            ensure_searchable("a/b", Some(&record)),
            Err(StoreError::NotIndexed("a/b".into()))
        );
        assert!(ensure_searchable("a/b", None).is_err());
        record.indexed_at = Some(Utc::now());
        assert!(ensure_searchable("a/b", Some(&record)).is_ok());
    }
}
