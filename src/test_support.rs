//! Index stores that misbehave on purpose, shared by unit tests.

use async_trait::async_trait;

use codequest_core::models::{
    IndexedChunk, IngestCounts, RepoStatus, RepositoryRecord, RepositoryRef, ScoredChunk,
};
use codequest_core::store::{IndexStore, StoreError, StoreResult};

fn down<T>() -> StoreResult<T> {
    Err(StoreError::Unavailable("disk I/O error".into()))
}

/// Store whose every call fails.
pub struct UnreachableStore;

#[async_trait]
impl IndexStore for UnreachableStore {
    async fn begin_repository(&self, _repo: &RepositoryRef) -> StoreResult<RepositoryRecord> {
        down()
    }
    async fn upsert_chunks(&self, _: &str, _: &str, _: &[IndexedChunk]) -> StoreResult<()> {
        down()
    }
    async fn retain_files(&self, _: &str, _: &[String]) -> StoreResult<usize> {
        down()
    }
    async fn finish_repository(
        &self,
        _: &str,
        _: RepoStatus,
        _: IngestCounts,
    ) -> StoreResult<RepositoryRecord> {
        down()
    }
    async fn repository(&self, _: &str) -> StoreResult<Option<RepositoryRecord>> {
        down()
    }
    async fn list_repositories(&self) -> StoreResult<Vec<RepositoryRecord>> {
        down()
    }
    async fn file_chunk_ids(&self, _: &str, _: &str) -> StoreResult<Vec<String>> {
        down()
    }
    async fn delete_repository(&self, _: &str) -> StoreResult<()> {
        down()
    }
    async fn vector_search(&self, _: &str, _: &[f32], _: usize) -> StoreResult<Vec<ScoredChunk>> {
        down()
    }
    async fn fulltext_search(&self, _: &str, _: &str, _: usize) -> StoreResult<Vec<ScoredChunk>> {
        down()
    }
}

/// Store whose searches never answer; everything else fails fast.
pub struct HangingStore;

#[async_trait]
impl IndexStore for HangingStore {
    async fn begin_repository(&self, _repo: &RepositoryRef) -> StoreResult<RepositoryRecord> {
        down()
    }
    async fn upsert_chunks(&self, _: &str, _: &str, _: &[IndexedChunk]) -> StoreResult<()> {
        down()
    }
    async fn retain_files(&self, _: &str, _: &[String]) -> StoreResult<usize> {
        down()
    }
    async fn finish_repository(
        &self,
        _: &str,
        _: RepoStatus,
        _: IngestCounts,
    ) -> StoreResult<RepositoryRecord> {
        down()
    }
    async fn repository(&self, _: &str) -> StoreResult<Option<RepositoryRecord>> {
        down()
    }
    async fn list_repositories(&self) -> StoreResult<Vec<RepositoryRecord>> {
        down()
    }
    async fn file_chunk_ids(&self, _: &str, _: &str) -> StoreResult<Vec<String>> {
        down()
    }
    async fn delete_repository(&self, _: &str) -> StoreResult<()> {
        down()
    }
    async fn vector_search(&self, _: &str, _: &[f32], _: usize) -> StoreResult<Vec<ScoredChunk>> {
        std::future::pending().await
    }
    async fn fulltext_search(&self, _: &str, _: &str, _: usize) -> StoreResult<Vec<ScoredChunk>> {
        std::future::pending().await
    }
}
