//! Ingestion pipeline: source files → chunks → embeddings → index store.
//!
//! Files are processed through a bounded window of `ingest.workers`
//! concurrent tasks. Each file is chunked, embedded in batches through the
//! shared cache, and written with a single atomic per-file upsert.
//!
//! Failures are absorbed where possible:
//! - an embedding batch that still fails after retries stores its chunks
//!   without vectors (full-text search still finds them)
//! - a file whose write fails or times out keeps its previous chunks
//!
//! Both are reported as `IndexingDegraded`. Only an unreachable store at
//! the start or end of the ingest fails the whole operation.

use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use codequest_core::chunk::Chunker;
use codequest_core::embedding::{CacheStats, CachedEmbedder};
use codequest_core::models::{
    Chunk, IndexedChunk, IngestCounts, RepoStatus, RepositoryRef, SourceFile,
};
use codequest_core::store::{IndexStore, StoreError, StoreResult};

use crate::config::Config;
use crate::embedding::{embed_with_retry, RetryPolicy};
use crate::error::{Degradation, DegradationKind};
use crate::progress::format_number;

#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("indexing cancelled")]
    Cancelled,
}

/// Outcome of indexing one repository.
#[derive(Debug, Clone, Serialize)]
pub struct IndexReport {
    pub repo_id: String,
    pub status: RepoStatus,
    pub files_indexed: usize,
    pub files_failed: usize,
    pub files_removed: usize,
    pub chunks: usize,
    pub chunks_without_vectors: usize,
    pub degradations: Vec<Degradation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache: Option<CacheStats>,
}

impl IndexReport {
    pub fn summary(&self) -> String {
        format!(
            "{} files, {} chunks ({})",
            format_number(self.files_indexed as u64),
            format_number(self.chunks as u64),
            self.status.as_str()
        )
    }
}

#[derive(Debug, Default)]
struct FileOutcome {
    path: String,
    chunks: usize,
    without_vectors: usize,
    error: Option<String>,
}

/// Writes repositories into an [`IndexStore`].
pub struct Indexer {
    chunker: Chunker,
    embedder: Option<Arc<CachedEmbedder>>,
    store: Arc<dyn IndexStore>,
    retry: RetryPolicy,
    batch_size: usize,
    workers: usize,
    store_timeout: Duration,
}

impl Indexer {
    pub fn new(
        config: &Config,
        embedder: Option<Arc<CachedEmbedder>>,
        store: Arc<dyn IndexStore>,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            chunker: Chunker::new(config.chunking.chunker_config())?,
            embedder,
            store,
            retry: RetryPolicy::from_config(&config.embedding),
            batch_size: config.embedding.batch_size.max(1),
            workers: config.ingest.workers.max(1),
            store_timeout: Duration::from_secs(config.ingest.store_timeout_secs),
        })
    }

    pub fn store(&self) -> &Arc<dyn IndexStore> {
        &self.store
    }

    async fn store_call<T>(&self, fut: impl Future<Output = StoreResult<T>>) -> StoreResult<T> {
        tokio::time::timeout(self.store_timeout, fut)
            .await
            .map_err(|_| {
                StoreError::Unavailable(format!(
                    "store call timed out after {}s",
                    self.store_timeout.as_secs()
                ))
            })?
    }

    /// Index every file of `repo`, replacing what was stored before.
    pub async fn index_repository(
        &self,
        repo: &RepositoryRef,
        files: &[SourceFile],
        cancel: &CancellationToken,
    ) -> Result<IndexReport, IndexError> {
        self.store_call(self.store.begin_repository(repo)).await?;
        tracing::info!(repo = %repo.id, files = files.len(), "indexing repository");

        let mut outcomes = Vec::with_capacity(files.len());
        {
            let futures: Vec<_> = files
                .iter()
                .map(|file| self.index_file(&repo.id, file, cancel))
                .collect();
            let mut pending = stream::iter(futures).buffer_unordered(self.workers);
            while let Some(outcome) = pending.next().await {
                if cancel.is_cancelled() {
                    break;
                }
                outcomes.push(outcome);
            }
        }

        if cancel.is_cancelled() {
            let counts = tally(&outcomes);
            if let Err(e) = self
                .store_call(self.store.finish_repository(&repo.id, RepoStatus::Failed, counts))
                .await
            {
                tracing::warn!(repo = %repo.id, error = %e, "could not mark cancelled ingest");
            }
            return Err(IndexError::Cancelled);
        }

        let mut degradations = Vec::new();

        let keep: Vec<String> = files.iter().map(|f| f.path.clone()).collect();
        let files_removed = match self.store_call(self.store.retain_files(&repo.id, &keep)).await {
            Ok(n) => n,
            Err(e) => {
                degradations.push(Degradation::new(
                    DegradationKind::IndexingDegraded,
                    format!("stale files not removed: {e}"),
                ));
                0
            }
        };

        let failed: Vec<&FileOutcome> = outcomes.iter().filter(|o| o.error.is_some()).collect();
        let chunks: usize = outcomes.iter().filter(|o| o.error.is_none()).map(|o| o.chunks).sum();
        let chunks_without_vectors: usize = outcomes
            .iter()
            .filter(|o| o.error.is_none())
            .map(|o| o.without_vectors)
            .sum();

        if chunks_without_vectors > 0 {
            degradations.push(Degradation::new(
                DegradationKind::IndexingDegraded,
                format!(
                    "{} of {} chunks stored without vectors",
                    chunks_without_vectors, chunks
                ),
            ));
        }
        if let Some(first) = failed.first() {
            degradations.push(Degradation::new(
                DegradationKind::IndexingDegraded,
                format!(
                    "{} file(s) not indexed; first: {}: {}",
                    failed.len(),
                    first.path,
                    first.error.as_deref().unwrap_or("unknown error")
                ),
            ));
        }

        let status = if !files.is_empty() && failed.len() == files.len() {
            RepoStatus::Failed
        } else if degradations.is_empty() {
            RepoStatus::Ready
        } else {
            RepoStatus::Degraded
        };

        let counts = tally(&outcomes);
        self.store_call(self.store.finish_repository(&repo.id, status, counts))
            .await?;

        let report = IndexReport {
            repo_id: repo.id.clone(),
            status,
            files_indexed: counts.files,
            files_failed: failed.len(),
            files_removed,
            chunks,
            chunks_without_vectors,
            degradations,
            cache: self.embedder.as_ref().map(|e| e.stats()),
        };
        tracing::info!(repo = %repo.id, summary = %report.summary(), "indexing finished");
        Ok(report)
    }

    async fn index_file(
        &self,
        repo_id: &str,
        file: &SourceFile,
        cancel: &CancellationToken,
    ) -> FileOutcome {
        let mut outcome = FileOutcome {
            path: file.path.clone(),
            ..FileOutcome::default()
        };
        if cancel.is_cancelled() {
            outcome.error = Some("cancelled".to_string());
            return outcome;
        }

        let chunks: Vec<Chunk> = self.chunker.chunks(repo_id, file).collect();
        outcome.chunks = chunks.len();

        let mut embeddings: Vec<Option<Vec<f32>>> = vec![None; chunks.len()];
        if let Some(embedder) = &self.embedder {
            for (batch_no, batch) in chunks.chunks(self.batch_size).enumerate() {
                let texts: Vec<String> = batch.iter().map(|c| c.content.clone()).collect();
                match embed_with_retry(embedder, &texts, self.retry).await {
                    Ok(vectors) => {
                        let offset = batch_no * self.batch_size;
                        for (i, v) in vectors.into_iter().enumerate() {
                            embeddings[offset + i] = Some(v);
                        }
                    }
                    Err(e) => {
                        tracing::warn!(file = %file.path, error = %e, "embedding failed, storing chunks without vectors");
                        outcome.without_vectors += batch.len();
                    }
                }
            }
        }

        let indexed: Vec<IndexedChunk> = chunks
            .into_iter()
            .zip(embeddings)
            .map(|(chunk, embedding)| IndexedChunk { chunk, embedding })
            .collect();

        if let Err(e) = self
            .store_call(self.store.upsert_chunks(repo_id, &file.path, &indexed))
            .await
        {
            tracing::warn!(file = %file.path, error = %e, "chunk write failed");
            outcome.error = Some(e.to_string());
        } else {
            tracing::debug!(file = %file.path, chunks = outcome.chunks, "file indexed");
        }
        outcome
    }
}

fn tally(outcomes: &[FileOutcome]) -> IngestCounts {
    let ok = outcomes.iter().filter(|o| o.error.is_none());
    IngestCounts {
        files: ok.clone().count(),
        chunks: ok.map(|o| o.chunks).sum(),
    }
}
