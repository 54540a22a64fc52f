//! In-memory [`IndexStore`] implementation for tests and embedded use.
//!
//! One `RwLock` guards repositories and chunks together, so a per-file
//! upsert is atomic with respect to concurrent searches. Vector search is
//! brute-force cosine similarity; full-text search is BM25 over
//! identifier tokens, computed per query.

use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::Utc;

use crate::embedding::{cosine_similarity, tokenize};
use crate::models::{
    ChunkKey, IndexedChunk, IngestCounts, RepoStatus, RepositoryRecord, RepositoryRef,
    ScoredChunk,
};

use super::{ensure_searchable, query_terms, IndexStore, StoreError, StoreResult};

const BM25_K1: f64 = 1.2;
const BM25_B: f64 = 0.75;

struct StoredChunk {
    entry: IndexedChunk,
    seq: u64,
    term_freqs: HashMap<String, u32>,
    len: usize,
}

#[derive(Default)]
struct Inner {
    repos: HashMap<String, RepositoryRecord>,
    chunks: BTreeMap<ChunkKey, StoredChunk>,
    next_seq: u64,
}

impl Inner {
    fn repo_chunks<'a>(&'a self, repo_id: &'a str) -> impl Iterator<Item = &'a StoredChunk> + 'a {
        self.chunks
            .iter()
            .filter(move |(k, _)| k.repo_id == repo_id)
            .map(|(_, v)| v)
    }
}

/// In-memory chunk index.
#[derive(Default)]
pub struct InMemoryStore {
    inner: RwLock<Inner>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> StoreResult<std::sync::RwLockReadGuard<'_, Inner>> {
        self.inner
            .read()
            .map_err(|_| StoreError::Unavailable("in-memory store lock poisoned".into()))
    }

    fn write(&self) -> StoreResult<std::sync::RwLockWriteGuard<'_, Inner>> {
        self.inner
            .write()
            .map_err(|_| StoreError::Unavailable("in-memory store lock poisoned".into()))
    }

    /// Total number of stored chunks across all repositories.
    pub fn chunk_count(&self) -> usize {
        self.inner.read().map(|i| i.chunks.len()).unwrap_or(0)
    }
}

#[async_trait]
impl IndexStore for InMemoryStore {
    async fn begin_repository(&self, repo: &RepositoryRef) -> StoreResult<RepositoryRecord> {
        let mut inner = self.write()?;
        let now = Utc::now();
        let record = inner
            .repos
            .entry(repo.id.clone())
            .or_insert_with(|| RepositoryRecord {
                repo_id: repo.id.clone(),
                url: repo.url.clone(),
                status: RepoStatus::Indexing,
                file_count: 0,
                chunk_count: 0,
                indexed_at: None,
                updated_at: now,
            });
        record.url = repo.url.clone();
        record.status = RepoStatus::Indexing;
        record.updated_at = now;
        Ok(record.clone())
    }

    async fn upsert_chunks(
        &self,
        repo_id: &str,
        file_path: &str,
        chunks: &[IndexedChunk],
    ) -> StoreResult<()> {
        if let Some(bad) = chunks
            .iter()
            .find(|c| c.chunk.repo_id != repo_id || c.chunk.file_path != file_path)
        {
            return Err(StoreError::Rejected(format!(
                "chunk {} belongs to {}:{}, not {repo_id}:{file_path}",
                bad.chunk.chunk_id, bad.chunk.repo_id, bad.chunk.file_path
            )));
        }

        let mut inner = self.write()?;
        inner
            .chunks
            .retain(|k, _| !(k.repo_id == repo_id && k.file_path == file_path));

        for c in chunks {
            inner.next_seq += 1;
            let seq = inner.next_seq;
            let mut term_freqs: HashMap<String, u32> = HashMap::new();
            let mut len = 0;
            for t in tokenize(&c.chunk.content) {
                *term_freqs.entry(t).or_insert(0) += 1;
                len += 1;
            }
            inner.chunks.insert(
                c.chunk.key(),
                StoredChunk {
                    entry: c.clone(),
                    seq,
                    term_freqs,
                    len,
                },
            );
        }
        Ok(())
    }

    async fn retain_files(&self, repo_id: &str, keep: &[String]) -> StoreResult<usize> {
        let mut inner = self.write()?;
        let mut removed: Vec<String> = Vec::new();
        inner.chunks.retain(|k, _| {
            let drop = k.repo_id == repo_id && !keep.contains(&k.file_path);
            if drop && !removed.contains(&k.file_path) {
                removed.push(k.file_path.clone());
            }
            !drop
        });
        Ok(removed.len())
    }

    async fn finish_repository(
        &self,
        repo_id: &str,
        status: RepoStatus,
        counts: IngestCounts,
    ) -> StoreResult<RepositoryRecord> {
        let mut inner = self.write()?;
        let record = inner
            .repos
            .get_mut(repo_id)
            .ok_or_else(|| StoreError::Rejected(format!("unknown repository {repo_id}")))?;
        let now = Utc::now();
        record.status = status;
        record.updated_at = now;
        if matches!(status, RepoStatus::Ready | RepoStatus::Degraded) {
            record.indexed_at = Some(now);
            record.file_count = counts.files;
            record.chunk_count = counts.chunks;
        }
        Ok(record.clone())
    }

    async fn repository(&self, repo_id: &str) -> StoreResult<Option<RepositoryRecord>> {
        Ok(self.read()?.repos.get(repo_id).cloned())
    }

    async fn list_repositories(&self) -> StoreResult<Vec<RepositoryRecord>> {
        let mut repos: Vec<_> = self.read()?.repos.values().cloned().collect();
        repos.sort_by(|a, b| a.repo_id.cmp(&b.repo_id));
        Ok(repos)
    }

    async fn file_chunk_ids(&self, repo_id: &str, file_path: &str) -> StoreResult<Vec<String>> {
        let inner = self.read()?;
        let mut chunks: Vec<_> = inner
            .repo_chunks(repo_id)
            .filter(|c| c.entry.chunk.file_path == file_path)
            .map(|c| (c.entry.chunk.chunk_index, c.entry.chunk.chunk_id.clone()))
            .collect();
        chunks.sort();
        Ok(chunks.into_iter().map(|(_, id)| id).collect())
    }

    async fn delete_repository(&self, repo_id: &str) -> StoreResult<()> {
        let mut inner = self.write()?;
        inner.chunks.retain(|k, _| k.repo_id != repo_id);
        inner.repos.remove(repo_id);
        Ok(())
    }

    async fn vector_search(
        &self,
        repo_id: &str,
        query_vec: &[f32],
        k: usize,
    ) -> StoreResult<Vec<ScoredChunk>> {
        let inner = self.read()?;
        ensure_searchable(repo_id, inner.repos.get(repo_id))?;

        let mut scored: Vec<(f64, u64, &StoredChunk)> = inner
            .repo_chunks(repo_id)
            .filter_map(|c| {
                c.entry
                    .embedding
                    .as_ref()
                    .map(|v| (cosine_similarity(query_vec, v) as f64, c.seq, c))
            })
            .collect();
        scored.sort_by(|a, b| {
            b.0.partial_cmp(&a.0)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(b.1.cmp(&a.1))
        });
        scored.truncate(k);

        Ok(scored
            .into_iter()
            .map(|(score, _, c)| ScoredChunk {
                chunk: c.entry.chunk.clone(),
                score,
            })
            .collect())
    }

    async fn fulltext_search(
        &self,
        repo_id: &str,
        query: &str,
        k: usize,
    ) -> StoreResult<Vec<ScoredChunk>> {
        let inner = self.read()?;
        ensure_searchable(repo_id, inner.repos.get(repo_id))?;

        let terms = query_terms(query);
        if terms.is_empty() || k == 0 {
            return Ok(Vec::new());
        }

        let docs: Vec<&StoredChunk> = inner.repo_chunks(repo_id).collect();
        let n = docs.len() as f64;
        let avg_len = if docs.is_empty() {
            0.0
        } else {
            docs.iter().map(|d| d.len as f64).sum::<f64>() / n
        };
        let idf: Vec<f64> = terms
            .iter()
            .map(|t| {
                let df = docs.iter().filter(|d| d.term_freqs.contains_key(t)).count() as f64;
                ((n - df + 0.5) / (df + 0.5) + 1.0).ln()
            })
            .collect();

        let mut scored: Vec<(f64, u64, &StoredChunk)> = docs
            .iter()
            .filter_map(|d| {
                let mut score = 0.0;
                let mut matched = false;
                for (term, idf) in terms.iter().zip(&idf) {
                    if let Some(&tf) = d.term_freqs.get(term) {
                        matched = true;
                        let tf = tf as f64;
                        let norm = 1.0 - BM25_B + BM25_B * d.len as f64 / avg_len.max(1.0);
                        score += idf * tf * (BM25_K1 + 1.0) / (tf + BM25_K1 * norm);
                    }
                }
                matched.then_some((score, d.seq, *d))
            })
            .collect();
        scored.sort_by(|a, b| {
            b.0.partial_cmp(&a.0)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(b.1.cmp(&a.1))
        });
        scored.truncate(k);

        Ok(scored
            .into_iter()
            .map(|(score, _, c)| ScoredChunk {
                chunk: c.entry.chunk.clone(),
                score,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::{chunk_id_for, content_hash};
    use crate::models::{Chunk, ChunkMetadata};

    fn chunk(repo: &str, path: &str, index: usize, content: &str) -> Chunk {
        Chunk {
            repo_id: repo.into(),
            file_path: path.into(),
            chunk_id: chunk_id_for(path, index),
            chunk_index: index,
            content: content.into(),
            language: "rust".into(),
            content_hash: content_hash(content),
            metadata: ChunkMetadata {
                start_line: 1,
                end_line: 1,
                symbols: vec![],
            },
        }
    }

    fn indexed(c: Chunk, v: Option<Vec<f32>>) -> IndexedChunk {
        IndexedChunk {
            chunk: c,
            embedding: v,
        }
    }

    async fn ready_store(repo: &str) -> InMemoryStore {
        let store = InMemoryStore::new();
        store
            .begin_repository(&RepositoryRef {
                id: repo.into(),
                url: format!("https://github.com/{repo}"),
            })
            .await
            .unwrap();
        store
    }

    async fn finish(store: &InMemoryStore, repo: &str) {
        store
            .finish_repository(repo, RepoStatus::Ready, IngestCounts::default())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_search_before_ingest_is_not_indexed() {
        let store = ready_store("a/b").await;
        let err = store.fulltext_search("a/b", "x", 5).await.unwrap_err();
        assert_eq!(err, StoreError::NotIndexed("a/b".into()));
        let err = store.vector_search("a/b", &[1.0], 5).await.unwrap_err();
        assert_eq!(err, StoreError::NotIndexed("a/b".into()));
        assert!(store.fulltext_search("zz/none", "x", 5).await.is_err());
    }

    #[tokio::test]
    async fn test_upsert_is_idempotent() {
        let store = ready_store("a/b").await;
        let chunks = vec![
            indexed(chunk("a/b", "src/lib.rs", 0, "fn one() {}"), Some(vec![1.0, 0.0])),
            indexed(chunk("a/b", "src/lib.rs", 1, "fn two() {}"), None),
        ];
        store.upsert_chunks("a/b", "src/lib.rs", &chunks).await.unwrap();
        store.upsert_chunks("a/b", "src/lib.rs", &chunks).await.unwrap();
        assert_eq!(store.chunk_count(), 2);
        assert_eq!(
            store.file_chunk_ids("a/b", "src/lib.rs").await.unwrap(),
            vec![chunk_id_for("src/lib.rs", 0), chunk_id_for("src/lib.rs", 1)]
        );
    }

    #[tokio::test]
    async fn test_upsert_replaces_shrunk_file() {
        let store = ready_store("a/b").await;
        let three: Vec<_> = (0..3)
            .map(|i| indexed(chunk("a/b", "x.rs", i, "fn f() {}"), None))
            .collect();
        store.upsert_chunks("a/b", "x.rs", &three).await.unwrap();
        store.upsert_chunks("a/b", "x.rs", &three[..1]).await.unwrap();
        assert_eq!(store.file_chunk_ids("a/b", "x.rs").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_upsert_rejects_foreign_chunks() {
        let store = ready_store("a/b").await;
        let wrong = vec![indexed(chunk("a/b", "other.rs", 0, "x"), None)];
        let err = store.upsert_chunks("a/b", "x.rs", &wrong).await.unwrap_err();
        assert!(matches!(err, StoreError::Rejected(_)));
    }

    #[tokio::test]
    async fn test_vector_search_ranks_and_breaks_ties_by_recency() {
        let store = ready_store("a/b").await;
        store
            .upsert_chunks(
                "a/b",
                "old.rs",
                &[indexed(chunk("a/b", "old.rs", 0, "old"), Some(vec![1.0, 0.0]))],
            )
            .await
            .unwrap();
        store
            .upsert_chunks(
                "a/b",
                "new.rs",
                &[
                    indexed(chunk("a/b", "new.rs", 0, "new"), Some(vec![1.0, 0.0])),
                    indexed(chunk("a/b", "new.rs", 1, "far"), Some(vec![0.0, 1.0])),
                    indexed(chunk("a/b", "new.rs", 2, "none"), None),
                ],
            )
            .await
            .unwrap();
        finish(&store, "a/b").await;

        let hits = store.vector_search("a/b", &[1.0, 0.0], 10).await.unwrap();
        assert_eq!(hits.len(), 3);
        assert_eq!(hits[0].chunk.file_path, "new.rs");
        assert_eq!(hits[1].chunk.file_path, "old.rs");
        assert_eq!(hits[2].chunk.content, "far");

        let top1 = store.vector_search("a/b", &[1.0, 0.0], 1).await.unwrap();
        assert_eq!(top1.len(), 1);
    }

    #[tokio::test]
    async fn test_fulltext_bm25_excludes_non_matching() {
        let store = ready_store("a/b").await;
        store
            .upsert_chunks(
                "a/b",
                "db.rs",
                &[
                    indexed(chunk("a/b", "db.rs", 0, "connection pool connection retry"), None),
                    indexed(chunk("a/b", "db.rs", 1, "open connection once"), None),
                    indexed(chunk("a/b", "db.rs", 2, "render widget"), None),
                ],
            )
            .await
            .unwrap();
        finish(&store, "a/b").await;

        let hits = store.fulltext_search("a/b", "connection", 10).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].chunk.chunk_index, 0);
        assert!(hits[0].score > hits[1].score);
        assert!(store
            .fulltext_search("a/b", "nonexistent", 10)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_searches_scoped_to_repository() {
        let store = ready_store("a/b").await;
        store
            .begin_repository(&RepositoryRef {
                id: "c/d".into(),
                url: "https://github.com/c/d".into(),
            })
            .await
            .unwrap();
        store
            .upsert_chunks("c/d", "m.rs", &[indexed(chunk("c/d", "m.rs", 0, "token"), None)])
            .await
            .unwrap();
        finish(&store, "a/b").await;
        finish(&store, "c/d").await;
        assert!(store.fulltext_search("a/b", "token", 5).await.unwrap().is_empty());
        assert_eq!(store.fulltext_search("c/d", "token", 5).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_retain_files_and_failed_ingest() {
        let store = ready_store("a/b").await;
        for path in ["a.rs", "b.rs", "c.rs"] {
            store
                .upsert_chunks("a/b", path, &[indexed(chunk("a/b", path, 0, "x"), None)])
                .await
                .unwrap();
        }
        let removed = store
            .retain_files("a/b", &["a.rs".to_string()])
            .await
            .unwrap();
        assert_eq!(removed, 2);
        assert_eq!(store.chunk_count(), 1);

        let record = store
            .finish_repository("a/b", RepoStatus::Failed, IngestCounts::default())
            .await
            .unwrap();
        assert!(record.indexed_at.is_none());
        assert!(store.fulltext_search("a/b", "x", 5).await.is_err());
    }
}
