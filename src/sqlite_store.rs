//! SQLite-backed [`IndexStore`] implementation.
//!
//! Chunks live in `code_chunks` with their vectors as little-endian f32
//! BLOBs; `code_chunks_fts` mirrors the content for FTS5 keyword search
//! using the chunk's `seq` as its rowid. A per-file upsert deletes and
//! re-inserts both inside one transaction.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use codequest_core::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};
use codequest_core::models::{
    Chunk, ChunkMetadata, IndexedChunk, IngestCounts, RepoStatus, RepositoryRecord,
    RepositoryRef, ScoredChunk,
};
use codequest_core::store::{
    ensure_searchable, query_terms, IndexStore, StoreError, StoreResult,
};

use crate::config::Config;
use crate::{db, migrate};

/// SQLite implementation of the [`IndexStore`] trait.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Connect to the configured database and apply migrations.
    pub async fn open(config: &Config) -> anyhow::Result<Self> {
        let pool = db::connect(config).await?;
        migrate::apply(&pool).await?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn unavailable(e: sqlx::Error) -> StoreError {
    StoreError::Unavailable(e.to_string())
}

fn ts_to_datetime(ts: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(ts, 0).unwrap_or_default()
}

fn row_to_record(row: &SqliteRow) -> StoreResult<RepositoryRecord> {
    let status: String = row.try_get("status").map_err(unavailable)?;
    let indexed_at: Option<i64> = row.try_get("indexed_at").map_err(unavailable)?;
    let file_count: i64 = row.try_get("file_count").map_err(unavailable)?;
    let chunk_count: i64 = row.try_get("chunk_count").map_err(unavailable)?;
    Ok(RepositoryRecord {
        repo_id: row.try_get("repo_id").map_err(unavailable)?,
        url: row.try_get("url").map_err(unavailable)?,
        status: RepoStatus::parse(&status)
            .ok_or_else(|| StoreError::Unavailable(format!("corrupt repository status '{status}'")))?,
        file_count: file_count as usize,
        chunk_count: chunk_count as usize,
        indexed_at: indexed_at.map(ts_to_datetime),
        updated_at: ts_to_datetime(row.try_get("updated_at").map_err(unavailable)?),
    })
}

fn row_to_chunk(row: &SqliteRow) -> StoreResult<Chunk> {
    let metadata_json: String = row.try_get("metadata_json").map_err(unavailable)?;
    let chunk_index: i64 = row.try_get("chunk_index").map_err(unavailable)?;
    Ok(Chunk {
        repo_id: row.try_get("repo_id").map_err(unavailable)?,
        file_path: row.try_get("file_path").map_err(unavailable)?,
        chunk_id: row.try_get("chunk_id").map_err(unavailable)?,
        chunk_index: chunk_index as usize,
        content: row.try_get("content").map_err(unavailable)?,
        language: row.try_get("language").map_err(unavailable)?,
        content_hash: row.try_get("content_hash").map_err(unavailable)?,
        metadata: serde_json::from_str::<ChunkMetadata>(&metadata_json).unwrap_or_default(),
    })
}

/// FTS5 query matching any of the terms. Each term is quoted so query
/// text can never inject FTS syntax.
fn fts_match_expr(query: &str) -> Option<String> {
    let terms = query_terms(query);
    if terms.is_empty() {
        return None;
    }
    Some(
        terms
            .iter()
            .map(|t| format!("\"{t}\""))
            .collect::<Vec<_>>()
            .join(" OR "),
    )
}

const CHUNK_COLUMNS: &str = "c.seq, c.repo_id, c.file_path, c.chunk_id, c.chunk_index, \
                             c.content, c.language, c.content_hash, c.metadata_json";

impl SqliteStore {
    async fn ensure_searchable(&self, repo_id: &str) -> StoreResult<()> {
        let record = self.repository(repo_id).await?;
        ensure_searchable(repo_id, record.as_ref())
    }
}

#[async_trait]
impl IndexStore for SqliteStore {
    async fn begin_repository(&self, repo: &RepositoryRef) -> StoreResult<RepositoryRecord> {
        let now = Utc::now().timestamp();
        sqlx::query(
            r#"
            INSERT INTO repositories (repo_id, url, status, updated_at)
            VALUES (?, ?, 'indexing', ?)
            ON CONFLICT(repo_id) DO UPDATE SET
                url = excluded.url,
                status = 'indexing',
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&repo.id)
        .bind(&repo.url)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(unavailable)?;

        self.repository(&repo.id)
            .await?
            .ok_or_else(|| StoreError::Unavailable(format!("repository {} vanished", repo.id)))
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

        let now = Utc::now().timestamp();
        let mut tx = self.pool.begin().await.map_err(unavailable)?;

        sqlx::query(
            "DELETE FROM code_chunks_fts WHERE rowid IN \
             (SELECT seq FROM code_chunks WHERE repo_id = ? AND file_path = ?)",
        )
        .bind(repo_id)
        .bind(file_path)
        .execute(&mut *tx)
        .await
        .map_err(unavailable)?;

        sqlx::query("DELETE FROM code_chunks WHERE repo_id = ? AND file_path = ?")
            .bind(repo_id)
            .bind(file_path)
            .execute(&mut *tx)
            .await
            .map_err(unavailable)?;

        for entry in chunks {
            let chunk = &entry.chunk;
            let metadata_json = serde_json::to_string(&chunk.metadata)
                .map_err(|e| StoreError::Rejected(e.to_string()))?;
            let blob = entry.embedding.as_deref().map(vec_to_blob);

            let result = sqlx::query(
                r#"
                INSERT INTO code_chunks (repo_id, file_path, chunk_id, chunk_index, content,
                                         language, content_hash, metadata_json, embedding, indexed_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&chunk.repo_id)
            .bind(&chunk.file_path)
            .bind(&chunk.chunk_id)
            .bind(chunk.chunk_index as i64)
            .bind(&chunk.content)
            .bind(&chunk.language)
            .bind(&chunk.content_hash)
            .bind(&metadata_json)
            .bind(blob)
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(unavailable)?;

            sqlx::query("INSERT INTO code_chunks_fts (rowid, repo_id, content) VALUES (?, ?, ?)")
                .bind(result.last_insert_rowid())
                .bind(&chunk.repo_id)
                .bind(&chunk.content)
                .execute(&mut *tx)
                .await
                .map_err(unavailable)?;
        }

        tx.commit().await.map_err(unavailable)?;
        Ok(())
    }

    async fn retain_files(&self, repo_id: &str, keep: &[String]) -> StoreResult<usize> {
        let stored: Vec<String> =
            sqlx::query_scalar("SELECT DISTINCT file_path FROM code_chunks WHERE repo_id = ?")
                .bind(repo_id)
                .fetch_all(&self.pool)
                .await
                .map_err(unavailable)?;
        let stale: Vec<&String> = stored.iter().filter(|p| !keep.contains(p)).collect();
        if stale.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await.map_err(unavailable)?;
        for path in &stale {
            sqlx::query(
                "DELETE FROM code_chunks_fts WHERE rowid IN \
                 (SELECT seq FROM code_chunks WHERE repo_id = ? AND file_path = ?)",
            )
            .bind(repo_id)
            .bind(path.as_str())
            .execute(&mut *tx)
            .await
            .map_err(unavailable)?;
            sqlx::query("DELETE FROM code_chunks WHERE repo_id = ? AND file_path = ?")
                .bind(repo_id)
                .bind(path.as_str())
                .execute(&mut *tx)
                .await
                .map_err(unavailable)?;
        }
        tx.commit().await.map_err(unavailable)?;
        Ok(stale.len())
    }

    async fn finish_repository(
        &self,
        repo_id: &str,
        status: RepoStatus,
        counts: IngestCounts,
    ) -> StoreResult<RepositoryRecord> {
        let now = Utc::now().timestamp();
        let result = if matches!(status, RepoStatus::Ready | RepoStatus::Degraded) {
            sqlx::query(
                "UPDATE repositories SET status = ?, updated_at = ?, indexed_at = ?, \
                 file_count = ?, chunk_count = ? WHERE repo_id = ?",
            )
            .bind(status.as_str())
            .bind(now)
            .bind(now)
            .bind(counts.files as i64)
            .bind(counts.chunks as i64)
            .bind(repo_id)
            .execute(&self.pool)
            .await
        } else {
            sqlx::query("UPDATE repositories SET status = ?, updated_at = ? WHERE repo_id = ?")
                .bind(status.as_str())
                .bind(now)
                .bind(repo_id)
                .execute(&self.pool)
                .await
        }
        .map_err(unavailable)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::Rejected(format!("unknown repository {repo_id}")));
        }
        self.repository(repo_id)
            .await?
            .ok_or_else(|| StoreError::Unavailable(format!("repository {repo_id} vanished")))
    }

    async fn repository(&self, repo_id: &str) -> StoreResult<Option<RepositoryRecord>> {
        let row = sqlx::query("SELECT * FROM repositories WHERE repo_id = ?")
            .bind(repo_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(unavailable)?;
        row.as_ref().map(row_to_record).transpose()
    }

    async fn list_repositories(&self) -> StoreResult<Vec<RepositoryRecord>> {
        let rows = sqlx::query("SELECT * FROM repositories ORDER BY repo_id")
            .fetch_all(&self.pool)
            .await
            .map_err(unavailable)?;
        rows.iter().map(row_to_record).collect()
    }

    async fn file_chunk_ids(&self, repo_id: &str, file_path: &str) -> StoreResult<Vec<String>> {
        sqlx::query_scalar(
            "SELECT chunk_id FROM code_chunks WHERE repo_id = ? AND file_path = ? ORDER BY chunk_index",
        )
        .bind(repo_id)
        .bind(file_path)
        .fetch_all(&self.pool)
        .await
        .map_err(unavailable)
    }

    async fn delete_repository(&self, repo_id: &str) -> StoreResult<()> {
        let mut tx = self.pool.begin().await.map_err(unavailable)?;
        sqlx::query("DELETE FROM code_chunks_fts WHERE repo_id = ?")
            .bind(repo_id)
            .execute(&mut *tx)
            .await
            .map_err(unavailable)?;
        sqlx::query("DELETE FROM code_chunks WHERE repo_id = ?")
            .bind(repo_id)
            .execute(&mut *tx)
            .await
            .map_err(unavailable)?;
        sqlx::query("DELETE FROM repositories WHERE repo_id = ?")
            .bind(repo_id)
            .execute(&mut *tx)
            .await
            .map_err(unavailable)?;
        tx.commit().await.map_err(unavailable)
    }

    async fn vector_search(
        &self,
        repo_id: &str,
        query_vec: &[f32],
        k: usize,
    ) -> StoreResult<Vec<ScoredChunk>> {
        self.ensure_searchable(repo_id).await?;

        let rows = sqlx::query(&format!(
            "SELECT {CHUNK_COLUMNS}, c.embedding FROM code_chunks c \
             WHERE c.repo_id = ? AND c.embedding IS NOT NULL"
        ))
        .bind(repo_id)
        .fetch_all(&self.pool)
        .await
        .map_err(unavailable)?;

        let mut scored: Vec<(f64, i64, &SqliteRow)> = Vec::with_capacity(rows.len());
        for row in &rows {
            let blob: Vec<u8> = row.try_get("embedding").map_err(unavailable)?;
            let seq: i64 = row.try_get("seq").map_err(unavailable)?;
            let score = cosine_similarity(query_vec, &blob_to_vec(&blob)) as f64;
            scored.push((score, seq, row));
        }
        scored.sort_by(|a, b| {
            b.0.partial_cmp(&a.0)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(b.1.cmp(&a.1))
        });
        scored.truncate(k);

        scored
            .into_iter()
            .map(|(score, _, row)| {
                Ok(ScoredChunk {
                    chunk: row_to_chunk(row)?,
                    score,
                })
            })
            .collect()
    }

    async fn fulltext_search(
        &self,
        repo_id: &str,
        query: &str,
        k: usize,
    ) -> StoreResult<Vec<ScoredChunk>> {
        self.ensure_searchable(repo_id).await?;

        let Some(match_expr) = fts_match_expr(query) else {
            return Ok(Vec::new());
        };
        if k == 0 {
            return Ok(Vec::new());
        }

        // bm25() is lower-is-better; negate so higher means more relevant.
        let rows = sqlx::query(&format!(
            "SELECT {CHUNK_COLUMNS}, -bm25(code_chunks_fts) AS score \
             FROM code_chunks_fts \
             JOIN code_chunks c ON c.seq = code_chunks_fts.rowid \
             WHERE code_chunks_fts MATCH ? AND code_chunks_fts.repo_id = ? \
             ORDER BY bm25(code_chunks_fts) ASC, c.seq DESC \
             LIMIT ?"
        ))
        .bind(&match_expr)
        .bind(repo_id)
        .bind(i64::try_from(k).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(unavailable)?;

        rows.iter()
            .map(|row| {
                Ok(ScoredChunk {
                    score: row.try_get("score").map_err(unavailable)?,
                    chunk: row_to_chunk(row)?,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use codequest_core::chunk::{chunk_file, Chunker, ChunkerConfig};
    use codequest_core::models::SourceFile;

    async fn open_store(dir: &tempfile::TempDir) -> SqliteStore {
        let config = Config::default_for(dir.path().join("cq.sqlite"));
        SqliteStore::open(&config).await.unwrap()
    }

    fn indexed(repo: &str, path: &str, content: &str, vector: Option<Vec<f32>>) -> Vec<IndexedChunk> {
        let chunker = Chunker::new(ChunkerConfig::default()).unwrap();
        chunk_file(repo, &SourceFile::new(path, content), &chunker)
            .into_iter()
            .map(|chunk| IndexedChunk {
                chunk,
                embedding: vector.clone(),
            })
            .collect()
    }

    fn repo(id: &str) -> RepositoryRef {
        RepositoryRef {
            id: id.into(),
            url: format!("https://github.com/{id}"),
        }
    }

    #[tokio::test]
    async fn test_fts_match_expr_quotes_terms() {
        assert_eq!(
            fts_match_expr("parse \"config\" OR*").as_deref(),
            Some("\"parse\" OR \"config\" OR \"or\"")
        );
        assert_eq!(fts_match_expr("  ;; "), None);
    }

    #[tokio::test]
    async fn test_repository_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir).await;
        let r = store.begin_repository(&repo("acme/api")).await.unwrap();
        assert_eq!(r.status, RepoStatus::Indexing);
        assert!(r.indexed_at.is_none());

        let err = store.fulltext_search("acme/api", "x", 5).await.unwrap_err();
        assert_eq!(err, StoreError::NotIndexed("acme/api".into()));

        let r = store
            .finish_repository("acme/api", RepoStatus::Degraded, IngestCounts { files: 2, chunks: 7 })
            .await
            .unwrap();
        assert_eq!(r.status, RepoStatus::Degraded);
        assert_eq!(r.chunk_count, 7);
        assert!(r.indexed_at.is_some());

        let again = store.begin_repository(&repo("acme/api")).await.unwrap();
        assert!(again.indexed_at.is_some(), "re-analysis keeps the previous index searchable");
        assert_eq!(store.list_repositories().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_upsert_idempotent_and_searchable() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir).await;
        store.begin_repository(&repo("acme/api")).await.unwrap();

        let chunks = indexed(
            "acme/api",
            "src/auth.rs",
            "fn verify_token(token: &str) -> bool { token.len() > 8 }",
            Some(vec![1.0, 0.0, 0.0]),
        );
        store.upsert_chunks("acme/api", "src/auth.rs", &chunks).await.unwrap();
        store.upsert_chunks("acme/api", "src/auth.rs", &chunks).await.unwrap();
        store
            .finish_repository("acme/api", RepoStatus::Ready, IngestCounts::default())
            .await
            .unwrap();

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM code_chunks")
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(count, 1);
        let fts_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM code_chunks_fts")
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(fts_count, 1);

        let hits = store.fulltext_search("acme/api", "verify_token", 5).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert!(hits[0].score > 0.0);
        assert_eq!(hits[0].chunk.metadata.symbols, vec!["verify_token"]);

        let hits = store.vector_search("acme/api", &[1.0, 0.0, 0.0], 5).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert!((hits[0].score - 1.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_chunks_without_vectors_are_fulltext_only() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir).await;
        store.begin_repository(&repo("acme/api")).await.unwrap();
        let chunks = indexed("acme/api", "src/db.rs", "fn open_pool() {}", None);
        store.upsert_chunks("acme/api", "src/db.rs", &chunks).await.unwrap();
        store
            .finish_repository("acme/api", RepoStatus::Degraded, IngestCounts::default())
            .await
            .unwrap();

        assert!(store.vector_search("acme/api", &[1.0], 5).await.unwrap().is_empty());
        assert_eq!(store.fulltext_search("acme/api", "open_pool", 5).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_retain_and_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir).await;
        store.begin_repository(&repo("acme/api")).await.unwrap();
        for path in ["a.rs", "b.rs"] {
            let chunks = indexed("acme/api", path, "fn keep_me() {}", None);
            store.upsert_chunks("acme/api", path, &chunks).await.unwrap();
        }
        assert_eq!(store.retain_files("acme/api", &["a.rs".into()]).await.unwrap(), 1);
        assert!(store.file_chunk_ids("acme/api", "b.rs").await.unwrap().is_empty());
        assert_eq!(store.file_chunk_ids("acme/api", "a.rs").await.unwrap().len(), 1);

        store.delete_repository("acme/api").await.unwrap();
        assert!(store.repository("acme/api").await.unwrap().is_none());
    }
}
