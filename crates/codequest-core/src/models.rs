//! Core data models used throughout CodeQuest.
//!
//! These types describe the source files, chunks, repository records and
//! search hits that flow through ingestion and retrieval.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A source file read from a fetched repository.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceFile {
    /// Path relative to the repository root, `/`-separated.
    pub path: String,
    pub content: String,
    pub language: String,
    pub size_bytes: u64,
}

impl SourceFile {
    /// Build a source file, inferring the language from the path.
    pub fn new(path: impl Into<String>, content: impl Into<String>) -> Self {
        let path = path.into();
        let content = content.into();
        Self {
            language: language_for_path(&path).to_string(),
            size_bytes: content.len() as u64,
            path,
            content,
        }
    }
}

/// A repository reference: stable id plus the URL it was fetched from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryRef {
    /// `owner/name` identifier, stable across re-indexing.
    pub id: String,
    pub url: String,
}

/// Line range and declarations found inside a chunk.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkMetadata {
    /// First line of the chunk, 1-based.
    pub start_line: usize,
    /// Last line of the chunk, inclusive.
    pub end_line: usize,
    #[serde(default)]
    pub symbols: Vec<String>,
}

/// A bounded segment of one source file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub repo_id: String,
    pub file_path: String,
    /// Deterministic id derived from the file path and `chunk_index`.
    pub chunk_id: String,
    pub chunk_index: usize,
    pub content: String,
    pub language: String,
    /// SHA-256 of `content`, hex encoded.
    pub content_hash: String,
    pub metadata: ChunkMetadata,
}

impl Chunk {
    /// Identity of this chunk within the index.
    pub fn key(&self) -> ChunkKey {
        ChunkKey {
            repo_id: self.repo_id.clone(),
            file_path: self.file_path.clone(),
            chunk_id: self.chunk_id.clone(),
        }
    }

    /// Line range formatted as `start-end`.
    pub fn line_range(&self) -> String {
        format!("{}-{}", self.metadata.start_line, self.metadata.end_line)
    }
}

/// Unique identity of a stored chunk.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChunkKey {
    pub repo_id: String,
    pub file_path: String,
    pub chunk_id: String,
}

/// A chunk ready to be written, with its embedding when one was produced.
///
/// Chunks whose embedding failed are still stored and remain reachable
/// through full-text search.
#[derive(Debug, Clone)]
pub struct IndexedChunk {
    pub chunk: Chunk,
    pub embedding: Option<Vec<f32>>,
}

/// Lifecycle status of an indexed repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RepoStatus {
    Indexing,
    Ready,
    Degraded,
    Failed,
}

impl RepoStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RepoStatus::Indexing => "indexing",
            RepoStatus::Ready => "ready",
            RepoStatus::Degraded => "degraded",
            RepoStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "indexing" => Some(RepoStatus::Indexing),
            "ready" => Some(RepoStatus::Ready),
            "degraded" => Some(RepoStatus::Degraded),
            "failed" => Some(RepoStatus::Failed),
            _ => None,
        }
    }
}

/// Stored state of one repository.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepositoryRecord {
    pub repo_id: String,
    pub url: String,
    pub status: RepoStatus,
    pub file_count: usize,
    pub chunk_count: usize,
    /// Set once the first ingest completed. Search is refused until then.
    pub indexed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl RepositoryRecord {
    pub fn is_searchable(&self) -> bool {
        self.indexed_at.is_some()
    }
}

/// Counts reported when an ingest finishes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestCounts {
    pub files: usize,
    pub chunks: usize,
}

/// Which retrieval channel(s) produced a hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchKind {
    Vector,
    Fulltext,
    Both,
}

/// A chunk returned by one of the store's search primitives with its raw
/// score. Vector scores are cosine similarity; full-text scores are BM25
/// relevance where higher is better.
#[derive(Debug, Clone)]
pub struct ScoredChunk {
    pub chunk: Chunk,
    pub score: f64,
}

/// A ranked search result.
#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub chunk: Chunk,
    /// Final ranking score. Normalised to `[0, 1]` in hybrid mode.
    pub score: f64,
    pub vector_score: Option<f64>,
    pub fulltext_score: Option<f64>,
    pub match_kind: MatchKind,
}

/// Map a file path to a language name by extension.
///
/// Files the chunker should treat as plain text map to `"text"`.
pub fn language_for_path(path: &str) -> &'static str {
    let file_name = path.rsplit('/').next().unwrap_or(path);
    match file_name {
        "Dockerfile" => return "dockerfile",
        "Makefile" => return "makefile",
        _ => {}
    }
    let ext = match file_name.rsplit_once('.') {
        Some((_, ext)) => ext.to_ascii_lowercase(),
        None => return "text",
    };
    match ext.as_str() {
        "rs" => "rust",
        "py" => "python",
        "js" | "mjs" | "cjs" => "javascript",
        "jsx" => "jsx",
        "ts" => "typescript",
        "tsx" => "tsx",
        "java" => "java",
        "kt" | "kts" => "kotlin",
        "go" => "go",
        "c" | "h" => "c",
        "cpp" | "cc" | "cxx" | "hpp" => "cpp",
        "cs" => "csharp",
        "rb" => "ruby",
        "php" => "php",
        "swift" => "swift",
        "scala" => "scala",
        "sh" | "bash" => "shell",
        "sql" => "sql",
        "html" | "htm" => "html",
        "css" | "scss" => "css",
        "vue" => "vue",
        "json" => "json",
        "yaml" | "yml" => "yaml",
        "toml" => "toml",
        "md" | "markdown" => "markdown",
        _ => "text",
    }
}
