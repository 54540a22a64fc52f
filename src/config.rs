//! TOML configuration.
//!
//! Every section except `[db]` is optional and falls back to the defaults
//! below. [`load_config`] parses and validates; [`Config::default_for`]
//! builds the same defaults in code for tests and embedded use.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use codequest_core::chunk::ChunkerConfig;
use codequest_core::search::SearchParams;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub fetch: FetchConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_max_chars")]
    pub max_chars: usize,
    #[serde(default = "default_overlap_ratio")]
    pub overlap_ratio: f32,
    #[serde(default = "default_boundary_window")]
    pub boundary_window: f32,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_chars: default_max_chars(),
            overlap_ratio: default_overlap_ratio(),
            boundary_window: default_boundary_window(),
        }
    }
}

impl ChunkingConfig {
    pub fn chunker_config(&self) -> ChunkerConfig {
        ChunkerConfig {
            max_chars: self.max_chars,
            overlap_ratio: self.overlap_ratio,
            boundary_window: self.boundary_window,
        }
    }
}

fn default_max_chars() -> usize {
    1500
}
fn default_overlap_ratio() -> f32 {
    0.15
}
fn default_boundary_window() -> f32 {
    0.2
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    /// `disabled`, `hash`, `openai`, `ollama`, or `local`.
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    /// Base URL for `ollama` (default `http://localhost:11434`) or an
    /// OpenAI-compatible endpoint.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Entries kept in the content-addressed embedding cache.
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: None,
            url: None,
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
            cache_capacity: default_cache_capacity(),
        }
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_provider() -> String {
    "hash".to_string()
}
fn default_batch_size() -> usize {
    32
}
fn default_max_retries() -> u32 {
    3
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_cache_capacity() -> usize {
    1000
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_weight")]
    pub vector_weight: f64,
    #[serde(default = "default_weight")]
    pub fulltext_weight: f64,
    #[serde(default = "default_oversample_factor")]
    pub oversample_factor: usize,
    #[serde(default = "default_min_candidates")]
    pub min_candidates: usize,
    #[serde(default = "default_final_limit")]
    pub final_limit: usize,
    /// Largest `limit` a caller may request.
    #[serde(default = "default_max_limit")]
    pub max_limit: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            vector_weight: default_weight(),
            fulltext_weight: default_weight(),
            oversample_factor: default_oversample_factor(),
            min_candidates: default_min_candidates(),
            final_limit: default_final_limit(),
            max_limit: default_max_limit(),
        }
    }
}

impl RetrievalConfig {
    pub fn params(&self) -> SearchParams {
        SearchParams {
            vector_weight: self.vector_weight,
            fulltext_weight: self.fulltext_weight,
            oversample_factor: self.oversample_factor,
            min_candidates: self.min_candidates,
        }
    }
}

fn default_weight() -> f64 {
    0.5
}
fn default_oversample_factor() -> usize {
    2
}
fn default_min_candidates() -> usize {
    10
}
fn default_final_limit() -> usize {
    5
}
fn default_max_limit() -> usize {
    100
}

#[derive(Debug, Deserialize, Clone)]
pub struct IngestConfig {
    /// Files indexed concurrently.
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Deadline for each store call, on ingest and at query time.
    #[serde(default = "default_store_timeout_secs")]
    pub store_timeout_secs: u64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            store_timeout_secs: default_store_timeout_secs(),
        }
    }
}

fn default_workers() -> usize {
    4
}
fn default_store_timeout_secs() -> u64 {
    10
}

#[derive(Debug, Deserialize, Clone)]
pub struct FetchConfig {
    /// Where remote repositories are cloned.
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,
    #[serde(default = "default_fetch_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_files")]
    pub max_files: usize,
    /// Files larger than this are skipped.
    #[serde(default = "default_max_file_bytes")]
    pub max_file_bytes: u64,
    /// Empty means every file with a known source extension.
    #[serde(default)]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            cache_dir: default_cache_dir(),
            timeout_secs: default_fetch_timeout_secs(),
            max_files: default_max_files(),
            max_file_bytes: default_max_file_bytes(),
            include_globs: Vec::new(),
            exclude_globs: Vec::new(),
        }
    }
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from("./data/repos")
}
fn default_fetch_timeout_secs() -> u64 {
    120
}
fn default_max_files() -> usize {
    200
}
fn default_max_file_bytes() -> u64 {
    100_000
}

#[derive(Debug, Deserialize, Clone)]
pub struct LlmConfig {
    /// Try the local backend before the hosted one.
    #[serde(default = "default_true")]
    pub prefer_local: bool,
    /// Deadline for one generation attempt on one tier.
    #[serde(default = "default_llm_timeout_secs")]
    pub timeout_secs: u64,
    /// Serve deterministic template text when every model fails.
    #[serde(default = "default_true")]
    pub static_fallback: bool,
    #[serde(default)]
    pub local: Option<LocalLlmConfig>,
    #[serde(default)]
    pub hosted: Option<HostedLlmConfig>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            prefer_local: true,
            timeout_secs: default_llm_timeout_secs(),
            static_fallback: true,
            local: None,
            hosted: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct LocalLlmConfig {
    #[serde(default = "default_ollama_url")]
    pub url: String,
    pub model: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct HostedLlmConfig {
    #[serde(default = "default_openai_url")]
    pub url: String,
    pub model: String,
    /// Environment variable holding the API key.
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

fn default_true() -> bool {
    true
}
fn default_llm_timeout_secs() -> u64 {
    60
}
pub(crate) fn default_ollama_url() -> String {
    "http://localhost:11434".to_string()
}
pub(crate) fn default_openai_url() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}
fn default_max_tokens() -> u32 {
    1500
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:7340".to_string()
}

impl Config {
    /// Default configuration with the database at `db_path`.
    pub fn default_for(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db: DbConfig {
                path: db_path.into(),
            },
            chunking: ChunkingConfig::default(),
            embedding: EmbeddingConfig::default(),
            retrieval: RetrievalConfig::default(),
            ingest: IngestConfig::default(),
            fetch: FetchConfig::default(),
            llm: LlmConfig::default(),
            server: ServerConfig::default(),
        }
    }

    /// Check cross-field constraints.
    pub fn validate(&self) -> Result<()> {
        self.chunking.chunker_config().validate()?;

        let r = &self.retrieval;
        if r.final_limit < 1 {
            anyhow::bail!("retrieval.final_limit must be >= 1");
        }
        if r.max_limit < r.final_limit.max(crate::ask::SEARCH_LIMIT) {
            anyhow::bail!(
                "retrieval.max_limit must be >= retrieval.final_limit and >= {}",
                crate::ask::SEARCH_LIMIT
            );
        }
        if r.oversample_factor < 1 {
            anyhow::bail!("retrieval.oversample_factor must be >= 1");
        }
        for (name, w) in [
            ("vector_weight", r.vector_weight),
            ("fulltext_weight", r.fulltext_weight),
        ] {
            if !(0.0..=1.0).contains(&w) {
                anyhow::bail!("retrieval.{name} must be in [0.0, 1.0]");
            }
        }
        if r.vector_weight + r.fulltext_weight <= 0.0 {
            anyhow::bail!("retrieval weights must not both be zero");
        }

        if self.ingest.workers == 0 {
            anyhow::bail!("ingest.workers must be >= 1");
        }
        if self.fetch.max_files == 0 {
            anyhow::bail!("fetch.max_files must be >= 1");
        }
        if self.embedding.cache_capacity == 0 {
            anyhow::bail!("embedding.cache_capacity must be >= 1");
        }

        match self.embedding.provider.as_str() {
            "disabled" | "hash" => {}
            "openai" | "ollama" | "local" => {
                if self.embedding.model.is_none() {
                    anyhow::bail!(
                        "embedding.model must be specified when provider is '{}'",
                        self.embedding.provider
                    );
                }
                if matches!(self.embedding.dims, None | Some(0)) {
                    anyhow::bail!(
                        "embedding.dims must be > 0 when provider is '{}'",
                        self.embedding.provider
                    );
                }
            }
            other => anyhow::bail!(
                "Unknown embedding provider: '{}'. Must be disabled, hash, openai, ollama, or local.",
                other
            ),
        }

        if self.llm.timeout_secs == 0 {
            anyhow::bail!("llm.timeout_secs must be >= 1");
        }
        Ok(())
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    config.validate()?;
    Ok(config)
}
