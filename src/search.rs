//! Query-time retrieval: embeds the query and runs hybrid search.
//!
//! The scoring itself lives in `codequest_core::search`; this module owns
//! the parts that need application state. It picks the embedder, bounds the
//! query embedding with `embedding.timeout_secs` and the store round trip
//! with `ingest.store_timeout_secs`, caps `limit` at `retrieval.max_limit`,
//! and turns a missing embedder into a vector side that is simply
//! unavailable (so hybrid queries degrade to full-text instead of failing).

use std::sync::Arc;
use std::time::Duration;

use codequest_core::embedding::CachedEmbedder;
use codequest_core::search::{self, QueryVector, SearchMode, SearchParams, SearchRequest, SearchResponse};
use codequest_core::store::IndexStore;

use crate::config::Config;
use crate::error::QueryError;

/// Runs searches against one index store.
#[derive(Clone)]
pub struct Retriever {
    store: Arc<dyn IndexStore>,
    embedder: Option<Arc<CachedEmbedder>>,
    params: SearchParams,
    default_limit: usize,
    max_limit: usize,
    embed_timeout: Duration,
    store_timeout: Duration,
}

impl Retriever {
    pub fn new(
        config: &Config,
        store: Arc<dyn IndexStore>,
        embedder: Option<Arc<CachedEmbedder>>,
    ) -> Self {
        Self {
            store,
            embedder,
            params: config.retrieval.params(),
            default_limit: config.retrieval.final_limit,
            max_limit: config.retrieval.max_limit,
            embed_timeout: Duration::from_secs(config.embedding.timeout_secs),
            store_timeout: Duration::from_secs(config.ingest.store_timeout_secs),
        }
    }

    pub fn default_limit(&self) -> usize {
        self.default_limit
    }

    /// Search `repo_id` for `query`, returning at most `limit` hits
    /// (`retrieval.final_limit` when `None`). A `limit` above
    /// `retrieval.max_limit` is rejected.
    pub async fn search(
        &self,
        repo_id: &str,
        query: &str,
        mode: SearchMode,
        limit: Option<usize>,
    ) -> Result<SearchResponse, QueryError> {
        let k = limit.unwrap_or(self.default_limit);
        if k > self.max_limit {
            return Err(QueryError::InvalidRequest(format!(
                "limit {} exceeds the maximum of {}",
                k, self.max_limit
            )));
        }

        let embedded = match mode {
            SearchMode::Fulltext => Err("not requested".to_string()),
            SearchMode::Vector | SearchMode::Hybrid => self.embed_query(query).await,
        };
        let query_vec = match &embedded {
            Ok(v) => QueryVector::Ready(v),
            Err(reason) => QueryVector::Unavailable(reason.clone()),
        };

        let request = SearchRequest {
            repo_id,
            query,
            query_vec,
            mode,
            k,
            params: self.params,
        };
        let response = tokio::time::timeout(
            self.store_timeout,
            search::search(self.store.as_ref(), &request),
        )
        .await
        .map_err(|_| {
            QueryError::StoreUnavailable(format!(
                "search timed out after {}s",
                self.store_timeout.as_secs()
            ))
        })??;
        tracing::debug!(
            repo = repo_id,
            mode = ?mode,
            hits = response.hits.len(),
            degraded = response.degraded.is_some(),
            "search"
        );
        Ok(response)
    }

    async fn embed_query(&self, query: &str) -> Result<Vec<f32>, String> {
        let Some(embedder) = &self.embedder else {
            return Err("embeddings are disabled".to_string());
        };
        match tokio::time::timeout(self.embed_timeout, embedder.embed_one(query)).await {
            Ok(Ok(v)) => Ok(v),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(format!(
                "query embedding timed out after {}s",
                self.embed_timeout.as_secs()
            )),
        }
    }
}

/// Print search hits for the CLI.
pub fn print_results(response: &SearchResponse) {
    if let Some(reason) = &response.degraded {
        eprintln!("warning: {}", reason);
    }
    if response.hits.is_empty() {
        println!("No results.");
        return;
    }
    for (i, hit) in response.hits.iter().enumerate() {
        let chunk = &hit.chunk;
        println!(
            "{}. [{:.2}] {}:{} ({})",
            i + 1,
            hit.score,
            chunk.file_path,
            chunk.line_range(),
            chunk.language
        );
        let excerpt: String = chunk.content.chars().take(160).collect();
        println!("    excerpt: \"{}\"", excerpt.replace('\n', " ").trim());
        if !chunk.metadata.symbols.is_empty() {
            println!("    symbols: {}", chunk.metadata.symbols.join(", "));
        }
        println!();
    }
}
