//! Process-wide application context.
//!
//! [`AppContext::build`] wires the long-lived components once per process:
//! the index store, the embedding cache, the model selector, the retriever
//! and the workflow orchestrator. CLI commands and the HTTP server both work
//! from one context, and [`AppContext::shutdown`] tears it down.

use anyhow::Result;
use std::sync::Arc;

use codequest_core::embedding::CachedEmbedder;
use codequest_core::store::IndexStore;

use crate::analyze::StaticAnalyzer;
use crate::ask::{self, Answer, AskRequest};
use crate::config::Config;
use crate::embedding::create_embedder;
use crate::error::QueryError;
use crate::fetch::{GitFetcher, RepoFetcher};
use crate::ingest::Indexer;
use crate::llm::ModelSelector;
use crate::progress::{ProgressMode, ProgressSink};
use crate::search::Retriever;
use crate::sqlite_store::SqliteStore;
use crate::walkthrough::WalkthroughGenerator;
use crate::workflow::Orchestrator;

pub struct AppContext {
    pub config: Arc<Config>,
    pub store: Arc<dyn IndexStore>,
    pub embedder: Option<Arc<CachedEmbedder>>,
    pub selector: Arc<ModelSelector>,
    pub retriever: Retriever,
    pub orchestrator: Orchestrator,
    sqlite: Option<Arc<SqliteStore>>,
}

impl AppContext {
    /// Open the SQLite store and build every component from `config`.
    pub async fn build(config: Config, progress: ProgressMode) -> Result<Self> {
        let sqlite = Arc::new(SqliteStore::open(&config).await?);
        let fetcher: Arc<dyn RepoFetcher> = Arc::new(GitFetcher::new(config.fetch.clone()));
        let mut ctx = Self::assemble(config, sqlite.clone(), fetcher, progress.sink())?;
        ctx.sqlite = Some(sqlite);
        Ok(ctx)
    }

    /// Build around an existing store and fetcher.
    pub fn assemble(
        config: Config,
        store: Arc<dyn IndexStore>,
        fetcher: Arc<dyn RepoFetcher>,
        sink: Arc<dyn ProgressSink>,
    ) -> Result<Self> {
        config.validate()?;
        let embedder = create_embedder(&config.embedding)?
            .map(|inner| Arc::new(CachedEmbedder::new(inner, config.embedding.cache_capacity)));
        let selector = Arc::new(ModelSelector::from_config(&config.llm)?);
        let indexer = Arc::new(Indexer::new(&config, embedder.clone(), store.clone())?);
        let retriever = Retriever::new(&config, store.clone(), embedder.clone());
        let orchestrator = Orchestrator::new(
            fetcher,
            Arc::new(StaticAnalyzer),
            indexer,
            WalkthroughGenerator::new(selector.clone()),
            sink,
        );

        if let Some(e) = &embedder {
            tracing::debug!(model = e.model_name(), dims = e.dims(), "embedder ready");
        } else {
            tracing::info!("embeddings disabled; search runs full-text only");
        }

        Ok(Self {
            config: Arc::new(config),
            store,
            embedder,
            selector,
            retriever,
            orchestrator,
            sqlite: None,
        })
    }

    pub async fn ask(&self, request: &AskRequest) -> Result<Answer, QueryError> {
        ask::ask(&self.retriever, &self.selector, request).await
    }

    /// Cancel active runs and close the store.
    pub async fn shutdown(&self) {
        self.orchestrator.cancel_all();
        if let Some(e) = &self.embedder {
            let stats = e.stats();
            tracing::debug!(
                hits = stats.hits,
                misses = stats.misses,
                model_calls = stats.model_calls,
                "embedding cache"
            );
        }
        if let Some(sqlite) = &self.sqlite {
            sqlite.close().await;
        }
    }
}
