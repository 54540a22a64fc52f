//! Error taxonomy for workflow runs and questions.
//!
//! Fatal failures end a run and reach the caller as a [`WorkflowError`].
//! Non-fatal ones are collected as [`Degradation`]s and reported as
//! warnings alongside an otherwise successful result.

use serde::{Deserialize, Serialize};

use codequest_core::search::SearchError;
use codequest_core::store::StoreError;

/// Errors that abort a workflow run.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WorkflowError {
    #[error("repository fetch failed: {0}")]
    FetchFailed(String),
    #[error("analysis failed: {0}")]
    AnalysisFailed(String),
    #[error("run {0} was cancelled")]
    Cancelled(String),
    /// The run task panicked or was aborted by the runtime.
    #[error("run aborted: {0}")]
    Aborted(String),
}

impl WorkflowError {
    /// Stable machine-readable code for API responses.
    pub fn code(&self) -> &'static str {
        match self {
            WorkflowError::FetchFailed(_) => "fetch_failed",
            WorkflowError::AnalysisFailed(_) => "analysis_failed",
            WorkflowError::Cancelled(_) => "cancelled",
            WorkflowError::Aborted(_) => "aborted",
        }
    }
}

/// Errors scoped to a single search or question.
#[derive(Debug, Clone, thiserror::Error)]
pub enum QueryError {
    #[error("repository {0} has not been indexed; analyze it first")]
    NotIndexed(String),
    #[error("index store unavailable: {0}")]
    StoreUnavailable(String),
    #[error("query failed: {0}")]
    QueryFailed(String),
    /// The request was rejected before touching the index.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl QueryError {
    pub fn code(&self) -> &'static str {
        match self {
            QueryError::NotIndexed(_) => "not_indexed",
            QueryError::StoreUnavailable(_) => "store_unavailable",
            QueryError::QueryFailed(_) => "query_failed",
            QueryError::InvalidRequest(_) => "bad_request",
        }
    }
}

impl From<SearchError> for QueryError {
    fn from(e: SearchError) -> Self {
        match e {
            SearchError::Store(StoreError::NotIndexed(repo)) => QueryError::NotIndexed(repo),
            SearchError::Store(StoreError::Unavailable(msg)) => QueryError::StoreUnavailable(msg),
            other => QueryError::QueryFailed(other.to_string()),
        }
    }
}

/// What kind of non-fatal failure a run absorbed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DegradationKind {
    /// Some chunks were stored without vectors, or some files not at all.
    IndexingDegraded,
    /// The index store could not be reached; indexing was skipped.
    StoreUnavailable,
    /// A model tier failed and a lower tier served the request.
    ModelUnavailable,
    /// No model answered; a deterministic skeleton was produced.
    GenerationUnavailable,
}

/// A recorded non-fatal failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Degradation {
    pub kind: DegradationKind,
    pub message: String,
}

impl Degradation {
    pub fn new(kind: DegradationKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_search_error_maps_to_query_error() {
        let e: QueryError = SearchError::Store(StoreError::NotIndexed("a/b".into())).into();
        assert_eq!(e.code(), "not_indexed");
        let e: QueryError = SearchError::Store(StoreError::Unavailable("io".into())).into();
        assert_eq!(e.code(), "store_unavailable");
        let e: QueryError = SearchError::BothFailed {
            vector: "x".into(),
            fulltext: "y".into(),
        }
        .into();
        assert_eq!(e.code(), "query_failed");
    }

    #[test]
    fn test_degradation_serializes_snake_case() {
        let d = Degradation::new(DegradationKind::IndexingDegraded, "2 chunks without vectors");
        let json = serde_json::to_value(&d).unwrap();
        assert_eq!(json["kind"], "indexing_degraded");
    }
}
