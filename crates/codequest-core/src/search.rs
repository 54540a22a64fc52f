//! Vector, full-text, and hybrid retrieval over an [`IndexStore`].
//!
//! The algorithm has no database or configuration dependencies. Callers
//! embed the query themselves and pass the vector (or the reason it is
//! missing) in a [`SearchRequest`].
//!
//! # Hybrid Scoring Algorithm
//!
//! 1. Fetch `k' = max(k × oversample_factor, min_candidates)` candidates
//!    from both the vector and the full-text index.
//! 2. Min-max normalise each list to `[0, 1]`.
//! 3. Merge by chunk identity: `score = w_v × vector + w_f × fulltext`,
//!    a side the chunk is missing from contributes 0.
//! 4. Sort by score (desc), raw vector similarity (desc), chunk key (asc).
//! 5. Truncate to `k`.
//!
//! If exactly one side fails the other side's list is returned with
//! [`SearchResponse::degraded`] set. Both failing is an error.

use std::collections::HashMap;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::models::{ChunkKey, MatchKind, ScoredChunk, SearchHit};
use crate::store::{IndexStore, StoreError};

/// Retrieval channel selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchMode {
    Vector,
    Fulltext,
    Hybrid,
}

impl FromStr for SearchMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "vector" | "semantic" => Ok(SearchMode::Vector),
            "fulltext" | "keyword" => Ok(SearchMode::Fulltext),
            "hybrid" => Ok(SearchMode::Hybrid),
            other => Err(format!(
                "unknown search mode: {other}. Use vector, fulltext, or hybrid."
            )),
        }
    }
}

/// Retrieval tuning parameters, decoupled from application config.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SearchParams {
    pub vector_weight: f64,
    pub fulltext_weight: f64,
    /// Candidates fetched per side are `k × oversample_factor`...
    pub oversample_factor: usize,
    /// ...but never fewer than this.
    pub min_candidates: usize,
}

impl Default for SearchParams {
    fn default() -> Self {
        Self {
            vector_weight: 0.5,
            fulltext_weight: 0.5,
            oversample_factor: 2,
            min_candidates: 10,
        }
    }
}

impl SearchParams {
    /// Candidate depth for each side of a hybrid query returning `k`.
    pub fn candidate_k(&self, k: usize) -> usize {
        k.saturating_mul(self.oversample_factor).max(self.min_candidates)
    }
}

/// The query embedding, or why there is none.
#[derive(Debug, Clone)]
pub enum QueryVector<'a> {
    Ready(&'a [f32]),
    Unavailable(String),
}

/// Bundles all inputs for a single search invocation.
#[derive(Debug, Clone)]
pub struct SearchRequest<'a> {
    pub repo_id: &'a str,
    pub query: &'a str,
    pub query_vec: QueryVector<'a>,
    pub mode: SearchMode,
    pub k: usize,
    pub params: SearchParams,
}

/// Ranked hits, plus the reason when only one retrieval side answered.
#[derive(Debug, Clone, Serialize)]
pub struct SearchResponse {
    pub mode: SearchMode,
    pub hits: Vec<SearchHit>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub degraded: Option<String>,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum SearchError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("vector search unavailable: {0}")]
    VectorUnavailable(String),
    #[error("hybrid search failed on both sides (vector: {vector}; full-text: {fulltext})")]
    BothFailed { vector: String, fulltext: String },
}

/// Run a search against an [`IndexStore`].
pub async fn search<S: IndexStore + ?Sized>(
    store: &S,
    req: &SearchRequest<'_>,
) -> Result<SearchResponse, SearchError> {
    let empty = SearchResponse {
        mode: req.mode,
        hits: Vec::new(),
        degraded: None,
    };
    if req.query.trim().is_empty() || req.k == 0 {
        return Ok(empty);
    }

    match req.mode {
        SearchMode::Vector => {
            let qv = match &req.query_vec {
                QueryVector::Ready(v) => *v,
                QueryVector::Unavailable(reason) => {
                    return Err(SearchError::VectorUnavailable(reason.clone()))
                }
            };
            let raw = store.vector_search(req.repo_id, qv, req.k).await?;
            Ok(SearchResponse {
                hits: raw_hits(raw, MatchKind::Vector),
                ..empty
            })
        }
        SearchMode::Fulltext => {
            let raw = store.fulltext_search(req.repo_id, req.query, req.k).await?;
            Ok(SearchResponse {
                hits: raw_hits(raw, MatchKind::Fulltext),
                ..empty
            })
        }
        SearchMode::Hybrid => hybrid(store, req).await,
    }
}

async fn hybrid<S: IndexStore + ?Sized>(
    store: &S,
    req: &SearchRequest<'_>,
) -> Result<SearchResponse, SearchError> {
    let depth = req.params.candidate_k(req.k);

    let vector: Result<Vec<ScoredChunk>, String> = match &req.query_vec {
        QueryVector::Ready(qv) => match store.vector_search(req.repo_id, qv, depth).await {
            Ok(hits) => Ok(hits),
            Err(e @ StoreError::NotIndexed(_)) => return Err(e.into()),
            Err(e) => Err(e.to_string()),
        },
        QueryVector::Unavailable(reason) => Err(reason.clone()),
    };
    let fulltext: Result<Vec<ScoredChunk>, String> =
        match store.fulltext_search(req.repo_id, req.query, depth).await {
            Ok(hits) => Ok(hits),
            Err(e @ StoreError::NotIndexed(_)) => return Err(e.into()),
            Err(e) => Err(e.to_string()),
        };

    let p = &req.params;
    let (hits, degraded) = match (vector, fulltext) {
        (Ok(v), Ok(f)) => (
            merge(&v, &f, p.vector_weight, p.fulltext_weight, req.k),
            None,
        ),
        (Ok(v), Err(fe)) => {
            tracing::warn!(repo = req.repo_id, error = %fe, "full-text side failed, vector only");
            (
                merge(&v, &[], 1.0, 0.0, req.k),
                Some(format!("full-text search unavailable: {fe}")),
            )
        }
        (Err(ve), Ok(f)) => {
            tracing::warn!(repo = req.repo_id, error = %ve, "vector side failed, full-text only");
            (
                merge(&[], &f, 0.0, 1.0, req.k),
                Some(format!("vector search unavailable: {ve}")),
            )
        }
        (Err(vector), Err(fulltext)) => {
            return Err(SearchError::BothFailed { vector, fulltext })
        }
    };

    Ok(SearchResponse {
        mode: SearchMode::Hybrid,
        hits,
        degraded,
    })
}

fn raw_hits(raw: Vec<ScoredChunk>, kind: MatchKind) -> Vec<SearchHit> {
    raw.into_iter()
        .map(|c| SearchHit {
            score: c.score,
            vector_score: (kind == MatchKind::Vector).then_some(c.score),
            fulltext_score: (kind == MatchKind::Fulltext).then_some(c.score),
            match_kind: kind,
            chunk: c.chunk,
        })
        .collect()
}

struct Merged<'a> {
    candidate: &'a ScoredChunk,
    vector: Option<(f64, f64)>,
    fulltext: Option<(f64, f64)>,
}

/// Weighted merge of two normalised candidate lists, deduplicated by
/// chunk identity and truncated to `k`.
pub fn merge(
    vector: &[ScoredChunk],
    fulltext: &[ScoredChunk],
    vector_weight: f64,
    fulltext_weight: f64,
    k: usize,
) -> Vec<SearchHit> {
    let mut by_key: HashMap<ChunkKey, Merged<'_>> = HashMap::new();

    for (c, norm) in vector.iter().zip(normalize_scores(vector)) {
        by_key
            .entry(c.chunk.key())
            .or_insert(Merged {
                candidate: c,
                vector: None,
                fulltext: None,
            })
            .vector = Some((c.score, norm));
    }
    for (c, norm) in fulltext.iter().zip(normalize_scores(fulltext)) {
        by_key
            .entry(c.chunk.key())
            .or_insert(Merged {
                candidate: c,
                vector: None,
                fulltext: None,
            })
            .fulltext = Some((c.score, norm));
    }

    let mut ranked: Vec<(ChunkKey, f64, Merged<'_>)> = by_key
        .into_iter()
        .map(|(key, m)| {
            let v = m.vector.map(|(_, n)| n).unwrap_or(0.0);
            let f = m.fulltext.map(|(_, n)| n).unwrap_or(0.0);
            (key, vector_weight * v + fulltext_weight * f, m)
        })
        .collect();

    ranked.sort_by(|a, b| {
        let raw_a = a.2.vector.map(|(r, _)| r).unwrap_or(f64::NEG_INFINITY);
        let raw_b = b.2.vector.map(|(r, _)| r).unwrap_or(f64::NEG_INFINITY);
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(raw_b.partial_cmp(&raw_a).unwrap_or(std::cmp::Ordering::Equal))
            .then(a.0.cmp(&b.0))
    });
    ranked.truncate(k);

    ranked
        .into_iter()
        .map(|(_, score, m)| {
            let match_kind = match (m.vector.is_some(), m.fulltext.is_some()) {
                (true, true) => MatchKind::Both,
                (true, false) => MatchKind::Vector,
                _ => MatchKind::Fulltext,
            };
            SearchHit {
                chunk: m.candidate.chunk.clone(),
                score,
                vector_score: m.vector.map(|(r, _)| r),
                fulltext_score: m.fulltext.map(|(r, _)| r),
                match_kind,
            }
        })
        .collect()
}

/// Min-max normalise raw scores to `[0, 1]`, in input order.
///
/// A single candidate, or a list where every score is equal, normalises
/// to `1.0`.
pub fn normalize_scores(candidates: &[ScoredChunk]) -> Vec<f64> {
    if candidates.is_empty() {
        return Vec::new();
    }

    let s_min = candidates
        .iter()
        .map(|c| c.score)
        .fold(f64::INFINITY, f64::min);
    let s_max = candidates
        .iter()
        .map(|c| c.score)
        .fold(f64::NEG_INFINITY, f64::max);

    candidates
        .iter()
        .map(|c| {
            if (s_max - s_min).abs() < f64::EPSILON {
                1.0
            } else {
                (c.score - s_min) / (s_max - s_min)
            }
        })
        .collect()
}
