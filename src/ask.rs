//! Question answering over an indexed repository.
//!
//! A question is answered in three steps:
//!
//! 1. Hybrid search for [`SEARCH_LIMIT`] chunks.
//! 2. The best [`CONTEXT_CHUNKS`] become the prompt context and the
//!    returned sources.
//! 3. The model selector writes the answer. When no model answers, the
//!    static tier serves a templated answer naming the most relevant files.
//!
//! An empty result set short-circuits with a fixed answer and no model call.

use serde::{Deserialize, Serialize};

use codequest_core::models::SearchHit;
use codequest_core::search::SearchMode;

use crate::error::{Degradation, DegradationKind, QueryError};
use crate::llm::{GenerationError, GenerationRequest, ModelSelector, Tier};
use crate::search::Retriever;
use crate::walkthrough::UserLevel;

/// Chunks retrieved per question.
pub const SEARCH_LIMIT: usize = 8;
/// Chunks used as prompt context.
pub const CONTEXT_CHUNKS: usize = 5;

const NO_MATCHES: &str = "I couldn't find any relevant code for your question. \
The repository might not be indexed yet or your question might be too specific.";

#[derive(Debug, Clone, Deserialize)]
pub struct AskRequest {
    pub question: String,
    pub repo_id: String,
    #[serde(default)]
    pub user_level: UserLevel,
}

/// A chunk the answer was based on.
#[derive(Debug, Clone, Serialize)]
pub struct AnswerSource {
    pub file_path: String,
    pub line_range: String,
    pub language: String,
    pub similarity_score: f64,
}

impl From<&SearchHit> for AnswerSource {
    fn from(hit: &SearchHit) -> Self {
        Self {
            file_path: hit.chunk.file_path.clone(),
            line_range: hit.chunk.line_range(),
            language: hit.chunk.language.clone(),
            similarity_score: hit.score,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Answer {
    pub answer: String,
    pub sources: Vec<AnswerSource>,
    /// Tier that wrote the answer. `None` when no model call was needed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tier: Option<Tier>,
    pub degraded: bool,
    pub warnings: Vec<Degradation>,
}

pub async fn ask(
    retriever: &Retriever,
    selector: &ModelSelector,
    request: &AskRequest,
) -> Result<Answer, QueryError> {
    let response = retriever
        .search(&request.repo_id, &request.question, SearchMode::Hybrid, Some(SEARCH_LIMIT))
        .await?;

    let mut warnings = Vec::new();
    if let Some(reason) = &response.degraded {
        warnings.push(Degradation::new(DegradationKind::IndexingDegraded, reason.clone()));
    }

    if response.hits.is_empty() {
        return Ok(Answer {
            answer: NO_MATCHES.to_string(),
            sources: Vec::new(),
            tier: None,
            degraded: !warnings.is_empty(),
            warnings,
        });
    }

    let context = &response.hits[..response.hits.len().min(CONTEXT_CHUNKS)];
    let sources: Vec<AnswerSource> = context.iter().map(AnswerSource::from).collect();

    let generation_request = GenerationRequest::new(
        system_prompt(request.user_level),
        user_prompt(&request.repo_id, &request.question, context),
        fallback_answer(&response.hits),
    );

    let generation = match selector.generate(&generation_request).await {
        Ok(g) => g,
        Err(GenerationError::GenerationUnavailable { attempts }) => {
            tracing::warn!(repo = %request.repo_id, attempts = attempts.len(), "no model could answer");
            return Err(QueryError::QueryFailed(
                "no language model is available and the static fallback is disabled".to_string(),
            ));
        }
        Err(e) => return Err(QueryError::QueryFailed(e.to_string())),
    };

    if generation.is_static() {
        warnings.push(Degradation::new(
            DegradationKind::GenerationUnavailable,
            "no language model answered; showing the most relevant files",
        ));
    } else if generation.fell_back() {
        warnings.push(Degradation::new(
            DegradationKind::ModelUnavailable,
            format!("answered by fallback backend {}", generation.backend),
        ));
    }

    Ok(Answer {
        answer: generation.text,
        sources,
        tier: Some(generation.tier),
        degraded: !warnings.is_empty(),
        warnings,
    })
}

fn system_prompt(level: UserLevel) -> &'static str {
    match level {
        UserLevel::Beginner => {
            "You are a patient coding tutor explaining code to beginners. Use simple language, \
             explain concepts step by step, and avoid jargon."
        }
        UserLevel::Intermediate => {
            "You are a knowledgeable developer helping a colleague. Give clear technical explanations \
             of how the code works, including relevant patterns."
        }
        UserLevel::Advanced => {
            "You are a senior software architect. Focus on design decisions, trade-offs and \
             performance. Be concise but complete."
        }
    }
}

fn user_prompt(repo_id: &str, question: &str, context: &[SearchHit]) -> String {
    let mut prompt = format!(
        "Answer this question about the repository \"{repo_id}\" using the code below.\n\n\
         QUESTION: {question}\n\nRELEVANT CODE:\n"
    );
    for hit in context {
        let chunk = &hit.chunk;
        prompt.push_str(&format!(
            "\nFile: {}\nLines: {}\nLanguage: {}\n```\n{}\n```\n",
            chunk.file_path,
            chunk.line_range(),
            chunk.language,
            chunk.content
        ));
    }
    prompt.push_str(
        "\nIf the code does not fully answer the question, say what is missing. \
         Reference specific files and line numbers.",
    );
    prompt
}

fn fallback_answer(hits: &[SearchHit]) -> String {
    let mut files: Vec<&str> = Vec::new();
    for hit in hits {
        if !files.contains(&hit.chunk.file_path.as_str()) {
            files.push(&hit.chunk.file_path);
        }
        if files.len() == 3 {
            break;
        }
    }
    format!(
        "I found {} relevant code sections, but no language model is available for a detailed \
         explanation. The most relevant files are: {}",
        hits.len(),
        files.join(", ")
    )
}
