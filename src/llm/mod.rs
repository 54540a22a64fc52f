//! Generation backends and the tiered model selector.
//!
//! A [`ModelSelector`] holds at most one local backend (Ollama) and one
//! hosted backend (OpenAI-compatible), plus the static tier that returns
//! the caller's deterministic template text. Each call walks an explicit
//! ordered plan of tiers:
//!
//! | `prefer_local` | Plan |
//! |----------------|------|
//! | `true`  | local → hosted → static |
//! | `false` | hosted → local → static |
//!
//! Unavailable backends are skipped. Every attempt runs under the
//! configured timeout; a timeout, transport error, rate limit, or empty
//! response moves straight on to the next tier. Every attempt is recorded
//! in the returned [`Generation`].

mod backends;

pub use backends::{OllamaBackend, OpenAiBackend};

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

use crate::config::LlmConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Local,
    Hosted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CostClass {
    Free,
    Metered,
}

/// Read-only description of a generation backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModelBackend {
    pub name: String,
    pub kind: BackendKind,
    pub available: bool,
    pub cost_class: CostClass,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GenerationError {
    #[error("model unavailable: {0}")]
    ModelUnavailable(String),
    #[error("rate limited: {0}")]
    RateLimited(String),
    #[error("generation timed out after {0}s")]
    Timeout(u64),
    #[error("malformed response: {0}")]
    Malformed(String),
    /// Every tier in the plan failed or was skipped.
    #[error("no generation backend could serve the request")]
    GenerationUnavailable { attempts: Vec<TierAttempt> },
}

/// One prompt plus the deterministic text the static tier serves.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub system: String,
    pub prompt: String,
    pub max_tokens: u32,
    /// Served verbatim by the static tier.
    pub fallback: String,
    /// Overrides the configured local-first preference for this call.
    pub prefer_local: Option<bool>,
}

impl GenerationRequest {
    pub fn new(system: impl Into<String>, prompt: impl Into<String>, fallback: impl Into<String>) -> Self {
        Self {
            system: system.into(),
            prompt: prompt.into(),
            max_tokens: 1000,
            fallback: fallback.into(),
            prefer_local: None,
        }
    }
}

/// A backend able to turn a prompt into text.
#[async_trait]
pub trait GenerationBackend: Send + Sync {
    fn descriptor(&self) -> ModelBackend;

    async fn generate(&self, request: &GenerationRequest) -> Result<String, GenerationError>;

    /// Live availability check. Defaults to the static descriptor flag.
    async fn health_check(&self) -> bool {
        self.descriptor().available
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Local,
    Hosted,
    Static,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "lowercase")]
pub enum AttemptOutcome {
    Served,
    Skipped { reason: String },
    Failed { error: String },
}

/// Record of one tier in a generation call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TierAttempt {
    pub tier: Tier,
    pub backend: String,
    #[serde(flatten)]
    pub outcome: AttemptOutcome,
}

/// Generated text and how it was produced.
#[derive(Debug, Clone, Serialize)]
pub struct Generation {
    pub text: String,
    pub tier: Tier,
    pub backend: String,
    pub attempts: Vec<TierAttempt>,
}

impl Generation {
    /// True when a model tier failed before this one served.
    pub fn fell_back(&self) -> bool {
        self.attempts
            .iter()
            .any(|a| matches!(a.outcome, AttemptOutcome::Failed { .. }))
    }

    pub fn is_static(&self) -> bool {
        self.tier == Tier::Static
    }
}

/// Availability report for `llm-status`.
#[derive(Debug, Clone, Serialize)]
pub struct SelectorStatus {
    pub prefer_local: bool,
    pub static_fallback: bool,
    pub plan: Vec<Tier>,
    pub backends: Vec<ModelBackend>,
    pub has_fallback: bool,
}

/// Tiered generation with ordered fallback.
pub struct ModelSelector {
    local: Option<Arc<dyn GenerationBackend>>,
    hosted: Option<Arc<dyn GenerationBackend>>,
    prefer_local: bool,
    static_fallback: bool,
    timeout: Duration,
}

impl ModelSelector {
    pub fn new(
        local: Option<Arc<dyn GenerationBackend>>,
        hosted: Option<Arc<dyn GenerationBackend>>,
        prefer_local: bool,
        static_fallback: bool,
        timeout: Duration,
    ) -> Self {
        Self {
            local,
            hosted,
            prefer_local,
            static_fallback,
            timeout,
        }
    }

    /// Build the selector from `[llm]`. Missing sections simply leave that
    /// tier out.
    pub fn from_config(config: &LlmConfig) -> Result<Self> {
        let timeout = Duration::from_secs(config.timeout_secs);
        let local: Option<Arc<dyn GenerationBackend>> = match &config.local {
            Some(c) => Some(Arc::new(OllamaBackend::new(c, timeout)?)),
            None => None,
        };
        let hosted: Option<Arc<dyn GenerationBackend>> = match &config.hosted {
            Some(c) => Some(Arc::new(OpenAiBackend::new(c, timeout)?)),
            None => None,
        };
        Ok(Self::new(
            local,
            hosted,
            config.prefer_local,
            config.static_fallback,
            timeout,
        ))
    }

    /// Ordered tiers for one call.
    pub fn plan(&self, prefer_local: bool) -> Vec<Tier> {
        let mut plan = if prefer_local {
            vec![Tier::Local, Tier::Hosted]
        } else {
            vec![Tier::Hosted, Tier::Local]
        };
        if self.static_fallback {
            plan.push(Tier::Static);
        }
        plan
    }

    fn backend(&self, tier: Tier) -> Option<&Arc<dyn GenerationBackend>> {
        match tier {
            Tier::Local => self.local.as_ref(),
            Tier::Hosted => self.hosted.as_ref(),
            Tier::Static => None,
        }
    }

    /// Generate text, falling through the plan until a tier serves.
    pub async fn generate(&self, request: &GenerationRequest) -> Result<Generation, GenerationError> {
        let prefer_local = request.prefer_local.unwrap_or(self.prefer_local);
        let mut attempts: Vec<TierAttempt> = Vec::new();

        for tier in self.plan(prefer_local) {
            if tier == Tier::Static {
                attempts.push(TierAttempt {
                    tier,
                    backend: "static".to_string(),
                    outcome: AttemptOutcome::Served,
                });
                return Ok(Generation {
                    text: request.fallback.clone(),
                    tier,
                    backend: "static".to_string(),
                    attempts,
                });
            }

            let Some(backend) = self.backend(tier) else {
                attempts.push(TierAttempt {
                    tier,
                    backend: "none".to_string(),
                    outcome: AttemptOutcome::Skipped {
                        reason: "not configured".to_string(),
                    },
                });
                continue;
            };

            let descriptor = backend.descriptor();
            if !descriptor.available {
                attempts.push(TierAttempt {
                    tier,
                    backend: descriptor.name,
                    outcome: AttemptOutcome::Skipped {
                        reason: "unavailable".to_string(),
                    },
                });
                continue;
            }

            let result = match tokio::time::timeout(self.timeout, backend.generate(request)).await {
                Ok(Ok(text)) if text.trim().is_empty() => {
                    Err(GenerationError::Malformed("empty response".to_string()))
                }
                Ok(result) => result,
                Err(_) => Err(GenerationError::Timeout(self.timeout.as_secs())),
            };

            match result {
                Ok(text) => {
                    attempts.push(TierAttempt {
                        tier,
                        backend: descriptor.name.clone(),
                        outcome: AttemptOutcome::Served,
                    });
                    return Ok(Generation {
                        text,
                        tier,
                        backend: descriptor.name,
                        attempts,
                    });
                }
                Err(e) => {
                    tracing::warn!(tier = ?tier, backend = %descriptor.name, error = %e, "generation fallback");
                    attempts.push(TierAttempt {
                        tier,
                        backend: descriptor.name,
                        outcome: AttemptOutcome::Failed {
                            error: e.to_string(),
                        },
                    });
                }
            }
        }

        Err(GenerationError::GenerationUnavailable { attempts })
    }

    /// Configured backends with live availability.
    pub async fn status(&self) -> SelectorStatus {
        let mut backends = Vec::new();
        for backend in [&self.local, &self.hosted].into_iter().flatten() {
            let mut descriptor = backend.descriptor();
            descriptor.available = descriptor.available && backend.health_check().await;
            backends.push(descriptor);
        }
        let live = backends.iter().filter(|b| b.available).count();
        SelectorStatus {
            prefer_local: self.prefer_local,
            static_fallback: self.static_fallback,
            plan: self.plan(self.prefer_local),
            has_fallback: live > 1 || (live == 1 && self.static_fallback),
            backends,
        }
    }
}
