//! HTTP generation backends: a local Ollama server and an OpenAI-compatible
//! chat completions endpoint.

use anyhow::Result;
use async_trait::async_trait;
use std::time::Duration;

use super::{BackendKind, CostClass, GenerationBackend, GenerationError, GenerationRequest, ModelBackend};
use crate::config::{HostedLlmConfig, LocalLlmConfig};

fn http_client(timeout: Duration) -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder().timeout(timeout).build()?)
}

fn transport_error(service: &str, e: reqwest::Error) -> GenerationError {
    if e.is_timeout() {
        GenerationError::ModelUnavailable(format!("{service} request timed out"))
    } else {
        GenerationError::ModelUnavailable(format!("{service} request failed: {e}"))
    }
}

async fn status_error(service: &str, response: reqwest::Response) -> GenerationError {
    let status = response.status();
    let body_text = response.text().await.unwrap_or_default();
    let message = format!("{service} API error {status}: {body_text}");
    if status.as_u16() == 429 {
        GenerationError::RateLimited(message)
    } else if status.is_server_error() {
        GenerationError::ModelUnavailable(message)
    } else {
        GenerationError::Malformed(message)
    }
}

// ============ Ollama ============

/// Local generation through Ollama's `POST /api/generate`.
pub struct OllamaBackend {
    client: reqwest::Client,
    url: String,
    model: String,
}

impl OllamaBackend {
    pub fn new(config: &LocalLlmConfig, timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: http_client(timeout)?,
            url: config.url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
        })
    }
}

#[async_trait]
impl GenerationBackend for OllamaBackend {
    fn descriptor(&self) -> ModelBackend {
        ModelBackend {
            name: format!("ollama:{}", self.model),
            kind: BackendKind::Local,
            available: true,
            cost_class: CostClass::Free,
        }
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<String, GenerationError> {
        let body = serde_json::json!({
            "model": self.model,
            "system": request.system,
            "prompt": request.prompt,
            "stream": false,
            "options": { "num_predict": request.max_tokens },
        });

        let response = self
            .client
            .post(format!("{}/api/generate", self.url))
            .json(&body)
            .send()
            .await
            .map_err(|e| transport_error("Ollama", e))?;

        if !response.status().is_success() {
            return Err(status_error("Ollama", response).await);
        }

        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| GenerationError::Malformed(e.to_string()))?;
        parse_ollama_generation(&json)
    }

    /// Ollama answers `GET /api/tags` when it is running.
    async fn health_check(&self) -> bool {
        match self.client.get(format!("{}/api/tags", self.url)).send().await {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }
}

fn parse_ollama_generation(json: &serde_json::Value) -> Result<String, GenerationError> {
    json.get("response")
        .and_then(|r| r.as_str())
        .map(str::to_string)
        .ok_or_else(|| GenerationError::Malformed("missing response field".to_string()))
}

// ============ OpenAI-compatible ============

/// Hosted generation through `POST {url}/chat/completions`.
///
/// Available only while the configured API key variable is set.
pub struct OpenAiBackend {
    client: reqwest::Client,
    url: String,
    model: String,
    api_key_env: String,
    max_tokens: u32,
}

impl OpenAiBackend {
    pub fn new(config: &HostedLlmConfig, timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: http_client(timeout)?,
            url: config.url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            api_key_env: config.api_key_env.clone(),
            max_tokens: config.max_tokens,
        })
    }

    fn api_key(&self) -> Option<String> {
        std::env::var(&self.api_key_env)
            .ok()
            .filter(|k| !k.trim().is_empty())
    }
}

#[async_trait]
impl GenerationBackend for OpenAiBackend {
    fn descriptor(&self) -> ModelBackend {
        ModelBackend {
            name: format!("openai:{}", self.model),
            kind: BackendKind::Hosted,
            available: self.api_key().is_some(),
            cost_class: CostClass::Metered,
        }
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<String, GenerationError> {
        let api_key = self
            .api_key()
            .ok_or_else(|| GenerationError::ModelUnavailable(format!("{} not set", self.api_key_env)))?;

        let body = serde_json::json!({
            "model": self.model,
            "messages": [
                { "role": "system", "content": request.system },
                { "role": "user", "content": request.prompt },
            ],
            "max_tokens": request.max_tokens.min(self.max_tokens),
            "temperature": 0.7,
        });

        let response = self
            .client
            .post(format!("{}/chat/completions", self.url))
            .header("Authorization", format!("Bearer {}", api_key))
            .json(&body)
            .send()
            .await
            .map_err(|e| transport_error("OpenAI", e))?;

        if !response.status().is_success() {
            return Err(status_error("OpenAI", response).await);
        }

        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| GenerationError::Malformed(e.to_string()))?;
        parse_chat_completion(&json)
    }
}

fn parse_chat_completion(json: &serde_json::Value) -> Result<String, GenerationError> {
    json.get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("message"))
        .and_then(|m| m.get("content"))
        .and_then(|c| c.as_str())
        .map(str::to_string)
        .ok_or_else(|| GenerationError::Malformed("missing choices[0].message.content".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ollama_generation() {
        let json = serde_json::json!({"model": "llama3", "response": "hello", "done": true});
        assert_eq!(parse_ollama_generation(&json).unwrap(), "hello");
        assert!(parse_ollama_generation(&serde_json::json!({"done": true})).is_err());
    }

    #[test]
    fn test_parse_chat_completion() {
        let json = serde_json::json!({
            "choices": [{"message": {"role": "assistant", "content": "walkthrough"}}]
        });
        assert_eq!(parse_chat_completion(&json).unwrap(), "walkthrough");
        assert!(matches!(
            parse_chat_completion(&serde_json::json!({"choices": []})),
            Err(GenerationError::Malformed(_))
        ));
    }

    #[test]
    fn test_hosted_unavailable_without_key() {
        let config = HostedLlmConfig {
            url: "https://api.example.test/v1/".into(),
            model: "gpt-4o-mini".into(),
            api_key_env: "CQ_TEST_KEY_THAT_IS_NEVER_SET".into(),
            max_tokens: 100,
        };
        let backend = OpenAiBackend::new(&config, Duration::from_secs(1)).unwrap();
        let d = backend.descriptor();
        assert!(!d.available);
        assert_eq!(d.kind, BackendKind::Hosted);
        assert_eq!(d.cost_class, CostClass::Metered);
        assert_eq!(backend.url, "https://api.example.test/v1");
    }
}
