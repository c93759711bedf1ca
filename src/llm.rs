//! LLM integration.
//!
//! One provider trait behind which the Anthropic messages API is called
//! directly over HTTP. The routing fallback, the fast path, and the
//! deep-processing handler all share it; tests swap in stubs.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use crate::error::LlmError;

const ANTHROPIC_VERSION: &str = "2023-06-01";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Configuration for creating an LLM provider.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub api_key: SecretString,
    pub model: String,
    pub base_url: String,
}

impl LlmConfig {
    /// Read provider configuration from the environment.
    ///
    /// Returns None when no API key is set, which disables the model
    /// fallback and the deep handler.
    pub fn from_env() -> Option<Self> {
        let api_key = std::env::var("FAST_TALK_API_KEY")
            .or_else(|_| std::env::var("ANTHROPIC_API_KEY"))
            .ok()
            .filter(|k| !k.is_empty())?;

        Some(Self {
            api_key: SecretString::from(api_key),
            model: std::env::var("FAST_TALK_MODEL")
                .unwrap_or_else(|_| "claude-sonnet-4-20250514".to_string()),
            base_url: std::env::var("FAST_TALK_LLM_BASE_URL")
                .unwrap_or_else(|_| "https://api.anthropic.com".to_string()),
        })
    }
}

/// A single completion call.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub system: Option<String>,
    pub prompt: String,
    pub max_tokens: u32,
}

/// Completion output.
#[derive(Debug, Clone)]
pub struct CompletionResponse {
    pub content: String,
}

/// Provider abstraction over one completion-style call.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Model identifier, for logging and output metadata.
    fn model_name(&self) -> &str;

    async fn complete(&self, request: CompletionRequest)
    -> Result<CompletionResponse, LlmError>;
}

/// Create an LLM provider from configuration.
pub fn create_provider(config: &LlmConfig) -> Result<Arc<dyn LlmProvider>, LlmError> {
    let client = reqwest::Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .build()
        .map_err(|e| LlmError::RequestFailed {
            provider: "anthropic".to_string(),
            reason: format!("Failed to build HTTP client: {e}"),
        })?;

    tracing::info!("Using Anthropic (model: {})", config.model);
    Ok(Arc::new(HttpLlm {
        client,
        api_key: config.api_key.clone(),
        model: config.model.clone(),
        base_url: config.base_url.trim_end_matches('/').to_string(),
    }))
}

/// Anthropic messages API over reqwest.
pub struct HttpLlm {
    client: reqwest::Client,
    api_key: SecretString,
    model: String,
    base_url: String,
}

#[derive(Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<&'a str>,
    messages: Vec<WireMessage<'a>>,
}

#[derive(Serialize)]
struct WireMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
}

#[derive(Deserialize)]
struct ContentBlock {
    #[serde(default)]
    text: String,
}

#[async_trait]
impl LlmProvider for HttpLlm {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(
        &self,
        request: CompletionRequest,
    ) -> Result<CompletionResponse, LlmError> {
        let body = MessagesRequest {
            model: &self.model,
            max_tokens: request.max_tokens,
            system: request.system.as_deref(),
            messages: vec![WireMessage {
                role: "user",
                content: &request.prompt,
            }],
        };

        let response = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", self.api_key.expose_secret())
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body)
            .send()
            .await
            .map_err(|e| LlmError::RequestFailed {
                provider: "anthropic".to_string(),
                reason: e.to_string(),
            })?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED
            || status == reqwest::StatusCode::FORBIDDEN
        {
            return Err(LlmError::AuthFailed {
                provider: "anthropic".to_string(),
            });
        }
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_secs);
            return Err(LlmError::RateLimited {
                provider: "anthropic".to_string(),
                retry_after,
            });
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(LlmError::RequestFailed {
                provider: "anthropic".to_string(),
                reason: format!("HTTP {status}: {text}"),
            });
        }

        let parsed: MessagesResponse =
            response.json().await.map_err(|e| LlmError::InvalidResponse {
                provider: "anthropic".to_string(),
                reason: e.to_string(),
            })?;

        let content = parsed
            .content
            .into_iter()
            .map(|block| block.text)
            .collect::<Vec<_>>()
            .join("");

        if content.is_empty() {
            return Err(LlmError::InvalidResponse {
                provider: "anthropic".to_string(),
                reason: "response carried no text content".to_string(),
            });
        }

        Ok(CompletionResponse { content })
    }
}
