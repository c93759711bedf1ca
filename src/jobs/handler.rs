//! Job type handlers — the uniform contract the worker dispatches through.
//!
//! New job types register a handler; queue logic never changes.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::ErrorKind;
use crate::llm::{CompletionRequest, LlmProvider};

/// Successful handler output.
#[derive(Debug, Clone)]
pub struct HandlerOutput {
    pub content: String,
    pub metadata: Option<serde_json::Value>,
}

impl HandlerOutput {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            metadata: None,
        }
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// Handler-reported failure, classified for retry decisions.
#[derive(Debug, Clone)]
pub struct HandlerError {
    pub message: String,
    pub code: Option<String>,
    pub kind: ErrorKind,
}

impl HandlerError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
            kind: ErrorKind::Transient,
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
            kind: ErrorKind::Permanent,
        }
    }

    /// Classify a raw error message by its text.
    pub fn from_message(message: impl Into<String>) -> Self {
        let message = message.into();
        let kind = ErrorKind::classify(&message);
        Self {
            message,
            code: None,
            kind,
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    /// Code recorded on the job row: the explicit code, or the kind.
    pub fn code_or_kind(&self) -> &str {
        self.code.as_deref().unwrap_or(self.kind.as_str())
    }
}

impl std::fmt::Display for HandlerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for HandlerError {}

/// A pluggable job executor.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Job type this handler executes.
    fn job_type(&self) -> &str;

    /// Run the handler against an opaque payload.
    async fn handle(&self, payload: &serde_json::Value) -> Result<HandlerOutput, HandlerError>;
}

/// Registry of job handlers, keyed by job type.
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn JobHandler>>>,
}

impl HandlerRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
        }
    }

    /// Register a handler under its job type.
    pub async fn register(&self, handler: Arc<dyn JobHandler>) {
        let job_type = handler.job_type().to_string();
        self.handlers.write().await.insert(job_type.clone(), handler);
        tracing::debug!("Registered handler: {}", job_type);
    }

    /// Get the handler for a job type.
    pub async fn get(&self, job_type: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers.read().await.get(job_type).cloned()
    }

    /// Check if a handler exists for a job type.
    pub async fn has(&self, job_type: &str) -> bool {
        self.handlers.read().await.contains_key(job_type)
    }

    /// List all registered job types.
    pub async fn list(&self) -> Vec<String> {
        self.handlers.read().await.keys().cloned().collect()
    }

    /// Get the number of registered handlers.
    pub fn count(&self) -> usize {
        self.handlers.try_read().map(|h| h.len()).unwrap_or(0)
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Built-in handler for `deep-processing` jobs: one completion call over the
/// enqueued message.
pub struct DeepProcessingHandler {
    llm: Arc<dyn LlmProvider>,
}

impl DeepProcessingHandler {
    pub fn new(llm: Arc<dyn LlmProvider>) -> Self {
        Self { llm }
    }
}

#[async_trait]
impl JobHandler for DeepProcessingHandler {
    fn job_type(&self) -> &str {
        crate::jobs::model::DEEP_PROCESSING
    }

    async fn handle(&self, payload: &serde_json::Value) -> Result<HandlerOutput, HandlerError> {
        let message = payload
            .get("message")
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                HandlerError::permanent("payload missing message field").with_code("invalid_payload")
            })?;
        let agent = payload
            .get("agent")
            .and_then(|v| v.as_str())
            .unwrap_or("deep-reasoning");

        let request = CompletionRequest {
            system: Some(format!(
                "You are the {agent} specialist of a personal assistant. \
                 Give a thorough, complete answer. The user already received \
                 a short acknowledgment, so skip preamble."
            )),
            prompt: message.to_string(),
            max_tokens: 1024,
        };

        let response = self
            .llm
            .complete(request)
            .await
            .map_err(|e| HandlerError::from_message(e.to_string()).with_code("llm_error"))?;

        Ok(HandlerOutput::new(response.content).with_metadata(serde_json::json!({
            "agent": agent,
            "model": self.llm.model_name(),
        })))
    }
}
