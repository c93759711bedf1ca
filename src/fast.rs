//! Fast responder — the synchronous half of the dual-path core.
//!
//! Every chat message lands here. Trivial messages are answered inline
//! (bypass); everything else gets an immediate short response while the
//! real work rides the job queue and arrives as a follow-up event.

use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Error, JobError, Result};
use crate::jobs::handler::HandlerRegistry;
use crate::jobs::model::DEEP_PROCESSING;
use crate::llm::{CompletionRequest, LlmProvider};
use crate::routing::{Router, RoutingDecision, TASK_EXECUTION};
use crate::store::Database;

/// Below this routing confidence the fast path asks for clarification
/// instead of queueing deep work on a guess.
const CLARIFY_BELOW: f32 = 0.6;

const ACKNOWLEDGMENT_TEXT: &str = "Working on it — I'll post the full answer here shortly.";
const ACTION_PREVIEW_TEXT: &str =
    "Got it. I'll get started on that and follow up here once it's done.";
const CLARIFICATION_TEXT: &str =
    "I want to make sure I get this right — could you share a bit more detail about what you need?";

/// What kind of immediate response the fast path produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseType {
    Acknowledgment,
    Clarification,
    Preview,
    ActionPreview,
    Direct,
}

/// One inbound chat message.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    pub message: String,
    pub user_id: String,
    #[serde(default)]
    pub thread_id: Option<String>,
    #[serde(default)]
    pub user_profile: Option<serde_json::Value>,
    #[serde(default)]
    pub force_agent: Option<String>,
    #[serde(default)]
    pub skip_fast_talker: bool,
}

/// The immediate reply, plus the follow-up ticket when one was queued.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatResponse {
    pub content: String,
    pub agent: String,
    pub thread_id: Uuid,
    pub has_follow_up: bool,
    /// Null when no deep work was queued.
    pub job_id: Option<Uuid>,
    pub response_type: ResponseType,
    pub routing: RoutingDecision,
    pub latency_ms: u64,
}

/// Routes, answers fast, and hands deep work to the queue.
pub struct FastResponder {
    db: Arc<dyn Database>,
    router: Arc<Router>,
    registry: Arc<HandlerRegistry>,
    llm: Option<Arc<dyn LlmProvider>>,
}

impl FastResponder {
    pub fn new(
        db: Arc<dyn Database>,
        router: Arc<Router>,
        registry: Arc<HandlerRegistry>,
        llm: Option<Arc<dyn LlmProvider>>,
    ) -> Self {
        Self {
            db,
            router,
            registry,
            llm,
        }
    }

    /// Handle one chat message end to end.
    ///
    /// Errors on this path surface to the caller as-is; there is no
    /// fallback tier beneath the fast responder.
    pub async fn respond(&self, input: ChatRequest) -> Result<ChatResponse> {
        let start = Instant::now();

        // An unparseable thread id starts a fresh thread; the reply
        // carries the id the caller should keep using.
        let thread_id = input
            .thread_id
            .as_deref()
            .and_then(|s| Uuid::parse_str(s).ok())
            .unwrap_or_else(Uuid::new_v4);

        let decision = self
            .router
            .route(&input.message, input.force_agent.as_deref())
            .await;

        self.db.ensure_conversation(thread_id, &input.user_id).await?;
        self.db
            .add_conversation_message(thread_id, "user", &input.message)
            .await?;

        let bypass = self
            .router
            .should_bypass(&input.message, &decision, input.skip_fast_talker);

        let (content, response_type, job_id) = if bypass {
            debug!(agent = %decision.agent, "Bypassing fast talker");
            let content = self.process_inline(&input, thread_id, &decision).await?;
            (content, ResponseType::Direct, None)
        } else {
            self.fast_talk(&input, thread_id, &decision).await?
        };

        self.db
            .add_conversation_message(thread_id, "assistant", &content)
            .await?;

        let latency_ms = start.elapsed().as_millis() as u64;
        info!(
            agent = %decision.agent,
            response_type = ?response_type,
            has_follow_up = job_id.is_some(),
            latency_ms,
            "Chat handled"
        );

        Ok(ChatResponse {
            content,
            agent: decision.agent.clone(),
            thread_id,
            has_follow_up: job_id.is_some(),
            job_id,
            response_type,
            routing: decision,
            latency_ms,
        })
    }

    /// Bypass: run the full pipeline synchronously through the registry.
    async fn process_inline(
        &self,
        input: &ChatRequest,
        thread_id: Uuid,
        decision: &RoutingDecision,
    ) -> Result<String> {
        let handler = self
            .registry
            .get(DEEP_PROCESSING)
            .await
            .ok_or_else(|| JobError::NoHandler {
                job_type: DEEP_PROCESSING.to_string(),
            })?;

        let payload = self.job_payload(input, thread_id, &decision.agent);
        let output = handler.handle(&payload).await.map_err(|e| {
            Error::Job(JobError::HandlerFailed {
                job_type: DEEP_PROCESSING.to_string(),
                reason: e.to_string(),
            })
        })?;

        Ok(output.content)
    }

    /// Immediate short response plus, when warranted, the queued follow-up.
    async fn fast_talk(
        &self,
        input: &ChatRequest,
        thread_id: Uuid,
        decision: &RoutingDecision,
    ) -> Result<(String, ResponseType, Option<Uuid>)> {
        if decision.confidence < CLARIFY_BELOW {
            // Too uncertain to spend deep work on a guess.
            return Ok((
                CLARIFICATION_TEXT.to_string(),
                ResponseType::Clarification,
                None,
            ));
        }

        let (content, response_type) = if decision.agent == TASK_EXECUTION {
            (ACTION_PREVIEW_TEXT.to_string(), ResponseType::ActionPreview)
        } else {
            match self.model_preview(&input.message, &decision.agent).await {
                Some(preview) => (preview, ResponseType::Preview),
                None => (ACKNOWLEDGMENT_TEXT.to_string(), ResponseType::Acknowledgment),
            }
        };

        let payload = self.job_payload(input, thread_id, &decision.agent);
        let job_id = self.db.enqueue_job(DEEP_PROCESSING, &payload).await?;
        debug!(job_id = %job_id, agent = %decision.agent, "Deep work queued");

        Ok((content, response_type, Some(job_id)))
    }

    /// One short fast-model sentence about what is being looked into.
    /// None when no provider is configured or the call fails.
    async fn model_preview(&self, message: &str, agent: &str) -> Option<String> {
        let llm = self.llm.as_ref()?;
        let request = CompletionRequest {
            system: Some(format!(
                "You are the fast voice of a personal assistant. The {agent} \
                 specialist will answer fully in a moment. In one short sentence, \
                 tell the user what you are looking into. Do not answer the \
                 question itself."
            )),
            prompt: message.to_string(),
            max_tokens: 100,
        };

        match llm.complete(request).await {
            Ok(response) => {
                let preview = response.content.trim().to_string();
                if preview.is_empty() { None } else { Some(preview) }
            }
            Err(e) => {
                warn!(error = %e, "Fast preview call failed, using canned acknowledgment");
                None
            }
        }
    }

    fn job_payload(
        &self,
        input: &ChatRequest,
        thread_id: Uuid,
        agent: &str,
    ) -> serde_json::Value {
        let mut payload = json!({
            "message": input.message,
            "user_id": input.user_id,
            "thread_id": thread_id.to_string(),
            "agent": agent,
        });
        if let Some(ref profile) = input.user_profile {
            payload["profile"] = profile.clone();
        }
        payload
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RouterConfig;
    use crate::error::LlmError;
    use crate::jobs::handler::{HandlerError, HandlerOutput, JobHandler};
    use crate::jobs::model::JobStatus;
    use crate::llm::CompletionResponse;
    use crate::store::LibSqlBackend;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct EchoHandler {
        calls: AtomicUsize,
    }

    impl EchoHandler {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl JobHandler for EchoHandler {
        fn job_type(&self) -> &str {
            DEEP_PROCESSING
        }

        async fn handle(
            &self,
            payload: &serde_json::Value,
        ) -> std::result::Result<HandlerOutput, HandlerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let message = payload
                .get("message")
                .and_then(|v| v.as_str())
                .unwrap_or("");
            Ok(HandlerOutput::new(format!("answer: {message}")))
        }
    }

    struct FailingHandler;

    #[async_trait]
    impl JobHandler for FailingHandler {
        fn job_type(&self) -> &str {
            DEEP_PROCESSING
        }

        async fn handle(
            &self,
            _payload: &serde_json::Value,
        ) -> std::result::Result<HandlerOutput, HandlerError> {
            Err(HandlerError::from_message("model unavailable"))
        }
    }

    struct StubLlm {
        reply: String,
    }

    #[async_trait]
    impl LlmProvider for StubLlm {
        fn model_name(&self) -> &str {
            "stub"
        }

        async fn complete(
            &self,
            _request: CompletionRequest,
        ) -> std::result::Result<CompletionResponse, LlmError> {
            Ok(CompletionResponse {
                content: self.reply.clone(),
            })
        }
    }

    async fn responder_with(
        handler: Option<Arc<dyn JobHandler>>,
        llm: Option<Arc<dyn LlmProvider>>,
    ) -> (FastResponder, Arc<dyn Database>) {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let registry = Arc::new(HandlerRegistry::new());
        if let Some(handler) = handler {
            registry.register(handler).await;
        }
        let router = Arc::new(Router::new(RouterConfig::default(), None));
        let responder = FastResponder::new(db.clone(), router, registry, llm);
        (responder, db)
    }

    fn request(message: &str) -> ChatRequest {
        ChatRequest {
            message: message.to_string(),
            user_id: "u-1".to_string(),
            thread_id: None,
            user_profile: None,
            force_agent: None,
            skip_fast_talker: false,
        }
    }

    #[tokio::test]
    async fn bypass_answers_directly_without_enqueue() {
        let handler = EchoHandler::new();
        let (responder, db) = responder_with(Some(handler.clone()), None).await;

        let reply = responder.respond(request("What's 2+2?")).await.unwrap();

        assert_eq!(reply.response_type, ResponseType::Direct);
        assert_eq!(reply.content, "answer: What's 2+2?");
        assert!(reply.job_id.is_none());
        assert!(!reply.has_follow_up);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);

        let stats = db.queue_stats(Duration::from_secs(300)).await.unwrap();
        assert_eq!(stats.by_status.pending, 0);
        assert_eq!(stats.by_status.processing, 0);
    }

    #[tokio::test]
    async fn deep_message_acknowledges_and_enqueues() {
        let (responder, db) = responder_with(Some(EchoHandler::new()), None).await;

        let reply = responder
            .respond(request("Explain the tradeoffs between event sourcing and CRUD"))
            .await
            .unwrap();

        assert_eq!(reply.response_type, ResponseType::Acknowledgment);
        assert_eq!(reply.content, ACKNOWLEDGMENT_TEXT);
        assert!(reply.has_follow_up);
        let job_id = reply.job_id.unwrap();

        let job = db.get_job(job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(
            job.payload.get("message").and_then(|v| v.as_str()),
            Some("Explain the tradeoffs between event sourcing and CRUD")
        );
        assert_eq!(
            job.payload.get("agent").and_then(|v| v.as_str()),
            Some("deep-reasoning")
        );
        assert_eq!(
            job.payload.get("thread_id").and_then(|v| v.as_str()),
            Some(reply.thread_id.to_string().as_str())
        );
    }

    #[tokio::test]
    async fn task_message_gets_action_preview() {
        let (responder, _db) = responder_with(Some(EchoHandler::new()), None).await;

        let reply = responder
            .respond(request("Remind me to stretch at 6pm"))
            .await
            .unwrap();

        assert_eq!(reply.response_type, ResponseType::ActionPreview);
        assert!(reply.has_follow_up);
        assert_eq!(reply.routing.agent, TASK_EXECUTION);
    }

    #[tokio::test]
    async fn low_confidence_asks_for_clarification() {
        let (responder, db) = responder_with(Some(EchoHandler::new()), None).await;

        // No rule matches, no model configured: default decision at 0.5.
        let reply = responder
            .respond(request("quarterly portfolio allocation"))
            .await
            .unwrap();

        assert_eq!(reply.response_type, ResponseType::Clarification);
        assert!(reply.job_id.is_none());
        assert!(!reply.has_follow_up);

        let stats = db.queue_stats(Duration::from_secs(300)).await.unwrap();
        assert_eq!(stats.by_status.pending, 0);
    }

    #[tokio::test]
    async fn skip_flag_forces_direct_processing() {
        let handler = EchoHandler::new();
        let (responder, db) = responder_with(Some(handler.clone()), None).await;

        let mut input = request("Explain why the sky is blue in great detail");
        input.skip_fast_talker = true;
        let reply = responder.respond(input).await.unwrap();

        assert_eq!(reply.response_type, ResponseType::Direct);
        assert!(reply.job_id.is_none());
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        let stats = db.queue_stats(Duration::from_secs(300)).await.unwrap();
        assert_eq!(stats.by_status.pending, 0);
    }

    #[tokio::test]
    async fn missing_handler_surfaces_error_on_bypass() {
        let (responder, _db) = responder_with(None, None).await;

        let err = responder.respond(request("What's 2+2?")).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Job(JobError::NoHandler { ref job_type }) if job_type == DEEP_PROCESSING
        ));
    }

    #[tokio::test]
    async fn handler_failure_surfaces_error_on_bypass() {
        let (responder, _db) = responder_with(Some(Arc::new(FailingHandler)), None).await;

        let err = responder.respond(request("What's 2+2?")).await.unwrap_err();
        match err {
            Error::Job(JobError::HandlerFailed { reason, .. }) => {
                assert!(reason.contains("model unavailable"));
            }
            other => panic!("expected HandlerFailed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn conversation_turns_are_persisted() {
        let (responder, db) = responder_with(Some(EchoHandler::new()), None).await;

        let reply = responder
            .respond(request("Explain how DNS resolution works"))
            .await
            .unwrap();

        let messages = db
            .list_conversation_messages(reply.thread_id)
            .await
            .unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, "user");
        assert_eq!(messages[0].content, "Explain how DNS resolution works");
        assert_eq!(messages[1].role, "assistant");
    }

    #[tokio::test]
    async fn existing_thread_is_reused() {
        let (responder, db) = responder_with(Some(EchoHandler::new()), None).await;

        let first = responder.respond(request("hello")).await.unwrap();

        let mut second = request("thanks!");
        second.thread_id = Some(first.thread_id.to_string());
        let second = responder.respond(second).await.unwrap();

        assert_eq!(second.thread_id, first.thread_id);
        let messages = db
            .list_conversation_messages(first.thread_id)
            .await
            .unwrap();
        assert_eq!(messages.len(), 4);
    }

    #[tokio::test]
    async fn model_preview_replaces_canned_acknowledgment() {
        let llm: Arc<dyn LlmProvider> = Arc::new(StubLlm {
            reply: "Digging into the tradeoffs now.".to_string(),
        });
        let (responder, _db) = responder_with(Some(EchoHandler::new()), Some(llm)).await;

        let reply = responder
            .respond(request("Explain the tradeoffs between OLTP and OLAP storage"))
            .await
            .unwrap();

        assert_eq!(reply.response_type, ResponseType::Preview);
        assert_eq!(reply.content, "Digging into the tradeoffs now.");
        assert!(reply.has_follow_up);
    }

    #[tokio::test]
    async fn forced_agent_flows_into_the_job_payload() {
        let (responder, db) = responder_with(Some(EchoHandler::new()), None).await;

        let mut input = request("the thing we discussed");
        input.force_agent = Some(TASK_EXECUTION.to_string());
        let reply = responder.respond(input).await.unwrap();

        assert_eq!(reply.routing.agent, TASK_EXECUTION);
        assert_eq!(reply.response_type, ResponseType::ActionPreview);
        let job = db.get_job(reply.job_id.unwrap()).await.unwrap().unwrap();
        assert_eq!(
            job.payload.get("agent").and_then(|v| v.as_str()),
            Some(TASK_EXECUTION)
        );
    }
}
