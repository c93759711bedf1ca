//! Routing decision engine.
//!
//! Runs a regex pass over the inbound message to pick an agent before
//! any model is consulted:
//! - arithmetic, greetings, lookups → quick-answer
//! - command verbs → task-execution
//! - explanation/analysis verbs → deep-reasoning
//!
//! If no pattern matches, an optional model fallback classifies the
//! message. When the model is absent or fails, the default agent wins
//! at low confidence.

use std::sync::Arc;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::RouterConfig;
use crate::llm::{CompletionRequest, LlmProvider};

/// Agent that answers trivial questions inline.
pub const QUICK_ANSWER: &str = "quick-answer";
/// Agent for messages that need real thought.
pub const DEEP_REASONING: &str = "deep-reasoning";
/// Agent for messages that ask for an action to be performed.
pub const TASK_EXECUTION: &str = "task-execution";

const KNOWN_AGENTS: [&str; 3] = [QUICK_ANSWER, DEEP_REASONING, TASK_EXECUTION];

/// Messages longer than this are assumed to need deep work.
const LONG_MESSAGE_CHARS: usize = 400;

/// Where a routing decision came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingSource {
    Heuristic,
    Model,
}

/// The outcome of routing one message.
#[derive(Debug, Clone, Serialize)]
pub struct RoutingDecision {
    pub agent: String,
    pub confidence: f32,
    pub rationale: String,
    pub source: RoutingSource,
}

/// A single routing rule with a compiled regex.
#[derive(Debug, Clone)]
struct RouteRule {
    /// Human-readable pattern description.
    pattern: String,
    regex: Regex,
    agent: &'static str,
    confidence: f32,
    rationale: String,
}

/// What the model fallback is asked to produce.
#[derive(Debug, Deserialize)]
struct ModelRoute {
    agent: String,
    #[serde(default)]
    confidence: f32,
    #[serde(default)]
    rationale: String,
}

/// Routing decision engine: heuristics first, model fallback second.
pub struct Router {
    rules: Vec<RouteRule>,
    /// One-clause question shapes that are safe to answer inline even
    /// when no rule fired.
    simple_query_patterns: Vec<Regex>,
    llm: Option<Arc<dyn LlmProvider>>,
    config: RouterConfig,
}

impl Router {
    /// Create a router with the default rule table.
    pub fn new(config: RouterConfig, llm: Option<Arc<dyn LlmProvider>>) -> Self {
        // First match wins, so trivial shapes come before broad ones.
        let rules = vec![
            RouteRule {
                pattern: "arithmetic expression".into(),
                regex: Regex::new(
                    r"(?i)^\s*(?:what(?:'s| is)|calculate|compute)\s+[-+]?[\d().\s]+[-+*/x×^%][\d().\s+*/x×^%-]*\??\s*$",
                )
                .unwrap(),
                agent: QUICK_ANSWER,
                confidence: 0.95,
                rationale: "arithmetic expression".into(),
            },
            RouteRule {
                pattern: "greeting".into(),
                regex: Regex::new(
                    r"(?i)^\s*(hi|hello|hey|yo|good (morning|afternoon|evening))[!,.\s]*$",
                )
                .unwrap(),
                agent: QUICK_ANSWER,
                confidence: 0.97,
                rationale: "greeting".into(),
            },
            RouteRule {
                pattern: "acknowledgment".into(),
                regex: Regex::new(
                    r"(?i)^\s*(thanks|thank you|thx|ty|got it|ok(ay)?|sounds good|cool)[!.\s]*$",
                )
                .unwrap(),
                agent: QUICK_ANSWER,
                confidence: 0.95,
                rationale: "acknowledgment".into(),
            },
            RouteRule {
                pattern: "clock/calendar query".into(),
                regex: Regex::new(r"(?i)^\s*what (time|day|date)\b").unwrap(),
                agent: QUICK_ANSWER,
                confidence: 0.9,
                rationale: "clock/calendar query".into(),
            },
            RouteRule {
                pattern: "definition lookup".into(),
                regex: Regex::new(
                    r"(?i)^\s*(what does \w+ (mean|stand for)|define \w+)\b",
                )
                .unwrap(),
                agent: QUICK_ANSWER,
                confidence: 0.87,
                rationale: "definition lookup".into(),
            },
            RouteRule {
                pattern: "reminder/scheduling verb".into(),
                regex: Regex::new(
                    r"(?i)^\s*(remind me|set (a )?(reminder|timer|alarm)|schedule|add .+ to my (list|calendar)|book )",
                )
                .unwrap(),
                agent: TASK_EXECUTION,
                confidence: 0.85,
                rationale: "actionable command".into(),
            },
            RouteRule {
                pattern: "content production verb".into(),
                regex: Regex::new(
                    r"(?i)^\s*(create|draft|generate|write|send) (a |an |the |me )?(email|message|document|report|summary|plan)\b",
                )
                .unwrap(),
                agent: TASK_EXECUTION,
                confidence: 0.8,
                rationale: "content production request".into(),
            },
            RouteRule {
                pattern: "explanation/analysis verb".into(),
                regex: Regex::new(
                    r"(?i)\b(why|how come|explain|compare|trade[- ]?offs?|pros and cons|analy[sz]e|walk me through|step[- ]by[- ]step)\b",
                )
                .unwrap(),
                agent: DEEP_REASONING,
                confidence: 0.7,
                rationale: "explanation or analysis request".into(),
            },
        ];

        let simple_query_patterns = vec![
            // One short clause, question word up front, no conjunctions.
            Regex::new(r"(?i)^\s*(what|who|when|where)(?:'s| is| are| was| were)\s+[^,.;]{1,40}\?\s*$")
                .unwrap(),
        ];

        Self {
            rules,
            simple_query_patterns,
            llm,
            config,
        }
    }

    /// Create a router with no rules and no model (for testing).
    pub fn empty(config: RouterConfig) -> Self {
        Self {
            rules: Vec::new(),
            simple_query_patterns: Vec::new(),
            llm: None,
            config,
        }
    }

    /// Route one message to an agent.
    ///
    /// An explicitly requested agent always wins. Otherwise the rule
    /// table is consulted, then message length, then the model.
    pub async fn route(&self, message: &str, force_agent: Option<&str>) -> RoutingDecision {
        if let Some(agent) = force_agent {
            return RoutingDecision {
                agent: agent.to_string(),
                confidence: 1.0,
                rationale: "explicitly requested agent".to_string(),
                source: RoutingSource::Heuristic,
            };
        }

        for rule in &self.rules {
            if rule.regex.is_match(message) {
                debug!(
                    rule = %rule.pattern,
                    agent = %rule.agent,
                    "Message matched routing rule"
                );
                return RoutingDecision {
                    agent: rule.agent.to_string(),
                    confidence: rule.confidence,
                    rationale: rule.rationale.clone(),
                    source: RoutingSource::Heuristic,
                };
            }
        }

        if message.chars().count() > LONG_MESSAGE_CHARS {
            return RoutingDecision {
                agent: DEEP_REASONING.to_string(),
                confidence: 0.65,
                rationale: "long multi-part message".to_string(),
                source: RoutingSource::Heuristic,
            };
        }

        if let Some(ref llm) = self.llm {
            match self.classify_with_model(llm.as_ref(), message).await {
                Some(decision) => return decision,
                None => {
                    warn!("Model routing fallback failed, using default agent");
                }
            }
        }

        self.default_decision()
    }

    /// True when the fast talker should be skipped entirely and the
    /// message answered in one direct response.
    pub fn should_bypass(
        &self,
        message: &str,
        decision: &RoutingDecision,
        skip_fast_talker: bool,
    ) -> bool {
        if skip_fast_talker {
            return true;
        }
        if decision.agent == QUICK_ANSWER && decision.confidence >= self.config.bypass_threshold {
            return true;
        }
        self.simple_query_patterns
            .iter()
            .any(|p| p.is_match(message))
    }

    async fn classify_with_model(
        &self,
        llm: &dyn LlmProvider,
        message: &str,
    ) -> Option<RoutingDecision> {
        let system = format!(
            "You route user messages to one of these agents: \
             {QUICK_ANSWER} (trivial factual or arithmetic questions, acknowledgments), \
             {TASK_EXECUTION} (the user wants an action performed), \
             {DEEP_REASONING} (anything needing real thought). \
             Respond with only a JSON object: \
             {{\"agent\": \"...\", \"confidence\": 0.0-1.0, \"rationale\": \"...\"}}"
        );
        let request = CompletionRequest {
            system: Some(system),
            prompt: message.to_string(),
            max_tokens: 200,
        };

        let response = match llm.complete(request).await {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "Model routing call failed");
                return None;
            }
        };

        let raw = extract_json(&response.content)?;
        let parsed: ModelRoute = match serde_json::from_str(raw) {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "Model routing response was not valid JSON");
                return None;
            }
        };

        if !KNOWN_AGENTS.contains(&parsed.agent.as_str()) {
            warn!(agent = %parsed.agent, "Model routed to an unknown agent");
            return None;
        }

        debug!(agent = %parsed.agent, confidence = parsed.confidence, "Model routed message");
        Some(RoutingDecision {
            agent: parsed.agent,
            confidence: parsed.confidence.clamp(0.0, 1.0),
            rationale: if parsed.rationale.is_empty() {
                "model classification".to_string()
            } else {
                parsed.rationale
            },
            source: RoutingSource::Model,
        })
    }

    fn default_decision(&self) -> RoutingDecision {
        RoutingDecision {
            agent: self.config.default_agent.clone(),
            confidence: 0.5,
            rationale: "no routing pattern matched".to_string(),
            source: RoutingSource::Heuristic,
        }
    }
}

/// Pull the first JSON object out of model output that may wrap it in prose.
fn extract_json(content: &str) -> Option<&str> {
    let start = content.find('{')?;
    let end = content.rfind('}')?;
    if end < start {
        return None;
    }
    Some(&content[start..=end])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LlmError;
    use crate::llm::CompletionResponse;
    use async_trait::async_trait;

    struct StubLlm {
        reply: String,
        fail: bool,
    }

    impl StubLlm {
        fn replying(reply: &str) -> Self {
            Self {
                reply: reply.to_string(),
                fail: false,
            }
        }

        fn failing() -> Self {
            Self {
                reply: String::new(),
                fail: true,
            }
        }
    }

    #[async_trait]
    impl LlmProvider for StubLlm {
        fn model_name(&self) -> &str {
            "stub"
        }

        async fn complete(
            &self,
            _request: CompletionRequest,
        ) -> Result<CompletionResponse, LlmError> {
            if self.fail {
                return Err(LlmError::RequestFailed {
                    provider: "stub".to_string(),
                    reason: "stub failure".to_string(),
                });
            }
            Ok(CompletionResponse {
                content: self.reply.clone(),
            })
        }
    }

    fn router() -> Router {
        Router::new(RouterConfig::default(), None)
    }

    fn decision(agent: &str, confidence: f32) -> RoutingDecision {
        RoutingDecision {
            agent: agent.to_string(),
            confidence,
            rationale: "test".to_string(),
            source: RoutingSource::Heuristic,
        }
    }

    #[tokio::test]
    async fn routes_arithmetic_to_quick_answer() {
        let decision = router().route("What's 2+2?", None).await;
        assert_eq!(decision.agent, QUICK_ANSWER);
        assert!(decision.confidence >= 0.85);
        assert_eq!(decision.source, RoutingSource::Heuristic);
    }

    #[tokio::test]
    async fn routes_greeting_to_quick_answer() {
        let decision = router().route("Hello!", None).await;
        assert_eq!(decision.agent, QUICK_ANSWER);
        assert!(decision.confidence >= 0.9);
    }

    #[tokio::test]
    async fn routes_thanks_to_quick_answer() {
        let decision = router().route("thanks!", None).await;
        assert_eq!(decision.agent, QUICK_ANSWER);
    }

    #[tokio::test]
    async fn routes_reminder_to_task_execution() {
        let decision = router()
            .route("Remind me to call the dentist tomorrow at 9am", None)
            .await;
        assert_eq!(decision.agent, TASK_EXECUTION);
        assert!(decision.confidence >= 0.8);
    }

    #[tokio::test]
    async fn routes_draft_request_to_task_execution() {
        let decision = router()
            .route("Draft an email to the team about the launch delay", None)
            .await;
        assert_eq!(decision.agent, TASK_EXECUTION);
    }

    #[tokio::test]
    async fn routes_explanation_to_deep_reasoning() {
        let decision = router()
            .route("Explain the tradeoffs between SQLite and Postgres for this workload", None)
            .await;
        assert_eq!(decision.agent, DEEP_REASONING);
    }

    #[tokio::test]
    async fn long_message_goes_deep() {
        let message = "background ".repeat(50);
        let decision = router().route(&message, None).await;
        assert_eq!(decision.agent, DEEP_REASONING);
        assert_eq!(decision.rationale, "long multi-part message");
    }

    #[tokio::test]
    async fn unmatched_message_defaults_without_model() {
        let decision = router()
            .route("quarterly portfolio allocation review", None)
            .await;
        assert_eq!(decision.agent, RouterConfig::default().default_agent);
        assert_eq!(decision.confidence, 0.5);
        assert_eq!(decision.source, RoutingSource::Heuristic);
    }

    #[tokio::test]
    async fn forced_agent_wins_over_rules() {
        let decision = router()
            .route("What's 2+2?", Some(DEEP_REASONING))
            .await;
        assert_eq!(decision.agent, DEEP_REASONING);
        assert_eq!(decision.confidence, 1.0);
        assert_eq!(decision.rationale, "explicitly requested agent");
    }

    #[tokio::test]
    async fn model_fallback_classifies_unmatched_message() {
        let llm = Arc::new(StubLlm::replying(
            r#"{"agent": "task-execution", "confidence": 0.8, "rationale": "implied action"}"#,
        ));
        let router = Router::new(RouterConfig::default(), Some(llm));
        let decision = router
            .route("the garage door thing from last week", None)
            .await;
        assert_eq!(decision.agent, TASK_EXECUTION);
        assert_eq!(decision.source, RoutingSource::Model);
        assert!((decision.confidence - 0.8).abs() < f32::EPSILON);
    }

    #[tokio::test]
    async fn model_fallback_handles_wrapped_json() {
        let llm = Arc::new(StubLlm::replying(
            "Sure, here is the routing:\n{\"agent\": \"deep-reasoning\", \"confidence\": 0.9, \"rationale\": \"multi-step\"}\nDone.",
        ));
        let router = Router::new(RouterConfig::default(), Some(llm));
        let decision = router.route("the usual friday rundown", None).await;
        assert_eq!(decision.agent, DEEP_REASONING);
        assert_eq!(decision.source, RoutingSource::Model);
    }

    #[tokio::test]
    async fn model_failure_degrades_to_default() {
        let llm = Arc::new(StubLlm::failing());
        let router = Router::new(RouterConfig::default(), Some(llm));
        let decision = router.route("the garage door thing", None).await;
        assert_eq!(decision.agent, RouterConfig::default().default_agent);
        assert_eq!(decision.source, RoutingSource::Heuristic);
    }

    #[tokio::test]
    async fn model_unknown_agent_degrades_to_default() {
        let llm = Arc::new(StubLlm::replying(
            r#"{"agent": "pirate", "confidence": 0.99, "rationale": "arr"}"#,
        ));
        let router = Router::new(RouterConfig::default(), Some(llm));
        let decision = router.route("the garage door thing", None).await;
        assert_eq!(decision.agent, RouterConfig::default().default_agent);
    }

    #[tokio::test]
    async fn bypasses_on_skip_flag() {
        let r = router();
        assert!(r.should_bypass("anything at all", &decision(DEEP_REASONING, 0.5), true));
    }

    #[tokio::test]
    async fn bypasses_on_confident_trivial_classification() {
        let r = router();
        assert!(r.should_bypass("thanks!", &decision(QUICK_ANSWER, 0.95), false));
    }

    #[tokio::test]
    async fn no_bypass_below_threshold() {
        let r = router();
        assert!(!r.should_bypass("tell me more", &decision(QUICK_ANSWER, 0.7), false));
    }

    #[tokio::test]
    async fn bypasses_on_simple_query_shape() {
        let r = router();
        // Routed deep at low confidence, but the shape is one short clause.
        assert!(r.should_bypass(
            "Who is the president of France?",
            &decision(DEEP_REASONING, 0.5),
            false
        ));
    }

    #[tokio::test]
    async fn no_bypass_for_deep_work() {
        let r = router();
        assert!(!r.should_bypass(
            "Compare Rust and Go for a latency-sensitive network service, considering team experience",
            &decision(DEEP_REASONING, 0.7),
            false
        ));
    }

    #[tokio::test]
    async fn empty_router_always_defaults() {
        let r = Router::empty(RouterConfig::default());
        let decision = r.route("What's 2+2?", None).await;
        assert_eq!(decision.agent, RouterConfig::default().default_agent);
    }

    #[test]
    fn extract_json_finds_object() {
        assert_eq!(extract_json(r#"noise {"a": 1} tail"#), Some(r#"{"a": 1}"#));
        assert_eq!(extract_json("no json here"), None);
    }
}
