use std::env;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::action::ModelTurn;
use crate::error::{AgentError, ProviderError};
use crate::events::{EventBus, PilotEvent};
use crate::llm::prompts::{format_prompt, system_message};
use crate::llm::registry::DEFAULT_MODEL;
use crate::llm::{ModelGateway, ProviderRequest, UsageStats};
use crate::parse::{parse_with_mode, ParseMode};

// ========================= Error classification =========================

/// Decides whether a gateway error is worth another attempt.
pub trait ErrorClassifier: Send + Sync {
    fn is_recoverable(&self, err: &ProviderError) -> bool;
}

/// Missing or rejected credentials, unknown models and client-side API
/// errors are fatal. Everything transient is retried.
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultErrorClassifier;

impl ErrorClassifier for DefaultErrorClassifier {
    fn is_recoverable(&self, err: &ProviderError) -> bool {
        match err {
            ProviderError::AuthMissing { .. }
            | ProviderError::Unauthorized(_)
            | ProviderError::Unsupported(_) => false,
            ProviderError::RateLimited { .. }
            | ProviderError::Network(_)
            | ProviderError::InvalidResponse(_) => true,
            ProviderError::Api { status, .. } => *status >= 500 || *status == 408 || *status == 429,
        }
    }
}

// ========================= Agent =========================

#[derive(Clone, Debug)]
pub struct AgentConfig {
    pub model: String,
    pub max_attempts: usize,
    pub parse_mode: ParseMode,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            model: env::var("PAGEPILOT_MODEL").unwrap_or_else(|_| DEFAULT_MODEL.to_string()),
            max_attempts: env::var("PAGEPILOT_MAX_ATTEMPTS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(3),
            parse_mode: ParseMode::from_env(),
        }
    }
}

/// The decided turn together with what produced it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NextAction {
    pub turn: ModelTurn,
    pub usage: Option<UsageStats>,
    pub prompt: String,
    pub raw_text: String,
}

pub struct Agent {
    gateway: Arc<dyn ModelGateway>,
    classifier: Arc<dyn ErrorClassifier>,
    cfg: AgentConfig,
    events: EventBus,
    cancel: Option<CancellationToken>,
}

impl Agent {
    pub fn new(gateway: Arc<dyn ModelGateway>, cfg: AgentConfig) -> Self {
        Self {
            gateway,
            classifier: Arc::new(DefaultErrorClassifier),
            cfg,
            events: EventBus::new(),
            cancel: None,
        }
    }

    pub fn with_classifier(mut self, classifier: Arc<dyn ErrorClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn config(&self) -> &AgentConfig {
        &self.cfg
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Ask the model for the next turn given the task, what was already done
    /// and the current page contents.
    pub async fn determine_next_action(
        &self,
        instructions: &str,
        history: &[ModelTurn],
        page_snapshot: &str,
        max_attempts: Option<usize>,
    ) -> Result<NextAction, AgentError> {
        self.next_action(instructions, history, page_snapshot, None, max_attempts)
            .await
    }

    /// Same as [`Agent::determine_next_action`] with a screenshot attached as a
    /// `data:` URL. Models without vision receive the text prompt only.
    pub async fn determine_next_action_with_image(
        &self,
        instructions: &str,
        history: &[ModelTurn],
        page_snapshot: &str,
        image_data: &str,
        max_attempts: Option<usize>,
    ) -> Result<NextAction, AgentError> {
        self.next_action(
            instructions,
            history,
            page_snapshot,
            Some(image_data.to_string()),
            max_attempts,
        )
        .await
    }

    async fn next_action(
        &self,
        instructions: &str,
        history: &[ModelTurn],
        page_snapshot: &str,
        image_data: Option<String>,
        max_attempts: Option<usize>,
    ) -> Result<NextAction, AgentError> {
        let attempts = max_attempts.unwrap_or(self.cfg.max_attempts).max(1);
        let model = self.cfg.model.as_str();
        let mut last_error = String::from("no attempt was made");

        for attempt in 1..=attempts {
            if self.cancel.as_ref().is_some_and(|c| c.is_cancelled()) {
                return Err(AgentError::Cancelled);
            }

            let prompt = format_prompt(instructions, history, page_snapshot);
            let request = ProviderRequest {
                prompt: prompt.clone(),
                system_message: Some(system_message()),
                image_data: image_data.clone(),
                json_mode: true,
            };
            debug!(model, attempt, attempts, "requesting next action");

            match self.gateway.invoke(model, request).await {
                Ok(resp) => match parse_with_mode(&resp.raw_text, self.cfg.parse_mode) {
                    Ok(turn) => {
                        info!(model, attempt, action = turn.action.name(), thought = %turn.thought, "next action decided");
                        return Ok(NextAction {
                            turn,
                            usage: resp.usage,
                            prompt,
                            raw_text: resp.raw_text,
                        });
                    }
                    Err(err) => {
                        warn!(model, attempt, error = %err, raw = %resp.raw_text, "unparseable model reply");
                        self.events.publish(PilotEvent::ParseFailed {
                            attempt,
                            reason: err.to_string(),
                        });
                        last_error = err.to_string();
                    }
                },
                Err(err) if self.classifier.is_recoverable(&err) => {
                    warn!(model, attempt, error = %err, "recoverable provider error");
                    self.events.publish(PilotEvent::RecoverableError {
                        attempt,
                        message: err.to_string(),
                    });
                    if let ProviderError::RateLimited { retry_after: Some(delay) } = &err {
                        if attempt < attempts {
                            sleep(*delay).await;
                        }
                    }
                    last_error = err.to_string();
                }
                Err(err) => {
                    warn!(model, attempt, error = %err, "fatal provider error");
                    return Err(err.into());
                }
            }
        }

        let message = format!(
            "Failed to get a valid response from {model} after {attempts} attempt(s). Last error: {last_error}"
        );
        self.events.publish(PilotEvent::Exhausted {
            message: message.clone(),
        });
        Err(AgentError::AttemptsExhausted { attempts, message })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::Action;
    use async_trait::async_trait;
    use crate::llm::ProviderResponse;
    use parking_lot::Mutex;
    use std::time::Duration;

    struct ScriptedGateway {
        replies: Mutex<Vec<Result<String, ProviderError>>>,
        calls: Mutex<Vec<ProviderRequest>>,
    }

    impl ScriptedGateway {
        fn new(replies: Vec<Result<&str, ProviderError>>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.into_iter().map(|r| r.map(str::to_string)).collect()),
                calls: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> usize {
            self.calls.lock().len()
        }
    }

    #[async_trait]
    impl ModelGateway for ScriptedGateway {
        async fn invoke(&self, _model: &str, request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
            self.calls.lock().push(request);
            let raw_text = self.replies.lock().remove(0)?;
            Ok(ProviderResponse {
                usage: Some(UsageStats::new(5, 5)),
                raw_text,
            })
        }
    }

    fn cfg() -> AgentConfig {
        AgentConfig {
            model: "gpt-4o".into(),
            max_attempts: 3,
            parse_mode: ParseMode::Lenient,
        }
    }

    const CLICK: &str = r#"{"thought":"open it","action":"click(\"42\")"}"#;

    #[tokio::test]
    async fn returns_first_valid_turn_after_failures() {
        let gw = ScriptedGateway::new(vec![
            Ok("I think we should click"),
            Err(ProviderError::Network("connection reset".into())),
            Ok(CLICK),
        ]);
        let agent = Agent::new(gw.clone(), cfg());
        let next = agent.determine_next_action("open the link", &[], "<a id=42>", None).await.unwrap();
        assert_eq!(next.turn.action, Action::Click { target_id: "42".into() });
        assert_eq!(next.raw_text, CLICK);
        assert!(next.prompt.contains("open the link"));
        assert_eq!(gw.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_delay_is_honoured() {
        let gw = ScriptedGateway::new(vec![
            Err(ProviderError::RateLimited {
                retry_after: Some(Duration::from_secs(7)),
            }),
            Ok(CLICK),
        ]);
        let agent = Agent::new(gw.clone(), cfg());
        let started = tokio::time::Instant::now();
        let next = agent.determine_next_action("x", &[], "", None).await.unwrap();
        assert_eq!(next.turn.action, Action::Click { target_id: "42".into() });
        assert!(started.elapsed() >= Duration::from_secs(7));
        assert_eq!(gw.calls(), 2);
    }

    #[tokio::test]
    async fn fatal_errors_stop_on_first_attempt() {
        let gw = ScriptedGateway::new(vec![
            Err(ProviderError::AuthMissing { provider: "openai".into() }),
            Ok(CLICK),
        ]);
        let agent = Agent::new(gw.clone(), cfg());
        let err = agent.determine_next_action("x", &[], "", None).await.unwrap_err();
        assert_eq!(err, AgentError::Provider(ProviderError::AuthMissing { provider: "openai".into() }));
        assert_eq!(gw.calls(), 1);
    }

    #[tokio::test]
    async fn exhaustion_carries_a_message_and_publishes() {
        let gw = ScriptedGateway::new(vec![Ok("nope"), Ok("{}")]);
        let agent = Agent::new(gw.clone(), cfg());
        let mut rx = agent.events().subscribe();
        let err = agent.determine_next_action("x", &[], "", Some(2)).await.unwrap_err();
        match err {
            AgentError::AttemptsExhausted { attempts, message } => {
                assert_eq!(attempts, 2);
                assert!(message.contains("gpt-4o"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(gw.calls(), 2);
        assert!(matches!(rx.recv().await.unwrap(), PilotEvent::ParseFailed { attempt: 1, .. }));
        assert!(matches!(rx.recv().await.unwrap(), PilotEvent::ParseFailed { attempt: 2, .. }));
        assert!(matches!(rx.recv().await.unwrap(), PilotEvent::Exhausted { .. }));
    }

    #[tokio::test]
    async fn image_is_forwarded_and_history_embedded() {
        let gw = ScriptedGateway::new(vec![Ok(CLICK)]);
        let agent = Agent::new(gw.clone(), cfg());
        let history = vec![ModelTurn::new("scroll first", Action::Wait)];
        agent
            .determine_next_action_with_image("x", &history, "", "data:image/png;base64,AA", None)
            .await
            .unwrap();
        let sent = gw.calls.lock()[0].clone();
        assert_eq!(sent.image_data.as_deref(), Some("data:image/png;base64,AA"));
        assert!(sent.json_mode);
        assert!(sent.prompt.contains("Thought: scroll first"));
    }

    #[tokio::test]
    async fn cancelled_before_first_attempt() {
        let gw = ScriptedGateway::new(vec![Ok(CLICK)]);
        let token = CancellationToken::new();
        token.cancel();
        let agent = Agent::new(gw.clone(), cfg()).with_cancellation(token);
        assert_eq!(
            agent.determine_next_action("x", &[], "", None).await.unwrap_err(),
            AgentError::Cancelled
        );
        assert_eq!(gw.calls(), 0);
    }

    #[test]
    fn classifier_splits_fatal_from_transient() {
        let c = DefaultErrorClassifier;
        assert!(!c.is_recoverable(&ProviderError::AuthMissing { provider: "x".into() }));
        assert!(!c.is_recoverable(&ProviderError::Unsupported("m".into())));
        assert!(!c.is_recoverable(&ProviderError::Api { status: 400, message: String::new() }));
        assert!(c.is_recoverable(&ProviderError::Api { status: 503, message: String::new() }));
        assert!(c.is_recoverable(&ProviderError::RateLimited { retry_after: None }));
        assert!(c.is_recoverable(&ProviderError::InvalidResponse("truncated".into())));
    }
}
