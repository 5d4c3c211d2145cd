use std::collections::HashMap;
use std::env;
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;
use tracing::{debug, info, warn};

use super::prompts::hardened_preamble;
use super::{
    AnthropicProvider, GeminiProvider, ModelProvider, ModelRegistry, OllamaProvider, OpenAiProvider,
    ProviderKind, ProviderRequest, ProviderResponse, UsageStats,
};
use crate::action::{Action, ModelTurn};
use crate::credentials::CredentialStore;
use crate::error::ProviderError;
use crate::events::{EventBus, PilotEvent};
use crate::parse::{parse_with_mode, ParseMode};

/// The single model-invocation seam the agent loop depends on.
#[async_trait]
pub trait ModelGateway: Send + Sync {
    async fn invoke(&self, model: &str, request: ProviderRequest) -> Result<ProviderResponse, ProviderError>;
}

#[derive(Clone, Debug)]
pub struct GatewayConfig {
    /// Calls made before a persistent `fail` reply is accepted as final.
    pub repair_attempts: usize,
    /// Parser policy used to spot `fail` replies; keep it in step with the agent's.
    pub parse_mode: ParseMode,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            repair_attempts: env::var("PAGEPILOT_REPAIR_ATTEMPTS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(2),
            parse_mode: ParseMode::from_env(),
        }
    }
}

/// Routes requests to registered providers and repairs spurious `fail` replies.
pub struct Gateway {
    registry: Arc<ModelRegistry>,
    providers: HashMap<ProviderKind, Arc<dyn ModelProvider>>,
    credentials: Arc<dyn CredentialStore>,
    cfg: GatewayConfig,
    events: EventBus,
}

impl Gateway {
    pub fn new(registry: Arc<ModelRegistry>, credentials: Arc<dyn CredentialStore>, cfg: GatewayConfig) -> Self {
        Self {
            registry,
            providers: HashMap::new(),
            credentials,
            cfg,
            events: EventBus::new(),
        }
    }

    /// Gateway with the OpenAI, Anthropic, Gemini and Ollama backends registered.
    pub fn with_default_providers(
        registry: Arc<ModelRegistry>,
        credentials: Arc<dyn CredentialStore>,
        cfg: GatewayConfig,
    ) -> Self {
        let http = Client::new();
        Self::new(registry, credentials, cfg)
            .with_provider(Arc::new(OpenAiProvider::new(http.clone())))
            .with_provider(Arc::new(AnthropicProvider::new(http.clone())))
            .with_provider(Arc::new(GeminiProvider::new(http.clone())))
            .with_provider(Arc::new(OllamaProvider::new(http)))
    }

    pub fn with_provider(mut self, provider: Arc<dyn ModelProvider>) -> Self {
        self.providers.insert(provider.kind(), provider);
        self
    }

    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    pub fn registry(&self) -> &Arc<ModelRegistry> {
        &self.registry
    }

    /// One routed provider call, without repair.
    pub async fn invoke_once(&self, model: &str, request: &ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        let kind = self.registry.route(model)?;
        let provider = self
            .providers
            .get(&kind)
            .ok_or_else(|| ProviderError::Unsupported(format!("{model} (no {kind} provider registered)")))?;

        if request.image_data.is_some()
            && !(provider.capabilities().supports_vision && self.registry.supports_vision(model))
        {
            warn!(model, provider = %kind, "model has no vision support; dropping image");
            let mut stripped = request.clone();
            stripped.image_data = None;
            return provider.complete(model, &stripped, self.credentials.as_ref()).await;
        }
        provider.complete(model, request, self.credentials.as_ref()).await
    }

    fn synthesized_failure(usage: Option<UsageStats>) -> ProviderResponse {
        let turn = ModelTurn::max_retries();
        ProviderResponse {
            usage,
            raw_text: json!({ "thought": turn.thought, "action": { "name": turn.action.name() } }).to_string(),
        }
    }
}

#[async_trait]
impl ModelGateway for Gateway {
    async fn invoke(&self, model: &str, mut request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        let preamble = hardened_preamble();
        request.system_message = Some(match request.system_message.take() {
            Some(system) => format!("{preamble}\n\n{system}"),
            None => preamble,
        });

        let attempts = self.cfg.repair_attempts.max(1);
        let mut usage = None;
        for attempt in 1..=attempts {
            let resp = self.invoke_once(model, &request).await?;
            usage = UsageStats::merge(usage, resp.usage);
            match parse_with_mode(&resp.raw_text, self.cfg.parse_mode) {
                Ok(turn) if turn.action == Action::Fail => {
                    warn!(model, attempt, thought = %turn.thought, "model replied fail; retrying");
                    self.events.publish(PilotEvent::RepairRetry {
                        model: model.to_string(),
                        attempt,
                    });
                }
                _ => {
                    debug!(model, attempt, "gateway reply accepted");
                    return Ok(ProviderResponse {
                        usage,
                        raw_text: resp.raw_text,
                    });
                }
            }
        }
        info!(model, attempts, "model kept replying fail; synthesizing terminal turn");
        Ok(Self::synthesized_failure(usage))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::StaticCredentials;
    use crate::parse::parse;
    use parking_lot::Mutex;

    pub(crate) struct ScriptedProvider {
        kind: ProviderKind,
        vision: bool,
        replies: Mutex<Vec<Result<String, ProviderError>>>,
        pub requests: Mutex<Vec<ProviderRequest>>,
    }

    impl ScriptedProvider {
        fn new(kind: ProviderKind, replies: Vec<Result<String, ProviderError>>) -> Self {
            Self {
                kind,
                vision: true,
                replies: Mutex::new(replies),
                requests: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ModelProvider for ScriptedProvider {
        fn kind(&self) -> ProviderKind {
            self.kind
        }

        fn capabilities(&self) -> super::super::ProviderCapabilities {
            super::super::ProviderCapabilities {
                supports_vision: self.vision,
            }
        }

        async fn complete(
            &self,
            _model: &str,
            request: &ProviderRequest,
            _credentials: &dyn CredentialStore,
        ) -> Result<ProviderResponse, ProviderError> {
            self.requests.lock().push(request.clone());
            let reply = self.replies.lock().remove(0)?;
            Ok(ProviderResponse {
                usage: Some(UsageStats::new(10, 1)),
                raw_text: reply,
            })
        }
    }

    const FAIL: &str = r#"{"thought":"cannot","action":"fail()"}"#;
    const WAIT: &str = r#"{"thought":"loading","action":"wait()"}"#;

    fn gateway(provider: Arc<ScriptedProvider>, repair_attempts: usize) -> Gateway {
        Gateway::new(
            Arc::new(ModelRegistry::new()),
            Arc::new(StaticCredentials::new()),
            GatewayConfig {
                repair_attempts,
                parse_mode: ParseMode::Lenient,
            },
        )
        .with_provider(provider)
    }

    #[tokio::test]
    async fn retries_spurious_fail_then_accepts() {
        let provider = Arc::new(ScriptedProvider::new(
            ProviderKind::OpenAi,
            vec![Ok(FAIL.into()), Ok(WAIT.into())],
        ));
        let gw = gateway(provider.clone(), 2);
        let resp = gw.invoke("gpt-4o", ProviderRequest::default()).await.unwrap();
        assert_eq!(resp.raw_text, WAIT);
        assert_eq!(resp.usage, Some(UsageStats::new(20, 2)));
        assert_eq!(provider.requests.lock().len(), 2);
    }

    #[tokio::test]
    async fn synthesizes_fail_after_budget() {
        let provider = Arc::new(ScriptedProvider::new(
            ProviderKind::OpenAi,
            vec![Ok(FAIL.into()), Ok(FAIL.into())],
        ));
        let gw = gateway(provider.clone(), 2);
        let resp = gw.invoke("gpt-4o", ProviderRequest::default()).await.unwrap();
        let turn = parse(&resp.raw_text).unwrap();
        assert_eq!(turn, ModelTurn::max_retries());
        assert_eq!(provider.requests.lock().len(), 2);
    }

    #[tokio::test]
    async fn strict_gateway_leaves_loose_fail_to_the_agent() {
        const BARE_FAIL: &str = r#"{"thought":"stuck","action":"fail"}"#;
        let provider = Arc::new(ScriptedProvider::new(
            ProviderKind::OpenAi,
            vec![Ok(BARE_FAIL.into()), Ok(WAIT.into())],
        ));
        let gw = Gateway::new(
            Arc::new(ModelRegistry::new()),
            Arc::new(StaticCredentials::new()),
            GatewayConfig {
                repair_attempts: 2,
                parse_mode: ParseMode::Strict,
            },
        )
        .with_provider(provider.clone());
        let resp = gw.invoke("gpt-4o", ProviderRequest::default()).await.unwrap();
        assert_eq!(resp.raw_text, BARE_FAIL);
        assert_eq!(provider.requests.lock().len(), 1);

        let provider = Arc::new(ScriptedProvider::new(
            ProviderKind::OpenAi,
            vec![Ok(BARE_FAIL.into()), Ok(WAIT.into())],
        ));
        let resp = gateway(provider.clone(), 2)
            .invoke("gpt-4o", ProviderRequest::default())
            .await
            .unwrap();
        assert_eq!(resp.raw_text, WAIT);
        assert_eq!(provider.requests.lock().len(), 2);
    }

    #[tokio::test]
    async fn provider_errors_are_not_repaired() {
        let provider = Arc::new(ScriptedProvider::new(
            ProviderKind::OpenAi,
            vec![Err(ProviderError::Network("reset".into())), Ok(WAIT.into())],
        ));
        let gw = gateway(provider.clone(), 2);
        let err = gw.invoke("gpt-4o", ProviderRequest::default()).await.unwrap_err();
        assert_eq!(err, ProviderError::Network("reset".into()));
        assert_eq!(provider.requests.lock().len(), 1);
    }

    #[tokio::test]
    async fn unparseable_replies_pass_through() {
        let provider = Arc::new(ScriptedProvider::new(ProviderKind::OpenAi, vec![Ok("nonsense".into())]));
        let gw = gateway(provider.clone(), 2);
        let resp = gw.invoke("gpt-4o", ProviderRequest::default()).await.unwrap();
        assert_eq!(resp.raw_text, "nonsense");
    }

    #[tokio::test]
    async fn preamble_is_prepended_to_system_message() {
        let provider = Arc::new(ScriptedProvider::new(ProviderKind::OpenAi, vec![Ok(WAIT.into())]));
        let gw = gateway(provider.clone(), 2);
        let request = ProviderRequest {
            system_message: Some("base rules".into()),
            ..Default::default()
        };
        gw.invoke("gpt-4o", request).await.unwrap();
        let sent = provider.requests.lock()[0].system_message.clone().unwrap();
        assert!(sent.starts_with(&hardened_preamble()));
        assert!(sent.ends_with("base rules"));
    }

    #[tokio::test]
    async fn routes_and_rejects_unknown_models() {
        let provider = Arc::new(ScriptedProvider::new(ProviderKind::OpenAi, vec![]));
        let gw = gateway(provider, 2);
        let err = gw.invoke("mystery", ProviderRequest::default()).await.unwrap_err();
        assert!(matches!(err, ProviderError::Unsupported(_)));
        let err = gw.invoke("claude-3-opus-20240229", ProviderRequest::default()).await.unwrap_err();
        assert!(matches!(err, ProviderError::Unsupported(_)));
    }

    #[tokio::test]
    async fn images_are_dropped_for_non_vision_models() {
        let provider = Arc::new(ScriptedProvider::new(ProviderKind::OpenAi, vec![Ok(WAIT.into()), Ok(WAIT.into())]));
        let gw = gateway(provider.clone(), 1);
        let request = ProviderRequest {
            image_data: Some("data:image/png;base64,AAAA".into()),
            ..Default::default()
        };
        gw.invoke("gpt-4", request.clone()).await.unwrap();
        gw.invoke("gpt-4o", request).await.unwrap();
        let sent = provider.requests.lock();
        assert!(sent[0].image_data.is_none());
        assert!(sent[1].image_data.is_some());
    }
}
