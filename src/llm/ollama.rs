use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

use super::{
    read_body, ModelProvider, ProviderCapabilities, ProviderKind, ProviderRequest, ProviderResponse,
    UsageStats,
};
use crate::credentials::CredentialStore;
use crate::error::ProviderError;

const DEFAULT_HOST: &str = "http://localhost:11434";

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    stream: bool,
    format: Value,
    options: ChatOptions,
}

#[derive(Debug, Serialize)]
struct ChatOptions {
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    message: Option<ResponseMessage>,
    #[serde(default)]
    prompt_eval_count: Option<u64>,
    #[serde(default)]
    eval_count: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: String,
}

/// JSON schema handed to the daemon so it constrains output to a turn.
pub fn turn_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "thought": { "type": "string" },
            "action": {
                "type": "object",
                "properties": {
                    "name": { "type": "string" },
                    "args": { "type": "object" }
                },
                "required": ["name", "args"]
            }
        },
        "required": ["thought", "action"]
    })
}

/// Self-hosted daemon reachable over plain HTTP; needs no key.
#[derive(Clone, Default)]
pub struct OllamaProvider {
    http: Client,
}

impl OllamaProvider {
    pub fn new(http: Client) -> Self {
        Self { http }
    }
}

#[async_trait]
impl ModelProvider for OllamaProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Ollama
    }

    fn capabilities(&self) -> ProviderCapabilities {
        ProviderCapabilities {
            supports_vision: false,
        }
    }

    async fn complete(
        &self,
        model: &str,
        request: &ProviderRequest,
        credentials: &dyn CredentialStore,
    ) -> Result<ProviderResponse, ProviderError> {
        let host = credentials
            .base_url(ProviderKind::Ollama)
            .unwrap_or_else(|| DEFAULT_HOST.to_string());
        let url = format!("{}/api/chat", host.trim_end_matches('/'));
        debug!(model, %url, "ollama chat");

        let mut messages = Vec::with_capacity(2);
        if let Some(system) = &request.system_message {
            messages.push(ChatMessage { role: "system", content: system });
        }
        messages.push(ChatMessage { role: "user", content: &request.prompt });
        let body = ChatRequest {
            model,
            messages,
            stream: false,
            format: turn_schema(),
            options: ChatOptions { temperature: 0.0 },
        };

        let resp = self
            .http
            .post(url)
            .header("Origin", "http://localhost")
            .json(&body)
            .send()
            .await
            .map_err(|e| ProviderError::Network(format!("failed to reach Ollama: {e}")))?;
        let text = read_body(resp).await?;
        let parsed: ChatResponse = serde_json::from_str(&text)
            .map_err(|e| ProviderError::InvalidResponse(format!("failed to parse Ollama response JSON: {e}")))?;
        let prompt = parsed.prompt_eval_count.unwrap_or(0);
        let completion = parsed.eval_count.unwrap_or(0);
        Ok(ProviderResponse {
            usage: Some(UsageStats::new(prompt, completion)),
            raw_text: parsed.message.map(|m| m.content).unwrap_or_default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::StaticCredentials;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn posts_schema_constrained_chat() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .and(body_partial_json(json!({
                "model": "mistral",
                "stream": false,
                "options": {"temperature": 0.0},
                "format": {"required": ["thought", "action"]},
                "messages": [{"role": "system", "content": "s"}, {"role": "user", "content": "p"}]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "message": {"role": "assistant", "content": "{\"thought\":\"t\",\"action\":{\"name\":\"wait\",\"args\":{}}}"},
                "prompt_eval_count": 30,
                "eval_count": 9
            })))
            .expect(1)
            .mount(&server)
            .await;

        let creds = StaticCredentials::new().with_base_url(ProviderKind::Ollama, server.uri());
        let request = ProviderRequest {
            prompt: "p".into(),
            system_message: Some("s".into()),
            ..Default::default()
        };
        let resp = OllamaProvider::default().complete("mistral", &request, &creds).await.unwrap();
        assert!(resp.raw_text.contains("\"wait\""));
        assert_eq!(resp.usage, Some(UsageStats::new(30, 9)));
    }

    #[tokio::test]
    async fn unreachable_daemon_is_network_error() {
        let creds = StaticCredentials::new().with_base_url(ProviderKind::Ollama, "http://127.0.0.1:9");
        let err = OllamaProvider::default()
            .complete("mistral", &ProviderRequest::default(), &creds)
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Network(_)));
    }
}
