use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use tracing::debug;

use super::{
    read_body, restore_json_prefix, split_data_url, ModelProvider, ProviderCapabilities, ProviderKind,
    ProviderRequest, ProviderResponse, UsageStats,
};
use crate::credentials::CredentialStore;
use crate::error::ProviderError;

const DEFAULT_BASE: &str = "https://api.anthropic.com";
const API_VERSION: &str = "2023-06-01";
const MAX_TOKENS: u32 = 1000;

#[derive(Clone, Default)]
pub struct AnthropicProvider {
    http: Client,
}

impl AnthropicProvider {
    pub fn new(http: Client) -> Self {
        Self { http }
    }

    pub(crate) fn build_body(model: &str, request: &ProviderRequest) -> Value {
        let mut content = vec![json!({ "type": "text", "text": request.prompt })];
        if let Some(image) = &request.image_data {
            let (media_type, data) = split_data_url(image);
            content.push(json!({
                "type": "image",
                "source": { "type": "base64", "media_type": media_type, "data": data }
            }));
        }
        let mut messages = vec![json!({ "role": "user", "content": content })];
        if request.json_mode {
            messages.push(json!({ "role": "assistant", "content": [{ "type": "text", "text": "{" }] }));
        }
        let mut body = json!({
            "model": model,
            "messages": messages,
            "max_tokens": MAX_TOKENS,
            "temperature": 0,
        });
        if let Some(system) = &request.system_message {
            body["system"] = Value::String(system.clone());
        }
        body
    }

    fn parse_body(v: &Value, json_mode: bool) -> Result<ProviderResponse, ProviderError> {
        let text = v
            .pointer("/content/0/text")
            .and_then(Value::as_str)
            .ok_or_else(|| ProviderError::InvalidResponse("missing content[0].text".into()))?;
        let usage = v.get("usage").map(|u| {
            UsageStats::new(
                u.get("input_tokens").and_then(Value::as_u64).unwrap_or(0),
                u.get("output_tokens").and_then(Value::as_u64).unwrap_or(0),
            )
        });
        Ok(ProviderResponse {
            usage,
            raw_text: restore_json_prefix(text, json_mode),
        })
    }
}

#[async_trait]
impl ModelProvider for AnthropicProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Anthropic
    }

    fn capabilities(&self) -> ProviderCapabilities {
        ProviderCapabilities {
            supports_vision: true,
        }
    }

    async fn complete(
        &self,
        model: &str,
        request: &ProviderRequest,
        credentials: &dyn CredentialStore,
    ) -> Result<ProviderResponse, ProviderError> {
        let key = credentials
            .api_key(ProviderKind::Anthropic)
            .ok_or_else(|| ProviderError::AuthMissing { provider: "Anthropic".into() })?;
        let base = credentials
            .base_url(ProviderKind::Anthropic)
            .unwrap_or_else(|| DEFAULT_BASE.to_string());
        let url = format!("{}/v1/messages", base.trim_end_matches('/'));
        debug!(model, %url, "anthropic messages");

        let resp = self
            .http
            .post(url)
            .header("x-api-key", key)
            .header("anthropic-version", API_VERSION)
            .json(&Self::build_body(model, request))
            .send()
            .await?;
        let text = read_body(resp).await?;
        let v: Value = serde_json::from_str(&text)
            .map_err(|e| ProviderError::InvalidResponse(format!("failed to parse Anthropic response JSON: {e}")))?;
        Self::parse_body(&v, request.json_mode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::StaticCredentials;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn body_carries_system_image_and_priming() {
        let request = ProviderRequest {
            prompt: "p".into(),
            system_message: Some("s".into()),
            image_data: Some("data:image/webp;base64,QUJD".into()),
            json_mode: true,
        };
        let body = AnthropicProvider::build_body("claude-3-5-sonnet-20240620", &request);
        assert_eq!(body["system"], "s");
        assert_eq!(body["max_tokens"], 1000);
        assert_eq!(body["temperature"], 0);
        assert_eq!(body["messages"][0]["content"][1]["source"]["data"], "QUJD");
        assert_eq!(body["messages"][0]["content"][1]["source"]["media_type"], "image/webp");
        assert_eq!(body["messages"][1]["role"], "assistant");
    }

    #[tokio::test]
    async fn normalizes_usage_and_text() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .and(header("x-api-key", "ak"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "content": [{"type": "text", "text": "\"thought\":\"t\",\"action\":\"finish()\"}"}],
                "usage": {"input_tokens": 20, "output_tokens": 3}
            })))
            .expect(1)
            .mount(&server)
            .await;
        let creds = StaticCredentials::new()
            .with_key(ProviderKind::Anthropic, "ak")
            .with_base_url(ProviderKind::Anthropic, server.uri());
        let request = ProviderRequest {
            prompt: "p".into(),
            json_mode: true,
            ..Default::default()
        };
        let resp = AnthropicProvider::default()
            .complete("claude-3-opus-20240229", &request, &creds)
            .await
            .unwrap();
        assert_eq!(resp.raw_text, "{\"thought\":\"t\",\"action\":\"finish()\"}");
        assert_eq!(resp.usage, Some(UsageStats::new(20, 3)));
    }

    #[tokio::test]
    async fn unauthorized_is_fatal_kind() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401).set_body_json(json!({"error": {"message": "bad key"}})))
            .mount(&server)
            .await;
        let creds = StaticCredentials::new()
            .with_key(ProviderKind::Anthropic, "ak")
            .with_base_url(ProviderKind::Anthropic, server.uri());
        let err = AnthropicProvider::default()
            .complete("claude-3-opus-20240229", &ProviderRequest::default(), &creds)
            .await
            .unwrap_err();
        assert_eq!(err, ProviderError::Unauthorized("bad key".into()));
    }
}
