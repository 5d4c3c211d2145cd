use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use tracing::debug;

use super::{
    read_body, restore_json_prefix, ModelProvider, ProviderCapabilities, ProviderKind, ProviderRequest,
    ProviderResponse, UsageStats,
};
use crate::credentials::CredentialStore;
use crate::error::ProviderError;

const DEFAULT_BASE: &str = "https://api.openai.com/v1";

/// Chat Completions backend (also serves OpenAI-compatible gateways via a base URL override).
#[derive(Clone, Default)]
pub struct OpenAiProvider {
    http: Client,
}

impl OpenAiProvider {
    pub fn new(http: Client) -> Self {
        Self { http }
    }

    /// o1 models reject the `system` role.
    fn system_role(model: &str) -> &'static str {
        if model.starts_with("o1") {
            "user"
        } else {
            "system"
        }
    }

    pub(crate) fn build_body(model: &str, request: &ProviderRequest) -> Value {
        let mut messages = Vec::new();
        if let Some(system) = &request.system_message {
            messages.push(json!({ "role": Self::system_role(model), "content": system }));
        }
        let mut content = vec![json!({ "type": "text", "text": request.prompt })];
        if let Some(image) = &request.image_data {
            content.push(json!({ "type": "image_url", "image_url": { "url": image } }));
        }
        messages.push(json!({ "role": "user", "content": content }));
        if request.json_mode {
            messages.push(json!({ "role": "assistant", "content": "{" }));
        }
        json!({ "model": model, "messages": messages })
    }

    fn parse_body(v: &Value, json_mode: bool) -> Result<ProviderResponse, ProviderError> {
        let text = v
            .pointer("/choices/0/message/content")
            .and_then(Value::as_str)
            .ok_or_else(|| ProviderError::InvalidResponse("missing choices[0].message.content".into()))?;
        let usage = v.get("usage").map(|u| {
            let prompt = u.get("prompt_tokens").and_then(Value::as_u64).unwrap_or(0);
            let completion = u.get("completion_tokens").and_then(Value::as_u64).unwrap_or(0);
            UsageStats {
                prompt_tokens: prompt,
                completion_tokens: completion,
                total_tokens: u
                    .get("total_tokens")
                    .and_then(Value::as_u64)
                    .unwrap_or(prompt + completion),
            }
        });
        Ok(ProviderResponse {
            usage,
            raw_text: restore_json_prefix(text, json_mode),
        })
    }
}

#[async_trait]
impl ModelProvider for OpenAiProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::OpenAi
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
            .api_key(ProviderKind::OpenAi)
            .ok_or_else(|| ProviderError::AuthMissing { provider: "OpenAI".into() })?;
        let base = credentials
            .base_url(ProviderKind::OpenAi)
            .unwrap_or_else(|| DEFAULT_BASE.to_string());
        let url = format!("{}/chat/completions", base.trim_end_matches('/'));
        debug!(model, %url, "openai chat completion");

        let resp = self
            .http
            .post(url)
            .bearer_auth(key)
            .json(&Self::build_body(model, request))
            .send()
            .await?;
        let text = read_body(resp).await?;
        let v: Value = serde_json::from_str(&text)
            .map_err(|e| ProviderError::InvalidResponse(format!("failed to parse OpenAI response JSON: {e}")))?;
        Self::parse_body(&v, request.json_mode)
    }
}
