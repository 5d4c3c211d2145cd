use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use tracing::debug;

use super::{
    read_body, split_data_url, ModelProvider, ProviderCapabilities, ProviderKind, ProviderRequest,
    ProviderResponse, UsageStats,
};
use crate::credentials::CredentialStore;
use crate::error::ProviderError;

const DEFAULT_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";

#[derive(Clone, Default)]
pub struct GeminiProvider {
    http: Client,
}

impl GeminiProvider {
    pub fn new(http: Client) -> Self {
        Self { http }
    }

    pub(crate) fn build_body(request: &ProviderRequest) -> Value {
        let mut parts = vec![json!({ "text": request.prompt })];
        if let Some(image) = &request.image_data {
            let (mime_type, data) = split_data_url(image);
            parts.push(json!({ "inlineData": { "mimeType": mime_type, "data": data } }));
        }
        let mut body = json!({ "contents": [{ "role": "user", "parts": parts }] });
        if let Some(system) = &request.system_message {
            body["systemInstruction"] = json!({ "parts": [{ "text": system }] });
        }
        body
    }

    fn parse_body(v: &Value) -> Result<ProviderResponse, ProviderError> {
        let parts = v
            .pointer("/candidates/0/content/parts")
            .and_then(Value::as_array)
            .ok_or_else(|| ProviderError::InvalidResponse("missing candidates[0].content.parts".into()))?;
        let text: String = parts
            .iter()
            .filter_map(|p| p.get("text").and_then(Value::as_str))
            .collect();
        let usage = v.get("usageMetadata").map(|u| {
            let count = |k: &str| u.get(k).and_then(Value::as_u64).unwrap_or(0);
            UsageStats {
                prompt_tokens: count("promptTokenCount"),
                completion_tokens: count("candidatesTokenCount"),
                total_tokens: count("totalTokenCount"),
            }
        });
        Ok(ProviderResponse {
            usage,
            raw_text: text,
        })
    }
}

#[async_trait]
impl ModelProvider for GeminiProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Google
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
            .api_key(ProviderKind::Google)
            .ok_or_else(|| ProviderError::AuthMissing { provider: "Google Gemini".into() })?;
        let base = credentials
            .base_url(ProviderKind::Google)
            .unwrap_or_else(|| DEFAULT_BASE.to_string());
        let url = format!("{}/models/{}:generateContent", base.trim_end_matches('/'), model);
        debug!(model, "gemini generate_content");

        let resp = self
            .http
            .post(url)
            .query(&[("key", key.as_str())])
            .json(&Self::build_body(request))
            .send()
            .await?;
        let text = read_body(resp).await?;
        let v: Value = serde_json::from_str(&text)
            .map_err(|e| ProviderError::InvalidResponse(format!("failed to parse Gemini response JSON: {e}")))?;
        Self::parse_body(&v)
    }
}
