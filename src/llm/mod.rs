//! Model providers and the gateway that routes between them.

pub mod anthropic;
pub mod gateway;
pub mod gemini;
pub mod ollama;
pub mod openai;
pub mod prompts;
pub mod registry;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::credentials::CredentialStore;
use crate::error::ProviderError;

pub use anthropic::AnthropicProvider;
pub use gateway::{Gateway, GatewayConfig, ModelGateway};
pub use gemini::GeminiProvider;
pub use ollama::OllamaProvider;
pub use openai::OpenAiProvider;
pub use registry::{AgentMode, ModelDescriptor, ModelRegistry};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProviderKind {
    OpenAi,
    Anthropic,
    Google,
    Ollama,
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ProviderKind::OpenAi => "openai",
            ProviderKind::Anthropic => "anthropic",
            ProviderKind::Google => "google",
            ProviderKind::Ollama => "ollama",
        })
    }
}

/// Declared once per provider at registration time.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ProviderCapabilities {
    pub supports_vision: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderRequest {
    pub prompt: String,
    pub system_message: Option<String>,
    /// `data:<mime>;base64,<payload>` URL. Dropped for providers without vision.
    pub image_data: Option<String>,
    pub json_mode: bool,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageStats {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

impl UsageStats {
    pub fn new(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }

    /// Sum two optional usages; absent stays absent only if both are.
    pub fn merge(a: Option<Self>, b: Option<Self>) -> Option<Self> {
        match (a, b) {
            (Some(a), Some(b)) => Some(Self {
                prompt_tokens: a.prompt_tokens + b.prompt_tokens,
                completion_tokens: a.completion_tokens + b.completion_tokens,
                total_tokens: a.total_tokens + b.total_tokens,
            }),
            (a, b) => a.or(b),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderResponse {
    pub usage: Option<UsageStats>,
    pub raw_text: String,
}

/// One model backend. Implementations perform outbound I/O only.
#[async_trait]
pub trait ModelProvider: Send + Sync {
    fn kind(&self) -> ProviderKind;

    fn capabilities(&self) -> ProviderCapabilities;

    async fn complete(
        &self,
        model: &str,
        request: &ProviderRequest,
        credentials: &dyn CredentialStore,
    ) -> Result<ProviderResponse, ProviderError>;
}

/// Restore the `{` swallowed by assistant priming in JSON mode.
pub(crate) fn restore_json_prefix(text: &str, json_mode: bool) -> String {
    let trimmed = text.trim();
    if json_mode && !trimmed.starts_with('{') {
        format!("{{{trimmed}")
    } else {
        trimmed.to_string()
    }
}

/// Split a `data:<mime>;base64,<payload>` URL into mime type and payload.
pub(crate) fn split_data_url(data_url: &str) -> (String, String) {
    match data_url.split_once("base64,") {
        Some((head, payload)) => {
            let mime = head
                .trim_start_matches("data:")
                .trim_end_matches(';')
                .to_string();
            let mime = if mime.is_empty() { "image/webp".to_string() } else { mime };
            (mime, payload.to_string())
        }
        None => ("image/webp".to_string(), data_url.to_string()),
    }
}

/// Read a response body, turning non-2xx statuses into [`ProviderError`].
pub(crate) async fn read_body(resp: reqwest::Response) -> Result<String, ProviderError> {
    let status = resp.status();
    let retry_after = resp
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_retry_after);
    let text = resp.text().await?;
    if !status.is_success() {
        let message = serde_json::from_str::<serde_json::Value>(&text)
            .ok()
            .and_then(|v| {
                v.pointer("/error/message")
                    .or_else(|| v.get("error"))
                    .and_then(|m| m.as_str().map(String::from))
            })
            .unwrap_or(text);
        return Err(ProviderError::from_status(status.as_u16(), message, retry_after));
    }
    Ok(text)
}

/// Delay-seconds form of `Retry-After`; HTTP dates are ignored.
fn parse_retry_after(value: &str) -> Option<Duration> {
    value.trim().parse::<u64>().ok().map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_prefix_is_restored_once() {
        assert_eq!(restore_json_prefix("\"thought\": 1}", true), "{\"thought\": 1}");
        assert_eq!(restore_json_prefix("  {\"a\":1} ", true), "{\"a\":1}");
        assert_eq!(restore_json_prefix("plain", false), "plain");
    }

    #[test]
    fn data_url_is_split() {
        assert_eq!(
            split_data_url("data:image/png;base64,AAAA"),
            ("image/png".to_string(), "AAAA".to_string())
        );
        assert_eq!(split_data_url("AAAA"), ("image/webp".to_string(), "AAAA".to_string()));
    }

    #[test]
    fn retry_after_seconds() {
        assert_eq!(parse_retry_after(" 7 "), Some(Duration::from_secs(7)));
        assert_eq!(parse_retry_after("Wed, 21 Oct 2015 07:28:00 GMT"), None);
    }

    #[test]
    fn usage_merge() {
        let a = Some(UsageStats::new(10, 5));
        let b = Some(UsageStats::new(1, 2));
        assert_eq!(UsageStats::merge(a, b), Some(UsageStats::new(11, 7)));
        assert_eq!(UsageStats::merge(None, b), b);
        assert_eq!(UsageStats::merge(None, None), None);
    }
}
