use std::collections::HashMap;
use std::env;

use crate::llm::ProviderKind;

/// Read-only access to per-provider API keys and base URLs.
pub trait CredentialStore: Send + Sync {
    fn api_key(&self, provider: ProviderKind) -> Option<String>;
    fn base_url(&self, provider: ProviderKind) -> Option<String>;
}

/// Reads credentials from the process environment on every lookup.
#[derive(Clone, Copy, Debug, Default)]
pub struct EnvCredentials;

impl EnvCredentials {
    fn var(name: &str) -> Option<String> {
        env::var(name).ok().filter(|v| !v.trim().is_empty())
    }
}

impl CredentialStore for EnvCredentials {
    fn api_key(&self, provider: ProviderKind) -> Option<String> {
        match provider {
            ProviderKind::OpenAi => Self::var("OPENAI_API_KEY"),
            ProviderKind::Anthropic => Self::var("ANTHROPIC_API_KEY"),
            ProviderKind::Google => Self::var("GEMINI_API_KEY"),
            ProviderKind::Ollama => None,
        }
    }

    fn base_url(&self, provider: ProviderKind) -> Option<String> {
        match provider {
            ProviderKind::OpenAi => Self::var("OPENAI_BASE_URL"),
            ProviderKind::Anthropic => Self::var("ANTHROPIC_BASE_URL"),
            ProviderKind::Google => Self::var("GEMINI_BASE_URL"),
            ProviderKind::Ollama => Self::var("OLLAMA_HOST"),
        }
    }
}

/// In-memory credentials, mostly for tests and embedding.
#[derive(Clone, Debug, Default)]
pub struct StaticCredentials {
    keys: HashMap<ProviderKind, String>,
    base_urls: HashMap<ProviderKind, String>,
}

impl StaticCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_key(mut self, provider: ProviderKind, key: impl Into<String>) -> Self {
        self.keys.insert(provider, key.into());
        self
    }

    pub fn with_base_url(mut self, provider: ProviderKind, url: impl Into<String>) -> Self {
        self.base_urls.insert(provider, url.into());
        self
    }
}

impl CredentialStore for StaticCredentials {
    fn api_key(&self, provider: ProviderKind) -> Option<String> {
        self.keys.get(&provider).filter(|k| !k.is_empty()).cloned()
    }

    fn base_url(&self, provider: ProviderKind) -> Option<String> {
        self.base_urls.get(&provider).filter(|u| !u.is_empty()).cloned()
    }
}
