//! Model catalog and routing.
//!
//! Routing is a pure function of the model identifier, memoised for the
//! lifetime of the registry so an identifier never moves between providers.
//! Locally hosted models can be appended at run time; the set never shrinks.

use std::collections::HashMap;

use parking_lot::RwLock;
use tracing::{debug, warn};

use super::ProviderKind;
use crate::credentials::CredentialStore;
use crate::error::ProviderError;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum AgentMode {
    #[default]
    Text,
    VisionEnhanced,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ModelDescriptor {
    pub id: String,
    pub display_name: String,
    pub provider: ProviderKind,
    pub vision: bool,
}

impl ModelDescriptor {
    fn new(id: &str, display_name: &str, provider: ProviderKind, vision: bool) -> Self {
        Self {
            id: id.to_string(),
            display_name: display_name.to_string(),
            provider,
            vision,
        }
    }
}

pub const DEFAULT_MODEL: &str = "gpt-4-turbo";
const DEFAULT_LOCAL_MODEL: &str = "mistral";
const DEFAULT_ANTHROPIC_MODEL: &str = "claude-3-5-sonnet-20240620";
const DEFAULT_GOOGLE_MODEL: &str = "gemini-1.5-pro";

fn builtin_catalog() -> Vec<ModelDescriptor> {
    use ProviderKind::*;
    vec![
        ModelDescriptor::new("o1-preview", "O1 Preview", OpenAi, false),
        ModelDescriptor::new("o1-mini", "O1 Mini", OpenAi, false),
        ModelDescriptor::new("gpt-3.5-turbo-16k", "GPT-3.5 Turbo (16k)", OpenAi, false),
        ModelDescriptor::new("gpt-4", "GPT-4", OpenAi, false),
        ModelDescriptor::new("gpt-4-turbo-preview", "GPT-4 Turbo (Preview)", OpenAi, false),
        ModelDescriptor::new("gpt-4-vision-preview", "GPT-4 Vision (Preview)", OpenAi, true),
        ModelDescriptor::new("gpt-4-turbo", "GPT-4 Turbo", OpenAi, true),
        ModelDescriptor::new("gpt-4o", "GPT-4o", OpenAi, true),
        ModelDescriptor::new("gpt-4o-mini", "GPT-4o Mini", OpenAi, true),
        ModelDescriptor::new("claude-3-sonnet-20240229", "Claude 3 Sonnet", Anthropic, true),
        ModelDescriptor::new("claude-3-opus-20240229", "Claude 3 Opus", Anthropic, true),
        ModelDescriptor::new("claude-3-5-sonnet-20240620", "Claude 3.5 Sonnet", Anthropic, true),
        ModelDescriptor::new("gemini-1.5-pro", "Gemini 1.5 Pro", Google, true),
        ModelDescriptor::new("codellama", "CodeLlama (Local)", Ollama, false),
        ModelDescriptor::new("mistral", "Mistral 7b (Local)", Ollama, false),
        ModelDescriptor::new("llama3.2", "Llama 3.2 3b (Local)", Ollama, false),
        ModelDescriptor::new("qwq", "qwq 32b (Local)", Ollama, false),
        ModelDescriptor::new(
            "hf.co/bartowski/Ministral-8B-Instruct-2410-GGUF",
            "Hugging Face Ministral 8B Instruct 2410 GGUF (Local)",
            Ollama,
            false,
        ),
        ModelDescriptor::new("gemma2", "Gemma 2 (Local)", Ollama, false),
    ]
}

pub struct ModelRegistry {
    catalog: Vec<ModelDescriptor>,
    local: RwLock<Vec<ModelDescriptor>>,
    routes: RwLock<HashMap<String, ProviderKind>>,
}

impl Default for ModelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self {
            catalog: builtin_catalog(),
            local: RwLock::new(Vec::new()),
            routes: RwLock::new(HashMap::new()),
        }
    }

    /// Append a locally available model. Returns `false` when the id is
    /// already known or was already routed to a different provider.
    pub fn register_local_model(&self, id: &str, display_name: Option<&str>) -> bool {
        // Lock order is routes, then local; `route` never holds both.
        let mut routes = self.routes.write();
        let mut local = self.local.write();
        if let Some(kind) = routes.get(id) {
            if *kind != ProviderKind::Ollama {
                warn!(model = id, provider = %kind, "refusing to re-route model to local provider");
                return false;
            }
        }
        if self.catalog.iter().any(|m| m.id == id) || local.iter().any(|m| m.id == id) {
            return false;
        }
        debug!(model = id, "registered local model");
        local.push(ModelDescriptor::new(
            id,
            display_name.unwrap_or(id),
            ProviderKind::Ollama,
            false,
        ));
        routes.insert(id.to_string(), ProviderKind::Ollama);
        true
    }

    pub fn describe(&self, id: &str) -> Option<ModelDescriptor> {
        self.catalog
            .iter()
            .find(|m| m.id == id)
            .cloned()
            .or_else(|| self.local.read().iter().find(|m| m.id == id).cloned())
    }

    /// Every known model, built-in first, then local registrations in order.
    pub fn models(&self) -> Vec<ModelDescriptor> {
        let mut all = self.catalog.clone();
        all.extend(self.local.read().iter().cloned());
        all
    }

    pub fn local_models(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .catalog
            .iter()
            .filter(|m| m.provider == ProviderKind::Ollama)
            .map(|m| m.id.clone())
            .collect();
        ids.extend(self.local.read().iter().map(|m| m.id.clone()));
        ids
    }

    /// Pick the backend for a model identifier.
    pub fn route(&self, model: &str) -> Result<ProviderKind, ProviderError> {
        if let Some(kind) = self.routes.read().get(model) {
            return Ok(*kind);
        }
        let kind = self.classify(model).ok_or_else(|| ProviderError::Unsupported(model.to_string()))?;
        let mut routes = self.routes.write();
        Ok(*routes.entry(model.to_string()).or_insert(kind))
    }

    fn classify(&self, model: &str) -> Option<ProviderKind> {
        if let Some(m) = self.describe(model) {
            return Some(m.provider);
        }
        if model.starts_with("claude") {
            Some(ProviderKind::Anthropic)
        } else if model.starts_with("gemini") {
            Some(ProviderKind::Google)
        } else if ["gpt-", "o1", "o3", "chatgpt"].iter().any(|p| model.starts_with(p)) {
            Some(ProviderKind::OpenAi)
        } else {
            None
        }
    }

    pub fn supports_vision(&self, model: &str) -> bool {
        self.describe(model).map(|m| m.vision).unwrap_or(false)
    }

    pub fn is_local(&self, model: &str) -> bool {
        matches!(self.route(model), Ok(ProviderKind::Ollama))
    }

    pub fn is_valid_selection(&self, model: &str, mode: AgentMode, credentials: &dyn CredentialStore) -> bool {
        if self.describe(model).is_none() {
            return false;
        }
        let provider = match self.route(model) {
            Ok(p) => p,
            Err(_) => return false,
        };
        if self.is_local(model) {
            return true;
        }
        if mode == AgentMode::VisionEnhanced && !self.supports_vision(model) {
            return false;
        }
        credentials.api_key(provider).is_some()
    }

    /// Keep `selected` when usable, otherwise fall back by available keys.
    pub fn best_matching_model(&self, selected: &str, mode: AgentMode, credentials: &dyn CredentialStore) -> String {
        if self.is_valid_selection(selected, mode, credentials) {
            return selected.to_string();
        }
        let has = |p| credentials.api_key(p).is_some();
        let fallback = if has(ProviderKind::OpenAi) {
            DEFAULT_MODEL
        } else if has(ProviderKind::Anthropic) {
            DEFAULT_ANTHROPIC_MODEL
        } else if has(ProviderKind::Google) {
            DEFAULT_GOOGLE_MODEL
        } else {
            DEFAULT_LOCAL_MODEL
        };
        debug!(selected, fallback, "falling back to best matching model");
        fallback.to_string()
    }
}
