//! Provider Adapters
//!
//! One adapter per upstream LLM API, all speaking the normalized event
//! contract in [`traits`]. The adapter for a session is chosen by
//! [`ProviderKind`] through a [`ProviderFactory`].

mod anthropic;
mod mistral;
mod openai;
pub mod scripted;
mod sse;
pub mod traits;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::credentials::ProviderCredential;
use crate::error::EngineError;

pub use anthropic::AnthropicAdapter;
pub use mistral::MistralAdapter;
pub use openai::OpenAiAdapter;
pub use scripted::{ScriptGate, ScriptStep, ScriptedAdapter, ScriptedFactory};
pub use traits::{
    ChatTurn, FinishReason, GenerationRequest, NormalizedEvent, ProviderAdapter, ProviderError,
    ProviderErrorKind, ProviderFactory,
};

/// Capacity of the channel between an adapter's pump task and its session
pub(crate) const ADAPTER_CHANNEL_CAPACITY: usize = 64;

// ============================================================================
// Provider Selection
// ============================================================================

/// Supported upstream providers
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// OpenAI chat completions
    OpenAi,
    /// Anthropic messages
    Anthropic,
    /// Mistral chat completions
    Mistral,
}

impl ProviderKind {
    /// Every supported provider
    pub const ALL: [ProviderKind; 3] = [Self::OpenAi, Self::Anthropic, Self::Mistral];

    /// Wire name
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::OpenAi => "openai",
            Self::Anthropic => "anthropic",
            Self::Mistral => "mistral",
        }
    }

    /// Short description for provider listings
    #[must_use]
    pub fn description(self) -> &'static str {
        match self {
            Self::OpenAi => "OpenAI GPT models",
            Self::Anthropic => "Anthropic Claude models",
            Self::Mistral => "Mistral AI models",
        }
    }

    /// Models known to work with this provider
    #[must_use]
    pub fn models(self) -> &'static [&'static str] {
        match self {
            Self::OpenAi => &[
                "gpt-4-turbo-preview",
                "gpt-4",
                "gpt-3.5-turbo",
                "gpt-3.5-turbo-16k",
            ],
            Self::Anthropic => &[
                "claude-3-opus-20240229",
                "claude-3-sonnet-20240229",
                "claude-3-haiku-20240307",
                "claude-2.1",
                "claude-2.0",
            ],
            Self::Mistral => &[
                "mistral-large-latest",
                "mistral-medium-latest",
                "mistral-small-latest",
                "open-mixtral-8x7b",
                "open-mistral-7b",
            ],
        }
    }

    /// Environment variable holding the server-wide key
    #[must_use]
    pub fn api_key_env(self) -> &'static str {
        match self {
            Self::OpenAi => "OPENAI_API_KEY",
            Self::Anthropic => "ANTHROPIC_API_KEY",
            Self::Mistral => "MISTRAL_API_KEY",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "openai" => Ok(Self::OpenAi),
            "anthropic" => Ok(Self::Anthropic),
            "mistral" => Ok(Self::Mistral),
            _ => Err(EngineError::UnknownProvider(s.to_string())),
        }
    }
}

// ============================================================================
// Listings
// ============================================================================

/// A model offered by a provider
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelInfo {
    /// Model identifier to pass on submit
    pub name: String,
    /// Advertised context window, in tokens
    pub max_tokens: u32,
}

impl ModelInfo {
    fn new(name: &str) -> Self {
        let max_tokens = if name.contains("gpt-4") {
            8_192
        } else if name.contains("gpt-3.5-turbo-16k") {
            16_384
        } else if name.contains("claude-3") {
            200_000
        } else if name.contains("claude-2") {
            100_000
        } else if name.contains("mistral") || name.contains("mixtral") {
            32_768
        } else {
            4_096
        };
        Self {
            name: name.to_string(),
            max_tokens,
        }
    }
}

/// One provider as shown to clients choosing a model
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderInfo {
    /// Provider wire name
    pub name: ProviderKind,
    /// Short description
    pub description: String,
    /// Known models
    pub models: Vec<ModelInfo>,
    /// Whether the requesting user has a credential for this provider
    pub configured: bool,
}

impl ProviderInfo {
    /// Listing entry for `kind`
    #[must_use]
    pub fn new(kind: ProviderKind, configured: bool) -> Self {
        Self {
            name: kind,
            description: kind.description().to_string(),
            models: kind.models().iter().map(|m| ModelInfo::new(m)).collect(),
            configured,
        }
    }
}

// ============================================================================
// HTTP Factory
// ============================================================================

/// Base URLs and timeouts for the HTTP adapters
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProviderEndpoints {
    /// OpenAI API base (without `/chat/completions`)
    pub openai_base_url: String,
    /// Anthropic API base (without `/messages`)
    pub anthropic_base_url: String,
    /// Mistral API base (without `/chat/completions`)
    pub mistral_base_url: String,
    /// Upper bound on one streaming request
    pub request_timeout: Duration,
}

impl Default for ProviderEndpoints {
    fn default() -> Self {
        Self {
            openai_base_url: "https://api.openai.com/v1".to_string(),
            anthropic_base_url: "https://api.anthropic.com/v1".to_string(),
            mistral_base_url: "https://api.mistral.ai/v1".to_string(),
            request_timeout: Duration::from_secs(300),
        }
    }
}

/// Builds HTTP adapters that share one connection pool
#[derive(Clone)]
pub struct HttpProviderFactory {
    client: reqwest::Client,
    endpoints: ProviderEndpoints,
}

impl HttpProviderFactory {
    /// Create a factory with the given endpoints
    #[must_use]
    pub fn new(endpoints: ProviderEndpoints) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!(error = %e, "Falling back to default HTTP client");
                reqwest::Client::new()
            });
        Self { client, endpoints }
    }

    /// Endpoints in use
    #[must_use]
    pub fn endpoints(&self) -> &ProviderEndpoints {
        &self.endpoints
    }
}

impl Default for HttpProviderFactory {
    fn default() -> Self {
        Self::new(ProviderEndpoints::default())
    }
}

impl ProviderFactory for HttpProviderFactory {
    fn adapter(
        &self,
        kind: ProviderKind,
        credential: ProviderCredential,
    ) -> Arc<dyn ProviderAdapter> {
        let timeout = self.endpoints.request_timeout;
        match kind {
            ProviderKind::OpenAi => Arc::new(OpenAiAdapter::new(
                self.client.clone(),
                &self.endpoints.openai_base_url,
                credential,
                timeout,
            )),
            ProviderKind::Anthropic => Arc::new(AnthropicAdapter::new(
                self.client.clone(),
                &self.endpoints.anthropic_base_url,
                credential,
                timeout,
            )),
            ProviderKind::Mistral => Arc::new(MistralAdapter::new(
                self.client.clone(),
                &self.endpoints.mistral_base_url,
                credential,
                timeout,
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_kind_parsing() {
        assert_eq!("openai".parse::<ProviderKind>().unwrap(), ProviderKind::OpenAi);
        assert_eq!(" Anthropic ".parse::<ProviderKind>().unwrap(), ProviderKind::Anthropic);
        assert_eq!("MISTRAL".parse::<ProviderKind>().unwrap(), ProviderKind::Mistral);
        assert!(matches!(
            "ollama".parse::<ProviderKind>(),
            Err(EngineError::UnknownProvider(name)) if name == "ollama"
        ));
    }

    #[test]
    fn test_provider_kind_serialization() {
        let json = serde_json::to_string(&ProviderKind::OpenAi).unwrap();
        assert_eq!(json, "\"openai\"");
        let parsed: ProviderKind = serde_json::from_str("\"mistral\"").unwrap();
        assert_eq!(parsed, ProviderKind::Mistral);
    }

    #[test]
    fn test_every_provider_lists_models() {
        for kind in ProviderKind::ALL {
            assert!(!kind.models().is_empty(), "{kind} has no models");
        }
        assert!(ProviderKind::OpenAi.models().contains(&"gpt-3.5-turbo"));
    }

    #[test]
    fn test_provider_info_lists_models_with_context_windows() {
        let info = ProviderInfo::new(ProviderKind::Anthropic, false);
        assert_eq!(info.description, "Anthropic Claude models");
        assert!(!info.configured);
        assert_eq!(info.models.len(), ProviderKind::Anthropic.models().len());
        assert_eq!(info.models[0].name, "claude-3-opus-20240229");
        assert_eq!(info.models[0].max_tokens, 200_000);

        let openai = ProviderInfo::new(ProviderKind::OpenAi, true);
        let turbo = openai.models.iter().find(|m| m.name == "gpt-3.5-turbo").unwrap();
        assert_eq!(turbo.max_tokens, 4_096);

        let json = serde_json::to_value(&openai).unwrap();
        assert_eq!(json["name"], "openai");
        assert_eq!(json["configured"], true);
    }

    #[test]
    fn test_factory_selects_adapter_by_kind() {
        let factory = HttpProviderFactory::default();
        for kind in ProviderKind::ALL {
            let adapter = factory.adapter(kind, ProviderCredential::new("k"));
            assert_eq!(adapter.kind(), kind);
        }
    }
}
