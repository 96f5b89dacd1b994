//! Provider Credentials
//!
//! Credentials are supplied per user at session start by an external
//! collaborator (the store that keeps them encrypted at rest). The engine
//! only ever holds them in memory: [`ProviderCredential`] redacts itself in
//! `Debug`, has no `Display`, and is never serialized.

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::provider::ProviderKind;

/// A decrypted API key
#[derive(Clone, PartialEq, Eq)]
pub struct ProviderCredential {
    secret: String,
}

impl ProviderCredential {
    /// Wrap a secret
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    /// Expose the secret for building request headers
    #[must_use]
    pub fn expose(&self) -> &str {
        &self.secret
    }
}

impl fmt::Debug for ProviderCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ProviderCredential(<redacted>)")
    }
}

/// Source of per-user provider credentials
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// Look up the credential `owner` has configured for `provider`
    async fn credential(&self, owner: &str, provider: ProviderKind)
        -> Option<ProviderCredential>;
}

/// Server-wide keys read from the environment
///
/// - `OPENAI_API_KEY`
/// - `ANTHROPIC_API_KEY`
/// - `MISTRAL_API_KEY`
///
/// The same key is handed to every user.
#[derive(Clone, Default)]
pub struct EnvCredentials {
    keys: HashMap<ProviderKind, ProviderCredential>,
}

impl EnvCredentials {
    /// Read keys from the environment
    #[must_use]
    pub fn from_env() -> Self {
        let mut keys = HashMap::new();
        for kind in ProviderKind::ALL {
            if let Ok(value) = std::env::var(kind.api_key_env()) {
                if !value.trim().is_empty() {
                    keys.insert(kind, ProviderCredential::new(value.trim()));
                }
            }
        }
        tracing::debug!(configured = keys.len(), "Loaded provider keys from environment");
        Self { keys }
    }

    /// Providers with a configured key
    #[must_use]
    pub fn configured(&self) -> Vec<ProviderKind> {
        let mut kinds: Vec<_> = self.keys.keys().copied().collect();
        kinds.sort_by_key(|k| k.as_str());
        kinds
    }
}

#[async_trait]
impl CredentialProvider for EnvCredentials {
    async fn credential(&self, _owner: &str, provider: ProviderKind) -> Option<ProviderCredential> {
        self.keys.get(&provider).cloned()
    }
}

/// Per-user credentials held in memory
#[derive(Default)]
pub struct StaticCredentials {
    keys: RwLock<HashMap<(String, ProviderKind), ProviderCredential>>,
}

impl StaticCredentials {
    /// Create an empty credential table
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a credential, builder style
    #[must_use]
    pub fn with(self, owner: impl Into<String>, provider: ProviderKind, secret: impl Into<String>) -> Self {
        self.set(owner, provider, secret);
        self
    }

    /// Add or replace a credential
    pub fn set(&self, owner: impl Into<String>, provider: ProviderKind, secret: impl Into<String>) {
        self.keys
            .write()
            .insert((owner.into(), provider), ProviderCredential::new(secret));
    }

    /// Remove a credential
    pub fn remove(&self, owner: &str, provider: ProviderKind) {
        self.keys.write().remove(&(owner.to_string(), provider));
    }
}

#[async_trait]
impl CredentialProvider for StaticCredentials {
    async fn credential(&self, owner: &str, provider: ProviderKind) -> Option<ProviderCredential> {
        self.keys.read().get(&(owner.to_string(), provider)).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debug_is_redacted() {
        let cred = ProviderCredential::new("sk-very-secret");
        let rendered = format!("{cred:?}");
        assert!(!rendered.contains("sk-very-secret"));
        assert!(rendered.contains("redacted"));
    }

    #[tokio::test]
    async fn test_static_credentials_are_per_user() {
        let creds = StaticCredentials::new().with("alice", ProviderKind::OpenAi, "sk-a");

        let found = creds.credential("alice", ProviderKind::OpenAi).await;
        assert_eq!(found.map(|c| c.expose().to_string()), Some("sk-a".to_string()));

        assert!(creds.credential("bob", ProviderKind::OpenAi).await.is_none());
        assert!(creds.credential("alice", ProviderKind::Anthropic).await.is_none());

        creds.remove("alice", ProviderKind::OpenAi);
        assert!(creds.credential("alice", ProviderKind::OpenAi).await.is_none());
    }

    #[tokio::test]
    async fn test_env_credentials_default_is_empty() {
        let creds = EnvCredentials::default();
        assert!(creds.configured().is_empty());
        assert!(creds.credential("anyone", ProviderKind::Mistral).await.is_none());
    }
}
