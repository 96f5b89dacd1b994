//! Provider Adapter Traits
//!
//! Every upstream LLM API is reduced to one normalized event contract so the
//! stream session never sees a provider-specific wire format.
//!
//! # Design Philosophy
//!
//! An adapter is opened once per generation attempt and hands back the
//! receiving half of a bounded channel. The adapter's pump task owns the
//! upstream connection:
//!
//! - It emits zero or more [`NormalizedEvent::Token`]s followed by exactly one
//!   terminal event ([`NormalizedEvent::Done`] or [`NormalizedEvent::Error`]).
//! - Dropping the receiver is the cancellation signal. The pump notices via
//!   `Sender::closed()`, stops reading, and drops the HTTP response, which
//!   releases the connection.
//! - Failures are never swallowed: a stream that ends without a terminal
//!   marker is reported as [`ProviderErrorKind::Disconnected`].

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::credentials::ProviderCredential;
use crate::model::Role;
use crate::provider::ProviderKind;

// ============================================================================
// Normalized Events
// ============================================================================

/// Why a provider stopped generating
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    /// Natural end of output
    Stop,
    /// Output hit the token limit
    Length,
    /// Output withheld by a content filter
    ContentFilter,
    /// Any other provider-specific reason
    Other,
}

impl FinishReason {
    /// Map a provider's finish/stop reason string
    #[must_use]
    pub fn from_provider(reason: &str) -> Self {
        match reason {
            "stop" | "end_turn" | "stop_sequence" => Self::Stop,
            "length" | "max_tokens" | "model_length" => Self::Length,
            "content_filter" | "refusal" => Self::ContentFilter,
            _ => Self::Other,
        }
    }
}

/// Category of a provider failure
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderErrorKind {
    /// Credential rejected
    Auth,
    /// Too many requests
    RateLimited,
    /// Provider temporarily overloaded
    Overloaded,
    /// Request rejected as malformed
    InvalidRequest,
    /// Provider-side failure
    Upstream,
    /// Transport failure talking to the provider
    Network,
    /// Provider sent something we could not interpret
    Protocol,
    /// Stream ended without a terminal marker
    Disconnected,
}

impl fmt::Display for ProviderErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Auth => "auth",
            Self::RateLimited => "rate_limited",
            Self::Overloaded => "overloaded",
            Self::InvalidRequest => "invalid_request",
            Self::Upstream => "upstream",
            Self::Network => "network",
            Self::Protocol => "protocol",
            Self::Disconnected => "disconnected",
        };
        f.write_str(name)
    }
}

/// A failure reported by a provider adapter
#[derive(Clone, Debug, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{kind} error: {message}")]
pub struct ProviderError {
    /// Failure category
    pub kind: ProviderErrorKind,
    /// Human-readable detail
    pub message: String,
    /// Whether reopening the stream may succeed
    pub retryable: bool,
}

impl ProviderError {
    /// Create a provider error
    pub fn new(kind: ProviderErrorKind, message: impl Into<String>, retryable: bool) -> Self {
        Self {
            kind,
            message: message.into(),
            retryable,
        }
    }

    /// Classify a non-success HTTP response
    #[must_use]
    pub fn from_status(status: u16, body: &str) -> Self {
        let (kind, retryable) = match status {
            401 | 403 => (ProviderErrorKind::Auth, false),
            429 => (ProviderErrorKind::RateLimited, true),
            529 => (ProviderErrorKind::Overloaded, true),
            408 | 500..=599 => (ProviderErrorKind::Upstream, true),
            _ => (ProviderErrorKind::InvalidRequest, false),
        };
        let detail = body.trim();
        let message = if detail.is_empty() {
            format!("HTTP {status}")
        } else {
            format!("HTTP {status}: {detail}")
        };
        Self::new(kind, message, retryable)
    }

    /// Transport failure (retryable)
    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::Network, message, true)
    }

    /// Uninterpretable payload (not retryable)
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::Protocol, message, false)
    }

    /// Stream ended without a terminal marker (retryable)
    #[must_use]
    pub fn disconnected() -> Self {
        Self::new(
            ProviderErrorKind::Disconnected,
            "stream ended without a completion marker",
            true,
        )
    }
}

/// One event of a normalized provider stream
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NormalizedEvent {
    /// A chunk of generated text
    Token(String),
    /// Generation finished
    Done(FinishReason),
    /// Generation failed
    Error(ProviderError),
}

impl NormalizedEvent {
    /// Whether this event ends the stream
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Token(_))
    }
}

// ============================================================================
// Requests
// ============================================================================

/// One turn of conversation context sent to a provider
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatTurn {
    /// Author of the turn
    pub role: Role,
    /// Text of the turn
    pub content: String,
}

impl ChatTurn {
    /// Create a chat turn
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// Everything an adapter needs to open one generation
#[derive(Clone, Debug, PartialEq)]
pub struct GenerationRequest {
    /// Provider model identifier
    pub model: String,
    /// Conversation context, oldest first
    pub turns: Vec<ChatTurn>,
    /// Maximum tokens to generate
    pub max_tokens: u32,
    /// Sampling temperature
    pub temperature: f32,
    /// Previously generated text to continue from
    pub continuation: Option<String>,
}

impl GenerationRequest {
    /// Create a request with default generation parameters
    pub fn new(model: impl Into<String>, turns: Vec<ChatTurn>) -> Self {
        Self {
            model: model.into(),
            turns,
            max_tokens: 4096,
            temperature: 0.7,
            continuation: None,
        }
    }

    /// Set max tokens
    #[must_use]
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    /// Set temperature
    #[must_use]
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature.clamp(0.0, 2.0);
        self
    }

    /// Continue from already generated text (ignored when empty)
    #[must_use]
    pub fn with_continuation(mut self, seed: impl Into<String>) -> Self {
        let seed = seed.into();
        self.continuation = if seed.is_empty() { None } else { Some(seed) };
        self
    }
}

// ============================================================================
// Adapter Traits
// ============================================================================

/// A streaming connection to one LLM provider
///
/// Implement this trait to add support for another provider.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Which provider this adapter talks to
    fn kind(&self) -> ProviderKind;

    /// Open a generation and return its normalized event stream
    ///
    /// The returned stream is finite and not restartable. Drop the receiver
    /// to cancel.
    ///
    /// # Errors
    ///
    /// Returns a [`ProviderError`] if the stream could not be opened at all
    /// (transport failure, non-success HTTP status).
    async fn open(
        &self,
        request: GenerationRequest,
    ) -> Result<mpsc::Receiver<NormalizedEvent>, ProviderError>;
}

/// Builds adapters at session start
pub trait ProviderFactory: Send + Sync {
    /// Create an adapter for `kind` authenticated with `credential`
    fn adapter(
        &self,
        kind: ProviderKind,
        credential: ProviderCredential,
    ) -> Arc<dyn ProviderAdapter>;
}
