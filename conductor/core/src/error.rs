//! Engine Errors
//!
//! One error type for every fallible engine operation. Each variant maps to a
//! stable [`EngineError::code`] that clients receive in `error` events.

use std::time::Duration;

use thiserror::Error;

use crate::model::{ConversationId, MessageId, MessageStatus};
use crate::provider::{ProviderError, ProviderKind};
use crate::store::StoreError;

/// Errors returned by the conductor and its components
#[derive(Debug, Error)]
pub enum EngineError {
    /// A live session already exists for this message
    #[error("a stream is already active for message {0}")]
    AlreadyActive(MessageId),

    /// The parent does not exist or belongs to another conversation
    #[error("parent message {parent} does not exist in conversation {conversation}")]
    InvalidParent {
        /// The rejected parent
        parent: MessageId,
        /// The conversation the new message was meant for
        conversation: ConversationId,
    },

    /// The provider failed and retries were exhausted or not allowed
    #[error(transparent)]
    Provider(#[from] ProviderError),

    /// The provider produced nothing within the stall window
    #[error("provider produced no events for {0:?}")]
    Stalled(Duration),

    /// A subscriber fell behind and events were dropped for it
    #[error("subscriber lagged behind by {0} events")]
    Lagged(u64),

    /// A checkpoint did not advance the message's sequence
    #[error("checkpoint conflict for message {message_id}: sequence {attempted} is not after {last}")]
    Conflict {
        /// Message being checkpointed
        message_id: MessageId,
        /// Sequence that was rejected
        attempted: u64,
        /// Last committed sequence
        last: u64,
    },

    /// Unknown conversation
    #[error("conversation {0} not found")]
    ConversationNotFound(ConversationId),

    /// Unknown message
    #[error("message {0} not found")]
    MessageNotFound(MessageId),

    /// The caller does not own the conversation
    #[error("conversation {0} belongs to another user")]
    NotOwner(ConversationId),

    /// Continue was requested for a message that cannot be resumed
    #[error("message {id} cannot be continued from status {status}")]
    NotResumable {
        /// The message
        id: MessageId,
        /// Its current status
        status: MessageStatus,
    },

    /// Only user messages can be edited
    #[error("message {0} cannot be edited")]
    NotEditable(MessageId),

    /// The user has no credential for the requested provider
    #[error("no credential configured for provider {0}")]
    MissingCredential(ProviderKind),

    /// Provider name not recognised
    #[error("unknown provider '{0}'")]
    UnknownProvider(String),

    /// Persistence backend failure
    #[error("store error: {0}")]
    Store(String),

    /// The conductor is shutting down and accepts no new work
    #[error("conductor is shutting down")]
    ShuttingDown,
}

impl EngineError {
    /// Stable snake_case code for client-facing error events
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::AlreadyActive(_) => "already_active",
            Self::InvalidParent { .. } => "invalid_parent",
            Self::Provider(_) => "provider_error",
            Self::Stalled(_) => "stalled",
            Self::Lagged(_) => "lagged",
            Self::Conflict { .. } => "conflict",
            Self::ConversationNotFound(_) => "conversation_not_found",
            Self::MessageNotFound(_) => "message_not_found",
            Self::NotOwner(_) => "not_owner",
            Self::NotResumable { .. } => "not_resumable",
            Self::NotEditable(_) => "not_editable",
            Self::MissingCredential(_) => "missing_credential",
            Self::UnknownProvider(_) => "unknown_provider",
            Self::Store(_) => "store_error",
            Self::ShuttingDown => "shutting_down",
        }
    }
}

impl From<StoreError> for EngineError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Conflict {
                message_id,
                attempted,
                last,
            } => Self::Conflict {
                message_id,
                attempted,
                last,
            },
            StoreError::MessageNotFound(id) => Self::MessageNotFound(id),
            StoreError::ConversationNotFound(id) => Self::ConversationNotFound(id),
            StoreError::Backend(detail) => Self::Store(detail),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_conflict_maps_to_conflict() {
        let id = MessageId::new();
        let err: EngineError = StoreError::Conflict {
            message_id: id,
            attempted: 3,
            last: 5,
        }
        .into();

        assert_eq!(err.code(), "conflict");
        assert!(err.to_string().contains("sequence 3 is not after 5"));
    }

    #[test]
    fn test_provider_error_is_transparent() {
        let err: EngineError = ProviderError::network("reset").into();
        assert_eq!(err.code(), "provider_error");
        assert_eq!(err.to_string(), "network error: reset");
    }

    #[test]
    fn test_codes_are_snake_case() {
        let errors = [
            EngineError::AlreadyActive(MessageId::new()),
            EngineError::Stalled(Duration::from_secs(1)),
            EngineError::UnknownProvider("x".into()),
            EngineError::ShuttingDown,
        ];
        for err in errors {
            let code = err.code();
            assert!(code.chars().all(|c| c.is_ascii_lowercase() || c == '_'), "{code}");
        }
    }
}
