//! Conductor → Client Messages
//!
//! Everything the engine sends to a client. Stream events carry the message
//! id and a per-message sequence number; clients use the sequence to detect
//! duplicates and gaps and to resume with `continue { after_sequence }`.
//! Sequences start at 1, so a cursor of 0 means "nothing received yet".
//!
//! # Wire Format
//!
//! JSON objects tagged by `type` in snake_case:
//!
//! ```json
//! {"type":"stream_start","message_id":"…","sequence":1,"content":""}
//! {"type":"token","message_id":"…","sequence":2,"text":"Hel","cumulative_content":"Hel"}
//! {"type":"token","message_id":"…","sequence":3,"text":"lo","cumulative_content":"Hello"}
//! {"type":"stream_complete","message_id":"…","sequence":4,"final_content":"Hello","finish_reason":"stop"}
//! ```

use serde::{Deserialize, Serialize};

use crate::model::{Conversation, ConversationId, Message, MessageId};
use crate::provider::{FinishReason, ProviderInfo};
use crate::streaming::AbortOutcome;

/// A message from the conductor to a client
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// A session (or a resumed session) began
    StreamStart {
        /// Message being generated
        message_id: MessageId,
        /// Sequence of this event
        sequence: u64,
        /// Content already present when the session began (non-empty on resume)
        content: String,
    },

    /// A chunk of generated text
    Token {
        /// Message being generated
        message_id: MessageId,
        /// Sequence of this event
        sequence: u64,
        /// The new text
        text: String,
        /// All content generated so far, including `text`
        cumulative_content: String,
    },

    /// Generation finished normally
    StreamComplete {
        /// Message that finished
        message_id: MessageId,
        /// Sequence of this event
        sequence: u64,
        /// Full message content
        final_content: String,
        /// Why the provider stopped
        finish_reason: FinishReason,
    },

    /// Generation failed
    StreamError {
        /// Message that failed
        message_id: MessageId,
        /// Sequence of this event
        sequence: u64,
        /// Stable error category
        kind: String,
        /// Human-readable detail
        message: String,
        /// Content generated before the failure
        partial_content: String,
    },

    /// Generation was cancelled
    StreamAborted {
        /// Message that was aborted
        message_id: MessageId,
        /// Sequence of this event
        sequence: u64,
        /// Content generated before cancellation
        partial_content: String,
    },

    /// This subscriber fell behind; events from `resync_from` are re-sent
    Lagged {
        /// Message whose stream lagged
        message_id: MessageId,
        /// Number of events that were dropped for this subscriber
        missed: u64,
        /// First sequence that will be re-delivered
        resync_from: u64,
    },

    /// Answer to a poll request
    PollResult {
        /// Message being polled
        message_id: MessageId,
        /// Events after the requested sequence, in order
        events: Vec<ServerMessage>,
        /// Sequence to pass as `after_sequence` next time
        next_sequence: u64,
        /// Whether a terminal event has been delivered
        finished: bool,
    },

    /// Answer to an abort request
    AbortResult {
        /// Message that was targeted
        message_id: MessageId,
        /// What happened
        outcome: AbortOutcome,
    },

    /// A conversation was created
    ConversationCreated {
        /// The new conversation
        conversation: Conversation,
    },

    /// A message was created (user message on submit, sibling on edit)
    MessageCreated {
        /// The new message
        message: Message,
    },

    /// A resolved branch, root first
    Branch {
        /// Conversation of the branch
        conversation_id: ConversationId,
        /// Leaf the branch was resolved from
        leaf_id: MessageId,
        /// Messages from root to leaf
        messages: Vec<Message>,
    },

    /// A message was soft-deleted
    MessageDeleted {
        /// The message after deletion
        message: Message,
    },

    /// Answer to `list_providers`
    Providers {
        /// Every supported provider
        providers: Vec<ProviderInfo>,
    },

    /// A request failed
    Error {
        /// Stable error code
        code: String,
        /// Human-readable detail
        message: String,
        /// Message the failed request was about, if any
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message_id: Option<MessageId>,
    },
}

impl ServerMessage {
    /// Message id this event belongs to, for stream events
    #[must_use]
    pub fn message_id(&self) -> Option<MessageId> {
        match self {
            Self::StreamStart { message_id, .. }
            | Self::Token { message_id, .. }
            | Self::StreamComplete { message_id, .. }
            | Self::StreamError { message_id, .. }
            | Self::StreamAborted { message_id, .. }
            | Self::Lagged { message_id, .. }
            | Self::PollResult { message_id, .. }
            | Self::AbortResult { message_id, .. } => Some(*message_id),
            Self::Error { message_id, .. } => *message_id,
            Self::MessageCreated { message } | Self::MessageDeleted { message } => Some(message.id),
            Self::ConversationCreated { .. } | Self::Branch { .. } | Self::Providers { .. } => None,
        }
    }

    /// Sequence number, for sequenced stream events
    #[must_use]
    pub fn sequence(&self) -> Option<u64> {
        match self {
            Self::StreamStart { sequence, .. }
            | Self::Token { sequence, .. }
            | Self::StreamComplete { sequence, .. }
            | Self::StreamError { sequence, .. }
            | Self::StreamAborted { sequence, .. } => Some(*sequence),
            _ => None,
        }
    }

    /// Whether this event ends a stream
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::StreamComplete { .. } | Self::StreamError { .. } | Self::StreamAborted { .. }
        )
    }

    /// Build an error reply from an engine error
    #[must_use]
    pub fn error(err: &crate::error::EngineError, message_id: Option<MessageId>) -> Self {
        Self::Error {
            code: err.code().to_string(),
            message: err.to_string(),
            message_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EngineError;

    #[test]
    fn test_token_wire_format() {
        let id = MessageId::new();
        let msg = ServerMessage::Token {
            message_id: id,
            sequence: 2,
            text: "lo".into(),
            cumulative_content: "Hello".into(),
        };
        let json: serde_json::Value = serde_json::to_value(&msg).unwrap();

        assert_eq!(json["type"], "token");
        assert_eq!(json["message_id"], id.to_string());
        assert_eq!(json["sequence"], 2);
        assert_eq!(json["cumulative_content"], "Hello");
    }

    #[test]
    fn test_complete_carries_finish_reason() {
        let msg = ServerMessage::StreamComplete {
            message_id: MessageId::new(),
            sequence: 5,
            final_content: "done".into(),
            finish_reason: FinishReason::Length,
        };
        let json: serde_json::Value = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "stream_complete");
        assert_eq!(json["finish_reason"], "length");
        assert!(msg.is_terminal());
        assert_eq!(msg.sequence(), Some(5));
    }

    #[test]
    fn test_error_omits_missing_message_id() {
        let msg = ServerMessage::error(&EngineError::UnknownProvider("x".into()), None);
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"code\":\"unknown_provider\""));
        assert!(!json.contains("message_id"));
    }

    #[test]
    fn test_lagged_is_not_sequenced() {
        let msg = ServerMessage::Lagged {
            message_id: MessageId::new(),
            missed: 4,
            resync_from: 7,
        };
        assert_eq!(msg.sequence(), None);
        assert!(!msg.is_terminal());
    }
}
