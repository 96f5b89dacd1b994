//! Conversation Data Model
//!
//! Identifiers, messages, conversations, and checkpoints shared by every
//! component of the engine.
//!
//! # Ownership
//!
//! A [`Message`] row is owned by the conversation tree. User messages are
//! written once, complete. Assistant messages are created `pending` and from
//! then on mutated only through checkpoints appended by the stream session
//! that generates them. While that session is live, its in-memory buffer is
//! the authority and the row is just the latest checkpoint.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::provider::ProviderKind;

// ============================================================================
// Identifiers
// ============================================================================

/// Unique identifier for a message
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub Uuid);

impl MessageId {
    /// Generate a new random message ID
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for MessageId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Unique identifier for a conversation
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationId(pub Uuid);

impl ConversationId {
    /// Generate a new random conversation ID
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConversationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ConversationId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

// ============================================================================
// Roles and Status
// ============================================================================

/// Author of a message
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Message typed by the user
    User,
    /// Message generated by a provider
    Assistant,
    /// Instructions injected ahead of the conversation
    System,
}

impl Role {
    /// Wire name used by chat-completion style APIs
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::System => "system",
        }
    }
}

/// Lifecycle status of a message
///
/// ```text
/// pending ──token──▶ streaming ──done──▶ complete
///    │                   │
///    └──abort / error────┴──────▶ aborted | error
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    /// Created, no output yet
    Pending,
    /// At least one token received
    Streaming,
    /// Provider finished normally
    Complete,
    /// Cancelled by a client or by shutdown
    Aborted,
    /// Provider or internal failure
    Error,
}

impl MessageStatus {
    /// Whether no further transition is possible from this status
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Aborted | Self::Error)
    }

    /// Whether generation may be resumed from the last checkpoint
    ///
    /// `pending` is included so that a message whose session died before
    /// its first token is not stranded.
    #[must_use]
    pub fn is_resumable(self) -> bool {
        matches!(self, Self::Pending | Self::Streaming | Self::Error)
    }
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pending => "pending",
            Self::Streaming => "streaming",
            Self::Complete => "complete",
            Self::Aborted => "aborted",
            Self::Error => "error",
        };
        f.write_str(name)
    }
}

// ============================================================================
// Messages
// ============================================================================

/// A fragment of message content
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentFragment {
    /// Plain text
    Text {
        /// The text
        text: String,
    },
}

impl ContentFragment {
    /// Create a text fragment
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }
}

/// Content shown in place of a soft-deleted message
pub const DELETED_MARKER: &str = "[Message deleted]";

/// A node in a conversation tree
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Message identifier
    pub id: MessageId,
    /// Conversation this message belongs to
    pub conversation_id: ConversationId,
    /// Parent message (`None` only for a conversation root)
    pub parent_id: Option<MessageId>,
    /// Author
    pub role: Role,
    /// Ordered content fragments
    pub content: Vec<ContentFragment>,
    /// Lifecycle status
    pub status: MessageStatus,
    /// Provider that generated this message (assistant messages)
    pub provider: Option<ProviderKind>,
    /// Model that generated this message (assistant messages)
    pub model: Option<String>,
    /// Soft-deleted: kept in the tree, left out of provider context
    #[serde(default)]
    pub deleted: bool,
    /// Creation time
    pub created_at: DateTime<Utc>,
}

impl Message {
    /// Create a complete user message
    pub fn user(
        conversation_id: ConversationId,
        parent_id: Option<MessageId>,
        text: impl Into<String>,
    ) -> Self {
        Self {
            id: MessageId::new(),
            conversation_id,
            parent_id,
            role: Role::User,
            content: vec![ContentFragment::text(text)],
            status: MessageStatus::Complete,
            provider: None,
            model: None,
            deleted: false,
            created_at: Utc::now(),
        }
    }

    /// Create an empty assistant message awaiting generation
    pub fn assistant_placeholder(
        conversation_id: ConversationId,
        parent_id: MessageId,
        provider: ProviderKind,
        model: impl Into<String>,
    ) -> Self {
        Self {
            id: MessageId::new(),
            conversation_id,
            parent_id: Some(parent_id),
            role: Role::Assistant,
            content: Vec::new(),
            status: MessageStatus::Pending,
            provider: Some(provider),
            model: Some(model.into()),
            deleted: false,
            created_at: Utc::now(),
        }
    }

    /// Concatenated text of all fragments
    #[must_use]
    pub fn text(&self) -> String {
        self.content
            .iter()
            .map(|fragment| match fragment {
                ContentFragment::Text { text } => text.as_str(),
            })
            .collect()
    }

    /// Replace the content with a single text fragment
    pub fn set_text(&mut self, text: impl Into<String>) {
        let text = text.into();
        self.content = if text.is_empty() {
            Vec::new()
        } else {
            vec![ContentFragment::Text { text }]
        };
    }
}

// ============================================================================
// Conversations
// ============================================================================

/// A forest of messages owned by one user
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    /// Conversation identifier
    pub id: ConversationId,
    /// Owning user, as asserted by the authentication layer
    pub owner: String,
    /// Optional human-readable title
    pub title: Option<String>,
    /// First message ever created in this conversation
    pub root_message_id: Option<MessageId>,
    /// Creation time
    pub created_at: DateTime<Utc>,
}

impl Conversation {
    /// Create an empty conversation
    pub fn new(owner: impl Into<String>, title: Option<String>) -> Self {
        Self {
            id: ConversationId::new(),
            owner: owner.into(),
            title,
            root_message_id: None,
            created_at: Utc::now(),
        }
    }
}

// ============================================================================
// Checkpoints
// ============================================================================

/// Durable snapshot of an assistant message's progress
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Message the snapshot belongs to
    pub message_id: MessageId,
    /// Accumulated content at the time of the snapshot
    pub content: String,
    /// Sequence number of the event at which the snapshot was taken
    pub sequence: u64,
    /// Status at the time of the snapshot
    pub status: MessageStatus,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_id_roundtrip_through_string() {
        let id = MessageId::new();
        let parsed: MessageId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_status_terminality() {
        assert!(!MessageStatus::Pending.is_terminal());
        assert!(!MessageStatus::Streaming.is_terminal());
        assert!(MessageStatus::Complete.is_terminal());
        assert!(MessageStatus::Aborted.is_terminal());
        assert!(MessageStatus::Error.is_terminal());
    }

    #[test]
    fn test_status_resumability() {
        assert!(MessageStatus::Pending.is_resumable());
        assert!(MessageStatus::Streaming.is_resumable());
        assert!(MessageStatus::Error.is_resumable());
        assert!(!MessageStatus::Complete.is_resumable());
        assert!(!MessageStatus::Aborted.is_resumable());
    }

    #[test]
    fn test_user_message_is_complete() {
        let conv = ConversationId::new();
        let msg = Message::user(conv, None, "hi");
        assert_eq!(msg.role, Role::User);
        assert_eq!(msg.status, MessageStatus::Complete);
        assert_eq!(msg.text(), "hi");
    }

    #[test]
    fn test_placeholder_has_no_content() {
        let conv = ConversationId::new();
        let parent = MessageId::new();
        let mut msg = Message::assistant_placeholder(conv, parent, ProviderKind::OpenAi, "gpt-4");
        assert_eq!(msg.status, MessageStatus::Pending);
        assert!(msg.content.is_empty());

        msg.set_text("partial");
        assert_eq!(msg.text(), "partial");
        msg.set_text("");
        assert!(msg.content.is_empty());
    }

    #[test]
    fn test_content_fragment_serialization() {
        let json = serde_json::to_string(&ContentFragment::text("x")).unwrap();
        assert_eq!(json, r#"{"type":"text","text":"x"}"#);
    }

    #[test]
    fn test_status_serializes_snake_case() {
        let json = serde_json::to_string(&MessageStatus::Streaming).unwrap();
        assert_eq!(json, "\"streaming\"");
    }
}
