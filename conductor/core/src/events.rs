//! Client → Conductor Events
//!
//! Control messages a client sends. The authenticated user is not part of
//! the payload; the transport supplies it alongside each event.

use serde::{Deserialize, Serialize};

use crate::model::{ConversationId, MessageId};

/// A request from a client
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEvent {
    /// Post a user message and stream an assistant reply to it
    Submit {
        /// Target conversation
        conversation_id: ConversationId,
        /// Message to reply under (`None` starts a new root)
        #[serde(default)]
        parent_message_id: Option<MessageId>,
        /// User message text
        content: String,
        /// Provider name (`openai`, `anthropic`, `mistral`)
        provider: String,
        /// Provider model identifier
        model: String,
    },

    /// Cancel an in-flight reply
    Abort {
        /// Assistant message to cancel
        message_id: MessageId,
    },

    /// Re-attach to a reply, resuming generation if needed
    Continue {
        /// Assistant message to continue
        message_id: MessageId,
        /// Last sequence the client already has
        #[serde(default)]
        after_sequence: Option<u64>,
    },

    /// Fetch events without holding a subscription
    Poll {
        /// Assistant message to poll
        message_id: MessageId,
        /// Last sequence the client already has (0 for none)
        #[serde(default)]
        after_sequence: u64,
        /// Upper bound on events returned
        #[serde(default)]
        max_events: Option<usize>,
    },

    /// Acknowledge receipt of events up to `sequence`
    Ack {
        /// Assistant message being acknowledged
        message_id: MessageId,
        /// Highest sequence received
        sequence: u64,
    },

    /// Start a new conversation
    CreateConversation {
        /// Optional title
        #[serde(default)]
        title: Option<String>,
    },

    /// Create an edited sibling of a user message
    Edit {
        /// User message to edit
        message_id: MessageId,
        /// Replacement text
        content: String,
    },

    /// Fetch the branch ending at a leaf
    ResolveBranch {
        /// Leaf message
        leaf_id: MessageId,
    },

    /// Soft-delete a message
    Delete {
        /// Message to delete
        message_id: MessageId,
    },

    /// List providers and their models
    ListProviders,
}

impl ClientEvent {
    /// Short name for logging
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Submit { .. } => "submit",
            Self::Abort { .. } => "abort",
            Self::Continue { .. } => "continue",
            Self::Poll { .. } => "poll",
            Self::Ack { .. } => "ack",
            Self::CreateConversation { .. } => "create_conversation",
            Self::Edit { .. } => "edit",
            Self::ResolveBranch { .. } => "resolve_branch",
            Self::Delete { .. } => "delete",
            Self::ListProviders => "list_providers",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_submit_parses_without_parent() {
        let conv = ConversationId::new();
        let json = format!(
            r#"{{"type":"submit","conversation_id":"{conv}","content":"hi","provider":"openai","model":"gpt-3.5-turbo"}}"#
        );
        let event: ClientEvent = serde_json::from_str(&json).unwrap();

        assert_eq!(
            event,
            ClientEvent::Submit {
                conversation_id: conv,
                parent_message_id: None,
                content: "hi".into(),
                provider: "openai".into(),
                model: "gpt-3.5-turbo".into(),
            }
        );
        assert_eq!(event.name(), "submit");
    }

    #[test]
    fn test_poll_defaults() {
        let id = MessageId::new();
        let json = format!(r#"{{"type":"poll","message_id":"{id}"}}"#);
        let event: ClientEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(
            event,
            ClientEvent::Poll {
                message_id: id,
                after_sequence: 0,
                max_events: None
            }
        );
    }

    #[test]
    fn test_list_providers_has_no_payload() {
        let event: ClientEvent = serde_json::from_str(r#"{"type":"list_providers"}"#).unwrap();
        assert_eq!(event, ClientEvent::ListProviders);
        assert_eq!(event.name(), "list_providers");
    }

    #[test]
    fn test_unknown_type_is_rejected() {
        let result = serde_json::from_str::<ClientEvent>(r#"{"type":"explode"}"#);
        assert!(result.is_err());
    }
}
