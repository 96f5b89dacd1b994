//! Persistence Contract
//!
//! The engine does not own relational storage. It requires only the narrow
//! read/write surface in [`ConversationStore`]; the host application backs
//! it with its database. [`InMemoryStore`] is the reference implementation.
//!
//! # Checkpoint Rules
//!
//! - `append_checkpoint` must reject a sequence that is not strictly greater
//!   than the last committed one with [`StoreError::Conflict`].
//! - A committed checkpoint also becomes the message row's content and
//!   status, so readers that bypass the engine see the latest snapshot.

mod memory;

use async_trait::async_trait;
use thiserror::Error;

use crate::model::{Checkpoint, Conversation, ConversationId, Message, MessageId, MessageStatus};

pub use memory::InMemoryStore;

/// Errors reported by a [`ConversationStore`]
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum StoreError {
    /// The checkpoint sequence did not advance
    #[error("checkpoint {attempted} for message {message_id} is not after {last}")]
    Conflict {
        /// Message being checkpointed
        message_id: MessageId,
        /// Rejected sequence
        attempted: u64,
        /// Last committed sequence
        last: u64,
    },

    /// No such message
    #[error("message {0} not found")]
    MessageNotFound(MessageId),

    /// No such conversation
    #[error("conversation {0} not found")]
    ConversationNotFound(ConversationId),

    /// Backend-specific failure
    #[error("{0}")]
    Backend(String),
}

/// Storage operations the engine depends on
#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Insert a new conversation
    async fn insert_conversation(&self, conversation: Conversation) -> Result<(), StoreError>;

    /// Fetch a conversation
    async fn get_conversation(&self, id: ConversationId) -> Result<Option<Conversation>, StoreError>;

    /// Record the first message of a conversation (no-op if already set)
    async fn set_root_message(
        &self,
        conversation: ConversationId,
        root: MessageId,
    ) -> Result<(), StoreError>;

    /// Insert a new message row
    async fn insert_message(&self, message: Message) -> Result<(), StoreError>;

    /// Fetch a message row
    async fn get_message(&self, id: MessageId) -> Result<Option<Message>, StoreError>;

    /// Direct children of a message, oldest first
    async fn children(&self, id: MessageId) -> Result<Vec<Message>, StoreError>;

    /// Every message of a conversation, oldest first
    async fn list_messages(&self, conversation: ConversationId) -> Result<Vec<Message>, StoreError>;

    /// Path from the conversation root down to `leaf`, inclusive
    async fn load_conversation_path(&self, leaf: MessageId) -> Result<Vec<Message>, StoreError>;

    /// Soft-delete a message
    ///
    /// Replaces its content with [`DELETED_MARKER`](crate::model::DELETED_MARKER)
    /// and sets `deleted`.
    /// The row, its place in the tree, and its checkpoints are kept.
    /// Idempotent.
    ///
    /// # Errors
    ///
    /// [`StoreError::MessageNotFound`] if the message does not exist.
    async fn mark_deleted(&self, id: MessageId) -> Result<(), StoreError>;

    /// Most recent committed checkpoint for a message
    async fn load_last_checkpoint(&self, id: MessageId) -> Result<Option<Checkpoint>, StoreError>;

    /// Commit a checkpoint
    ///
    /// # Errors
    ///
    /// [`StoreError::Conflict`] if `sequence` does not exceed the last
    /// committed sequence for `message_id`.
    async fn append_checkpoint(
        &self,
        message_id: MessageId,
        content: &str,
        sequence: u64,
        status: MessageStatus,
    ) -> Result<(), StoreError>;
}
