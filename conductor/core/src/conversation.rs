//! Conversation Tree
//!
//! An append-only forest of messages addressed by id. Branching means two
//! messages share a parent; the history a client sees is the path from a
//! chosen leaf back to its root.
//!
//! # Invariants
//!
//! - A message's parent, if any, exists and belongs to the same conversation.
//! - Existing messages are never rewritten by the tree. Editing a user
//!   message creates a sibling under the same parent. Soft delete only
//!   swaps the content for a marker; ids, parents, and descendants stay.
//! - Assistant content changes only through checkpoints written by the
//!   stream session generating it.

use std::sync::Arc;

use crate::error::EngineError;
use crate::model::{Conversation, ConversationId, Message, MessageId, Role};
use crate::provider::{ChatTurn, ProviderKind};
use crate::store::ConversationStore;

/// Validating facade over a [`ConversationStore`]
#[derive(Clone)]
pub struct ConversationTree {
    store: Arc<dyn ConversationStore>,
}

impl ConversationTree {
    /// Create a tree backed by `store`
    pub fn new(store: Arc<dyn ConversationStore>) -> Self {
        Self { store }
    }

    /// The underlying store
    #[must_use]
    pub fn store(&self) -> &Arc<dyn ConversationStore> {
        &self.store
    }

    /// Start a new, empty conversation
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn create_conversation(
        &self,
        owner: &str,
        title: Option<String>,
    ) -> Result<Conversation, EngineError> {
        let conversation = Conversation::new(owner, title);
        self.store.insert_conversation(conversation.clone()).await?;
        tracing::info!(conversation_id = %conversation.id, "Conversation created");
        Ok(conversation)
    }

    /// Fetch a conversation
    ///
    /// # Errors
    ///
    /// [`EngineError::ConversationNotFound`] if it does not exist.
    pub async fn conversation(&self, id: ConversationId) -> Result<Conversation, EngineError> {
        self.store
            .get_conversation(id)
            .await?
            .ok_or(EngineError::ConversationNotFound(id))
    }

    /// Fetch a conversation, checking that `owner` owns it
    ///
    /// # Errors
    ///
    /// [`EngineError::NotOwner`] if another user owns it.
    pub async fn owned_conversation(
        &self,
        owner: &str,
        id: ConversationId,
    ) -> Result<Conversation, EngineError> {
        let conversation = self.conversation(id).await?;
        if conversation.owner != owner {
            return Err(EngineError::NotOwner(id));
        }
        Ok(conversation)
    }

    /// Fetch a message
    ///
    /// # Errors
    ///
    /// [`EngineError::MessageNotFound`] if it does not exist.
    pub async fn message(&self, id: MessageId) -> Result<Message, EngineError> {
        self.store
            .get_message(id)
            .await?
            .ok_or(EngineError::MessageNotFound(id))
    }

    /// Add a complete message under `parent`
    ///
    /// Used for user and system messages. Assistant messages are created by
    /// [`Self::create_assistant_placeholder`] and filled in by streaming.
    ///
    /// # Errors
    ///
    /// [`EngineError::InvalidParent`] if `parent` does not resolve to a
    /// message in `conversation_id`.
    pub async fn create_message(
        &self,
        conversation_id: ConversationId,
        parent: Option<MessageId>,
        role: Role,
        content: &str,
    ) -> Result<Message, EngineError> {
        self.conversation(conversation_id).await?;
        self.check_parent(conversation_id, parent).await?;

        let mut message = Message::user(conversation_id, parent, content);
        message.role = role;
        self.insert(message).await
    }

    /// Add an empty `pending` assistant message under `parent`
    ///
    /// # Errors
    ///
    /// [`EngineError::InvalidParent`] if `parent` does not resolve to a
    /// message in `conversation_id`.
    pub async fn create_assistant_placeholder(
        &self,
        conversation_id: ConversationId,
        parent: MessageId,
        provider: ProviderKind,
        model: &str,
    ) -> Result<Message, EngineError> {
        self.check_parent(conversation_id, Some(parent)).await?;
        let message = Message::assistant_placeholder(conversation_id, parent, provider, model);
        self.insert(message).await
    }

    /// Path from the root down to `leaf`, inclusive
    ///
    /// # Errors
    ///
    /// [`EngineError::MessageNotFound`] if `leaf` or an ancestor is missing.
    pub async fn resolve_branch(&self, leaf: MessageId) -> Result<Vec<Message>, EngineError> {
        Ok(self.store.load_conversation_path(leaf).await?)
    }

    /// Create an edited copy of a user message as a new sibling
    ///
    /// The original message and everything below it are left untouched.
    ///
    /// # Errors
    ///
    /// [`EngineError::NotEditable`] for non-user messages.
    pub async fn edit_message(&self, id: MessageId, content: &str) -> Result<Message, EngineError> {
        let original = self.message(id).await?;
        if original.role != Role::User {
            return Err(EngineError::NotEditable(id));
        }

        let edited = Message::user(original.conversation_id, original.parent_id, content);
        let edited = self.insert(edited).await?;
        tracing::info!(original = %id, edited = %edited.id, "Message edited as new sibling");
        Ok(edited)
    }

    /// Direct children of a message, oldest first
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn children(&self, id: MessageId) -> Result<Vec<Message>, EngineError> {
        Ok(self.store.children(id).await?)
    }

    /// Other messages sharing this message's parent, oldest first
    ///
    /// For a root message, siblings are the other roots of its conversation.
    ///
    /// # Errors
    ///
    /// [`EngineError::MessageNotFound`] if `id` does not exist.
    pub async fn siblings(&self, id: MessageId) -> Result<Vec<Message>, EngineError> {
        let message = self.message(id).await?;
        let candidates = match message.parent_id {
            Some(parent) => self.store.children(parent).await?,
            None => self
                .store
                .list_messages(message.conversation_id)
                .await?
                .into_iter()
                .filter(|m| m.parent_id.is_none())
                .collect(),
        };
        Ok(candidates.into_iter().filter(|m| m.id != id).collect())
    }

    /// Every message in a conversation, oldest first
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn list_messages(&self, conversation: ConversationId) -> Result<Vec<Message>, EngineError> {
        Ok(self.store.list_messages(conversation).await?)
    }

    /// Soft-delete a message, keeping its place in the tree
    ///
    /// # Errors
    ///
    /// [`EngineError::MessageNotFound`] if it does not exist.
    pub async fn delete_message(&self, id: MessageId) -> Result<Message, EngineError> {
        self.store.mark_deleted(id).await?;
        tracing::info!(message_id = %id, "Message deleted");
        self.message(id).await
    }

    /// Provider context for generating a reply below `leaf`
    ///
    /// Deleted messages and messages without text (placeholders that never
    /// produced output) are skipped.
    ///
    /// # Errors
    ///
    /// [`EngineError::MessageNotFound`] if the branch is broken.
    pub async fn context_for(&self, leaf: MessageId) -> Result<Vec<ChatTurn>, EngineError> {
        Ok(self
            .resolve_branch(leaf)
            .await?
            .into_iter()
            .filter(|m| !m.deleted)
            .filter_map(|m| {
                let text = m.text();
                (!text.is_empty()).then(|| ChatTurn::new(m.role, text))
            })
            .collect())
    }

    async fn check_parent(
        &self,
        conversation: ConversationId,
        parent: Option<MessageId>,
    ) -> Result<(), EngineError> {
        let Some(parent) = parent else {
            return Ok(());
        };
        match self.store.get_message(parent).await? {
            Some(p) if p.conversation_id == conversation => Ok(()),
            _ => Err(EngineError::InvalidParent {
                parent,
                conversation,
            }),
        }
    }

    async fn insert(&self, message: Message) -> Result<Message, EngineError> {
        self.store.insert_message(message.clone()).await?;
        self.store
            .set_root_message(message.conversation_id, message.id)
            .await?;
        tracing::debug!(
            message_id = %message.id,
            conversation_id = %message.conversation_id,
            role = message.role.as_str(),
            "Message created"
        );
        Ok(message)
    }
}
