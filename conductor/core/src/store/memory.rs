//! In-memory [`ConversationStore`].

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;

use super::{ConversationStore, StoreError};
use crate::model::{
    Checkpoint, Conversation, ConversationId, Message, MessageId, MessageStatus, DELETED_MARKER,
};

#[derive(Default)]
struct Tables {
    conversations: HashMap<ConversationId, Conversation>,
    messages: HashMap<MessageId, Message>,
    /// Insertion order, used for stable listings
    order: Vec<MessageId>,
    children: HashMap<MessageId, Vec<MessageId>>,
    checkpoints: HashMap<MessageId, Checkpoint>,
}

/// Store backed by process memory
///
/// Suitable for tests, demos, and single-process deployments that accept
/// losing history on restart.
#[derive(Default)]
pub struct InMemoryStore {
    tables: RwLock<Tables>,
}

impl InMemoryStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored messages
    #[must_use]
    pub fn message_count(&self) -> usize {
        self.tables.read().messages.len()
    }
}

#[async_trait]
impl ConversationStore for InMemoryStore {
    async fn insert_conversation(&self, conversation: Conversation) -> Result<(), StoreError> {
        self.tables
            .write()
            .conversations
            .insert(conversation.id, conversation);
        Ok(())
    }

    async fn get_conversation(&self, id: ConversationId) -> Result<Option<Conversation>, StoreError> {
        Ok(self.tables.read().conversations.get(&id).cloned())
    }

    async fn set_root_message(
        &self,
        conversation: ConversationId,
        root: MessageId,
    ) -> Result<(), StoreError> {
        let mut tables = self.tables.write();
        let conv = tables
            .conversations
            .get_mut(&conversation)
            .ok_or(StoreError::ConversationNotFound(conversation))?;
        if conv.root_message_id.is_none() {
            conv.root_message_id = Some(root);
        }
        Ok(())
    }

    async fn insert_message(&self, message: Message) -> Result<(), StoreError> {
        let mut tables = self.tables.write();
        if !tables.conversations.contains_key(&message.conversation_id) {
            return Err(StoreError::ConversationNotFound(message.conversation_id));
        }
        if let Some(parent) = message.parent_id {
            tables.children.entry(parent).or_default().push(message.id);
        }
        tables.order.push(message.id);
        tables.messages.insert(message.id, message);
        Ok(())
    }

    async fn get_message(&self, id: MessageId) -> Result<Option<Message>, StoreError> {
        Ok(self.tables.read().messages.get(&id).cloned())
    }

    async fn children(&self, id: MessageId) -> Result<Vec<Message>, StoreError> {
        let tables = self.tables.read();
        Ok(tables
            .children
            .get(&id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|child| tables.messages.get(child).cloned())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn list_messages(&self, conversation: ConversationId) -> Result<Vec<Message>, StoreError> {
        let tables = self.tables.read();
        Ok(tables
            .order
            .iter()
            .filter_map(|id| tables.messages.get(id))
            .filter(|m| m.conversation_id == conversation)
            .cloned()
            .collect())
    }

    async fn load_conversation_path(&self, leaf: MessageId) -> Result<Vec<Message>, StoreError> {
        let tables = self.tables.read();
        let mut path = Vec::new();
        let mut cursor = Some(leaf);

        while let Some(id) = cursor {
            let message = tables
                .messages
                .get(&id)
                .ok_or(StoreError::MessageNotFound(id))?;
            path.push(message.clone());
            if path.len() > tables.messages.len() {
                return Err(StoreError::Backend(format!(
                    "cycle detected above message {leaf}"
                )));
            }
            cursor = message.parent_id;
        }

        path.reverse();
        Ok(path)
    }

    async fn mark_deleted(&self, id: MessageId) -> Result<(), StoreError> {
        let mut tables = self.tables.write();
        let message = tables
            .messages
            .get_mut(&id)
            .ok_or(StoreError::MessageNotFound(id))?;
        message.set_text(DELETED_MARKER);
        message.deleted = true;
        Ok(())
    }

    async fn load_last_checkpoint(&self, id: MessageId) -> Result<Option<Checkpoint>, StoreError> {
        Ok(self.tables.read().checkpoints.get(&id).cloned())
    }

    async fn append_checkpoint(
        &self,
        message_id: MessageId,
        content: &str,
        sequence: u64,
        status: MessageStatus,
    ) -> Result<(), StoreError> {
        let mut tables = self.tables.write();

        if let Some(last) = tables.checkpoints.get(&message_id) {
            if sequence <= last.sequence {
                return Err(StoreError::Conflict {
                    message_id,
                    attempted: sequence,
                    last: last.sequence,
                });
            }
        }

        let message = tables
            .messages
            .get_mut(&message_id)
            .ok_or(StoreError::MessageNotFound(message_id))?;
        message.set_text(content);
        message.status = status;

        tables.checkpoints.insert(
            message_id,
            Checkpoint {
                message_id,
                content: content.to_string(),
                sequence,
                status,
            },
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::ProviderKind;
    use pretty_assertions::assert_eq;

    async fn seeded() -> (InMemoryStore, Conversation, Message, Message) {
        let store = InMemoryStore::new();
        let conv = Conversation::new("alice", None);
        store.insert_conversation(conv.clone()).await.unwrap();

        let user = Message::user(conv.id, None, "hi");
        store.insert_message(user.clone()).await.unwrap();
        let reply = Message::assistant_placeholder(conv.id, user.id, ProviderKind::OpenAi, "gpt-4");
        store.insert_message(reply.clone()).await.unwrap();

        (store, conv, user, reply)
    }

    #[tokio::test]
    async fn test_path_is_root_first() {
        let (store, _conv, user, reply) = seeded().await;

        let path = store.load_conversation_path(reply.id).await.unwrap();
        let ids: Vec<_> = path.iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![user.id, reply.id]);
    }

    #[tokio::test]
    async fn test_checkpoint_sequence_must_increase() {
        let (store, _conv, _user, reply) = seeded().await;

        store
            .append_checkpoint(reply.id, "He", 1, MessageStatus::Streaming)
            .await
            .unwrap();
        store
            .append_checkpoint(reply.id, "Hello", 4, MessageStatus::Streaming)
            .await
            .unwrap();

        let err = store
            .append_checkpoint(reply.id, "Hello!", 4, MessageStatus::Complete)
            .await
            .unwrap_err();
        assert_eq!(
            err,
            StoreError::Conflict {
                message_id: reply.id,
                attempted: 4,
                last: 4
            }
        );

        let last = store.load_last_checkpoint(reply.id).await.unwrap().unwrap();
        assert_eq!(last.content, "Hello");
        assert_eq!(last.sequence, 4);
    }

    #[tokio::test]
    async fn test_checkpoint_updates_message_row() {
        let (store, _conv, _user, reply) = seeded().await;

        store
            .append_checkpoint(reply.id, "done", 2, MessageStatus::Complete)
            .await
            .unwrap();

        let row = store.get_message(reply.id).await.unwrap().unwrap();
        assert_eq!(row.text(), "done");
        assert_eq!(row.status, MessageStatus::Complete);
    }

    #[tokio::test]
    async fn test_mark_deleted_keeps_tree_and_checkpoints() {
        let (store, _conv, user, reply) = seeded().await;
        store
            .append_checkpoint(reply.id, "secret plan", 2, MessageStatus::Complete)
            .await
            .unwrap();

        store.mark_deleted(reply.id).await.unwrap();
        store.mark_deleted(reply.id).await.unwrap();

        let row = store.get_message(reply.id).await.unwrap().unwrap();
        assert!(row.deleted);
        assert_eq!(row.text(), DELETED_MARKER);
        assert_eq!(row.parent_id, Some(user.id));
        assert_eq!(store.children(user.id).await.unwrap().len(), 1);
        let checkpoint = store.load_last_checkpoint(reply.id).await.unwrap().unwrap();
        assert_eq!(checkpoint.sequence, 2);

        let err = store.mark_deleted(MessageId::new()).await.unwrap_err();
        assert!(matches!(err, StoreError::MessageNotFound(_)));
    }

    #[tokio::test]
    async fn test_children_and_listing() {
        let (store, conv, user, reply) = seeded().await;
        let sibling = Message::user(conv.id, Some(user.id), "other branch");
        store.insert_message(sibling.clone()).await.unwrap();

        let children = store.children(user.id).await.unwrap();
        assert_eq!(children.len(), 2);
        assert_eq!(children[0].id, reply.id);
        assert_eq!(children[1].id, sibling.id);

        let all = store.list_messages(conv.id).await.unwrap();
        assert_eq!(all.len(), 3);
    }

    #[tokio::test]
    async fn test_insert_into_unknown_conversation_fails() {
        let store = InMemoryStore::new();
        let orphan = Message::user(ConversationId::new(), None, "lost");
        let err = store.insert_message(orphan).await.unwrap_err();
        assert!(matches!(err, StoreError::ConversationNotFound(_)));
    }

    #[tokio::test]
    async fn test_root_is_set_once() {
        let (store, conv, user, reply) = seeded().await;
        store.set_root_message(conv.id, user.id).await.unwrap();
        store.set_root_message(conv.id, reply.id).await.unwrap();

        let stored = store.get_conversation(conv.id).await.unwrap().unwrap();
        assert_eq!(stored.root_message_id, Some(user.id));
    }
}
