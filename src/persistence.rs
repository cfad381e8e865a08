//! Persistence collaborators
//!
//! The orchestration core only needs a handful of repository calls. Real
//! deployments back these with a document store; [`InMemoryStore`] serves the
//! binary's default setup and the tests.

use crate::context::Conversation;
use crate::similarity::EmbeddedItem;
use async_trait::async_trait;
use dashmap::DashMap;

/// Storage errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum StorageError {
    #[error("Backend unavailable: {0}")]
    Unavailable(String),

    #[error("Write rejected: {0}")]
    Rejected(String),
}

/// Conversation records keyed by owner and conversation id
#[async_trait]
pub trait ConversationRepository: Send + Sync {
    async fn find_conversation(
        &self,
        owner_id: &str,
        conversation_id: &str,
    ) -> Result<Option<Conversation>, StorageError>;

    async fn save_conversation(&self, conversation: &Conversation) -> Result<(), StorageError>;

    /// Every conversation of an owner, most recently updated first
    async fn list_conversations(&self, owner_id: &str) -> Result<Vec<Conversation>, StorageError>;

    /// Returns whether a record was removed
    async fn delete_conversation(
        &self,
        owner_id: &str,
        conversation_id: &str,
    ) -> Result<bool, StorageError>;
}

/// Embedded items keyed by owner and entity
#[async_trait]
pub trait EmbeddingRepository: Send + Sync {
    async fn find_embedded_items(
        &self,
        owner_id: &str,
        entity_id: &str,
    ) -> Result<Vec<EmbeddedItem>, StorageError>;

    async fn insert_embedded_item(&self, item: EmbeddedItem) -> Result<(), StorageError>;

    /// Cascade delete; returns the number of removed items
    async fn delete_entity_items(&self, owner_id: &str, entity_id: &str) -> Result<usize, StorageError>;
}

type OwnerKey = (String, String);

/// Process-local store for conversations and embedded items
#[derive(Default)]
pub struct InMemoryStore {
    conversations: DashMap<OwnerKey, Conversation>,
    items: DashMap<OwnerKey, Vec<EmbeddedItem>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn conversation_count(&self) -> usize {
        self.conversations.len()
    }
}

fn key(owner_id: &str, id: &str) -> OwnerKey {
    (owner_id.to_string(), id.to_string())
}

#[async_trait]
impl ConversationRepository for InMemoryStore {
    async fn find_conversation(
        &self,
        owner_id: &str,
        conversation_id: &str,
    ) -> Result<Option<Conversation>, StorageError> {
        Ok(self
            .conversations
            .get(&key(owner_id, conversation_id))
            .map(|entry| entry.value().clone()))
    }

    async fn save_conversation(&self, conversation: &Conversation) -> Result<(), StorageError> {
        self.conversations.insert(
            key(&conversation.owner_id, &conversation.conversation_id),
            conversation.clone(),
        );
        Ok(())
    }

    async fn list_conversations(&self, owner_id: &str) -> Result<Vec<Conversation>, StorageError> {
        let mut conversations: Vec<Conversation> = self
            .conversations
            .iter()
            .filter(|entry| entry.key().0 == owner_id)
            .map(|entry| entry.value().clone())
            .collect();
        conversations.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(conversations)
    }

    async fn delete_conversation(
        &self,
        owner_id: &str,
        conversation_id: &str,
    ) -> Result<bool, StorageError> {
        Ok(self
            .conversations
            .remove(&key(owner_id, conversation_id))
            .is_some())
    }
}

#[async_trait]
impl EmbeddingRepository for InMemoryStore {
    async fn find_embedded_items(
        &self,
        owner_id: &str,
        entity_id: &str,
    ) -> Result<Vec<EmbeddedItem>, StorageError> {
        Ok(self
            .items
            .get(&key(owner_id, entity_id))
            .map(|entry| entry.value().clone())
            .unwrap_or_default())
    }

    async fn insert_embedded_item(&self, item: EmbeddedItem) -> Result<(), StorageError> {
        self.items
            .entry(key(&item.owner_id, &item.entity_id))
            .or_default()
            .push(item);
        Ok(())
    }

    async fn delete_entity_items(&self, owner_id: &str, entity_id: &str) -> Result<usize, StorageError> {
        Ok(self
            .items
            .remove(&key(owner_id, entity_id))
            .map(|(_, items)| items.len())
            .unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::similarity::{ContentType, ItemMetadata};

    fn item(owner: &str, entity: &str, text: &str) -> EmbeddedItem {
        EmbeddedItem::new(
            owner,
            entity,
            ContentType::Note,
            text,
            vec![1.0, 0.0],
            ItemMetadata::new("contact_note"),
        )
    }

    #[tokio::test]
    async fn test_conversation_round_trip() {
        let store = InMemoryStore::new();
        assert!(store.find_conversation("u1", "c1").await.unwrap().is_none());

        let conversation = Conversation::new("u1", "c1");
        store.save_conversation(&conversation).await.unwrap();
        let found = store.find_conversation("u1", "c1").await.unwrap().unwrap();
        assert_eq!(found, conversation);

        // Another owner cannot see it
        assert!(store.find_conversation("u2", "c1").await.unwrap().is_none());
        assert!(store.delete_conversation("u1", "c1").await.unwrap());
        assert_eq!(store.conversation_count(), 0);
    }

    #[tokio::test]
    async fn test_list_is_owner_scoped_and_newest_first() {
        let store = InMemoryStore::new();
        let mut older = Conversation::new("u1", "old");
        older.updated_at = older.updated_at - chrono::Duration::minutes(5);
        store.save_conversation(&older).await.unwrap();
        store.save_conversation(&Conversation::new("u1", "new")).await.unwrap();
        store.save_conversation(&Conversation::new("u2", "other")).await.unwrap();

        let listed = store.list_conversations("u1").await.unwrap();
        let ids: Vec<&str> = listed.iter().map(|c| c.conversation_id.as_str()).collect();
        assert_eq!(ids, vec!["new", "old"]);
        assert!(store.list_conversations("u3").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_items_are_scoped_and_cascade_deleted() {
        let store = InMemoryStore::new();
        store.insert_embedded_item(item("u1", "e1", "a")).await.unwrap();
        store.insert_embedded_item(item("u1", "e1", "a")).await.unwrap();
        store.insert_embedded_item(item("u1", "e2", "b")).await.unwrap();

        assert_eq!(store.find_embedded_items("u1", "e1").await.unwrap().len(), 2);
        assert_eq!(store.delete_entity_items("u1", "e1").await.unwrap(), 2);
        assert!(store.find_embedded_items("u1", "e1").await.unwrap().is_empty());
        assert_eq!(store.find_embedded_items("u1", "e2").await.unwrap().len(), 1);
    }
}
