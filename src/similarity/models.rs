//! Data models for the similarity index

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind of content an embedded item was created from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentType {
    Activity,
    Note,
    MessageHistory,
    MeetingNote,
    Preference,
}

impl ContentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentType::Activity => "activity",
            ContentType::Note => "note",
            ContentType::MessageHistory => "message_history",
            ContentType::MeetingNote => "meeting_note",
            ContentType::Preference => "preference",
        }
    }
}

/// Provenance and ranking hints for an embedded item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemMetadata {
    pub source: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub importance: Option<f32>,
    pub timestamp: DateTime<Utc>,
}

impl ItemMetadata {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            tags: Vec::new(),
            importance: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    pub fn with_importance(mut self, importance: f32) -> Self {
        self.importance = Some(importance.clamp(0.0, 1.0));
        self
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }
}

/// Stored text with its embedding
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddedItem {
    pub id: String,
    pub owner_id: String,
    pub entity_id: String,
    pub content_type: ContentType,
    pub text: String,
    pub embedding: Vec<f32>,
    pub metadata: ItemMetadata,
}

impl EmbeddedItem {
    pub fn new(
        owner_id: impl Into<String>,
        entity_id: impl Into<String>,
        content_type: ContentType,
        text: impl Into<String>,
        embedding: Vec<f32>,
        metadata: ItemMetadata,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            owner_id: owner_id.into(),
            entity_id: entity_id.into(),
            content_type,
            text: text.into(),
            embedding,
            metadata,
        }
    }
}

/// Ranked query result
#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub id: String,
    pub content: String,
    pub content_type: ContentType,
    pub metadata: ItemMetadata,
    pub similarity: f32,
}

impl SearchHit {
    pub fn from_item(item: EmbeddedItem, similarity: f32) -> Self {
        Self {
            id: item.id,
            content: item.text,
            content_type: item.content_type,
            metadata: item.metadata,
            similarity,
        }
    }
}

/// Source data for indexing one entity (contact)
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EntitySnapshot {
    #[serde(default)]
    pub note: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Most recent first
    #[serde(default)]
    pub activities: Vec<ActivityRecord>,
    /// Most recent first
    #[serde(default)]
    pub messages: Vec<MessageRecord>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ActivityRecord {
    pub activity_type: String,
    #[serde(default)]
    pub details: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MessageRecord {
    pub content: String,
    pub status: String,
}

/// Similarity search request
#[derive(Debug, Clone, Deserialize)]
pub struct SearchRequest {
    pub owner_id: String,
    pub entity_id: String,
    pub query: String,
    #[serde(default = "default_k")]
    pub k: usize,
}

fn default_k() -> usize {
    5
}

/// Similarity search response
#[derive(Debug, Clone, Serialize)]
pub struct SearchResponse {
    pub hits: Vec<SearchHit>,
    pub total: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_type_wire_names() {
        let json = serde_json::to_string(&ContentType::MessageHistory).unwrap();
        assert_eq!(json, "\"message_history\"");
        assert_eq!(ContentType::MeetingNote.as_str(), "meeting_note");
    }

    #[test]
    fn test_importance_is_clamped() {
        let metadata = ItemMetadata::new("manual").with_importance(1.7);
        assert_eq!(metadata.importance, Some(1.0));
    }

    #[test]
    fn test_search_request_default_k() {
        let request: SearchRequest = serde_json::from_str(
            r#"{"owner_id":"u1","entity_id":"c1","query":"pricing"}"#,
        )
        .unwrap();
        assert_eq!(request.k, 5);
    }
}
