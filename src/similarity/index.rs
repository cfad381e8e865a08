//! Similarity index over per-entity embedded content

use super::embedder::Embedder;
use super::models::*;
use crate::error::{ChatError, Result};
use crate::metrics::METRICS;
use crate::persistence::EmbeddingRepository;
use async_trait::async_trait;
use std::cmp::Ordering;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Items of each kind taken from an entity snapshot when indexing
const MAX_INDEXED_PER_KIND: usize = 10;

/// Cosine similarity; zero-norm or mismatched vectors score 0.0
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

/// Nearest-neighbor backend
#[async_trait]
pub trait VectorSearch: Send + Sync {
    async fn nearest(
        &self,
        owner_id: &str,
        entity_id: &str,
        query: &[f32],
        k: usize,
    ) -> Result<Vec<SearchHit>>;
}

/// Exact O(n) scan over every item of an entity
pub struct BruteForceSearch {
    repository: Arc<dyn EmbeddingRepository>,
}

impl BruteForceSearch {
    pub fn new(repository: Arc<dyn EmbeddingRepository>) -> Self {
        Self { repository }
    }
}

#[async_trait]
impl VectorSearch for BruteForceSearch {
    async fn nearest(
        &self,
        owner_id: &str,
        entity_id: &str,
        query: &[f32],
        k: usize,
    ) -> Result<Vec<SearchHit>> {
        let items = self.repository.find_embedded_items(owner_id, entity_id).await?;
        if items.is_empty() {
            return Ok(Vec::new());
        }

        let mut scored: Vec<(f32, EmbeddedItem)> = items
            .into_iter()
            .map(|item| {
                if item.embedding.len() != query.len() {
                    warn!(
                        "Embedding dimension mismatch for item {}: {} vs {}",
                        item.id,
                        item.embedding.len(),
                        query.len()
                    );
                }
                (cosine_similarity(query, &item.embedding), item)
            })
            .collect();

        scored.sort_by(|(sa, a), (sb, b)| {
            sb.partial_cmp(sa)
                .unwrap_or(Ordering::Equal)
                .then_with(|| b.metadata.timestamp.cmp(&a.metadata.timestamp))
        });
        scored.truncate(k);

        Ok(scored
            .into_iter()
            .map(|(similarity, item)| SearchHit::from_item(item, similarity))
            .collect())
    }
}

/// Embedding-backed store and query surface
pub struct SimilarityIndex {
    embedder: Arc<dyn Embedder>,
    repository: Arc<dyn EmbeddingRepository>,
    search: Arc<dyn VectorSearch>,
    max_k: usize,
}

impl SimilarityIndex {
    /// Create an index using brute-force search over `repository`
    pub fn new(embedder: Arc<dyn Embedder>, repository: Arc<dyn EmbeddingRepository>, max_k: usize) -> Self {
        let search = Arc::new(BruteForceSearch::new(repository.clone()));
        Self::with_search(embedder, repository, search, max_k)
    }

    /// Create an index with a custom nearest-neighbor backend
    pub fn with_search(
        embedder: Arc<dyn Embedder>,
        repository: Arc<dyn EmbeddingRepository>,
        search: Arc<dyn VectorSearch>,
        max_k: usize,
    ) -> Self {
        Self {
            embedder,
            repository,
            search,
            max_k,
        }
    }

    /// Embed and store one piece of content
    ///
    /// Nothing is stored when embedding fails. Identical content stored twice
    /// yields two items.
    pub async fn store(
        &self,
        owner_id: &str,
        entity_id: &str,
        content_type: ContentType,
        text: &str,
        metadata: ItemMetadata,
    ) -> Result<EmbeddedItem> {
        let embedding = self.embedder.embed(text).await?;
        let item = EmbeddedItem::new(owner_id, entity_id, content_type, text, embedding, metadata);
        self.repository.insert_embedded_item(item.clone()).await?;
        debug!(
            "Stored {} item {} for entity {}",
            content_type.as_str(),
            item.id,
            entity_id
        );
        Ok(item)
    }

    /// Top-`k` items of an entity most similar to `query_text`
    pub async fn query(
        &self,
        owner_id: &str,
        entity_id: &str,
        query_text: &str,
        k: usize,
    ) -> Result<Vec<SearchHit>> {
        if query_text.trim().is_empty() {
            return Err(ChatError::Validation("Query cannot be empty".to_string()));
        }
        if k == 0 || k > self.max_k {
            return Err(ChatError::Validation(format!(
                "k must be between 1 and {}",
                self.max_k
            )));
        }

        let query = match self.embedder.embed(query_text).await {
            Ok(query) => query,
            Err(e) => {
                METRICS.record_similarity_query(false);
                return Err(e.into());
            }
        };

        let hits = self.search.nearest(owner_id, entity_id, &query, k).await;
        METRICS.record_similarity_query(hits.is_ok());
        hits
    }

    /// Index an entity's note, recent activities and recent messages
    pub async fn index_entity(
        &self,
        owner_id: &str,
        entity_id: &str,
        snapshot: &EntitySnapshot,
    ) -> Result<usize> {
        let mut stored = 0;

        if let Some(note) = snapshot.note.as_deref().filter(|n| !n.trim().is_empty()) {
            let metadata = ItemMetadata::new("contact_note").with_tags(snapshot.tags.clone());
            self.store(owner_id, entity_id, ContentType::Note, note, metadata)
                .await?;
            stored += 1;
        }

        for activity in snapshot.activities.iter().take(MAX_INDEXED_PER_KIND) {
            let text = format!("{}: {}", activity.activity_type, activity.details);
            let metadata =
                ItemMetadata::new("activity_log").with_tags(vec![activity.activity_type.clone()]);
            self.store(owner_id, entity_id, ContentType::Activity, &text, metadata)
                .await?;
            stored += 1;
        }

        for message in snapshot.messages.iter().take(MAX_INDEXED_PER_KIND) {
            let text = format!("Previous message: {}", message.content);
            let metadata =
                ItemMetadata::new("message_history").with_tags(vec![message.status.clone()]);
            self.store(owner_id, entity_id, ContentType::MessageHistory, &text, metadata)
                .await?;
            stored += 1;
        }

        info!("Indexed {} items for entity {}", stored, entity_id);
        Ok(stored)
    }

    /// Latest `limit` items of one kind, newest first
    pub async fn recent_items(
        &self,
        owner_id: &str,
        entity_id: &str,
        content_type: ContentType,
        limit: usize,
    ) -> Result<Vec<EmbeddedItem>> {
        let mut items: Vec<EmbeddedItem> = self
            .repository
            .find_embedded_items(owner_id, entity_id)
            .await?
            .into_iter()
            .filter(|item| item.content_type == content_type)
            .collect();
        items.sort_by(|a, b| b.metadata.timestamp.cmp(&a.metadata.timestamp));
        items.truncate(limit);
        Ok(items)
    }

    /// Remove every item of an entity
    pub async fn delete_entity(&self, owner_id: &str, entity_id: &str) -> Result<usize> {
        let removed = self.repository.delete_entity_items(owner_id, entity_id).await?;
        info!("Removed {} items for entity {}", removed, entity_id);
        Ok(removed)
    }
}
