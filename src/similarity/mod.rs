//! Semantic retrieval of per-entity history
//!
//! Notes, activities and message history are embedded and stored per
//! (owner, entity). Queries rank them by cosine similarity.

pub mod embedder;
pub mod index;
pub mod models;

pub use embedder::{CachedEmbedder, Embedder, EmbedderConfig, EmbeddingError, OpenAiEmbedder};
pub use index::{cosine_similarity, BruteForceSearch, SimilarityIndex, VectorSearch};
pub use models::{
    ActivityRecord, ContentType, EmbeddedItem, EntitySnapshot, ItemMetadata, MessageRecord,
    SearchHit, SearchRequest, SearchResponse,
};
