//! Conversation context management with token-budgeted summarization
//!
//! This module keeps the generation input of every conversation under a
//! configurable token threshold while the full turn log stays intact.

pub mod models;
pub mod summarizer;
pub mod token_estimator;

pub use models::{
    ContextState, Conversation, ConversationContext, ConversationSummary, ConversationTurn,
    ModelMetadata, Sender,
};
pub use summarizer::{ContextSummarizer, ReconcileOutcome, SummarizerConfig, SummarizerError};
pub use token_estimator::{estimator_from_name, CharRatioEstimator, TiktokenEstimator, TokenEstimator};
