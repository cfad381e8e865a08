//! Conversational AI orchestration
//!
//! Routes generation across prioritized providers with fallback and a
//! circuit breaker, keeps each conversation under a token budget with a
//! rolling summary, and retrieves per-entity history by embedding
//! similarity.

pub mod api;
pub mod chat;
pub mod config;
pub mod context;
pub mod error;
pub mod metrics;
pub mod persistence;
pub mod providers;
pub mod similarity;

pub use error::{ChatError, Result};
