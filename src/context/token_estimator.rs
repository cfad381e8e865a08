//! Token estimation

use super::models::ConversationTurn;
use std::sync::Arc;
use tiktoken_rs::{cl100k_base, CoreBPE};

/// Token estimator trait for different tokenization strategies
pub trait TokenEstimator: Send + Sync {
    /// Estimate the number of tokens in the given text
    fn estimate(&self, text: &str) -> usize;

    /// Estimate a single turn, rendered as `"<sender>: <text>"`
    fn estimate_turn(&self, turn: &ConversationTurn) -> usize {
        self.estimate(&turn.render())
    }

    /// Estimate a sequence of turns
    fn estimate_turns(&self, turns: &[ConversationTurn]) -> usize {
        turns.iter().map(|t| self.estimate_turn(t)).sum()
    }
}

/// Character-ratio estimator (~4 characters per token)
#[derive(Debug, Clone)]
pub struct CharRatioEstimator {
    chars_per_token: usize,
}

impl CharRatioEstimator {
    pub fn new(chars_per_token: usize) -> Self {
        Self {
            chars_per_token: chars_per_token.max(1),
        }
    }
}

impl Default for CharRatioEstimator {
    fn default() -> Self {
        Self::new(4)
    }
}

impl TokenEstimator for CharRatioEstimator {
    fn estimate(&self, text: &str) -> usize {
        text.chars().count().div_ceil(self.chars_per_token)
    }
}

/// Tiktoken-based token estimator using cl100k_base (GPT-4, GPT-3.5-turbo)
pub struct TiktokenEstimator {
    bpe: Arc<CoreBPE>,
}

impl TiktokenEstimator {
    /// Create a new tiktoken estimator with cl100k_base encoding
    pub fn new() -> Result<Self, EstimatorError> {
        let bpe = cl100k_base().map_err(|e| EstimatorError(e.to_string()))?;
        Ok(Self { bpe: Arc::new(bpe) })
    }
}

impl TokenEstimator for TiktokenEstimator {
    fn estimate(&self, text: &str) -> usize {
        self.bpe.encode_with_special_tokens(text).len()
    }
}

/// Failure to load a tokenizer
#[derive(Debug, thiserror::Error)]
#[error("Failed to initialize tokenizer: {0}")]
pub struct EstimatorError(String);

/// Build the estimator named in configuration
pub fn estimator_from_name(name: &str) -> Result<Arc<dyn TokenEstimator>, EstimatorError> {
    match name {
        "tiktoken" => Ok(Arc::new(TiktokenEstimator::new()?)),
        "char_ratio" => Ok(Arc::new(CharRatioEstimator::default())),
        other => Err(EstimatorError(format!("unknown estimator '{}'", other))),
    }
}
