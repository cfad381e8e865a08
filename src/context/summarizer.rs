//! Rolling conversation summarization
//!
//! Keeps the generation input of a conversation under a token threshold by
//! folding older turns into a cumulative summary. The newest turn is never
//! summarized away.

use super::models::{ConversationContext, ConversationTurn};
use super::token_estimator::TokenEstimator;
use crate::metrics::METRICS;
use crate::providers::TextGenerator;
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info, warn};

const DEFAULT_SUMMARY_PROMPT: &str = "Summarize the following conversation in a concise way that captures \
the key points, decisions, and context that would be useful for future interactions. Focus on:
- Main topics discussed
- Key decisions or agreements made
- Important context or background information
- Any action items or follow-ups needed";

/// Summarizer settings
#[derive(Debug, Clone)]
pub struct SummarizerConfig {
    pub summary_prompt: String,
    pub max_summary_tokens: usize,
    pub temperature: f32,
}

impl Default for SummarizerConfig {
    fn default() -> Self {
        Self {
            summary_prompt: DEFAULT_SUMMARY_PROMPT.to_string(),
            max_summary_tokens: 500,
            temperature: 0.3,
        }
    }
}

/// What a reconcile pass did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Context already fit under the threshold
    Unchanged,
    /// A single turn exceeds the threshold on its own; kept as-is
    Overflow { total_tokens: usize },
    /// Older turns were folded into the summary
    Summarized {
        summarized_turns: usize,
        /// The generator failed and a placeholder summary was used
        fallback: bool,
    },
}

/// Summarizer errors
///
/// Only produced internally; [`ContextSummarizer::reconcile`] absorbs them.
#[derive(Debug, thiserror::Error)]
pub enum SummarizerError {
    #[error("Generation error: {0}")]
    Generation(#[from] crate::providers::GenerationError),

    #[error("Summary was empty")]
    EmptySummary,
}

/// Token-budgeted context summarizer
pub struct ContextSummarizer {
    generator: Arc<dyn TextGenerator>,
    estimator: Arc<dyn TokenEstimator>,
    config: SummarizerConfig,
}

impl ContextSummarizer {
    pub fn new(
        generator: Arc<dyn TextGenerator>,
        estimator: Arc<dyn TokenEstimator>,
        config: SummarizerConfig,
    ) -> Self {
        Self {
            generator,
            estimator,
            config,
        }
    }

    /// Estimated size of the summary plus unsummarized turns
    pub fn context_tokens(&self, context: &ConversationContext) -> usize {
        self.estimator.estimate(&context.summary)
            + self.estimator.estimate_turns(&context.unsummarized_turns)
    }

    /// Bring `context` under `token_threshold`, summarizing at most once
    pub async fn reconcile(
        &self,
        context: &mut ConversationContext,
        token_threshold: usize,
    ) -> ReconcileOutcome {
        let total_tokens = self.context_tokens(context);
        METRICS.record_context_tokens(total_tokens);

        if total_tokens <= token_threshold {
            return ReconcileOutcome::Unchanged;
        }

        let Some(latest) = context.unsummarized_turns.last().cloned() else {
            // Only the summary itself is over budget; nothing left to fold in
            return ReconcileOutcome::Overflow { total_tokens };
        };

        let to_summarize_len = context.unsummarized_turns.len() - 1;
        if to_summarize_len == 0 {
            debug!(
                "Single turn of {} tokens exceeds threshold {}, keeping it",
                total_tokens, token_threshold
            );
            METRICS.record_summarization("overflow");
            return ReconcileOutcome::Overflow { total_tokens };
        }

        let to_summarize = &context.unsummarized_turns[..to_summarize_len];
        info!(
            "Context at {} tokens exceeds threshold {}, summarizing {} turns",
            total_tokens, token_threshold, to_summarize_len
        );

        let (summary, fallback) = match self.summarize(&context.summary, to_summarize).await {
            Ok(summary) => {
                METRICS.record_summarization("success");
                (summary, false)
            }
            Err(e) => {
                warn!("Summarization failed, using placeholder summary: {}", e);
                METRICS.record_summarization("fallback");
                (placeholder_summary(&context.summary, to_summarize_len), true)
            }
        };

        context.summary_token_count = self.estimator.estimate(&summary);
        context.summary = summary;
        context.unsummarized_turns = vec![latest];
        context.last_summarized_at = Some(Utc::now());

        debug!(
            "Context reduced to {} tokens",
            self.context_tokens(context)
        );

        ReconcileOutcome::Summarized {
            summarized_turns: to_summarize_len,
            fallback,
        }
    }

    async fn summarize(
        &self,
        previous_summary: &str,
        turns: &[ConversationTurn],
    ) -> Result<String, SummarizerError> {
        let prompt = self.build_prompt(previous_summary, turns);
        let summary = self
            .generator
            .generate_text(&prompt, self.config.max_summary_tokens, self.config.temperature)
            .await?;

        let summary = summary.trim();
        if summary.is_empty() {
            return Err(SummarizerError::EmptySummary);
        }
        Ok(summary.to_string())
    }

    /// Build the summarization prompt
    ///
    /// With a previous summary the model is asked to merge it with the new
    /// turns so earlier context survives.
    pub fn build_prompt(&self, previous_summary: &str, turns: &[ConversationTurn]) -> String {
        let mut prompt = self.config.summary_prompt.clone();

        if !previous_summary.is_empty() {
            prompt.push_str(&format!(
                "\n\nNote: There is already a previous summary: \"{}\". Please create a new \
                comprehensive summary that incorporates both the previous summary and the new \
                conversation content.",
                previous_summary
            ));
        }

        let conversation = turns
            .iter()
            .map(ConversationTurn::render)
            .collect::<Vec<_>>()
            .join("\n");

        format!("{}\n\nConversation:\n{}", prompt, conversation)
    }
}

/// Deterministic summary used when the generator fails
fn placeholder_summary(previous_summary: &str, turn_count: usize) -> String {
    if previous_summary.is_empty() {
        format!("Previous conversation with {} messages.", turn_count)
    } else {
        format!(
            "{}\nPrevious conversation with {} additional messages.",
            previous_summary, turn_count
        )
    }
}
