//! Turn orchestrator
//!
//! Runs one conversation turn end to end: validation, rate limiting,
//! context reconciliation, prompt assembly, routed generation, streaming
//! and persistence. Turns of the same conversation are serialized.

use super::prompt::{assemble_prompt, build_system_prompt, BusinessContextSource};
use super::rate_limiter::RateLimiter;
use crate::{
    context::{
        ContextSummarizer, Conversation, ConversationContext, ConversationSummary,
        ConversationTurn, ModelMetadata, ReconcileOutcome,
    },
    error::{ChatError, Result},
    metrics::METRICS,
    persistence::ConversationRepository,
    providers::{GenerationParams, GenerationRouter, TextStream},
};
use dashmap::DashMap;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, OwnedMutexGuard};
use tracing::{debug, error, info, warn};

const EVENT_BUFFER: usize = 64;
const TITLE_CHARS: usize = 50;
const MAX_TITLE_CHARS: usize = 100;

/// Orchestrator settings
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub default_model: String,
    pub token_threshold: usize,
    pub recent_without_summary: usize,
    pub recent_with_summary: usize,
    pub temperature: f32,
    pub max_tokens: usize,
    pub rate_limit_max_sends: usize,
    pub rate_limit_min_gap: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            default_model: "gpt-4o-mini".to_string(),
            token_threshold: 4000,
            recent_without_summary: 8,
            recent_with_summary: 3,
            temperature: 0.7,
            max_tokens: 1000,
            rate_limit_max_sends: 5,
            rate_limit_min_gap: Duration::from_secs(10),
        }
    }
}

/// Incoming user message
#[derive(Debug, Clone, Deserialize)]
pub struct SendMessageRequest {
    pub user_id: String,
    pub conversation_id: String,
    pub text: String,
    #[serde(default)]
    pub model_id: Option<String>,
}

/// The user turn and the assistant turn persisted for a completed exchange
#[derive(Debug, Clone, Serialize)]
pub struct TurnPair {
    pub user: ConversationTurn,
    pub assistant: ConversationTurn,
}

/// Events emitted while a turn streams
#[derive(Debug, Clone)]
pub enum TurnEvent {
    /// Next piece of generated text
    Chunk(String),
    /// The exchange was persisted
    Completed(TurnPair),
    /// Generation stopped without a usable answer; nothing was persisted
    Failed(String),
}

/// A started turn
///
/// `provider` and `model` name the backend that actually answered, which can
/// differ from the requested model after a fallback.
#[derive(Debug)]
pub struct TurnStream {
    pub provider: String,
    pub model: String,
    pub events: mpsc::Receiver<TurnEvent>,
}

type ConversationKey = (String, String);
type LockTable = DashMap<ConversationKey, Arc<Mutex<()>>>;

/// Exclusive hold on one conversation
///
/// Dropping it releases the mutex and removes the table entry once nobody
/// else holds or waits on it.
struct ConversationLock {
    key: ConversationKey,
    locks: Arc<LockTable>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for ConversationLock {
    fn drop(&mut self) {
        drop(self.guard.take());
        self.locks
            .remove_if(&self.key, |_, lock| Arc::strong_count(lock) == 1);
    }
}

/// Coordinates a conversation turn across the summarizer, router and store
pub struct TurnOrchestrator {
    router: Arc<GenerationRouter>,
    summarizer: Arc<ContextSummarizer>,
    conversations: Arc<dyn ConversationRepository>,
    business: Arc<dyn BusinessContextSource>,
    rate_limiter: RateLimiter,
    locks: Arc<LockTable>,
    config: OrchestratorConfig,
}

impl TurnOrchestrator {
    pub fn new(
        router: Arc<GenerationRouter>,
        summarizer: Arc<ContextSummarizer>,
        conversations: Arc<dyn ConversationRepository>,
        business: Arc<dyn BusinessContextSource>,
        config: OrchestratorConfig,
    ) -> Self {
        let rate_limiter = RateLimiter::new(config.rate_limit_max_sends, config.rate_limit_min_gap);
        Self {
            router,
            summarizer,
            conversations,
            business,
            rate_limiter,
            locks: Arc::new(DashMap::new()),
            config,
        }
    }

    pub fn router(&self) -> &Arc<GenerationRouter> {
        &self.router
    }

    /// Start a turn and return its event stream
    ///
    /// Errors returned here mean no assistant turn was produced. Once a
    /// [`TurnStream`] is returned, generation runs to completion even if the
    /// receiver is dropped.
    pub async fn send_message(&self, request: SendMessageRequest) -> Result<TurnStream> {
        let text = request.text.trim();
        if text.is_empty() {
            return Err(ChatError::Validation("Message is required".to_string()));
        }
        if request.user_id.trim().is_empty() {
            return Err(ChatError::Validation("User ID is required".to_string()));
        }
        if request.conversation_id.trim().is_empty() {
            return Err(ChatError::Validation("Conversation ID is required".to_string()));
        }

        let model = request
            .model_id
            .clone()
            .filter(|m| !m.trim().is_empty())
            .unwrap_or_else(|| self.config.default_model.clone());
        let registry = self.router.registry();
        if registry.owner_of(&model).is_none() {
            return Err(ChatError::UnknownModel(model));
        }
        if registry.provider_for_model(&model).is_err() {
            info!("Provider for {} is disabled, routing to fallbacks", model);
        }

        self.rate_limiter.check(&request.user_id)?;

        let lock = self.lock(&request.user_id, &request.conversation_id).await;

        let mut conversation = self
            .conversations
            .find_conversation(&request.user_id, &request.conversation_id)
            .await?
            .unwrap_or_else(|| Conversation::new(&request.user_id, &request.conversation_id));

        let user_turn = ConversationTurn::user(text);
        let mut context = conversation.context.clone();
        context.unsummarized_turns.push(user_turn.clone());

        match self
            .summarizer
            .reconcile(&mut context, self.config.token_threshold)
            .await
        {
            ReconcileOutcome::Summarized {
                summarized_turns,
                fallback,
            } => {
                debug!(
                    "Conversation {} summarized {} turns (fallback: {})",
                    request.conversation_id, summarized_turns, fallback
                );
            }
            ReconcileOutcome::Overflow { total_tokens } => {
                warn!(
                    "Conversation {} context overflows at {} tokens",
                    request.conversation_id, total_tokens
                );
            }
            ReconcileOutcome::Unchanged => {}
        }

        let snapshot = self.business.snapshot(&request.user_id).await;
        let system_prompt = build_system_prompt(snapshot.as_ref());
        let params = GenerationParams {
            messages: assemble_prompt(
                &system_prompt,
                &context,
                self.config.recent_without_summary,
                self.config.recent_with_summary,
            ),
            temperature: self.config.temperature,
            max_tokens: self.config.max_tokens,
        };

        let generation = match self.router.generate(&model, &params).await {
            Ok(generation) => generation,
            Err(e) => {
                // Keep the reconciled summary, drop the unanswered user turn
                conversation.context = without_pending(context);
                if let Err(save_err) = self.conversations.save_conversation(&conversation).await {
                    error!("Failed to persist context after generation failure: {}", save_err);
                }
                METRICS.record_turn("failed");
                return Err(e.into());
            }
        };

        info!(
            "Turn for conversation {} streaming from {}/{}",
            request.conversation_id, generation.provider, generation.model
        );

        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let turn = PendingTurn {
            router: self.router.clone(),
            conversations: self.conversations.clone(),
            conversation,
            context,
            user_turn,
            metadata: ModelMetadata {
                provider: generation.provider.clone(),
                model: generation.model.clone(),
            },
        };
        let chunks = generation.chunks;
        tokio::spawn(async move {
            let last = turn.run(chunks, &tx).await;
            drop(lock);
            let _ = tx.send(last).await;
        });

        Ok(TurnStream {
            provider: generation.provider,
            model: generation.model,
            events: rx,
        })
    }

    /// Full stored conversation, including the display log
    pub async fn conversation(
        &self,
        owner_id: &str,
        conversation_id: &str,
    ) -> Result<Option<Conversation>> {
        Ok(self
            .conversations
            .find_conversation(owner_id, conversation_id)
            .await?)
    }

    /// Listing of an owner's conversations, most recently updated first
    pub async fn list_conversations(&self, owner_id: &str) -> Result<Vec<ConversationSummary>> {
        let conversations = self.conversations.list_conversations(owner_id).await?;
        Ok(conversations.iter().map(ConversationSummary::from).collect())
    }

    /// Rename a conversation; the title is trimmed and must be 1 to 100 chars
    pub async fn update_title(
        &self,
        owner_id: &str,
        conversation_id: &str,
        title: &str,
    ) -> Result<String> {
        let title = title.trim();
        if title.is_empty() {
            return Err(ChatError::Validation("Title is required".to_string()));
        }
        if title.chars().count() > MAX_TITLE_CHARS {
            return Err(ChatError::Validation(format!(
                "Title must be at most {} characters",
                MAX_TITLE_CHARS
            )));
        }

        let _lock = self.lock(owner_id, conversation_id).await;
        let mut conversation = self
            .conversations
            .find_conversation(owner_id, conversation_id)
            .await?
            .ok_or_else(|| ChatError::NotFound(format!("Conversation {}", conversation_id)))?;

        conversation.title = Some(title.to_string());
        conversation.updated_at = chrono::Utc::now();
        self.conversations.save_conversation(&conversation).await?;
        Ok(title.to_string())
    }

    /// Delete a conversation, waiting for any in-flight turn to finish
    pub async fn delete_conversation(&self, owner_id: &str, conversation_id: &str) -> Result<bool> {
        let _lock = self.lock(owner_id, conversation_id).await;
        Ok(self
            .conversations
            .delete_conversation(owner_id, conversation_id)
            .await?)
    }

    async fn lock(&self, owner_id: &str, conversation_id: &str) -> ConversationLock {
        let key = (owner_id.to_string(), conversation_id.to_string());
        let mutex = self.locks.entry(key.clone()).or_default().clone();
        let guard = mutex.lock_owned().await;
        ConversationLock {
            key,
            locks: self.locks.clone(),
            guard: Some(guard),
        }
    }
}

fn without_pending(mut context: ConversationContext) -> ConversationContext {
    context.unsummarized_turns.pop();
    context
}

/// State carried by the streaming task
struct PendingTurn {
    router: Arc<GenerationRouter>,
    conversations: Arc<dyn ConversationRepository>,
    conversation: Conversation,
    context: ConversationContext,
    user_turn: ConversationTurn,
    metadata: ModelMetadata,
}

impl PendingTurn {
    /// Stream chunks to `tx`, persist, and return the final event
    async fn run(mut self, mut chunks: TextStream, tx: &mpsc::Sender<TurnEvent>) -> TurnEvent {
        let mut answer = String::new();
        let mut stream_error = None;
        let mut receiver_gone = false;

        while let Some(chunk) = chunks.next().await {
            match chunk {
                Ok(chunk) => {
                    if chunk.is_empty() {
                        continue;
                    }
                    answer.push_str(&chunk);
                    if !receiver_gone && tx.send(TurnEvent::Chunk(chunk)).await.is_err() {
                        debug!("Turn receiver dropped, finishing generation in background");
                        receiver_gone = true;
                    }
                }
                Err(e) => {
                    stream_error = Some(e.to_string());
                    break;
                }
            }
        }

        let answer = answer.trim();
        let failure = match stream_error {
            Some(cause) => Some(format!(
                "{}/{} failed mid-stream: {}",
                self.metadata.provider, self.metadata.model, cause
            )),
            None if answer.is_empty() => {
                self.router.report_empty_response(&self.metadata.provider);
                Some(format!(
                    "No response received from {}/{}",
                    self.metadata.provider, self.metadata.model
                ))
            }
            None => None,
        };

        if let Some(reason) = failure {
            warn!("{}", reason);
            self.conversation.context = without_pending(self.context);
            if let Err(e) = self.conversations.save_conversation(&self.conversation).await {
                error!("Failed to persist context after failed turn: {}", e);
            }
            METRICS.record_turn("failed");
            return TurnEvent::Failed(reason);
        }

        let assistant_turn = ConversationTurn::assistant(answer, self.metadata.clone());
        self.conversation.context = without_pending(self.context);
        if self.conversation.title.is_none() {
            self.conversation.title = Some(self.user_turn.text.chars().take(TITLE_CHARS).collect());
        }
        self.conversation
            .append_exchange(self.user_turn.clone(), assistant_turn.clone());

        match self.conversations.save_conversation(&self.conversation).await {
            Ok(()) => {
                METRICS.record_turn("completed");
                debug!(
                    "Persisted turn for conversation {} ({} chars)",
                    self.conversation.conversation_id,
                    answer.len()
                );
                TurnEvent::Completed(TurnPair {
                    user: self.user_turn,
                    assistant: assistant_turn,
                })
            }
            Err(e) => {
                error!("Failed to persist completed turn: {}", e);
                METRICS.record_turn("failed");
                TurnEvent::Failed(format!("Failed to save conversation: {}", e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::prompt::NoBusinessContext;
    use crate::context::{CharRatioEstimator, SummarizerConfig};
    use crate::persistence::InMemoryStore;
    use crate::providers::{
        BreakerPolicy, GenerationBackend, GenerationError, GenerationRequest, ProviderDescriptor,
        ProviderRegistry, RouterTextGenerator,
    };
    use async_trait::async_trait;
    use futures::stream;

    /// Replies with fixed chunks, or fails every call
    struct FixedBackend {
        chunks: Vec<&'static str>,
        fail: bool,
    }

    #[async_trait]
    impl GenerationBackend for FixedBackend {
        async fn invoke(&self, _request: &GenerationRequest) -> std::result::Result<TextStream, GenerationError> {
            if self.fail {
                return Err(GenerationError::provider("primary", "insufficient_quota"));
            }
            let items: Vec<std::result::Result<String, GenerationError>> =
                self.chunks.iter().map(|c| Ok(c.to_string())).collect();
            Ok(Box::pin(stream::iter(items)))
        }
    }

    fn orchestrator(backend: FixedBackend) -> (TurnOrchestrator, Arc<InMemoryStore>) {
        let registry = Arc::new(
            ProviderRegistry::new(
                vec![ProviderDescriptor {
                    name: "primary".to_string(),
                    models: vec!["m1".to_string()],
                    priority: 1,
                    enabled: true,
                }],
                BreakerPolicy::default(),
            )
            .unwrap(),
        );
        let router = Arc::new(
            GenerationRouter::new(registry, Duration::from_secs(5))
                .with_backend("primary", Arc::new(backend)),
        );
        let summarizer = Arc::new(ContextSummarizer::new(
            Arc::new(RouterTextGenerator::new(router.clone(), "m1")),
            Arc::new(CharRatioEstimator::default()),
            SummarizerConfig::default(),
        ));
        let store = Arc::new(InMemoryStore::new());
        let config = OrchestratorConfig {
            default_model: "m1".to_string(),
            ..Default::default()
        };
        let orchestrator =
            TurnOrchestrator::new(router, summarizer, store.clone(), Arc::new(NoBusinessContext), config);
        (orchestrator, store)
    }

    fn request(text: &str) -> SendMessageRequest {
        SendMessageRequest {
            user_id: "u1".to_string(),
            conversation_id: "c1".to_string(),
            text: text.to_string(),
            model_id: None,
        }
    }

    async fn drain(mut stream: TurnStream) -> (String, Option<TurnEvent>) {
        let mut text = String::new();
        let mut last = None;
        while let Some(event) = stream.events.recv().await {
            match event {
                TurnEvent::Chunk(chunk) => text.push_str(&chunk),
                other => last = Some(other),
            }
        }
        (text, last)
    }

    #[tokio::test]
    async fn test_completed_turn_is_persisted() {
        let (orchestrator, _) = orchestrator(FixedBackend {
            chunks: vec!["Hel", "lo"],
            fail: false,
        });

        let stream = orchestrator.send_message(request("Hi there")).await.unwrap();
        assert_eq!(stream.model, "m1");
        let (text, last) = drain(stream).await;
        assert_eq!(text, "Hello");
        assert!(matches!(last, Some(TurnEvent::Completed(_))));

        let conversation = orchestrator.conversation("u1", "c1").await.unwrap().unwrap();
        assert_eq!(conversation.history.len(), 2);
        assert_eq!(conversation.history[1].text, "Hello");
        assert_eq!(conversation.context.unsummarized_turns.len(), 2);
        assert_eq!(conversation.title.as_deref(), Some("Hi there"));
    }

    #[tokio::test]
    async fn test_empty_completion_persists_nothing() {
        let (orchestrator, _) = orchestrator(FixedBackend {
            chunks: vec!["", "  "],
            fail: false,
        });

        let stream = orchestrator.send_message(request("Hi")).await.unwrap();
        let (_, last) = drain(stream).await;
        assert!(matches!(last, Some(TurnEvent::Failed(_))));

        let conversation = orchestrator.conversation("u1", "c1").await.unwrap().unwrap();
        assert!(conversation.history.is_empty());
        assert!(conversation.context.unsummarized_turns.is_empty());
        assert_eq!(orchestrator.router().registry().consecutive_failures("primary"), 1);
    }

    #[tokio::test]
    async fn test_generation_failure_surfaces_error() {
        let (orchestrator, store) = orchestrator(FixedBackend {
            chunks: Vec::new(),
            fail: true,
        });

        let err = orchestrator.send_message(request("Hi")).await.unwrap_err();
        match err {
            ChatError::AllProvidersFailed { attempted } => assert_eq!(attempted, vec!["m1"]),
            other => panic!("unexpected error: {:?}", other),
        }
        let conversation = store.find_conversation("u1", "c1").await.unwrap().unwrap();
        assert!(conversation.history.is_empty());
    }

    #[tokio::test]
    async fn test_validation_and_unknown_model() {
        let (orchestrator, _) = orchestrator(FixedBackend {
            chunks: vec!["ok"],
            fail: false,
        });

        assert!(matches!(
            orchestrator.send_message(request("   ")).await,
            Err(ChatError::Validation(_))
        ));

        let mut unknown = request("Hi");
        unknown.model_id = Some("nope".to_string());
        assert!(matches!(
            orchestrator.send_message(unknown).await,
            Err(ChatError::UnknownModel(_))
        ));
    }

    #[tokio::test]
    async fn test_rate_limit_rejects_sixth_send() {
        let (orchestrator, _) = orchestrator(FixedBackend {
            chunks: vec!["ok"],
            fail: false,
        });

        for _ in 0..5 {
            let stream = orchestrator.send_message(request("Hi")).await.unwrap();
            drain(stream).await;
        }
        assert!(matches!(
            orchestrator.send_message(request("Hi")).await,
            Err(ChatError::RateLimited { .. })
        ));
    }

    #[tokio::test]
    async fn test_dropped_receiver_still_persists() {
        let (orchestrator, _) = orchestrator(FixedBackend {
            chunks: vec!["a", "b", "c"],
            fail: false,
        });

        let stream = orchestrator.send_message(request("Hi")).await.unwrap();
        drop(stream);

        // The next turn waits on the conversation lock held by the first
        let second = orchestrator.send_message(request("Again")).await.unwrap();
        drain(second).await;

        let conversation = orchestrator.conversation("u1", "c1").await.unwrap().unwrap();
        assert_eq!(conversation.history.len(), 4);
        assert_eq!(conversation.history[1].text, "abc");
    }

    #[tokio::test]
    async fn test_lock_entries_are_released() {
        let (orchestrator, _) = orchestrator(FixedBackend {
            chunks: vec!["ok"],
            fail: false,
        });

        let stream = orchestrator.send_message(request("Hi")).await.unwrap();
        drain(stream).await;
        assert!(orchestrator.locks.is_empty());

        assert!(orchestrator.delete_conversation("u1", "c1").await.unwrap());
        assert!(orchestrator.locks.is_empty());
    }

    #[tokio::test]
    async fn test_update_title_and_list() {
        let (orchestrator, _) = orchestrator(FixedBackend {
            chunks: vec!["ok"],
            fail: false,
        });
        let stream = orchestrator.send_message(request("Hi there")).await.unwrap();
        drain(stream).await;

        let title = orchestrator
            .update_title("u1", "c1", "  Q3 pipeline  ")
            .await
            .unwrap();
        assert_eq!(title, "Q3 pipeline");

        let listed = orchestrator.list_conversations("u1").await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].title.as_deref(), Some("Q3 pipeline"));
        assert_eq!(listed[0].turn_count, 2);

        assert!(orchestrator
            .update_title("u1", "c1", &"x".repeat(100))
            .await
            .is_ok());
        assert!(matches!(
            orchestrator.update_title("u1", "c1", &"x".repeat(101)).await,
            Err(ChatError::Validation(_))
        ));
        assert!(matches!(
            orchestrator.update_title("u1", "c1", "   ").await,
            Err(ChatError::Validation(_))
        ));
        assert!(matches!(
            orchestrator.update_title("u1", "missing", "New").await,
            Err(ChatError::NotFound(_))
        ));
        assert!(orchestrator.list_conversations("u2").await.unwrap().is_empty());
    }
}
