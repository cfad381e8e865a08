//! End-to-end turn tests against stub generation backends

use async_trait::async_trait;
use chat_orchestrator::{
    chat::{NoBusinessContext, OrchestratorConfig, SendMessageRequest, TurnEvent, TurnOrchestrator, TurnStream},
    context::{
        CharRatioEstimator, ContextSummarizer, Conversation, ConversationTurn, ModelMetadata,
        Sender, SummarizerConfig,
    },
    persistence::{ConversationRepository, InMemoryStore},
    providers::{
        BreakerPolicy, ChatRole, GenerationBackend, GenerationError, GenerationRequest,
        GenerationRouter, ProviderDescriptor, ProviderRegistry, RouterTextGenerator, TextStream,
    },
    ChatError,
};
use futures::{stream, StreamExt};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const SUMMARY: &str = "User asked about nine things";

/// Records every request; answers summaries and chat turns differently
struct RecordingBackend {
    fail_with: Option<&'static str>,
    requests: Mutex<Vec<GenerationRequest>>,
}

impl RecordingBackend {
    fn healthy() -> Arc<Self> {
        Arc::new(Self {
            fail_with: None,
            requests: Mutex::new(Vec::new()),
        })
    }

    fn failing(cause: &'static str) -> Arc<Self> {
        Arc::new(Self {
            fail_with: Some(cause),
            requests: Mutex::new(Vec::new()),
        })
    }

    fn requests(&self) -> Vec<GenerationRequest> {
        self.requests.lock().unwrap().clone()
    }

    fn summary_calls(&self) -> usize {
        self.requests()
            .iter()
            .filter(|r| r.messages.len() == 1 && r.messages[0].role == ChatRole::User)
            .count()
    }
}

#[async_trait]
impl GenerationBackend for RecordingBackend {
    async fn invoke(&self, request: &GenerationRequest) -> Result<TextStream, GenerationError> {
        self.requests.lock().unwrap().push(request.clone());
        if let Some(cause) = self.fail_with {
            return Err(GenerationError::provider("stub", cause));
        }

        let is_summary = request.messages.len() == 1;
        let chunks: Vec<Result<String, GenerationError>> = if is_summary {
            vec![Ok(SUMMARY.to_string())]
        } else {
            vec![Ok("Sure, ".to_string()), Ok("here you go.".to_string())]
        };
        Ok(Box::pin(stream::iter(chunks)))
    }
}

/// Starts a stream and never sends a chunk
struct StalledBackend;

#[async_trait]
impl GenerationBackend for StalledBackend {
    async fn invoke(&self, _request: &GenerationRequest) -> Result<TextStream, GenerationError> {
        Ok(Box::pin(stream::pending::<Result<String, GenerationError>>()))
    }
}

/// Echoes the last prompt message back, one slow chunk at a time
struct SlowEchoBackend;

#[async_trait]
impl GenerationBackend for SlowEchoBackend {
    async fn invoke(&self, request: &GenerationRequest) -> Result<TextStream, GenerationError> {
        let last = request
            .messages
            .last()
            .map(|m| m.content.clone())
            .unwrap_or_default();
        let chunks = vec!["re: ".to_string(), last];
        Ok(Box::pin(stream::iter(chunks).then(|chunk| async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            Ok::<_, GenerationError>(chunk)
        })))
    }
}

struct Harness {
    orchestrator: TurnOrchestrator,
    registry: Arc<ProviderRegistry>,
    store: Arc<InMemoryStore>,
}

fn harness(primary: Arc<RecordingBackend>, secondary: Arc<RecordingBackend>) -> Harness {
    harness_with(primary, secondary, Duration::from_secs(5))
}

fn harness_with(
    primary: Arc<dyn GenerationBackend>,
    secondary: Arc<dyn GenerationBackend>,
    call_timeout: Duration,
) -> Harness {
    let registry = Arc::new(
        ProviderRegistry::new(
            vec![
                ProviderDescriptor {
                    name: "primary".to_string(),
                    models: vec!["m1".to_string()],
                    priority: 1,
                    enabled: true,
                },
                ProviderDescriptor {
                    name: "secondary".to_string(),
                    models: vec!["m2".to_string()],
                    priority: 2,
                    enabled: true,
                },
            ],
            BreakerPolicy::default(),
        )
        .unwrap(),
    );

    let router = Arc::new(
        GenerationRouter::new(registry.clone(), call_timeout)
            .with_backend("primary", primary)
            .with_backend("secondary", secondary),
    );
    let summarizer = Arc::new(ContextSummarizer::new(
        Arc::new(RouterTextGenerator::new(router.clone(), "m1")),
        Arc::new(CharRatioEstimator::default()),
        SummarizerConfig::default(),
    ));
    let store = Arc::new(InMemoryStore::new());
    let config = OrchestratorConfig {
        default_model: "m1".to_string(),
        token_threshold: 4000,
        rate_limit_max_sends: 100,
        ..Default::default()
    };

    Harness {
        orchestrator: TurnOrchestrator::new(
            router,
            summarizer,
            store.clone(),
            Arc::new(NoBusinessContext),
            config,
        ),
        registry,
        store,
    }
}

fn request(conversation_id: &str, text: &str, model: Option<&str>) -> SendMessageRequest {
    SendMessageRequest {
        user_id: "u1".to_string(),
        conversation_id: conversation_id.to_string(),
        text: text.to_string(),
        model_id: model.map(str::to_string),
    }
}

async fn finish(mut turn: TurnStream) -> (String, TurnEvent) {
    let mut text = String::new();
    let mut last = None;
    while let Some(event) = turn.events.recv().await {
        match event {
            TurnEvent::Chunk(chunk) => text.push_str(&chunk),
            other => last = Some(other),
        }
    }
    (text, last.expect("turn ended without a final event"))
}

/// Nine alternating turns of roughly 500 estimated tokens each
fn long_conversation() -> Conversation {
    let mut conversation = Conversation::new("u1", "long");
    let metadata = ModelMetadata {
        provider: "primary".to_string(),
        model: "m1".to_string(),
    };
    for i in 0..9 {
        let text = format!("{} {}", i, "x".repeat(1996));
        let turn = if i % 2 == 0 {
            ConversationTurn::user(text)
        } else {
            ConversationTurn::assistant(text, metadata.clone())
        };
        conversation.history.push(turn.clone());
        conversation.context.unsummarized_turns.push(turn);
    }
    conversation
}

#[tokio::test]
async fn test_tenth_turn_triggers_single_summarization() {
    let primary = RecordingBackend::healthy();
    let h = harness(primary.clone(), RecordingBackend::healthy());
    h.store.save_conversation(&long_conversation()).await.unwrap();

    let turn = h
        .orchestrator
        .send_message(request("long", "What should I do next?", None))
        .await
        .unwrap();
    let (text, last) = finish(turn).await;
    assert_eq!(text, "Sure, here you go.");
    assert!(matches!(last, TurnEvent::Completed(_)));

    assert_eq!(primary.summary_calls(), 1);

    // Generation saw the summary plus only the pending user turn
    let requests = primary.requests();
    let chat = requests.last().unwrap();
    assert_eq!(chat.messages.len(), 3);
    assert_eq!(chat.messages[0].role, ChatRole::System);
    assert_eq!(
        chat.messages[1].content,
        format!("[Previous conversation summary: {}]", SUMMARY)
    );
    assert_eq!(chat.messages[2].role, ChatRole::User);
    assert_eq!(chat.messages[2].content, "What should I do next?");

    let stored = h.store.find_conversation("u1", "long").await.unwrap().unwrap();
    assert_eq!(stored.context.summary, SUMMARY);
    assert_eq!(stored.context.unsummarized_turns.len(), 2);
    assert_eq!(stored.context.unsummarized_turns[0].text, "What should I do next?");
    assert_eq!(stored.history.len(), 11);
    assert!(stored.context.last_summarized_at.is_some());
}

#[tokio::test]
async fn test_short_conversation_is_not_summarized() {
    let primary = RecordingBackend::healthy();
    let h = harness(primary.clone(), RecordingBackend::healthy());

    for text in ["Hello", "Any updates?", "Thanks"] {
        let turn = h
            .orchestrator
            .send_message(request("short", text, None))
            .await
            .unwrap();
        finish(turn).await;
    }

    assert_eq!(primary.summary_calls(), 0);
    let stored = h.orchestrator.conversation("u1", "short").await.unwrap().unwrap();
    assert!(stored.context.summary.is_empty());
    assert_eq!(stored.context.unsummarized_turns.len(), 6);
}

#[tokio::test]
async fn test_disabled_primary_is_never_attempted() {
    let primary = RecordingBackend::healthy();
    let secondary = RecordingBackend::healthy();
    let h = harness(primary.clone(), secondary.clone());
    h.registry.disable("primary");

    let turn = h
        .orchestrator
        .send_message(request("c1", "Hi", Some("m1")))
        .await
        .unwrap();
    assert_eq!(turn.provider, "secondary");
    assert_eq!(turn.model, "m2");
    let (_, last) = finish(turn).await;

    match last {
        TurnEvent::Completed(pair) => {
            let metadata = pair.assistant.model_metadata.unwrap();
            assert_eq!(metadata.model, "m2");
        }
        other => panic!("unexpected final event: {:?}", other),
    }
    assert!(primary.requests().is_empty());
    assert_eq!(secondary.requests().len(), 1);
}

#[tokio::test]
async fn test_breaker_disables_primary_after_three_quota_failures() {
    let primary = RecordingBackend::failing("insufficient_quota");
    let secondary = RecordingBackend::healthy();
    let h = harness(primary.clone(), secondary.clone());

    for i in 0..4 {
        let turn = h
            .orchestrator
            .send_message(request(&format!("c{}", i), "Hi", None))
            .await
            .unwrap();
        assert_eq!(turn.model, "m2");
        finish(turn).await;
    }

    // Fourth turn skipped the disabled primary
    assert_eq!(primary.requests().len(), 3);
    assert_eq!(secondary.requests().len(), 4);
    assert!(!h.registry.is_enabled("primary"));

    assert!(h.registry.enable("primary"));
    assert_eq!(h.registry.consecutive_failures("primary"), 0);
}

#[tokio::test]
async fn test_all_providers_failing_leaves_history_untouched() {
    let h = harness(
        RecordingBackend::failing("HTTP 500: upstream exploded"),
        RecordingBackend::failing("HTTP 502: bad gateway"),
    );

    let err = h
        .orchestrator
        .send_message(request("c1", "Hi", None))
        .await
        .unwrap_err();
    match err {
        ChatError::AllProvidersFailed { attempted } => assert_eq!(attempted, vec!["m1", "m2"]),
        other => panic!("unexpected error: {:?}", other),
    }

    let stored = h.store.find_conversation("u1", "c1").await.unwrap().unwrap();
    assert!(stored.history.is_empty());
    assert!(stored.context.unsummarized_turns.is_empty());

    // Non-quota failures never trip the breaker
    assert!(h.registry.is_enabled("primary"));
    assert!(h.registry.is_enabled("secondary"));
}

#[tokio::test]
async fn test_stalled_stream_releases_the_conversation() {
    let h = harness_with(
        Arc::new(StalledBackend),
        RecordingBackend::healthy(),
        Duration::from_millis(100),
    );

    let first = h
        .orchestrator
        .send_message(request("c1", "Hi", None))
        .await
        .unwrap();
    drop(first);

    let second = tokio::time::timeout(
        Duration::from_secs(2),
        h.orchestrator.send_message(request("c1", "Again", None)),
    )
    .await
    .expect("conversation stayed locked behind a stalled stream")
    .unwrap();
    let (text, last) = finish(second).await;
    assert!(text.is_empty());
    assert!(matches!(last, TurnEvent::Failed(_)));

    let stored = h.store.find_conversation("u1", "c1").await.unwrap().unwrap();
    assert!(stored.history.is_empty());

    let deleted = tokio::time::timeout(
        Duration::from_secs(2),
        h.orchestrator.delete_conversation("u1", "c1"),
    )
    .await
    .expect("delete stayed locked behind a stalled stream")
    .unwrap();
    assert!(deleted);
}

#[tokio::test]
async fn test_concurrent_turns_on_one_conversation_are_serialized() {
    let h = harness_with(
        Arc::new(SlowEchoBackend),
        RecordingBackend::healthy(),
        Duration::from_secs(5),
    );

    let (a, b) = tokio::join!(
        h.orchestrator.send_message(request("c1", "first", None)),
        h.orchestrator.send_message(request("c1", "second", None)),
    );
    let (a, b) = tokio::join!(finish(a.unwrap()), finish(b.unwrap()));
    assert!(matches!(a.1, TurnEvent::Completed(_)));
    assert!(matches!(b.1, TurnEvent::Completed(_)));

    let stored = h.store.find_conversation("u1", "c1").await.unwrap().unwrap();
    assert_eq!(stored.history.len(), 4);

    let senders: Vec<Sender> = stored.history.iter().map(|t| t.sender).collect();
    assert_eq!(
        senders,
        vec![Sender::User, Sender::Assistant, Sender::User, Sender::Assistant]
    );

    // Each answer follows its own question, and neither exchange was lost
    for pair in stored.history.chunks(2) {
        assert_eq!(pair[1].text, format!("re: {}", pair[0].text));
    }
    let mut asked: Vec<&str> = stored
        .history
        .iter()
        .filter(|t| t.sender == Sender::User)
        .map(|t| t.text.as_str())
        .collect();
    asked.sort();
    assert_eq!(asked, vec!["first", "second"]);
    assert_eq!(stored.context.unsummarized_turns.len(), 4);
}
