//! Retrieval-grounded message drafting
//!
//! Drafts short outreach messages for one entity (contact). The prompt is
//! grounded on the entity's most similar indexed items and its latest
//! indexed messages, then generated through the fallback router.

use crate::{
    error::{ChatError, Result},
    providers::{ChatMessage, ChatRole, GenerationParams, GenerationRouter},
    similarity::{ContentType, SearchHit, SimilarityIndex},
};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

const MESSAGE_PREFIX: &str = "Previous message: ";

/// Drafting settings
#[derive(Debug, Clone)]
pub struct GroundingConfig {
    pub default_model: String,
    /// Similar items retrieved per request
    pub context_k: usize,
    /// Indexed messages quoted as prior outreach
    pub previous_messages: usize,
    pub max_versions: usize,
    pub temperature: f32,
    pub max_tokens: usize,
}

impl Default for GroundingConfig {
    fn default() -> Self {
        Self {
            default_model: "gpt-4o-mini".to_string(),
            context_k: 5,
            previous_messages: 3,
            max_versions: 3,
            temperature: 0.7,
            max_tokens: 500,
        }
    }
}

/// Draft request for one entity
#[derive(Debug, Clone, Deserialize)]
pub struct GroundedRequest {
    pub user_id: String,
    pub entity_id: String,
    pub prompt: String,
    /// Free-form profile lines (name, company, tags) supplied by the caller
    #[serde(default)]
    pub profile: Option<String>,
    #[serde(default)]
    pub model_id: Option<String>,
}

/// Drafted versions plus the retrieved items they were grounded on
#[derive(Debug, Clone, Serialize)]
pub struct GroundedDraft {
    pub provider: String,
    pub model: String,
    pub versions: Vec<String>,
    pub context: Vec<SearchHit>,
    pub generation_ms: u64,
}

pub struct GroundedGenerator {
    router: Arc<GenerationRouter>,
    similarity: Arc<SimilarityIndex>,
    config: GroundingConfig,
}

impl GroundedGenerator {
    pub fn new(
        router: Arc<GenerationRouter>,
        similarity: Arc<SimilarityIndex>,
        config: GroundingConfig,
    ) -> Self {
        Self {
            router,
            similarity,
            config,
        }
    }

    /// Retrieve context for the entity and draft message versions
    pub async fn draft(&self, request: GroundedRequest) -> Result<GroundedDraft> {
        let prompt = request.prompt.trim();
        if prompt.is_empty() {
            return Err(ChatError::Validation("Prompt is required".to_string()));
        }
        if request.entity_id.trim().is_empty() {
            return Err(ChatError::Validation("Entity ID is required".to_string()));
        }

        let model = request
            .model_id
            .clone()
            .filter(|m| !m.trim().is_empty())
            .unwrap_or_else(|| self.config.default_model.clone());
        if self.router.registry().owner_of(&model).is_none() {
            return Err(ChatError::UnknownModel(model));
        }

        let hits = self
            .similarity
            .query(&request.user_id, &request.entity_id, prompt, self.config.context_k)
            .await?;
        let previous = self
            .similarity
            .recent_items(
                &request.user_id,
                &request.entity_id,
                ContentType::MessageHistory,
                self.config.previous_messages,
            )
            .await?;
        let previous: Vec<String> = previous
            .into_iter()
            .map(|item| {
                item.text
                    .strip_prefix(MESSAGE_PREFIX)
                    .map(str::to_string)
                    .unwrap_or(item.text)
            })
            .collect();

        let params = GenerationParams {
            messages: vec![ChatMessage::new(
                ChatRole::User,
                build_grounded_prompt(prompt, request.profile.as_deref(), &hits, &previous),
            )],
            temperature: self.config.temperature,
            max_tokens: self.config.max_tokens,
        };

        let start = Instant::now();
        let generation = self.router.generate(&model, &params).await?;
        let mut text = String::new();
        let mut chunks = generation.chunks;
        while let Some(chunk) = chunks.next().await {
            text.push_str(&chunk?);
        }

        if text.trim().is_empty() {
            self.router.report_empty_response(&generation.provider);
            warn!(
                "Empty draft from {}/{} for entity {}",
                generation.provider, generation.model, request.entity_id
            );
            return Err(ChatError::Provider {
                provider: generation.provider,
                cause: "empty response".to_string(),
            });
        }

        let versions = parse_versions(&text, self.config.max_versions);
        info!(
            "Drafted {} versions for entity {} with {} context items",
            versions.len(),
            request.entity_id,
            hits.len()
        );

        Ok(GroundedDraft {
            provider: generation.provider,
            model: generation.model,
            versions,
            context: hits,
            generation_ms: start.elapsed().as_millis() as u64,
        })
    }
}

/// Prompt asking for three short versions grounded on retrieved items
pub fn build_grounded_prompt(
    prompt: &str,
    profile: Option<&str>,
    hits: &[SearchHit],
    previous: &[String],
) -> String {
    let context = hits
        .iter()
        .map(|hit| format!("{}: {}", hit.content_type.as_str(), hit.content))
        .collect::<Vec<_>>()
        .join("\n");
    let previous = previous
        .iter()
        .map(|message| format!("- {}", message))
        .collect::<Vec<_>>()
        .join("\n");

    format!(
        "You are a professional SMS message generator for a CRM system. Generate personalized, friendly, and professional SMS messages.

CONTACT INFORMATION:
{}

USER PROMPT:
{}

RELEVANT CONTEXT (from previous interactions, notes, activities):
{}

PREVIOUS MESSAGES (for context):
{}

INSTRUCTIONS:
- Generate 3 different versions of the message
- Keep messages concise (under 200 characters)
- Use a friendly, professional tone
- Personalize based on contact information and context
- Include relevant details from the context
- Make it sound natural and conversational
- Avoid generic messages - be specific to the contact and situation

FORMAT YOUR RESPONSE AS:
Version 1: [message]
Version 2: [message]
Version 3: [message]

Generate the 3 message versions:",
        profile.map(str::trim).filter(|p| !p.is_empty()).unwrap_or("None"),
        prompt,
        context,
        previous
    )
}

/// Extract `Version N: ...` lines; the whole reply is one version otherwise
pub fn parse_versions(reply: &str, max_versions: usize) -> Vec<String> {
    let versions: Vec<String> = reply
        .lines()
        .filter_map(|line| {
            let line = line.trim();
            let rest = line.get(..8)?.eq_ignore_ascii_case("version ").then(|| &line[8..])?;
            let (number, message) = rest.split_once(':')?;
            if number.is_empty() || !number.chars().all(|c| c.is_ascii_digit()) {
                return None;
            }
            let message = message.trim();
            (!message.is_empty()).then(|| message.to_string())
        })
        .take(max_versions)
        .collect();

    if versions.is_empty() {
        vec![reply.trim().to_string()]
    } else {
        versions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::InMemoryStore;
    use crate::providers::{
        BreakerPolicy, GenerationBackend, GenerationError, GenerationRequest, ProviderDescriptor,
        ProviderRegistry, TextStream,
    };
    use crate::similarity::{Embedder, EmbeddingError, ItemMetadata};
    use async_trait::async_trait;
    use chrono::{Duration as ChronoDuration, Utc};
    use std::sync::Mutex;
    use std::time::Duration;

    /// Maps a few known texts onto axis vectors
    struct KeywordEmbedder;

    #[async_trait]
    impl Embedder for KeywordEmbedder {
        async fn embed(&self, text: &str) -> std::result::Result<Vec<f32>, EmbeddingError> {
            let text = text.to_lowercase();
            Ok(if text.contains("renewal") {
                vec![1.0, 0.0]
            } else {
                vec![0.0, 1.0]
            })
        }
    }

    struct CapturingBackend {
        reply: &'static str,
        prompts: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl GenerationBackend for CapturingBackend {
        async fn invoke(&self, request: &GenerationRequest) -> std::result::Result<TextStream, GenerationError> {
            self.prompts
                .lock()
                .unwrap()
                .push(request.messages[0].content.clone());
            let chunks: Vec<std::result::Result<String, GenerationError>> = vec![Ok(self.reply.to_string())];
            Ok(Box::pin(futures::stream::iter(chunks)))
        }
    }

    async fn generator(reply: &'static str) -> (GroundedGenerator, Arc<CapturingBackend>) {
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
        let backend = Arc::new(CapturingBackend {
            reply,
            prompts: Mutex::new(Vec::new()),
        });
        let router = Arc::new(
            GenerationRouter::new(registry, Duration::from_secs(5))
                .with_backend("primary", backend.clone()),
        );

        let store = Arc::new(InMemoryStore::new());
        let similarity = Arc::new(SimilarityIndex::new(Arc::new(KeywordEmbedder), store, 50));
        similarity
            .store("u1", "c1", ContentType::Note, "Contract renewal due in May", ItemMetadata::new("contact_note"))
            .await
            .unwrap();
        similarity
            .store("u1", "c1", ContentType::Activity, "call: talked about golf", ItemMetadata::new("activity_log"))
            .await
            .unwrap();
        similarity
            .store(
                "u1",
                "c1",
                ContentType::MessageHistory,
                "Previous message: See you at the expo",
                ItemMetadata::new("message_history").at(Utc::now() - ChronoDuration::days(3)),
            )
            .await
            .unwrap();
        similarity
            .store(
                "u1",
                "c1",
                ContentType::MessageHistory,
                "Previous message: Thanks for the call",
                ItemMetadata::new("message_history"),
            )
            .await
            .unwrap();

        let config = GroundingConfig {
            default_model: "m1".to_string(),
            context_k: 2,
            ..Default::default()
        };
        (GroundedGenerator::new(router, similarity, config), backend)
    }

    fn request(prompt: &str) -> GroundedRequest {
        GroundedRequest {
            user_id: "u1".to_string(),
            entity_id: "c1".to_string(),
            prompt: prompt.to_string(),
            profile: Some("Name: Dana\nCompany: Acme".to_string()),
            model_id: None,
        }
    }

    #[test]
    fn test_parse_versions() {
        let reply = "Here you go:\nVersion 1: Hi Dana!\nversion 2:  Quick check-in \nVersion 3: Renewal?\nVersion 4: extra";
        assert_eq!(
            parse_versions(reply, 3),
            vec!["Hi Dana!", "Quick check-in", "Renewal?"]
        );
        assert_eq!(parse_versions("  just one message ", 3), vec!["just one message"]);
    }

    #[tokio::test]
    async fn test_draft_is_grounded_on_similar_items() {
        let (generator, backend) = generator("Version 1: A\nVersion 2: B").await;

        let draft = generator.draft(request("Follow up on the renewal")).await.unwrap();
        assert_eq!(draft.model, "m1");
        assert_eq!(draft.versions, vec!["A", "B"]);
        assert_eq!(draft.context.len(), 2);
        assert_eq!(draft.context[0].content, "Contract renewal due in May");

        let prompts = backend.prompts.lock().unwrap().clone();
        assert_eq!(prompts.len(), 1);
        let prompt = &prompts[0];
        assert!(prompt.contains("note: Contract renewal due in May"));
        assert!(prompt.contains("Company: Acme"));
        // Latest indexed message first, prefix stripped
        let latest = prompt.find("- Thanks for the call").unwrap();
        let older = prompt.find("- See you at the expo").unwrap();
        assert!(latest < older);
    }

    #[tokio::test]
    async fn test_draft_validation() {
        let (generator, backend) = generator("Version 1: A").await;

        assert!(matches!(
            generator.draft(request("   ")).await,
            Err(ChatError::Validation(_))
        ));

        let mut unknown = request("hello");
        unknown.model_id = Some("nope".to_string());
        assert!(matches!(
            generator.draft(unknown).await,
            Err(ChatError::UnknownModel(_))
        ));
        assert!(backend.prompts.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_empty_draft_is_a_provider_failure() {
        let (generator, _) = generator("   ").await;
        assert!(matches!(
            generator.draft(request("hello")).await,
            Err(ChatError::Provider { .. })
        ));
    }
}
