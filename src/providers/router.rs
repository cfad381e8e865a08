//! Generation router with ranked fallback

use super::{
    Generation, GenerationBackend, GenerationError, GenerationParams, GenerationRequest,
    ProviderRegistry, TextGenerator, TextStream,
};
use crate::metrics::METRICS;
use async_trait::async_trait;
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Default per-call timeout, also the longest wait between two chunks
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Routes requests across providers
pub struct GenerationRouter {
    registry: Arc<ProviderRegistry>,
    backends: HashMap<String, Arc<dyn GenerationBackend>>,
    call_timeout: Duration,
}

impl GenerationRouter {
    pub fn new(registry: Arc<ProviderRegistry>, call_timeout: Duration) -> Self {
        Self {
            registry,
            backends: HashMap::new(),
            call_timeout,
        }
    }

    /// Attach the backend serving a provider
    pub fn with_backend(mut self, provider: impl Into<String>, backend: Arc<dyn GenerationBackend>) -> Self {
        self.backends.insert(provider.into(), backend);
        self
    }

    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.registry
    }

    /// Candidate list: the primary model, then its fallback chain
    pub fn candidates(&self, primary_model: &str) -> Result<Vec<String>, GenerationError> {
        let mut candidates = vec![primary_model.to_string()];
        for model in self.registry.fallback_models_for(primary_model)? {
            if !candidates.contains(&model) {
                candidates.push(model);
            }
        }
        Ok(candidates)
    }

    /// Generate with automatic fallback
    ///
    /// Returns the first candidate that starts a stream. The result names the
    /// provider and model that answered, which may differ from `primary_model`.
    pub async fn generate(
        &self,
        primary_model: &str,
        params: &GenerationParams,
    ) -> Result<Generation, GenerationError> {
        let candidates = self.candidates(primary_model)?;
        let mut attempted = Vec::new();

        for model in candidates {
            let Some(provider) = self.registry.owner_of(&model).map(str::to_string) else {
                continue;
            };

            if !self.registry.is_enabled(&provider) {
                debug!("Skipping {} ({} is disabled)", model, provider);
                continue;
            }

            attempted.push(model.clone());
            if model != primary_model {
                METRICS.record_fallback(&provider);
            }

            let request = GenerationRequest {
                model: model.clone(),
                messages: params.messages.clone(),
                temperature: params.temperature,
                max_tokens: params.max_tokens,
            };

            let start = Instant::now();
            match self.invoke(&provider, &request).await {
                Ok(chunks) => {
                    self.registry.record_success(&provider);
                    METRICS.record_generation(&provider, "success", start.elapsed());
                    info!("Generation started on {}/{}", provider, model);
                    let chunks = with_idle_timeout(chunks, model.clone(), self.call_timeout);
                    return Ok(Generation {
                        provider,
                        model,
                        chunks,
                    });
                }
                Err(err) => {
                    if err.is_quota_class() {
                        METRICS.record_generation(&provider, "quota", start.elapsed());
                        if self.registry.record_failure(&provider) {
                            METRICS.record_provider_disabled(&provider);
                        }
                        warn!("Quota-class failure on {}/{}: {}", provider, model, err);
                    } else {
                        let outcome = match err {
                            GenerationError::Timeout { .. } => "timeout",
                            _ => "error",
                        };
                        METRICS.record_generation(&provider, outcome, start.elapsed());
                        warn!("Generation failed on {}/{}: {}", provider, model, err);
                    }
                }
            }
        }

        warn!("All models failed: {}", attempted.join(", "));
        Err(GenerationError::AllProvidersFailed { attempted })
    }

    /// Count an empty completion against the provider that produced it
    pub fn report_empty_response(&self, provider: &str) {
        if self.registry.record_failure(provider) {
            METRICS.record_provider_disabled(provider);
        }
    }

    async fn invoke(
        &self,
        provider: &str,
        request: &GenerationRequest,
    ) -> Result<TextStream, GenerationError> {
        let backend = self
            .backends
            .get(provider)
            .ok_or_else(|| GenerationError::provider(provider, "no backend configured"))?;

        match tokio::time::timeout(self.call_timeout, backend.invoke(request)).await {
            Ok(result) => result,
            Err(_) => Err(GenerationError::Timeout {
                model: request.model.clone(),
                after: self.call_timeout,
            }),
        }
    }
}

/// End `chunks` with a timeout error when no chunk arrives within `idle`
///
/// Backends return as soon as response headers arrive, so the call timeout
/// alone does not bound a stalled body.
fn with_idle_timeout(chunks: TextStream, model: String, idle: Duration) -> TextStream {
    Box::pin(futures::stream::unfold(Some(chunks), move |state| {
        let model = model.clone();
        async move {
            let mut chunks = state?;
            match tokio::time::timeout(idle, chunks.next()).await {
                Ok(Some(chunk)) => Some((chunk, Some(chunks))),
                Ok(None) => None,
                Err(_) => {
                    warn!("{} stalled for {:?} mid-stream", model, idle);
                    Some((Err(GenerationError::Timeout { model, after: idle }), None))
                }
            }
        }
    }))
}

/// [`TextGenerator`] bound to a model, routed with fallback
pub struct RouterTextGenerator {
    router: Arc<GenerationRouter>,
    model: String,
}

impl RouterTextGenerator {
    pub fn new(router: Arc<GenerationRouter>, model: impl Into<String>) -> Self {
        Self {
            router,
            model: model.into(),
        }
    }
}

#[async_trait]
impl TextGenerator for RouterTextGenerator {
    async fn generate_text(
        &self,
        prompt: &str,
        max_tokens: usize,
        temperature: f32,
    ) -> Result<String, GenerationError> {
        let params = GenerationParams {
            messages: vec![super::ChatMessage::new(super::ChatRole::User, prompt)],
            temperature,
            max_tokens,
        };

        let generation = self.router.generate(&self.model, &params).await?;
        let provider = generation.provider.clone();

        let mut text = String::new();
        let mut chunks = generation.chunks;
        while let Some(chunk) = chunks.next().await {
            text.push_str(&chunk?);
        }

        let text = text.trim().to_string();
        if text.is_empty() {
            self.router.report_empty_response(&provider);
            return Err(GenerationError::provider(provider, "empty response"));
        }
        Ok(text)
    }
}
