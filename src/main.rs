use anyhow::Context as _;
use chat_orchestrator::{
    api::{build_router, AppState},
    chat::{GroundedGenerator, NoBusinessContext, TurnOrchestrator},
    config::{Config, LoggingConfig},
    context::{estimator_from_name, ContextSummarizer},
    persistence::InMemoryStore,
    providers::{
        openai::OpenAiBackendConfig, GenerationRouter, OpenAiCompatibleBackend, ProviderRegistry,
        RouterTextGenerator,
    },
    similarity::{CachedEmbedder, EmbedderConfig, OpenAiEmbedder, SimilarityIndex},
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let config = Config::load().context("failed to load configuration")?;
    init_tracing(&config.logging);

    let state = build_state(&config)?;
    let app = build_router(state, config.server.max_body_bytes);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    info!("Listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Failed to listen for shutdown signal: {}", e);
            }
            info!("Shutting down");
        })
        .await?;

    Ok(())
}

fn init_tracing(logging: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));

    let registry = tracing_subscriber::registry().with(filter);
    if logging.json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }
}

fn build_state(config: &Config) -> anyhow::Result<AppState> {
    let descriptors = config.providers.iter().map(|p| p.descriptor()).collect();
    let registry = Arc::new(ProviderRegistry::new(descriptors, config.breaker)?);

    let mut router = GenerationRouter::new(registry, config.generation_timeout());
    for provider in &config.providers {
        let api_key = provider.resolve_api_key();
        if api_key.is_none() {
            warn!("No API key configured for provider {}", provider.name);
        }
        let backend = OpenAiCompatibleBackend::new(OpenAiBackendConfig {
            provider: provider.name.clone(),
            base_url: provider.base_url.clone(),
            api_key,
            connect_timeout: CONNECT_TIMEOUT,
            request_timeout: config.request_timeout(),
        })?;
        router = router.with_backend(provider.name.clone(), Arc::new(backend));
    }
    let router = Arc::new(router);

    let summary_model = config
        .context
        .summary_model
        .clone()
        .unwrap_or_else(|| config.chat.default_model.clone());
    let summarizer = Arc::new(ContextSummarizer::new(
        Arc::new(RouterTextGenerator::new(router.clone(), summary_model)),
        estimator_from_name(&config.context.estimator)?,
        config.summarizer(),
    ));

    let store = Arc::new(InMemoryStore::new());
    let orchestrator = Arc::new(TurnOrchestrator::new(
        router.clone(),
        summarizer,
        store.clone(),
        Arc::new(NoBusinessContext),
        config.orchestrator(),
    ));

    let embedder = OpenAiEmbedder::new(EmbedderConfig {
        endpoint: config.embedding.endpoint.clone(),
        model: config.embedding.model.clone(),
        api_key: config.embedding.resolve_api_key(),
        timeout: Duration::from_secs(config.embedding.timeout_secs),
    })?;
    let embedder = Arc::new(CachedEmbedder::new(
        Arc::new(embedder),
        config.embedding.cache_max_entries,
        Duration::from_secs(config.embedding.cache_ttl_secs),
    ));
    let similarity = Arc::new(SimilarityIndex::new(
        embedder,
        store,
        config.similarity.max_k,
    ));
    let grounded = Arc::new(GroundedGenerator::new(
        router,
        similarity.clone(),
        config.grounding(),
    ));

    info!(
        "Configured {} providers, default model {}",
        config.providers.len(),
        config.chat.default_model
    );

    Ok(AppState {
        orchestrator,
        similarity,
        grounded,
        default_model: config.chat.default_model.clone(),
    })
}
