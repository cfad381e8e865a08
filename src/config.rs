//! Service configuration
//!
//! Layered with the `config` crate: optional `config/default.toml`, then
//! `CHAT__SECTION__KEY` environment variables. Every field has a default, so
//! an empty environment yields a working setup.

use crate::chat::{GroundingConfig, OrchestratorConfig};
use crate::context::SummarizerConfig;
use crate::error::{ChatError, Result};
use crate::providers::{BreakerPolicy, ProviderDescriptor};
use secrecy::{Secret, SecretString};
use serde::Deserialize;
use std::time::Duration;

/// Root configuration
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default = "default_providers")]
    pub providers: Vec<ProviderConfig>,

    #[serde(default)]
    pub breaker: BreakerPolicy,

    #[serde(default)]
    pub context: ContextConfig,

    #[serde(default)]
    pub chat: ChatConfig,

    #[serde(default)]
    pub embedding: EmbeddingConfig,

    #[serde(default)]
    pub similarity: SimilarityConfig,

    #[serde(default)]
    pub grounding: GroundingSettings,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            providers: default_providers(),
            breaker: BreakerPolicy::default(),
            context: ContextConfig::default(),
            chat: ChatConfig::default(),
            embedding: EmbeddingConfig::default(),
            similarity: SimilarityConfig::default(),
            grounding: GroundingSettings::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    /// Load from `config/default.toml` (if present) and the environment
    pub fn load() -> Result<Self> {
        Self::load_from("config/default")
    }

    /// Load from the given file stem (if present) and the environment
    pub fn load_from(path: &str) -> Result<Self> {
        let config: Config = ::config::Config::builder()
            .add_source(::config::File::with_name(path).required(false))
            .add_source(
                ::config::Environment::with_prefix("CHAT")
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints
    pub fn validate(&self) -> Result<()> {
        if self.providers.is_empty() {
            return Err(ChatError::Configuration(
                "At least one provider must be configured".to_string(),
            ));
        }
        if let Some(p) = self.providers.iter().find(|p| p.models.is_empty()) {
            return Err(ChatError::Configuration(format!(
                "Provider {} has no models",
                p.name
            )));
        }
        if !self
            .providers
            .iter()
            .any(|p| p.models.contains(&self.chat.default_model))
        {
            return Err(ChatError::Configuration(format!(
                "Default model {} is not served by any provider",
                self.chat.default_model
            )));
        }
        if self.context.token_threshold == 0 {
            return Err(ChatError::Configuration(
                "context.token_threshold must be positive".to_string(),
            ));
        }
        if self.context.recent_with_summary == 0 || self.context.recent_without_summary == 0 {
            return Err(ChatError::Configuration(
                "recent turn counts must be positive".to_string(),
            ));
        }
        if self.breaker.failure_threshold == 0 {
            return Err(ChatError::Configuration(
                "breaker.failure_threshold must be positive".to_string(),
            ));
        }
        if self.chat.rate_limit_max_sends == 0 {
            return Err(ChatError::Configuration(
                "chat.rate_limit_max_sends must be positive".to_string(),
            ));
        }
        if !(0.0..=2.0).contains(&self.chat.temperature) {
            return Err(ChatError::Configuration(
                "chat.temperature must be between 0.0 and 2.0".to_string(),
            ));
        }
        if self.similarity.max_k == 0 {
            return Err(ChatError::Configuration(
                "similarity.max_k must be positive".to_string(),
            ));
        }
        if self.grounding.context_k == 0 || self.grounding.context_k > self.similarity.max_k {
            return Err(ChatError::Configuration(format!(
                "grounding.context_k must be between 1 and {}",
                self.similarity.max_k
            )));
        }
        if self.chat.request_timeout_secs < self.chat.generation_timeout_secs {
            return Err(ChatError::Configuration(
                "chat.request_timeout_secs must not be below chat.generation_timeout_secs"
                    .to_string(),
            ));
        }
        Ok(())
    }

    pub fn orchestrator(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            default_model: self.chat.default_model.clone(),
            token_threshold: self.context.token_threshold,
            recent_without_summary: self.context.recent_without_summary,
            recent_with_summary: self.context.recent_with_summary,
            temperature: self.chat.temperature,
            max_tokens: self.chat.max_tokens,
            rate_limit_max_sends: self.chat.rate_limit_max_sends,
            rate_limit_min_gap: Duration::from_secs(self.chat.rate_limit_min_gap_secs),
        }
    }

    pub fn grounding(&self) -> GroundingConfig {
        GroundingConfig {
            default_model: self.chat.default_model.clone(),
            context_k: self.grounding.context_k,
            previous_messages: self.grounding.previous_messages,
            max_tokens: self.grounding.max_tokens,
            temperature: self.grounding.temperature,
            ..GroundingConfig::default()
        }
    }

    pub fn summarizer(&self) -> SummarizerConfig {
        SummarizerConfig {
            max_summary_tokens: self.context.summary_max_tokens,
            temperature: self.context.summary_temperature,
            ..SummarizerConfig::default()
        }
    }

    pub fn generation_timeout(&self) -> Duration {
        Duration::from_secs(self.chat.generation_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.chat.request_timeout_secs)
    }
}

/// HTTP server settings
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Request body limit in bytes
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

fn default_host() -> String { "0.0.0.0".to_string() }
fn default_port() -> u16 { 8080 }
fn default_max_body_bytes() -> usize { 1024 * 1024 }

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

/// One generation provider
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderConfig {
    pub name: String,

    pub models: Vec<String>,

    /// Lower is tried first
    #[serde(default = "default_priority")]
    pub priority: u32,

    #[serde(default = "default_true")]
    pub enabled: bool,

    /// OpenAI-compatible API root, e.g. `https://api.openai.com/v1`
    pub base_url: String,

    /// Inline key; takes precedence over `api_key_env`
    #[serde(default)]
    pub api_key: Option<SecretString>,

    /// Environment variable holding the key
    #[serde(default)]
    pub api_key_env: Option<String>,
}

fn default_priority() -> u32 { 100 }
fn default_true() -> bool { true }

impl ProviderConfig {
    pub fn descriptor(&self) -> ProviderDescriptor {
        ProviderDescriptor {
            name: self.name.clone(),
            models: self.models.clone(),
            priority: self.priority,
            enabled: self.enabled,
        }
    }

    /// Key from the config, or from the named environment variable
    pub fn resolve_api_key(&self) -> Option<SecretString> {
        resolve_key(&self.api_key, self.api_key_env.as_deref())
    }
}

fn resolve_key(inline: &Option<SecretString>, env: Option<&str>) -> Option<SecretString> {
    inline.clone().or_else(|| {
        env.and_then(|name| std::env::var(name).ok())
            .filter(|value| !value.trim().is_empty())
            .map(Secret::new)
    })
}

fn default_providers() -> Vec<ProviderConfig> {
    vec![
        ProviderConfig {
            name: "openai".to_string(),
            models: vec!["gpt-4o-mini".to_string()],
            priority: 1,
            enabled: true,
            base_url: "https://api.openai.com/v1".to_string(),
            api_key: None,
            api_key_env: Some("OPENAI_API_KEY".to_string()),
        },
        ProviderConfig {
            name: "mistral".to_string(),
            models: vec!["mistral-large-latest".to_string()],
            priority: 2,
            enabled: true,
            base_url: "https://api.mistral.ai/v1".to_string(),
            api_key: None,
            api_key_env: Some("MISTRAL_API_KEY".to_string()),
        },
    ]
}

/// Context summarization settings
#[derive(Debug, Clone, Deserialize)]
pub struct ContextConfig {
    #[serde(default = "default_token_threshold")]
    pub token_threshold: usize,

    /// Raw turns sent when no summary exists
    #[serde(default = "default_recent_without_summary")]
    pub recent_without_summary: usize,

    /// Raw turns sent alongside a summary
    #[serde(default = "default_recent_with_summary")]
    pub recent_with_summary: usize,

    /// `char_ratio` or `tiktoken`
    #[serde(default = "default_estimator")]
    pub estimator: String,

    #[serde(default = "default_summary_max_tokens")]
    pub summary_max_tokens: usize,

    #[serde(default = "default_summary_temperature")]
    pub summary_temperature: f32,

    /// Model used for summaries; defaults to `chat.default_model`
    #[serde(default)]
    pub summary_model: Option<String>,
}

fn default_token_threshold() -> usize { 4000 }
fn default_recent_without_summary() -> usize { 8 }
fn default_recent_with_summary() -> usize { 3 }
fn default_estimator() -> String { "char_ratio".to_string() }
fn default_summary_max_tokens() -> usize { 500 }
fn default_summary_temperature() -> f32 { 0.3 }

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            token_threshold: default_token_threshold(),
            recent_without_summary: default_recent_without_summary(),
            recent_with_summary: default_recent_with_summary(),
            estimator: default_estimator(),
            summary_max_tokens: default_summary_max_tokens(),
            summary_temperature: default_summary_temperature(),
            summary_model: None,
        }
    }
}

/// Turn settings
#[derive(Debug, Clone, Deserialize)]
pub struct ChatConfig {
    #[serde(default = "default_model")]
    pub default_model: String,

    #[serde(default = "default_temperature")]
    pub temperature: f32,

    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,

    #[serde(default = "default_rate_limit_max_sends")]
    pub rate_limit_max_sends: usize,

    /// Minimum spacing between sends once `rate_limit_max_sends` is reached
    #[serde(default = "default_rate_limit_min_gap_secs")]
    pub rate_limit_min_gap_secs: u64,

    /// Per-provider call timeout, also the longest wait between two chunks
    #[serde(default = "default_generation_timeout_secs")]
    pub generation_timeout_secs: u64,

    /// Hard cap on one provider response, body included
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_model() -> String { "gpt-4o-mini".to_string() }
fn default_temperature() -> f32 { 0.7 }
fn default_max_tokens() -> usize { 1000 }
fn default_rate_limit_max_sends() -> usize { 5 }
fn default_rate_limit_min_gap_secs() -> u64 { 10 }
fn default_generation_timeout_secs() -> u64 { 30 }
fn default_request_timeout_secs() -> u64 { 300 }

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            default_model: default_model(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            rate_limit_max_sends: default_rate_limit_max_sends(),
            rate_limit_min_gap_secs: default_rate_limit_min_gap_secs(),
            generation_timeout_secs: default_generation_timeout_secs(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

/// Embedding endpoint settings
#[derive(Debug, Clone, Deserialize)]
pub struct EmbeddingConfig {
    #[serde(default = "default_embedding_endpoint")]
    pub endpoint: String,

    #[serde(default = "default_embedding_model")]
    pub model: String,

    #[serde(default)]
    pub api_key: Option<SecretString>,

    #[serde(default = "default_embedding_key_env")]
    pub api_key_env: Option<String>,

    #[serde(default = "default_embedding_timeout_secs")]
    pub timeout_secs: u64,

    #[serde(default = "default_cache_max_entries")]
    pub cache_max_entries: u64,

    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
}

fn default_embedding_endpoint() -> String { "https://api.openai.com/v1/embeddings".to_string() }
fn default_embedding_model() -> String { "text-embedding-3-small".to_string() }
fn default_embedding_key_env() -> Option<String> { Some("OPENAI_API_KEY".to_string()) }
fn default_embedding_timeout_secs() -> u64 { 30 }
fn default_cache_max_entries() -> u64 { 10_000 }
fn default_cache_ttl_secs() -> u64 { 3600 }

impl EmbeddingConfig {
    pub fn resolve_api_key(&self) -> Option<SecretString> {
        resolve_key(&self.api_key, self.api_key_env.as_deref())
    }
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            endpoint: default_embedding_endpoint(),
            model: default_embedding_model(),
            api_key: None,
            api_key_env: default_embedding_key_env(),
            timeout_secs: default_embedding_timeout_secs(),
            cache_max_entries: default_cache_max_entries(),
            cache_ttl_secs: default_cache_ttl_secs(),
        }
    }
}

/// Similarity query settings
#[derive(Debug, Clone, Deserialize)]
pub struct SimilarityConfig {
    /// Largest `k` a query may request
    #[serde(default = "default_max_k")]
    pub max_k: usize,
}

fn default_max_k() -> usize { 50 }

impl Default for SimilarityConfig {
    fn default() -> Self {
        Self {
            max_k: default_max_k(),
        }
    }
}

/// Retrieval-grounded drafting settings
#[derive(Debug, Clone, Deserialize)]
pub struct GroundingSettings {
    #[serde(default = "default_context_k")]
    pub context_k: usize,

    #[serde(default = "default_previous_messages")]
    pub previous_messages: usize,

    #[serde(default = "default_grounding_max_tokens")]
    pub max_tokens: usize,

    #[serde(default = "default_temperature")]
    pub temperature: f32,
}

fn default_context_k() -> usize { 5 }
fn default_previous_messages() -> usize { 3 }
fn default_grounding_max_tokens() -> usize { 500 }

impl Default for GroundingSettings {
    fn default() -> Self {
        Self {
            context_k: default_context_k(),
            previous_messages: default_previous_messages(),
            max_tokens: default_grounding_max_tokens(),
            temperature: default_temperature(),
        }
    }
}

/// Logging settings
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String { "info".to_string() }

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.context.token_threshold, 4000);
        assert_eq!(config.providers[0].name, "openai");
        assert_eq!(config.orchestrator().recent_with_summary, 3);
        assert_eq!(config.grounding().context_k, 5);
        assert_eq!(config.request_timeout(), Duration::from_secs(300));
    }

    #[test]
    fn test_grounding_k_must_fit_similarity_limit() {
        let mut config = Config::default();
        config.grounding.context_k = config.similarity.max_k + 1;
        assert!(matches!(config.validate(), Err(ChatError::Configuration(_))));
    }

    #[test]
    fn test_unknown_default_model_is_rejected() {
        let mut config = Config::default();
        config.chat.default_model = "missing".to_string();
        assert!(matches!(config.validate(), Err(ChatError::Configuration(_))));
    }

    #[test]
    fn test_inline_key_wins_over_env() {
        let mut provider = default_providers().remove(0);
        provider.api_key = Some(Secret::new("inline".to_string()));
        provider.api_key_env = Some("CHAT_TEST_UNSET_KEY_VAR".to_string());
        let key = provider.resolve_api_key().unwrap();
        assert_eq!(key.expose_secret(), "inline");
    }

    #[test]
    fn test_partial_sections_keep_defaults() {
        let config: Config = serde_json::from_str(
            r#"{"context": {"token_threshold": 2000}, "breaker": {"reset_on_success": true}}"#,
        )
        .unwrap();
        assert_eq!(config.context.token_threshold, 2000);
        assert_eq!(config.context.recent_without_summary, 8);
        assert_eq!(config.breaker.failure_threshold, 3);
        assert!(config.breaker.reset_on_success);
        assert_eq!(config.providers.len(), 2);
    }
}
