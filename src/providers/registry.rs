//! Provider registry with per-provider circuit breaker
//!
//! Providers are ordered by ascending priority at construction time and never
//! reordered. Enabled flags and failure counters are atomics, so the registry
//! is shared by `Arc` without a lock.

use super::GenerationError;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use tracing::{info, warn};

/// Static description of a provider
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderDescriptor {
    pub name: String,
    pub models: Vec<String>,
    pub priority: u32,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

/// Circuit breaker policy
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerPolicy {
    /// Consecutive quota-class failures before a provider is disabled
    pub failure_threshold: u32,
    /// Whether a successful call clears the failure counter
    pub reset_on_success: bool,
}

impl Default for BreakerPolicy {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            reset_on_success: false,
        }
    }
}

#[derive(Debug)]
struct ProviderEntry {
    descriptor: ProviderDescriptor,
    enabled: AtomicBool,
    consecutive_failures: AtomicU32,
}

impl ProviderEntry {
    fn status(&self) -> ProviderStatus {
        ProviderStatus {
            name: self.descriptor.name.clone(),
            models: self.descriptor.models.clone(),
            priority: self.descriptor.priority,
            enabled: self.enabled.load(Ordering::Acquire),
            consecutive_failures: self.consecutive_failures.load(Ordering::Acquire),
        }
    }
}

/// Point-in-time view of a provider
#[derive(Debug, Clone, Serialize)]
pub struct ProviderStatus {
    pub name: String,
    pub models: Vec<String>,
    pub priority: u32,
    pub enabled: bool,
    pub consecutive_failures: u32,
}

/// Catalog row for a model
#[derive(Debug, Clone, Serialize)]
pub struct ModelInfo {
    pub name: String,
    pub provider: String,
    pub available: bool,
    pub fallbacks: Vec<String>,
}

/// Registry construction errors
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Provider {0} has no models")]
    NoModels(String),

    #[error("Duplicate provider name: {0}")]
    DuplicateProvider(String),

    #[error("Registry has no providers")]
    Empty,
}

/// Process-wide provider table
#[derive(Debug)]
pub struct ProviderRegistry {
    providers: Vec<ProviderEntry>,
    policy: BreakerPolicy,
}

impl ProviderRegistry {
    /// Create a registry; providers are ranked by ascending priority
    pub fn new(
        mut descriptors: Vec<ProviderDescriptor>,
        policy: BreakerPolicy,
    ) -> Result<Self, RegistryError> {
        if descriptors.is_empty() {
            return Err(RegistryError::Empty);
        }

        let mut seen = HashSet::new();
        for descriptor in &descriptors {
            if descriptor.models.is_empty() {
                return Err(RegistryError::NoModels(descriptor.name.clone()));
            }
            if !seen.insert(descriptor.name.clone()) {
                return Err(RegistryError::DuplicateProvider(descriptor.name.clone()));
            }
        }

        descriptors.sort_by_key(|d| d.priority);

        let providers = descriptors
            .into_iter()
            .map(|descriptor| ProviderEntry {
                enabled: AtomicBool::new(descriptor.enabled),
                consecutive_failures: AtomicU32::new(0),
                descriptor,
            })
            .collect();

        Ok(Self { providers, policy })
    }

    fn entry(&self, provider: &str) -> Option<&ProviderEntry> {
        self.providers.iter().find(|p| p.descriptor.name == provider)
    }

    /// Enabled provider serving `model`
    pub fn provider_for_model(&self, model: &str) -> Result<&str, GenerationError> {
        self.providers
            .iter()
            .find(|p| p.enabled.load(Ordering::Acquire) && p.descriptor.models.iter().any(|m| m == model))
            .map(|p| p.descriptor.name.as_str())
            .ok_or_else(|| GenerationError::UnknownModel(model.to_string()))
    }

    /// Provider listing `model`, whether or not it is currently enabled
    pub fn owner_of(&self, model: &str) -> Option<&str> {
        self.providers
            .iter()
            .find(|p| p.descriptor.models.iter().any(|m| m == model))
            .map(|p| p.descriptor.name.as_str())
    }

    /// Models of every other enabled provider, best priority first
    ///
    /// The owning provider is excluded even if it serves other models: those
    /// would share the failure that triggered the fallback.
    pub fn fallback_models_for(&self, model: &str) -> Result<Vec<String>, GenerationError> {
        let owner = self
            .owner_of(model)
            .ok_or_else(|| GenerationError::UnknownModel(model.to_string()))?;

        Ok(self
            .providers
            .iter()
            .filter(|p| p.descriptor.name != owner && p.enabled.load(Ordering::Acquire))
            .flat_map(|p| p.descriptor.models.iter().cloned())
            .collect())
    }

    pub fn is_enabled(&self, provider: &str) -> bool {
        self.entry(provider)
            .map(|p| p.enabled.load(Ordering::Acquire))
            .unwrap_or(false)
    }

    pub fn consecutive_failures(&self, provider: &str) -> u32 {
        self.entry(provider)
            .map(|p| p.consecutive_failures.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    /// Count a quota-class failure; returns true if this call disabled the provider
    pub fn record_failure(&self, provider: &str) -> bool {
        let Some(entry) = self.entry(provider) else {
            return false;
        };

        let failures = entry.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
        if failures >= self.policy.failure_threshold
            && entry.enabled.swap(false, Ordering::AcqRel)
        {
            warn!(
                "Provider {} disabled after {} consecutive failures",
                provider, failures
            );
            return true;
        }
        false
    }

    /// Note a successful call
    pub fn record_success(&self, provider: &str) {
        if !self.policy.reset_on_success {
            return;
        }
        if let Some(entry) = self.entry(provider) {
            entry.consecutive_failures.store(0, Ordering::Release);
        }
    }

    /// Clear the failure counter (operator action)
    pub fn reset_failures(&self, provider: &str) -> bool {
        match self.entry(provider) {
            Some(entry) => {
                entry.consecutive_failures.store(0, Ordering::Release);
                info!("Failure counter reset for provider {}", provider);
                true
            }
            None => false,
        }
    }

    /// Re-enable a provider (operator action); also clears its counter
    pub fn enable(&self, provider: &str) -> bool {
        match self.entry(provider) {
            Some(entry) => {
                entry.consecutive_failures.store(0, Ordering::Release);
                entry.enabled.store(true, Ordering::Release);
                info!("Provider {} enabled", provider);
                true
            }
            None => false,
        }
    }

    pub fn disable(&self, provider: &str) -> bool {
        match self.entry(provider) {
            Some(entry) => {
                entry.enabled.store(false, Ordering::Release);
                info!("Provider {} disabled by operator", provider);
                true
            }
            None => false,
        }
    }

    /// Models served by enabled providers, in priority order
    pub fn available_models(&self) -> Vec<String> {
        self.providers
            .iter()
            .filter(|p| p.enabled.load(Ordering::Acquire))
            .flat_map(|p| p.descriptor.models.iter().cloned())
            .collect()
    }

    /// Every known model with its availability and fallback chain
    pub fn catalog(&self) -> Vec<ModelInfo> {
        self.providers
            .iter()
            .flat_map(|p| {
                p.descriptor.models.iter().map(move |model| ModelInfo {
                    name: model.clone(),
                    provider: p.descriptor.name.clone(),
                    available: p.enabled.load(Ordering::Acquire),
                    fallbacks: self.fallback_models_for(model).unwrap_or_default(),
                })
            })
            .collect()
    }

    pub fn statuses(&self) -> Vec<ProviderStatus> {
        self.providers.iter().map(ProviderEntry::status).collect()
    }

    pub fn status(&self, provider: &str) -> Option<ProviderStatus> {
        self.entry(provider).map(ProviderEntry::status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(name: &str, models: &[&str], priority: u32) -> ProviderDescriptor {
        ProviderDescriptor {
            name: name.to_string(),
            models: models.iter().map(|m| m.to_string()).collect(),
            priority,
            enabled: true,
        }
    }

    fn registry() -> ProviderRegistry {
        ProviderRegistry::new(
            vec![
                descriptor("mistral", &["mistral-large-latest"], 2),
                descriptor("openai", &["gpt-4o-mini", "gpt-4o"], 1),
                descriptor("local", &["llama3"], 3),
            ],
            BreakerPolicy::default(),
        )
        .unwrap()
    }

    #[test]
    fn test_rejects_provider_without_models() {
        let result = ProviderRegistry::new(vec![descriptor("empty", &[], 1)], BreakerPolicy::default());
        assert!(matches!(result, Err(RegistryError::NoModels(_))));
    }

    #[test]
    fn test_rejects_duplicate_names() {
        let result = ProviderRegistry::new(
            vec![descriptor("a", &["m1"], 1), descriptor("a", &["m2"], 2)],
            BreakerPolicy::default(),
        );
        assert!(matches!(result, Err(RegistryError::DuplicateProvider(_))));
    }

    #[test]
    fn test_provider_lookup() {
        let registry = registry();
        assert_eq!(registry.provider_for_model("gpt-4o").unwrap(), "openai");
        assert!(matches!(
            registry.provider_for_model("unknown"),
            Err(GenerationError::UnknownModel(_))
        ));
    }

    #[test]
    fn test_fallbacks_exclude_own_provider_and_follow_priority() {
        let registry = registry();
        let fallbacks = registry.fallback_models_for("gpt-4o-mini").unwrap();
        assert_eq!(fallbacks, vec!["mistral-large-latest", "llama3"]);

        let fallbacks = registry.fallback_models_for("llama3").unwrap();
        assert_eq!(fallbacks, vec!["gpt-4o-mini", "gpt-4o", "mistral-large-latest"]);
    }

    #[test]
    fn test_fallbacks_skip_disabled_providers() {
        let registry = registry();
        registry.disable("mistral");
        let fallbacks = registry.fallback_models_for("gpt-4o-mini").unwrap();
        assert_eq!(fallbacks, vec!["llama3"]);
    }

    #[test]
    fn test_fallbacks_for_model_of_disabled_provider() {
        let registry = registry();
        registry.disable("openai");
        assert!(registry.provider_for_model("gpt-4o-mini").is_err());
        let fallbacks = registry.fallback_models_for("gpt-4o-mini").unwrap();
        assert_eq!(fallbacks, vec!["mistral-large-latest", "llama3"]);
    }

    #[test]
    fn test_breaker_disables_after_threshold() {
        let registry = registry();
        assert!(!registry.record_failure("openai"));
        assert!(!registry.record_failure("openai"));
        assert!(registry.is_enabled("openai"));
        assert!(registry.record_failure("openai"));
        assert!(!registry.is_enabled("openai"));
        assert_eq!(registry.consecutive_failures("openai"), 3);
    }

    #[test]
    fn test_success_keeps_counter_by_default() {
        let registry = registry();
        registry.record_failure("openai");
        registry.record_failure("openai");
        registry.record_success("openai");
        assert_eq!(registry.consecutive_failures("openai"), 2);
        registry.record_failure("openai");
        assert!(!registry.is_enabled("openai"));
    }

    #[test]
    fn test_success_resets_counter_when_configured() {
        let registry = ProviderRegistry::new(
            vec![descriptor("openai", &["gpt-4o-mini"], 1)],
            BreakerPolicy {
                failure_threshold: 3,
                reset_on_success: true,
            },
        )
        .unwrap();
        registry.record_failure("openai");
        registry.record_failure("openai");
        registry.record_success("openai");
        assert_eq!(registry.consecutive_failures("openai"), 0);
    }

    #[test]
    fn test_operator_enable_clears_state() {
        let registry = registry();
        for _ in 0..3 {
            registry.record_failure("mistral");
        }
        assert!(!registry.is_enabled("mistral"));
        assert!(registry.enable("mistral"));
        assert!(registry.is_enabled("mistral"));
        assert_eq!(registry.consecutive_failures("mistral"), 0);
        assert!(!registry.enable("nope"));
    }

    #[test]
    fn test_catalog_marks_unavailable_models() {
        let registry = registry();
        registry.disable("local");
        let catalog = registry.catalog();
        let llama = catalog.iter().find(|m| m.name == "llama3").unwrap();
        assert!(!llama.available);
        assert_eq!(registry.available_models().len(), 3);
    }
}
