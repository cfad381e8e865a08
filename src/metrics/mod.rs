//! Metrics collection for observability

use prometheus::{
    register_counter_vec_with_registry, register_histogram_vec_with_registry,
    register_histogram_with_registry, CounterVec, Histogram, HistogramVec, Opts, Registry,
};
use once_cell::sync::Lazy;
use std::sync::Arc;
use std::time::Duration;

/// Global metrics registry
pub static METRICS: Lazy<Arc<Metrics>> = Lazy::new(|| {
    Arc::new(Metrics::new().expect("Failed to initialize metrics"))
});

/// Metrics collector
pub struct Metrics {
    registry: Registry,

    // Generation metrics
    pub generation_requests: CounterVec,
    pub generation_duration: HistogramVec,
    pub generation_fallbacks: CounterVec,
    pub providers_disabled: CounterVec,

    // Context metrics
    pub context_tokens: Histogram,
    pub summarizations: CounterVec,

    // Similarity metrics
    pub embedding_requests: CounterVec,
    pub similarity_queries: CounterVec,

    // Turn metrics
    pub turns: CounterVec,
    pub rate_limit_decisions: CounterVec,
}

impl Metrics {
    /// Create a new metrics collector
    pub fn new() -> Result<Self, Box<dyn std::error::Error>> {
        let registry = Registry::new();

        let generation_requests = register_counter_vec_with_registry!(
            Opts::new("generation_requests_total", "Generation attempts per provider"),
            &["provider", "outcome"],
            registry
        )?;

        let generation_duration = register_histogram_vec_with_registry!(
            "generation_duration_seconds",
            "Time to first response from a provider in seconds",
            &["provider"],
            registry
        )?;

        let generation_fallbacks = register_counter_vec_with_registry!(
            Opts::new("generation_fallbacks_total", "Fallback attempts per provider"),
            &["provider"],
            registry
        )?;

        let providers_disabled = register_counter_vec_with_registry!(
            Opts::new("providers_disabled_total", "Circuit breaker trips per provider"),
            &["provider"],
            registry
        )?;

        let context_tokens = register_histogram_with_registry!(
            "context_tokens",
            "Estimated context tokens per reconcile",
            vec![250.0, 500.0, 1000.0, 2000.0, 4000.0, 8000.0, 16000.0],
            registry
        )?;

        let summarizations = register_counter_vec_with_registry!(
            Opts::new("summarizations_total", "Context summarizations by outcome"),
            &["outcome"],
            registry
        )?;

        let embedding_requests = register_counter_vec_with_registry!(
            Opts::new("embedding_requests_total", "Embedding requests"),
            &["status"],
            registry
        )?;

        let similarity_queries = register_counter_vec_with_registry!(
            Opts::new("similarity_queries_total", "Similarity queries"),
            &["status"],
            registry
        )?;

        let turns = register_counter_vec_with_registry!(
            Opts::new("turns_total", "Conversation turns by outcome"),
            &["outcome"],
            registry
        )?;

        let rate_limit_decisions = register_counter_vec_with_registry!(
            Opts::new("rate_limit_decisions_total", "Rate limiter decisions"),
            &["decision"],
            registry
        )?;

        Ok(Self {
            registry,
            generation_requests,
            generation_duration,
            generation_fallbacks,
            providers_disabled,
            context_tokens,
            summarizations,
            embedding_requests,
            similarity_queries,
            turns,
            rate_limit_decisions,
        })
    }

    /// Get the metrics registry for exporting
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Record one provider attempt
    pub fn record_generation(&self, provider: &str, outcome: &str, elapsed: Duration) {
        self.generation_requests
            .with_label_values(&[provider, outcome])
            .inc();
        self.generation_duration
            .with_label_values(&[provider])
            .observe(elapsed.as_secs_f64());
    }

    /// Record an attempt on a non-primary model
    pub fn record_fallback(&self, provider: &str) {
        self.generation_fallbacks.with_label_values(&[provider]).inc();
    }

    pub fn record_provider_disabled(&self, provider: &str) {
        self.providers_disabled.with_label_values(&[provider]).inc();
    }

    pub fn record_context_tokens(&self, tokens: usize) {
        self.context_tokens.observe(tokens as f64);
    }

    /// Outcome is one of `success`, `fallback` or `overflow`
    pub fn record_summarization(&self, outcome: &str) {
        self.summarizations.with_label_values(&[outcome]).inc();
    }

    pub fn record_embedding(&self, success: bool) {
        let status = if success { "success" } else { "error" };
        self.embedding_requests.with_label_values(&[status]).inc();
    }

    pub fn record_similarity_query(&self, success: bool) {
        let status = if success { "success" } else { "error" };
        self.similarity_queries.with_label_values(&[status]).inc();
    }

    pub fn record_turn(&self, outcome: &str) {
        self.turns.with_label_values(&[outcome]).inc();
    }

    /// Record rate limit event
    pub fn record_rate_limit(&self, allowed: bool) {
        let decision = if allowed { "allowed" } else { "rejected" };
        self.rate_limit_decisions.with_label_values(&[decision]).inc();
    }

    /// Export metrics in Prometheus text format
    pub fn export_prometheus(&self) -> String {
        use prometheus::Encoder;

        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();

        let mut buffer = Vec::new();
        if encoder.encode(&metric_families, &mut buffer).is_err() {
            return String::new();
        }

        String::from_utf8(buffer).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_initialization() {
        let metrics = Metrics::new();
        assert!(metrics.is_ok());
    }

    #[test]
    fn test_export_contains_recorded_series() {
        let metrics = Metrics::new().unwrap();
        metrics.record_generation("openai", "success", Duration::from_millis(120));
        metrics.record_summarization("fallback");
        metrics.record_rate_limit(false);

        let text = metrics.export_prometheus();
        assert!(text.contains("generation_requests_total"));
        assert!(text.contains("summarizations_total{outcome=\"fallback\"} 1"));
        assert!(text.contains("rate_limit_decisions_total{decision=\"rejected\"} 1"));
    }
}
