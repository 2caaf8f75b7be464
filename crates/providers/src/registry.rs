//! Provider registry.
//!
//! Holds all provider instances the workspace declared, keyed by name and
//! grouped by capability. Concrete clients are injected by the embedding
//! application; the core only sees the capability traits. Providers that
//! failed to initialize are recorded (with secrets masked) so readiness
//! checks can surface them without scraping startup logs.

use std::collections::HashMap;
use std::sync::Arc;

use sibyl_domain::config::ProvidersConfig;
use sibyl_domain::secrets::mask_secrets;

use crate::traits::{EmbeddingProvider, LlmProvider, VectorStore};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// ProviderRegistry
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Records a provider that failed to initialize.
#[derive(Debug, Clone)]
pub struct ProviderInitError {
    pub provider_name: String,
    pub kind: String,
    /// Error message with any potential secrets masked.
    pub error: String,
}

/// Named provider instances per capability.
#[derive(Default)]
pub struct ProviderRegistry {
    llm: HashMap<String, Arc<dyn LlmProvider>>,
    embedding: HashMap<String, Arc<dyn EmbeddingProvider>>,
    vector: HashMap<String, Arc<dyn VectorStore>>,
    primary_llm: Option<String>,
    init_errors: Vec<ProviderInitError>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adopt the primary-LLM designation from the workspace config. A
    /// config that names none keeps the first-registered default.
    pub fn with_primary_from(mut self, config: &ProvidersConfig) -> Self {
        if let Some(name) = config.primary_llm_name() {
            self.primary_llm = Some(name.to_owned());
        }
        self
    }

    pub fn register_llm(&mut self, provider: Arc<dyn LlmProvider>) {
        tracing::info!(provider = provider.name(), kind = "llm", "registered provider");
        if self.primary_llm.is_none() {
            self.primary_llm = Some(provider.name().to_owned());
        }
        self.llm.insert(provider.name().to_owned(), provider);
    }

    pub fn register_embedding(&mut self, provider: Arc<dyn EmbeddingProvider>) {
        tracing::info!(provider = provider.name(), kind = "embedding", "registered provider");
        self.embedding.insert(provider.name().to_owned(), provider);
    }

    pub fn register_vector(&mut self, provider: Arc<dyn VectorStore>) {
        tracing::info!(provider = provider.name(), kind = "vector_store", "registered provider");
        self.vector.insert(provider.name().to_owned(), provider);
    }

    /// Record a provider that could not be constructed. The message is
    /// masked before storage so keys never leak to readiness reports.
    pub fn record_init_error(&mut self, provider_name: &str, kind: &str, error: &str) {
        let safe_error = mask_secrets(error);
        tracing::warn!(
            provider = provider_name,
            kind,
            error = %safe_error,
            "failed to initialize provider, skipping"
        );
        self.init_errors.push(ProviderInitError {
            provider_name: provider_name.to_owned(),
            kind: kind.to_owned(),
            error: safe_error,
        });
    }

    pub fn llm(&self, name: &str) -> Option<Arc<dyn LlmProvider>> {
        self.llm.get(name).cloned()
    }

    pub fn embedding(&self, name: &str) -> Option<Arc<dyn EmbeddingProvider>> {
        self.embedding.get(name).cloned()
    }

    pub fn vector(&self, name: &str) -> Option<Arc<dyn VectorStore>> {
        self.vector.get(name).cloned()
    }

    /// The LLM provider readiness requires, when one is registered.
    pub fn primary_llm(&self) -> Option<Arc<dyn LlmProvider>> {
        let name = self.primary_llm.as_deref()?;
        self.llm.get(name).cloned()
    }

    pub fn llm_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.llm.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.llm.len() + self.embedding.len() + self.vector.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Provider initialization errors (empty if all succeeded).
    pub fn init_errors(&self) -> &[ProviderInitError] {
        &self.init_errors
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockLlm;

    #[test]
    fn first_llm_becomes_primary_by_default() {
        let mut registry = ProviderRegistry::new();
        registry.register_llm(Arc::new(MockLlm::new("main")));
        registry.register_llm(Arc::new(MockLlm::new("cheap")));

        assert_eq!(registry.primary_llm().unwrap().name(), "main");
        assert_eq!(registry.llm_names(), vec!["cheap", "main"]);
    }

    #[test]
    fn config_primary_wins() {
        let config: ProvidersConfig = serde_json::from_value(serde_json::json!({
            "llm": [{"name": "a"}, {"name": "b"}],
            "primary_llm": "b"
        }))
        .unwrap();

        let mut registry = ProviderRegistry::new().with_primary_from(&config);
        registry.register_llm(Arc::new(MockLlm::new("a")));
        registry.register_llm(Arc::new(MockLlm::new("b")));
        assert_eq!(registry.primary_llm().unwrap().name(), "b");
    }

    #[test]
    fn missing_primary_is_none() {
        let registry = ProviderRegistry::new();
        assert!(registry.primary_llm().is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn init_errors_are_masked() {
        let mut registry = ProviderRegistry::new();
        registry.record_init_error(
            "main",
            "llm",
            "auth failed for key sk-abcdefghijklmnopqrstuvwxyz",
        );
        let errors = registry.init_errors();
        assert_eq!(errors.len(), 1);
        assert!(!errors[0].error.contains("sk-abcdefghijklmnopqrstuvwxyz"));
        assert!(errors[0].error.contains("sk-a"));
    }
}
