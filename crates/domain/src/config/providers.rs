use serde::{Deserialize, Serialize};

/// The capability a provider instance offers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    Llm,
    Embedding,
    VectorStore,
}

impl ProviderKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Llm => "llm",
            Self::Embedding => "embedding",
            Self::VectorStore => "vector_store",
        }
    }
}

/// A named provider declaration. Concrete clients are opaque to the core;
/// the entry carries only the name and fingerprint components.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderEntry {
    pub name: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
}

/// Declared provider instances per capability.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProvidersConfig {
    #[serde(default)]
    pub llm: Vec<ProviderEntry>,
    #[serde(default)]
    pub embedding: Vec<ProviderEntry>,
    #[serde(default)]
    pub vector_store: Vec<ProviderEntry>,
    /// Name of the LLM provider that readiness checks require. Defaults to
    /// the first declared LLM provider.
    #[serde(default)]
    pub primary_llm: Option<String>,
}

impl ProvidersConfig {
    /// The effective primary LLM provider name, if any is declared.
    pub fn primary_llm_name(&self) -> Option<&str> {
        self.primary_llm
            .as_deref()
            .or_else(|| self.llm.first().map(|e| e.name.as_str()))
    }
}
