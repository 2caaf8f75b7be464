use sibyl_domain::error::Result;
use sibyl_domain::ProviderFingerprint;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Request / Response types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A provider-agnostic completion request.
#[derive(Debug, Clone, Default)]
pub struct CompletionRequest {
    /// The user prompt.
    pub prompt: String,
    /// System prompt prepended by the provider. `None` omits it.
    pub system_prompt: Option<String>,
    /// Model override. `None` uses the provider's default.
    pub model: Option<String>,
    /// Sampling temperature. `None` lets the provider choose.
    pub temperature: Option<f32>,
    /// Nucleus sampling parameter. `None` lets the provider choose.
    pub top_p: Option<f32>,
    /// Maximum tokens in the response.
    pub max_tokens: Option<u32>,
    /// Sampling seed for providers that support it.
    pub seed: Option<u64>,
}

/// A provider-agnostic completion response.
#[derive(Debug, Clone)]
pub struct CompletionResponse {
    pub text: String,
    pub tokens_in: u64,
    pub tokens_out: u64,
    /// The `{provider, model, version}` triple that produced this response.
    pub fingerprint: ProviderFingerprint,
    pub latency_ms: u64,
    /// Why generation stopped (e.g. "stop", "length").
    pub finish_reason: String,
}

/// One vector-store search result.
#[derive(Debug, Clone)]
pub struct SearchHit {
    pub id: String,
    pub score: f32,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Capability traits
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A completion-capable provider.
///
/// Implementations translate between these types and their wire format,
/// and return errors already classified (see [`crate::classify`]). Panics
/// inside an adapter must not escape this boundary.
#[async_trait::async_trait]
pub trait LlmProvider: Send + Sync {
    /// Send a completion request and wait for the full response.
    async fn complete(&self, req: CompletionRequest) -> Result<CompletionResponse>;

    /// The configured name of this provider instance.
    fn name(&self) -> &str;

    /// The fingerprint this instance stamps on responses.
    fn fingerprint(&self) -> ProviderFingerprint;
}

/// A text-embedding provider.
#[async_trait::async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Embed each input text; one vector per input, in order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    fn name(&self) -> &str;

    fn fingerprint(&self) -> ProviderFingerprint;
}

/// A vector similarity search index.
#[async_trait::async_trait]
pub trait VectorStore: Send + Sync {
    /// Return the `k` nearest entries to `vector`, best first.
    async fn search(&self, vector: &[f32], k: usize) -> Result<Vec<SearchHit>>;

    fn name(&self) -> &str;
}
