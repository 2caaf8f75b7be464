//! The provider gateway: a narrow capability-typed boundary over LLM,
//! embedding, and vector-store providers.
//!
//! Concrete clients are opaque to the runtime core. Every response carries
//! a [`ProviderFingerprint`] used by the memoizer and for deterministic
//! replay audits; every error leaves the gateway already classified as
//! retryable or terminal. The gateway enforces neither budget nor
//! concurrency; that is the scheduler's job.

pub mod classify;
pub mod mock;
mod registry;
mod traits;

pub use registry::{ProviderInitError, ProviderRegistry};
pub use traits::{
    CompletionRequest, CompletionResponse, EmbeddingProvider, LlmProvider, SearchHit, VectorStore,
};

pub use sibyl_domain::ProviderFingerprint;
