//! Scriptable in-memory providers for the runtime test-suite.
//!
//! A [`MockLlm`] plays back a queue of outcomes (success, retryable
//! failure, terminal failure, delay) and then succeeds forever with fixed
//! usage numbers, which makes budget and retry assertions exact.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use sibyl_domain::error::Result;
use sibyl_domain::ProviderFingerprint;

use crate::classify::classify;
use crate::traits::{
    CompletionRequest, CompletionResponse, EmbeddingProvider, LlmProvider, SearchHit, VectorStore,
};

/// One scripted response.
#[derive(Debug, Clone)]
pub enum MockOutcome {
    Succeed,
    SucceedWith { text: String },
    FailRetryable { status: u16, message: String },
    FailTerminal { message: String },
    /// Sleep before succeeding; used to trip call deadlines.
    Delay { ms: u64 },
}

/// A completion provider that plays back a script.
pub struct MockLlm {
    name: String,
    model: String,
    version: String,
    tokens_in: u64,
    tokens_out: u64,
    /// Fixed response text; `None` echoes the prompt.
    default_text: Option<String>,
    script: Mutex<VecDeque<MockOutcome>>,
    calls: AtomicU64,
}

impl MockLlm {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            model: "mock-model".into(),
            version: "1".into(),
            tokens_in: 100,
            tokens_out: 50,
            default_text: None,
            script: Mutex::new(VecDeque::new()),
            calls: AtomicU64::new(0),
        }
    }

    /// Fixed text for every default success (instead of echoing).
    pub fn with_text(mut self, text: &str) -> Self {
        self.default_text = Some(text.to_owned());
        self
    }

    pub fn with_model(mut self, model: &str, version: &str) -> Self {
        self.model = model.to_owned();
        self.version = version.to_owned();
        self
    }

    /// Fixed usage stamped on every successful response.
    pub fn with_usage(mut self, tokens_in: u64, tokens_out: u64) -> Self {
        self.tokens_in = tokens_in;
        self.tokens_out = tokens_out;
        self
    }

    /// Queue `n` retryable failures (429) before the script continues.
    pub fn fail_retryable_times(self, n: usize) -> Self {
        {
            let mut script = self.script.lock();
            for _ in 0..n {
                script.push_back(MockOutcome::FailRetryable {
                    status: 429,
                    message: "rate limited".into(),
                });
            }
        }
        self
    }

    /// Queue one terminal failure.
    pub fn fail_terminal_once(self, message: &str) -> Self {
        self.script.lock().push_back(MockOutcome::FailTerminal {
            message: message.to_owned(),
        });
        self
    }

    /// Queue an arbitrary outcome.
    pub fn then(self, outcome: MockOutcome) -> Self {
        self.script.lock().push_back(outcome);
        self
    }

    /// How many completion calls this provider has served.
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Acquire)
    }

    fn respond(&self, req: &CompletionRequest, text: String) -> CompletionResponse {
        CompletionResponse {
            text,
            tokens_in: self.tokens_in,
            tokens_out: self.tokens_out,
            fingerprint: ProviderFingerprint::new(
                &self.name,
                req.model.as_deref().unwrap_or(&self.model),
                &self.version,
            ),
            latency_ms: 1,
            finish_reason: "stop".into(),
        }
    }
}

#[async_trait::async_trait]
impl LlmProvider for MockLlm {
    async fn complete(&self, req: CompletionRequest) -> Result<CompletionResponse> {
        self.calls.fetch_add(1, Ordering::AcqRel);
        let outcome = self.script.lock().pop_front().unwrap_or(MockOutcome::Succeed);
        let default_text = |prompt: &str| {
            self.default_text
                .clone()
                .unwrap_or_else(|| format!("echo: {prompt}"))
        };
        match outcome {
            MockOutcome::Succeed => {
                let text = default_text(&req.prompt);
                Ok(self.respond(&req, text))
            }
            MockOutcome::SucceedWith { text } => Ok(self.respond(&req, text)),
            MockOutcome::FailRetryable { status, message } => {
                Err(classify(&self.name, Some(status), &message))
            }
            MockOutcome::FailTerminal { message } => {
                Err(classify(&self.name, Some(400), &message))
            }
            MockOutcome::Delay { ms } => {
                tokio::time::sleep(std::time::Duration::from_millis(ms)).await;
                let text = default_text(&req.prompt);
                Ok(self.respond(&req, text))
            }
        }
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn fingerprint(&self) -> ProviderFingerprint {
        ProviderFingerprint::new(&self.name, &self.model, &self.version)
    }
}

/// An embedding provider returning deterministic fixed-dimension vectors.
pub struct MockEmbedding {
    name: String,
    dim: usize,
}

impl MockEmbedding {
    pub fn new(name: &str, dim: usize) -> Self {
        Self {
            name: name.to_owned(),
            dim,
        }
    }
}

#[async_trait::async_trait]
impl EmbeddingProvider for MockEmbedding {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts
            .iter()
            .map(|t| {
                let base = t.len() as f32;
                (0..self.dim).map(|i| base + i as f32).collect()
            })
            .collect())
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn fingerprint(&self) -> ProviderFingerprint {
        ProviderFingerprint::new(&self.name, "mock-embed", "1")
    }
}

/// A vector store returning `k` hits with descending scores.
pub struct MockVectorStore {
    name: String,
}

impl MockVectorStore {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
        }
    }
}

#[async_trait::async_trait]
impl VectorStore for MockVectorStore {
    async fn search(&self, _vector: &[f32], k: usize) -> Result<Vec<SearchHit>> {
        Ok((0..k)
            .map(|i| SearchHit {
                id: format!("doc-{i}"),
                score: 1.0 - i as f32 / k.max(1) as f32,
            })
            .collect())
    }

    fn name(&self) -> &str {
        &self.name
    }
}
