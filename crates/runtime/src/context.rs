//! The explicit runtime context: one immutable bundle of `Arc` handles
//! per running workspace, built from a validated config snapshot. There
//! are no global singletons; everything a step touches flows through
//! here.

use std::path::Path;
use std::sync::Arc;

use sha2::{Digest, Sha256};

use sibyl_blobs::{BlobKind, BlobRef, BlobStore, FsBlobStore, MemoryBlobStore, RedactionPipeline};
use sibyl_domain::config::{StepConfig, WorkspaceConfig};
use sibyl_domain::error::{Error, Result};
use sibyl_providers::ProviderRegistry;
use sibyl_state::{Session, StateStore};

use crate::budget::{BudgetSnapshot, BudgetTracker};
use crate::cache::ResponseCache;
use crate::cancel::CancelRegistry;
use crate::metrics::MetricsRegistry;
use crate::scheduler::{CallHandle, CallResult, CallSpec, WorkerScheduler};
use crate::session::SessionManager;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// RuntimeContext
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Shared handles for one running workspace.
///
/// Fields are grouped by concern:
/// - **Config** — the pinned snapshot and its content-derived version
/// - **Storage** — state store and blob store
/// - **Execution** — providers, budget, sessions, scheduler, cache
/// - **Observability** — metrics and cancellation
#[derive(Clone)]
pub struct RuntimeContext {
    // ── Config ────────────────────────────────────────────────────────
    pub config: Arc<WorkspaceConfig>,
    /// Content hash of the config snapshot every conversation pins.
    pub config_version: String,

    // ── Storage ───────────────────────────────────────────────────────
    pub state: Arc<StateStore>,
    pub blobs: Arc<dyn BlobStore>,

    // ── Execution ─────────────────────────────────────────────────────
    pub providers: Arc<ProviderRegistry>,
    pub budget: Arc<BudgetTracker>,
    pub sessions: Arc<SessionManager>,
    pub scheduler: Arc<WorkerScheduler>,
    pub cache: Arc<ResponseCache>,

    // ── Observability ─────────────────────────────────────────────────
    pub metrics: Arc<MetricsRegistry>,
    pub cancel: Arc<CancelRegistry>,
}

impl std::fmt::Debug for RuntimeContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeContext")
            .field("config_version", &self.config_version)
            .finish_non_exhaustive()
    }
}

impl RuntimeContext {
    /// Wire the full runtime from a workspace config and the injected
    /// provider instances. `state_path = None` keeps everything in memory
    /// (tests); a path opens the durable stores and runs crash recovery.
    pub fn build(
        config: WorkspaceConfig,
        providers: ProviderRegistry,
        state_path: Option<&Path>,
    ) -> Result<Self> {
        let issues = config.validate();
        for issue in &issues {
            match issue.severity {
                sibyl_domain::config::ConfigSeverity::Error => {
                    tracing::error!(issue = %issue, "config validation")
                }
                sibyl_domain::config::ConfigSeverity::Warning => {
                    tracing::warn!(issue = %issue, "config validation")
                }
            }
        }
        if WorkspaceConfig::has_errors(&issues) {
            let joined = issues
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join("; ");
            return Err(Error::Configuration(joined));
        }

        let config_version = config_version_of(&config)?;

        let state = Arc::new(match state_path {
            Some(path) => StateStore::open(path)?,
            None => StateStore::in_memory(),
        });
        let blobs: Arc<dyn BlobStore> = match state_path {
            Some(path) => Arc::new(FsBlobStore::new(
                path,
                RedactionPipeline::from_config(&config.blobs),
            )?),
            None => Arc::new(MemoryBlobStore::new()),
        };

        let providers = Arc::new(providers.with_primary_from(&config.providers));
        let metrics = Arc::new(MetricsRegistry::new());
        let budget = Arc::new(BudgetTracker::new(state.clone(), config.budget.clone()));
        let sessions = Arc::new(SessionManager::new(
            state.clone(),
            blobs.clone(),
            providers.clone(),
            config.session.clone(),
            metrics.clone(),
        ));
        let cache = Arc::new(ResponseCache::new(&config.cache));
        let cancel = Arc::new(CancelRegistry::new());
        let scheduler = Arc::new(WorkerScheduler::new(
            state.clone(),
            blobs.clone(),
            providers.clone(),
            budget.clone(),
            sessions.clone(),
            cache.clone(),
            metrics.clone(),
            cancel.clone(),
            config.scheduler.clone(),
        ));

        // Boot-time crash recovery before anything new runs.
        let repaired = sessions.recover();
        if repaired.total() > 0 {
            tracing::info!(repaired = repaired.total(), "crash recovery applied");
        }

        Ok(Self {
            config: Arc::new(config),
            config_version,
            state,
            blobs,
            providers,
            budget,
            sessions,
            scheduler,
            cache,
            metrics,
            cancel,
        })
    }
}

/// The config version is the content hash of the canonical JSON rendering,
/// so identical configs share a snapshot row.
fn config_version_of(config: &WorkspaceConfig) -> Result<String> {
    let canonical = serde_json::to_vec(config)?;
    let digest = Sha256::digest(&canonical);
    Ok(format!("cfg-{}", &hex::encode(digest)[..12]))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// TechniqueContext
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// What a technique sees while executing one step: capability handles to
/// the scheduler and blob store, plus read-only budget and session views.
/// There is deliberately no way to mutate session state from here.
#[derive(Clone)]
pub struct TechniqueContext {
    conversation_id: String,
    step: StepConfig,
    scheduler: Arc<WorkerScheduler>,
    blobs: Arc<dyn BlobStore>,
    providers: Arc<ProviderRegistry>,
    budget: Arc<BudgetTracker>,
    state: Arc<StateStore>,
}

impl TechniqueContext {
    pub(crate) fn new(
        conversation_id: String,
        step: StepConfig,
        scheduler: Arc<WorkerScheduler>,
        blobs: Arc<dyn BlobStore>,
        providers: Arc<ProviderRegistry>,
        budget: Arc<BudgetTracker>,
        state: Arc<StateStore>,
    ) -> Self {
        Self {
            conversation_id,
            step,
            scheduler,
            blobs,
            providers,
            budget,
            state,
        }
    }

    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    pub fn phase(&self) -> &str {
        self.step.phase_name()
    }

    pub fn params(&self) -> &serde_json::Value {
        &self.step.params
    }

    /// A call spec prefilled with this step's phase, deadline, and cache
    /// policy.
    pub fn call_spec(
        &self,
        provider: &str,
        model_name: &str,
        prompt_ref: &str,
        estimate_tokens: u64,
    ) -> CallSpec {
        let mut spec = CallSpec::new(
            &self.conversation_id,
            self.step.phase_name(),
            provider,
            model_name,
            prompt_ref,
            estimate_tokens,
        );
        spec.timeout = std::time::Duration::from_secs(self.step.timeout_secs);
        spec.use_cache = self.step.cache;
        spec.retry_timeout_once = self.step.retry_timeout_once;
        spec
    }

    /// Submit one external call through the worker scheduler.
    pub fn submit(&self, spec: CallSpec) -> Result<CallHandle> {
        self.scheduler.submit(spec)
    }

    /// Submit a batch and await results in submission order.
    pub async fn run_batch(&self, specs: Vec<CallSpec>) -> Result<Vec<CallResult>> {
        self.scheduler.run_batch(specs).await
    }

    /// Capability-typed access to embedding and vector-store providers.
    /// LLM completions go through `submit` so accounting stays correct.
    pub fn providers(&self) -> &ProviderRegistry {
        &self.providers
    }

    pub fn put_blob(&self, text: &str, kind: BlobKind) -> Result<BlobRef> {
        self.blobs.put_text(text, kind)
    }

    pub fn get_blob(&self, blob_ref: &BlobRef) -> Result<String> {
        self.blobs.get_text(blob_ref)
    }

    /// Read-only budget position.
    pub fn budget(&self) -> Result<BudgetSnapshot> {
        self.budget.snapshot(&self.conversation_id)
    }

    /// Read-only snapshot of the active session.
    pub fn session(&self) -> Option<Session> {
        self.state.active_session(&self.conversation_id)
    }
}
