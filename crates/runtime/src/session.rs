//! Session lifecycle: threshold monitoring, summarization, and the
//! rotation swap that lets a conversation outlive one context window.
//!
//! Every external call enters through a [`SessionTicket`] capturing
//! `(session_id, active_generation)`. Usage inserts recompute utilization
//! and fire the edge-triggered summarize (default 60%) and rotate
//! (default 70%) thresholds. Summaries are prepared in the background so
//! the swap itself only writes state; when the model-backed strategy
//! fails, a deterministic fallback keeps the conversation moving.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use uuid::Uuid;

use sibyl_blobs::{BlobKind, BlobRef, BlobStore};
use sibyl_domain::config::{SessionConfig, SummarizationStrategy};
use sibyl_domain::error::{Error, Result};
use sibyl_domain::{PreservedState, TraceEvent};
use sibyl_providers::{CompletionRequest, ProviderRegistry};
use sibyl_state::{
    RepairSummary, RotationTrigger, Session, SessionRotation, SessionSeed, SessionStatus,
    SessionTokenUsage, StateStore, UsageDraft,
};

use crate::metrics::MetricsRegistry;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tickets and outcomes
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The `(session_id, active_generation)` pair captured when a call enters
/// the session manager.
#[derive(Debug, Clone)]
pub struct SessionTicket {
    pub conversation_id: String,
    pub session_id: String,
    pub generation: u64,
}

/// Result of binding a completed call's usage to its session.
#[derive(Debug, Clone)]
pub struct UsageOutcome {
    pub usage: SessionTokenUsage,
    /// The captured generation was stale at completion: token accounting
    /// is accepted, context side effects must be discarded.
    pub rotated_during_call: bool,
    /// This usage insert crossed the rotate threshold and swapped sessions.
    pub rotated_now: bool,
}

/// A summary built ahead of the swap.
#[derive(Debug, Clone)]
struct PreparedSummary {
    blob_ref: BlobRef,
    compression_ratio: f64,
    strategy: SummarizationStrategy,
    fallback_used: bool,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// SessionManager
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct SessionManager {
    state: Arc<StateStore>,
    blobs: Arc<dyn BlobStore>,
    providers: Arc<ProviderRegistry>,
    config: SessionConfig,
    metrics: Arc<MetricsRegistry>,
    /// Summaries prepared by the background summarize trigger, keyed by
    /// session id, consumed by the swap.
    prepared: Mutex<HashMap<String, PreparedSummary>>,
}

impl SessionManager {
    pub fn new(
        state: Arc<StateStore>,
        blobs: Arc<dyn BlobStore>,
        providers: Arc<ProviderRegistry>,
        config: SessionConfig,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        Self {
            state,
            blobs,
            providers,
            config,
            metrics,
            prepared: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// The seed every fresh session of this workspace starts from.
    pub fn seed(
        &self,
        model_name: Option<String>,
        agent_type: Option<String>,
        preserved_state: PreservedState,
        context_summary_ref: Option<String>,
    ) -> SessionSeed {
        SessionSeed {
            tokens_budget: self.config.tokens_budget,
            summarize_threshold_pct: self.config.summarize_threshold_pct,
            rotate_threshold_pct: self.config.rotate_threshold_pct,
            model_name,
            agent_type,
            preserved_state,
            context_summary_ref,
        }
    }

    /// Capture the operation boundary for a call entering the runtime.
    pub fn ticket(&self, conversation_id: &str) -> Result<SessionTicket> {
        let session = self
            .state
            .active_session(conversation_id)
            .ok_or_else(|| Error::State(format!("no active session for {conversation_id}")))?;
        Ok(SessionTicket {
            conversation_id: conversation_id.to_owned(),
            session_id: session.id,
            generation: session.active_generation,
        })
    }

    /// Overwrite a preserved-state key on the active session. Only the
    /// pipeline executor calls this; techniques get a read-only view.
    pub fn preserve(&self, conversation_id: &str, state: &PreservedState) -> Result<()> {
        let session = self
            .state
            .active_session(conversation_id)
            .ok_or_else(|| Error::State(format!("no active session for {conversation_id}")))?;
        self.state
            .session_cas(&session.id, session.active_generation, |s| {
                s.preserved_state.merge(state);
            })
    }

    // ── Operation boundary & threshold monitoring ────────────────────

    /// Bind a completed call's token usage to its session, record the
    /// completion generation, and fire any thresholds that were crossed.
    pub async fn record_call_usage(
        self: &Arc<Self>,
        ticket: &SessionTicket,
        call_key: Option<&str>,
        tokens_in: u64,
        tokens_out: u64,
    ) -> Result<UsageOutcome> {
        let usage = self.state.record_usage(
            &ticket.session_id,
            UsageDraft {
                call_key: call_key.map(str::to_owned),
                tokens_in,
                tokens_out,
                active_generation: ticket.generation,
            },
        )?;

        let session = self
            .state
            .session(&ticket.session_id)
            .ok_or_else(|| Error::State(format!("unknown session {}", ticket.session_id)))?;
        self.state.set_usage_completion_generation(
            &ticket.session_id,
            usage.turn_id,
            session.active_generation,
        )?;

        let rotated_during_call = session.active_generation != ticket.generation;
        let mut rotated_now = false;

        if !rotated_during_call && !session.status.is_terminal() {
            if usage.utilization_pct >= session.summarize_threshold_pct {
                self.trigger_summarize(&session);
            }

            if usage.utilization_pct >= session.rotate_threshold_pct
                && !session.rotation_in_progress
            {
                match self
                    .rotate(
                        &ticket.session_id,
                        session.active_generation,
                        RotationTrigger::TokenThreshold,
                    )
                    .await
                {
                    Ok(_) => rotated_now = true,
                    // Another caller won the CAS and rotated first.
                    Err(Error::SessionRotatedDuringCall { .. }) => {}
                    // A rotation is still in flight: trigger suppressed.
                    Err(Error::RotationFailed(_))
                        if self
                            .state
                            .session(&ticket.session_id)
                            .map(|s| s.rotation_in_progress)
                            .unwrap_or(false) => {}
                    Err(err) => return Err(err),
                }
            }
        }

        Ok(UsageOutcome {
            usage,
            rotated_during_call,
            rotated_now,
        })
    }

    /// Edge-triggered summarize: flip to Summarizing and build the summary
    /// in the background so tool calls are never blocked on it.
    fn trigger_summarize(self: &Arc<Self>, session: &Session) {
        let fired = self
            .state
            .mark_summarizing(&session.id, session.active_generation)
            .unwrap_or(false);
        if !fired {
            return;
        }

        TraceEvent::SummarizeTriggered {
            session_id: session.id.clone(),
            utilization_pct: session.utilization_pct(),
        }
        .emit();

        let manager = self.clone();
        let session_id = session.id.clone();
        tokio::spawn(async move {
            match manager.build_summary(&session_id).await {
                Ok(prepared) => {
                    manager.prepared.lock().insert(session_id, prepared);
                }
                Err(err) => {
                    tracing::warn!(session_id = %session_id, error = %err, "background summarization failed");
                }
            }
        });
    }

    /// Backpressure hook: proactively start summarization for any active
    /// session within 5 percentage points of its summarize threshold.
    pub fn nudge_summarization(self: &Arc<Self>) {
        for conv in self.state.conversations() {
            if conv.status.is_terminal() {
                continue;
            }
            let Some(session) = self.state.active_session(&conv.id) else {
                continue;
            };
            if session.status == SessionStatus::Active
                && session.utilization_pct() >= session.summarize_threshold_pct - 5.0
            {
                self.trigger_summarize(&session);
            }
        }
    }

    // ── Rotation swap ────────────────────────────────────────────────

    /// Execute the full swap protocol. Returns the successor session —
    /// either the summarized handoff or, after a failed attempt that
    /// still has retry budget, a restart successor carrying only the
    /// preserved state.
    pub async fn rotate(
        self: &Arc<Self>,
        session_id: &str,
        expected_generation: u64,
        trigger: RotationTrigger,
    ) -> Result<Session> {
        let session = self
            .state
            .session(session_id)
            .ok_or_else(|| Error::State(format!("unknown session {session_id}")))?;

        // Step 1: CAS the rotation flag at the expected generation.
        self.state.begin_rotation(session_id, expected_generation)?;

        let started = std::time::Instant::now();
        let timeout = Duration::from_secs(self.config.rotation_timeout_secs);

        let summary = tokio::time::timeout(timeout, self.build_summary(session_id)).await;

        let rotation_base = SessionRotation {
            id: Uuid::new_v4().to_string(),
            conversation_id: session.conversation_id.clone(),
            from_session_id: session_id.to_owned(),
            to_session_id: None,
            trigger,
            tokens_before_rotation: session.tokens_spent,
            tokens_threshold: (session.rotate_threshold_pct / 100.0 * session.tokens_budget as f64)
                as u64,
            summarization_strategy: self.config.strategy,
            context_summary_ref: None,
            compression_ratio: 1.0,
            agent_before: session.agent_type.clone(),
            agent_after: session.agent_type.clone(),
            model_before: session.model_name.clone(),
            model_after: session.model_name.clone(),
            started_at: Utc::now(),
            completed_at: None,
            handoff_ms: None,
            preserved_context_keys: session.preserved_state.keys().map(String::from).collect(),
            fallback_used: false,
            failed: false,
        };

        match summary {
            Ok(Ok(prepared)) => {
                // Steps 2–4: successor + swap + event, in one transaction.
                let successor = Session {
                    id: Uuid::new_v4().to_string(),
                    conversation_id: session.conversation_id.clone(),
                    parent_session_id: Some(session_id.to_owned()),
                    session_number: session.session_number + 1,
                    active_generation: 1,
                    rotation_in_progress: false,
                    tokens_budget: self.config.tokens_budget,
                    tokens_spent: 0,
                    summarize_threshold_pct: self.config.summarize_threshold_pct,
                    rotate_threshold_pct: self.config.rotate_threshold_pct,
                    context_summary_ref: Some(prepared.blob_ref.to_string()),
                    preserved_state: session.preserved_state.clone(),
                    status: SessionStatus::Active,
                    model_name: session.model_name.clone(),
                    agent_type: session.agent_type.clone(),
                    created_at: Utc::now(),
                    status_changed_at: Utc::now(),
                    completed_at: None,
                    rotation_attempts: session.rotation_attempts,
                    summarize_triggered: false,
                    last_turn_id: 0,
                };

                let handoff_ms = started.elapsed().as_millis() as u64;
                let rotation = SessionRotation {
                    context_summary_ref: Some(prepared.blob_ref.to_string()),
                    compression_ratio: prepared.compression_ratio,
                    summarization_strategy: prepared.strategy,
                    fallback_used: prepared.fallback_used,
                    handoff_ms: Some(handoff_ms),
                    ..rotation_base
                };

                let successor =
                    self.state
                        .complete_rotation(session_id, successor, rotation)?;

                self.metrics.observe_rotation_handoff_ms(handoff_ms as f64);
                self.metrics
                    .observe_compression_ratio(prepared.compression_ratio);
                TraceEvent::RotationCompleted {
                    conversation_id: session.conversation_id.clone(),
                    from_session_id: session_id.to_owned(),
                    to_session_id: successor.id.clone(),
                    trigger: trigger.as_str().to_owned(),
                    strategy: prepared.strategy.as_str().to_owned(),
                    compression_ratio: prepared.compression_ratio,
                    handoff_ms,
                    fallback_used: prepared.fallback_used,
                }
                .emit();

                Ok(successor)
            }
            // Summarization failed outright or overran the hard timeout.
            Ok(Err(err)) => self.rotation_failed(session_id, rotation_base, &err.to_string()),
            Err(_) => self.rotation_failed(
                session_id,
                SessionRotation {
                    trigger: RotationTrigger::Timeout,
                    ..rotation_base
                },
                &format!("rotation exceeded {}s", self.config.rotation_timeout_secs),
            ),
        }
    }

    /// The failure path: mark the session failed, record the failed
    /// rotation, and start a restart-strategy successor while attempts
    /// remain.
    fn rotation_failed(
        &self,
        session_id: &str,
        rotation: SessionRotation,
        reason: &str,
    ) -> Result<Session> {
        let failed = self.state.fail_rotation(
            session_id,
            SessionRotation {
                summarization_strategy: SummarizationStrategy::Restart,
                fallback_used: true,
                ..rotation
            },
        )?;

        TraceEvent::RotationFailed {
            session_id: session_id.to_owned(),
            reason: reason.to_owned(),
            attempt: failed.rotation_attempts,
        }
        .emit();

        if failed.rotation_attempts >= self.config.max_rotation_attempts {
            return Err(Error::RotationFailed(format!(
                "session chain exceeded {} rotation attempts: {reason}",
                self.config.max_rotation_attempts
            )));
        }

        // Restart successor: preserved state only, no summary.
        self.state.start_session(
            &failed.conversation_id,
            Some(session_id),
            self.seed(
                failed.model_name.clone(),
                failed.agent_type.clone(),
                failed.preserved_state.clone(),
                None,
            ),
        )
    }

    // ── Summarization ────────────────────────────────────────────────

    /// Build the session-summary blob, consuming a background-prepared
    /// one when available. Falls back from llm_compress to the
    /// deterministic delta strategy on any model failure.
    async fn build_summary(&self, session_id: &str) -> Result<PreparedSummary> {
        if let Some(prepared) = self.prepared.lock().remove(session_id) {
            return Ok(prepared);
        }

        let session = self
            .state
            .session(session_id)
            .ok_or_else(|| Error::State(format!("unknown session {session_id}")))?;

        let source = self.session_dialog_text(&session);
        let (digest, strategy, fallback_used) = match self.config.strategy {
            SummarizationStrategy::LlmCompress => match self.llm_digest(&source).await {
                Ok(digest) => (digest, SummarizationStrategy::LlmCompress, false),
                Err(err) => {
                    tracing::warn!(
                        session_id = %session_id,
                        error = %err,
                        "llm_compress failed, falling back to delta_compress"
                    );
                    (
                        delta_digest(&self.assistant_turns(&session)),
                        SummarizationStrategy::DeltaCompress,
                        true,
                    )
                }
            },
            SummarizationStrategy::DeltaCompress => (
                delta_digest(&self.assistant_turns(&session)),
                SummarizationStrategy::DeltaCompress,
                false,
            ),
            SummarizationStrategy::FullCopy => {
                (source.clone(), SummarizationStrategy::FullCopy, false)
            }
            SummarizationStrategy::Restart => {
                (String::new(), SummarizationStrategy::Restart, false)
            }
        };

        let text = render_summary(&session.preserved_state, &digest);
        let blob_ref = self.blobs.put_text(&text, BlobKind::SessionSummary)?;

        let compression_ratio = if strategy == SummarizationStrategy::FullCopy {
            1.0
        } else {
            source.len().max(1) as f64 / text.len().max(1) as f64
        };

        Ok(PreparedSummary {
            blob_ref,
            compression_ratio,
            strategy,
            fallback_used,
        })
    }

    /// Model-generated digest of the session dialog.
    async fn llm_digest(&self, source: &str) -> Result<String> {
        if source.is_empty() {
            return Err(Error::State("empty session dialog".into()));
        }
        let provider = self.providers.primary_llm().ok_or_else(|| {
            Error::Configuration("no LLM provider available for summarization".into())
        })?;

        let prompt = format!(
            "Summarize the following working session into a concise handoff \
             that preserves:\n\
             1. The current goal and where progress stands\n\
             2. Key decisions made and constraints discovered\n\
             3. Open questions or unfinished threads\n\n\
             Be concise but preserve all actionable context. Write in \
             present tense. Omit pleasantries.\n\nSESSION:\n{source}"
        );

        let resp = provider
            .complete(CompletionRequest {
                prompt,
                temperature: Some(0.1),
                max_tokens: Some(2000),
                ..Default::default()
            })
            .await?;
        Ok(resp.text)
    }

    /// Reconstruct the session's dialog from its call blobs.
    fn session_dialog_text(&self, session: &Session) -> String {
        let mut buf = String::new();
        for call in self.state.calls_for_conversation(&session.conversation_id) {
            if call.session_id != session.id {
                continue;
            }
            if let Ok(prompt_ref) = BlobRef::parse(&call.prompt_ref) {
                if let Ok(prompt) = self.blobs.get_text(&prompt_ref) {
                    push_turn(&mut buf, "User", &prompt);
                }
            }
            if let Some(response_ref) = &call.response_ref {
                if let Ok(response_ref) = BlobRef::parse(response_ref) {
                    if let Ok(response) = self.blobs.get_text(&response_ref) {
                        push_turn(&mut buf, "Assistant", &response);
                    }
                }
            }
        }
        buf
    }

    /// Assistant turns only — the deterministic delta source.
    fn assistant_turns(&self, session: &Session) -> Vec<String> {
        let mut turns = Vec::new();
        for call in self.state.calls_for_conversation(&session.conversation_id) {
            if call.session_id != session.id {
                continue;
            }
            if let Some(response_ref) = &call.response_ref {
                if let Ok(response_ref) = BlobRef::parse(response_ref) {
                    if let Ok(response) = self.blobs.get_text(&response_ref) {
                        turns.push(response);
                    }
                }
            }
        }
        turns
    }

    // ── Crash recovery ───────────────────────────────────────────────

    /// Boot-time sweep: find and repair crash damage, counting each
    /// finding as an integrity violation.
    ///
    /// Reservations orphaned by the crash are released first, so the
    /// token-accounting scan that follows sees settled counters.
    pub fn recover(&self) -> RepairSummary {
        let stale = self.state.release_stale_reservations();

        let timeout = chrono::Duration::seconds(self.config.rotation_timeout_secs as i64);
        let report = self.state.integrity_scan(timeout);

        let violations = stale.len() + report.total_findings();
        if violations == 0 {
            return RepairSummary::default();
        }
        self.metrics.inc_integrity_violations(violations as u64);
        for finding in report.findings() {
            tracing::warn!(finding = %finding, "boot integrity finding");
        }

        let config = self.config.clone();
        let mut summary = self.state.integrity_repair(&report, move |stuck| SessionSeed {
            tokens_budget: config.tokens_budget,
            summarize_threshold_pct: config.summarize_threshold_pct,
            rotate_threshold_pct: config.rotate_threshold_pct,
            model_name: stuck.model_name.clone(),
            agent_type: stuck.agent_type.clone(),
            preserved_state: PreservedState::new(),
            context_summary_ref: None,
        });
        summary.stale_reservations_released = stale.len();
        summary
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Append one dialog turn, truncating very long entries so summary
/// prompts stay manageable.
fn push_turn(buf: &mut String, role: &str, content: &str) {
    buf.push_str(role);
    buf.push_str(": ");
    if content.len() > 2000 {
        let head = truncate_at_boundary(content, 1000);
        buf.push_str(head);
        buf.push_str(" [...] ");
        let tail_start = floor_char_boundary(content, content.len() - 500);
        buf.push_str(&content[tail_start..]);
    } else {
        buf.push_str(content);
    }
    buf.push('\n');
}

/// Deterministic digest: one truncated line per assistant turn.
fn delta_digest(turns: &[String]) -> String {
    let mut out = String::new();
    for turn in turns {
        out.push_str("- ");
        out.push_str(truncate_at_boundary(turn, 400));
        out.push('\n');
    }
    out
}

/// The summary blob is plain text: preserved-state header, then digest.
fn render_summary(preserved: &PreservedState, digest: &str) -> String {
    let mut out = String::new();
    if !preserved.is_empty() {
        out.push_str("preserved_state:\n");
        // Serialize through JSON for stable scalar rendering.
        if let Ok(serde_json::Value::Object(map)) = serde_json::to_value(preserved) {
            for (key, value) in map {
                out.push_str("  ");
                out.push_str(&key);
                out.push_str(": ");
                match value {
                    serde_json::Value::String(s) => out.push_str(&s),
                    other => out.push_str(&other.to_string()),
                }
                out.push('\n');
            }
        }
        out.push('\n');
    }
    out.push_str(digest);
    out
}

fn truncate_at_boundary(s: &str, max: usize) -> &str {
    &s[..floor_char_boundary(s, max.min(s.len()))]
}

fn floor_char_boundary(s: &str, mut index: usize) -> usize {
    while index > 0 && !s.is_char_boundary(index) {
        index -= 1;
    }
    index
}

#[cfg(test)]
mod tests {
    use super::*;
    use sibyl_blobs::MemoryBlobStore;
    use sibyl_providers::mock::MockLlm;

    fn manager_with(
        strategy: SummarizationStrategy,
        llm: Option<MockLlm>,
    ) -> (Arc<SessionManager>, Arc<StateStore>) {
        let state = Arc::new(StateStore::in_memory());
        let blobs: Arc<dyn BlobStore> = Arc::new(MemoryBlobStore::new());
        let mut registry = ProviderRegistry::new();
        if let Some(llm) = llm {
            registry.register_llm(Arc::new(llm));
        }
        let config = SessionConfig {
            tokens_budget: 1000,
            strategy,
            ..Default::default()
        };
        let manager = Arc::new(SessionManager::new(
            state.clone(),
            blobs,
            Arc::new(registry),
            config,
            Arc::new(MetricsRegistry::new()),
        ));
        (manager, state)
    }

    fn start_conversation(manager: &SessionManager, state: &StateStore) -> (String, String) {
        let (conv, session) = state
            .create_conversation(
                "qa",
                100_000,
                "v1",
                serde_json::json!({}),
                manager.seed(Some("m".into()), None, PreservedState::new(), None),
            )
            .unwrap();
        (conv.id, session.id)
    }

    #[tokio::test]
    async fn usage_below_thresholds_changes_nothing() {
        let (manager, state) = manager_with(SummarizationStrategy::DeltaCompress, None);
        let (conv, session) = start_conversation(&manager, &state);

        let ticket = manager.ticket(&conv).unwrap();
        let outcome = manager
            .record_call_usage(&ticket, Some("k1"), 100, 100)
            .await
            .unwrap();

        assert!(!outcome.rotated_now);
        assert!(!outcome.rotated_during_call);
        assert_eq!(outcome.usage.generation_at_completion, Some(1));
        assert_eq!(
            state.session(&session).unwrap().status,
            SessionStatus::Active
        );
    }

    #[tokio::test]
    async fn summarize_threshold_fires_once() {
        let (manager, state) = manager_with(SummarizationStrategy::DeltaCompress, None);
        let (conv, session) = start_conversation(&manager, &state);

        // 650 / 1000 = 65% — above summarize (60), below rotate (70).
        let ticket = manager.ticket(&conv).unwrap();
        manager
            .record_call_usage(&ticket, Some("k1"), 500, 150)
            .await
            .unwrap();

        let s = state.session(&session).unwrap();
        assert_eq!(s.status, SessionStatus::Summarizing);
        assert!(s.summarize_triggered);

        // A second crossing does not re-fire (status stays, no panic).
        let ticket = manager.ticket(&conv).unwrap();
        manager
            .record_call_usage(&ticket, Some("k2"), 10, 10)
            .await
            .unwrap();
        assert_eq!(
            state.session(&session).unwrap().status,
            SessionStatus::Summarizing
        );
    }

    #[tokio::test]
    async fn rotate_threshold_swaps_sessions() {
        let (manager, state) = manager_with(SummarizationStrategy::DeltaCompress, None);
        let (conv, old_session) = start_conversation(&manager, &state);

        manager
            .preserve(&conv, &{
                let mut p = PreservedState::new();
                p.insert("phase", "fix");
                p.insert("attempt", 2i64);
                p
            })
            .unwrap();

        // 750 / 1000 = 75% — crosses rotate threshold.
        let ticket = manager.ticket(&conv).unwrap();
        let outcome = manager
            .record_call_usage(&ticket, Some("k1"), 700, 50)
            .await
            .unwrap();
        assert!(outcome.rotated_now);

        let old = state.session(&old_session).unwrap();
        assert_eq!(old.status, SessionStatus::Completed);
        assert_eq!(old.active_generation, 2);

        let active = state.active_session(&conv).unwrap();
        assert_eq!(active.session_number, 2);
        assert_eq!(active.active_generation, 1);
        assert_eq!(active.parent_session_id.as_deref(), Some(old_session.as_str()));
        assert!(active.context_summary_ref.is_some());
        assert!(active.preserved_state.get("phase").is_some());

        let rotations = state.rotations_for_conversation(&conv);
        assert_eq!(rotations.len(), 1);
        assert_eq!(rotations[0].trigger, RotationTrigger::TokenThreshold);
        assert!(!rotations[0].failed);
        assert!(rotations[0]
            .preserved_context_keys
            .contains(&"phase".to_string()));
    }

    #[tokio::test]
    async fn stale_ticket_is_flagged_not_rejected() {
        let (manager, state) = manager_with(SummarizationStrategy::DeltaCompress, None);
        let (conv, old_session) = start_conversation(&manager, &state);

        let stale = manager.ticket(&conv).unwrap();

        // Rotate underneath the in-flight call.
        manager
            .rotate(&old_session, 1, RotationTrigger::Manual)
            .await
            .unwrap();

        let outcome = manager
            .record_call_usage(&stale, Some("k1"), 100, 50)
            .await
            .unwrap();
        assert!(outcome.rotated_during_call);
        assert!(!outcome.rotated_now);
        // Accounting accepted on the old session's ledger.
        assert_eq!(outcome.usage.active_generation, 1);
        assert_eq!(outcome.usage.generation_at_completion, Some(2));
    }

    #[tokio::test]
    async fn llm_compress_uses_provider_and_falls_back() {
        // First rotation: provider succeeds with a compact digest.
        let llm = MockLlm::new("main").then(sibyl_providers::mock::MockOutcome::SucceedWith {
            text: "tight digest".into(),
        });
        let (manager, state) = manager_with(SummarizationStrategy::LlmCompress, Some(llm));
        let (conv, session_id) = start_conversation(&manager, &state);

        // Give the session some dialog to summarize.
        let prompt_ref = manager
            .blobs
            .put_text(&"question ".repeat(100), BlobKind::Prompt)
            .unwrap();
        let response_ref = manager
            .blobs
            .put_text(&"answer ".repeat(100), BlobKind::Response)
            .unwrap();
        state
            .insert_call(call_row("k1", &conv, &session_id, &prompt_ref, &response_ref))
            .unwrap();

        let successor = manager
            .rotate(&session_id, 1, RotationTrigger::Manual)
            .await
            .unwrap();
        let rotations = state.rotations_for_conversation(&conv);
        assert_eq!(
            rotations[0].summarization_strategy,
            SummarizationStrategy::LlmCompress
        );
        assert!(!rotations[0].fallback_used);
        assert!(rotations[0].compression_ratio >= 5.0);
        assert_eq!(successor.session_number, 2);
    }

    #[tokio::test]
    async fn llm_failure_falls_back_to_delta() {
        let llm = MockLlm::new("main").fail_terminal_once("model overloaded");
        let (manager, state) = manager_with(SummarizationStrategy::LlmCompress, Some(llm));
        let (conv, session_id) = start_conversation(&manager, &state);

        let prompt_ref = manager
            .blobs
            .put_text("what is the plan", BlobKind::Prompt)
            .unwrap();
        let response_ref = manager
            .blobs
            .put_text(&"the plan is long ".repeat(50), BlobKind::Response)
            .unwrap();
        state
            .insert_call(call_row("k1", &conv, &session_id, &prompt_ref, &response_ref))
            .unwrap();

        manager
            .rotate(&session_id, 1, RotationTrigger::Manual)
            .await
            .unwrap();
        let rotations = state.rotations_for_conversation(&conv);
        assert_eq!(
            rotations[0].summarization_strategy,
            SummarizationStrategy::DeltaCompress
        );
        assert!(rotations[0].fallback_used);
    }

    #[tokio::test]
    async fn second_rotation_attempt_is_rejected_by_cas() {
        let (manager, state) = manager_with(SummarizationStrategy::DeltaCompress, None);
        let (_, session_id) = start_conversation(&manager, &state);

        manager
            .rotate(&session_id, 1, RotationTrigger::Manual)
            .await
            .unwrap();
        // The old session rotated away; its generation is now 2 and its
        // status Completed, so a stale retry must fail.
        let err = manager
            .rotate(&session_id, 1, RotationTrigger::Manual)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::SessionRotatedDuringCall { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn rotation_timeout_fails_session_and_starts_restart_successor() {
        // llm_compress against a provider that hangs past the 1s bound.
        let llm = MockLlm::new("main").then(sibyl_providers::mock::MockOutcome::Delay {
            ms: 5_000,
        });
        let state = Arc::new(StateStore::in_memory());
        let blobs: Arc<dyn BlobStore> = Arc::new(MemoryBlobStore::new());
        let mut registry = ProviderRegistry::new();
        registry.register_llm(Arc::new(llm));
        let config = SessionConfig {
            tokens_budget: 1000,
            rotation_timeout_secs: 1,
            strategy: SummarizationStrategy::LlmCompress,
            ..Default::default()
        };
        let manager = Arc::new(SessionManager::new(
            state.clone(),
            blobs,
            Arc::new(registry),
            config,
            Arc::new(MetricsRegistry::new()),
        ));
        let (conv, session_id) = start_conversation(&manager, &state);
        manager
            .preserve(&conv, &{
                let mut p = PreservedState::new();
                p.insert("phase", "fix");
                p
            })
            .unwrap();

        // Non-empty dialog so the summarizer actually reaches the model.
        let prompt_ref = manager.blobs.put_text("q", BlobKind::Prompt).unwrap();
        let response_ref = manager.blobs.put_text("a", BlobKind::Response).unwrap();
        state
            .insert_call(call_row("k1", &conv, &session_id, &prompt_ref, &response_ref))
            .unwrap();

        let successor = manager
            .rotate(&session_id, 1, RotationTrigger::TokenThreshold)
            .await
            .unwrap();

        let old = state.session(&session_id).unwrap();
        assert_eq!(old.status, SessionStatus::Failed);
        assert!(!old.rotation_in_progress);

        let rotations = state.rotations_for_conversation(&conv);
        assert_eq!(rotations.len(), 1);
        assert!(rotations[0].failed);
        assert_eq!(rotations[0].trigger, RotationTrigger::Timeout);

        // Restart successor: preserved state only, no summary.
        assert_eq!(successor.session_number, 2);
        assert!(successor.context_summary_ref.is_none());
        assert!(successor.preserved_state.get("phase").is_some());
        assert_eq!(successor.rotation_attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn rotation_failure_escalates_after_max_attempts() {
        let llm = MockLlm::new("main").then(sibyl_providers::mock::MockOutcome::Delay {
            ms: 5_000,
        });
        let state = Arc::new(StateStore::in_memory());
        let blobs: Arc<dyn BlobStore> = Arc::new(MemoryBlobStore::new());
        let mut registry = ProviderRegistry::new();
        registry.register_llm(Arc::new(llm));
        let config = SessionConfig {
            tokens_budget: 1000,
            rotation_timeout_secs: 1,
            max_rotation_attempts: 1,
            strategy: SummarizationStrategy::LlmCompress,
            ..Default::default()
        };
        let manager = Arc::new(SessionManager::new(
            state.clone(),
            blobs,
            Arc::new(registry),
            config,
            Arc::new(MetricsRegistry::new()),
        ));
        let (conv, session_id) = start_conversation(&manager, &state);

        let prompt_ref = manager.blobs.put_text("q", BlobKind::Prompt).unwrap();
        let response_ref = manager.blobs.put_text("a", BlobKind::Response).unwrap();
        state
            .insert_call(call_row("k1", &conv, &session_id, &prompt_ref, &response_ref))
            .unwrap();

        let err = manager
            .rotate(&session_id, 1, RotationTrigger::TokenThreshold)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::RotationFailed(_)));
        // No successor: the conversation has no active session left.
        assert!(state.active_session(&conv).is_none());
    }

    #[tokio::test]
    async fn restart_summary_is_preserved_state_only() {
        let (manager, state) = manager_with(SummarizationStrategy::Restart, None);
        let (conv, session_id) = start_conversation(&manager, &state);
        manager
            .preserve(&conv, &{
                let mut p = PreservedState::new();
                p.insert("cursor", 17i64);
                p
            })
            .unwrap();

        let successor = manager
            .rotate(&session_id, 1, RotationTrigger::Manual)
            .await
            .unwrap();

        let summary_ref = BlobRef::parse(successor.context_summary_ref.as_deref().unwrap()).unwrap();
        let text = manager.blobs.get_text(&summary_ref).unwrap();
        assert!(text.contains("cursor: 17"));
        assert!(text.trim_end().ends_with("cursor: 17"));
    }

    #[tokio::test]
    async fn recover_counts_violations() {
        // A zero rotation timeout makes any mid-rotation session count as
        // stuck the moment the sweep runs.
        let state = Arc::new(StateStore::in_memory());
        let blobs: Arc<dyn BlobStore> = Arc::new(MemoryBlobStore::new());
        let config = SessionConfig {
            tokens_budget: 1000,
            rotation_timeout_secs: 0,
            strategy: SummarizationStrategy::DeltaCompress,
            ..Default::default()
        };
        let manager = Arc::new(SessionManager::new(
            state.clone(),
            blobs,
            Arc::new(ProviderRegistry::new()),
            config,
            Arc::new(MetricsRegistry::new()),
        ));
        let (conv, session_id) = start_conversation(&manager, &state);

        state.begin_rotation(&session_id, 1).unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        let summary = manager.recover();
        assert_eq!(summary.stuck_repaired, 1);
        assert_eq!(manager.metrics.snapshot().integrity_violations, 1);

        // The conversation has a fresh restart successor.
        let successor = state.active_session(&conv).unwrap();
        assert_eq!(successor.session_number, 2);
    }

    fn call_row(
        key: &str,
        conversation_id: &str,
        session_id: &str,
        prompt_ref: &BlobRef,
        response_ref: &BlobRef,
    ) -> sibyl_state::SubagentCall {
        sibyl_state::SubagentCall {
            call_key: key.to_owned(),
            id: Uuid::new_v4().to_string(),
            conversation_id: conversation_id.to_owned(),
            session_id: session_id.to_owned(),
            phase: "p".into(),
            agent_type: None,
            model_name: "m".into(),
            provider: "main".into(),
            provider_fingerprint: None,
            prompt_ref: prompt_ref.to_string(),
            response_ref: Some(response_ref.to_string()),
            tokens_in_reserved: 0,
            tokens_in_actual: 0,
            tokens_out_actual: 0,
            cost_usd: sibyl_domain::CostUsd::ZERO,
            status: sibyl_state::CallStatus::Succeeded,
            started_at: Utc::now(),
            completed_at: Some(Utc::now()),
            duration_ms: Some(1),
            retry_of: None,
            retry_count: 0,
            finish_reason: Some("stop".into()),
            error: None,
            error_kind: None,
            correlation_id: Uuid::new_v4().to_string(),
            span_id: Uuid::new_v4().to_string(),
        }
    }
}
