//! The pipeline executor: sequences declared technique steps, threads
//! each step's output into the next step's input, records a resumable
//! checkpoint per named phase, and terminates the conversation exactly
//! once with a structured outcome.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use serde::Serialize;
use sha2::{Digest, Sha256};

use sibyl_blobs::{BlobKind, BlobRef};
use sibyl_domain::config::StepConfig;
use sibyl_domain::error::{Error, Result};
use sibyl_domain::{CostUsd, ErrorKind, PreservedState, TraceEvent};
use sibyl_state::{CheckpointStatus, ConversationStatus, PhaseCheckpoint};

use crate::context::{RuntimeContext, TechniqueContext};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Technique interface
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One unit of pipeline work. Techniques receive capability handles
/// through the context and must not mutate session state directly.
#[async_trait::async_trait]
pub trait Technique: Send + Sync {
    fn name(&self) -> &str;

    async fn execute(
        &self,
        inputs: serde_json::Value,
        params: &serde_json::Value,
        ctx: &TechniqueContext,
    ) -> Result<serde_json::Value>;
}

/// Named techniques available to pipelines (the "shops" content).
#[derive(Default)]
pub struct TechniqueRegistry {
    map: HashMap<String, Arc<dyn Technique>>,
}

impl TechniqueRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, technique: Arc<dyn Technique>) {
        self.map.insert(technique.name().to_owned(), technique);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Technique>> {
        self.map.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.map.keys().cloned().collect();
        names.sort();
        names
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Outcomes
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize)]
pub struct RunMetrics {
    pub tokens_spent: u64,
    pub cost_usd: CostUsd,
    pub steps_run: usize,
    pub steps_skipped: usize,
    pub rotations: usize,
    pub duration_ms: u64,
}

/// Everything needed to audit or resume a failed conversation.
#[derive(Debug, Clone, Serialize)]
pub struct FailureOutcome {
    pub kind: ErrorKind,
    pub step: String,
    pub message: String,
    pub last_checkpoint_phase: Option<String>,
    pub call_keys: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineOutcome {
    pub status: ConversationStatus,
    pub outputs: serde_json::Value,
    pub conversation_id: String,
    pub metrics: RunMetrics,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureOutcome>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// PipelineExecutor
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct PipelineExecutor {
    ctx: RuntimeContext,
    techniques: Arc<TechniqueRegistry>,
}

impl PipelineExecutor {
    pub fn new(ctx: RuntimeContext, techniques: Arc<TechniqueRegistry>) -> Self {
        Self { ctx, techniques }
    }

    pub fn context(&self) -> &RuntimeContext {
        &self.ctx
    }

    /// Run a declared pipeline. Creates a conversation (or resumes the
    /// given one, skipping completed phases), executes steps in order,
    /// and returns the structured outcome. `Err` is reserved for
    /// configuration-level failures that never reached a conversation.
    pub async fn run(
        &self,
        pipeline_name: &str,
        inputs: serde_json::Value,
        conversation_id: Option<&str>,
    ) -> Result<PipelineOutcome> {
        let pipeline = self
            .ctx
            .config
            .pipelines
            .get(pipeline_name)
            .cloned()
            .ok_or_else(|| {
                Error::Configuration(format!("unknown pipeline '{pipeline_name}'"))
            })?;

        let started = Instant::now();
        let conv_id = self.open_conversation(pipeline_name, conversation_id)?;
        let token = self.ctx.cancel.conversation(&conv_id);

        let conversation = self
            .ctx
            .state
            .conversation(&conv_id)
            .ok_or_else(|| Error::State(format!("unknown conversation {conv_id}")))?;
        TraceEvent::ConversationStarted {
            conversation_id: conv_id.clone(),
            workflow_type: pipeline_name.to_owned(),
            token_budget: conversation.token_budget,
        }
        .emit();

        let mut current = inputs;
        let mut steps_run = 0usize;
        let mut steps_skipped = 0usize;

        for step in &pipeline.steps {
            if token.is_cancelled() {
                return self.finish(
                    &conv_id,
                    ConversationStatus::Cancelled,
                    Some((Error::Cancelled, step.name.clone())),
                    current,
                    steps_run,
                    steps_skipped,
                    started,
                );
            }

            let phase = step.phase_name();

            // Resume: a completed checkpoint replays its output.
            if let Some(checkpoint) = self.ctx.state.checkpoint(&conv_id, phase) {
                if checkpoint.status == CheckpointStatus::Completed {
                    let raw = self
                        .ctx
                        .blobs
                        .get_text(&BlobRef::parse(&checkpoint.output_ref)?)?;
                    current = serde_json::from_str(&raw)?;
                    steps_skipped += 1;
                    tracing::info!(
                        conversation_id = %conv_id,
                        phase,
                        "skipping step with completed checkpoint"
                    );
                    continue;
                }
            }

            // The executor owns the preserved progress markers.
            let mut marker = PreservedState::new();
            marker.insert("phase", step.name.as_str());
            self.ctx.sessions.preserve(&conv_id, &marker)?;

            let output = match self.run_step(&conv_id, step, current.clone()).await {
                Ok(output) => output,
                Err(err) => {
                    let status = if matches!(err, Error::Cancelled) {
                        ConversationStatus::Cancelled
                    } else {
                        ConversationStatus::Failed
                    };
                    return self.finish(
                        &conv_id,
                        status,
                        Some((err, step.name.clone())),
                        current,
                        steps_run,
                        steps_skipped,
                        started,
                    );
                }
            };

            self.record_checkpoint(&conv_id, phase, &output)?;
            steps_run += 1;
            current = output;
        }

        self.finish(
            &conv_id,
            ConversationStatus::Completed,
            None,
            current,
            steps_run,
            steps_skipped,
            started,
        )
    }

    /// Cancel a running conversation: the in-flight phase stops, later
    /// phases never start.
    pub fn cancel(&self, conversation_id: &str) -> bool {
        self.ctx.cancel.cancel_conversation(conversation_id)
    }

    // ── Internals ────────────────────────────────────────────────────

    fn open_conversation(
        &self,
        pipeline_name: &str,
        conversation_id: Option<&str>,
    ) -> Result<String> {
        match conversation_id {
            Some(id) => {
                let conv = self
                    .ctx
                    .state
                    .conversation(id)
                    .ok_or_else(|| Error::State(format!("unknown conversation {id}")))?;
                if conv.status.is_terminal() {
                    return Err(Error::State(format!(
                        "conversation {id} already finished as {:?}",
                        conv.status
                    )));
                }
                if self.ctx.state.active_session(id).is_none() {
                    self.ctx.state.start_session(
                        id,
                        None,
                        self.ctx
                            .sessions
                            .seed(self.default_model(), None, PreservedState::new(), None),
                    )?;
                }
                Ok(id.to_owned())
            }
            None => {
                let (conv, _session) = self.ctx.state.create_conversation(
                    pipeline_name,
                    self.ctx.config.budget.max_tokens,
                    &self.ctx.config_version,
                    serde_json::to_value(&*self.ctx.config)?,
                    self.ctx
                        .sessions
                        .seed(self.default_model(), None, PreservedState::new(), None),
                )?;
                self.ctx.metrics.session_opened();
                Ok(conv.id)
            }
        }
    }

    fn default_model(&self) -> Option<String> {
        self.ctx
            .config
            .providers
            .llm
            .first()
            .and_then(|entry| entry.model.clone())
    }

    async fn run_step(
        &self,
        conv_id: &str,
        step: &StepConfig,
        inputs: serde_json::Value,
    ) -> Result<serde_json::Value> {
        let technique = self.techniques.get(&step.technique).ok_or_else(|| {
            Error::Configuration(format!("unknown technique '{}'", step.technique))
        })?;

        let tech_ctx = TechniqueContext::new(
            conv_id.to_owned(),
            step.clone(),
            self.ctx.scheduler.clone(),
            self.ctx.blobs.clone(),
            self.ctx.providers.clone(),
            self.ctx.budget.clone(),
            self.ctx.state.clone(),
        );

        let mut result = technique
            .execute(inputs.clone(), &step.params, &tech_ctx)
            .await;

        // The session rotated under the step: retry once on the successor.
        if matches!(result, Err(Error::SessionRotatedDuringCall { .. })) {
            tracing::warn!(
                conversation_id = %conv_id,
                step = %step.name,
                "session rotated during call, retrying step on the new session"
            );
            result = technique
                .execute(inputs.clone(), &step.params, &tech_ctx)
                .await;
        }

        match result {
            Ok(output) => Ok(output),
            Err(err)
                if step.fallback.is_some()
                    && matches!(
                        err.kind(),
                        ErrorKind::ProviderTerminal
                            | ErrorKind::BudgetExhausted
                            | ErrorKind::Timeout
                    ) =>
            {
                let fallback_name = step.fallback.as_deref().unwrap_or_default();
                let fallback = self.techniques.get(fallback_name).ok_or_else(|| {
                    Error::Configuration(format!("unknown fallback technique '{fallback_name}'"))
                })?;
                tracing::warn!(
                    conversation_id = %conv_id,
                    step = %step.name,
                    fallback = fallback_name,
                    error = %err,
                    "routing step to fallback technique"
                );
                fallback.execute(inputs, &step.params, &tech_ctx).await
            }
            Err(err) => Err(err),
        }
    }

    fn record_checkpoint(
        &self,
        conv_id: &str,
        phase: &str,
        output: &serde_json::Value,
    ) -> Result<()> {
        let canonical = serde_json::to_string(output)?;
        let context_hash = hex::encode(Sha256::digest(canonical.as_bytes()));
        let output_ref = self.ctx.blobs.put_text(&canonical, BlobKind::Context)?;

        self.ctx.state.record_checkpoint(PhaseCheckpoint {
            conversation_id: conv_id.to_owned(),
            phase: phase.to_owned(),
            context_hash: context_hash.clone(),
            output_ref: output_ref.to_string(),
            status: CheckpointStatus::Completed,
            recorded_at: Utc::now(),
        })?;
        self.ctx.state.with_conversation_mut(conv_id, |c| {
            c.context_hash = Some(context_hash.clone());
        })?;

        TraceEvent::CheckpointRecorded {
            conversation_id: conv_id.to_owned(),
            phase: phase.to_owned(),
            context_hash,
        }
        .emit();
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn finish(
        &self,
        conv_id: &str,
        status: ConversationStatus,
        error: Option<(Error, String)>,
        outputs: serde_json::Value,
        steps_run: usize,
        steps_skipped: usize,
        started: Instant,
    ) -> Result<PipelineOutcome> {
        let failure = error.map(|(err, step)| FailureOutcome {
            kind: err.kind(),
            step,
            message: err.to_string(),
            last_checkpoint_phase: self
                .ctx
                .state
                .last_completed_checkpoint(conv_id)
                .map(|c| c.phase),
            call_keys: self
                .ctx
                .state
                .calls_for_conversation(conv_id)
                .into_iter()
                .map(|c| c.call_key)
                .collect(),
        });

        let conversation = self.ctx.state.terminate_conversation(
            conv_id,
            status,
            failure.as_ref().map(|f| (f.kind, f.message.clone())),
            failure.as_ref().map(|f| f.step.clone()),
        )?;
        self.ctx.metrics.session_closed();
        self.ctx.cancel.finish_conversation(conv_id);
        self.ctx.state.flush()?;

        let duration_ms = started.elapsed().as_millis() as u64;
        TraceEvent::ConversationFinished {
            conversation_id: conv_id.to_owned(),
            status: status_label(conversation.status),
            tokens_spent: conversation.tokens_spent,
            duration_ms,
        }
        .emit();

        Ok(PipelineOutcome {
            status: conversation.status,
            outputs,
            conversation_id: conv_id.to_owned(),
            metrics: RunMetrics {
                tokens_spent: conversation.tokens_spent,
                cost_usd: conversation.cost_usd,
                steps_run,
                steps_skipped,
                rotations: self.ctx.state.rotations_for_conversation(conv_id).len(),
                duration_ms,
            },
            failure,
        })
    }
}

fn status_label(status: ConversationStatus) -> String {
    serde_json::to_value(status)
        .ok()
        .and_then(|v| v.as_str().map(String::from))
        .unwrap_or_else(|| format!("{status:?}").to_lowercase())
}
