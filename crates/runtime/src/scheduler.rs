//! Bounded-concurrency execution of subagent calls with idempotency keys,
//! retries, deadlines, and cooperative cancellation.
//!
//! Every call is keyed by a deterministic `call_key` derived from the
//! spec; a key that already has a terminal row short-circuits without a
//! provider call. Concurrency is bounded by a global semaphore plus
//! per-provider sub-limits (process-wide, FIFO-fair). Retryable failures
//! are absorbed here: each retry is a new row chained through `retry_of`,
//! paced by exponential backoff with deterministic jitter.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use sha2::{Digest, Sha256};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use uuid::Uuid;

use sibyl_blobs::{BlobKind, BlobRef, BlobStore};
use sibyl_domain::config::{BackpressurePolicy, SchedulerConfig};
use sibyl_domain::error::{Error, Result};
use sibyl_domain::{CostUsd, ErrorKind, ProviderFingerprint, TraceEvent};
use sibyl_providers::{CompletionRequest, ProviderRegistry};
use sibyl_state::{CallStatus, StateStore, SubagentCall};

use crate::backoff::RetryBackoff;
use crate::budget::{BudgetTracker, Reservation};
use crate::cache::{CacheKey, ResponseCache};
use crate::cancel::{CancelRegistry, CancelToken};
use crate::metrics::MetricsRegistry;
use crate::session::SessionManager;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// CallSpec / CallResult
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Everything that identifies one external model call.
#[derive(Debug, Clone)]
pub struct CallSpec {
    pub conversation_id: String,
    pub phase: String,
    /// Provider name in the registry.
    pub provider: String,
    pub model_name: String,
    pub agent_type: Option<String>,
    /// Blob ref of the prompt payload.
    pub prompt_ref: String,
    pub system_prompt: Option<String>,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub seed: Option<u64>,
    pub max_tokens: Option<u32>,
    /// Tokens reserved against the budget before the call.
    pub estimate_tokens: u64,
    /// Per-call deadline.
    pub timeout: Duration,
    /// Consult and populate the memoizer.
    pub use_cache: bool,
    /// A deadline failure may be retried once.
    pub retry_timeout_once: bool,
    /// Price applied to actual tokens on commit.
    pub cost_per_token: CostUsd,
}

impl CallSpec {
    pub fn new(
        conversation_id: &str,
        phase: &str,
        provider: &str,
        model_name: &str,
        prompt_ref: &str,
        estimate_tokens: u64,
    ) -> Self {
        Self {
            conversation_id: conversation_id.to_owned(),
            phase: phase.to_owned(),
            provider: provider.to_owned(),
            model_name: model_name.to_owned(),
            agent_type: None,
            prompt_ref: prompt_ref.to_owned(),
            system_prompt: None,
            temperature: None,
            top_p: None,
            seed: None,
            max_tokens: None,
            estimate_tokens,
            timeout: Duration::from_secs(120),
            use_cache: false,
            retry_timeout_once: false,
            cost_per_token: CostUsd::ZERO,
        }
    }
}

/// The idempotency key: SHA-256 over every field that makes two calls the
/// same logical request, plus the retry ordinal.
pub fn call_key(spec: &CallSpec, retry_count: u32) -> String {
    let mut hasher = Sha256::new();
    for part in [
        spec.conversation_id.as_str(),
        spec.phase.as_str(),
        spec.agent_type.as_deref().unwrap_or(""),
        spec.model_name.as_str(),
        spec.system_prompt.as_deref().unwrap_or(""),
        spec.prompt_ref.as_str(),
    ] {
        hasher.update(part.as_bytes());
        hasher.update([0x1f]);
    }
    hasher.update(spec.temperature.map(f32::to_bits).unwrap_or(u32::MAX).to_le_bytes());
    hasher.update(spec.top_p.map(f32::to_bits).unwrap_or(u32::MAX).to_le_bytes());
    hasher.update(spec.seed.unwrap_or(u64::MAX).to_le_bytes());
    hasher.update(retry_count.to_le_bytes());
    hex::encode(hasher.finalize())
}

/// The outcome handed back to the pipeline executor.
#[derive(Debug, Clone)]
pub struct CallResult {
    pub call_key: String,
    pub response_ref: String,
    pub text: String,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub cost_usd: CostUsd,
    pub fingerprint: ProviderFingerprint,
    pub finish_reason: String,
    /// Served from the memoizer without a provider call.
    pub from_cache: bool,
    /// Served from an existing terminal row for the same call_key.
    pub deduplicated: bool,
    /// The session rotated while this call was in flight; its context
    /// side effects must be discarded (token accounting already stands).
    pub rotated_during_call: bool,
}

/// A cancellable in-flight call.
pub struct CallHandle {
    token: CancelToken,
    join: JoinHandle<Result<CallResult>>,
}

impl CallHandle {
    /// Signal cancellation: an unstarted call becomes `cancelled`; a
    /// started call completes but its result is discarded.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Await the call's outcome.
    pub async fn result(self) -> Result<CallResult> {
        self.join
            .await
            .map_err(|e| Error::State(format!("call task failed: {e}")))?
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// WorkerScheduler
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct WorkerScheduler {
    state: Arc<StateStore>,
    blobs: Arc<dyn BlobStore>,
    providers: Arc<ProviderRegistry>,
    budget: Arc<BudgetTracker>,
    sessions: Arc<SessionManager>,
    cache: Arc<ResponseCache>,
    metrics: Arc<MetricsRegistry>,
    cancel: Arc<CancelRegistry>,
    global: Arc<Semaphore>,
    /// Per-provider sub-limits, shared across conversations.
    per_provider: HashMap<String, Arc<Semaphore>>,
    retry: RetryBackoff,
    config: SchedulerConfig,
    queue_depth: AtomicUsize,
}

impl WorkerScheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        state: Arc<StateStore>,
        blobs: Arc<dyn BlobStore>,
        providers: Arc<ProviderRegistry>,
        budget: Arc<BudgetTracker>,
        sessions: Arc<SessionManager>,
        cache: Arc<ResponseCache>,
        metrics: Arc<MetricsRegistry>,
        cancel: Arc<CancelRegistry>,
        config: SchedulerConfig,
    ) -> Self {
        let config = config.clamped();
        let per_provider = config
            .per_provider
            .iter()
            .map(|(name, limit)| {
                (
                    name.clone(),
                    Arc::new(Semaphore::new((*limit).clamp(1, 64))),
                )
            })
            .collect();
        Self {
            state,
            blobs,
            providers,
            budget,
            sessions,
            cache,
            metrics,
            cancel,
            global: Arc::new(Semaphore::new(config.max_parallel_workers)),
            per_provider,
            retry: RetryBackoff::from(&config.retry),
            config,
            queue_depth: AtomicUsize::new(0),
        }
    }

    /// Submit one call. Returns a cancellable handle; the actual work runs
    /// on the worker pool.
    pub fn submit(self: &Arc<Self>, spec: CallSpec) -> Result<CallHandle> {
        let depth = self.queue_depth.fetch_add(1, Ordering::AcqRel) + 1;
        if depth > self.config.queue_high_water {
            // Sessions close to their summarize threshold get a head start
            // while the queue drains.
            self.sessions.nudge_summarization();
            if self.config.backpressure == BackpressurePolicy::FailFast {
                self.queue_depth.fetch_sub(1, Ordering::AcqRel);
                return Err(Error::State(format!(
                    "scheduler queue above high-water mark ({})",
                    self.config.queue_high_water
                )));
            }
        }

        let base_key = call_key(&spec, 0);
        let conversation_key = spec.conversation_id.clone();
        let token = self.cancel.register_call(&conversation_key, &base_key);

        let scheduler = self.clone();
        let task_token = token.clone();
        let join = tokio::spawn(async move {
            let result = scheduler.run_call(spec, task_token).await;
            scheduler.queue_depth.fetch_sub(1, Ordering::AcqRel);
            scheduler.cancel.finish_call(&conversation_key, &base_key);
            result
        });

        Ok(CallHandle { token, join })
    }

    /// Submit a batch. Handles come back in submission order; awaiting
    /// them in order preserves the per-phase ordering guarantee even
    /// though execution interleaves.
    pub fn submit_batch(self: &Arc<Self>, specs: Vec<CallSpec>) -> Result<Vec<CallHandle>> {
        specs.into_iter().map(|spec| self.submit(spec)).collect()
    }

    /// Convenience: submit a batch and await all results in order.
    pub async fn run_batch(self: &Arc<Self>, specs: Vec<CallSpec>) -> Result<Vec<CallResult>> {
        let handles = self.submit_batch(specs)?;
        let mut results = Vec::with_capacity(handles.len());
        for handle in handles {
            results.push(handle.result().await?);
        }
        Ok(results)
    }

    pub fn queue_depth(&self) -> usize {
        self.queue_depth.load(Ordering::Acquire)
    }

    // ── Execution ────────────────────────────────────────────────────

    async fn run_call(&self, spec: CallSpec, token: CancelToken) -> Result<CallResult> {
        // Idempotency: walk the retry chain for this spec.
        let (mut retry_count, mut retry_of) = match self.resume_point(&spec)? {
            ResumePoint::Fresh => (0, None),
            ResumePoint::Stored(result) => return Ok(result),
            ResumePoint::Failed(err) => return Err(err),
            ResumePoint::Continue { retry_count, retry_of } => (retry_count, retry_of),
        };

        let provider = self
            .providers
            .llm(&spec.provider)
            .ok_or_else(|| Error::Configuration(format!("unknown LLM provider '{}'", spec.provider)))?;
        let fingerprint = ProviderFingerprint::new(
            &spec.provider,
            &spec.model_name,
            &provider.fingerprint().version,
        );

        let ticket = self.sessions.ticket(&spec.conversation_id)?;

        // Reserve before anything can reach the provider.
        let reservation =
            self.budget
                .reserve(&spec.conversation_id, &ticket.session_id, spec.estimate_tokens);
        let mut reservation = match reservation {
            Ok(r) => Some(r),
            Err(err) => {
                self.metrics.inc_errors();
                return Err(err);
            }
        };

        // Memoizer, when the spec opts in.
        let cache_key = spec.use_cache.then(|| {
            CacheKey::new(
                &spec.prompt_ref,
                &spec.model_name,
                spec.temperature,
                spec.top_p,
                spec.system_prompt.as_deref(),
                spec.seed,
                fingerprint.clone(),
            )
        });
        if let Some(key) = &cache_key {
            if let Some(response_ref) = self.cache.get(key) {
                return self.serve_from_cache(&spec, reservation.take(), response_ref, &fingerprint);
            }
            self.metrics.inc_cache_miss();
        }

        let prompt_text = self.blobs.get_text(&BlobRef::parse(&spec.prompt_ref)?)?;
        let mut timeout_retry_used = false;

        loop {
            let key = call_key(&spec, retry_count);
            let reserved = reservation.as_ref().map(|r| r.tokens).unwrap_or(0);
            self.state.insert_call(new_call_row(
                &spec,
                &key,
                &ticket.session_id,
                reserved,
                retry_of.clone(),
                retry_count,
            ))?;

            // Bounded concurrency: global pool, then the provider's
            // sub-limit. FIFO-fair semaphores keep queueing in submission
            // order.
            let _global = self
                .global
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| Error::Cancelled)?;
            let _provider_permit = match self.per_provider.get(&spec.provider) {
                Some(sem) => Some(
                    sem.clone()
                        .acquire_owned()
                        .await
                        .map_err(|_| Error::Cancelled)?,
                ),
                None => None,
            };

            // Unstarted call cancelled while queued.
            if token.is_cancelled() {
                self.state.update_call(&key, |c| {
                    c.status = CallStatus::Cancelled;
                    c.error_kind = Some(ErrorKind::Cancelled);
                })?;
                if let Some(r) = reservation.take() {
                    self.budget.release(r)?;
                }
                return Err(Error::Cancelled);
            }

            self.state
                .update_call(&key, |c| c.status = CallStatus::Running)?;
            self.metrics.inc_requests();
            self.metrics.request_started();

            let request = CompletionRequest {
                prompt: prompt_text.clone(),
                system_prompt: spec.system_prompt.clone(),
                model: Some(spec.model_name.clone()),
                temperature: spec.temperature,
                top_p: spec.top_p,
                max_tokens: spec.max_tokens,
                seed: spec.seed,
            };

            let started = Instant::now();
            let outcome = tokio::time::timeout(spec.timeout, provider.complete(request)).await;
            let elapsed = started.elapsed();
            self.metrics.request_finished();
            self.metrics
                .observe_request_duration_ms(elapsed.as_secs_f64() * 1000.0);

            let err = match outcome {
                Ok(Ok(response)) => {
                    // A started call that was cancelled completes, but its
                    // result is discarded and the reservation refunded.
                    if token.is_cancelled() {
                        self.state.update_call(&key, |c| {
                            c.status = CallStatus::Cancelled;
                            c.error_kind = Some(ErrorKind::Cancelled);
                        })?;
                        if let Some(r) = reservation.take() {
                            self.budget.release(r)?;
                        }
                        return Err(Error::Cancelled);
                    }

                    return self
                        .complete_call(
                            &spec,
                            &key,
                            &ticket,
                            reservation.take(),
                            response,
                            cache_key.clone(),
                        )
                        .await;
                }
                Ok(Err(err)) => err,
                Err(_) => Error::Timeout {
                    elapsed_ms: spec.timeout.as_millis() as u64,
                },
            };

            // Decide whether this failure is absorbed by a retry.
            let may_retry = match &err {
                Error::ProviderRetryable { .. } => !self.retry.should_give_up(retry_count),
                Error::Timeout { .. } => {
                    spec.retry_timeout_once
                        && !timeout_retry_used
                        && !self.retry.should_give_up(retry_count)
                }
                _ => false,
            };

            let kind = err.kind();
            let row = self.state.update_call(&key, |c| {
                c.status = if may_retry {
                    CallStatus::FailedRetryable
                } else {
                    CallStatus::FailedTerminal
                };
                c.error = Some(err.to_string());
                c.error_kind = Some(kind);
            })?;

            if !may_retry {
                self.metrics.inc_errors();
                if let Some(r) = reservation.take() {
                    self.budget.release(r)?;
                }
                return Err(err);
            }

            if matches!(err, Error::Timeout { .. }) {
                timeout_retry_used = true;
            }

            // Retryable: the provider consumed nothing, so the same
            // reservation carries into the next attempt.
            let delay = self.retry.delay_for_attempt(retry_count);
            let next_key = call_key(&spec, retry_count + 1);
            TraceEvent::CallRetried {
                call_key: next_key,
                retry_of: row.id.clone(),
                retry_count: retry_count + 1,
                backoff_ms: delay.as_millis() as u64,
                reason: err.to_string(),
            }
            .emit();

            // Permits drop before the backoff sleep so other calls run.
            drop(_provider_permit);
            drop(_global);
            tokio::time::sleep(delay).await;

            if token.is_cancelled() {
                if let Some(r) = reservation.take() {
                    self.budget.release(r)?;
                }
                return Err(Error::Cancelled);
            }

            retry_of = Some(row.id);
            retry_count += 1;
        }
    }

    /// Finish a successful provider call: persist the response, bind
    /// usage to the session, reconcile the budget, and fill the cache.
    async fn complete_call(
        &self,
        spec: &CallSpec,
        key: &str,
        ticket: &crate::session::SessionTicket,
        reservation: Option<Reservation>,
        response: sibyl_providers::CompletionResponse,
        cache_key: Option<CacheKey>,
    ) -> Result<CallResult> {
        let response_ref = self.blobs.put_text(&response.text, BlobKind::Response)?;

        // The provider consumed tokens whatever happens next: reconcile
        // the reservation to actuals before binding usage to the session.
        let actual_tokens = response.tokens_in + response.tokens_out;
        let cost = CostUsd::from_micros(spec.cost_per_token.micros() * actual_tokens);
        if let Some(reservation) = reservation {
            self.budget.commit(reservation, key, actual_tokens, cost)?;
        }
        self.metrics.add_tokens(response.tokens_in, response.tokens_out);
        self.metrics.add_cost(cost);
        if let Ok(snapshot) = self.budget.snapshot(&spec.conversation_id) {
            self.metrics
                .set_budget_utilization_pct(snapshot.utilization_pct);
        }

        let sessions = Arc::clone(&self.sessions);
        let usage = sessions
            .record_call_usage(ticket, Some(key), response.tokens_in, response.tokens_out)
            .await;

        let fingerprint = response.fingerprint.clone();
        let row = self.state.update_call(key, |c| {
            c.status = CallStatus::Succeeded;
            c.tokens_in_actual = response.tokens_in;
            c.tokens_out_actual = response.tokens_out;
            c.cost_usd = cost;
            c.response_ref = Some(response_ref.to_string());
            c.provider_fingerprint = Some(fingerprint.clone());
            c.finish_reason = Some(response.finish_reason.clone());
        })?;

        if let Some(cache_key) = cache_key {
            self.cache.put(cache_key, response_ref.to_string());
        }

        TraceEvent::CallCompleted {
            call_key: key.to_owned(),
            provider: spec.provider.clone(),
            model: spec.model_name.clone(),
            status: "succeeded".into(),
            tokens_in: response.tokens_in,
            tokens_out: response.tokens_out,
            duration_ms: row.duration_ms.unwrap_or(0),
            retry_count: row.retry_count,
        }
        .emit();

        // A rotation failure mid-binding surfaces after the call row and
        // accounting are consistent.
        let usage = usage?;

        Ok(CallResult {
            call_key: key.to_owned(),
            response_ref: response_ref.to_string(),
            text: response.text,
            tokens_in: response.tokens_in,
            tokens_out: response.tokens_out,
            cost_usd: cost,
            fingerprint: response.fingerprint,
            finish_reason: response.finish_reason,
            from_cache: false,
            deduplicated: false,
            rotated_during_call: usage.rotated_during_call,
        })
    }

    /// Serve a memoizer hit: no provider call, the reservation is
    /// refunded, and a zero-token call row records the reuse.
    fn serve_from_cache(
        &self,
        spec: &CallSpec,
        reservation: Option<Reservation>,
        response_ref: String,
        fingerprint: &ProviderFingerprint,
    ) -> Result<CallResult> {
        self.metrics.inc_cache_hit();
        if let Some(reservation) = reservation {
            self.budget.release(reservation)?;
        }

        let key = call_key(spec, 0);
        let text = self.blobs.get_text(&BlobRef::parse(&response_ref)?)?;

        TraceEvent::CacheHit {
            call_key: key.clone(),
            response_ref: response_ref.clone(),
        }
        .emit();

        Ok(CallResult {
            call_key: key,
            response_ref,
            text,
            tokens_in: 0,
            tokens_out: 0,
            cost_usd: CostUsd::ZERO,
            fingerprint: fingerprint.clone(),
            finish_reason: "cached".into(),
            from_cache: true,
            deduplicated: false,
            rotated_during_call: false,
        })
    }

    /// Walk the stored retry chain for a spec and decide where to resume.
    fn resume_point(&self, spec: &CallSpec) -> Result<ResumePoint> {
        let mut last: Option<SubagentCall> = None;
        let mut next = 0u32;
        while let Some(row) = self.state.call(&call_key(spec, next)) {
            next += 1;
            last = Some(row);
        }

        let Some(last) = last else {
            return Ok(ResumePoint::Fresh);
        };

        match last.status {
            CallStatus::Succeeded => {
                let response_ref = last
                    .response_ref
                    .clone()
                    .ok_or_else(|| Error::State(format!("call {} has no response", last.call_key)))?;
                let text = self.blobs.get_text(&BlobRef::parse(&response_ref)?)?;
                Ok(ResumePoint::Stored(CallResult {
                    call_key: last.call_key,
                    response_ref,
                    text,
                    tokens_in: last.tokens_in_actual,
                    tokens_out: last.tokens_out_actual,
                    cost_usd: last.cost_usd,
                    fingerprint: last.provider_fingerprint.unwrap_or_else(|| {
                        ProviderFingerprint::new(&last.provider, &last.model_name, "")
                    }),
                    finish_reason: last.finish_reason.unwrap_or_else(|| "stop".into()),
                    from_cache: false,
                    deduplicated: true,
                    rotated_during_call: false,
                }))
            }
            CallStatus::FailedTerminal => Ok(ResumePoint::Failed(match last.error_kind {
                Some(ErrorKind::Timeout) => Error::Timeout { elapsed_ms: 0 },
                _ => Error::ProviderTerminal {
                    provider: last.provider,
                    message: last.error.unwrap_or_else(|| "terminal failure".into()),
                },
            })),
            CallStatus::Cancelled => Ok(ResumePoint::Failed(Error::Cancelled)),
            CallStatus::FailedRetryable => {
                if self.retry.should_give_up(last.retry_count) {
                    Ok(ResumePoint::Failed(Error::ProviderRetryable {
                        provider: last.provider,
                        message: last.error.unwrap_or_else(|| "retries exhausted".into()),
                    }))
                } else {
                    Ok(ResumePoint::Continue {
                        retry_count: last.retry_count + 1,
                        retry_of: Some(last.id),
                    })
                }
            }
            CallStatus::Queued | CallStatus::Running => Err(Error::State(format!(
                "call {} is already in flight",
                last.call_key
            ))),
        }
    }
}

enum ResumePoint {
    Fresh,
    Stored(CallResult),
    Failed(Error),
    Continue {
        retry_count: u32,
        retry_of: Option<String>,
    },
}

fn new_call_row(
    spec: &CallSpec,
    key: &str,
    session_id: &str,
    tokens_reserved: u64,
    retry_of: Option<String>,
    retry_count: u32,
) -> SubagentCall {
    SubagentCall {
        call_key: key.to_owned(),
        id: Uuid::new_v4().to_string(),
        conversation_id: spec.conversation_id.clone(),
        session_id: session_id.to_owned(),
        phase: spec.phase.clone(),
        agent_type: spec.agent_type.clone(),
        model_name: spec.model_name.clone(),
        provider: spec.provider.clone(),
        provider_fingerprint: None,
        prompt_ref: spec.prompt_ref.clone(),
        response_ref: None,
        tokens_in_reserved: tokens_reserved,
        tokens_in_actual: 0,
        tokens_out_actual: 0,
        cost_usd: CostUsd::ZERO,
        status: CallStatus::Queued,
        started_at: Utc::now(),
        completed_at: None,
        duration_ms: None,
        retry_of,
        retry_count,
        finish_reason: None,
        error: None,
        error_kind: None,
        correlation_id: spec.conversation_id.clone(),
        span_id: Uuid::new_v4().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn call_key_is_deterministic_and_field_sensitive() {
        let spec = CallSpec::new("conv", "phase", "mock", "model", "ref", 100);
        assert_eq!(call_key(&spec, 0), call_key(&spec, 0));
        assert_ne!(call_key(&spec, 0), call_key(&spec, 1));

        let mut other = spec.clone();
        other.temperature = Some(0.3);
        assert_ne!(call_key(&spec, 0), call_key(&other, 0));

        let mut other = spec.clone();
        other.phase = "other-phase".into();
        assert_ne!(call_key(&spec, 0), call_key(&other, 0));

        let mut other = spec.clone();
        other.system_prompt = Some("sys".into());
        assert_ne!(call_key(&spec, 0), call_key(&other, 0));
    }

    #[test]
    fn call_key_is_hex_sha256_shaped() {
        let spec = CallSpec::new("c", "p", "prov", "m", "r", 1);
        let key = call_key(&spec, 0);
        assert_eq!(key.len(), 64);
        assert!(key.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
