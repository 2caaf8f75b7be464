use serde::Serialize;

/// Structured trace events emitted across all Sibyl crates.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event")]
pub enum TraceEvent {
    ConversationStarted {
        conversation_id: String,
        workflow_type: String,
        token_budget: u64,
    },
    ConversationFinished {
        conversation_id: String,
        status: String,
        tokens_spent: u64,
        duration_ms: u64,
    },
    ReservationDenied {
        conversation_id: String,
        requested: u64,
        remaining: u64,
    },
    BudgetAlert {
        conversation_id: String,
        utilization_pct: f64,
        threshold_pct: f64,
    },
    CallCompleted {
        call_key: String,
        provider: String,
        model: String,
        status: String,
        tokens_in: u64,
        tokens_out: u64,
        duration_ms: u64,
        retry_count: u32,
    },
    CallRetried {
        call_key: String,
        retry_of: String,
        retry_count: u32,
        backoff_ms: u64,
        reason: String,
    },
    CacheHit {
        call_key: String,
        response_ref: String,
    },
    SummarizeTriggered {
        session_id: String,
        utilization_pct: f64,
    },
    RotationCompleted {
        conversation_id: String,
        from_session_id: String,
        to_session_id: String,
        trigger: String,
        strategy: String,
        compression_ratio: f64,
        handoff_ms: u64,
        fallback_used: bool,
    },
    RotationFailed {
        session_id: String,
        reason: String,
        attempt: u32,
    },
    CheckpointRecorded {
        conversation_id: String,
        phase: String,
        context_hash: String,
    },
    IntegrityRepaired {
        finding: String,
        subject_id: String,
    },
}

impl TraceEvent {
    pub fn emit(&self) {
        let json = serde_json::to_string(self).unwrap_or_default();
        tracing::info!(trace_event = %json, "sibyl_event");
    }
}
