use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use sibyl_domain::{CostUsd, ErrorKind, PreservedState, ProviderFingerprint};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Conversation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
    Crashed,
}

impl ConversationStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Running)
    }
}

/// The unit of work: one durable execution of a pipeline under a budget.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub workflow_type: String,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    pub status: ConversationStatus,
    pub token_budget: u64,
    /// Includes pending reservations; reconciled down on commit/release.
    pub tokens_spent: u64,
    /// Pending reservation total (a subset of `tokens_spent`).
    pub tokens_reserved: u64,
    pub cost_usd: CostUsd,
    /// Provider requests issued so far (for the `max_requests` cap).
    pub request_count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_hash: Option<String>,
    pub config_version: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Step that caused the terminal failure, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_step: Option<String>,
}

impl Conversation {
    pub fn new(workflow_type: &str, token_budget: u64, config_version: &str) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            workflow_type: workflow_type.to_owned(),
            started_at: Utc::now(),
            finished_at: None,
            status: ConversationStatus::Running,
            token_budget,
            tokens_spent: 0,
            tokens_reserved: 0,
            cost_usd: CostUsd::ZERO,
            request_count: 0,
            context_hash: None,
            config_version: config_version.to_owned(),
            tags: Vec::new(),
            error_kind: None,
            error_message: None,
            failed_step: None,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Session
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Summarizing,
    Rotating,
    Completed,
    Failed,
    Abandoned,
}

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Abandoned)
    }
}

/// A rotating context window inside a conversation.
///
/// `active_generation` is the central concurrency primitive: every
/// operation captures it at entry and all mutations compare-and-set
/// against the expected value. A captured generation that no longer
/// matches means the operation belongs to a dead session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub conversation_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_session_id: Option<String>,
    /// Sequential within the conversation, starting at 1.
    pub session_number: u32,
    /// Monotonic, starting at 1. Never decreases.
    pub active_generation: u64,
    pub rotation_in_progress: bool,
    pub tokens_budget: u64,
    pub tokens_spent: u64,
    pub summarize_threshold_pct: f64,
    pub rotate_threshold_pct: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_summary_ref: Option<String>,
    #[serde(default)]
    pub preserved_state: PreservedState,
    pub status: SessionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_type: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Updated on every status transition; the integrity sweep uses it to
    /// detect sessions stuck mid-rotation.
    pub status_changed_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Failed rotation attempts on this session chain.
    #[serde(default)]
    pub rotation_attempts: u32,
    /// Set once the summarize trigger has fired (edge-triggered).
    #[serde(default)]
    pub summarize_triggered: bool,
    /// Highest turn_id issued for this session.
    #[serde(default)]
    pub last_turn_id: u64,
}

impl Session {
    pub fn utilization_pct(&self) -> f64 {
        if self.tokens_budget == 0 {
            return 0.0;
        }
        self.tokens_spent as f64 / self.tokens_budget as f64 * 100.0
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Session rotation event
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RotationTrigger {
    TokenThreshold,
    Manual,
    Error,
    Timeout,
    Forced,
}

impl RotationTrigger {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::TokenThreshold => "token_threshold",
            Self::Manual => "manual",
            Self::Error => "error",
            Self::Timeout => "timeout",
            Self::Forced => "forced",
        }
    }
}

pub use sibyl_domain::config::SummarizationStrategy;

/// An immutable record of one context-window handoff.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRotation {
    pub id: String,
    pub conversation_id: String,
    pub from_session_id: String,
    /// Absent when the rotation failed before a successor existed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to_session_id: Option<String>,
    pub trigger: RotationTrigger,
    pub tokens_before_rotation: u64,
    pub tokens_threshold: u64,
    pub summarization_strategy: SummarizationStrategy,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_summary_ref: Option<String>,
    pub compression_ratio: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_before: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_after: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_before: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_after: Option<String>,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub handoff_ms: Option<u64>,
    #[serde(default)]
    pub preserved_context_keys: Vec<String>,
    #[serde(default)]
    pub fallback_used: bool,
    #[serde(default)]
    pub failed: bool,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Subagent call
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    Queued,
    Running,
    Succeeded,
    FailedRetryable,
    FailedTerminal,
    Cancelled,
}

impl CallStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Queued | Self::Running)
    }
}

/// One external model call. `call_key` is the idempotent primary key;
/// a retry is a new row whose `retry_of` points at the original.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubagentCall {
    pub call_key: String,
    pub id: String,
    pub conversation_id: String,
    pub session_id: String,
    pub phase: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_type: Option<String>,
    pub model_name: String,
    pub provider: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_fingerprint: Option<ProviderFingerprint>,
    pub prompt_ref: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_ref: Option<String>,
    pub tokens_in_reserved: u64,
    #[serde(default)]
    pub tokens_in_actual: u64,
    #[serde(default)]
    pub tokens_out_actual: u64,
    #[serde(default)]
    pub cost_usd: CostUsd,
    pub status: CallStatus,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_of: Option<String>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    pub correlation_id: String,
    pub span_id: String,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Session token usage
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One record per external call bound to a session.
///
/// `active_generation` is captured at call entry and is immutable for the
/// record; `generation_at_completion` is captured at call exit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionTokenUsage {
    pub session_id: String,
    /// Sequential within the session, starting at 1.
    pub turn_id: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub call_key: Option<String>,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub tokens_total: u64,
    pub cumulative_tokens: u64,
    pub utilization_pct: f64,
    pub active_generation: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generation_at_completion: Option<u64>,
    pub recorded_at: DateTime<Utc>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Budget reconciliation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Delta log tying each call's reserved tokens to its actuals.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetReconciliation {
    pub call_key: String,
    pub conversation_id: String,
    pub tokens_reserved: u64,
    pub tokens_actual: u64,
    /// `actual - reserved`.
    pub delta: i64,
    pub cost_usd: CostUsd,
    pub recorded_at: DateTime<Utc>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Phase checkpoint
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointStatus {
    Completed,
    Failed,
}

/// A named resumable boundary between pipeline steps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseCheckpoint {
    pub conversation_id: String,
    pub phase: String,
    /// Replay anchor: SHA-256 of the canonical step output.
    pub context_hash: String,
    /// Blob ref of the step output, so resume can rethread it.
    pub output_ref: String,
    pub status: CheckpointStatus,
    pub recorded_at: DateTime<Utc>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Config snapshot
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Immutable JSON snapshot of the workspace config a conversation pins.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigSnapshot {
    pub config_version: String,
    pub content: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conversation_starts_running() {
        let conv = Conversation::new("index_docs", 100_000, "v1");
        assert_eq!(conv.status, ConversationStatus::Running);
        assert!(!conv.status.is_terminal());
        assert_eq!(conv.tokens_spent, 0);
        assert_eq!(conv.cost_usd, CostUsd::ZERO);
    }

    #[test]
    fn terminal_statuses() {
        assert!(ConversationStatus::Completed.is_terminal());
        assert!(ConversationStatus::Failed.is_terminal());
        assert!(ConversationStatus::Cancelled.is_terminal());
        assert!(ConversationStatus::Crashed.is_terminal());

        assert!(SessionStatus::Completed.is_terminal());
        assert!(SessionStatus::Abandoned.is_terminal());
        assert!(!SessionStatus::Active.is_terminal());
        assert!(!SessionStatus::Summarizing.is_terminal());
        assert!(!SessionStatus::Rotating.is_terminal());

        assert!(CallStatus::Succeeded.is_terminal());
        assert!(CallStatus::Cancelled.is_terminal());
        assert!(!CallStatus::Queued.is_terminal());
        assert!(!CallStatus::Running.is_terminal());
    }

    #[test]
    fn utilization_handles_zero_budget() {
        let session = Session {
            id: "s".into(),
            conversation_id: "c".into(),
            parent_session_id: None,
            session_number: 1,
            active_generation: 1,
            rotation_in_progress: false,
            tokens_budget: 0,
            tokens_spent: 500,
            summarize_threshold_pct: 60.0,
            rotate_threshold_pct: 70.0,
            context_summary_ref: None,
            preserved_state: PreservedState::new(),
            status: SessionStatus::Active,
            model_name: None,
            agent_type: None,
            created_at: Utc::now(),
            status_changed_at: Utc::now(),
            completed_at: None,
            rotation_attempts: 0,
            summarize_triggered: false,
            last_turn_id: 0,
        };
        assert_eq!(session.utilization_pct(), 0.0);
    }

    #[test]
    fn statuses_serialize_snake_case() {
        assert_eq!(
            serde_json::to_string(&CallStatus::FailedRetryable).unwrap(),
            "\"failed_retryable\""
        );
        assert_eq!(
            serde_json::to_string(&RotationTrigger::TokenThreshold).unwrap(),
            "\"token_threshold\""
        );
        assert_eq!(
            serde_json::to_string(&ConversationStatus::Crashed).unwrap(),
            "\"crashed\""
        );
    }

    #[test]
    fn rotation_trigger_as_str_matches_serde() {
        for trigger in [
            RotationTrigger::TokenThreshold,
            RotationTrigger::Manual,
            RotationTrigger::Error,
            RotationTrigger::Timeout,
            RotationTrigger::Forced,
        ] {
            let json = serde_json::to_string(&trigger).unwrap();
            assert_eq!(json, format!("\"{}\"", trigger.as_str()));
        }
    }
}
