use serde::{Deserialize, Serialize};

/// How a session's dialog is compressed into the successor's seed context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SummarizationStrategy {
    /// Model-generated digest of the session dialog.
    #[default]
    LlmCompress,
    /// Deterministic digest of assistant turns; the llm_compress fallback.
    DeltaCompress,
    /// Verbatim copy of the dialog (compression ratio 1).
    FullCopy,
    /// Preserved state only; the dialog is dropped.
    Restart,
}

impl SummarizationStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::LlmCompress => "llm_compress",
            Self::DeltaCompress => "delta_compress",
            Self::FullCopy => "full_copy",
            Self::Restart => "restart",
        }
    }
}

/// Session lifecycle and rotation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Token budget of each session (the usable context window).
    #[serde(default = "d_tokens_budget")]
    pub tokens_budget: u64,
    /// Utilization percentage that starts background summarization.
    #[serde(default = "d_summarize_threshold_pct")]
    pub summarize_threshold_pct: f64,
    /// Utilization percentage that initiates the rotation swap.
    #[serde(default = "d_rotate_threshold_pct")]
    pub rotate_threshold_pct: f64,
    /// Summarization strategy for rotations.
    #[serde(default)]
    pub strategy: SummarizationStrategy,
    /// Hard bound on one rotation attempt.
    #[serde(default = "d_rotation_timeout_secs")]
    pub rotation_timeout_secs: u64,
    /// Failed rotation attempts on one session chain before the
    /// conversation terminates.
    #[serde(default = "d_max_rotation_attempts")]
    pub max_rotation_attempts: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            tokens_budget: d_tokens_budget(),
            summarize_threshold_pct: d_summarize_threshold_pct(),
            rotate_threshold_pct: d_rotate_threshold_pct(),
            strategy: SummarizationStrategy::default(),
            rotation_timeout_secs: d_rotation_timeout_secs(),
            max_rotation_attempts: d_max_rotation_attempts(),
        }
    }
}

fn d_tokens_budget() -> u64 {
    100_000
}

fn d_summarize_threshold_pct() -> f64 {
    60.0
}

fn d_rotate_threshold_pct() -> f64 {
    70.0
}

fn d_rotation_timeout_secs() -> u64 {
    300
}

fn d_max_rotation_attempts() -> u32 {
    3
}
