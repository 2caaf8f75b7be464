use serde::{Deserialize, Serialize};

/// A declared pipeline: an ordered sequence of technique steps.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PipelineConfig {
    pub steps: Vec<StepConfig>,
}

/// One pipeline step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepConfig {
    /// Unique step name within the pipeline.
    pub name: String,
    /// Technique invoked by this step.
    pub technique: String,
    /// Named phase boundary for checkpointing. Defaults to the step name.
    #[serde(default)]
    pub phase: Option<String>,
    /// Opaque technique parameters (trusted configuration, not user input).
    #[serde(default)]
    pub params: serde_json::Value,
    /// Per-call deadline for external calls issued by this step.
    #[serde(default = "d_timeout_secs")]
    pub timeout_secs: u64,
    /// Whether calls from this step consult the memoizer.
    #[serde(default)]
    pub cache: bool,
    /// Whether a deadline failure may be retried once.
    #[serde(default)]
    pub retry_timeout_once: bool,
    /// Fallback technique routed to on terminal provider/budget errors.
    #[serde(default)]
    pub fallback: Option<String>,
}

impl StepConfig {
    /// The checkpoint phase this step records under.
    pub fn phase_name(&self) -> &str {
        self.phase.as_deref().unwrap_or(&self.name)
    }
}

fn d_timeout_secs() -> u64 {
    120
}
