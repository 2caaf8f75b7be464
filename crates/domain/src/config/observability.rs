use serde::{Deserialize, Serialize};

/// Observability switches.
///
/// Sinks are external collaborators; the core only decides what to emit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Log level filter (e.g. `"info"`, `"sibyl_runtime=debug"`).
    #[serde(default = "d_logging_level")]
    pub logging_level: String,
    #[serde(default = "d_enabled")]
    pub metrics_enabled: bool,
    #[serde(default = "d_enabled")]
    pub tracing_enabled: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            logging_level: d_logging_level(),
            metrics_enabled: d_enabled(),
            tracing_enabled: d_enabled(),
        }
    }
}

fn d_logging_level() -> String {
    "info".into()
}

fn d_enabled() -> bool {
    true
}
