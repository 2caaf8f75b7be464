mod blobs;
mod budget;
mod cache;
mod observability;
mod pipeline;
mod providers;
mod scheduler;
mod session;

pub use blobs::*;
pub use budget::*;
pub use cache::*;
pub use observability::*;
pub use pipeline::*;
pub use providers::*;
pub use scheduler::*;
pub use session::*;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Top-level workspace config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The recognized workspace options of the runtime core.
///
/// Every conversation pins an immutable snapshot of this structure; the
/// executor never reads mutable global configuration mid-run.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct WorkspaceConfig {
    #[serde(default)]
    pub providers: ProvidersConfig,
    /// Technique groupings, keyed by shop name.
    #[serde(default)]
    pub shops: HashMap<String, ShopConfig>,
    /// Declared pipelines, keyed by pipeline name.
    #[serde(default)]
    pub pipelines: HashMap<String, PipelineConfig>,
    #[serde(default)]
    pub budget: BudgetConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub blobs: BlobConfig,
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

/// A technique grouping (a "shop").
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ShopConfig {
    /// Technique names this shop provides.
    #[serde(default)]
    pub techniques: Vec<String>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Config validation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Severity level for a configuration issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSeverity {
    Error,
    Warning,
}

/// A single configuration validation issue.
#[derive(Debug, Clone)]
pub struct ConfigIssue {
    pub severity: ConfigSeverity,
    pub field: String,
    pub message: String,
}

impl fmt::Display for ConfigIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self.severity {
            ConfigSeverity::Error => "ERROR",
            ConfigSeverity::Warning => "WARN",
        };
        write!(f, "[{tag}] {}: {}", self.field, self.message)
    }
}

impl WorkspaceConfig {
    /// Validate the configuration, returning every issue found.
    ///
    /// Callers abort with `Error::Configuration` when any issue has
    /// severity `Error`; warnings are logged and execution continues.
    pub fn validate(&self) -> Vec<ConfigIssue> {
        let mut issues = Vec::new();

        let err = |field: &str, message: String| ConfigIssue {
            severity: ConfigSeverity::Error,
            field: field.to_owned(),
            message,
        };
        let warn = |field: &str, message: String| ConfigIssue {
            severity: ConfigSeverity::Warning,
            field: field.to_owned(),
            message,
        };

        if self.budget.max_tokens == 0 {
            issues.push(err("budget.max_tokens", "must be greater than zero".into()));
        }
        if self.budget.alert_threshold_pct >= 100.0 {
            issues.push(warn(
                "budget.alert_threshold_pct",
                format!(
                    "{} >= 100 disables budget alerts",
                    self.budget.alert_threshold_pct
                ),
            ));
        }

        if self.session.summarize_threshold_pct >= self.session.rotate_threshold_pct {
            issues.push(err(
                "session.summarize_threshold_pct",
                format!(
                    "summarize threshold ({}) must be below rotate threshold ({})",
                    self.session.summarize_threshold_pct, self.session.rotate_threshold_pct
                ),
            ));
        }
        if self.session.rotate_threshold_pct > 100.0 {
            issues.push(err(
                "session.rotate_threshold_pct",
                "must be at most 100".into(),
            ));
        }
        if self.session.tokens_budget == 0 {
            issues.push(err("session.tokens_budget", "must be greater than zero".into()));
        }

        if self.scheduler.max_parallel_workers == 0 {
            issues.push(err(
                "scheduler.max_parallel_workers",
                "must be at least 1".into(),
            ));
        }

        let known_techniques: std::collections::HashSet<&str> = self
            .shops
            .values()
            .flat_map(|s| s.techniques.iter().map(String::as_str))
            .collect();

        for (name, pipeline) in &self.pipelines {
            if pipeline.steps.is_empty() {
                issues.push(err(
                    &format!("pipelines.{name}"),
                    "pipeline has no steps".into(),
                ));
            }
            let mut seen = std::collections::HashSet::new();
            for step in &pipeline.steps {
                if !seen.insert(step.name.as_str()) {
                    issues.push(err(
                        &format!("pipelines.{name}.steps"),
                        format!("duplicate step name '{}'", step.name),
                    ));
                }
                if !known_techniques.is_empty() && !known_techniques.contains(step.technique.as_str())
                {
                    issues.push(warn(
                        &format!("pipelines.{name}.steps.{}", step.name),
                        format!("technique '{}' is not declared by any shop", step.technique),
                    ));
                }
            }
        }

        issues
    }

    /// Whether any issue is severity `Error`.
    pub fn has_errors(issues: &[ConfigIssue]) -> bool {
        issues.iter().any(|i| i.severity == ConfigSeverity::Error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let cfg = WorkspaceConfig::default();
        let issues = cfg.validate();
        assert!(
            !WorkspaceConfig::has_errors(&issues),
            "unexpected errors: {issues:?}"
        );
    }

    #[test]
    fn inverted_thresholds_is_error() {
        let mut cfg = WorkspaceConfig::default();
        cfg.session.summarize_threshold_pct = 80.0;
        cfg.session.rotate_threshold_pct = 70.0;
        let issues = cfg.validate();
        assert!(WorkspaceConfig::has_errors(&issues));
    }

    #[test]
    fn zero_budget_is_error() {
        let mut cfg = WorkspaceConfig::default();
        cfg.budget.max_tokens = 0;
        assert!(WorkspaceConfig::has_errors(&cfg.validate()));
    }

    #[test]
    fn duplicate_step_names_is_error() {
        let toml_str = r#"
            [pipelines.qa]
            steps = [
                { name = "ask", technique = "completion" },
                { name = "ask", technique = "completion" },
            ]
        "#;
        let cfg: WorkspaceConfig = toml::from_str(toml_str).unwrap();
        assert!(WorkspaceConfig::has_errors(&cfg.validate()));
    }

    #[test]
    fn unknown_technique_is_warning_when_shops_declared() {
        let toml_str = r#"
            [shops.indexing]
            techniques = ["chunking", "embedding"]

            [pipelines.index_docs]
            steps = [{ name = "chunk", technique = "nonexistent" }]
        "#;
        let cfg: WorkspaceConfig = toml::from_str(toml_str).unwrap();
        let issues = cfg.validate();
        assert!(!WorkspaceConfig::has_errors(&issues));
        assert!(issues
            .iter()
            .any(|i| i.severity == ConfigSeverity::Warning && i.message.contains("nonexistent")));
    }

    #[test]
    fn deserialize_full_document() {
        let toml_str = r#"
            [providers]
            primary_llm = "main"

            [[providers.llm]]
            name = "main"
            model = "sonnet-4"
            version = "2026-01"

            [shops.indexing]
            techniques = ["chunking"]

            [pipelines.index_docs]
            steps = [{ name = "chunk", technique = "chunking", phase = "chunk" }]

            [budget]
            max_tokens = 100000

            [session]
            summarize_threshold_pct = 60.0
            rotate_threshold_pct = 70.0
        "#;
        let cfg: WorkspaceConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(cfg.budget.max_tokens, 100_000);
        assert_eq!(cfg.providers.llm.len(), 1);
        assert_eq!(cfg.pipelines["index_docs"].steps.len(), 1);
        assert!(!WorkspaceConfig::has_errors(&cfg.validate()));
    }

    #[test]
    fn deserialize_yaml_document() {
        let yaml = r#"
providers:
  llm:
    - name: main
      model: sonnet-4
budget:
  max_tokens: 50000
session:
  summarize_threshold_pct: 55.0
  rotate_threshold_pct: 65.0
observability:
  logging_level: debug
"#;
        let cfg: WorkspaceConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(cfg.budget.max_tokens, 50_000);
        assert_eq!(cfg.providers.llm[0].name, "main");
        assert!((cfg.session.rotate_threshold_pct - 65.0).abs() < f64::EPSILON);
        assert_eq!(cfg.observability.logging_level, "debug");
        assert!(!WorkspaceConfig::has_errors(&cfg.validate()));
    }

    #[test]
    fn issue_display() {
        let issue = ConfigIssue {
            severity: ConfigSeverity::Error,
            field: "budget.max_tokens".into(),
            message: "must be greater than zero".into(),
        };
        assert_eq!(
            issue.to_string(),
            "[ERROR] budget.max_tokens: must be greater than zero"
        );
    }
}
