use serde::{Deserialize, Serialize};

use crate::cost::CostUsd;

/// Per-conversation budget limits.
///
/// `max_tokens` is the hard reservation ceiling; `max_cost_usd` and
/// `max_requests` are optional secondary caps checked at reservation time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetConfig {
    /// Token budget per conversation.
    #[serde(default = "d_max_tokens")]
    pub max_tokens: u64,
    /// Optional cost ceiling. `None` = uncapped.
    #[serde(default)]
    pub max_cost_usd: Option<CostUsd>,
    /// Optional cap on provider requests per conversation. `None` = uncapped.
    #[serde(default)]
    pub max_requests: Option<u64>,
    /// Utilization percentage at which a budget alert is emitted once.
    #[serde(default = "d_alert_threshold_pct")]
    pub alert_threshold_pct: f64,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            max_tokens: d_max_tokens(),
            max_cost_usd: None,
            max_requests: None,
            alert_threshold_pct: d_alert_threshold_pct(),
        }
    }
}

fn d_max_tokens() -> u64 {
    1_000_000
}

fn d_alert_threshold_pct() -> f64 {
    80.0
}
