use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// What the scheduler does when its queue crosses the high-water mark.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BackpressurePolicy {
    /// Block new submissions until the queue drains.
    #[default]
    Block,
    /// Reject new submissions immediately.
    FailFast,
}

/// Retry policy for retryable provider failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum retries per logical call (retries create new call rows).
    #[serde(default = "d_max_retries")]
    pub max_retries: u32,
    /// Base delay for exponential backoff.
    #[serde(default = "d_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Cap on a single backoff delay.
    #[serde(default = "d_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: d_max_retries(),
            base_delay_ms: d_base_delay_ms(),
            max_delay_ms: d_max_delay_ms(),
        }
    }
}

/// Worker scheduler concurrency settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Global maximum concurrent provider calls. Clamped to `1..=64`.
    #[serde(default = "d_max_parallel_workers")]
    pub max_parallel_workers: usize,
    /// Per-provider concurrency sub-limits, keyed by provider name.
    /// Limits are process-wide, shared across conversations.
    #[serde(default)]
    pub per_provider: HashMap<String, usize>,
    /// Queue depth beyond which backpressure applies.
    #[serde(default = "d_queue_high_water")]
    pub queue_high_water: usize,
    #[serde(default)]
    pub backpressure: BackpressurePolicy,
    #[serde(default)]
    pub retry: RetryConfig,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_parallel_workers: d_max_parallel_workers(),
            per_provider: HashMap::new(),
            queue_high_water: d_queue_high_water(),
            backpressure: BackpressurePolicy::default(),
            retry: RetryConfig::default(),
        }
    }
}

impl SchedulerConfig {
    /// Clamp `max_parallel_workers` to the allowed range `1..=64`.
    pub fn clamped(&self) -> Self {
        Self {
            max_parallel_workers: self.max_parallel_workers.clamp(1, 64),
            ..self.clone()
        }
    }
}

fn d_max_parallel_workers() -> usize {
    8
}

fn d_queue_high_water() -> usize {
    256
}

fn d_max_retries() -> u32 {
    3
}

fn d_base_delay_ms() -> u64 {
    500
}

fn d_max_delay_ms() -> u64 {
    30_000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let cfg = SchedulerConfig::default();
        assert_eq!(cfg.max_parallel_workers, 8);
        assert_eq!(cfg.queue_high_water, 256);
        assert_eq!(cfg.backpressure, BackpressurePolicy::Block);
        assert_eq!(cfg.retry.max_retries, 3);
        assert_eq!(cfg.retry.base_delay_ms, 500);
    }

    #[test]
    fn clamp_bounds() {
        let cfg = SchedulerConfig {
            max_parallel_workers: 0,
            ..Default::default()
        };
        assert_eq!(cfg.clamped().max_parallel_workers, 1);

        let cfg = SchedulerConfig {
            max_parallel_workers: 1000,
            ..Default::default()
        };
        assert_eq!(cfg.clamped().max_parallel_workers, 64);
    }

    #[test]
    fn deserialize_per_provider_limits() {
        let cfg: SchedulerConfig = toml::from_str(
            r#"
                max_parallel_workers = 16
                backpressure = "fail_fast"

                [per_provider]
                openai = 4
                local = 2
            "#,
        )
        .unwrap();
        assert_eq!(cfg.per_provider["openai"], 4);
        assert_eq!(cfg.backpressure, BackpressurePolicy::FailFast);
    }
}
