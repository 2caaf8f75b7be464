//! Exponential backoff with deterministic jitter for call retries.

use std::time::Duration;

use sibyl_domain::config::RetryConfig;

/// Retry pacing policy. Delays grow exponentially from the base, are
/// capped, and carry ~25% jitter to spread retry storms.
#[derive(Debug, Clone)]
pub struct RetryBackoff {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_retries: u32,
}

impl From<&RetryConfig> for RetryBackoff {
    fn from(config: &RetryConfig) -> Self {
        Self {
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            max_retries: config.max_retries,
        }
    }
}

impl RetryBackoff {
    /// Compute the delay before the given retry attempt (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_ms = self.base_delay.as_millis() as f64;
        let delay_ms = base_ms * 2f64.powi(attempt as i32);
        let capped_ms = delay_ms.min(self.max_delay.as_millis() as f64);

        let jitter = capped_ms * 0.25 * pseudo_random_fraction(attempt);
        Duration::from_millis((capped_ms + jitter) as u64)
    }

    /// Whether the given attempt number exhausts the retry budget.
    pub fn should_give_up(&self, attempt: u32) -> bool {
        attempt >= self.max_retries
    }
}

/// Cheap deterministic "random" fraction [0, 1) based on attempt number.
/// Not cryptographically secure — just enough to spread retry storms.
fn pseudo_random_fraction(attempt: u32) -> f64 {
    let hash = attempt.wrapping_mul(2654435761); // Knuth multiplicative hash
    (hash as f64) / (u32::MAX as f64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryBackoff {
        RetryBackoff::from(&RetryConfig {
            max_retries: 3,
            base_delay_ms: 500,
            max_delay_ms: 30_000,
        })
    }

    #[test]
    fn delay_grows_exponentially() {
        let p = policy();
        let d0 = p.delay_for_attempt(0);
        let d1 = p.delay_for_attempt(1);
        let d2 = p.delay_for_attempt(2);
        assert!(d1 > d0);
        assert!(d2 > d1);
        assert!(d0 >= Duration::from_millis(500));
    }

    #[test]
    fn delay_is_capped() {
        let p = policy();
        // 500ms * 2^20 would be enormous; the cap plus 25% jitter bounds it.
        let d = p.delay_for_attempt(20);
        assert!(d <= Duration::from_millis(30_000 + 7_500));
    }

    #[test]
    fn delay_is_deterministic() {
        let p = policy();
        assert_eq!(p.delay_for_attempt(2), p.delay_for_attempt(2));
    }

    #[test]
    fn give_up_at_max_retries() {
        let p = policy();
        assert!(!p.should_give_up(0));
        assert!(!p.should_give_up(2));
        assert!(p.should_give_up(3));
        assert!(p.should_give_up(4));
    }
}
