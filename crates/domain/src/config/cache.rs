use serde::{Deserialize, Serialize};

/// Memoizer settings for completed provider calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "d_enabled")]
    pub enabled: bool,
    /// Maximum cached entries before LRU eviction.
    #[serde(default = "d_max_entries")]
    pub max_entries: usize,
    /// Entries older than this are treated as misses and dropped.
    #[serde(default = "d_max_age_secs")]
    pub max_age_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: d_enabled(),
            max_entries: d_max_entries(),
            max_age_secs: d_max_age_secs(),
        }
    }
}

fn d_enabled() -> bool {
    true
}

fn d_max_entries() -> usize {
    1024
}

fn d_max_age_secs() -> u64 {
    3600
}
