//! Memoizer over completed provider calls.
//!
//! Keyed by everything that makes a completion deterministic-enough to
//! reuse: prompt ref, model, sampling parameters, system prompt, seed,
//! and the provider fingerprint. Values are blob refs, so cached payloads
//! stay content-addressed. LRU-bounded by entry count with an age bound.

use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use lru::LruCache;
use parking_lot::Mutex;

use sibyl_domain::config::CacheConfig;
use sibyl_domain::ProviderFingerprint;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Key
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Cache key. Float parameters are stored as raw bits so the key is
/// `Eq`/`Hash` without epsilon games.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub prompt_ref: String,
    pub model_name: String,
    pub temperature_bits: Option<u32>,
    pub top_p_bits: Option<u32>,
    pub system_prompt: Option<String>,
    pub seed: Option<u64>,
    pub fingerprint: ProviderFingerprint,
}

impl CacheKey {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        prompt_ref: &str,
        model_name: &str,
        temperature: Option<f32>,
        top_p: Option<f32>,
        system_prompt: Option<&str>,
        seed: Option<u64>,
        fingerprint: ProviderFingerprint,
    ) -> Self {
        Self {
            prompt_ref: prompt_ref.to_owned(),
            model_name: model_name.to_owned(),
            temperature_bits: temperature.map(f32::to_bits),
            top_p_bits: top_p.map(f32::to_bits),
            system_prompt: system_prompt.map(str::to_owned),
            seed,
            fingerprint,
        }
    }
}

struct Entry {
    response_ref: String,
    inserted_at: Instant,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Cache
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Bounded response memoizer.
pub struct ResponseCache {
    inner: Mutex<LruCache<CacheKey, Entry>>,
    max_age: Duration,
    enabled: bool,
}

impl ResponseCache {
    pub fn new(config: &CacheConfig) -> Self {
        let capacity = NonZeroUsize::new(config.max_entries.max(1))
            .expect("max(1) is nonzero");
        Self {
            inner: Mutex::new(LruCache::new(capacity)),
            max_age: Duration::from_secs(config.max_age_secs),
            enabled: config.enabled,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Look up a response ref. Entries past the age bound are dropped and
    /// count as misses.
    pub fn get(&self, key: &CacheKey) -> Option<String> {
        if !self.enabled {
            return None;
        }
        let mut cache = self.inner.lock();
        let expired = match cache.get(key) {
            Some(entry) if entry.inserted_at.elapsed() <= self.max_age => {
                return Some(entry.response_ref.clone());
            }
            Some(_) => true,
            None => false,
        };
        if expired {
            cache.pop(key);
        }
        None
    }

    /// Record a completed call's response ref.
    pub fn put(&self, key: CacheKey, response_ref: String) {
        if !self.enabled {
            return;
        }
        self.inner.lock().put(
            key,
            Entry {
                response_ref,
                inserted_at: Instant::now(),
            },
        );
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(prompt_ref: &str) -> CacheKey {
        CacheKey::new(
            prompt_ref,
            "model",
            Some(0.2),
            None,
            Some("system"),
            Some(7),
            ProviderFingerprint::new("mock", "model", "1"),
        )
    }

    fn cache(max_entries: usize, max_age_secs: u64) -> ResponseCache {
        ResponseCache::new(&CacheConfig {
            enabled: true,
            max_entries,
            max_age_secs,
        })
    }

    #[test]
    fn put_get_roundtrip() {
        let cache = cache(16, 3600);
        cache.put(key("p1"), "ref1".into());
        assert_eq!(cache.get(&key("p1")), Some("ref1".into()));
        assert_eq!(cache.get(&key("p2")), None);
    }

    #[test]
    fn differing_parameters_miss() {
        let cache = cache(16, 3600);
        cache.put(key("p1"), "ref1".into());

        let mut hotter = key("p1");
        hotter.temperature_bits = Some(0.9f32.to_bits());
        assert_eq!(cache.get(&hotter), None);

        let mut other_provider = key("p1");
        other_provider.fingerprint = ProviderFingerprint::new("other", "model", "1");
        assert_eq!(cache.get(&other_provider), None);
    }

    #[test]
    fn lru_evicts_oldest() {
        let cache = cache(2, 3600);
        cache.put(key("a"), "ra".into());
        cache.put(key("b"), "rb".into());
        cache.put(key("c"), "rc".into());

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get(&key("a")), None);
        assert_eq!(cache.get(&key("c")), Some("rc".into()));
    }

    #[test]
    fn age_bound_expires_entries() {
        let cache = cache(16, 0);
        cache.put(key("p"), "r".into());
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(cache.get(&key("p")), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn disabled_cache_never_stores() {
        let cache = ResponseCache::new(&CacheConfig {
            enabled: false,
            max_entries: 16,
            max_age_secs: 3600,
        });
        cache.put(key("p"), "r".into());
        assert_eq!(cache.get(&key("p")), None);
        assert!(cache.is_empty());
    }
}
