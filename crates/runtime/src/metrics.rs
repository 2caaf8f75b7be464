//! Process-wide metrics for the runtime core.
//!
//! Counters and gauges are lock-free atomics; histograms keep count, sum,
//! and extrema behind a mutex. Sinks are external: [`MetricsRegistry`]
//! only aggregates, and `snapshot()` hands the current values to whatever
//! wants to export them.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::Serialize;

use sibyl_domain::CostUsd;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Histogram
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Default, Clone, Serialize)]
pub struct HistogramSnapshot {
    pub count: u64,
    pub sum: f64,
    pub min: f64,
    pub max: f64,
}

#[derive(Debug, Default)]
struct Histogram {
    count: u64,
    sum: f64,
    min: f64,
    max: f64,
}

impl Histogram {
    fn record(&mut self, value: f64) {
        if self.count == 0 {
            self.min = value;
            self.max = value;
        } else {
            self.min = self.min.min(value);
            self.max = self.max.max(value);
        }
        self.count += 1;
        self.sum += value;
    }

    fn snapshot(&self) -> HistogramSnapshot {
        HistogramSnapshot {
            count: self.count,
            sum: self.sum,
            min: self.min,
            max: self.max,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Registry
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// All counters, gauges, and histograms the core emits.
#[derive(Default)]
pub struct MetricsRegistry {
    // Counters
    requests_total: AtomicU64,
    errors_total: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    tokens_in_total: AtomicU64,
    tokens_out_total: AtomicU64,
    cost_usd_total_micros: AtomicU64,
    integrity_violations: AtomicU64,

    // Gauges
    active_requests: AtomicI64,
    active_sessions: AtomicI64,
    /// Stored as basis points to stay atomic.
    budget_utilization_bp: AtomicU64,

    // Histograms
    request_duration_ms: Mutex<Histogram>,
    rotation_handoff_ms: Mutex<Histogram>,
    compression_ratio: Mutex<Histogram>,
}

/// Point-in-time view of every metric.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub requests_total: u64,
    pub errors_total: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub tokens_in_total: u64,
    pub tokens_out_total: u64,
    pub cost_usd_total: CostUsd,
    pub integrity_violations: u64,
    pub active_requests: i64,
    pub active_sessions: i64,
    pub budget_utilization_pct: f64,
    pub request_duration_ms: HistogramSnapshot,
    pub rotation_handoff_ms: HistogramSnapshot,
    pub compression_ratio: HistogramSnapshot,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Counters ─────────────────────────────────────────────────────

    pub fn inc_requests(&self) {
        self.requests_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_errors(&self) {
        self.errors_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_cache_miss(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_tokens(&self, tokens_in: u64, tokens_out: u64) {
        self.tokens_in_total.fetch_add(tokens_in, Ordering::Relaxed);
        self.tokens_out_total.fetch_add(tokens_out, Ordering::Relaxed);
    }

    pub fn add_cost(&self, cost: CostUsd) {
        self.cost_usd_total_micros
            .fetch_add(cost.micros(), Ordering::Relaxed);
    }

    pub fn inc_integrity_violations(&self, by: u64) {
        self.integrity_violations.fetch_add(by, Ordering::Relaxed);
    }

    // ── Gauges ───────────────────────────────────────────────────────

    pub fn request_started(&self) {
        self.active_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn request_finished(&self) {
        self.active_requests.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn session_opened(&self) {
        self.active_sessions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn session_closed(&self) {
        self.active_sessions.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn set_budget_utilization_pct(&self, pct: f64) {
        self.budget_utilization_bp
            .store((pct * 100.0).max(0.0) as u64, Ordering::Relaxed);
    }

    // ── Histograms ───────────────────────────────────────────────────

    pub fn observe_request_duration_ms(&self, ms: f64) {
        self.request_duration_ms.lock().record(ms);
    }

    pub fn observe_rotation_handoff_ms(&self, ms: f64) {
        self.rotation_handoff_ms.lock().record(ms);
    }

    pub fn observe_compression_ratio(&self, ratio: f64) {
        self.compression_ratio.lock().record(ratio);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            requests_total: self.requests_total.load(Ordering::Relaxed),
            errors_total: self.errors_total.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            tokens_in_total: self.tokens_in_total.load(Ordering::Relaxed),
            tokens_out_total: self.tokens_out_total.load(Ordering::Relaxed),
            cost_usd_total: CostUsd::from_micros(
                self.cost_usd_total_micros.load(Ordering::Relaxed),
            ),
            integrity_violations: self.integrity_violations.load(Ordering::Relaxed),
            active_requests: self.active_requests.load(Ordering::Relaxed),
            active_sessions: self.active_sessions.load(Ordering::Relaxed),
            budget_utilization_pct: self.budget_utilization_bp.load(Ordering::Relaxed) as f64
                / 100.0,
            request_duration_ms: self.request_duration_ms.lock().snapshot(),
            rotation_handoff_ms: self.rotation_handoff_ms.lock().snapshot(),
            compression_ratio: self.compression_ratio.lock().snapshot(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let metrics = MetricsRegistry::new();
        metrics.inc_requests();
        metrics.inc_requests();
        metrics.inc_errors();
        metrics.add_tokens(100, 40);
        metrics.add_cost(CostUsd::from_micros(1_500));

        let snap = metrics.snapshot();
        assert_eq!(snap.requests_total, 2);
        assert_eq!(snap.errors_total, 1);
        assert_eq!(snap.tokens_in_total, 100);
        assert_eq!(snap.tokens_out_total, 40);
        assert_eq!(snap.cost_usd_total, CostUsd::from_micros(1_500));
    }

    #[test]
    fn gauges_go_up_and_down() {
        let metrics = MetricsRegistry::new();
        metrics.request_started();
        metrics.request_started();
        metrics.request_finished();
        metrics.session_opened();

        let snap = metrics.snapshot();
        assert_eq!(snap.active_requests, 1);
        assert_eq!(snap.active_sessions, 1);
    }

    #[test]
    fn utilization_roundtrips_through_basis_points() {
        let metrics = MetricsRegistry::new();
        metrics.set_budget_utilization_pct(63.75);
        let snap = metrics.snapshot();
        assert!((snap.budget_utilization_pct - 63.75).abs() < 0.01);
    }

    #[test]
    fn histogram_tracks_extrema() {
        let metrics = MetricsRegistry::new();
        metrics.observe_rotation_handoff_ms(120.0);
        metrics.observe_rotation_handoff_ms(80.0);
        metrics.observe_rotation_handoff_ms(200.0);

        let snap = metrics.snapshot().rotation_handoff_ms;
        assert_eq!(snap.count, 3);
        assert_eq!(snap.min, 80.0);
        assert_eq!(snap.max, 200.0);
        assert_eq!(snap.sum, 400.0);
    }
}
