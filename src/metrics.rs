//! Shared counters and gauges written by the query pipeline.
//!
//! Counters are cumulative for the process lifetime; gauges hold the most
//! recent value from the adaptive-tuning pass. Everything is atomic so every
//! worker can write without coordination; an external HTTP endpoint polls
//! `snapshot()`.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Atomic metrics store.
pub struct Metrics {
    queries_total: AtomicU64,
    responses_noerror: AtomicU64,
    responses_nxdomain: AtomicU64,
    dropped_ratelimit: AtomicU64,
    // Gauges store f64 bit patterns.
    current_per_client_qps: AtomicU64,
    current_burst: AtomicU64,
    ewma_qps: AtomicU64,
    nxdomain_ratio: AtomicU64,
}

/// Point-in-time view of the cumulative counters, consumed by the anomaly
/// detector.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CounterSnapshot {
    pub queries_total: u64,
    pub responses_noerror: u64,
    pub responses_nxdomain: u64,
    pub dropped_ratelimit: u64,
}

/// Flat counters+gauges view served over HTTP and logged periodically.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub queries_total: u64,
    pub responses_noerror: u64,
    pub responses_nxdomain: u64,
    pub dropped_ratelimit: u64,
    pub current_per_client_qps: f64,
    pub current_burst: f64,
    pub ewma_qps: f64,
    pub nxdomain_ratio: f64,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            queries_total: AtomicU64::new(0),
            responses_noerror: AtomicU64::new(0),
            responses_nxdomain: AtomicU64::new(0),
            dropped_ratelimit: AtomicU64::new(0),
            current_per_client_qps: AtomicU64::new(0f64.to_bits()),
            current_burst: AtomicU64::new(0f64.to_bits()),
            ewma_qps: AtomicU64::new(0f64.to_bits()),
            nxdomain_ratio: AtomicU64::new(0f64.to_bits()),
        }
    }

    pub fn incr_queries_total(&self) {
        self.queries_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_responses_noerror(&self) {
        self.responses_noerror.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_responses_nxdomain(&self) {
        self.responses_nxdomain.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_dropped_ratelimit(&self) {
        self.dropped_ratelimit.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_current_per_client_qps(&self, qps: f64) {
        self.current_per_client_qps
            .store(qps.to_bits(), Ordering::Relaxed);
    }

    pub fn set_current_burst(&self, burst: f64) {
        self.current_burst.store(burst.to_bits(), Ordering::Relaxed);
    }

    pub fn set_ewma_qps(&self, qps: f64) {
        self.ewma_qps.store(qps.to_bits(), Ordering::Relaxed);
    }

    pub fn set_nxdomain_ratio(&self, ratio: f64) {
        self.nxdomain_ratio.store(ratio.to_bits(), Ordering::Relaxed);
    }

    pub fn counters(&self) -> CounterSnapshot {
        CounterSnapshot {
            queries_total: self.queries_total.load(Ordering::Relaxed),
            responses_noerror: self.responses_noerror.load(Ordering::Relaxed),
            responses_nxdomain: self.responses_nxdomain.load(Ordering::Relaxed),
            dropped_ratelimit: self.dropped_ratelimit.load(Ordering::Relaxed),
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let counters = self.counters();
        MetricsSnapshot {
            queries_total: counters.queries_total,
            responses_noerror: counters.responses_noerror,
            responses_nxdomain: counters.responses_nxdomain,
            dropped_ratelimit: counters.dropped_ratelimit,
            current_per_client_qps: f64::from_bits(
                self.current_per_client_qps.load(Ordering::Relaxed),
            ),
            current_burst: f64::from_bits(self.current_burst.load(Ordering::Relaxed)),
            ewma_qps: f64::from_bits(self.ewma_qps.load(Ordering::Relaxed)),
            nxdomain_ratio: f64::from_bits(self.nxdomain_ratio.load(Ordering::Relaxed)),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
