//! EWMA-based traffic anomaly detection.
//!
//! Watches the cumulative counters and smooths the instantaneous query rate
//! with an exponentially-weighted moving average. A trigger fires on a high
//! smoothed rate, or on a high NXDOMAIN ratio combined with at least a
//! quarter of the rate threshold (so a low-traffic burst of NXDOMAINs cannot
//! trigger alone). Reported triggers are debounced by a cooldown; the EWMA
//! state itself always advances.

use crate::metrics::CounterSnapshot;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Floor for the sample interval, so back-to-back updates never divide by
/// zero.
const MIN_SAMPLE_INTERVAL_SECS: f64 = 1e-6;

/// Detector tuning knobs.
#[derive(Debug, Clone)]
pub struct DetectorConfig {
    /// EWMA smoothing factor, in (0, 1].
    pub alpha: f64,
    /// Smoothed-QPS trigger threshold.
    pub qps_high: f64,
    /// NXDOMAIN-ratio trigger threshold.
    pub nxdomain_ratio_high: f64,
    /// Minimum spacing between reported triggers.
    pub cooldown: Duration,
}

/// Result of one detector update.
#[derive(Debug, Clone, Copy)]
pub struct Observation {
    pub anomaly: bool,
    pub ewma_qps: f64,
    pub nxdomain_ratio: f64,
}

struct DetectorState {
    ewma_qps: f64,
    last_sample: Instant,
    last_counters: CounterSnapshot,
    last_trigger: Option<Instant>,
}

/// Stateful EWMA anomaly detector. Updates are serialized by an internal
/// mutex so each one sees its predecessor's state.
pub struct AnomalyDetector {
    config: DetectorConfig,
    state: Mutex<DetectorState>,
}

impl AnomalyDetector {
    pub fn new(config: DetectorConfig) -> Self {
        Self {
            config,
            state: Mutex::new(DetectorState {
                ewma_qps: 0.0,
                last_sample: Instant::now(),
                last_counters: CounterSnapshot::default(),
                last_trigger: None,
            }),
        }
    }

    /// Fold the current counters into the EWMA and report whether an anomaly
    /// should be acted on.
    pub fn update(&self, counters: CounterSnapshot) -> Observation {
        self.update_at(counters, Instant::now())
    }

    /// `update` with an explicit clock, for deterministic tests.
    pub fn update_at(&self, counters: CounterSnapshot, now: Instant) -> Observation {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());

        let dt = now
            .saturating_duration_since(state.last_sample)
            .as_secs_f64()
            .max(MIN_SAMPLE_INTERVAL_SECS);
        let d_queries = counters
            .queries_total
            .saturating_sub(state.last_counters.queries_total);
        let inst_qps = d_queries as f64 / dt;
        state.ewma_qps =
            self.config.alpha * inst_qps + (1.0 - self.config.alpha) * state.ewma_qps;

        let d_nxd = counters
            .responses_nxdomain
            .saturating_sub(state.last_counters.responses_nxdomain);
        // Floored at 1 so a single stray NXDOMAIN with zero successes does
        // not read as a 100% ratio.
        let d_ok = counters
            .responses_noerror
            .saturating_sub(state.last_counters.responses_noerror)
            .max(1);
        let ratio = d_nxd as f64 / (d_nxd + d_ok) as f64;

        // State advances regardless of the trigger outcome
        state.last_sample = now;
        state.last_counters = counters;

        let hit = state.ewma_qps > self.config.qps_high
            || (ratio > self.config.nxdomain_ratio_high
                && state.ewma_qps > self.config.qps_high / 4.0);
        let cooled_down = state
            .last_trigger
            .is_none_or(|t| now.saturating_duration_since(t) > self.config.cooldown);

        let anomaly = hit && cooled_down;
        if anomaly {
            state.last_trigger = Some(now);
        }

        Observation {
            anomaly,
            ewma_qps: state.ewma_qps,
            nxdomain_ratio: ratio,
        }
    }
}
