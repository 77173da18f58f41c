//! Query pipeline orchestration.
//!
//! Runs every decoded query through the same sequence of stages:
//!
//! 1. Admission (token-bucket rate limiting)
//! 2. Cache lookup
//! 3. Resolution against the zone (cache miss only)
//! 4. Adaptive tuning (anomaly detection feeding back into the limiter)
//!
//! The limiter and detector form a closed loop that outlives any single
//! query: a detected flood tightens the per-client rate immediately, and
//! quiet traffic recovers it geometrically toward the configured base.
//!
//! All cross-query state lives in this struct, constructed once at startup;
//! several pipelines can coexist in one process.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::cache::ResponseCache;
use crate::config::{Config, ConfigError};
use crate::detector::{AnomalyDetector, DetectorConfig};
use crate::dns::{DnsQuery, DnsResponse};
use crate::limiter::RateLimiter;
use crate::metrics::Metrics;
use crate::zone::Zone;

/// Positive answers are cached and served with this fixed TTL.
const ANSWER_TTL_SECS: u64 = 60;

/// Per-query orchestrator holding all cross-cutting state.
pub struct QueryPipeline {
    zone: Zone,
    limiter: RateLimiter,
    cache: ResponseCache,
    detector: Option<AnomalyDetector>,
    metrics: Arc<Metrics>,
    ratelimit_enabled: bool,
    base_qps: f64,
    upscale_factor: f64,
    downscale_recovery: f64,
}

impl QueryPipeline {
    pub fn new(config: &Config, metrics: Arc<Metrics>) -> Result<Self, ConfigError> {
        let zone = Zone::from_config(config)?;
        let limiter = RateLimiter::new(config.ratelimit.per_client_qps, config.ratelimit.burst);
        let detector = config.adaptive.enabled.then(|| {
            AnomalyDetector::new(DetectorConfig {
                alpha: config.adaptive.ewma_alpha,
                qps_high: config.adaptive.qps_high,
                nxdomain_ratio_high: config.adaptive.nxdomain_ratio_high,
                cooldown: config.adaptive.cooldown(),
            })
        });

        // Effective limits after the limiter's floors, not the raw config
        let (rate, burst) = limiter.current_limits();
        metrics.set_current_per_client_qps(rate);
        metrics.set_current_burst(burst);

        Ok(Self {
            zone,
            limiter,
            cache: ResponseCache::new(config.cache.max_entries),
            detector,
            metrics,
            ratelimit_enabled: config.ratelimit.enabled,
            base_qps: rate,
            upscale_factor: config.adaptive.upscale_factor,
            downscale_recovery: config.adaptive.downscale_recovery,
        })
    }

    /// Process one decoded query to a response.
    pub fn handle(&self, query: &DnsQuery, client: IpAddr) -> DnsResponse {
        self.handle_at(query, client, Instant::now())
    }

    /// `handle` with an explicit clock, for deterministic tests.
    pub fn handle_at(&self, query: &DnsQuery, client: IpAddr, now: Instant) -> DnsResponse {
        self.metrics.incr_queries_total();

        // Stage 1: admission
        if self.ratelimit_enabled && !self.limiter.allow_at(client, now) {
            self.metrics.incr_dropped_ratelimit();
            return DnsResponse::refused(query);
        }

        // Stage 2: cache lookup; counters were bumped at insertion time
        let response = match self.cache.get_at(&query.name, query.qtype, now) {
            Some(answers) => DnsResponse::answer(query, answers),
            None => self.resolve_at(query, now),
        };

        // Stage 4: adaptive tuning
        self.tune_at(now);

        response
    }

    /// Stage 3: resolution against the zone.
    fn resolve_at(&self, query: &DnsQuery, now: Instant) -> DnsResponse {
        // Names outside the origin are an authoritative-subset policy
        // outcome, not a resolution failure: NXDOMAIN without the counter.
        let Some(label) = self.zone.relative_label(&query.name) else {
            return DnsResponse::nxdomain(query);
        };

        match self
            .zone
            .lookup(label, &query.name, query.qtype, ANSWER_TTL_SECS as u32)
        {
            Some(answers) => {
                self.metrics.incr_responses_noerror();
                self.cache.put_at(
                    &query.name,
                    query.qtype,
                    answers.clone(),
                    Duration::from_secs(ANSWER_TTL_SECS),
                    now,
                );
                DnsResponse::answer(query, answers)
            }
            None => {
                // Negative results are not cached
                self.metrics.incr_responses_nxdomain();
                DnsResponse::nxdomain(query)
            }
        }
    }

    /// Stage 4: fold the counters into the detector and adjust limits.
    /// Escalation is immediate on a trigger; recovery toward the base rate
    /// is geometric, so the loop cannot oscillate.
    fn tune_at(&self, now: Instant) {
        let Some(detector) = &self.detector else {
            return;
        };

        let observation = detector.update_at(self.metrics.counters(), now);
        self.metrics.set_ewma_qps(observation.ewma_qps);
        self.metrics.set_nxdomain_ratio(observation.nxdomain_ratio);

        if observation.anomaly {
            let throttled = (self.base_qps * self.upscale_factor).max(1.0);
            self.limiter.set_limits_at(throttled, None, now);
            self.metrics
                .set_current_per_client_qps(self.limiter.current_limits().0);
        } else {
            let (current, _) = self.limiter.current_limits();
            if current < self.base_qps {
                let recovered = (current * self.downscale_recovery).min(self.base_qps);
                self.limiter.set_limits_at(recovered, None, now);
                self.metrics.set_current_per_client_qps(recovered);
            }
        }
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }

    pub fn origin(&self) -> &str {
        self.zone.origin()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::{Rcode, TYPE_A};

    fn test_config() -> Config {
        let mut config = Config::default();
        config.origin = "example.test.".to_string();
        config
            .records
            .a
            .insert("www".to_string(), "1.2.3.4".to_string());
        config.ratelimit.per_client_qps = 10.0;
        config.ratelimit.burst = 20.0;
        config.adaptive.enabled = false;
        config
    }

    fn pipeline(config: &Config) -> QueryPipeline {
        QueryPipeline::new(config, Arc::new(Metrics::new())).unwrap()
    }

    fn query(name: &str, qtype: u16) -> DnsQuery {
        DnsQuery {
            id: 0x1234,
            flags: 0x0100,
            name: name.to_string(),
            qtype,
            qclass: 1,
        }
    }

    fn client() -> IpAddr {
        "192.0.2.10".parse().unwrap()
    }

    #[test]
    fn zone_hit_answers_and_counts() {
        let pipeline = pipeline(&test_config());

        let response = pipeline.handle(&query("www.example.test", TYPE_A), client());

        assert_eq!(response.rcode, Rcode::NoError);
        assert_eq!(response.answers[0].rdata, vec![1, 2, 3, 4]);
        let counters = pipeline.metrics().counters();
        assert_eq!(counters.queries_total, 1);
        assert_eq!(counters.responses_noerror, 1);
    }

    #[test]
    fn repeat_query_is_served_from_cache_without_recounting() {
        let pipeline = pipeline(&test_config());

        let first = pipeline.handle(&query("www.example.test", TYPE_A), client());
        let second = pipeline.handle(&query("www.example.test", TYPE_A), client());

        assert_eq!(second.rcode, Rcode::NoError);
        assert_eq!(second.answers[0].rdata, first.answers[0].rdata);
        let counters = pipeline.metrics().counters();
        assert_eq!(counters.queries_total, 2);
        // Counted once, at insertion time
        assert_eq!(counters.responses_noerror, 1);
        assert_eq!(pipeline.cache_len(), 1);
    }

    #[test]
    fn missing_record_is_nxdomain_and_not_cached() {
        let pipeline = pipeline(&test_config());

        let response = pipeline.handle(&query("missing.example.test", TYPE_A), client());

        assert_eq!(response.rcode, Rcode::NxDomain);
        assert_eq!(pipeline.metrics().counters().responses_nxdomain, 1);
        assert_eq!(pipeline.cache_len(), 0);
    }

    #[test]
    fn name_outside_origin_is_nxdomain_without_counter() {
        let pipeline = pipeline(&test_config());

        let response = pipeline.handle(&query("www.other.test", TYPE_A), client());

        assert_eq!(response.rcode, Rcode::NxDomain);
        let counters = pipeline.metrics().counters();
        assert_eq!(counters.queries_total, 1);
        assert_eq!(counters.responses_nxdomain, 0);
    }

    #[test]
    fn burst_is_admitted_then_refused_until_refill() {
        let pipeline = pipeline(&test_config());
        let now = Instant::now();
        let query = query("www.example.test", TYPE_A);

        let responses: Vec<Rcode> = (0..30)
            .map(|_| pipeline.handle_at(&query, client(), now).rcode)
            .collect();

        assert!(responses[..20].iter().all(|r| *r == Rcode::NoError));
        assert!(responses[20..].iter().all(|r| *r == Rcode::Refused));
        let counters = pipeline.metrics().counters();
        assert_eq!(counters.queries_total, 30);
        assert_eq!(counters.dropped_ratelimit, 10);

        // One second later, 10 tokens have refilled
        let later = now + Duration::from_secs(1);
        let admitted = (0..30)
            .filter(|_| pipeline.handle_at(&query, client(), later).rcode == Rcode::NoError)
            .count();
        assert_eq!(admitted, 10);
    }

    #[test]
    fn refused_query_skips_cache_and_resolution() {
        let mut config = test_config();
        config.ratelimit.per_client_qps = 1.0;
        config.ratelimit.burst = 1.0;
        let pipeline = pipeline(&config);
        let now = Instant::now();

        pipeline.handle_at(&query("www.example.test", TYPE_A), client(), now);
        let refused = pipeline.handle_at(&query("missing.example.test", TYPE_A), client(), now);

        assert_eq!(refused.rcode, Rcode::Refused);
        // Resolution never ran for the refused query
        assert_eq!(pipeline.metrics().counters().responses_nxdomain, 0);
    }

    #[test]
    fn disabled_ratelimit_admits_everything() {
        let mut config = test_config();
        config.ratelimit.enabled = false;
        let pipeline = pipeline(&config);
        let now = Instant::now();
        let query = query("www.example.test", TYPE_A);

        let refused = (0..100)
            .filter(|_| pipeline.handle_at(&query, client(), now).rcode == Rcode::Refused)
            .count();

        assert_eq!(refused, 0);
        assert_eq!(pipeline.metrics().counters().dropped_ratelimit, 0);
    }

    #[test]
    fn anomaly_throttles_then_recovers_geometrically() {
        let mut config = test_config();
        config.ratelimit.per_client_qps = 100.0;
        config.ratelimit.burst = 1000.0;
        config.adaptive.enabled = true;
        config.adaptive.ewma_alpha = 1.0;
        config.adaptive.qps_high = 50.0;
        config.adaptive.nxdomain_ratio_high = 0.9;
        config.adaptive.cooldown_seconds = 60;
        config.adaptive.upscale_factor = 0.5;
        config.adaptive.downscale_recovery = 1.2;
        let pipeline = pipeline(&config);
        let start = Instant::now() + Duration::from_secs(1);
        let query = query("www.example.test", TYPE_A);

        // Baseline sample a second after startup: ~1 qps, no trigger
        pipeline.handle_at(&query, client(), start);
        assert_eq!(pipeline.limiter().current_limits().0, 100.0);

        // A back-to-back query at the same instant: the epsilon-floored dt
        // makes the instantaneous rate enormous and trips the detector
        pipeline.handle_at(&query, client(), start);
        assert_eq!(pipeline.limiter().current_limits().0, 50.0);

        // Quiet traffic at 1 qps recovers geometrically toward base,
        // clamped so it never overshoots
        let mut rates = Vec::new();
        for i in 1..=6 {
            pipeline.handle_at(&query, client(), start + Duration::from_secs(i));
            rates.push(pipeline.limiter().current_limits().0);
        }

        let expected = [60.0, 72.0, 86.4, 100.0, 100.0, 100.0];
        for (rate, want) in rates.iter().zip(expected) {
            assert!((rate - want).abs() < 1e-9, "rate {rate} != {want}");
        }
    }

    #[test]
    fn throttle_floors_at_one_qps() {
        let mut config = test_config();
        config.ratelimit.per_client_qps = 1.0;
        config.ratelimit.burst = 1000.0;
        config.adaptive.enabled = true;
        config.adaptive.ewma_alpha = 1.0;
        config.adaptive.qps_high = 50.0;
        config.adaptive.upscale_factor = 0.1;
        let pipeline = pipeline(&config);
        let start = Instant::now();
        let query = query("www.example.test", TYPE_A);

        pipeline.handle_at(&query, client(), start);
        pipeline.handle_at(&query, client(), start);

        assert_eq!(pipeline.limiter().current_limits().0, 1.0);
    }

    #[test]
    fn tuning_publishes_gauges() {
        let mut config = test_config();
        config.adaptive.enabled = true;
        let pipeline = pipeline(&config);
        let start = Instant::now();

        pipeline.handle_at(
            &query("missing.example.test", TYPE_A),
            client(),
            start + Duration::from_secs(1),
        );

        let snapshot = pipeline.metrics().snapshot();
        assert!(snapshot.ewma_qps > 0.0);
        assert!(snapshot.nxdomain_ratio > 0.0);
        assert_eq!(snapshot.current_per_client_qps, 10.0);
        assert_eq!(snapshot.current_burst, 20.0);
    }

    #[test]
    fn pipelines_do_not_share_state() {
        let first = pipeline(&test_config());
        let second = pipeline(&test_config());

        first.handle(&query("www.example.test", TYPE_A), client());

        assert_eq!(first.metrics().counters().queries_total, 1);
        assert_eq!(second.metrics().counters().queries_total, 0);
        assert_eq!(second.cache_len(), 0);
    }
}
