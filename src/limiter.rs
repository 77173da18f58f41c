//! Per-client token-bucket rate limiting.
//!
//! One bucket per client IP, created lazily and starting full so a client's
//! first contact is never penalized. The whole table sits behind a single
//! mutex: refill-then-consume and limit changes are atomic with respect to
//! each other.

use rustc_hash::FxHashMap;
use std::net::IpAddr;
use std::sync::Mutex;
use std::time::{Duration, Instant};

struct TokenBucket {
    capacity: f64,
    tokens: f64,
    refill_rate: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(capacity: f64, refill_rate: f64, now: Instant) -> Self {
        Self {
            capacity,
            tokens: capacity,
            refill_rate,
            last_refill: now,
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill);
        self.tokens =
            (self.tokens + elapsed.as_secs_f64() * self.refill_rate).min(self.capacity);
        self.last_refill = now;
    }
}

struct Limits {
    rate: f64,
    burst: f64,
    buckets: FxHashMap<IpAddr, TokenBucket>,
}

/// Token-bucket rate limiter keyed by client IP.
pub struct RateLimiter {
    inner: Mutex<Limits>,
}

impl RateLimiter {
    /// Create a limiter. `rate` is floored at 1.0 qps and `burst` at the
    /// effective rate; out-of-range inputs are clamped, never rejected.
    pub fn new(rate: f64, burst: f64) -> Self {
        let rate = rate.max(1.0);
        let burst = burst.max(rate);
        Self {
            inner: Mutex::new(Limits {
                rate,
                burst,
                buckets: FxHashMap::default(),
            }),
        }
    }

    /// Decide whether a request from `client` may proceed, consuming one
    /// token if so.
    pub fn allow(&self, client: IpAddr) -> bool {
        self.allow_at(client, Instant::now())
    }

    /// `allow` with an explicit clock, for deterministic tests.
    pub fn allow_at(&self, client: IpAddr, now: Instant) -> bool {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let (rate, burst) = (inner.rate, inner.burst);
        let bucket = inner
            .buckets
            .entry(client)
            .or_insert_with(|| TokenBucket::new(burst, rate, now));
        bucket.refill(now);
        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Update the global rate/burst, rewriting every existing bucket and
    /// re-clamping its tokens. Applies immediately, not just to new buckets.
    pub fn set_limits(&self, rate: f64, burst: Option<f64>) {
        self.set_limits_at(rate, burst, Instant::now())
    }

    pub fn set_limits_at(&self, rate: f64, burst: Option<f64>, now: Instant) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.rate = rate.max(1.0);
        inner.burst = burst.unwrap_or(inner.burst).max(inner.rate);
        let (rate, burst) = (inner.rate, inner.burst);
        for bucket in inner.buckets.values_mut() {
            bucket.capacity = burst;
            bucket.refill_rate = rate;
            bucket.tokens = bucket.tokens.min(bucket.capacity);
            bucket.last_refill = now;
        }
    }

    /// Current (rate, burst).
    pub fn current_limits(&self) -> (f64, f64) {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        (inner.rate, inner.burst)
    }

    /// Drop buckets untouched for longer than `max_idle`; returns how many
    /// were evicted. The table otherwise grows without bound.
    pub fn sweep_idle(&self, max_idle: Duration) -> usize {
        self.sweep_idle_at(max_idle, Instant::now())
    }

    pub fn sweep_idle_at(&self, max_idle: Duration, now: Instant) -> usize {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let before = inner.buckets.len();
        inner
            .buckets
            .retain(|_, b| now.saturating_duration_since(b.last_refill) <= max_idle);
        before - inner.buckets.len()
    }

    /// Number of tracked client buckets.
    pub fn tracked_clients(&self) -> usize {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.buckets.len()
    }
}
