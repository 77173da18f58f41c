//! Rampart - an adaptive-defense authoritative DNS server.
//!
//! A per-client token-bucket rate limiter, an EWMA anomaly detector over
//! aggregate traffic shape, and a short-lived response cache, wired into a
//! feedback loop that tightens per-client limits during detected floods and
//! relaxes them again as traffic quiets down.

pub mod cache;
pub mod config;
pub mod detector;
pub mod dns;
pub mod limiter;
pub mod metrics;
pub mod pipeline;
pub mod transport;
pub mod zone;
