//! Typed server configuration.
//!
//! Loaded once at startup from a TOML file, with defaults for every option
//! and a validation pass before anything is constructed from it. Rate/burst
//! floors are applied by the limiter itself, so they are not rejected here.

use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
    #[error("invalid A record \"{label}\": {value:?} is not an IPv4 address")]
    InvalidARecord { label: String, value: String },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub listen_host: String,
    pub listen_port: u16,
    /// Origin suffix served authoritatively, e.g. "example.test."
    pub origin: String,
    pub metrics_host: String,
    pub metrics_port: u16,
    pub ratelimit: RateLimitConfig,
    pub adaptive: AdaptiveConfig,
    pub cache: CacheConfig,
    pub records: RecordsConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RateLimitConfig {
    pub enabled: bool,
    pub per_client_qps: f64,
    pub burst: f64,
    /// Buckets idle this long are swept; 0 disables the sweep.
    pub idle_eviction_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AdaptiveConfig {
    pub enabled: bool,
    pub ewma_alpha: f64,
    pub qps_high: f64,
    pub nxdomain_ratio_high: f64,
    pub cooldown_seconds: u64,
    /// Multiplier applied to the base rate when an anomaly triggers.
    pub upscale_factor: f64,
    /// Per-pass geometric recovery factor back toward the base rate.
    pub downscale_recovery: f64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheConfig {
    /// Maximum cached entries; 0 means unbounded.
    pub max_entries: usize,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RecordsConfig {
    pub a: BTreeMap<String, String>,
    pub txt: BTreeMap<String, String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_host: "127.0.0.1".to_string(),
            listen_port: 1053,
            origin: "example.test.".to_string(),
            metrics_host: "127.0.0.1".to_string(),
            metrics_port: 9053,
            ratelimit: RateLimitConfig::default(),
            adaptive: AdaptiveConfig::default(),
            cache: CacheConfig::default(),
            records: RecordsConfig::default(),
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            per_client_qps: 50.0,
            burst: 100.0,
            idle_eviction_seconds: 300,
        }
    }
}

impl Default for AdaptiveConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ewma_alpha: 0.3,
            qps_high: 2000.0,
            nxdomain_ratio_high: 0.3,
            cooldown_seconds: 10,
            upscale_factor: 0.5,
            downscale_recovery: 1.25,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { max_entries: 0 }
    }
}

impl Config {
    /// Load and validate a configuration file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let config: Config = toml::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.origin.trim_matches('.').is_empty() {
            return Err(ConfigError::Invalid("origin must not be empty".into()));
        }
        let a = &self.adaptive;
        if !(a.ewma_alpha > 0.0 && a.ewma_alpha <= 1.0) {
            return Err(ConfigError::Invalid(
                "adaptive.ewma_alpha must be in (0, 1]".into(),
            ));
        }
        if a.qps_high <= 0.0 {
            return Err(ConfigError::Invalid(
                "adaptive.qps_high must be positive".into(),
            ));
        }
        if !(0.0..=1.0).contains(&a.nxdomain_ratio_high) {
            return Err(ConfigError::Invalid(
                "adaptive.nxdomain_ratio_high must be in [0, 1]".into(),
            ));
        }
        if a.upscale_factor <= 0.0 {
            return Err(ConfigError::Invalid(
                "adaptive.upscale_factor must be positive".into(),
            ));
        }
        if a.downscale_recovery < 1.0 {
            return Err(ConfigError::Invalid(
                "adaptive.downscale_recovery must be at least 1.0".into(),
            ));
        }
        Ok(())
    }

    /// Origin with case and the trailing dot normalized away, matching query
    /// name normalization.
    pub fn origin_normalized(&self) -> String {
        self.origin.trim_end_matches('.').to_lowercase()
    }
}

impl AdaptiveConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_seconds)
    }
}
