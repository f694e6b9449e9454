//! Configuration loading for the geolocation engine
//!
//! TOML-backed, with serde defaults so a partial file (or none at all)
//! yields a working setup.

use crate::circuit_breaker::BreakerConfig;
use crate::retry::RetryPolicy;
use crate::types::ProviderId;
use serde::{Deserialize, Serialize};

/// Top-level engine configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GeoConfig {
    #[serde(default)]
    pub service: ServiceConfig,

    #[serde(default)]
    pub retry: RetryPolicy,

    #[serde(default)]
    pub breaker: BreakerConfig,

    #[serde(default)]
    pub providers: ProvidersConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Master switch; a disabled service rejects every call
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_true")]
    pub cache_enabled: bool,

    /// Race providers concurrently instead of ordered fallback
    #[serde(default = "default_true")]
    pub parallel: bool,

    /// Fan-out cap for parallel mode
    #[serde(default = "default_max_parallel_providers")]
    pub max_parallel_providers: usize,

    /// Distance within which two providers are considered to agree
    #[serde(default = "default_agreement_threshold_km")]
    pub agreement_threshold_km: f64,

    /// Serve an expired cache entry when every provider fails (parallel mode)
    #[serde(default = "default_true")]
    pub stale_cache_fallback: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvidersConfig {
    /// Enabled providers; registry order is by provider priority, not list order
    #[serde(default = "default_enabled_providers")]
    pub enabled: Vec<ProviderId>,

    /// Per-call HTTP timeout in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_true() -> bool {
    true
}
fn default_max_parallel_providers() -> usize {
    2
}
fn default_agreement_threshold_km() -> f64 {
    50.0
}
fn default_enabled_providers() -> Vec<ProviderId> {
    vec![ProviderId::IpApi, ProviderId::IpapiCo, ProviderId::IpWhois]
}
fn default_timeout_secs() -> u64 {
    5
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            cache_enabled: true,
            parallel: true,
            max_parallel_providers: default_max_parallel_providers(),
            agreement_threshold_km: default_agreement_threshold_km(),
            stale_cache_fallback: true,
        }
    }
}

impl Default for ProvidersConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled_providers(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl GeoConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: GeoConfig = toml::from_str(&content)?;
        Ok(config)
    }
}
