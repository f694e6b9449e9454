//! Typed error taxonomy for the geolocation engine
//!
//! Provider-client failures are converted into `GeoError` at the client
//! boundary; the orchestrator aggregates per-provider errors into
//! `AllProvidersFailed` in both sequential and parallel mode. Errors are
//! `Clone` so one fetch outcome can be broadcast to every coalesced caller.

use crate::types::ProviderId;
use std::time::Duration;
use thiserror::Error;

pub type GeoResult<T> = Result<T, GeoError>;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum GeoError {
    /// Every attempted provider failed; carries each per-provider error
    #[error("all providers failed ({} attempted)", errors.len())]
    AllProvidersFailed {
        errors: Vec<(ProviderId, Box<GeoError>)>,
    },

    /// The provider's circuit breaker rejected the request before any I/O
    #[error("circuit open for {provider}, retry after {retry_after:?}")]
    CircuitOpen {
        provider: ProviderId,
        retry_after: Duration,
    },

    /// HTTP 429 from the provider; respects a Retry-After hint when present
    #[error("rate limited by {provider} (retry after {retry_after:?})")]
    RateLimited {
        provider: ProviderId,
        retry_after: Option<Duration>,
    },

    #[error("{provider} timed out after {elapsed_ms}ms")]
    Timeout { provider: ProviderId, elapsed_ms: u64 },

    /// Response decoded but did not match the provider's documented shape
    #[error("invalid response from {provider}: {detail}")]
    Parse { provider: ProviderId, detail: String },

    #[error("{provider} returned out-of-range coordinates ({latitude}, {longitude})")]
    CoordinatesInvalid {
        provider: ProviderId,
        latitude: f64,
        longitude: f64,
    },

    /// Transport-level failure (connect, DNS, TLS, body read)
    #[error("network error talking to {provider}: {message}")]
    Network { provider: ProviderId, message: String },

    /// Non-2xx status other than 429
    #[error("{provider} returned HTTP {status}")]
    Http { provider: ProviderId, status: u16 },

    #[error("geolocation service is disabled by configuration")]
    ServiceDisabled,

    #[error("no geolocation providers configured")]
    NoProvidersConfigured,

    /// The cached entry expired and the refresh pipeline failed
    #[error("cache expired and refresh failed")]
    StaleCacheRefreshFailed { source: Box<GeoError> },

    /// Fatal configuration problem (for example an unparseable endpoint URL)
    #[error("configuration error: {0}")]
    Config(String),

    /// Durable key-value store failure
    #[error("storage error: {0}")]
    Storage(String),
}

impl GeoError {
    /// Whether the retry executor may try this attempt again.
    ///
    /// Timeouts, transport failures, and HTTP 5xx are transient. Rate limits
    /// and open circuits carry their own wait semantics and are never
    /// retried inline; parsing, coordinate, and configuration failures are
    /// permanent for the attempt sequence.
    pub fn is_retryable(&self) -> bool {
        match self {
            GeoError::Timeout { .. } => true,
            GeoError::Network { .. } => true,
            GeoError::Http { status, .. } => *status >= 500,

            GeoError::AllProvidersFailed { .. } => false,
            GeoError::CircuitOpen { .. } => false,
            GeoError::RateLimited { .. } => false,
            GeoError::Parse { .. } => false,
            GeoError::CoordinatesInvalid { .. } => false,
            GeoError::ServiceDisabled => false,
            GeoError::NoProvidersConfigured => false,
            GeoError::StaleCacheRefreshFailed { .. } => false,
            GeoError::Config(_) => false,
            GeoError::Storage(_) => false,
        }
    }

    /// Wait hint for errors that carry their own backoff semantics
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            GeoError::CircuitOpen { retry_after, .. } => Some(*retry_after),
            GeoError::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// Provider this error is attributed to, if any
    pub fn provider(&self) -> Option<ProviderId> {
        match self {
            GeoError::CircuitOpen { provider, .. }
            | GeoError::RateLimited { provider, .. }
            | GeoError::Timeout { provider, .. }
            | GeoError::Parse { provider, .. }
            | GeoError::CoordinatesInvalid { provider, .. }
            | GeoError::Network { provider, .. }
            | GeoError::Http { provider, .. } => Some(*provider),
            _ => None,
        }
    }

    /// Stable label for the metrics error histogram
    pub fn kind(&self) -> &'static str {
        match self {
            GeoError::AllProvidersFailed { .. } => "all_providers_failed",
            GeoError::CircuitOpen { .. } => "circuit_open",
            GeoError::RateLimited { .. } => "rate_limited",
            GeoError::Timeout { .. } => "timeout",
            GeoError::Parse { .. } => "parse",
            GeoError::CoordinatesInvalid { .. } => "coordinates_invalid",
            GeoError::Network { .. } => "network",
            GeoError::Http { .. } => "http",
            GeoError::ServiceDisabled => "service_disabled",
            GeoError::NoProvidersConfigured => "no_providers_configured",
            GeoError::StaleCacheRefreshFailed { .. } => "stale_cache_refresh_failed",
            GeoError::Config(_) => "config",
            GeoError::Storage(_) => "storage",
        }
    }
}
