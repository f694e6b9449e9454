//! Provider clients for public IP-geolocation APIs
//!
//! Each client wraps one HTTP endpoint behind the shared `GeoProvider`
//! trait: issue a timed GET through the transport seam, decode the
//! provider's envelope, validate coordinates, and assign an initial
//! confidence from metadata richness alone. Cross-provider agreement
//! scoring happens upstream in the orchestrator, never here.

mod ip_api;
mod ipapi_co;
mod ipwhois;

pub use ip_api::IpApiProvider;
pub use ipapi_co::IpapiCoProvider;
pub use ipwhois::IpWhoisProvider;

use crate::error::{GeoError, GeoResult};
use crate::transport::{HttpResponse, HttpTransport, TransportError};
use crate::types::{Confidence, GeoMetadata, GeolocationResult, ProviderId};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// Static facts about a provider used for registry ordering and pacing
#[derive(Debug, Clone)]
pub struct ProviderDescriptor {
    pub id: ProviderId,
    /// Lower is tried first
    pub priority: u8,
    /// Documented free-tier allowance, requests per minute
    pub rate_limit_per_min: u32,
    pub endpoint: String,
}

#[async_trait]
pub trait GeoProvider: Send + Sync {
    fn descriptor(&self) -> &ProviderDescriptor;

    fn id(&self) -> ProviderId {
        self.descriptor().id
    }

    /// Resolve the caller's public-IP location. One HTTP round trip; retry
    /// and breaker policy live in the orchestrator.
    async fn fetch(&self, timeout: Duration) -> GeoResult<GeolocationResult>;
}

/// Enabled providers, ordered by priority
pub struct ProviderRegistry;

impl ProviderRegistry {
    pub fn build(
        enabled: &[ProviderId],
        transport: Arc<dyn HttpTransport>,
    ) -> Vec<Arc<dyn GeoProvider>> {
        let mut providers: Vec<Arc<dyn GeoProvider>> = enabled
            .iter()
            .filter_map(|id| -> Option<Arc<dyn GeoProvider>> {
                match id {
                    ProviderId::IpApi => Some(Arc::new(IpApiProvider::new(transport.clone()))),
                    ProviderId::IpapiCo => Some(Arc::new(IpapiCoProvider::new(transport.clone()))),
                    ProviderId::IpWhois => Some(Arc::new(IpWhoisProvider::new(transport.clone()))),
                    ProviderId::Manual => None,
                }
            })
            .collect();

        providers.sort_by_key(|p| p.descriptor().priority);
        providers
    }
}

/// Metadata-only confidence for a single response: bare coordinates are
/// `VeryLow`, metadata with a city name is `Medium`, anything else `Low`.
pub(crate) fn initial_confidence(metadata: &GeoMetadata) -> Confidence {
    if metadata.is_empty() {
        Confidence::VeryLow
    } else if metadata.city.is_some() {
        Confidence::Low.upgraded()
    } else {
        Confidence::Low
    }
}

pub(crate) fn map_transport_error(
    provider: ProviderId,
    error: TransportError,
) -> GeoError {
    match error {
        TransportError::Timeout(elapsed) => GeoError::Timeout {
            provider,
            elapsed_ms: elapsed.as_millis() as u64,
        },
        TransportError::Network(message) => GeoError::Network { provider, message },
        TransportError::InvalidUrl(url) => {
            GeoError::Config(format!("invalid endpoint for {}: {}", provider, url))
        }
    }
}

/// Turn a non-2xx response into the right error class. 429 honors the
/// Retry-After header and falls back to a 60 second wait.
pub(crate) fn classify_status(provider: ProviderId, response: &HttpResponse) -> GeoError {
    if response.status == 429 {
        let retry_after = response
            .retry_after_secs
            .map(Duration::from_secs)
            .or(Some(Duration::from_secs(60)));
        GeoError::RateLimited {
            provider,
            retry_after,
        }
    } else {
        GeoError::Http {
            provider,
            status: response.status,
        }
    }
}

pub(crate) fn validate_coordinates(
    provider: ProviderId,
    latitude: f64,
    longitude: f64,
) -> GeoResult<()> {
    if !(-90.0..=90.0).contains(&latitude) || !(-180.0..=180.0).contains(&longitude) {
        return Err(GeoError::CoordinatesInvalid {
            provider,
            latitude,
            longitude,
        });
    }
    Ok(())
}

/// Treat an empty string as absent; several providers send `""` for
/// fields they could not resolve.
pub(crate) fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockTransport;

    #[test]
    fn registry_orders_by_priority_not_config_order() {
        let transport = Arc::new(MockTransport::with_json(200, "{}"));
        let providers = ProviderRegistry::build(
            &[ProviderId::IpWhois, ProviderId::IpApi, ProviderId::IpapiCo],
            transport,
        );

        let ids: Vec<ProviderId> = providers.iter().map(|p| p.id()).collect();
        assert_eq!(
            ids,
            vec![ProviderId::IpApi, ProviderId::IpapiCo, ProviderId::IpWhois]
        );
    }

    #[test]
    fn registry_ignores_the_manual_pseudo_provider() {
        let transport = Arc::new(MockTransport::with_json(200, "{}"));
        let providers = ProviderRegistry::build(&[ProviderId::Manual], transport);
        assert!(providers.is_empty());
    }

    #[test]
    fn initial_confidence_from_metadata_richness() {
        assert_eq!(initial_confidence(&GeoMetadata::default()), Confidence::VeryLow);

        let country_only = GeoMetadata {
            country: Some("Germany".to_string()),
            ..GeoMetadata::default()
        };
        assert_eq!(initial_confidence(&country_only), Confidence::Low);

        let with_city = GeoMetadata {
            city: Some("Berlin".to_string()),
            ..GeoMetadata::default()
        };
        assert_eq!(initial_confidence(&with_city), Confidence::Medium);
    }

    #[test]
    fn rate_limit_classification_prefers_header_hint() {
        let with_header = HttpResponse {
            status: 429,
            body: Vec::new(),
            retry_after_secs: Some(17),
        };
        assert_eq!(
            classify_status(ProviderId::IpApi, &with_header),
            GeoError::RateLimited {
                provider: ProviderId::IpApi,
                retry_after: Some(Duration::from_secs(17)),
            }
        );

        let without_header = HttpResponse {
            status: 429,
            body: Vec::new(),
            retry_after_secs: None,
        };
        assert_eq!(
            classify_status(ProviderId::IpApi, &without_header),
            GeoError::RateLimited {
                provider: ProviderId::IpApi,
                retry_after: Some(Duration::from_secs(60)),
            }
        );

        let server_error = HttpResponse {
            status: 502,
            body: Vec::new(),
            retry_after_secs: None,
        };
        assert_eq!(
            classify_status(ProviderId::IpApi, &server_error),
            GeoError::Http {
                provider: ProviderId::IpApi,
                status: 502,
            }
        );
    }

    #[test]
    fn coordinate_validation_bounds() {
        assert!(validate_coordinates(ProviderId::IpApi, 90.0, 180.0).is_ok());
        assert!(validate_coordinates(ProviderId::IpApi, -90.0, -180.0).is_ok());
        assert!(validate_coordinates(ProviderId::IpApi, 90.5, 0.0).is_err());
        assert!(validate_coordinates(ProviderId::IpApi, 0.0, -180.5).is_err());
    }
}
