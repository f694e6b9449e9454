//! ipwho.is client
//!
//! HTTPS, roughly 60 requests per minute on the free tier. The envelope
//! carries `"success": bool`, nests the timezone under an object, and puts
//! the ISP under `connection`.

use super::{
    classify_status, initial_confidence, map_transport_error, non_empty, validate_coordinates,
    GeoProvider, ProviderDescriptor,
};
use crate::clock::{Clock, SystemClock};
use crate::error::{GeoError, GeoResult};
use crate::transport::HttpTransport;
use crate::types::{GeoMetadata, GeolocationResult, ProviderId};
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

const ENDPOINT: &str = "https://ipwho.is/";

#[derive(Debug, Deserialize)]
struct IpWhoisBody {
    #[serde(default)]
    success: bool,
    message: Option<String>,
    latitude: Option<f64>,
    longitude: Option<f64>,
    city: Option<String>,
    region: Option<String>,
    country: Option<String>,
    country_code: Option<String>,
    timezone: Option<IpWhoisTimezone>,
    connection: Option<IpWhoisConnection>,
}

#[derive(Debug, Deserialize)]
struct IpWhoisTimezone {
    id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct IpWhoisConnection {
    isp: Option<String>,
}

pub struct IpWhoisProvider {
    descriptor: ProviderDescriptor,
    transport: Arc<dyn HttpTransport>,
    clock: Arc<dyn Clock>,
}

impl IpWhoisProvider {
    pub fn new(transport: Arc<dyn HttpTransport>) -> Self {
        Self::with_endpoint(transport, ENDPOINT.to_string())
    }

    pub fn with_endpoint(transport: Arc<dyn HttpTransport>, endpoint: String) -> Self {
        Self {
            descriptor: ProviderDescriptor {
                id: ProviderId::IpWhois,
                priority: 3,
                rate_limit_per_min: 60,
                endpoint,
            },
            transport,
            clock: Arc::new(SystemClock),
        }
    }
}

#[async_trait]
impl GeoProvider for IpWhoisProvider {
    fn descriptor(&self) -> &ProviderDescriptor {
        &self.descriptor
    }

    async fn fetch(&self, timeout: Duration) -> GeoResult<GeolocationResult> {
        let id = self.descriptor.id;
        let started = self.clock.instant();

        let response = self
            .transport
            .get(&self.descriptor.endpoint, timeout)
            .await
            .map_err(|e| map_transport_error(id, e))?;

        if !(200..300).contains(&response.status) {
            return Err(classify_status(id, &response));
        }

        let body: IpWhoisBody = serde_json::from_slice(&response.body).map_err(|e| {
            GeoError::Parse {
                provider: id,
                detail: e.to_string(),
            }
        })?;

        if !body.success {
            return Err(GeoError::Parse {
                provider: id,
                detail: body
                    .message
                    .unwrap_or_else(|| "provider reported failure".to_string()),
            });
        }

        let (Some(latitude), Some(longitude)) = (body.latitude, body.longitude) else {
            return Err(GeoError::Parse {
                provider: id,
                detail: "missing coordinates".to_string(),
            });
        };
        validate_coordinates(id, latitude, longitude)?;

        let metadata = GeoMetadata {
            city: non_empty(body.city),
            region: non_empty(body.region),
            country: non_empty(body.country),
            country_code: non_empty(body.country_code),
            timezone: non_empty(body.timezone.and_then(|t| t.id)),
            isp: non_empty(body.connection.and_then(|c| c.isp)),
            is_vpn: None,
        };
        let confidence = initial_confidence(&metadata);
        let elapsed = self.clock.instant().duration_since(started);

        debug!(
            provider = %id,
            latitude,
            longitude,
            confidence = %confidence,
            elapsed_ms = elapsed.as_millis() as u64,
            "provider fetch succeeded"
        );

        Ok(GeolocationResult {
            latitude,
            longitude,
            provider: id,
            confidence,
            timestamp: self.clock.utc(),
            is_from_cache: false,
            accuracy_radius_km: confidence.accuracy_radius_km(),
            metadata,
            fetch_duration_ms: elapsed.as_millis() as u64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockTransport;
    use crate::types::Confidence;

    const SUCCESS_BODY: &str = r#"{
        "success": true,
        "latitude": 40.4168,
        "longitude": -3.7038,
        "city": "Madrid",
        "region": "Madrid",
        "country": "Spain",
        "country_code": "ES",
        "timezone": {"id": "Europe/Madrid", "abbr": "CET"},
        "connection": {"isp": "Telefonica"}
    }"#;

    #[tokio::test]
    async fn parses_nested_envelope() {
        let transport = Arc::new(MockTransport::with_json(200, SUCCESS_BODY));
        let provider = IpWhoisProvider::new(transport);

        let result = provider.fetch(Duration::from_secs(5)).await.unwrap();
        assert_eq!(result.provider, ProviderId::IpWhois);
        assert_eq!(result.metadata.timezone.as_deref(), Some("Europe/Madrid"));
        assert_eq!(result.metadata.isp.as_deref(), Some("Telefonica"));
        assert_eq!(result.confidence, Confidence::Medium);
    }

    #[tokio::test]
    async fn success_false_is_a_parse_error() {
        let body = r#"{"success": false, "message": "reserved range"}"#;
        let transport = Arc::new(MockTransport::with_json(200, body));
        let provider = IpWhoisProvider::new(transport);

        let err = provider.fetch(Duration::from_secs(5)).await.unwrap_err();
        assert!(matches!(err, GeoError::Parse { detail, .. } if detail == "reserved range"));
    }

    #[tokio::test]
    async fn missing_nested_objects_degrade_gracefully() {
        let body = r#"{"success": true, "latitude": 40.4, "longitude": -3.7, "city": "Madrid"}"#;
        let transport = Arc::new(MockTransport::with_json(200, body));
        let provider = IpWhoisProvider::new(transport);

        let result = provider.fetch(Duration::from_secs(5)).await.unwrap();
        assert_eq!(result.metadata.timezone, None);
        assert_eq!(result.metadata.isp, None);
        assert_eq!(result.confidence, Confidence::Medium);
    }
}
