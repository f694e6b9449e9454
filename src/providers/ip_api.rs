//! ip-api.com client
//!
//! Free tier is HTTP only and allows roughly 45 requests per minute.
//! Failures come back as a 200 with `"status": "fail"` plus a message, so
//! the envelope has to be inspected even on success statuses.

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

const ENDPOINT: &str =
    "http://ip-api.com/json?fields=status,message,lat,lon,city,regionName,country,countryCode,timezone,isp,proxy";

#[derive(Debug, Deserialize)]
struct IpApiBody {
    status: String,
    message: Option<String>,
    lat: Option<f64>,
    lon: Option<f64>,
    city: Option<String>,
    #[serde(rename = "regionName")]
    region_name: Option<String>,
    country: Option<String>,
    #[serde(rename = "countryCode")]
    country_code: Option<String>,
    timezone: Option<String>,
    isp: Option<String>,
    proxy: Option<bool>,
}

pub struct IpApiProvider {
    descriptor: ProviderDescriptor,
    transport: Arc<dyn HttpTransport>,
    clock: Arc<dyn Clock>,
}

impl IpApiProvider {
    pub fn new(transport: Arc<dyn HttpTransport>) -> Self {
        Self::with_endpoint(transport, ENDPOINT.to_string())
    }

    /// Point the client at a different base URL, for tests against a local
    /// mock server.
    pub fn with_endpoint(transport: Arc<dyn HttpTransport>, endpoint: String) -> Self {
        Self {
            descriptor: ProviderDescriptor {
                id: ProviderId::IpApi,
                priority: 1,
                rate_limit_per_min: 45,
                endpoint,
            },
            transport,
            clock: Arc::new(SystemClock),
        }
    }
}

#[async_trait]
impl GeoProvider for IpApiProvider {
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

        let body: IpApiBody = serde_json::from_slice(&response.body).map_err(|e| {
            GeoError::Parse {
                provider: id,
                detail: e.to_string(),
            }
        })?;

        if body.status != "success" {
            return Err(GeoError::Parse {
                provider: id,
                detail: body
                    .message
                    .unwrap_or_else(|| "provider reported failure".to_string()),
            });
        }

        let (Some(latitude), Some(longitude)) = (body.lat, body.lon) else {
            return Err(GeoError::Parse {
                provider: id,
                detail: "missing coordinates".to_string(),
            });
        };
        validate_coordinates(id, latitude, longitude)?;

        if body.proxy == Some(true) {
            // Informational only; a VPN exit is still a valid location.
            debug!(provider = %id, "proxy or vpn detected");
        }

        let metadata = GeoMetadata {
            city: non_empty(body.city),
            region: non_empty(body.region_name),
            country: non_empty(body.country),
            country_code: non_empty(body.country_code),
            timezone: non_empty(body.timezone),
            isp: non_empty(body.isp),
            is_vpn: body.proxy,
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
