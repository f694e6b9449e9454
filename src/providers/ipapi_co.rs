//! ipapi.co client
//!
//! HTTPS, roughly 30 requests per minute on the free tier. Failures arrive
//! as `{"error": true, "reason": "..."}` with a 200 status.

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

const ENDPOINT: &str = "https://ipapi.co/json/";

#[derive(Debug, Deserialize)]
struct IpapiCoBody {
    #[serde(default)]
    error: bool,
    reason: Option<String>,
    latitude: Option<f64>,
    longitude: Option<f64>,
    city: Option<String>,
    region: Option<String>,
    country_name: Option<String>,
    country_code: Option<String>,
    timezone: Option<String>,
    org: Option<String>,
}

pub struct IpapiCoProvider {
    descriptor: ProviderDescriptor,
    transport: Arc<dyn HttpTransport>,
    clock: Arc<dyn Clock>,
}

impl IpapiCoProvider {
    pub fn new(transport: Arc<dyn HttpTransport>) -> Self {
        Self::with_endpoint(transport, ENDPOINT.to_string())
    }

    pub fn with_endpoint(transport: Arc<dyn HttpTransport>, endpoint: String) -> Self {
        Self {
            descriptor: ProviderDescriptor {
                id: ProviderId::IpapiCo,
                priority: 2,
                rate_limit_per_min: 30,
                endpoint,
            },
            transport,
            clock: Arc::new(SystemClock),
        }
    }
}

#[async_trait]
impl GeoProvider for IpapiCoProvider {
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

        let body: IpapiCoBody = serde_json::from_slice(&response.body).map_err(|e| {
            GeoError::Parse {
                provider: id,
                detail: e.to_string(),
            }
        })?;

        if body.error {
            return Err(GeoError::Parse {
                provider: id,
                detail: body
                    .reason
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
            country: non_empty(body.country_name),
            country_code: non_empty(body.country_code),
            timezone: non_empty(body.timezone),
            isp: non_empty(body.org),
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
