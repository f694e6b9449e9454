//! Agreement-based confidence scoring
//!
//! A primary result is scored against verifier results from other
//! providers: the more independent sources agree within the threshold, the
//! higher the trust tier, which in turn drives cache lifetime and the
//! precision callers may assume.

use crate::types::{Confidence, GeolocationResult};

const EARTH_RADIUS_KM: f64 = 6371.0;

/// Great-circle distance between two coordinates in kilometers
pub fn haversine_km(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let d_lat = (lat2 - lat1).to_radians();
    let d_lon = (lon2 - lon1).to_radians();

    let a = (d_lat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (d_lon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().asin();

    EARTH_RADIUS_KM * c
}

/// Score `primary` against verifiers from other providers.
///
/// A result with no metadata at all is `VeryLow` regardless of agreement.
/// With city metadata: two or more agreeing verifiers give `High`, one gives
/// `Medium`, none gives `Low`. Metadata without a city name caps one tier
/// lower: two or more agreeing verifiers give `Medium`, otherwise `Low`.
pub fn calculate_confidence(
    primary: &GeolocationResult,
    verifiers: &[GeolocationResult],
    agreement_threshold_km: f64,
) -> Confidence {
    if primary.metadata.is_empty() {
        return Confidence::VeryLow;
    }

    let agreeing = verifiers
        .iter()
        .filter(|v| v.provider != primary.provider)
        .filter(|v| {
            haversine_km(primary.latitude, primary.longitude, v.latitude, v.longitude)
                <= agreement_threshold_km
        })
        .count();

    if primary.metadata.city.is_some() {
        match agreeing {
            0 => Confidence::Low,
            1 => Confidence::Medium,
            _ => Confidence::High,
        }
    } else {
        match agreeing {
            0 | 1 => Confidence::Low,
            _ => Confidence::Medium,
        }
    }
}
