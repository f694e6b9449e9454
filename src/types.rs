//! Canonical types shared across the geolocation engine

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Identity of a geolocation source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderId {
    /// ip-api.com
    IpApi,
    /// ipapi.co
    IpapiCo,
    /// ipwho.is
    IpWhois,
    /// User-supplied manual override
    Manual,
}

impl fmt::Display for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProviderId::IpApi => "ip-api",
            ProviderId::IpapiCo => "ipapi-co",
            ProviderId::IpWhois => "ipwhois",
            ProviderId::Manual => "manual",
        };
        write!(f, "{}", name)
    }
}

/// Trust tier assigned to a resolved location
///
/// The ordering is total: `VeryLow < Low < Medium < High`. Each level fixes
/// the cache lifetime, the accuracy radius callers should assume, and the
/// search radius they should suggest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    VeryLow,
    Low,
    Medium,
    High,
}

impl Confidence {
    /// How long a result at this confidence may be served from cache
    pub fn cache_ttl(&self) -> Duration {
        match self {
            Confidence::VeryLow => Duration::from_secs(5 * 60),
            Confidence::Low => Duration::from_secs(30 * 60),
            Confidence::Medium => Duration::from_secs(60 * 60),
            Confidence::High => Duration::from_secs(2 * 60 * 60),
        }
    }

    /// Radius within which the true location is assumed to lie
    pub fn accuracy_radius_km(&self) -> f64 {
        match self {
            Confidence::VeryLow => 100.0,
            Confidence::Low => 50.0,
            Confidence::Medium => 25.0,
            Confidence::High => 5.0,
        }
    }

    /// Search radius a caller should suggest for nearby queries
    pub fn suggested_search_radius_km(&self) -> f64 {
        match self {
            Confidence::VeryLow => 100.0,
            Confidence::Low => 50.0,
            Confidence::Medium => 25.0,
            Confidence::High => 10.0,
        }
    }

    /// One tier up, saturating at `High`
    pub fn upgraded(&self) -> Confidence {
        match self {
            Confidence::VeryLow => Confidence::Low,
            Confidence::Low => Confidence::Medium,
            Confidence::Medium => Confidence::High,
            Confidence::High => Confidence::High,
        }
    }
}

impl fmt::Display for Confidence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Confidence::VeryLow => "very_low",
            Confidence::Low => "low",
            Confidence::Medium => "medium",
            Confidence::High => "high",
        };
        write!(f, "{}", name)
    }
}

/// Optional descriptive fields a provider may return alongside coordinates
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GeoMetadata {
    pub city: Option<String>,
    pub region: Option<String>,
    pub country: Option<String>,
    pub country_code: Option<String>,
    pub timezone: Option<String>,
    pub isp: Option<String>,
    pub is_vpn: Option<bool>,
}

impl GeoMetadata {
    /// True when the provider returned bare coordinates with no context
    pub fn is_empty(&self) -> bool {
        self.city.is_none()
            && self.region.is_none()
            && self.country.is_none()
            && self.country_code.is_none()
            && self.timezone.is_none()
            && self.isp.is_none()
            && self.is_vpn.is_none()
    }
}

/// Canonical resolved location
///
/// Results are immutable. State transitions (cache reads, confidence
/// rescoring) produce derived copies rather than mutating in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeolocationResult {
    pub latitude: f64,
    pub longitude: f64,
    pub provider: ProviderId,
    pub confidence: Confidence,
    pub timestamp: DateTime<Utc>,
    pub is_from_cache: bool,
    pub accuracy_radius_km: f64,
    pub metadata: GeoMetadata,
    pub fetch_duration_ms: u64,
}

impl GeolocationResult {
    /// Derived copy flagged as served from cache
    pub fn as_cached(&self) -> GeolocationResult {
        GeolocationResult {
            is_from_cache: true,
            ..self.clone()
        }
    }

    /// Derived copy rescored to the given confidence tier
    pub fn with_confidence(&self, confidence: Confidence) -> GeolocationResult {
        GeolocationResult {
            confidence,
            accuracy_radius_km: confidence.accuracy_radius_km(),
            ..self.clone()
        }
    }
}

/// User-supplied manual location that supersedes automatic resolution
/// for a bounded, expiring window. Persisted as JSON in the durable store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationOverride {
    pub latitude: f64,
    pub longitude: f64,
    pub city: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub source: String,
}

impl LocationOverride {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Convert to a canonical result: fixed manual provider tag, medium
    /// confidence, 25 km accuracy, zero fetch duration.
    pub fn to_result(&self) -> GeolocationResult {
        GeolocationResult {
            latitude: self.latitude,
            longitude: self.longitude,
            provider: ProviderId::Manual,
            confidence: Confidence::Medium,
            timestamp: self.created_at,
            is_from_cache: false,
            accuracy_radius_km: 25.0,
            metadata: GeoMetadata {
                city: self.city.clone(),
                ..GeoMetadata::default()
            },
            fetch_duration_ms: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const LEVELS: [Confidence; 4] = [
        Confidence::VeryLow,
        Confidence::Low,
        Confidence::Medium,
        Confidence::High,
    ];

    #[test]
    fn confidence_ordering_is_total() {
        assert!(Confidence::VeryLow < Confidence::Low);
        assert!(Confidence::Low < Confidence::Medium);
        assert!(Confidence::Medium < Confidence::High);
    }

    #[test]
    fn cache_ttl_is_monotone_in_confidence() {
        for pair in LEVELS.windows(2) {
            assert!(pair[0].cache_ttl() <= pair[1].cache_ttl());
        }
    }

    #[test]
    fn accuracy_radius_shrinks_as_confidence_grows() {
        for pair in LEVELS.windows(2) {
            assert!(pair[0].accuracy_radius_km() >= pair[1].accuracy_radius_km());
            assert!(pair[0].suggested_search_radius_km() >= pair[1].suggested_search_radius_km());
        }
    }

    #[test]
    fn upgraded_saturates_at_high() {
        assert_eq!(Confidence::VeryLow.upgraded(), Confidence::Low);
        assert_eq!(Confidence::Medium.upgraded(), Confidence::High);
        assert_eq!(Confidence::High.upgraded(), Confidence::High);
    }

    #[test]
    fn as_cached_preserves_everything_but_the_flag() {
        let result = GeolocationResult {
            latitude: 52.52,
            longitude: 13.405,
            provider: ProviderId::IpApi,
            confidence: Confidence::Medium,
            timestamp: Utc::now(),
            is_from_cache: false,
            accuracy_radius_km: 25.0,
            metadata: GeoMetadata::default(),
            fetch_duration_ms: 120,
        };

        let cached = result.as_cached();
        assert!(cached.is_from_cache);
        assert_eq!(cached.latitude, result.latitude);
        assert_eq!(cached.provider, result.provider);
        assert_eq!(cached.fetch_duration_ms, result.fetch_duration_ms);
        // Original untouched
        assert!(!result.is_from_cache);
    }

    #[test]
    fn override_conversion_uses_fixed_manual_shape() {
        let created = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        let ov = LocationOverride {
            latitude: 40.4168,
            longitude: -3.7038,
            city: Some("Madrid".to_string()),
            created_at: created,
            expires_at: created + chrono::Duration::hours(24),
            source: "settings_screen".to_string(),
        };

        let result = ov.to_result();
        assert_eq!(result.provider, ProviderId::Manual);
        assert_eq!(result.confidence, Confidence::Medium);
        assert_eq!(result.accuracy_radius_km, 25.0);
        assert_eq!(result.fetch_duration_ms, 0);
        assert_eq!(result.metadata.city.as_deref(), Some("Madrid"));
    }

    #[test]
    fn override_expiry_boundary() {
        let created = Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap();
        let ov = LocationOverride {
            latitude: 0.0,
            longitude: 0.0,
            city: None,
            created_at: created,
            expires_at: created + chrono::Duration::hours(48),
            source: "test".to_string(),
        };

        assert!(!ov.is_expired_at(created + chrono::Duration::hours(47)));
        // Exactly at expiry counts as expired
        assert!(ov.is_expired_at(created + chrono::Duration::hours(48)));
        assert!(ov.is_expired_at(created + chrono::Duration::hours(72)));
    }

    #[test]
    fn metadata_emptiness() {
        assert!(GeoMetadata::default().is_empty());
        let with_city = GeoMetadata {
            city: Some("Berlin".to_string()),
            ..GeoMetadata::default()
        };
        assert!(!with_city.is_empty());
    }
}
